use cellmesh_app::{ControlCommand, SCENARIO_SPACE, Scenario, ScenarioConfig};
use cellmesh_core::{ProcessAddr, Vec3};
use cellmesh_storage::EntityStore;
use std::process::Command;

#[test]
fn killing_a_process_mid_run_keeps_every_backed_up_entity() {
    let config = ScenarioConfig {
        processes: 3,
        entities: 30,
        ticks: 80,
        seed: 9,
        kill_at: Some(40),
        ..ScenarioConfig::default()
    };
    let summary = Scenario::new(config).and_then(Scenario::run).expect("scenario");
    assert_eq!(summary.killed, vec![2]);
    assert_eq!(summary.processes_alive, 2);
    assert_eq!(summary.entities_alive, 30);
    assert_eq!(summary.exclusivity_violations, 0);
    assert!(summary.repairs > 0);
}

#[test]
fn persisted_run_writes_every_entity_on_shutdown() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("scenario.duckdb");
    let config = ScenarioConfig {
        processes: 2,
        entities: 12,
        ticks: 30,
        seed: 3,
        db: Some(path.clone()),
        ..ScenarioConfig::default()
    };
    let summary = Scenario::new(config)?.run()?;
    let written: usize = summary.shutdowns.values().map(|s| s.succeeded).sum();
    assert_eq!(written, 12);
    assert!(summary.shutdowns.values().all(|s| s.failed == 0));

    let store = EntityStore::open(&path)?;
    assert_eq!(store.entity_count()?, 12);
    Ok(())
}

#[test]
fn queued_commands_survive_until_the_next_step() {
    let config = ScenarioConfig {
        processes: 2,
        entities: 4,
        ticks: 0,
        seed: 1,
        ..ScenarioConfig::default()
    };
    let mut scenario = Scenario::new(config).expect("scenario");
    let submit = scenario.command_submit();
    let remote = std::thread::spawn(move || {
        submit(ControlCommand::Teleport {
            entity: cellmesh_core::EntityId(3),
            space: SCENARIO_SPACE,
            position: Vec3::new(20.0, 0.0, 20.0),
        })
    });
    assert!(remote.join().expect("submitter"));
    scenario.step().expect("step");
    assert_eq!(
        scenario
            .cluster()
            .authoritative_owners(cellmesh_core::EntityId(3)),
        vec![ProcessAddr(1)]
    );
}

#[test]
fn binary_prints_a_json_summary() {
    let output = Command::new(env!("CARGO_BIN_EXE_cellmesh"))
        .args(["run", "--processes", "2", "--entities", "6", "--ticks", "15", "--seed", "4"])
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run cellmesh binary");
    assert!(output.status.success(), "cellmesh run failed");
    let summary: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("summary is JSON");
    assert_eq!(summary["entities_started"], 6);
    assert_eq!(summary["processes_alive"], 2);
}
