use cellmesh_core::{
    ActiveBuffer, BackupSnapshot, CellAppConfig, Cluster, DbId, EntityId, NewEntity, ProcessAddr,
    Rect, ShutdownReport, SpaceId, Vec3,
};
use cellmesh_storage::{EntityStore, StoragePipeline};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SPACE: SpaceId = SpaceId(1);
const APP: ProcessAddr = ProcessAddr(1);

fn persisted_cluster(pipeline: &StoragePipeline, config: CellAppConfig) -> Cluster {
    let mut cluster = Cluster::new(config).expect("config");
    let secondary = pipeline.handle();
    let database = pipeline.handle();
    cluster
        .add_process_with(APP, move |app| {
            app.with_secondary_store(Box::new(secondary))
                .with_database(Box::new(database))
        })
        .expect("process");
    cluster.set_cell(SPACE, APP, Rect::new(0.0, 0.0, 100.0, 100.0));
    let app = cluster.app_mut(APP).expect("app");
    for n in 1..=3u32 {
        app.create_entity(
            NewEntity::new(EntityId(n), SPACE, Vec3::new(10.0 * n as f32, 0.0, 10.0))
                .persisted_as(DbId(u64::from(n) * 100))
                .with_property("level", serde_json::json!(n)),
        )
        .expect("created");
    }
    // Never persisted; archiving skips it.
    app.create_entity(NewEntity::new(EntityId(9), SPACE, Vec3::new(50.0, 0.0, 50.0)))
        .expect("created");
    cluster
}

#[test]
fn archiving_fills_both_tables_and_the_central_rows() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let pipeline = StoragePipeline::open(dir.path().join("archive.duckdb"))?;
    let config = CellAppConfig {
        archive_period_ticks: 3,
        secondary_flip_period_ticks: 5,
        rng_seed: Some(11),
        ..CellAppConfig::default()
    };
    let mut cluster = persisted_cluster(&pipeline, config);
    cluster.run(7);
    drop(cluster);

    let store = pipeline.close()?;
    assert_eq!(store.entity_count()?, 3);
    assert_eq!(store.active_buffer(), ActiveBuffer::B);
    assert!(store.secondary_count(ActiveBuffer::A)? >= 3);
    assert!(store.secondary_count(ActiveBuffer::B)? >= 1);

    let stored = store.load_entity(DbId(200))?.expect("central row");
    assert_eq!(stored.entity, 2);
    let snapshot = BackupSnapshot::decode(&stored.blob)?;
    assert_eq!(snapshot.properties["level"], serde_json::json!(2));
    assert!(store.latest_secondary(DbId(300))?.is_some());
    assert!(store.load_entity(DbId::NONE)?.is_none());
    Ok(())
}

#[test]
fn controlled_shutdown_writes_every_persisted_real() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("shutdown.duckdb");
    let pipeline = StoragePipeline::open(&path)?;
    let config = CellAppConfig {
        max_outstanding_shutdown_writes: 2,
        rng_seed: Some(5),
        ..CellAppConfig::default()
    };
    let mut cluster = persisted_cluster(&pipeline, config);
    let finished: Arc<Mutex<Option<ShutdownReport>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&finished);
    cluster
        .app_mut(APP)
        .expect("app")
        .start_controlled_shutdown(move |report| {
            *slot.lock().expect("slot") = Some(*report);
        })?;

    for _ in 0..200 {
        cluster.tick();
        if cluster.app(APP).expect("app").is_shut_down() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(cluster.app(APP).expect("app").is_shut_down());
    let report = (*finished.lock().expect("slot")).expect("callback fired");
    assert_eq!(report.total, 3);
    assert_eq!(report.succeeded, 3);
    assert!(report.peak_outstanding <= 2);
    drop(cluster);

    drop(pipeline.close()?);
    let reopened = EntityStore::open(&path)?;
    assert_eq!(reopened.entity_count()?, 3);
    Ok(())
}
