//! Scripted multi-process run on the loopback cluster: populate, drift entities across cell
//! boundaries, optionally kill a process, then shut every process down.

use crate::command::{
    CommandReceiver, CommandSubmit, ControlCommand, create_command_bus, drain_pending_commands,
    make_command_submit,
};
use anyhow::{Context, Result, bail};
use cellmesh_core::{
    CellAppConfig, CellError, Cluster, DbId, Direction, EntityId, NewEntity, ProcessAddr, Rect,
    ShutdownReport, SpaceId, TickReport, Vec3,
};
use cellmesh_storage::StoragePipeline;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SCENARIO_SPACE: SpaceId = SpaceId(1);
const CELL_SIZE: f32 = 100.0;
const MAX_SPEED: f32 = 6.0;
const COMMAND_CAPACITY: usize = 64;
/// Ticks to wait for database completions once shutdown has started.
const SHUTDOWN_TICK_LIMIT: usize = 2_000;

#[derive(Debug, Clone)]
pub struct ScenarioConfig {
    pub processes: u32,
    pub entities: u32,
    pub ticks: u64,
    pub seed: u64,
    pub db: Option<PathBuf>,
    pub kill_at: Option<u64>,
    pub cell: CellAppConfig,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            processes: 3,
            entities: 60,
            ticks: 200,
            seed: 0x5EED,
            db: None,
            kill_at: None,
            cell: CellAppConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioSummary {
    pub ticks: u64,
    pub processes_alive: usize,
    pub killed: Vec<u32>,
    pub entities_started: u32,
    /// Authoritative entities when the drift phase ended, before shutdown.
    pub entities_alive: usize,
    pub offloads_started: usize,
    pub migrations_failed: usize,
    pub repairs: usize,
    pub backups_sent: usize,
    pub archived: usize,
    pub exclusivity_violations: usize,
    pub shutdowns: BTreeMap<u32, ShutdownSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub peak_outstanding: usize,
}

impl From<ShutdownReport> for ShutdownSummary {
    fn from(report: ShutdownReport) -> Self {
        Self {
            total: report.total,
            succeeded: report.succeeded,
            failed: report.failed,
            skipped: report.skipped,
            peak_outstanding: report.peak_outstanding,
        }
    }
}

pub struct Scenario {
    config: ScenarioConfig,
    cluster: Cluster,
    velocities: BTreeMap<EntityId, Vec3>,
    rng: SmallRng,
    pipeline: Option<StoragePipeline>,
    submit: CommandSubmit,
    commands: CommandReceiver,
    summary: ScenarioSummary,
    stopping: bool,
}

impl Scenario {
    /// Build the cluster: one vertical strip per process, entities scattered with random
    /// drift.
    pub fn new(config: ScenarioConfig) -> Result<Self> {
        if config.processes == 0 {
            bail!("a scenario needs at least one process");
        }
        let cell = CellAppConfig {
            rng_seed: config.cell.rng_seed.or(Some(config.seed)),
            ..config.cell.clone()
        };
        let pipeline = match &config.db {
            Some(path) => Some(
                StoragePipeline::open(path)
                    .with_context(|| format!("failed to open database {}", path.display()))?,
            ),
            None => None,
        };
        let mut cluster = Cluster::new(cell).context("invalid cell configuration")?;
        for n in 0..config.processes {
            let addr = ProcessAddr(n + 1);
            let handles = pipeline.as_ref().map(|p| (p.handle(), p.handle()));
            cluster
                .add_process_with(addr, move |app| match handles {
                    Some((secondary, database)) => app
                        .with_secondary_store(Box::new(secondary))
                        .with_database(Box::new(database)),
                    None => app,
                })
                .with_context(|| format!("failed to add process {addr}"))?;
            let min_x = n as f32 * CELL_SIZE;
            cluster.set_cell(
                SCENARIO_SPACE,
                addr,
                Rect::new(min_x, 0.0, min_x + CELL_SIZE, CELL_SIZE),
            );
        }

        let (tx, commands) = create_command_bus(COMMAND_CAPACITY);
        let mut scenario = Self {
            rng: SmallRng::seed_from_u64(config.seed),
            summary: ScenarioSummary {
                entities_started: config.entities,
                ..ScenarioSummary::default()
            },
            config,
            cluster,
            velocities: BTreeMap::new(),
            pipeline,
            submit: make_command_submit(tx),
            commands,
            stopping: false,
        };
        scenario.populate()?;
        Ok(scenario)
    }

    fn width(&self) -> f32 {
        self.config.processes as f32 * CELL_SIZE
    }

    fn populate(&mut self) -> Result<()> {
        let width = self.width();
        for n in 0..self.config.entities {
            let id = EntityId(n + 1);
            let position = Vec3::new(
                self.rng.random_range(1.0..width - 1.0),
                0.0,
                self.rng.random_range(1.0..CELL_SIZE - 1.0),
            );
            let velocity = Vec3::new(
                self.rng.random_range(-MAX_SPEED..MAX_SPEED),
                0.0,
                self.rng.random_range(-MAX_SPEED..MAX_SPEED),
            );
            let owner = self
                .cluster
                .space(SCENARIO_SPACE)
                .and_then(|map| map.owner_at(position.x, position.z))
                .context("scenario space has a hole")?;
            let mut template = NewEntity::new(id, SCENARIO_SPACE, position)
                .moving(velocity, MAX_SPEED);
            if self.pipeline.is_some() {
                template = template.persisted_as(DbId(u64::from(id.0)));
            }
            self.cluster
                .app_mut(owner)
                .context("owner process missing")?
                .create_entity(template)
                .with_context(|| format!("failed to create {id}"))?;
            self.velocities.insert(id, velocity);
        }
        info!(entities = self.velocities.len(), processes = self.config.processes, "scenario populated");
        Ok(())
    }

    /// Queue a control command for the next tick.
    pub fn submit(&self, command: ControlCommand) -> bool {
        (self.submit)(command)
    }

    /// Handle for callers that want to queue commands from another thread.
    #[must_use]
    pub fn command_submit(&self) -> CommandSubmit {
        self.submit.clone()
    }

    #[must_use]
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Drive the whole run and return its summary.
    pub fn run(mut self) -> Result<ScenarioSummary> {
        for tick in 0..self.config.ticks {
            if self.config.kill_at == Some(tick) {
                let victim = self.kill_candidate();
                if let Some(victim) = victim {
                    self.submit(ControlCommand::KillPeer(victim));
                }
            }
            self.step()?;
        }
        self.summary.entities_alive = self.cluster.authoritative_count();
        self.submit(ControlCommand::Shutdown);
        let mut waited = 0;
        while !self.all_shut_down() {
            if waited >= SHUTDOWN_TICK_LIMIT {
                bail!("controlled shutdown did not finish after {waited} ticks");
            }
            self.step()?;
            waited += 1;
            if self.pipeline.is_some() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        self.finish()
    }

    fn kill_candidate(&self) -> Option<ProcessAddr> {
        let addrs = self.cluster.addrs();
        if addrs.len() < 2 {
            warn!("only one process left; kill request ignored");
            return None;
        }
        addrs.get(addrs.len() / 2).copied()
    }

    /// One cluster tick: apply queued commands, drift entities, tick every process.
    pub fn step(&mut self) -> Result<()> {
        for command in drain_pending_commands(&self.commands) {
            self.apply(command)?;
        }
        if !self.stopping {
            self.drift();
        }
        let reports = self.cluster.tick();
        for (addr, report) in reports {
            self.record(addr, &report);
        }
        self.summary.exclusivity_violations += self.cluster.exclusivity_violations().len();
        self.summary.ticks += 1;
        Ok(())
    }

    fn apply(&mut self, command: ControlCommand) -> Result<()> {
        debug!(?command, "applying control command");
        match command {
            ControlCommand::KillPeer(addr) => match self.cluster.kill(addr) {
                Some(death) => {
                    info!(peer = %addr, destinations = ?death.destinations, "killed process");
                    self.summary.killed.push(addr.0);
                }
                None => warn!(peer = %addr, "kill requested for unknown process"),
            },
            ControlCommand::Teleport {
                entity,
                space,
                position,
            } => {
                let Some(owner) = self.cluster.authoritative_owners(entity).first().copied() else {
                    warn!(entity = %entity, "teleport requested for unknown entity");
                    return Ok(());
                };
                if let Some(app) = self.cluster.app_mut(owner)
                    && let Err(err) = app.teleport(entity, space, position)
                {
                    warn!(entity = %entity, error = %err, "teleport refused");
                }
            }
            ControlCommand::Shutdown => {
                self.stopping = true;
                for addr in self.cluster.addrs() {
                    let Some(app) = self.cluster.app_mut(addr) else {
                        continue;
                    };
                    match app.start_controlled_shutdown(|_| {}) {
                        Ok(()) | Err(CellError::ShutdownInProgress) => {}
                        Err(err) => {
                            return Err(err).with_context(|| format!("{addr} refused to shut down"));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Move every settled entity one step, bouncing off the outer walls.
    fn drift(&mut self) {
        let width = self.width();
        for (id, velocity) in self.velocities.iter_mut() {
            let Some(owner) = self.cluster.authoritative_owners(*id).first().copied() else {
                continue;
            };
            let Some(app) = self.cluster.app_mut(owner) else {
                continue;
            };
            let Some(position) = app.find(*id).map(|entity| entity.position) else {
                continue;
            };
            let mut next = position + *velocity;
            if !(1.0..width - 1.0).contains(&next.x) {
                velocity.x = -velocity.x;
                next.x = position.x + velocity.x;
            }
            if !(1.0..CELL_SIZE - 1.0).contains(&next.z) {
                velocity.z = -velocity.z;
                next.z = position.z + velocity.z;
            }
            let facing = Direction::new(velocity.x.atan2(velocity.z), 0.0);
            match app.set_position(*id, next, facing) {
                Ok(()) => {}
                Err(CellError::InvalidState { .. }) => {}
                Err(err) => debug!(entity = %id, error = %err, "entity did not move"),
            }
        }
    }

    fn record(&mut self, addr: ProcessAddr, report: &TickReport) {
        self.summary.offloads_started += report.offloads_started;
        self.summary.migrations_failed += report.migrations_failed;
        self.summary.repairs += report.repairs;
        self.summary.backups_sent += report.backups_sent;
        self.summary.archived += report.archived;
        if let Some(shutdown) = report.shutdown {
            info!(process = %addr, written = shutdown.succeeded, failed = shutdown.failed, "process shut down");
            self.summary.shutdowns.insert(addr.0, shutdown.into());
        }
    }

    fn all_shut_down(&self) -> bool {
        self.cluster.apps().all(|app| app.is_shut_down())
    }

    fn finish(mut self) -> Result<ScenarioSummary> {
        self.summary.processes_alive = self.cluster.apps().count();
        drop(self.cluster);
        if let Some(pipeline) = self.pipeline.take() {
            let store = pipeline.close().context("storage worker did not stop cleanly")?;
            info!(rows = store.entity_count().unwrap_or_default(), "entity table closed");
        }
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(processes: u32, ticks: u64) -> ScenarioConfig {
        ScenarioConfig {
            processes,
            entities: 24,
            ticks,
            seed: 42,
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn drifting_entities_cross_cells_without_losing_anyone() {
        let summary = Scenario::new(small(3, 120))
            .and_then(Scenario::run)
            .expect("scenario");
        assert_eq!(summary.entities_alive, 24);
        assert_eq!(summary.exclusivity_violations, 0);
        assert!(summary.offloads_started > 0);
        assert_eq!(summary.shutdowns.len(), 3);
        assert!(summary.shutdowns.values().all(|s| s.total == 0));
    }

    #[test]
    fn teleport_commands_are_applied_on_the_next_tick() {
        let mut scenario = Scenario::new(small(2, 0)).expect("scenario");
        let id = EntityId(1);
        scenario.step().expect("step");
        assert!(scenario.submit(ControlCommand::Teleport {
            entity: id,
            space: SCENARIO_SPACE,
            position: Vec3::new(150.0, 0.0, 50.0),
        }));
        scenario.step().expect("step");
        assert_eq!(scenario.cluster().authoritative_owners(id), vec![ProcessAddr(2)]);
    }

    #[test]
    fn zero_processes_is_rejected() {
        assert!(Scenario::new(small(0, 1)).is_err());
    }
}
