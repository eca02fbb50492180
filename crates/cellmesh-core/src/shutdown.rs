//! Controlled shutdown: write every persisted real to the database with a ceiling on
//! outstanding writes, then fire the completion exactly once.

use crate::EntityId;
use crate::archive::WriteTicket;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entities that were gone or no longer real by the time their turn came.
    pub skipped: usize,
    pub peak_outstanding: usize,
}

pub type ShutdownCallback = Box<dyn FnOnce(&ShutdownReport) + Send>;

pub struct ControlledShutdown {
    queue: VecDeque<EntityId>,
    outstanding: BTreeMap<WriteTicket, EntityId>,
    ceiling: usize,
    report: ShutdownReport,
    on_complete: Option<ShutdownCallback>,
}

impl std::fmt::Debug for ControlledShutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlledShutdown")
            .field("queued", &self.queue.len())
            .field("outstanding", &self.outstanding.len())
            .field("ceiling", &self.ceiling)
            .field("report", &self.report)
            .finish()
    }
}

impl ControlledShutdown {
    #[must_use]
    pub fn new(entities: Vec<EntityId>, ceiling: usize, on_complete: ShutdownCallback) -> Self {
        let report = ShutdownReport {
            total: entities.len(),
            ..ShutdownReport::default()
        };
        Self {
            queue: entities.into(),
            outstanding: BTreeMap::new(),
            ceiling: ceiling.max(1),
            report,
            on_complete: Some(on_complete),
        }
    }

    /// Next entity to write, if the ceiling allows another outstanding write.
    pub fn next_to_start(&mut self) -> Option<EntityId> {
        if self.outstanding.len() >= self.ceiling {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn started(&mut self, ticket: WriteTicket, entity: EntityId) {
        self.outstanding.insert(ticket, entity);
        self.report.peak_outstanding = self.report.peak_outstanding.max(self.outstanding.len());
    }

    /// A write could not even be queued; counted as failed.
    pub fn failed_to_start(&mut self) {
        self.report.failed += 1;
    }

    pub fn skipped(&mut self) {
        self.report.skipped += 1;
    }

    /// Settle an outstanding write. Returns false for tickets this shutdown did not issue.
    pub fn complete(&mut self, ticket: WriteTicket, ok: bool) -> bool {
        if self.outstanding.remove(&ticket).is_none() {
            return false;
        }
        if ok {
            self.report.succeeded += 1;
        } else {
            self.report.failed += 1;
        }
        true
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.queue.is_empty() && self.outstanding.is_empty()
    }

    #[must_use]
    pub fn report(&self) -> ShutdownReport {
        self.report
    }

    /// Fire the completion if every write has settled. Returns the report the first time.
    pub fn try_finish(&mut self) -> Option<ShutdownReport> {
        if !self.is_finished() {
            return None;
        }
        let callback = self.on_complete.take()?;
        callback(&self.report);
        Some(self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ceiling_bounds_outstanding_writes_and_completion_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let ids: Vec<EntityId> = (1..=7).map(EntityId).collect();
        let mut shutdown = ControlledShutdown::new(
            ids,
            5,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let mut ticket = 0;
        while let Some(id) = shutdown.next_to_start() {
            ticket += 1;
            shutdown.started(WriteTicket(ticket), id);
        }
        assert_eq!(shutdown.outstanding(), 5);
        assert_eq!(shutdown.queued(), 2);
        assert!(shutdown.complete(WriteTicket(1), false));
        assert!(!shutdown.complete(WriteTicket(1), true));
        while let Some(id) = shutdown.next_to_start() {
            ticket += 1;
            shutdown.started(WriteTicket(ticket), id);
        }
        assert_eq!(shutdown.outstanding(), 5);
        assert!(shutdown.try_finish().is_none());
        for t in 2..=7 {
            assert!(shutdown.complete(WriteTicket(t), true));
            while let Some(id) = shutdown.next_to_start() {
                ticket += 1;
                shutdown.started(WriteTicket(ticket), id);
            }
        }
        let report = shutdown.try_finish().expect("finished");
        assert_eq!(report.succeeded, 6);
        assert_eq!(report.failed, 1);
        assert_eq!(report.peak_outstanding, 5);
        assert!(shutdown.try_finish().is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
