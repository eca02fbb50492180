//! Durable archiving: the secondary store and entity database seams, the completion queue that
//! marshals their results back onto the tick thread, and the shuffled round-robin scheduler.

use crate::error::CellError;
use crate::{DbId, EntityId, EntityTypeId, Tick};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;

/// Which half of the double-buffered secondary tables is receiving writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActiveBuffer {
    #[default]
    A,
    B,
}

impl ActiveBuffer {
    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::A => "entities_a",
            Self::B => "entities_b",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "a" => Some(Self::A),
            "b" => Some(Self::B),
            _ => None,
        }
    }
}

/// Append-only archive record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryRow {
    pub db_id: DbId,
    pub type_id: EntityTypeId,
    pub tick: Tick,
    pub blob: Vec<u8>,
}

/// Local write-ahead store. Calls only enqueue; the implementation owns its connection.
pub trait SecondaryStore: Send {
    fn write_entity(&mut self, row: SecondaryRow) -> Result<(), CellError>;

    /// Commit the batch written since the last commit, then flip buffers when asked.
    fn commit(&mut self, should_flip: bool) -> Result<(), CellError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriteTicket(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritePurpose {
    Archive,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub ticket: WriteTicket,
    pub entity: EntityId,
    pub db_id: DbId,
    pub type_id: EntityTypeId,
    pub purpose: WritePurpose,
    pub blob: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteCompletion {
    pub ticket: WriteTicket,
    pub entity: EntityId,
    pub purpose: WritePurpose,
    pub result: Result<(), CellError>,
}

impl WriteCompletion {
    #[must_use]
    pub fn for_request(request: &WriteRequest, result: Result<(), CellError>) -> Self {
        Self {
            ticket: request.ticket,
            entity: request.entity,
            purpose: request.purpose,
            result,
        }
    }
}

/// Central entity database. `write_entity` returns once the request is queued; the outcome
/// arrives later through `completions`.
pub trait EntityDatabase: Send {
    fn write_entity(
        &mut self,
        request: WriteRequest,
        completions: CompletionSender,
    ) -> Result<(), CellError>;
}

/// Sending half handed to background workers.
#[derive(Debug, Clone)]
pub struct CompletionSender(mpsc::Sender<WriteCompletion>);

impl CompletionSender {
    /// Returns false if the owning process has gone away.
    pub fn complete(&self, completion: WriteCompletion) -> bool {
        self.0.send(completion).is_ok()
    }
}

/// Completions posted by workers, drained at the top of each tick.
#[derive(Debug)]
pub struct CompletionQueue {
    tx: mpsc::Sender<WriteCompletion>,
    rx: mpsc::Receiver<WriteCompletion>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }
}

impl CompletionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sender(&self) -> CompletionSender {
        CompletionSender(self.tx.clone())
    }

    pub fn drain(&self) -> Vec<WriteCompletion> {
        self.rx.try_iter().collect()
    }
}

/// Shuffled round-robin over the reals alive at the start of each archive period, spread
/// evenly across the period's ticks.
#[derive(Debug)]
pub struct Archiver {
    period: u64,
    order: Vec<EntityId>,
    cursor: usize,
    cycle_start: Tick,
    last_flip: Tick,
    rng: SmallRng,
}

impl Archiver {
    #[must_use]
    pub fn new(period: u64, rng: SmallRng, now: Tick) -> Self {
        Self {
            period: period.max(1),
            order: Vec::new(),
            cursor: 0,
            cycle_start: now,
            last_flip: now,
            rng,
        }
    }

    /// Entities to archive on `now`. `reals` is consulted only when a new cycle starts.
    pub fn select(&mut self, now: Tick, reals: impl FnOnce() -> Vec<EntityId>) -> Vec<EntityId> {
        if self.cursor >= self.order.len() && now.since(self.cycle_start) >= self.period
            || self.order.is_empty()
        {
            self.order = reals();
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            self.cycle_start = now;
        }
        let elapsed = now.since(self.cycle_start) + 1;
        let due = (self.order.len() as u64)
            .saturating_mul(elapsed.min(self.period))
            .div_ceil(self.period) as usize;
        let end = due.min(self.order.len());
        if end <= self.cursor {
            return Vec::new();
        }
        let batch = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    /// True when the secondary store's buffers should flip on this commit.
    pub fn should_flip(&mut self, now: Tick, flip_period: u64) -> bool {
        if now.since(self.last_flip) >= flip_period {
            self.last_flip = now;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    #[test]
    fn buffer_flips_between_tables() {
        assert_eq!(ActiveBuffer::A.flipped(), ActiveBuffer::B);
        assert_eq!(ActiveBuffer::B.flipped().table_name(), "entities_a");
        assert_eq!(ActiveBuffer::parse(ActiveBuffer::B.as_str()), Some(ActiveBuffer::B));
    }

    #[test]
    fn every_real_is_archived_once_per_period() {
        let mut archiver = Archiver::new(4, SmallRng::seed_from_u64(3), Tick(0));
        let reals: Vec<EntityId> = (0..10).map(EntityId).collect();
        let mut seen = Vec::new();
        for tick in 0..4 {
            let batch = archiver.select(Tick(tick), || reals.clone());
            assert!(batch.len() <= 3);
            seen.extend(batch);
        }
        assert_eq!(seen.len(), 10);
        let unique: BTreeSet<EntityId> = seen.iter().copied().collect();
        assert_eq!(unique.len(), 10);
        let next = archiver.select(Tick(4), || reals.clone());
        assert!(!next.is_empty());
    }

    #[test]
    fn completions_cross_threads_and_drain_in_order() {
        let queue = CompletionQueue::new();
        let sender = queue.sender();
        let handle = std::thread::spawn(move || {
            for n in 0..3 {
                sender.complete(WriteCompletion {
                    ticket: WriteTicket(n),
                    entity: EntityId(1),
                    purpose: WritePurpose::Archive,
                    result: Ok(()),
                });
            }
        });
        handle.join().expect("worker");
        let tickets: Vec<u64> = queue.drain().iter().map(|c| c.ticket.0).collect();
        assert_eq!(tickets, vec![0, 1, 2]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn flip_happens_once_per_flip_period() {
        let mut archiver = Archiver::new(4, SmallRng::seed_from_u64(1), Tick(0));
        assert!(!archiver.should_flip(Tick(5), 10));
        assert!(archiver.should_flip(Tick(10), 10));
        assert!(!archiver.should_flip(Tick(15), 10));
        assert!(archiver.should_flip(Tick(20), 10));
    }
}
