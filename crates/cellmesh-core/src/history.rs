//! Ordered replication log kept on each real entity.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    PropertyChanged {
        name: String,
        value: serde_json::Value,
    },
    /// A client-visible method broadcast; ghosts only record its sequence.
    MethodCall {
        name: String,
        args: Vec<serde_json::Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub seq: u64,
    pub kind: EventKind,
}

/// Bounded history; the oldest events fall off once `capacity` is exceeded. Sequence numbers
/// start at 1 and never repeat for the lifetime of the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHistory {
    events: VecDeque<HistoryEvent>,
    last_seq: u64,
    capacity: usize,
}

impl EventHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            last_seq: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, kind: EventKind) -> HistoryEvent {
        self.last_seq += 1;
        let event = HistoryEvent {
            seq: self.last_seq,
            kind,
        };
        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        event
    }

    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Continue numbering after `seq` (used when rebuilding from a backup).
    pub fn resume_after(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    pub fn events_after(&self, seq: u64) -> impl Iterator<Item = &HistoryEvent> + '_ {
        self.events.iter().filter(move |e| e.seq > seq)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prop(value: i64) -> EventKind {
        EventKind::PropertyChanged {
            name: "hp".into(),
            value: json!(value),
        }
    }

    #[test]
    fn capacity_bounds_retained_events_but_not_sequence() {
        let mut history = EventHistory::new(2);
        for v in 0..5 {
            history.push(prop(v));
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.last_seq(), 5);
        let seqs: Vec<u64> = history.events_after(0).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn resume_after_never_moves_backwards() {
        let mut history = EventHistory::new(4);
        history.resume_after(10);
        assert_eq!(history.push(prop(1)).seq, 11);
        history.resume_after(3);
        assert_eq!(history.push(prop(2)).seq, 12);
    }
}
