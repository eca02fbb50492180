//! Per-entity reliable channel state.
//!
//! Each real entity owns one outgoing channel to its backup peer. Sequence numbers and the
//! unacknowledged resend history travel with the entity on offload so the receiving side can
//! keep suppressing duplicates across the hand-off.

use crate::{EntityId, ProcessAddr, Tick};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Unacknowledged payloads retained for resend.
const RESEND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityChannel {
    peer: Option<ProcessAddr>,
    next_out_seq: u64,
    last_acked_seq: u64,
    resend: VecDeque<(u64, Vec<u8>)>,
}

impl EntityChannel {
    #[must_use]
    pub fn new(peer: Option<ProcessAddr>) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn peer(&self) -> Option<ProcessAddr> {
        self.peer
    }

    /// Sequence number the next stamped payload will carry.
    #[must_use]
    pub fn next_out_seq(&self) -> u64 {
        self.next_out_seq + 1
    }

    #[must_use]
    pub fn last_acked_seq(&self) -> u64 {
        self.last_acked_seq
    }

    #[must_use]
    pub fn unacked(&self) -> usize {
        self.resend.len()
    }

    /// Assign the next sequence number to `payload` and keep a copy for resend.
    pub fn stamp(&mut self, payload: &[u8]) -> u64 {
        self.next_out_seq += 1;
        self.resend.push_back((self.next_out_seq, payload.to_vec()));
        while self.resend.len() > RESEND_CAPACITY {
            self.resend.pop_front();
        }
        self.next_out_seq
    }

    /// Trim resend history up to and including `seq`. Returns false for stale or unknown acks.
    pub fn ack(&mut self, seq: u64) -> bool {
        if seq <= self.last_acked_seq || seq > self.next_out_seq {
            return false;
        }
        self.last_acked_seq = seq;
        while self.resend.front().is_some_and(|(s, _)| *s <= seq) {
            self.resend.pop_front();
        }
        true
    }

    /// Point the channel at a new peer. Sequence numbers keep increasing; history meant for
    /// the old peer is dropped.
    pub fn retarget(&mut self, peer: Option<ProcessAddr>) {
        if self.peer != peer {
            self.peer = peer;
            self.resend.clear();
            self.last_acked_seq = self.next_out_seq;
        }
    }

    pub fn resend_history(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.resend.iter().map(|(seq, bytes)| (*seq, bytes.as_slice()))
    }
}

#[derive(Debug, Clone)]
struct CondemnedChannel {
    entity: EntityId,
    channel: EntityChannel,
    expires: Tick,
}

/// Channels left behind by offloaded entities. They absorb acknowledgements still in flight
/// for the old owner until they expire.
#[derive(Debug, Default)]
pub struct CondemnedChannels {
    entries: Vec<CondemnedChannel>,
}

impl CondemnedChannels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condemn(&mut self, entity: EntityId, channel: EntityChannel, expires: Tick) {
        self.entries.push(CondemnedChannel {
            entity,
            channel,
            expires,
        });
    }

    /// Deliver a late ack to a condemned channel. Returns true if one claimed it.
    pub fn absorb_ack(&mut self, entity: EntityId, from: ProcessAddr, seq: u64) -> bool {
        match self
            .entries
            .iter_mut()
            .rev()
            .find(|c| c.entity == entity && c.channel.peer() == Some(from))
        {
            Some(condemned) => {
                condemned.channel.ack(seq);
                true
            }
            None => false,
        }
    }

    /// Drop channels that reached their expiry tick; returns how many were dropped.
    pub fn expire(&mut self, now: Tick) -> usize {
        let before = self.entries.len();
        self.entries.retain(|c| c.expires > now);
        before - self.entries.len()
    }

    /// Forget channels to a dead peer.
    pub fn drop_peer(&mut self, peer: ProcessAddr) {
        self.entries.retain(|c| c.channel.peer() != Some(peer));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_trims_history_and_rejects_stale() {
        let mut channel = EntityChannel::new(Some(ProcessAddr(2)));
        assert_eq!(channel.stamp(b"a"), 1);
        assert_eq!(channel.stamp(b"b"), 2);
        assert_eq!(channel.stamp(b"c"), 3);
        assert!(channel.ack(2));
        assert_eq!(channel.unacked(), 1);
        assert!(!channel.ack(2));
        assert!(!channel.ack(9));
        assert_eq!(channel.resend_history().map(|(s, _)| s).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn retarget_keeps_sequence_monotonic() {
        let mut channel = EntityChannel::new(Some(ProcessAddr(2)));
        channel.stamp(b"a");
        channel.retarget(Some(ProcessAddr(3)));
        assert_eq!(channel.unacked(), 0);
        assert_eq!(channel.stamp(b"b"), 2);
    }

    #[test]
    fn condemned_channel_absorbs_late_ack_until_expiry() {
        let mut channel = EntityChannel::new(Some(ProcessAddr(4)));
        channel.stamp(b"x");
        let mut condemned = CondemnedChannels::new();
        condemned.condemn(EntityId(1), channel, Tick(10));
        assert!(condemned.absorb_ack(EntityId(1), ProcessAddr(4), 1));
        assert!(!condemned.absorb_ack(EntityId(1), ProcessAddr(5), 1));
        assert_eq!(condemned.expire(Tick(9)), 0);
        assert_eq!(condemned.expire(Tick(10)), 1);
        assert!(condemned.is_empty());
    }
}
