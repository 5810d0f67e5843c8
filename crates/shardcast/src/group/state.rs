// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message state guarded by the group's single coarse lock.
//!
//! Every producer and consumer path acquires the lock; a message buffer is
//! owned by exactly one location at a time: the free pool, the staged
//! `next_sends` slot, `pending_sends`, the in-flight `current_sends` slot,
//! `current_receives`, `locally_stable_messages`, or
//! `non_persistent_messages`.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::buffer::BufferPool;
use crate::membership::{SubgroupId, ViewGeometry};

use super::message::Message;

pub(crate) struct MessageState {
    /// Per-subgroup free buffers.
    pub pool: BufferPool,
    /// At-most-one staged message per subgroup, awaiting `send()`.
    pub next_sends: HashMap<SubgroupId, Message>,
    /// Messages submitted and awaiting dispatch by the sender loop.
    pub pending_sends: HashMap<SubgroupId, VecDeque<Message>>,
    /// At-most-one message per subgroup inside the transport.
    pub current_sends: HashMap<SubgroupId, Message>,
    /// Incoming messages being filled by the transport, keyed by
    /// (subgroup, sequence number).
    pub current_receives: HashMap<(SubgroupId, i64), Message>,
    /// Fully received messages awaiting global stability, ordered by
    /// sequence number; the key space is contiguous because pause turns are
    /// filled with placeholders.
    pub locally_stable: HashMap<SubgroupId, BTreeMap<i64, Message>>,
    /// Delivered messages awaiting durable-write confirmation.
    pub non_persistent: HashMap<SubgroupId, BTreeMap<i64, Message>>,
    /// Next sender-local index per subgroup.
    pub future_message_indices: HashMap<SubgroupId, i64>,
}

impl MessageState {
    /// Fresh state for this node's bindings, with each subgroup's pool
    /// pre-filled to `window_size x shard_size` buffers.
    pub fn new(geometry: &ViewGeometry, window_size: usize, max_msg_size: usize) -> Self {
        let mut state = Self {
            pool: BufferPool::new(),
            next_sends: HashMap::new(),
            pending_sends: HashMap::new(),
            current_sends: HashMap::new(),
            current_receives: HashMap::new(),
            locally_stable: HashMap::new(),
            non_persistent: HashMap::new(),
            future_message_indices: HashMap::new(),
        };
        for (&subgroup, binding) in &geometry.bindings {
            state.pool.fill(
                subgroup,
                window_size * binding.shard_members.len(),
                max_msg_size,
            );
            state.pending_sends.insert(subgroup, VecDeque::new());
            state.locally_stable.insert(subgroup, BTreeMap::new());
            state.non_persistent.insert(subgroup, BTreeMap::new());
            state.future_message_indices.insert(subgroup, 0);
        }
        state
    }

    /// Count where every buffer of `subgroup` currently lives. Placeholders
    /// carry no buffer and are excluded.
    pub fn census(&self, subgroup: SubgroupId) -> BufferCensus {
        let has_buffer = |m: &Message| usize::from(m.buffer.is_some());
        BufferCensus {
            free: self.pool.available(subgroup),
            staged: self.next_sends.get(&subgroup).map_or(0, has_buffer),
            pending: self
                .pending_sends
                .get(&subgroup)
                .map_or(0, |q| q.iter().map(has_buffer).sum()),
            sending: self.current_sends.get(&subgroup).map_or(0, has_buffer),
            receiving: self
                .current_receives
                .iter()
                .filter(|((g, _), m)| *g == subgroup && m.buffer.is_some())
                .count(),
            locally_stable: self
                .locally_stable
                .get(&subgroup)
                .map_or(0, |m| m.values().map(has_buffer).sum()),
            awaiting_persistence: self
                .non_persistent
                .get(&subgroup)
                .map_or(0, |m| m.values().map(has_buffer).sum()),
        }
    }
}

/// Snapshot of buffer ownership for one subgroup; the total is invariant
/// over a view's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCensus {
    /// Buffers in the free pool.
    pub free: usize,
    /// Staged message awaiting `send()`.
    pub staged: usize,
    /// Messages queued for the sender loop.
    pub pending: usize,
    /// Message inside the transport.
    pub sending: usize,
    /// Incoming messages being filled.
    pub receiving: usize,
    /// Fully received, not yet delivered.
    pub locally_stable: usize,
    /// Delivered, awaiting durable-write confirmation.
    pub awaiting_persistence: usize,
}

impl BufferCensus {
    /// Total buffers across every location.
    #[must_use]
    pub fn total(&self) -> usize {
        self.free
            + self.staged
            + self.pending
            + self.sending
            + self.receiving
            + self.locally_stable
            + self.awaiting_persistence
    }
}
