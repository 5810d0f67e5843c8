// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Send entry points and the background sender loop.
//!
//! Staging (`get_send_buffer`) and submission (`send`) run on the caller's
//! thread; dispatch runs on the group's single sender worker, round-robin
//! over subgroups with the starting offset carried across wake-ups so no
//! subgroup starves.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::MemoryRegion;
use crate::membership::SubgroupId;

use super::message::{sequence_number, Header, Message, HEADER_SIZE};
use super::state::MessageState;
use super::{receive, GroupCore};

/// Writable view of a staged message's payload, valid until the message is
/// submitted with `send()`.
///
/// The staging caller is the region's only writer until submission; the
/// `&mut` receivers keep that exclusivity visible in the API.
pub struct SendBuffer {
    region: Arc<MemoryRegion>,
    payload_offset: usize,
    payload_len: usize,
}

impl SendBuffer {
    /// Payload capacity in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload_len
    }

    /// True when the staged message carries no payload bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }

    /// Copy `src` to the start of the payload.
    ///
    /// # Panics
    /// Panics if `src` exceeds the payload capacity.
    pub fn write(&mut self, src: &[u8]) {
        self.write_at(0, src);
    }

    /// Copy `src` into the payload at `offset`.
    ///
    /// # Panics
    /// Panics if the copy would run past the payload capacity.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        assert!(
            offset + src.len() <= self.payload_len,
            "payload write of {} bytes at {} exceeds capacity {}",
            src.len(),
            offset,
            self.payload_len
        );
        self.region.write_at(self.payload_offset + offset, src);
    }
}

impl GroupCore {
    /// See [`super::MulticastGroup::get_send_buffer`].
    pub(crate) fn get_send_buffer(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        pause_sending_turns: u32,
        cooked_send: bool,
    ) -> Option<SendBuffer> {
        if !self.groups_created.load(Ordering::Acquire) {
            return None;
        }
        let Some(binding) = self.geometry.bindings.get(&subgroup) else {
            log::warn!(
                "[SENDER] get_send_buffer for subgroup {} this node is not a member of",
                subgroup
            );
            return None;
        };
        let Some(sender_slot) = binding.sender_slot else {
            log::warn!(
                "[SENDER] get_send_buffer for subgroup {} this node does not send in",
                subgroup
            );
            return None;
        };
        let msg_size = if payload_size == 0 {
            self.max_msg_size
        } else {
            payload_size + HEADER_SIZE
        };
        if msg_size > self.max_msg_size {
            log::warn!(
                "[SENDER] payload of {} bytes exceeds max message size {}",
                payload_size,
                self.max_msg_size
            );
            return None;
        }

        let table = self.sst.table();
        let mut state = self.state.lock();
        if self.shutdown.load(Ordering::Acquire) {
            return None;
        }
        if state.next_sends.contains_key(&subgroup) {
            log::debug!(
                "[SENDER] subgroup {} already has a staged message awaiting send()",
                subgroup
            );
            return None;
        }

        // Window floor: every peer must have delivered (and, when persistence
        // gates reclamation, persisted) past the slot this message would
        // occupy.
        let future_index = *state.future_message_indices.get(&subgroup)?;
        let floor = sequence_number(
            future_index - self.config.window_size as i64,
            binding.num_senders(),
            sender_slot,
        );
        let persistent = self.persistence_enabled();
        for &peer in &binding.shard_rows {
            if table.delivered_num(peer, subgroup) < floor {
                return None;
            }
            if persistent && table.persisted_num(peer, subgroup) < floor {
                return None;
            }
        }

        let buffer = state.pool.acquire(subgroup)?;
        let header = Header::new(pause_sending_turns, cooked_send);
        buffer.region().write_at(0, &header.encode());
        let region = Arc::clone(buffer.region());

        state.next_sends.insert(
            subgroup,
            Message {
                sender_rank: sender_slot,
                index: future_index,
                size: msg_size,
                buffer: Some(buffer),
            },
        );
        if let Some(index) = state.future_message_indices.get_mut(&subgroup) {
            *index += i64::from(pause_sending_turns) + 1;
        }

        Some(SendBuffer {
            region,
            payload_offset: HEADER_SIZE,
            payload_len: msg_size - HEADER_SIZE,
        })
    }

    /// See [`super::MulticastGroup::send`].
    pub(crate) fn submit(&self, subgroup: SubgroupId) -> bool {
        {
            let mut state = self.state.lock();
            if self.shutdown.load(Ordering::Acquire) || !self.groups_created.load(Ordering::Acquire)
            {
                return false;
            }
            let Some(msg) = state.next_sends.remove(&subgroup) else {
                log::debug!("[SENDER] send({}) with nothing staged", subgroup);
                return false;
            };
            let Some(queue) = state.pending_sends.get_mut(&subgroup) else {
                return false;
            };
            queue.push_back(msg);
        }
        self.sender_cv.notify_all();
        true
    }
}

/// Is `subgroup` ready to dispatch its head pending message?
fn ready_to_send(core: &GroupCore, state: &MessageState, subgroup: SubgroupId) -> bool {
    let Some(binding) = core.geometry.bindings.get(&subgroup) else {
        return false;
    };
    let (Some(sender_slot), Some(my_slot)) = (binding.sender_slot, binding.my_slot()) else {
        return false;
    };
    let Some(msg) = state.pending_sends.get(&subgroup).and_then(|q| q.front()) else {
        return false;
    };
    let table = core.sst.table();
    let row = core.sst.row();

    // FIFO visibility: the local receive path must have caught up past the
    // previous send before the next one is handed to the transport.
    if table.num_received(row, my_slot) < msg.index - 1 {
        return false;
    }

    let floor = sequence_number(
        msg.index - core.config.window_size as i64,
        binding.num_senders(),
        sender_slot,
    );
    let persistent = core.persistence_enabled();
    for &peer in &binding.shard_rows {
        if table.delivered_num(peer, subgroup) < floor {
            return false;
        }
        if persistent && table.persisted_num(peer, subgroup) < floor {
            return false;
        }
    }
    true
}

/// Round-robin scan starting after `previous`; returns the position of the
/// next ready subgroup.
fn next_ready(
    core: &GroupCore,
    state: &MessageState,
    subgroups: &[SubgroupId],
    previous: usize,
) -> Option<usize> {
    if !core.groups_created.load(Ordering::Acquire) {
        return None;
    }
    for step in 1..=subgroups.len() {
        let position = (previous + step) % subgroups.len();
        if ready_to_send(core, state, subgroups[position]) {
            return Some(position);
        }
    }
    None
}

/// The group's single sender worker.
///
/// Waits on the condvar until shutdown or some subgroup is ready, then moves
/// the head pending message into the in-flight slot and hands it to the
/// transport. The message-state lock is released around the blocking
/// transport call. Transport failure is fatal: the loop exits and only a
/// view change recovers.
pub(crate) fn send_loop(core: &Arc<GroupCore>) {
    let subgroups = core.my_subgroups.clone();
    if subgroups.is_empty() {
        return;
    }
    let mut cursor = 0usize;
    let mut state = core.state.lock();
    while !core.shutdown.load(Ordering::Acquire) {
        let Some(position) = next_ready(core, &state, &subgroups, cursor) else {
            // Timed wait: readiness can turn true through SST cells written
            // outside this mutex, so a bare wait could miss its wake-up.
            core.sender_cv
                .wait_for(&mut state, Duration::from_millis(1));
            continue;
        };
        cursor = position;
        let subgroup = subgroups[position];
        let Some(binding) = core.geometry.bindings.get(&subgroup) else {
            continue;
        };
        let Some(msg) = state
            .pending_sends
            .get_mut(&subgroup)
            .and_then(|q| q.pop_front())
        else {
            continue;
        };
        log::debug!(
            "[SENDER] dispatching subgroup {} index {} from slot {}",
            subgroup,
            msg.index,
            msg.sender_rank
        );
        let region = msg.buffer.as_ref().map(|b| Arc::clone(b.region()));
        let size = msg.size;
        state.current_sends.insert(subgroup, msg);
        let Some(region) = region else {
            log::error!("[SENDER] pending message without buffer; sender loop exiting");
            return;
        };

        let Some(sender_slot) = binding.sender_slot else {
            log::error!("[SENDER] pending message in a subgroup without a sender slot");
            continue;
        };
        if binding.shard_members.len() <= 1 {
            // Degenerate shard: no transport group exists; run the receive
            // bookkeeping inline so seq_num advances trivially.
            drop(state);
            receive::on_block_received(core, subgroup, sender_slot, region.as_slice(0, size));
            state = core.state.lock();
        } else {
            let group_id = core.group_id_offset + binding.slot_flat_base + sender_slot;
            drop(state);
            if !core.transport.send(group_id, &region, 0, size) {
                log::error!(
                    "[SENDER] transport send failed on group {}; group is dead until a new view",
                    group_id
                );
                return;
            }
            state = core.state.lock();
        }
    }
    log::debug!("[SENDER] sender loop shutting down");
}
