// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport-group registration and the receive path.
//!
//! One transport group exists per (subgroup, sender) within each shard this
//! node belongs to, numbered from the view's offset by the flat slot index
//! so every member computes identical ids. A shard with a single member
//! registers no groups; its bookkeeping runs inline on the sender loop.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::membership::{NodeId, SubgroupId};
use crate::sst::CellRange;
use crate::transport::{CompletionCallback, DestinationCallback, ReceiveDestination};

use super::message::{sequence_number, Header, Message};
use super::GroupCore;

/// Register every transport group this node participates in. Returns false
/// as soon as one registration is refused; the groups created so far are
/// torn down by `wedge`.
pub(crate) fn create_transport_groups(core: &Arc<GroupCore>) -> bool {
    for (&subgroup, binding) in &core.geometry.bindings {
        let num_members = binding.shard_members.len();
        if num_members <= 1 {
            continue;
        }
        for (slot, &sender) in binding.senders.iter().enumerate() {
            let group_id = core.group_id_offset + binding.slot_flat_base + slot as u32;
            // Dissemination order starts at the sender.
            let anchor = binding
                .shard_members
                .iter()
                .position(|&m| m == sender)
                .unwrap_or(0);
            let rotated: Vec<NodeId> = (0..num_members)
                .map(|l| binding.shard_members[(anchor + l) % num_members])
                .collect();

            let weak = Arc::downgrade(core);
            let sender_slot = slot as u32;
            let completion: CompletionCallback = Box::new(move |data| {
                if let Some(core) = weak.upgrade() {
                    on_block_received(&core, subgroup, sender_slot, data);
                }
            });

            let destination: DestinationCallback = if sender == core.view.my_id() {
                // The sender's own group delivers out of its send buffer and
                // must never ask for a destination.
                Box::new(move |_size| {
                    debug_assert!(false, "destination requested on sender-side group");
                    None
                })
            } else {
                let weak = Arc::downgrade(core);
                Box::new(move |size| incoming_destination(&weak, subgroup, sender_slot, size))
            };

            let created = core.transport.create_group(
                group_id,
                &rotated,
                core.config.block_size,
                core.config.send_algorithm,
                destination,
                completion,
                Box::new(|_| {}),
            );
            if !created {
                log::warn!(
                    "[RECV] transport refused group {} (subgroup {}, sender {})",
                    group_id,
                    subgroup,
                    sender
                );
                return false;
            }
            core.created_groups.lock().push(group_id);
        }
    }
    true
}

/// Destination callback: claim a free buffer and record the pending message
/// under the sequence number its sender-local index implies.
fn incoming_destination(
    core: &Weak<GroupCore>,
    subgroup: SubgroupId,
    sender_slot: u32,
    size: usize,
) -> Option<ReceiveDestination> {
    let core = core.upgrade()?;
    let binding = core.geometry.bindings.get(&subgroup)?;
    let mut state = core.state.lock();
    let Some(buffer) = state.pool.acquire(subgroup) else {
        // Unreachable while the window gate holds; see the pool sizing.
        log::error!(
            "[RECV] free pool empty for subgroup {}; refusing destination",
            subgroup
        );
        return None;
    };
    let table = core.sst.table();
    let index = table.num_received(core.sst.row(), binding.slot_base + sender_slot as usize) + 1;
    let seq = sequence_number(index, binding.num_senders(), sender_slot);
    let region = Arc::clone(buffer.region());
    state.current_receives.insert(
        (subgroup, seq),
        Message {
            sender_rank: sender_slot,
            index,
            size,
            buffer: Some(buffer),
        },
    );
    Some(ReceiveDestination { region, offset: 0 })
}

/// Completion bookkeeping, shared by transport callbacks and the degenerate
/// single-member dispatch: mark the message locally stable, synthesize
/// placeholders for paused turns, advance `seq_num`, and publish.
pub(crate) fn on_block_received(
    core: &Arc<GroupCore>,
    subgroup: SubgroupId,
    sender_slot: u32,
    data: &[u8],
) {
    let Some(binding) = core.geometry.bindings.get(&subgroup) else {
        return;
    };
    let Some(header) = Header::decode(data) else {
        log::error!(
            "[RECV] malformed header from slot {} in subgroup {}",
            sender_slot,
            subgroup
        );
        return;
    };
    let num_senders = binding.num_senders();
    let table = core.sst.table();
    let row = core.sst.row();
    let slot = binding.slot_base + sender_slot as usize;

    {
        let mut state = core.state.lock();
        let mut index = table.num_received(row, slot) + 1;
        table.set_num_received(row, slot, index);
        let mut seq = sequence_number(index, num_senders, sender_slot);
        log::debug!(
            "[RECV] locally stable: subgroup {} slot {} index {} seq {}",
            subgroup,
            sender_slot,
            index,
            seq
        );

        // Move the message out of its in-flight slot.
        let msg = if Some(sender_slot) == binding.sender_slot {
            state.current_sends.remove(&subgroup)
        } else {
            state.current_receives.remove(&(subgroup, seq))
        };
        match msg {
            Some(msg) => {
                if let Some(stable) = state.locally_stable.get_mut(&subgroup) {
                    stable.insert(seq, msg);
                }
            }
            None => log::error!(
                "[RECV] no in-flight message for subgroup {} seq {}",
                subgroup,
                seq
            ),
        }

        // One placeholder per paused turn keeps the receive counter advancing
        // uniformly across peers and the sequence space contiguous.
        for _ in 0..header.pause_sending_turns {
            index += 1;
            seq += num_senders as i64;
            table.set_num_received(row, slot, index);
            if let Some(stable) = state.locally_stable.get_mut(&subgroup) {
                stable.insert(seq, Message::placeholder(sender_slot, index));
            }
        }

        // The shard's slowest sender bounds this node's sequence number.
        let mut min_received = i64::MAX;
        let mut slowest = 0usize;
        for i in 0..num_senders {
            let received = table.num_received(row, binding.slot_base + i);
            if received < min_received {
                min_received = received;
                slowest = i;
            }
        }
        let new_seq_num = (min_received + 1) * num_senders as i64 + slowest as i64 - 1;
        if new_seq_num > table.seq_num(row, subgroup) {
            log::debug!(
                "[RECV] subgroup {}: seq_num -> {}",
                subgroup,
                new_seq_num
            );
            table.set_seq_num(row, subgroup, new_seq_num);
            table.put(&binding.shard_rows, CellRange::SeqNum(subgroup));
            table.put(&binding.shard_rows, CellRange::NumReceived(slot));
        } else {
            table.put(&binding.shard_rows, CellRange::NumReceived(slot));
        }
    }

    if !core.shutdown.load(Ordering::Acquire) {
        core.sender_cv.notify_all();
    }
}
