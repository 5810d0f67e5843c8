// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stability and delivery engine.
//!
//! Three recurrent SST predicates run per subgroup this node belongs to:
//!
//! - **stability**: `stable_num = min over the shard of seq_num`
//! - **delivery**: deliver the head locally stable message once its sequence
//!   number clears `min over the shard of stable_num`; one message per
//!   trigger keeps predicate work bounded
//! - **sender progress**: wake the sender loop when every peer has advanced
//!   past the window floor for the next expected delivery

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::membership::SubgroupId;
use crate::persistence::{ConfirmUpcall, PersistRecord};
use crate::sst::{CellRange, PredicateType, SharedStateTable};

use super::message::{sequence_number, Header, Message, HEADER_SIZE};
use super::state::MessageState;
use super::GroupCore;

/// Register the per-subgroup predicate set; handles are collected for
/// removal at wedge time.
pub(crate) fn register_predicates(core: &Arc<GroupCore>) {
    let mut handles = core.predicate_handles.lock();
    for (&subgroup, binding) in &core.geometry.bindings {
        let shard_rows = binding.shard_rows.clone();
        let row = core.sst.row();

        // Stability: publish the new minimum when it advances. Reads need no
        // lock; the single write publishes one cell.
        let stability_rows = shard_rows.clone();
        let weak = Arc::downgrade(core);
        handles.push(core.sst.insert_predicate(
            Box::new(|_| true),
            Box::new(move |table| {
                if weak.upgrade().is_none() {
                    return;
                }
                let min_seq = stability_rows
                    .iter()
                    .map(|&r| table.seq_num(r, subgroup))
                    .min()
                    .unwrap_or(-1);
                if min_seq > table.stable_num(row, subgroup) {
                    log::debug!("[STABILITY] subgroup {}: stable_num -> {}", subgroup, min_seq);
                    table.set_stable_num(row, subgroup, min_seq);
                    table.put(&stability_rows, CellRange::StableNum(subgroup));
                }
            }),
            PredicateType::Recurrent,
        ));

        // Delivery: at most one message per trigger, under the state lock.
        let delivery_rows = shard_rows.clone();
        let weak = Arc::downgrade(core);
        handles.push(core.sst.insert_predicate(
            Box::new(|_| true),
            Box::new(move |table| {
                if let Some(core) = weak.upgrade() {
                    deliver_tick(&core, table, subgroup, &delivery_rows);
                }
            }),
            PredicateType::Recurrent,
        ));

        // Sender progress: the companion that keeps the sender loop from
        // sitting on the condvar after peers have advanced. Receive-only
        // members have no sender to wake.
        let Some(sender_slot) = binding.sender_slot else {
            continue;
        };
        let progress_rows = shard_rows;
        let num_senders = binding.num_senders();
        let pred_weak = Arc::downgrade(core);
        let trig_weak = Arc::downgrade(core);
        handles.push(core.sst.insert_predicate(
            Box::new(move |table| {
                let Some(core) = pred_weak.upgrade() else {
                    return false;
                };
                let Some(next) = core.next_message_to_deliver.get(&subgroup) else {
                    return false;
                };
                let seq = sequence_number(next.load(Ordering::Acquire), num_senders, sender_slot);
                let persistent = core.persistence_enabled();
                progress_rows.iter().all(|&r| {
                    table.delivered_num(r, subgroup) >= seq
                        && (!persistent || table.persisted_num(r, subgroup) >= seq)
                })
            }),
            Box::new(move |_table| {
                let Some(core) = trig_weak.upgrade() else {
                    return;
                };
                core.sender_cv.notify_all();
                if let Some(next) = core.next_message_to_deliver.get(&subgroup) {
                    next.fetch_add(1, Ordering::AcqRel);
                }
            }),
            PredicateType::Recurrent,
        ));
    }
}

/// One delivery-predicate firing for `subgroup`.
fn deliver_tick(
    core: &Arc<GroupCore>,
    table: &SharedStateTable,
    subgroup: SubgroupId,
    shard_rows: &[usize],
) {
    let mut state = core.state.lock();
    let min_stable = shard_rows
        .iter()
        .map(|&r| table.stable_num(r, subgroup))
        .min()
        .unwrap_or(-1);

    let entry = {
        let Some(stable) = state.locally_stable.get_mut(&subgroup) else {
            return;
        };
        let Some((&seq, _)) = stable.first_key_value() else {
            return;
        };
        if seq > min_stable {
            return;
        }
        stable.remove(&seq).map(|msg| (seq, msg))
    };
    let Some((seq, msg)) = entry else {
        return;
    };
    log::debug!(
        "[DELIVERY] subgroup {}: delivering seq {} (min_stable {})",
        subgroup,
        seq,
        min_stable
    );
    deliver_message(core, &mut state, subgroup, seq, msg);
    table.set_delivered_num(core.sst.row(), subgroup, seq);
    table.put(shard_rows, CellRange::DeliveredNum(subgroup));
}

/// Run the delivery callbacks for one message and move its buffer onward:
/// to the persistence parking lot when a log is configured, straight back to
/// the pool otherwise. Placeholders are consumed silently.
fn deliver_message(
    core: &Arc<GroupCore>,
    state: &mut MessageState,
    subgroup: SubgroupId,
    seq: i64,
    msg: Message,
) {
    if msg.is_placeholder() {
        return;
    }
    let Some(binding) = core.geometry.bindings.get(&subgroup) else {
        return;
    };
    let Some(buffer) = msg.buffer else {
        return;
    };
    let region = Arc::clone(buffer.region());
    let Some(header) = Header::decode(region.as_slice(0, HEADER_SIZE)) else {
        log::error!(
            "[DELIVERY] malformed header at delivery, subgroup {} seq {}",
            subgroup,
            seq
        );
        state.pool.release(subgroup, buffer);
        return;
    };
    let payload_offset = header.header_size as usize;
    let payload_len = msg.size.saturating_sub(payload_offset);
    let payload = region.as_slice(payload_offset, payload_len);
    let Some(&sender_id) = binding.senders.get(msg.sender_rank as usize) else {
        log::error!(
            "[DELIVERY] sender slot {} out of range in subgroup {}",
            msg.sender_rank,
            subgroup
        );
        state.pool.release(subgroup, buffer);
        return;
    };

    if header.cooked_send {
        let rpc = core.rpc_callback.lock().clone();
        match rpc {
            Some(rpc) => rpc(sender_id, payload),
            None => log::warn!(
                "[DELIVERY] cooked message from {} dropped: no RPC callback installed",
                sender_id
            ),
        }
    } else {
        (core.callbacks.global_stability)(subgroup, msg.sender_rank, msg.index, payload);
    }

    let persistence = core.persistence.lock();
    if let Some(plog) = persistence.as_ref() {
        plog.append(PersistRecord {
            subgroup,
            seq,
            view_id: core.view.vid,
            sender_id,
            sender_rank: msg.sender_rank,
            index: msg.index,
            cooked: header.cooked_send,
            region,
            payload_offset,
            payload_len,
        });
        if let Some(parked) = state.non_persistent.get_mut(&subgroup) {
            parked.insert(
                seq,
                Message {
                    sender_rank: msg.sender_rank,
                    index: msg.index,
                    size: msg.size,
                    buffer: Some(buffer),
                },
            );
        }
    } else {
        state.pool.release(subgroup, buffer);
    }
}

/// Upcall run by the log writer once a record is durable: notify the host,
/// reclaim the parked buffer, and publish `persisted_num` - unless the
/// record belongs to an earlier view, whose sequence numbers are not
/// comparable with the current counters.
pub(crate) fn make_confirm_upcall(core: Weak<GroupCore>) -> ConfirmUpcall {
    Box::new(move |record| {
        let Some(core) = core.upgrade() else {
            return;
        };
        // The message is still parked, so the payload read is safe.
        let payload = record
            .region
            .as_slice(record.payload_offset, record.payload_len);
        if let Some(cb) = &core.callbacks.local_persistence {
            cb(record.subgroup, record.sender_rank, record.index, payload);
        }

        let mut state = core.state.lock();
        let Some(msg) = state
            .non_persistent
            .get_mut(&record.subgroup)
            .and_then(|parked| parked.remove(&record.seq))
        else {
            log::warn!(
                "[DELIVERY] durable write confirmed for unknown (subgroup {}, seq {})",
                record.subgroup,
                record.seq
            );
            return;
        };
        if let Some(buffer) = msg.buffer {
            if core.geometry.bindings.contains_key(&record.subgroup) {
                state.pool.release(record.subgroup, buffer);
            }
        }
        drop(state);

        if record.view_id == core.view.vid {
            if let Some(binding) = core.geometry.bindings.get(&record.subgroup) {
                let table = core.sst.table();
                table.set_persisted_num(core.sst.row(), record.subgroup, record.seq);
                table.put(&binding.shard_rows, CellRange::PersistedNum(record.subgroup));
            }
        }
    })
}
