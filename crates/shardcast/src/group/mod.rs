// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The ordered atomic multicast engine.
//!
//! One [`MulticastGroup`] instance exists per installed view. It orchestrates
//! per-sender FIFO streams into a shard-wide total order using only the
//! monotonic counters of the shared state table, flow-controls senders
//! against a bounded window, reclaims buffers, and hands in-flight work to
//! its successor on a view change.
//!
//! # Threads
//!
//! - the sender loop, round-robin over subgroups, woken by a condvar
//! - the heartbeat loop, publishing a liveness tick every `timeout_ms`
//! - SST predicate triggers (stability, delivery, sender progress), run on
//!   the table's executor
//! - transport completion callbacks, run on transport-owned threads
//!
//! All mutable message state sits behind one coarse lock; no path blocks on
//! I/O while holding it.

pub mod message;

mod delivery;
mod receive;
mod sender;
mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::callbacks::{CallbackSet, RpcCallback};
use crate::config::GroupConfig;
use crate::error::{Error, Result};
use crate::membership::{SubgroupId, SubgroupLayout, View, ViewGeometry};
use crate::persistence::PersistentLog;
use crate::sst::{CellRange, NodeSst, PredicateHandle};
use crate::transport::{BlockTransport, TransportGroupId};

use message::{Header, HEADER_SIZE};
use state::MessageState;

pub use sender::SendBuffer;
pub use state::BufferCensus;

/// Everything shared between the public handle, the background workers, the
/// SST predicates, and the transport callbacks.
pub(crate) struct GroupCore {
    pub view: View,
    pub config: GroupConfig,
    pub max_msg_size: usize,
    pub geometry: ViewGeometry,
    /// Subgroups this node belongs to, in round-robin order.
    pub my_subgroups: Vec<SubgroupId>,
    pub layout: Arc<dyn SubgroupLayout>,
    pub sst: Arc<NodeSst>,
    pub transport: Arc<dyn BlockTransport>,
    pub callbacks: CallbackSet,
    pub rpc_callback: Mutex<Option<Arc<RpcCallback>>>,
    pub state: Mutex<MessageState>,
    pub sender_cv: Condvar,
    /// Single cooperative shutdown flag; wedge is a CAS on it.
    pub shutdown: AtomicBool,
    /// False when transport-group creation was skipped or refused; the group
    /// then accepts no sends.
    pub groups_created: AtomicBool,
    pub created_groups: Mutex<Vec<TransportGroupId>>,
    /// First transport-group id of this view.
    pub group_id_offset: u32,
    /// Per subgroup, the index gating the sender-progress predicate.
    pub next_message_to_deliver: HashMap<SubgroupId, AtomicI64>,
    pub predicate_handles: Mutex<Vec<PredicateHandle>>,
    pub persistence: Mutex<Option<PersistentLog>>,
}

impl GroupCore {
    fn build(
        view: View,
        layout: Arc<dyn SubgroupLayout>,
        sst: Arc<NodeSst>,
        transport: Arc<dyn BlockTransport>,
        callbacks: CallbackSet,
        config: GroupConfig,
        group_id_offset: u32,
        open_log: bool,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let geometry = ViewGeometry::compute(&view, &*layout)?;

        let table_layout = sst.table().layout();
        if table_layout.subgroups != geometry.num_subgroups as usize
            || table_layout.receive_slots != geometry.receive_slots
        {
            return Err(Error::SstGeometryMismatch {
                table: (table_layout.subgroups, table_layout.receive_slots),
                view: (geometry.num_subgroups as usize, geometry.receive_slots),
            });
        }
        if sst.table().num_rows() < view.num_members() {
            return Err(Error::InvalidConfig(format!(
                "SST has {} rows but the view has {} members",
                sst.table().num_rows(),
                view.num_members()
            )));
        }

        let max_msg_size = config.max_msg_size();
        let state = MessageState::new(&geometry, config.window_size, max_msg_size);
        let my_subgroups: Vec<SubgroupId> = geometry.bindings.keys().copied().collect();
        let next_message_to_deliver = my_subgroups
            .iter()
            .map(|&g| (g, AtomicI64::new(0)))
            .collect();

        let persistence = match (&config.persistence_path, open_log) {
            (Some(path), true) => Some(PersistentLog::open(path)?),
            _ => None,
        };

        let core = Arc::new(Self {
            view,
            config,
            max_msg_size,
            geometry,
            my_subgroups,
            layout,
            sst,
            transport,
            callbacks,
            rpc_callback: Mutex::new(None),
            state: Mutex::new(state),
            sender_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            groups_created: AtomicBool::new(false),
            created_groups: Mutex::new(Vec::new()),
            group_id_offset,
            next_message_to_deliver,
            predicate_handles: Mutex::new(Vec::new()),
            persistence: Mutex::new(persistence),
        });

        if let Some(log) = core.persistence.lock().as_ref() {
            log.set_confirm_upcall(delivery::make_confirm_upcall(Arc::downgrade(&core)));
        }
        Ok(core)
    }

    /// Whether persistence gates buffer reclamation and the send window.
    pub fn persistence_enabled(&self) -> bool {
        self.config.persistence_enabled()
    }

    fn wedge(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("[GROUP] wedging view {}", self.view.vid);
        for handle in self.predicate_handles.lock().drain(..) {
            self.sst.remove_predicate(handle);
        }
        for id in self.created_groups.lock().drain(..) {
            self.transport.destroy_group(id);
        }
        self.sender_cv.notify_all();
    }
}

/// The per-view multicast group. See the module docs.
pub struct MulticastGroup {
    core: Arc<GroupCore>,
    sender_thread: Option<JoinHandle<()>>,
    heartbeat_thread: Option<JoinHandle<()>>,
}

impl MulticastGroup {
    /// Build the group for a freshly installed view.
    ///
    /// `already_failed` is keyed by view rank; when any member is flagged,
    /// transport groups are not created and the group accepts no sends (the
    /// membership service is expected to install a new view).
    pub fn new(
        view: View,
        layout: Arc<dyn SubgroupLayout>,
        sst: Arc<NodeSst>,
        transport: Arc<dyn BlockTransport>,
        callbacks: CallbackSet,
        config: GroupConfig,
        already_failed: &[bool],
    ) -> Result<Self> {
        let core = GroupCore::build(
            view, layout, sst, transport, callbacks, config, 0, true,
        )?;
        Self::finish(core, already_failed)
    }

    /// Rebuild across a view change, inheriting the old group's pending work.
    ///
    /// The old group is wedged, its buffers and undelivered sender-local
    /// messages move into the new instance with rewritten indices, and the
    /// persistence writer (if any) is transferred and rewired. Transport
    /// group ids start past every id the old view could have used.
    pub fn from_previous(
        view: View,
        sst: Arc<NodeSst>,
        mut old: MulticastGroup,
        already_failed: &[bool],
    ) -> Result<Self> {
        old.wedge();

        let group_id_offset = old.core.group_id_offset + old.core.geometry.total_slots;
        let core = GroupCore::build(
            view,
            Arc::clone(&old.core.layout),
            sst,
            Arc::clone(&old.core.transport),
            old.core.callbacks.clone(),
            old.core.config.clone(),
            group_id_offset,
            false,
        )?;
        *core.rpc_callback.lock() = old.core.rpc_callback.lock().clone();

        // Quiesce durable-write confirmations while parked messages move
        // between the groups, then point them at the new instance.
        let plog = old.core.persistence.lock().take();
        let transfer = || Self::transfer_state(&old.core, &core);
        match &plog {
            Some(plog) => plog.swap_confirm_upcall_during(
                delivery::make_confirm_upcall(Arc::downgrade(&core)),
                transfer,
            ),
            None => transfer(),
        }
        *core.persistence.lock() = plog;

        Self::finish(core, already_failed)
        // `old` drops here, joining its heartbeat worker.
    }

    /// Move buffers and in-flight work from the wedged old group.
    fn transfer_state(old_core: &GroupCore, new_core: &GroupCore) {
        let mut old_state = old_core.state.lock();
        let mut new_state = new_core.state.lock();

        // Reclaim the old free pools wholesale, then top back up in case the
        // shard grew.
        for (&subgroup, binding) in &new_core.geometry.bindings {
            let reclaimed = old_state.pool.take_all(subgroup);
            if !reclaimed.is_empty() {
                new_state.pool.take_all(subgroup);
                for buffer in reclaimed {
                    new_state.pool.release(subgroup, buffer);
                }
            }
            new_state.pool.fill(
                subgroup,
                new_core.config.window_size * binding.shard_members.len(),
                new_core.max_msg_size,
            );
        }

        // Half-received messages are abandoned; their buffers return to the
        // pool of any subgroup this node still belongs to.
        for ((subgroup, _seq), msg) in old_state.current_receives.drain() {
            if let Some(buffer) = msg.buffer {
                if new_core.geometry.bindings.contains_key(&subgroup) {
                    new_state.pool.release(subgroup, buffer);
                }
            }
        }

        // Locally-stable-but-undelivered messages are assumed failed: if this
        // node sent one, re-attempt it in the new view; otherwise reclaim the
        // buffer. A higher layer performs ragged-edge cleanup as needed.
        let old_subgroups: Vec<SubgroupId> = old_state.locally_stable.keys().copied().collect();
        for subgroup in old_subgroups {
            let my_old_slot = old_core
                .geometry
                .bindings
                .get(&subgroup)
                .and_then(|b| b.sender_slot);
            let Some(stable) = old_state.locally_stable.remove(&subgroup) else {
                continue;
            };
            let still_bound = new_core.geometry.bindings.contains_key(&subgroup);
            let still_sender = new_core
                .geometry
                .bindings
                .get(&subgroup)
                .is_some_and(|b| b.sender_slot.is_some());
            for (_seq, msg) in stable {
                if msg.is_placeholder() {
                    continue;
                }
                if my_old_slot.is_some() && Some(msg.sender_rank) == my_old_slot && still_sender {
                    let converted = Self::convert_message(new_core, &mut new_state, subgroup, msg);
                    if let Some(queue) = new_state.pending_sends.get_mut(&subgroup) {
                        queue.push_back(converted);
                    }
                } else if let Some(buffer) = msg.buffer {
                    if still_bound {
                        new_state.pool.release(subgroup, buffer);
                    }
                }
            }
        }

        // Everything this node had queued to send is re-attempted in order:
        // in-flight first, then the submitted backlog, then the staged slot.
        // A subgroup this node no longer sends in reclaims the buffers
        // instead.
        for (&subgroup, binding) in &new_core.geometry.bindings {
            let still_sender = binding.sender_slot.is_some();
            let mut reattempt = Vec::new();
            if let Some(msg) = old_state.current_sends.remove(&subgroup) {
                reattempt.push(msg);
            }
            if let Some(mut backlog) = old_state.pending_sends.remove(&subgroup) {
                while let Some(msg) = backlog.pop_front() {
                    reattempt.push(msg);
                }
            }
            let staged = old_state.next_sends.remove(&subgroup);

            for msg in reattempt {
                if still_sender {
                    let converted = Self::convert_message(new_core, &mut new_state, subgroup, msg);
                    if let Some(queue) = new_state.pending_sends.get_mut(&subgroup) {
                        queue.push_back(converted);
                    }
                } else if let Some(buffer) = msg.buffer {
                    new_state.pool.release(subgroup, buffer);
                }
            }
            if let Some(msg) = staged {
                if still_sender {
                    let converted = Self::convert_message(new_core, &mut new_state, subgroup, msg);
                    new_state.next_sends.insert(subgroup, converted);
                } else if let Some(buffer) = msg.buffer {
                    new_state.pool.release(subgroup, buffer);
                }
            }
        }

        // Delivered-but-unpersisted messages from every subgroup keep their
        // keys; the rewired confirmation upcall finds them by (subgroup, seq)
        // regardless of view.
        for (subgroup, parked) in old_state.non_persistent.drain() {
            new_state
                .non_persistent
                .entry(subgroup)
                .or_default()
                .extend(parked);
        }
    }

    /// Renumber a re-attempted message for the new view, preserving the pause
    /// turns its header carries.
    fn convert_message(
        new_core: &GroupCore,
        new_state: &mut MessageState,
        subgroup: SubgroupId,
        mut msg: message::Message,
    ) -> message::Message {
        if let Some(slot) = new_core
            .geometry
            .bindings
            .get(&subgroup)
            .and_then(|b| b.sender_slot)
        {
            msg.sender_rank = slot;
        }
        if let Some(index) = new_state.future_message_indices.get_mut(&subgroup) {
            msg.index = *index;
            *index += 1;
            if let Some(buffer) = &msg.buffer {
                if let Some(header) = Header::decode(buffer.region().as_slice(0, HEADER_SIZE)) {
                    *index += i64::from(header.pause_sending_turns);
                }
            }
        }
        msg
    }

    fn finish(core: Arc<GroupCore>, already_failed: &[bool]) -> Result<Self> {
        // Publish a clean row before anyone can observe this view's counters.
        let table = core.sst.table();
        table.init_row(core.sst.row(), core.view.vid);
        table.put_all();
        table.sync_with_members();

        if already_failed.iter().any(|&failed| failed) {
            log::warn!(
                "[GROUP] view {} installed with failed members; transport groups not created",
                core.view.vid
            );
        } else {
            let ok = receive::create_transport_groups(&core);
            core.groups_created.store(ok, Ordering::Release);
            if !ok {
                log::warn!(
                    "[GROUP] transport-group creation refused in view {}; group accepts no sends",
                    core.view.vid
                );
            }
        }

        delivery::register_predicates(&core);

        let sender_core = Arc::clone(&core);
        let sender_thread = std::thread::spawn(move || sender::send_loop(&sender_core));
        let heartbeat_core = Arc::clone(&core);
        let heartbeat_thread = std::thread::spawn(move || heartbeat_loop(&heartbeat_core));

        Ok(Self {
            core,
            sender_thread: Some(sender_thread),
            heartbeat_thread: Some(heartbeat_thread),
        })
    }

    /// Stage a message of `payload_size` bytes for `subgroup` and return a
    /// writable view of its payload. A `payload_size` of zero requests the
    /// full buffer, for callers that only know the final size later.
    ///
    /// Returns `None` on back-pressure (window full against a peer, free
    /// pool empty, a previously staged message not yet submitted), oversize
    /// payloads, a wedged group, or when transport groups were not created.
    /// Back-pressured callers are expected to retry.
    pub fn get_send_buffer(
        &self,
        subgroup: SubgroupId,
        payload_size: usize,
        pause_sending_turns: u32,
        cooked_send: bool,
    ) -> Option<SendBuffer> {
        self.core
            .get_send_buffer(subgroup, payload_size, pause_sending_turns, cooked_send)
    }

    /// Submit the staged message of `subgroup` to the sender loop.
    ///
    /// False when nothing is staged, shutdown is in progress, or transport
    /// groups were not created.
    pub fn send(&self, subgroup: SubgroupId) -> bool {
        self.core.submit(subgroup)
    }

    /// Install the dispatcher for cooked messages.
    pub fn set_rpc_callback(&self, callback: Arc<RpcCallback>) {
        *self.core.rpc_callback.lock() = Some(callback);
    }

    /// Stop receives and sends, remove SST predicates, destroy this view's
    /// transport groups, and join the sender loop. Idempotent.
    pub fn wedge(&mut self) {
        self.core.wedge();
        if let Some(handle) = self.sender_thread.take() {
            let _ = handle.join();
        }
    }

    /// Whether the group has been wedged.
    #[must_use]
    pub fn is_wedged(&self) -> bool {
        self.core.shutdown.load(Ordering::Acquire)
    }

    /// Whether transport groups were created for this view.
    #[must_use]
    pub fn transport_groups_created(&self) -> bool {
        self.core.groups_created.load(Ordering::Acquire)
    }

    /// The view this group was built for.
    #[must_use]
    pub fn view(&self) -> &View {
        &self.core.view
    }

    /// The group's immutable configuration.
    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.core.config
    }

    /// Buffer ownership snapshot for one subgroup, `None` when this node is
    /// not a member of it. The total is invariant over the view's life.
    #[must_use]
    pub fn buffer_census(&self, subgroup: SubgroupId) -> Option<BufferCensus> {
        if !self.core.geometry.bindings.contains_key(&subgroup) {
            return None;
        }
        Some(self.core.state.lock().census(subgroup))
    }

    /// Render the SST and this node's position for diagnostics.
    #[must_use]
    pub fn debug_dump(&self) -> String {
        format!(
            "view {} members {:?} rank {} ({} SST rows)\n{}",
            self.core.view.vid,
            self.core.view.members,
            self.core.view.my_rank,
            self.core.sst.table().num_rows(),
            self.core.sst.table().dump(),
        )
    }
}

impl Drop for MulticastGroup {
    fn drop(&mut self) {
        self.wedge();
        if let Some(handle) = self.heartbeat_thread.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for MulticastGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastGroup")
            .field("vid", &self.core.view.vid)
            .field("rank", &self.core.view.my_rank)
            .field("subgroups", &self.core.my_subgroups)
            .field("wedged", &self.is_wedged())
            .finish()
    }
}

/// Publish a liveness tick every `timeout_ms`; the membership service's
/// watchdog concludes failure when a cell stops changing.
fn heartbeat_loop(core: &GroupCore) {
    let table = core.sst.table();
    let everyone: Vec<usize> = (0..table.num_rows()).collect();
    while !core.shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(core.config.timeout_ms));
        table.bump_heartbeat(core.sst.row());
        table.put(&everyone, CellRange::Heartbeat);
    }
    log::debug!("[GROUP] heartbeat loop shutting down");
}
