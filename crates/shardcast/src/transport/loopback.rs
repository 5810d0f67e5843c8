// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process block transport.
//!
//! One [`LoopbackNetwork`] is shared by every simulated node; each node holds
//! a [`LoopbackTransport`] endpoint bound to its id. Delivery is synchronous
//! on the sending thread, which trivially preserves FIFO per (group, sender)
//! and all-or-nothing delivery across registered members.

use std::sync::Arc;

use dashmap::DashMap;

use crate::buffer::MemoryRegion;
use crate::membership::NodeId;

use super::{
    BlockTransport, CompletionCallback, DestinationCallback, ReceiveDestination, SendAlgorithm,
    SendDoneCallback, TransportGroupId,
};

struct Registration {
    node: NodeId,
    destination: DestinationCallback,
    completion: CompletionCallback,
    send_done: SendDoneCallback,
}

struct GroupState {
    members: Vec<NodeId>,
    registrations: Vec<Registration>,
}

/// Shared in-process fabric; create one per simulated deployment.
#[derive(Default)]
pub struct LoopbackNetwork {
    groups: DashMap<TransportGroupId, GroupState>,
}

impl LoopbackNetwork {
    /// Fresh fabric with no groups.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An endpoint bound to `node`; all transport calls made through it act
    /// on behalf of that node.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, node: NodeId) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            node,
            network: Arc::clone(self),
        })
    }

    /// Number of groups with at least one registration.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// One node's endpoint onto a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    node: NodeId,
    network: Arc<LoopbackNetwork>,
}

impl BlockTransport for LoopbackTransport {
    fn create_group(
        &self,
        group: TransportGroupId,
        members: &[NodeId],
        _block_size: usize,
        _algorithm: SendAlgorithm,
        destination: DestinationCallback,
        completion: CompletionCallback,
        send_done: SendDoneCallback,
    ) -> bool {
        if !members.contains(&self.node) {
            log::warn!(
                "[LOOPBACK] node {} tried to join group {} it is not a member of",
                self.node,
                group
            );
            return false;
        }
        let mut entry = self.network.groups.entry(group).or_insert_with(|| GroupState {
            members: members.to_vec(),
            registrations: Vec::new(),
        });
        if entry.members != members {
            log::warn!(
                "[LOOPBACK] group {} membership mismatch: {:?} vs {:?}",
                group,
                entry.members,
                members
            );
            return false;
        }
        if entry.registrations.iter().any(|r| r.node == self.node) {
            log::warn!(
                "[LOOPBACK] node {} already registered in group {}",
                self.node,
                group
            );
            return false;
        }
        entry.registrations.push(Registration {
            node: self.node,
            destination,
            completion,
            send_done,
        });
        true
    }

    fn send(
        &self,
        group: TransportGroupId,
        source: &Arc<MemoryRegion>,
        offset: usize,
        size: usize,
    ) -> bool {
        let Some(state) = self.network.groups.get(&group) else {
            log::error!("[LOOPBACK] send on unknown group {}", group);
            return false;
        };
        // Source bytes were written by the staging caller before send; no
        // writer is live, so this shared read is within the region's
        // single-writer discipline.
        let data = source.as_slice(offset, size);

        // Deliver in dissemination order. A member that never registered is
        // skipped: reliability is promised to correct members only.
        for &member in &state.members {
            let Some(reg) = state.registrations.iter().find(|r| r.node == member) else {
                log::warn!(
                    "[LOOPBACK] group {}: member {} absent, skipping",
                    group,
                    member
                );
                continue;
            };
            if member == self.node {
                (reg.completion)(data);
            } else {
                let Some(ReceiveDestination { region, offset }) = (reg.destination)(size) else {
                    log::error!(
                        "[LOOPBACK] group {}: member {} supplied no receive destination",
                        group,
                        member
                    );
                    return false;
                };
                region.write_at(offset, data);
                (reg.completion)(region.as_slice(offset, size));
            }
        }

        if let Some(me) = state.registrations.iter().find(|r| r.node == self.node) {
            (me.send_done)(None);
        }
        true
    }

    fn destroy_group(&self, group: TransportGroupId) {
        let emptied = match self.network.groups.get_mut(&group) {
            Some(mut state) => {
                state.registrations.retain(|r| r.node != self.node);
                state.registrations.is_empty()
            }
            None => false,
        };
        if emptied {
            self.network.groups.remove(&group);
        }
    }
}
