// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable block-multicast transport contract.
//!
//! The core consumes this contract and never owns sockets or verbs itself.
//! A conforming transport guarantees that each send on a correct sender is
//! either entirely received by every correct group member or not at all, and
//! preserves FIFO order per (group, sender).
//!
//! # Modules
//!
//! - `loopback` - in-process transport for tests and single-host development

pub mod loopback;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::MemoryRegion;
use crate::membership::NodeId;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

/// Identifier of one transport group. Numbered from a per-view offset so ids
/// never collide across views.
pub type TransportGroupId = u32;

/// Dissemination algorithm, forwarded opaquely to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendAlgorithm {
    /// Binomial-tree pipelined dissemination.
    #[default]
    BinomialSend,
    /// Chain dissemination.
    ChainSend,
    /// Sequential unicast to each member.
    SequentialSend,
    /// Plain tree dissemination.
    TreeSend,
}

/// A receive target inside pre-registered memory, produced by the
/// destination callback when an incoming message is announced.
pub struct ReceiveDestination {
    /// Registered region the transport writes into.
    pub region: Arc<MemoryRegion>,
    /// Byte offset of the write target within the region.
    pub offset: usize,
}

/// Supplies a receive target for an announced message of the given size.
/// Returning `None` means the receiver cannot accept the message; the
/// transport treats this as a fatal group error.
pub type DestinationCallback = Box<dyn Fn(usize) -> Option<ReceiveDestination> + Send + Sync>;

/// Runs after a message is fully received; the slice spans the complete
/// message, header included.
pub type CompletionCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Runs on the sender after a send completes group-wide.
pub type SendDoneCallback = Box<dyn Fn(Option<u32>) + Send + Sync>;

/// Reliable one-to-many block transport, registered per (group, sender).
pub trait BlockTransport: Send + Sync {
    /// Register this node in group `group` with `members` listed in
    /// dissemination order (sender first). Returns false when the group
    /// cannot be created, e.g. a listed member is unreachable or another
    /// member registered a conflicting membership.
    fn create_group(
        &self,
        group: TransportGroupId,
        members: &[NodeId],
        block_size: usize,
        algorithm: SendAlgorithm,
        destination: DestinationCallback,
        completion: CompletionCallback,
        send_done: SendDoneCallback,
    ) -> bool;

    /// Multicast `size` bytes of `source` starting at `offset` to every
    /// member of `group`. Returns false on transport failure; the core
    /// treats that as fatal to the group.
    fn send(
        &self,
        group: TransportGroupId,
        source: &Arc<MemoryRegion>,
        offset: usize,
        size: usize,
    ) -> bool;

    /// Remove this node's registration from `group`.
    fn destroy_group(&self, group: TransportGroupId);
}
