// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # shardcast - ordered atomic multicast for replicated groups
//!
//! The core of a view-based replicated-group communication system: given a
//! reliable one-to-many block transport and a shared state table visible to
//! all members, shardcast delivers each sender's stream of messages to every
//! correct member of a shard in a single total order, with global stability
//! - and, optionally, durable persistence - observed before delivery.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                          Host application                          |
//! |     stability / persistence / RPC callbacks, send entry points     |
//! +--------------------------------------------------------------------+
//! |                        MulticastGroup (per view)                   |
//! |  buffer pool | sender loop | receive path | stability & delivery   |
//! |  flow control | heartbeat | view handover | persistence bridge     |
//! +--------------------------------------------------------------------+
//! |        Shared state table         |      Block transport           |
//! |  rows of monotonic counters,      |  reliable one-to-many sends,   |
//! |  put + recurrent predicates       |  FIFO per (group, sender)      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Ordering model
//!
//! Within a shard of `S` senders, the message with sender slot `k` and
//! sender-local index `i` owns sequence number `i * S + k`. A message is
//! *locally stable* once fully received, *globally stable* once its sequence
//! number clears the shard-wide minimum `seq_num`, and *deliverable* once it
//! clears the minimum `stable_num`. Delivery publishes `delivered_num`;
//! durable writes publish `persisted_num`. Each counter is monotonic and
//! `delivered_num <= stable_num <= seq_num` holds at every member.
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`MulticastGroup`] | The per-view engine; one instance per installed view |
//! | [`GroupConfig`] | Construction-time parameters (window, block size, ...) |
//! | [`View`] / [`SubgroupLayout`] | Membership snapshot and membership function |
//! | [`SharedStateTable`] / [`NodeSst`] | The SST contract and a node's handle |
//! | [`BlockTransport`] | The reliable block-multicast contract |
//! | [`CallbackSet`] | Delivery and persistence callbacks |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardcast::{
//!     CallbackSet, FullMembershipLayout, GroupConfig, LoopbackNetwork, MulticastGroup,
//!     NodeSst, SharedStateTable, SstLayout, View,
//! };
//!
//! fn main() -> shardcast::Result<()> {
//!     let members = vec![1, 2, 3];
//!     let layout = Arc::new(FullMembershipLayout::single());
//!     let table = SharedStateTable::new(SstLayout::derive(&members, &*layout), members.len());
//!     let network = LoopbackNetwork::new();
//!
//!     let sst = Arc::new(NodeSst::start(Arc::clone(&table), 0));
//!     let callbacks = CallbackSet::new(Arc::new(|subgroup, sender, index, payload| {
//!         println!("delivered {}:{}:{} ({} bytes)", subgroup, sender, index, payload.len());
//!     }));
//!     let group = MulticastGroup::new(
//!         View::new(0, members.clone(), 1)?,
//!         layout,
//!         sst,
//!         network.endpoint(1),
//!         callbacks,
//!         GroupConfig::default(),
//!         &[],
//!     )?;
//!
//!     if let Some(mut buf) = group.get_send_buffer(0, 5, 0, false) {
//!         buf.write(b"hello");
//!         group.send(0);
//!     }
//!     Ok(())
//! }
//! ```

/// Pre-registered message buffers and the per-subgroup free pool.
pub mod buffer;
/// Delivery, persistence, and RPC callback types.
pub mod callbacks;
/// Construction-time group parameters.
pub mod config;
/// Crate error type.
pub mod error;
/// The per-view multicast engine.
pub mod group;
/// Views, the membership function, and per-view geometry.
pub mod membership;
/// Persistent message log (record format, writer, decoder).
pub mod persistence;
/// Shared state table contract and predicate framework.
pub mod sst;
/// Reliable block-multicast transport contract and loopback realization.
pub mod transport;

pub use buffer::{BufferPool, MemoryRegion, MessageBuffer};
pub use callbacks::{CallbackSet, PersistenceCallback, RpcCallback, StabilityCallback};
pub use config::GroupConfig;
pub use error::{Error, Result};
pub use group::message::{Header, HEADER_SIZE};
pub use group::{BufferCensus, MulticastGroup, SendBuffer};
pub use membership::{
    FullMembershipLayout, NodeId, SubgroupBinding, SubgroupId, SubgroupLayout, View, ViewGeometry,
};
pub use persistence::{read_log, PersistedRecord};
pub use sst::{CellRange, NodeSst, PredicateHandle, PredicateType, SharedStateTable, SstLayout};
pub use transport::{
    BlockTransport, LoopbackNetwork, LoopbackTransport, SendAlgorithm, TransportGroupId,
};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
