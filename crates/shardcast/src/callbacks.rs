// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback surface exposed to the host.
//!
//! All callbacks run on core-owned or transport-owned threads while the
//! message-state lock is held; they must be short and must not block.

use std::sync::Arc;

use crate::membership::{NodeId, SubgroupId};

/// Invoked once per non-cooked message when it becomes deliverable.
///
/// Arguments: subgroup, sender's shard slot, sender-local index, payload
/// (header excluded).
pub type StabilityCallback = dyn Fn(SubgroupId, u32, i64, &[u8]) + Send + Sync;

/// Invoked once per message after its record is durably written.
///
/// Same arguments as [`StabilityCallback`].
pub type PersistenceCallback = dyn Fn(SubgroupId, u32, i64, &[u8]) + Send + Sync;

/// Invoked once per cooked message when it becomes deliverable.
///
/// Arguments: sender's node id and the payload destined for the RPC
/// dispatcher (header excluded).
pub type RpcCallback = dyn Fn(NodeId, &[u8]) + Send + Sync;

/// The host-supplied delivery callbacks, fixed at group construction and
/// carried across view changes.
#[derive(Clone)]
pub struct CallbackSet {
    /// Global-stability (delivery) callback for raw messages.
    pub global_stability: Arc<StabilityCallback>,
    /// Durable-write callback; only invoked when persistence is configured.
    pub local_persistence: Option<Arc<PersistenceCallback>>,
}

impl CallbackSet {
    /// Callbacks with delivery only (no persistence notification).
    pub fn new(global_stability: Arc<StabilityCallback>) -> Self {
        Self {
            global_stability,
            local_persistence: None,
        }
    }

    /// Attach a durable-write callback.
    #[must_use]
    pub fn with_persistence(mut self, cb: Arc<PersistenceCallback>) -> Self {
        self.local_persistence = Some(cb);
        self
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("local_persistence", &self.local_persistence.is_some())
            .finish()
    }
}
