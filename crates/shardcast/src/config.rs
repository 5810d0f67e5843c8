// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Group configuration.
//!
//! All parameters are fixed at group construction and immutable for the
//! lifetime of a [`crate::group::MulticastGroup`]. A view change constructs a
//! new group that inherits the old configuration unchanged.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::group::message::HEADER_SIZE;
use crate::transport::SendAlgorithm;

/// Default largest payload a single message may carry, in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10_240;

/// Default transport block size, in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 1_048_576;

/// Default per-sender send window, in messages.
pub const DEFAULT_WINDOW_SIZE: usize = 16;

/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1;

/// Construction-time parameters of a multicast group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Largest payload a single message may carry, in bytes.
    pub max_payload_size: usize,
    /// Block size forwarded to the block transport; the per-message buffer
    /// size is rounded up to a multiple of this.
    pub block_size: usize,
    /// Number of messages per sender that may be in flight ahead of the
    /// slowest peer's `delivered_num`. Must be >= 1.
    pub window_size: usize,
    /// Interval between heartbeat publications, in milliseconds.
    pub timeout_ms: u64,
    /// Dissemination algorithm forwarded opaquely to the block transport.
    pub send_algorithm: SendAlgorithm,
    /// Path of the persistent message log. `None` disables persistence and
    /// no persistence callbacks are issued.
    pub persistence_path: Option<std::path::PathBuf>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            send_algorithm: SendAlgorithm::default(),
            persistence_path: None,
        }
    }
}

impl GroupConfig {
    /// Validate the parameter set.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be >= 1".into()));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("block_size must be > 0".into()));
        }
        if self.max_payload_size == 0 {
            return Err(Error::InvalidConfig("max_payload_size must be > 0".into()));
        }
        Ok(())
    }

    /// Size of one message buffer: the largest payload plus the wire header,
    /// rounded up to a whole number of transport blocks.
    #[must_use]
    pub fn max_msg_size(&self) -> usize {
        let raw = self.max_payload_size + HEADER_SIZE;
        raw.div_ceil(self.block_size) * self.block_size
    }

    /// Whether a persistent log is configured.
    #[must_use]
    pub fn persistence_enabled(&self) -> bool {
        self.persistence_path.is_some()
    }
}
