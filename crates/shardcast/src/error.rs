// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Errors returned by shardcast operations.
//!
//! Fallible construction and persistence paths return [`Result`]. Hot-path
//! "not now" outcomes (window full, pool empty, nothing staged) are expressed
//! as `Option`/`bool` on the send entry points instead; see
//! [`crate::group::MulticastGroup::get_send_buffer`].

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by group construction, membership binding, and the
/// persistence bridge.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration / membership
    // ========================================================================
    /// Group parameters failed validation (zero window, zero block size, ...).
    InvalidConfig(String),
    /// A node id referenced by the membership function is not in the view.
    UnknownMember(u32),
    /// The shared state table was sized for a different view geometry.
    SstGeometryMismatch {
        /// Subgroup count and receive-slot count the table was built with.
        table: (usize, usize),
        /// Subgroup count and receive-slot count this view requires.
        view: (usize, usize),
    },

    // ========================================================================
    // Persistence
    // ========================================================================
    /// The persistent log could not be opened or written.
    PersistenceIo(std::io::Error),
    /// A record in the persistent log failed to decode at the given offset.
    CorruptRecord(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "Invalid group config: {}", msg),
            Error::UnknownMember(id) => write!(f, "Node {} is not a member of the view", id),
            Error::SstGeometryMismatch { table, view } => write!(
                f,
                "SST geometry mismatch: table has {} subgroups / {} receive slots, \
                 view requires {} / {}",
                table.0, table.1, view.0, view.1
            ),
            Error::PersistenceIo(e) => write!(f, "Persistent log I/O error: {}", e),
            Error::CorruptRecord(offset) => {
                write!(f, "Corrupt persistent-log record at offset {}", offset)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::PersistenceIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::PersistenceIo(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = Error::InvalidConfig("window_size must be >= 1".into());
        assert!(e.to_string().contains("window_size"));

        let e = Error::UnknownMember(42);
        assert!(e.to_string().contains("42"));

        let e = Error::SstGeometryMismatch {
            table: (1, 3),
            view: (2, 6),
        };
        let msg = e.to_string();
        assert!(msg.contains("1 subgroups") && msg.contains("2 / 6"));
    }

    #[test]
    fn test_io_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: Error = io.into();
        assert!(std::error::Error::source(&e).is_some());
    }
}
