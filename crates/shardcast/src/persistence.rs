// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent message log.
//!
//! When a group is configured with a log path, delivered messages are handed
//! to a dedicated writer thread and their buffers are only reclaimed - and
//! `persisted_num` only published - once the record is durably on disk.
//!
//! On-disk format, appended in delivery order, little-endian:
//!
//! ```text
//! record := { len:u32 | view_id:u32 | sender_id:u32 | index:u64 | cooked:u8 | payload:byte[len] }
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::buffer::MemoryRegion;
use crate::error::{Error, Result};
use crate::membership::{NodeId, SubgroupId};

/// Fixed bytes preceding each record's payload.
pub const RECORD_HEADER_SIZE: usize = 21;

/// Descriptor handed to the writer at delivery time. The payload stays in
/// the message's parked buffer; the descriptor only references it.
pub(crate) struct PersistRecord {
    pub subgroup: SubgroupId,
    /// Sequence number the message is parked under in
    /// `non_persistent_messages`; the confirmation upcall uses it to find
    /// and reclaim the buffer.
    pub seq: i64,
    pub view_id: u32,
    pub sender_id: NodeId,
    pub sender_rank: u32,
    pub index: i64,
    pub cooked: bool,
    pub region: Arc<MemoryRegion>,
    pub payload_offset: usize,
    pub payload_len: usize,
}

/// Runs after a record is durably written.
pub(crate) type ConfirmUpcall = Box<dyn Fn(&PersistRecord) + Send>;

enum WriterCmd {
    Append(PersistRecord),
    Shutdown,
}

/// Append-only log with a background writer thread.
///
/// The writer survives view changes: the handover constructor moves the log
/// into the new group and rewires the confirmation upcall.
pub(crate) struct PersistentLog {
    tx: Sender<WriterCmd>,
    confirm: Arc<Mutex<Option<ConfirmUpcall>>>,
    writer: Option<JoinHandle<()>>,
}

impl PersistentLog {
    /// Open (or create) the log at `path` and start the writer.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = unbounded::<WriterCmd>();
        let confirm: Arc<Mutex<Option<ConfirmUpcall>>> = Arc::new(Mutex::new(None));

        let thread_confirm = Arc::clone(&confirm);
        let writer = std::thread::spawn(move || {
            let mut out = BufWriter::new(file);
            for cmd in rx {
                match cmd {
                    WriterCmd::Append(record) => match write_record(&mut out, &record) {
                        Ok(()) => {
                            // Holding the slot across the upcall is what lets
                            // a view handover quiesce confirmations while it
                            // moves parked messages between groups.
                            let slot = thread_confirm.lock();
                            match slot.as_ref() {
                                Some(cb) => cb(&record),
                                None => log::warn!(
                                    "[PLOG] record (subgroup {}, seq {}) written with no \
                                     confirmation upcall installed",
                                    record.subgroup,
                                    record.seq
                                ),
                            }
                        }
                        Err(e) => log::error!(
                            "[PLOG] append failed for (subgroup {}, seq {}): {}; not confirmed",
                            record.subgroup,
                            record.seq,
                            e
                        ),
                    },
                    WriterCmd::Shutdown => break,
                }
            }
            log::debug!("[PLOG] writer shutting down");
        });

        Ok(Self {
            tx,
            confirm,
            writer: Some(writer),
        })
    }

    /// Install the confirmation upcall.
    pub fn set_confirm_upcall(&self, upcall: ConfirmUpcall) {
        *self.confirm.lock() = Some(upcall);
    }

    /// Swap the confirmation upcall, running `critical` while confirmations
    /// are quiesced: any confirmation in flight completes first, and none
    /// runs until `critical` returns and the new upcall is installed.
    pub fn swap_confirm_upcall_during<F: FnOnce()>(&self, upcall: ConfirmUpcall, critical: F) {
        let mut slot = self.confirm.lock();
        critical();
        *slot = Some(upcall);
    }

    /// Queue a record for durable append. The channel is unbounded; depth is
    /// naturally capped by the buffer pool, since every queued record keeps
    /// its message parked until confirmation.
    pub fn append(&self, record: PersistRecord) {
        if self.tx.send(WriterCmd::Append(record)).is_err() {
            log::error!("[PLOG] writer thread gone; record dropped");
        }
    }
}

impl Drop for PersistentLog {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterCmd::Shutdown);
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

fn write_record(out: &mut BufWriter<File>, record: &PersistRecord) -> std::io::Result<()> {
    // Parked in non_persistent_messages, so no writer is live on the region.
    let payload = record
        .region
        .as_slice(record.payload_offset, record.payload_len);

    out.write_all(&(record.payload_len as u32).to_le_bytes())?;
    out.write_all(&record.view_id.to_le_bytes())?;
    out.write_all(&record.sender_id.to_le_bytes())?;
    out.write_all(&(record.index as u64).to_le_bytes())?;
    out.write_all(&[u8::from(record.cooked)])?;
    out.write_all(payload)?;
    out.flush()?;
    out.get_ref().sync_data()
}

/// One decoded record of a persistent log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    /// View in which the message was delivered.
    pub view_id: u32,
    /// Sender's node id.
    pub sender_id: NodeId,
    /// Sender-local message index.
    pub index: u64,
    /// Whether the payload was destined for the RPC dispatcher.
    pub cooked: bool,
    /// Message payload, header excluded.
    pub payload: Vec<u8>,
}

/// Decode a whole log file, in append order.
pub fn read_log(path: &Path) -> Result<Vec<PersistedRecord>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < RECORD_HEADER_SIZE {
            return Err(Error::CorruptRecord(offset as u64));
        }
        let field_u32 = |at: usize| {
            u32::from_le_bytes(bytes[at..at + 4].try_into().expect("4-byte slice"))
        };
        let len = field_u32(offset) as usize;
        let view_id = field_u32(offset + 4);
        let sender_id = field_u32(offset + 8);
        let index = u64::from_le_bytes(
            bytes[offset + 12..offset + 20]
                .try_into()
                .expect("8-byte slice"),
        );
        let cooked = bytes[offset + 20] != 0;
        let payload_start = offset + RECORD_HEADER_SIZE;
        if bytes.len() - payload_start < len {
            return Err(Error::CorruptRecord(offset as u64));
        }
        records.push(PersistedRecord {
            view_id,
            sender_id,
            index,
            cooked,
            payload: bytes[payload_start..payload_start + len].to_vec(),
        });
        offset = payload_start + len;
    }
    Ok(records)
}
