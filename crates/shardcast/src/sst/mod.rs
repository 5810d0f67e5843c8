// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared state table (SST).
//!
//! A row-per-node table of monotonic counters. Each node writes only its own
//! row and reads every row; a [`SharedStateTable::put`] publishes a cell
//! range to a target set of members. The multicast core consumes this
//! contract; an RDMA-backed table would satisfy it remotely, while this
//! in-process realization shares the rows directly and publication reduces
//! to a fence plus an executor wake.
//!
//! Row layout:
//! - `num_received[slot]` per (subgroup, sender-slot)
//! - `seq_num`, `stable_num`, `delivered_num`, `persisted_num` per subgroup
//! - `heartbeat` liveness tick
//! - `vid` view id
//!
//! All counters initialize to -1.

pub mod predicates;

use std::sync::atomic::{fence, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::membership::{NodeId, SubgroupLayout};
use predicates::ExecutorSignal;

pub use predicates::{NodeSst, PredicateHandle, PredicateType};

/// Row geometry: how many per-subgroup columns and receive slots each row
/// carries. Must match the view geometry the group is constructed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SstLayout {
    /// Number of subgroups (width of the seq/stable/delivered/persisted
    /// column groups).
    pub subgroups: usize,
    /// Width of the `num_received` segment: sum over subgroups of the
    /// largest shard size.
    pub receive_slots: usize,
}

impl SstLayout {
    /// Derive the layout for a member list under a membership function.
    ///
    /// Deterministic in its arguments, so the membership service computes
    /// the same layout on every node before the table is built.
    #[must_use]
    pub fn derive(members: &[NodeId], layout: &dyn SubgroupLayout) -> Self {
        let n = members.len();
        let subgroups = layout.num_subgroups(n);
        let mut receive_slots = 0usize;
        for subgroup in 0..subgroups {
            let mut max_senders = 0usize;
            for shard in 0..layout.num_shards(n, subgroup) {
                max_senders = max_senders.max(layout.shard_senders(members, subgroup, shard).len());
            }
            receive_slots += max_senders;
        }
        Self {
            subgroups: subgroups as usize,
            receive_slots,
        }
    }
}

/// One published cell range. The in-process table shares memory, so the
/// range only selects what a remote backend would ship; it is carried for
/// contract fidelity and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRange {
    /// One `num_received` slot.
    NumReceived(usize),
    /// `seq_num` of one subgroup.
    SeqNum(u32),
    /// `stable_num` of one subgroup.
    StableNum(u32),
    /// `delivered_num` of one subgroup.
    DeliveredNum(u32),
    /// `persisted_num` of one subgroup.
    PersistedNum(u32),
    /// The heartbeat tick.
    Heartbeat,
    /// The whole row.
    Row,
}

struct SstRow {
    num_received: Vec<AtomicI64>,
    seq_num: Vec<AtomicI64>,
    stable_num: Vec<AtomicI64>,
    delivered_num: Vec<AtomicI64>,
    persisted_num: Vec<AtomicI64>,
    heartbeat: AtomicU64,
    vid: AtomicU32,
}

impl SstRow {
    fn new(layout: &SstLayout) -> Self {
        let minus_one = |n: usize| (0..n).map(|_| AtomicI64::new(-1)).collect::<Vec<_>>();
        Self {
            num_received: minus_one(layout.receive_slots),
            seq_num: minus_one(layout.subgroups),
            stable_num: minus_one(layout.subgroups),
            delivered_num: minus_one(layout.subgroups),
            persisted_num: minus_one(layout.subgroups),
            heartbeat: AtomicU64::new(0),
            vid: AtomicU32::new(0),
        }
    }

    fn reset(&self) {
        let wipe = |cells: &[AtomicI64]| {
            for c in cells {
                c.store(-1, Ordering::Release);
            }
        };
        wipe(&self.num_received);
        wipe(&self.seq_num);
        wipe(&self.stable_num);
        wipe(&self.delivered_num);
        wipe(&self.persisted_num);
        self.heartbeat.store(0, Ordering::Release);
    }
}

/// The shared table. One instance per view, shared by every member's
/// [`NodeSst`] handle.
pub struct SharedStateTable {
    layout: SstLayout,
    rows: Vec<SstRow>,
    signals: Vec<Arc<ExecutorSignal>>,
}

impl SharedStateTable {
    /// Build a table of `num_rows` rows with the given layout.
    #[must_use]
    pub fn new(layout: SstLayout, num_rows: usize) -> Arc<Self> {
        Arc::new(Self {
            layout,
            rows: (0..num_rows).map(|_| SstRow::new(&layout)).collect(),
            signals: (0..num_rows)
                .map(|_| Arc::new(ExecutorSignal::new()))
                .collect(),
        })
    }

    /// Row geometry.
    #[must_use]
    pub fn layout(&self) -> SstLayout {
        self.layout
    }

    /// Number of rows (members).
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    // ========================================================================
    // Cell accessors. Writers touch only their own row; that discipline is
    // the caller's (it is what the RDMA table enforces physically).
    // ========================================================================

    #[must_use]
    pub fn num_received(&self, row: usize, slot: usize) -> i64 {
        self.rows[row].num_received[slot].load(Ordering::Acquire)
    }

    pub fn set_num_received(&self, row: usize, slot: usize, value: i64) {
        self.rows[row].num_received[slot].store(value, Ordering::Release);
    }

    #[must_use]
    pub fn seq_num(&self, row: usize, subgroup: u32) -> i64 {
        self.rows[row].seq_num[subgroup as usize].load(Ordering::Acquire)
    }

    pub fn set_seq_num(&self, row: usize, subgroup: u32, value: i64) {
        self.rows[row].seq_num[subgroup as usize].store(value, Ordering::Release);
    }

    #[must_use]
    pub fn stable_num(&self, row: usize, subgroup: u32) -> i64 {
        self.rows[row].stable_num[subgroup as usize].load(Ordering::Acquire)
    }

    pub fn set_stable_num(&self, row: usize, subgroup: u32, value: i64) {
        self.rows[row].stable_num[subgroup as usize].store(value, Ordering::Release);
    }

    #[must_use]
    pub fn delivered_num(&self, row: usize, subgroup: u32) -> i64 {
        self.rows[row].delivered_num[subgroup as usize].load(Ordering::Acquire)
    }

    pub fn set_delivered_num(&self, row: usize, subgroup: u32, value: i64) {
        self.rows[row].delivered_num[subgroup as usize].store(value, Ordering::Release);
    }

    #[must_use]
    pub fn persisted_num(&self, row: usize, subgroup: u32) -> i64 {
        self.rows[row].persisted_num[subgroup as usize].load(Ordering::Acquire)
    }

    pub fn set_persisted_num(&self, row: usize, subgroup: u32, value: i64) {
        self.rows[row].persisted_num[subgroup as usize].store(value, Ordering::Release);
    }

    #[must_use]
    pub fn heartbeat(&self, row: usize) -> u64 {
        self.rows[row].heartbeat.load(Ordering::Acquire)
    }

    /// Advance the liveness tick; a stalled node's cell stops changing.
    pub fn bump_heartbeat(&self, row: usize) {
        self.rows[row].heartbeat.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn vid(&self, row: usize) -> u32 {
        self.rows[row].vid.load(Ordering::Acquire)
    }

    pub fn set_vid(&self, row: usize, vid: u32) {
        self.rows[row].vid.store(vid, Ordering::Release);
    }

    /// Reset a row to construction state (all counters -1) and stamp the
    /// view id. Called once per view by the owning member before
    /// [`SharedStateTable::sync_with_members`].
    pub fn init_row(&self, row: usize, vid: u32) {
        self.rows[row].reset();
        self.set_vid(row, vid);
    }

    // ========================================================================
    // Publication
    // ========================================================================

    /// Publish a cell range of the caller's row to `targets`.
    ///
    /// The acquire-release fence orders every prior counter mutation before
    /// the wake, so a woken executor observes a consistent row.
    pub fn put(&self, targets: &[usize], range: CellRange) {
        let _ = range;
        fence(Ordering::AcqRel);
        for &t in targets {
            if let Some(signal) = self.signals.get(t) {
                signal.notify();
            }
        }
    }

    /// Publish the caller's whole row to every member.
    pub fn put_all(&self) {
        fence(Ordering::AcqRel);
        for signal in &self.signals {
            signal.notify();
        }
    }

    /// Force table consistency across members at startup. The in-process
    /// table is always consistent; waking every executor makes freshly
    /// registered predicates observe the initialized rows promptly.
    pub fn sync_with_members(&self) {
        self.put_all();
    }

    /// The executor wake signal of one row; used by [`NodeSst`].
    #[must_use]
    pub(crate) fn signal(&self, row: usize) -> Arc<ExecutorSignal> {
        Arc::clone(&self.signals[row])
    }

    /// Render every row for diagnostics.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for (i, row) in self.rows.iter().enumerate() {
            let cells = |v: &[AtomicI64]| {
                v.iter()
                    .map(|c| c.load(Ordering::Acquire).to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            };
            let _ = writeln!(
                out,
                "row {} vid={} hb={} nr=[{}] seq=[{}] stable=[{}] delivered=[{}] persisted=[{}]",
                i,
                row.vid.load(Ordering::Acquire),
                row.heartbeat.load(Ordering::Acquire),
                cells(&row.num_received),
                cells(&row.seq_num),
                cells(&row.stable_num),
                cells(&row.delivered_num),
                cells(&row.persisted_num),
            );
        }
        out
    }
}

impl std::fmt::Debug for SharedStateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStateTable")
            .field("layout", &self.layout)
            .field("rows", &self.rows.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::FullMembershipLayout;

    fn table3() -> Arc<SharedStateTable> {
        SharedStateTable::new(
            SstLayout {
                subgroups: 1,
                receive_slots: 3,
            },
            3,
        )
    }

    #[test]
    fn test_layout_derive_full_membership() {
        let layout = SstLayout::derive(
            &[1, 2, 3],
            &FullMembershipLayout {
                subgroups: 2,
                senders: None,
            },
        );
        assert_eq!(layout.subgroups, 2);
        assert_eq!(layout.receive_slots, 6);

        // Designated senders shrink the receive segment.
        let layout = SstLayout::derive(&[1, 2, 3], &FullMembershipLayout::with_senders(vec![1]));
        assert_eq!(layout.receive_slots, 1);
    }

    #[test]
    fn test_cells_initialize_to_minus_one() {
        let t = table3();
        for row in 0..3 {
            assert_eq!(t.seq_num(row, 0), -1);
            assert_eq!(t.stable_num(row, 0), -1);
            assert_eq!(t.delivered_num(row, 0), -1);
            assert_eq!(t.persisted_num(row, 0), -1);
            for slot in 0..3 {
                assert_eq!(t.num_received(row, slot), -1);
            }
            assert_eq!(t.heartbeat(row), 0);
        }
    }

    #[test]
    fn test_row_writes_visible_after_put() {
        let t = table3();
        t.set_seq_num(1, 0, 5);
        t.set_num_received(1, 1, 2);
        t.put(&[0, 2], CellRange::SeqNum(0));
        assert_eq!(t.seq_num(1, 0), 5);
        assert_eq!(t.num_received(1, 1), 2);
    }

    #[test]
    fn test_init_row_resets_counters_and_stamps_vid() {
        let t = table3();
        t.set_seq_num(2, 0, 9);
        t.bump_heartbeat(2);
        t.init_row(2, 7);
        assert_eq!(t.seq_num(2, 0), -1);
        assert_eq!(t.heartbeat(2), 0);
        assert_eq!(t.vid(2), 7);
        // Other rows untouched.
        assert_eq!(t.vid(0), 0);
    }

    #[test]
    fn test_heartbeat_tick_is_monotonic() {
        let t = table3();
        t.bump_heartbeat(0);
        t.bump_heartbeat(0);
        assert_eq!(t.heartbeat(0), 2);
    }

    #[test]
    fn test_dump_includes_every_row() {
        let t = table3();
        t.set_seq_num(0, 0, 3);
        let dump = t.dump();
        assert_eq!(dump.lines().count(), 3);
        assert!(dump.contains("seq=[3]"));
    }
}
