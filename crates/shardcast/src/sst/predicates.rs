// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recurrent SST predicates and the per-node executor worker.
//!
//! A predicate pairs a read-only condition over the table with a trigger run
//! when the condition holds. The executor evaluates registered predicates
//! serially per tick, on every publication wake and at a steady idle cadence
//! so recurrent predicates always make progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::SharedStateTable;

/// Idle executor cadence between publication wakes.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Read-only condition over the table.
pub type Predicate = Box<dyn Fn(&SharedStateTable) -> bool + Send>;

/// Action run when its predicate holds.
pub type Trigger = Box<dyn FnMut(&SharedStateTable) + Send>;

/// Whether a predicate stays registered after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateType {
    /// Evaluated on every tick for as long as it is registered.
    Recurrent,
    /// Removed after its first firing.
    OneShot,
}

/// Handle to a registered predicate.
///
/// Encoded as: upper 32 bits = generation, lower 32 bits = slot index, so a
/// stale handle can never remove a successor occupying the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredicateHandle(u64);

impl PredicateHandle {
    fn new(generation: u32, slot: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(slot))
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    fn slot(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }
}

struct PredicateEntry {
    generation: u32,
    kind: PredicateType,
    predicate: Predicate,
    trigger: Trigger,
}

/// Slot-reusing predicate store. Insert and remove are O(1); iteration is in
/// slot order, which matches insertion order while no slot has been reused.
#[derive(Default)]
struct PredicateSlab {
    slots: Vec<Option<PredicateEntry>>,
    free: Vec<u32>,
    next_generation: u32,
}

impl PredicateSlab {
    fn insert(&mut self, predicate: Predicate, trigger: Trigger, kind: PredicateType) -> PredicateHandle {
        self.next_generation = self.next_generation.wrapping_add(1);
        let entry = PredicateEntry {
            generation: self.next_generation,
            kind,
            predicate,
            trigger,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                (self.slots.len() - 1) as u32
            }
        };
        PredicateHandle::new(self.next_generation, slot)
    }

    fn remove(&mut self, handle: PredicateHandle) -> bool {
        let slot = handle.slot();
        match self.slots.get(slot) {
            Some(Some(entry)) if entry.generation == handle.generation() => {
                self.slots[slot] = None;
                self.free.push(slot as u32);
                true
            }
            _ => false,
        }
    }

    fn run_tick(&mut self, table: &SharedStateTable) {
        for slot in 0..self.slots.len() {
            let fired = match &mut self.slots[slot] {
                Some(entry) => {
                    if (entry.predicate)(table) {
                        (entry.trigger)(table);
                        entry.kind == PredicateType::OneShot
                    } else {
                        false
                    }
                }
                None => false,
            };
            if fired {
                self.slots[slot] = None;
                self.free.push(slot as u32);
            }
        }
    }
}

/// Wake notification for the executor: atomic fast path, condvar sleep.
pub(crate) struct ExecutorSignal {
    pending: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl ExecutorSignal {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Mark work pending; signal the condvar only if the executor might be
    /// asleep. The racy read is safe, worst case is an extra signal.
    pub(crate) fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Wait until notified or `timeout` elapses. Returns immediately when a
    /// notification is already pending.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::Acquire) {
            return true;
        }
        let mut sleeping = self.sleeping.lock();
        if self.pending.swap(false, Ordering::Acquire) {
            return true;
        }
        *sleeping = true;
        let result = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;
        if self.pending.swap(false, Ordering::Acquire) {
            !result.timed_out()
        } else {
            false
        }
    }
}

/// One node's handle onto the shared table: its row, its predicate registry,
/// and the executor worker that runs registered triggers.
pub struct NodeSst {
    table: Arc<SharedStateTable>,
    row: usize,
    slab: Arc<Mutex<PredicateSlab>>,
    stop: Arc<AtomicBool>,
    executor: Option<JoinHandle<()>>,
}

impl NodeSst {
    /// Attach to `row` of `table` and start the predicate executor.
    #[must_use]
    pub fn start(table: Arc<SharedStateTable>, row: usize) -> Self {
        let slab = Arc::new(Mutex::new(PredicateSlab::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let signal = table.signal(row);

        let thread_table = Arc::clone(&table);
        let thread_slab = Arc::clone(&slab);
        let thread_stop = Arc::clone(&stop);
        let executor = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                signal.wait_timeout(TICK_INTERVAL);
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }
                thread_slab.lock().run_tick(&thread_table);
            }
            log::debug!("[SST] predicate executor for row {} shutting down", row);
        });

        Self {
            table,
            row,
            slab,
            stop,
            executor: Some(executor),
        }
    }

    /// The shared table.
    #[must_use]
    pub fn table(&self) -> &Arc<SharedStateTable> {
        &self.table
    }

    /// This node's row index.
    #[must_use]
    pub fn row(&self) -> usize {
        self.row
    }

    /// Register a predicate; the executor evaluates it from the next tick.
    pub fn insert_predicate(
        &self,
        predicate: Predicate,
        trigger: Trigger,
        kind: PredicateType,
    ) -> PredicateHandle {
        self.slab.lock().insert(predicate, trigger, kind)
    }

    /// Deregister a predicate. Returns false for a stale or unknown handle.
    pub fn remove_predicate(&self, handle: PredicateHandle) -> bool {
        self.slab.lock().remove(handle)
    }
}

impl Drop for NodeSst {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.table.signal(self.row).notify();
        if let Some(handle) = self.executor.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for NodeSst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSst").field("row", &self.row).finish()
    }
}
