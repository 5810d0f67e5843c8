// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pre-registered message buffers and the per-subgroup free pool.
//!
//! Buffers are allocated once, at group construction, and cycle between the
//! free pool and the in-flight collections for the rest of the view's life.
//! No allocation happens on the send or receive fast path.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::membership::SubgroupId;

/// A fixed byte region usable as both a send source and a receive
/// destination by the block transport.
///
/// Interior mutability is used so the transport can fill a region handed out
/// as a receive destination while the owning `Message` sits in
/// `current_receives`. Exclusion is by ownership discipline, not by lock:
/// a region is written only by the single staging writer (before `send`) or
/// by the transport (before the completion callback runs), and read only
/// afterwards. The message-state machine keeps each buffer in exactly one
/// collection at a time, which upholds this.
pub struct MemoryRegion {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: MemoryRegion is Send + Sync because all mutation goes through
// write_at under the single-writer discipline documented above; concurrent
// readers only exist once the writer has finished.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Allocate a zeroed region of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    /// Region capacity in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        // SAFETY: only the slice length is read; no byte of the buffer is
        // touched, so this cannot race with a writer.
        unsafe { (&*self.data.get()).len() }
    }

    /// True when the region has zero capacity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `src` into the region at `offset`.
    ///
    /// # Panics
    /// Panics if the copy would run past the end of the region.
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        // SAFETY:
        // 1. The backing slice was allocated in new() and lives as long as
        //    self; the bounds check below keeps the copy inside it.
        // 2. The single-writer discipline (see type docs) guarantees no other
        //    thread writes or reads this range concurrently.
        let data = unsafe { &mut *self.data.get() };
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// View `len` bytes of the region starting at `offset`.
    ///
    /// Callers must only read ranges whose writer has finished (see the type
    /// docs); the message-state machine guarantees this for every read the
    /// core performs.
    ///
    /// # Panics
    /// Panics if the range runs past the end of the region.
    #[must_use]
    pub fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
        // SAFETY: same backing-slice reasoning as write_at; immutable
        // reborrow is sound because the discipline rules out a live writer.
        let data = unsafe { &*self.data.get() };
        &data[offset..offset + len]
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("len", &self.len())
            .finish()
    }
}

/// Owning handle over one registered region.
///
/// Exactly one `MessageBuffer` exists per region; the pool-conservation
/// invariant counts these handles, while `Arc<MemoryRegion>` clones exist
/// only transiently for transport I/O.
#[derive(Debug)]
pub struct MessageBuffer {
    region: Arc<MemoryRegion>,
}

impl MessageBuffer {
    /// Allocate a buffer of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            region: MemoryRegion::new(size),
        }
    }

    /// The underlying registered region.
    #[must_use]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }
}

/// Per-subgroup stacks of free buffers.
///
/// The pool is part of the message state and is guarded by the group's
/// message-state lock; it has no locking of its own.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: HashMap<SubgroupId, Vec<MessageBuffer>>,
}

impl BufferPool {
    /// Empty pool; fill per subgroup with [`BufferPool::fill`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Top up `subgroup`'s stack to `count` buffers of `buffer_size` bytes.
    pub fn fill(&mut self, subgroup: SubgroupId, count: usize, buffer_size: usize) {
        let stack = self.free.entry(subgroup).or_default();
        while stack.len() < count {
            stack.push(MessageBuffer::new(buffer_size));
        }
    }

    /// Pop a free buffer, or `None` when the stack is empty.
    pub fn acquire(&mut self, subgroup: SubgroupId) -> Option<MessageBuffer> {
        self.free.get_mut(&subgroup)?.pop()
    }

    /// Return a buffer to `subgroup`'s stack.
    pub fn release(&mut self, subgroup: SubgroupId, buffer: MessageBuffer) {
        self.free.entry(subgroup).or_default().push(buffer);
    }

    /// Free buffers currently held for `subgroup`.
    #[must_use]
    pub fn available(&self, subgroup: SubgroupId) -> usize {
        self.free.get(&subgroup).map_or(0, Vec::len)
    }

    /// Drain every free buffer held for `subgroup` (view handover).
    pub fn take_all(&mut self, subgroup: SubgroupId) -> Vec<MessageBuffer> {
        self.free.remove(&subgroup).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_write_read_round_trip() {
        let region = MemoryRegion::new(64);
        assert_eq!(region.len(), 64);
        region.write_at(8, b"shardcast");
        assert_eq!(region.as_slice(8, 9), b"shardcast");
        // Untouched bytes stay zeroed.
        assert_eq!(region.as_slice(0, 8), &[0u8; 8]);
    }

    #[test]
    #[should_panic]
    fn test_region_write_out_of_bounds_panics() {
        let region = MemoryRegion::new(4);
        region.write_at(2, b"abc");
    }

    #[test]
    fn test_pool_acquire_release_cycle() {
        let mut pool = BufferPool::new();
        pool.fill(0, 3, 128);
        assert_eq!(pool.available(0), 3);

        let a = pool.acquire(0).expect("pool has buffers");
        let b = pool.acquire(0).expect("pool has buffers");
        assert_eq!(pool.available(0), 1);
        assert_eq!(a.region().len(), 128);

        pool.release(0, a);
        pool.release(0, b);
        assert_eq!(pool.available(0), 3);
    }

    #[test]
    fn test_pool_exhaustion_returns_none() {
        let mut pool = BufferPool::new();
        pool.fill(7, 1, 16);
        let only = pool.acquire(7).expect("one buffer");
        assert!(pool.acquire(7).is_none());
        pool.release(7, only);
        assert!(pool.acquire(7).is_some());
    }

    #[test]
    fn test_pool_fill_is_idempotent_top_up() {
        let mut pool = BufferPool::new();
        pool.fill(1, 2, 32);
        pool.fill(1, 2, 32);
        assert_eq!(pool.available(1), 2);
        pool.fill(1, 4, 32);
        assert_eq!(pool.available(1), 4);
    }

    #[test]
    fn test_take_all_drains_stack() {
        let mut pool = BufferPool::new();
        pool.fill(2, 3, 16);
        let drained = pool.take_all(2);
        assert_eq!(drained.len(), 3);
        assert_eq!(pool.available(2), 0);
        assert!(pool.acquire(2).is_none());
    }
}
