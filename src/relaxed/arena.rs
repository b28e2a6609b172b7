//! Module `arena` implement a segmented store of tree slots.
//!
//! Slots are addressed by stable indices, and never move once allocated.
//! Segment `k` holds `slab_size << k` slots, segments are allocated
//! lazily as the tree grows. Retired slots are recycled through a free
//! list. Index `0` is the sentinel and index `1` is the root position,
//! both are allocated when the arena is created.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Mutex, OnceLock,
    },
    time::Duration,
};

use crate::{
    relaxed::node::{Node, NIL, ROOT},
    util::spinlock::{self, ReadGuard, Spinlock, WriteGuard},
    Result,
};

const MAX_SEGMENTS: usize = 40;

/// A tree position.
pub struct Slot<T> {
    latch: Spinlock<Node<T>>,
    parent: AtomicUsize,
}

impl<T> Slot<T> {
    fn new() -> Slot<T> {
        Slot {
            latch: Spinlock::new(Node::default()),
            parent: AtomicUsize::new(NIL),
        }
    }

    #[inline]
    pub fn read(&self) -> ReadGuard<Node<T>> {
        self.latch.read()
    }

    #[inline]
    pub fn write(&self) -> WriteGuard<Node<T>> {
        self.latch.write()
    }

    #[inline]
    pub fn try_write_for(&self, timeout: Duration) -> Option<WriteGuard<Node<T>>> {
        self.latch.try_write_for(timeout)
    }

    /// Parent index is a hint, confirm it by checking the parent's children
    /// under the parent's latch.
    #[inline]
    pub fn to_parent(&self) -> usize {
        self.parent.load(SeqCst)
    }

    #[inline]
    pub fn set_parent(&self, parent: usize) {
        self.parent.store(parent, SeqCst)
    }
}

pub struct Arena<T> {
    slab_size: usize,
    segments: Vec<OnceLock<Box<[Slot<T>]>>>,
    next: AtomicUsize,
    free: Mutex<Vec<usize>>,
    n_free: AtomicUsize,
}

impl<T> Arena<T> {
    pub fn new(slab_size: usize) -> Result<Arena<T>> {
        if slab_size < 2 {
            err_at!(InvalidInput, msg: "slab_size {} must be >= 2", slab_size)?;
        }

        let segments = (0..MAX_SEGMENTS).map(|_| OnceLock::new()).collect();
        let arena = Arena {
            slab_size,
            segments,
            next: AtomicUsize::new(ROOT + 1),
            free: Mutex::new(vec![]),
            n_free: AtomicUsize::new(0),
        };
        arena.to_segment(0);
        Ok(arena)
    }

    /// Return the slot at `idx`, `idx` must have been handed out by
    /// [Arena::alloc], or must be one of the reserved slots.
    pub fn slot(&self, idx: usize) -> Result<&Slot<T>> {
        let (k, off) = self.locate(idx);
        match self.segments.get(k).and_then(|seg| seg.get()) {
            Some(seg) => Ok(&seg[off]),
            None => err_at!(Fatal, msg: "slot {} not allocated", idx),
        }
    }

    /// Allocate a fresh slot, reuse a retired slot if available. The
    /// caller shall initialize the slot's payload before linking it
    /// into the tree.
    pub fn alloc(&self) -> Result<usize> {
        let reused = match self.free.lock() {
            Ok(mut free) => free.pop(),
            Err(err) => err_at!(Fatal, msg: "arena free-list poisoned {}", err)?,
        };
        match reused {
            Some(idx) => {
                self.n_free.fetch_sub(1, SeqCst);
                Ok(idx)
            }
            None => {
                let idx = self.next.fetch_add(1, SeqCst);
                let (k, _) = self.locate(idx);
                if k >= MAX_SEGMENTS {
                    err_at!(Fatal, msg: "arena exhausted at {}", idx)?;
                }
                self.to_segment(k);
                Ok(idx)
            }
        }
    }

    /// Return a retired slot back to the arena.
    pub fn free(&self, idx: usize) -> Result<()> {
        if idx == NIL || idx == ROOT {
            err_at!(Fatal, msg: "can't free reserved slot {}", idx)?;
        }
        match self.free.lock() {
            Ok(mut free) => free.push(idx),
            Err(err) => err_at!(Fatal, msg: "arena free-list poisoned {}", err)?,
        }
        self.n_free.fetch_add(1, SeqCst);
        Ok(())
    }

    /// Return (number of slots handed out so far, number of free slots)
    pub fn to_counts(&self) -> (usize, usize) {
        (self.next.load(SeqCst), self.n_free.load(SeqCst))
    }

    /// Aggregate latch statistics across all allocated slots.
    pub fn to_latch_stats(&self) -> Result<spinlock::Stats> {
        let mut stats = spinlock::Stats::default();
        for idx in 0..self.next.load(SeqCst) {
            // segment may be in the middle of allocation.
            if let Ok(slot) = self.slot(idx) {
                stats = stats.merge(slot.latch.to_stats()?);
            }
        }
        Ok(stats)
    }

    fn to_segment(&self, k: usize) -> &[Slot<T>] {
        self.segments[k].get_or_init(|| {
            let size = self.slab_size << k;
            (0..size).map(|_| Slot::new()).collect()
        })
    }

    // segment k covers [slab_size * (2^k - 1), slab_size * (2^(k+1) - 1))
    fn locate(&self, idx: usize) -> (usize, usize) {
        let n = (idx / self.slab_size) + 1;
        let k = (usize::BITS - 1 - n.leading_zeros()) as usize;
        let off = idx - (self.slab_size * ((1 << k) - 1));
        (k, off)
    }
}

#[cfg(test)]
#[path = "arena_test.rs"]
mod arena_test;
