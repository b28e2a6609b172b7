//! Module `spinlock` implement read-write-spinlock, useful for
//! non-blocking concurrency.
//!
//! Blocking concurrency can have impact on latency. When operations
//! that require [rw-exclusion][rw-lock] is going to be quick and short,
//! we can use non-blocking primitives like latch-and-spin.
//!
//! **What is Latch and spin ?**
//!
//! In typical multi-core processors, concurrent read operations are
//! always safe and consistent. But it becomes unsafe, when there is a
//! writer concurrently modifying data while readers are loading it from
//! memory.
//!
//! Latch-and-lock mechanism can be used when we want to allow one or
//! more concurrent writer(s) along with readers.
//!
//! Imagine a door leading into a room. This door has some special
//! properties:
//!
//! 1. The door has a latch and a lock.
//! 2. A **reader** can enter the room only when the door is un-locked
//!    and un-latched.
//! 3. A **writer** can enter the room only when the door is un-locked
//!    and, un-latched and, there are no other **reader** or **writer**
//!    in the room.
//! 4. Once the door is latched by a **writer**, no other **writer**
//!    or **reader** can enter the room because of (2) and (3) properties.
//!    But all **readers** who are already inside the room can finish
//!    their job and then exit.
//! 5. A **writer** can enter the room only after locking the door, which
//!    the **writer** can do only after all the **readers** have exited.
//! 6. When trying to acquire read-permission or write-permission, the
//!    caller thread shall spin until all the conditions from (1) to (5)
//!    are met. Once a thread acquires necessary permission it can
//!    continue to finish its job and then release the permission.
//!
//! Every tree node owns one such door. Callers that acquire doors out of
//! the root-to-leaf order use [Spinlock::try_write_for], which gives up
//! after a timeout instead of spinning forever.
//!
//! [rw-lock]: https://en.wikipedia.org/wiki/Readers–writer_lock
//!

use std::{
    cell::UnsafeCell,
    convert::TryFrom,
    fmt,
    ops::{Deref, DerefMut},
    result,
    sync::atomic::{AtomicU32, Ordering::SeqCst},
    thread,
    time::{Duration, Instant},
};

use crate::Result;

// Number of spins before yielding to the OS scheduler.
const SPIN_LIMIT: usize = 64;

/// Spinlock implements latch-and-spin mechanism for non-blocking
/// concurrency.
///
/// It uses AtomicU32 for:
/// * ref-count, bits [0-29].
/// * latch flag, bit 30.
/// * lock flag, bit 31.
pub struct Spinlock<T> {
    latchlock: AtomicU32,
    read_locks: AtomicU32,
    write_locks: AtomicU32,
    conflicts: AtomicU32,
    timeouts: AtomicU32,

    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send + Sync> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    const LATCH_FLAG: u32 = 0x40000000;
    const LOCK_FLAG: u32 = 0x80000000;
    const LATCH_LOCK_FLAG: u32 = 0xC0000000;
    const READERS_FLAG: u32 = 0x3FFFFFFF;

    /// Create a new Spinlock
    pub fn new(value: T) -> Spinlock<T> {
        Spinlock {
            latchlock: AtomicU32::new(0),
            read_locks: AtomicU32::new(0),
            write_locks: AtomicU32::new(0),
            conflicts: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),

            value: UnsafeCell::new(value),
        }
    }

    /// Acquire latch for read permission, spin until acquired.
    pub fn read(&self) -> ReadGuard<T> {
        let mut spins = 0;
        loop {
            if let Some(guard) = self.try_read() {
                break guard;
            }
            self.backoff(&mut spins);
        }
    }

    /// Acquire latch for write permission, spin until acquired.
    pub fn write(&self) -> WriteGuard<T> {
        let mut spins = 0;
        loop {
            if self.try_latch() {
                break;
            }
            self.backoff(&mut spins);
        }
        loop {
            if let Some(guard) = self.try_lock() {
                break guard;
            }
            self.backoff(&mut spins);
        }
    }

    /// Acquire latch for write permission, give up after `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Option<WriteGuard<T>> {
        let (deadline, mut spins) = (Instant::now() + timeout, 0);
        loop {
            if self.try_latch() {
                break;
            }
            if self.backoff(&mut spins) && Instant::now() > deadline {
                self.timeouts.fetch_add(1, SeqCst);
                return None;
            }
        }
        loop {
            if let Some(guard) = self.try_lock() {
                break Some(guard);
            }
            if self.backoff(&mut spins) && Instant::now() > deadline {
                // readers are still inside, open the latch back.
                self.latchlock.fetch_and(!Self::LATCH_FLAG, SeqCst);
                self.timeouts.fetch_add(1, SeqCst);
                break None;
            }
        }
    }

    fn try_read(&self) -> Option<ReadGuard<T>> {
        let old = self.latchlock.load(SeqCst);
        if (old & Self::LATCH_LOCK_FLAG) == 0 {
            // latch is not acquired by a writer
            if self
                .latchlock
                .compare_exchange(old, old + 1, SeqCst, SeqCst)
                .is_ok()
            {
                if cfg!(feature = "debug") {
                    self.read_locks.fetch_add(1, SeqCst);
                }
                return Some(ReadGuard { door: self });
            }
        }
        None
    }

    fn try_latch(&self) -> bool {
        let old = self.latchlock.load(SeqCst);
        if (old & Self::LATCH_FLAG) == 0 {
            // latch is not acquired by a writer
            if (old & Self::LOCK_FLAG) != 0 {
                panic!(concat!(
                    "if latch is flipped-off, lock can't be flipped-on! ",
                    "call the programmer"
                ));
            }
            let new = old | Self::LATCH_FLAG;
            self.latchlock
                .compare_exchange(old, new, SeqCst, SeqCst)
                .is_ok()
        } else {
            false
        }
    }

    fn try_lock(&self) -> Option<WriteGuard<T>> {
        let old = self.latchlock.load(SeqCst);
        if (old & Self::READERS_FLAG) == 0 {
            let new = old | Self::LOCK_FLAG;
            if self
                .latchlock
                .compare_exchange(old, new, SeqCst, SeqCst)
                .is_ok()
            {
                if cfg!(feature = "debug") {
                    self.write_locks.fetch_add(1, SeqCst);
                }
                return Some(WriteGuard { door: self });
            }
            panic!(concat!(
                "latch is acquired, ZERO readers, but unable to lock! ",
                "call the programmer"
            ));
        }
        None
    }

    // return true once in every SPIN_LIMIT calls, after yielding.
    fn backoff(&self, spins: &mut usize) -> bool {
        if cfg!(feature = "debug") {
            self.conflicts.fetch_add(1, SeqCst);
        }
        *spins += 1;
        if *spins % SPIN_LIMIT == 0 {
            thread::yield_now();
            true
        } else {
            std::hint::spin_loop();
            false
        }
    }

    pub fn to_stats(&self) -> Result<Stats> {
        let rl = err_at!(FailConvert, usize::try_from(self.read_locks.load(SeqCst)))?;
        let wl = err_at!(FailConvert, usize::try_from(self.write_locks.load(SeqCst)))?;
        let cn = err_at!(FailConvert, usize::try_from(self.conflicts.load(SeqCst)))?;
        let to = err_at!(FailConvert, usize::try_from(self.timeouts.load(SeqCst)))?;
        Ok(Stats {
            latchlock: self.latchlock.load(SeqCst),
            read_locks: rl,
            write_locks: wl,
            conflicts: cn,
            timeouts: to,
        })
    }
}

/// Type to handle read-latch, when latchlock gets dropped the latch is released.
pub struct ReadGuard<'a, T> {
    door: &'a Spinlock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.door.value.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.door.latchlock.fetch_sub(1, SeqCst);
    }
}

/// Type to handle write-latch, when latchlock gets dropped the latch is released.
pub struct WriteGuard<'a, T> {
    door: &'a Spinlock<T>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.door.value.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.door.value.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        let old = self.door.latchlock.load(SeqCst);
        if (old & Spinlock::<T>::READERS_FLAG) > 0 {
            panic!(concat!(
                "can't have active readers, when lock is held! ",
                "call the programmer"
            ));
        }
        if self
            .door
            .latchlock
            .compare_exchange(old, 0, SeqCst, SeqCst)
            .is_err()
        {
            panic!(concat!(
                "cant' have readers/writers to modify when locked! ",
                "call the programmer"
            ))
        }
    }
}

/// Statistic type, to capture [Spinlock] metrics.
#[derive(Clone, Default)]
pub struct Stats {
    /// Actual 32-bit latchlock of the Spinlock when
    /// [to_stats][Spinlock::to_stats] is called.
    pub latchlock: u32,
    /// Total number of read locks so far, counted with `debug` feature.
    pub read_locks: usize,
    /// Total number of write locks so far, counted with `debug` feature.
    pub write_locks: usize,
    /// Total number of conflicts so far, counted with `debug` feature.
    pub conflicts: usize,
    /// Total number of timed acquisitions that gave up.
    pub timeouts: usize,
}

impl Stats {
    pub fn merge(self, other: Stats) -> Stats {
        Stats {
            latchlock: 0,
            read_locks: self.read_locks + other.read_locks,
            write_locks: self.write_locks + other.write_locks,
            conflicts: self.conflicts + other.conflicts,
            timeouts: self.timeouts + other.timeouts,
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            concat!(
                "{{ latchlock = {:X}, read_locks = {}, ",
                "write_locks = {}, conflicts = {}, timeouts = {} }}",
            ),
            self.latchlock, self.read_locks, self.write_locks, self.conflicts, self.timeouts,
        )
    }
}

#[cfg(test)]
#[path = "spinlock_test.rs"]
mod spinlock_test;
