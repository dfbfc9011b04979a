//! # Timed Interprocess Locks
//!
//! [`SharedMutex`] and [`SharedRwLock`] are lock words designed to live
//! inside a shared memory segment and be operated on by multiple processes.
//! They have two properties ordinary locks do not need:
//!
//! 1. **Zero-initialized means unlocked.** The shared segment is created
//!    with `ftruncate`, which zero-fills; a freshly mapped segment is a
//!    field of valid, unlocked locks with no constructor run.
//! 2. **Every acquisition is timed.** A peer process can die while holding
//!    a lock, and no amount of waiting will release it. An expired timeout
//!    returns an [`AbandonedLock`] error, which the caller escalates to the
//!    shared-memory recovery protocol.
//!
//! The rwlock uses an eventcount scheme: a packed state word (writer bit +
//! reader count) plus a generation word that waiters sleep on. Releases bump
//! the generation and wake all sleepers, who re-contend. This admits
//! spurious wakeups but never misses one, which is the property that
//! matters when the sleepers belong to different processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use eyre::Result;

use super::futex;
use crate::error::AbandonedLock;

const SPIN_LIMIT: usize = 64;

fn abandoned(timeout: Duration) -> eyre::Report {
    eyre::Report::new(AbandonedLock {
        timeout_ms: timeout.as_millis() as u64,
    })
}

// ---------------------------------------------------------------------------
// SharedMutex
// ---------------------------------------------------------------------------

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Exclusive interprocess mutex. One `AtomicU32` in shared memory.
#[repr(C)]
#[derive(Debug)]
pub struct SharedMutex {
    state: AtomicU32,
}

impl SharedMutex {
    /// Acquires within `timeout` or reports the lock abandoned.
    pub fn lock(&self, timeout: Duration) -> Result<SharedMutexGuard<'_>> {
        for _ in 0..SPIN_LIMIT {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(SharedMutexGuard { mutex: self });
            }
            std::hint::spin_loop();
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Advertise a waiter so the holder knows to wake on release.
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return Ok(SharedMutexGuard { mutex: self });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(abandoned(timeout));
            }
            futex::wait(&self.state, CONTENDED, Some(remaining));
        }
    }

    /// Single attempt, never blocks.
    pub fn try_lock(&self) -> Option<SharedMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SharedMutexGuard { mutex: self })
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex::wake(&self.state, 1);
        }
    }
}

#[derive(Debug)]
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

// ---------------------------------------------------------------------------
// SharedRwLock
// ---------------------------------------------------------------------------

const WRITER: u32 = 1 << 31;
const READER_MASK: u32 = WRITER - 1;

/// Reader-writer interprocess lock: packed state word plus a generation
/// word used as the sleep queue.
#[repr(C)]
#[derive(Debug)]
pub struct SharedRwLock {
    state: AtomicU32,
    generation: AtomicU32,
}

impl SharedRwLock {
    fn try_read_once(&self) -> bool {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur & WRITER != 0 {
                return false;
            }
            debug_assert!(cur & READER_MASK < READER_MASK, "reader count overflow");
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn try_write_once(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn wait_for<F: Fn() -> bool>(&self, acquire: F, timeout: Duration) -> Result<()> {
        for _ in 0..SPIN_LIMIT {
            if acquire() {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let gen = self.generation.load(Ordering::Acquire);
            if acquire() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(abandoned(timeout));
            }
            futex::wait(&self.generation, gen, Some(remaining));
        }
    }

    /// Shared acquisition within `timeout`.
    pub fn read(&self, timeout: Duration) -> Result<SharedReadGuard<'_>> {
        self.wait_for(|| self.try_read_once(), timeout)?;
        Ok(SharedReadGuard { lock: self })
    }

    /// Exclusive acquisition within `timeout`.
    pub fn write(&self, timeout: Duration) -> Result<SharedWriteGuard<'_>> {
        self.wait_for(|| self.try_write_once(), timeout)?;
        Ok(SharedWriteGuard { lock: self })
    }

    /// Single shared attempt, never blocks.
    pub fn try_read(&self) -> Option<SharedReadGuard<'_>> {
        self.try_read_once().then(|| SharedReadGuard { lock: self })
    }

    /// Shared acquisition without a guard object, for holders that must
    /// outlive a borrow scope (tile data guards). Pair every success with
    /// exactly one [`SharedRwLock::unlock_shared_raw`].
    pub(crate) fn lock_shared_raw(&self, timeout: Duration) -> Result<()> {
        let guard = self.read(timeout)?;
        std::mem::forget(guard);
        Ok(())
    }

    pub(crate) fn unlock_shared_raw(&self) {
        self.unlock_read();
    }

    fn release_wake(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        futex::wake_all(&self.generation);
    }

    fn unlock_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert_ne!(prev & READER_MASK, 0, "unlock_read with no readers");
        // Only the last reader leaving can unblock a writer.
        if prev & READER_MASK == 1 {
            self.release_wake();
        }
    }

    fn unlock_write(&self) {
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert_eq!(prev, WRITER, "unlock_write without the writer bit");
        self.release_wake();
    }
}

pub struct SharedReadGuard<'a> {
    lock: &'a SharedRwLock,
}

impl Drop for SharedReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

#[derive(Debug)]
pub struct SharedWriteGuard<'a> {
    lock: &'a SharedRwLock,
}

impl<'a> SharedWriteGuard<'a> {
    /// Atomically converts exclusive ownership into a shared hold, waking
    /// other readers that queued behind the writer.
    pub fn downgrade(self) -> SharedReadGuard<'a> {
        let lock = self.lock;
        std::mem::forget(self);
        let prev = lock.state.swap(1, Ordering::Release);
        debug_assert_eq!(prev, WRITER, "downgrade without the writer bit");
        lock.release_wake();
        SharedReadGuard { lock }
    }
}

impl Drop for SharedWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
