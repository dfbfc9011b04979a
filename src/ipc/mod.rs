//! # Interprocess Primitives
//!
//! Everything the cache needs to coordinate unrelated processes over shared
//! memory, built directly on the OS:
//!
//! - [`futex`]: timed wait/wake on `AtomicU32` words in shared mappings
//! - [`locks`]: timed mutex and reader-writer lock, zero-init unlocked
//! - [`semaphore`]: POSIX named semaphores for the recovery handshake
//! - [`file_lock`]: the `flock`-based occupancy sentinel
//! - [`shared_segment`]: the fixed-size segment holding all lock words
//!
//! The unifying design rule: any primitive a dead process can leave behind
//! must either be released by the kernel on death (`flock`), or be
//! acquirable only through a timed path whose expiry reports
//! [`crate::error::AbandonedLock`].

pub mod file_lock;
pub mod futex;
pub mod locks;
pub mod semaphore;
pub mod shared_segment;

pub use file_lock::FileLock;
pub use locks::{SharedMutex, SharedMutexGuard, SharedReadGuard, SharedRwLock, SharedWriteGuard};
pub use semaphore::NamedSemaphore;
pub use shared_segment::{CacheShared, SharedSegment, ShardSync};
