//! # tilecache — Interprocess Render-Artifact Cache
//!
//! A persistent, interprocess, LRU-bounded content-addressed cache used to
//! memoize expensive per-frame render artifacts. Multiple cooperating
//! processes share the cache through memory-mapped files; any of them may
//! die at any instant, and the survivors detect it, reinitialize the
//! shared state and carry on.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │       Public API (Cache / EntryLocker)       │
//! ├──────────────────────────────────────────────┤
//! │  256 shards: entry index · LRU · free tiles  │
//! ├──────────────────────────────────────────────┤
//! │  ToC arenas (offset heaps in mapped files)   │   TileStore (1 GiB
//! ├──────────────────────────────────────────────┤   fixed-tile files)
//! │  Shared lock segment · futex locks · flock   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/
//! ├── Lock              # flock sentinel (occupancy detection)
//! ├── 00/Index … ff/Index   # per-shard ToC heaps, grow by 512 KiB
//! └── TilesStorage1 …   # 1 GiB tile files, 65536 tiles each
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let cache = Cache::builder()
//!     .path("/var/tmp/render-cache")
//!     .maximum_size(4 << 30)
//!     .open()?;
//!
//! let mut frame = FrameArtifact::new(params);
//! let mut locker = cache.get(frame_hash, &mut frame)?;
//! match locker.status() {
//!     LockerStatus::Cached => { /* frame is filled in */ }
//!     LockerStatus::ComputationPending => { locker.wait(None)?; }
//!     LockerStatus::MustCompute => {
//!         render_into(locker.payload_mut());
//!         locker.insert()?;
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`cache`]: shards, entry lifecycle, locker, eviction, coordinator
//! - [`storage`]: mapped files, in-mapping arenas, tile storage
//! - [`ipc`]: futex locks, named semaphores, file lock, shared segment
//! - [`config`]: builder, constants
//! - [`error`]: the recovery-triggering signal types

#[macro_use]
mod macros;

pub mod cache;
pub mod config;
pub mod error;
pub mod ipc;
pub mod storage;

pub use cache::{
    Cache, CachePayload, DeserializeOutcome, EntryLocker, LockerStatus, PayloadReader,
    PayloadWriter, PluginStats, TileRead, TileWrite,
};
pub use config::{CacheBuilder, CacheConfig, WaitObserver};
pub use error::{Aborted, AbandonedLock, CorruptedCache};
pub use storage::TileId;
