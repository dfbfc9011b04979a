//! # Cache Configuration Constants
//!
//! Centralizes the constants whose values depend on each other, with the
//! relationships spelled out so a change in one place does not silently
//! invalidate another.
//!
//! ```text
//! SHARD_COUNT (256)
//!       │
//!       ├─> shard index = top SHARD_HEX_DIGITS * 4 bits of the key
//!       │
//!       ├─> TILES_PER_FILE = TILES_PER_SHARD_PER_FILE * SHARD_COUNT
//!       │     Every storage file contributes the same number of tiles to
//!       │     every shard (tile_index mod SHARD_COUNT picks the owner),
//!       │     so exhaustion in one shard is independent of the others.
//!       │
//!       └─> ShardSync array length in the shared lock segment
//!
//! DEFAULT_TILE_SIZE (16 KiB)
//!       │
//!       └─> TILE_FILE_SIZE = DEFAULT_TILE_SIZE * TILES_PER_FILE (1 GiB)
//!             Storage files are created at full size up front; the pages
//!             materialize lazily (sparse file).
//!
//! TOC_GROW_QUANTUM (512 KiB)
//!       │
//!       └─> Every ToC file size is a multiple of the quantum; the remap
//!           protocol relies on all processes computing the same rounded
//!           size for a requested grow.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `SHARD_COUNT == 256` — shard selection reads exactly the top byte of
//!    the 64-bit key, and tile ownership is `tile_index mod 256`.
//! 2. `SHARED_SEGMENT_SIZE` is a page multiple and large enough for the
//!    lock record (checked where the segment is mapped).
//! 3. `TILE_FILE_SIZE` is an exact multiple of `DEFAULT_TILE_SIZE`.

/// Number of independent cache shards. The shard of a key is its top byte.
pub const SHARD_COUNT: usize = 256;

/// Hex digits naming a shard directory (00..ff).
pub const SHARD_HEX_DIGITS: usize = 2;

/// Growth quantum of a shard's ToC file. Also its initial size.
pub const TOC_GROW_QUANTUM: usize = 512 * 1024;

/// Version of the in-mapping ToC layout. A shard opened with a different
/// stored version is truncated and recreated.
pub const TOC_LAYOUT_VERSION: u32 = 1;

/// Default byte size of one tile (128 x 128 single-channel 8-bit).
pub const DEFAULT_TILE_SIZE: usize = 128 * 128;

/// Default tiles contributed to each shard by one storage file.
pub const TILES_PER_SHARD_PER_FILE: usize = 256;

/// Tiles in one storage file across all shards.
pub const TILES_PER_FILE: usize = TILES_PER_SHARD_PER_FILE * SHARD_COUNT;

/// Byte size of one tile-storage file at the default tile size (1 GiB).
pub const TILE_FILE_SIZE: usize = DEFAULT_TILE_SIZE * TILES_PER_FILE;

/// Fixed size of the shared lock segment, a page multiple.
pub const SHARED_SEGMENT_SIZE: usize = 512 * 1024;

/// Timeout on every interprocess lock acquisition. Expiry is interpreted
/// as the holder having died.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Default ceiling on the cache's total footprint (8 GiB).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// First polling interval while waiting on a pending entry.
pub const WAIT_POLL_START_MS: u64 = 10;

/// Growth factor applied to the polling interval after each poll.
pub const WAIT_POLL_GROWTH: f64 = 1.2;

/// Ceiling on the polling interval.
pub const WAIT_POLL_MAX_MS: u64 = 500;

/// Attempts at an allocation that can be retried after growing the ToC.
pub const OUT_OF_SPACE_RETRIES: usize = 2;

const _: () = assert!(SHARD_COUNT == 1 << (SHARD_HEX_DIGITS * 4));

const _: () = assert!(
    TILE_FILE_SIZE % DEFAULT_TILE_SIZE == 0,
    "storage files must hold a whole number of tiles"
);

const _: () = assert!(
    SHARED_SEGMENT_SIZE % 4096 == 0,
    "shared segment size must be a page multiple"
);

const _: () = assert!(
    TILE_FILE_SIZE == 1024 * 1024 * 1024,
    "default geometry is 1 GiB per storage file"
);
