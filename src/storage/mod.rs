//! # Storage Layer
//!
//! The mapped-memory foundations of the cache:
//!
//! - [`mapped_file`]: create-or-open `MAP_SHARED` mappings with
//!   resize-preserve, wipe, and hole punching; anonymous backing for the
//!   non-persistent variant
//! - [`arena`]: the allocator overlay that turns each shard's ToC mapping
//!   into a heap of offset-addressed records
//! - [`rel_vec`]: the one growable in-mapping container (list, sorted set,
//!   sorted pair map)
//! - [`tiles`]: fixed-geometry tile storage files and encoded tile ids
//!
//! Everything here is position-independent: records reference each other
//! by byte offsets from the mapping base, never by pointers, because the
//! same file is mapped at different addresses in different processes and
//! remaps move the base within one process.

pub mod arena;
pub mod mapped_file;
pub mod rel_vec;
pub mod tiles;

pub use arena::{Arena, OutOfSpace};
pub use mapped_file::MappedFile;
pub use rel_vec::RelVec;
pub use tiles::{TileId, TileStore};
