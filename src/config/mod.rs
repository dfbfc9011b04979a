//! # Cache Configuration
//!
//! [`CacheConfig`] collects everything the embedder decides: where the cache
//! lives, how large it may grow, the tile geometry, lock timeout, and
//! whether the cache persists at all. Values are consumed here, not parsed;
//! loading them from settings files belongs to the application.
//!
//! The builder mirrors how the rest of the engine constructs its services:
//!
//! ```ignore
//! let cache = Cache::builder()
//!     .path("/var/tmp/renderer-cache")
//!     .app_name("Renderer")
//!     .cache_name("Tiles")
//!     .maximum_size(4 * 1024 * 1024 * 1024)
//!     .open()?;
//! ```

pub mod constants;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use constants::{
    DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_MAX_CACHE_SIZE, DEFAULT_TILE_SIZE, TILES_PER_SHARD_PER_FILE,
    TOC_GROW_QUANTUM,
};

/// Callbacks fired around the long suspension inside the pending-entry wait
/// loop. An embedder running the cache from a bounded worker pool uses these
/// to relinquish the pool slot before sleeping and reclaim it after, so
/// sleepers do not drain the pool.
pub trait WaitObserver: Send + Sync {
    fn on_wait_begin(&self) {}
    fn on_wait_end(&self) {}
}

struct NoopWaitObserver;

impl WaitObserver for NoopWaitObserver {}

/// Resolved configuration for one cache instance.
#[derive(Clone)]
pub struct CacheConfig {
    /// Directory holding the ToC files, tile storage and lock sentinel.
    /// Ignored by a non-persistent cache.
    pub path: PathBuf,
    /// Application tag, first half of the shared-memory and semaphore names.
    pub app_name: String,
    /// Cache tag, second half of those names.
    pub cache_name: String,
    /// Ceiling on the total footprint, in bytes. Eviction targets this.
    pub maximum_size: u64,
    /// Byte size of one tile.
    pub tile_size: usize,
    /// Tiles contributed to each shard by one storage file.
    pub tiles_per_shard_per_file: usize,
    /// ToC file growth quantum in bytes.
    pub toc_grow_quantum: usize,
    /// Timeout on every interprocess lock acquisition.
    pub lock_timeout: Duration,
    /// False maps everything anonymously: nothing touches the filesystem
    /// and nothing is shared with other processes.
    pub persistent: bool,
    /// Hooks around the pending-entry wait suspension.
    pub wait_observer: Arc<dyn WaitObserver>,
}

impl CacheConfig {
    /// Name of the shared lock segment for this instance.
    pub fn shm_name(&self) -> String {
        format!("{}{}SHM", self.app_name, self.cache_name)
    }

    /// Name of the "a process observed a valid segment" semaphore.
    pub fn sem_valid_name(&self) -> String {
        format!("/{}{}nSHMValidSem", self.app_name, self.cache_name)
    }

    /// Name of the "a process invalidated its mapping" semaphore.
    pub fn sem_invalid_name(&self) -> String {
        format!("/{}{}nSHMInvalidSem", self.app_name, self.cache_name)
    }

    /// Tiles in one storage file across all shards.
    pub fn tiles_per_file(&self) -> usize {
        self.tiles_per_shard_per_file * constants::SHARD_COUNT
    }

    /// Byte size of one storage file.
    pub fn tile_file_size(&self) -> u64 {
        (self.tile_size * self.tiles_per_file()) as u64
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("path", &self.path)
            .field("app_name", &self.app_name)
            .field("cache_name", &self.cache_name)
            .field("maximum_size", &self.maximum_size)
            .field("tile_size", &self.tile_size)
            .field("tiles_per_shard_per_file", &self.tiles_per_shard_per_file)
            .field("toc_grow_quantum", &self.toc_grow_quantum)
            .field("lock_timeout", &self.lock_timeout)
            .field("persistent", &self.persistent)
            .finish()
    }
}

/// Builder for [`CacheConfig`]; finished by `Cache::builder()`'s `open()`.
#[derive(Clone)]
pub struct CacheBuilder {
    config: CacheConfig,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self {
            config: CacheConfig {
                path: PathBuf::new(),
                app_name: "Tilecache".to_string(),
                cache_name: "Cache".to_string(),
                maximum_size: DEFAULT_MAX_CACHE_SIZE,
                tile_size: DEFAULT_TILE_SIZE,
                tiles_per_shard_per_file: TILES_PER_SHARD_PER_FILE,
                toc_grow_quantum: TOC_GROW_QUANTUM,
                lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
                persistent: true,
                wait_observer: Arc::new(NoopWaitObserver),
            },
        }
    }
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn app_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.app_name = name.into();
        self
    }

    pub fn cache_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.cache_name = name.into();
        self
    }

    pub fn maximum_size(mut self, bytes: u64) -> Self {
        self.config.maximum_size = bytes;
        self
    }

    pub fn tile_size(mut self, bytes: usize) -> Self {
        self.config.tile_size = bytes;
        self
    }

    pub fn tiles_per_shard_per_file(mut self, n: usize) -> Self {
        self.config.tiles_per_shard_per_file = n;
        self
    }

    pub fn toc_grow_quantum(mut self, bytes: usize) -> Self {
        self.config.toc_grow_quantum = bytes;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.config.persistent = persistent;
        self
    }

    pub fn wait_observer(mut self, observer: Arc<dyn WaitObserver>) -> Self {
        self.config.wait_observer = observer;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_constants() {
        let config = CacheBuilder::new().build();

        assert_eq!(config.maximum_size, DEFAULT_MAX_CACHE_SIZE);
        assert_eq!(config.tile_size, DEFAULT_TILE_SIZE);
        assert_eq!(config.tile_file_size(), 1024 * 1024 * 1024);
        assert!(config.persistent);
    }

    #[test]
    fn derived_names_embed_app_and_cache() {
        let config = CacheBuilder::new()
            .app_name("Renderer")
            .cache_name("Tiles")
            .build();

        assert_eq!(config.shm_name(), "RendererTilesSHM");
        assert_eq!(config.sem_valid_name(), "/RendererTilesnSHMValidSem");
        assert_eq!(config.sem_invalid_name(), "/RendererTilesnSHMInvalidSem");
    }

    #[test]
    fn tile_geometry_scales_with_overrides() {
        let config = CacheBuilder::new()
            .tile_size(1024)
            .tiles_per_shard_per_file(1)
            .build();

        assert_eq!(config.tiles_per_file(), 256);
        assert_eq!(config.tile_file_size(), 256 * 1024);
    }
}
