//! # Cache Coordinator
//!
//! [`Cache`] ties the pieces together: 256 [`shard::Shard`]s over mapped
//! ToC files, the [`TileStore`], the shared lock segment, the global file
//! lock and named semaphores, and the abandonment-recovery procedure that
//! lets survivors carry on after a peer process dies holding locks.
//!
//! ## Startup
//!
//! The first process to arrive (exclusive `flock` on `<root>/Lock`)
//! recreates the shared segment and both semaphores — stale lock words
//! from a previous crash die here — then downgrades to a shared hold.
//! Late arrivals open what exists. Every shard ToC is then opened or
//! created, and tile storage is enumerated (one file is created and dealt
//! out to the shards' free sets when none exists).
//!
//! ## Recovery
//!
//! Any interprocess lock acquisition that exceeds its timeout reports
//! [`AbandonedLock`](crate::error::AbandonedLock); a shard found
//! mid-mutation reports [`CorruptedCache`](crate::error::CorruptedCache).
//! Both unwind to the API boundary, which runs the shared-segment
//! reinitialization handshake (semaphores + exclusive file lock) and then
//! wipes the cache. The failing call reports "not cached" and the render
//! re-requests what it needs.

pub mod entry;
pub mod eviction;
pub mod locker;
pub mod lru;
pub mod payload;
pub mod shard;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::constants::{
    OUT_OF_SPACE_RETRIES, SHARD_COUNT, TOC_LAYOUT_VERSION,
};
use crate::config::{CacheBuilder, CacheConfig};
use crate::error::is_recovery_signal;
use crate::ipc::{CacheShared, FileLock, NamedSemaphore, SharedSegment};
use crate::storage::{TileId, TileStore};

pub use locker::{EntryLocker, LockerStatus};
pub use payload::{CachePayload, DeserializeOutcome, PayloadReader, PayloadWriter};

use entry::{EntryHeader, EntryState};
use shard::{Shard, ShardCtx};

/// Per-plugin aggregate reported by [`Cache::report`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PluginStats {
    pub entries: u64,
    pub payload_bytes: u64,
    pub tile_count: u64,
}

struct RecoveryGate {
    /// (threads currently timed out, recovery generation)
    state: Mutex<(u32, u64)>,
    cond: Condvar,
}

pub(crate) struct CacheInner {
    pub(crate) config: CacheConfig,
    /// Shared lock segment; writers are the recovery path, which swaps the
    /// whole mapping. Holding this read is the process-local guard every
    /// shared-memory access runs under.
    pub(crate) shm: RwLock<SharedSegment>,
    pub(crate) shards: Vec<Shard>,
    pub(crate) tiles: TileStore,
    file_lock: Mutex<Option<FileLock>>,
    sems: Option<(NamedSemaphore, NamedSemaphore)>,
    maximum_size: Mutex<u64>,
    recovery: RecoveryGate,
}

/// The public handle. Clones share one instance.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl CacheBuilder {
    /// Finishes the builder and opens the cache.
    pub fn open(self) -> Result<Cache> {
        Cache::open(self.build())
    }
}

impl Cache {
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Opens (or creates) a cache instance per the startup protocol.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let (segment, file_lock, sems) = if config.persistent {
            ensure!(
                !config.path.as_os_str().is_empty(),
                "persistent cache requires a directory"
            );
            fs::create_dir_all(&config.path).wrap_err_with(|| {
                format!("failed to create cache directory '{}'", config.path.display())
            })?;
            for idx in 0..SHARD_COUNT {
                fs::create_dir_all(config.path.join(format!("{idx:02x}")))
                    .wrap_err("failed to create shard directory")?;
            }

            let mut lock = FileLock::open(&config.path.join("Lock"))?;
            let (segment, sems) = if lock.try_lock_exclusive()? {
                // Sole process: anything left in the segment or the
                // semaphores belongs to the dead; rebuild both.
                let segment = SharedSegment::create(&config.shm_name())?;
                let sem_valid = NamedSemaphore::recreate(&config.sem_valid_name(), 0)?;
                let sem_invalid = NamedSemaphore::recreate(&config.sem_invalid_name(), 0)?;
                lock.lock_shared()?;
                (segment, (sem_valid, sem_invalid))
            } else {
                lock.lock_shared()?;
                let segment = SharedSegment::open(&config.shm_name())?;
                let sem_valid = NamedSemaphore::open(&config.sem_valid_name(), 0)?;
                let sem_invalid = NamedSemaphore::open(&config.sem_invalid_name(), 0)?;
                (segment, (sem_valid, sem_invalid))
            };
            (segment, Some(lock), Some(sems))
        } else {
            (SharedSegment::anonymous()?, None, None)
        };

        let shards = {
            let shared = segment.state();
            let mut shards = Vec::with_capacity(SHARD_COUNT);
            for idx in 0..SHARD_COUNT {
                let ctx = ShardCtx {
                    sync: shared.shard(idx),
                    timeout: config.lock_timeout,
                    quantum: config.toc_grow_quantum,
                    layout_version: TOC_LAYOUT_VERSION,
                };
                let path = config
                    .persistent
                    .then(|| config.path.join(format!("{idx:02x}")).join("Index"));
                shards.push(Shard::open(idx, path, &ctx)?);
            }
            shards
        };

        let tiles = if config.persistent {
            TileStore::open_dir(
                config.path.clone(),
                config.tile_size,
                config.tiles_per_file(),
            )?
        } else {
            TileStore::anonymous(config.tile_size, config.tiles_per_file())?
        };

        let maximum_size = config.maximum_size;
        let inner = Arc::new(CacheInner {
            config,
            shm: RwLock::new(segment),
            shards,
            tiles,
            file_lock: Mutex::new(file_lock),
            sems,
            maximum_size: Mutex::new(maximum_size),
            recovery: RecoveryGate {
                state: Mutex::new((0, 0)),
                cond: Condvar::new(),
            },
        });

        if inner.tiles.file_count() == 0 {
            let shm = inner.shm.read();
            let shared = shm.state();
            let _tiles = shared.tiles_lock.write(inner.config.lock_timeout)?;
            if inner.tiles.file_count() == 0 {
                let file_index = inner.tiles.create_file()?;
                inner.seed_file(shared, file_index)?;
            }
        }

        Ok(Self { inner })
    }

    /// Obtains the locker for `key`, deserializing into `payload` when the
    /// entry is already cached. This is the single entry point of the
    /// lookup/wait/compute/insert protocol.
    pub fn get<'p, P: CachePayload>(
        &self,
        key: u64,
        payload: &'p mut P,
    ) -> Result<EntryLocker<'p, P>> {
        EntryLocker::create(self.inner.clone(), key, payload)
    }

    /// Removes `key` if present. Removing a key a peer is still computing
    /// is allowed; the computer's insert degrades to a no-op.
    pub fn remove(&self, key: u64) -> Result<()> {
        self.soft_boundary((), |inner| {
            let idx = (key >> 56) as usize;
            let tiles = {
                let shm = inner.shm.read();
                let shared = shm.state();
                let ctx = inner.shard_ctx(shared, idx);
                let toc = inner.shards[idx].lock_toc_read(&ctx)?;
                let arena = toc.arena();
                let _guard = ctx.sync.shard_lock.write(ctx.timeout)?;
                let record_off = shard::record_off(&arena)?;
                let _state = shard::StateGuard::enter(arena, record_off, idx)?;
                match shard::lookup(&arena, key)? {
                    None => return Ok(()),
                    Some(off) => {
                        let (_, tiles) = shard::deallocate_entry(
                            &arena,
                            &ctx,
                            off,
                            inner.config.tile_size as u64,
                        )?;
                        tiles
                    }
                }
            };
            inner.release_tiles(&tiles)
        })
    }

    /// Wipes every shard and every tile file, then reseeds the free sets.
    pub fn clear(&self) -> Result<()> {
        self.soft_boundary((), |inner| inner.wipe_all())
    }

    /// Best-effort eviction down to `maximum_size - bytes_hint`.
    pub fn evict(&self, bytes_hint: u64) -> Result<()> {
        self.soft_boundary((), |inner| {
            let target = inner.max_size().saturating_sub(bytes_hint);
            eviction::evict_to(inner, target)
        })
    }

    /// Total bytes currently billed across all shards.
    pub fn current_size(&self) -> Result<u64> {
        self.soft_boundary(0, eviction::total_size)
    }

    pub fn maximum_size(&self) -> u64 {
        self.inner.max_size()
    }

    /// Number of tile-storage files currently backing the cache.
    pub fn tile_file_count(&self) -> u32 {
        self.inner.tiles.file_count()
    }

    /// Adjusts the footprint ceiling and evicts down to it.
    pub fn set_maximum_size(&self, bytes: u64) -> Result<()> {
        *self.inner.maximum_size.lock() = bytes;
        self.evict(0)
    }

    /// Aggregates entry counts, payload bytes and tile counts per plugin
    /// id, for memory reporting.
    pub fn report(&self) -> Result<HashMap<String, PluginStats>> {
        self.soft_boundary(HashMap::new(), |inner| {
            let mut out: HashMap<String, PluginStats> = HashMap::new();
            let shm = inner.shm.read();
            let shared = shm.state();
            for idx in 0..SHARD_COUNT {
                let ctx = inner.shard_ctx(shared, idx);
                let toc = inner.shards[idx].lock_toc_read(&ctx)?;
                let arena = toc.arena();
                let _guard = ctx.sync.shard_lock.read(ctx.timeout)?;
                let record = shard::record(&arena)?;
                for i in 0..record.entries.map_len() {
                    let (_, off) = record.entries.map_at(&arena, i)?;
                    let entry = arena.get::<EntryHeader>(off)?;
                    let stats = out
                        .entry(entry.plugin_id(&arena)?.to_string())
                        .or_default();
                    stats.entries += 1;
                    stats.payload_bytes += entry.byte_size();
                    stats.tile_count += entry.tiles.len();
                }
            }
            Ok(out)
        })
    }

    /// Shared view of a tile's bytes; the guard pins the tile storage for
    /// its lifetime.
    pub fn tile_read(&self, id: TileId) -> Result<TileRead<'_>> {
        let (shm, ptr, len) = self.inner.tile_guard_parts(id)?;
        Ok(TileRead {
            shm,
            ptr,
            len,
        })
    }

    /// Mutable view of a tile's bytes. Callers write tiles they own (a
    /// staged allocation or an entry they are computing); the cache does
    /// not police ownership here, exactly like handing out a raw pointer
    /// tied to the storage lock.
    pub fn tile_write(&self, id: TileId) -> Result<TileWrite<'_>> {
        let (shm, ptr, len) = self.inner.tile_guard_parts(id)?;
        Ok(TileWrite {
            shm,
            ptr,
            len,
        })
    }

    /// Checks the structural invariants of every shard: index/LRU
    /// agreement, owner-tag consistency, size accounting, LRU list shape,
    /// and the tile partition (every tile in exactly one free set or tile
    /// list). Meaningful only while no other thread mutates the cache.
    pub fn verify_integrity(&self) -> Result<()> {
        let inner = &self.inner;
        let shm = inner.shm.read();
        let shared = shm.state();

        let mut seen_tiles: HashSet<u64> = HashSet::new();
        let mut tile_total = 0u64;

        for idx in 0..SHARD_COUNT {
            let ctx = inner.shard_ctx(shared, idx);
            let toc = inner.shards[idx].lock_toc_read(&ctx)?;
            let arena = toc.arena();
            let _guard = ctx.sync.shard_lock.read(ctx.timeout)?;
            let record = shard::record(&arena)?;

            // Index pass: statuses, owner tags, billed size, tiles.
            let mut ready_keys: HashSet<u64> = HashSet::new();
            let mut billed = 0u64;
            for i in 0..record.entries.map_len() {
                let (key, off) = record.entries.map_at(&arena, i)?;
                let entry = arena.get::<EntryHeader>(off)?;
                ensure!(entry.key() == key, "entry key mismatch in shard {idx:02x}");
                match entry.state() {
                    EntryState::Ready => {
                        ensure!(
                            entry.owner_tag() == 0,
                            "ready entry with owner tag in shard {idx:02x}"
                        );
                        ready_keys.insert(key);
                    }
                    EntryState::Pending => ensure!(
                        entry.owner_tag() != 0,
                        "pending entry without owner tag in shard {idx:02x}"
                    ),
                    EntryState::Null => {}
                }
                billed += entry.byte_size()
                    + entry.tiles.len() * inner.config.tile_size as u64;
                for slot in entry.tiles.as_slice(&arena)? {
                    ensure!(
                        seen_tiles.insert(slot.get()),
                        "tile {:#x} referenced twice",
                        slot.get()
                    );
                    tile_total += 1;
                }
            }
            ensure!(
                billed == record.shard_size(),
                "shard {idx:02x} size {} != recomputed {}",
                record.shard_size(),
                billed
            );

            // LRU pass: shape and key-set agreement with Ready entries.
            let _lru = ctx.sync.lru_lock.lock(ctx.timeout)?;
            let mut lru_keys: HashSet<u64> = HashSet::new();
            let mut cur = record.lru_front();
            let mut prev = 0u64;
            let mut steps = 0u64;
            while cur != 0 {
                steps += 1;
                ensure!(
                    steps <= record.entries.map_len(),
                    "LRU list of shard {idx:02x} is cyclic"
                );
                let entry = arena.get::<EntryHeader>(cur)?;
                ensure!(
                    entry.lru_prev() == prev,
                    "LRU back-pointer broken in shard {idx:02x}"
                );
                lru_keys.insert(entry.key());
                prev = cur;
                cur = entry.lru_next();
            }
            ensure!(
                record.lru_back() == prev,
                "LRU back endpoint broken in shard {idx:02x}"
            );
            ensure!(
                lru_keys == ready_keys,
                "LRU and ready-entry key sets differ in shard {idx:02x}"
            );

            // Free-tile pass.
            for slot in record.free_tiles.as_slice(&arena)? {
                ensure!(
                    TileId::from_encoded(slot.get()).owning_shard() == idx,
                    "free set of shard {idx:02x} holds a foreign tile"
                );
                ensure!(
                    seen_tiles.insert(slot.get()),
                    "tile {:#x} in a free set and elsewhere",
                    slot.get()
                );
                tile_total += 1;
            }
        }

        let expected =
            inner.tiles.file_count() as u64 * inner.tiles.tiles_per_file() as u64;
        ensure!(
            tile_total == expected,
            "tile partition incomplete: {} accounted, {} exist",
            tile_total,
            expected
        );
        Ok(())
    }

    /// Flushes every mapped file, best effort.
    pub fn sync(&self) -> Result<()> {
        for shard in &self.inner.shards {
            shard.sync_best_effort();
        }
        self.inner.tiles.sync()
    }

    /// Catches recovery-triggering signals at the public boundary: runs
    /// the recovery procedure plus wipe, then reports the soft default.
    fn soft_boundary<T>(
        &self,
        soft: T,
        f: impl FnOnce(&CacheInner) -> Result<T>,
    ) -> Result<T> {
        match f(&self.inner) {
            Err(err) if is_recovery_signal(&err) => {
                warn!(error = %err, "abandoned cache state detected, recovering");
                self.inner.recover_and_wipe();
                Ok(soft)
            }
            other => other,
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.sync_best_effort();
        }
        let _ = self.tiles.sync();
    }
}

// ---------------------------------------------------------------------------
// Tile guards
// ---------------------------------------------------------------------------

/// Shared view of one tile's bytes. Holds the interprocess `tiles_lock`
/// shared (released on drop), which pins the storage files.
pub struct TileRead<'c> {
    shm: parking_lot::RwLockReadGuard<'c, SharedSegment>,
    ptr: *const u8,
    len: usize,
}

impl std::ops::Deref for TileRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr/len address one whole tile inside a storage mapping
        // that cannot be wiped or unmapped while tiles_lock is held shared.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for TileRead<'_> {
    fn drop(&mut self) {
        self.shm.state().tiles_lock.unlock_shared_raw();
    }
}

/// Mutable view of one tile's bytes; same pinning as [`TileRead`].
pub struct TileWrite<'c> {
    shm: parking_lot::RwLockReadGuard<'c, SharedSegment>,
    ptr: *const u8,
    len: usize,
}

impl std::ops::Deref for TileWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: as in TileRead.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl std::ops::DerefMut for TileWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in TileRead; exclusive use of the tile's bytes is the
        // caller's reservation contract (one computing owner per entry).
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }
}

impl Drop for TileWrite<'_> {
    fn drop(&mut self) {
        self.shm.state().tiles_lock.unlock_shared_raw();
    }
}

// ---------------------------------------------------------------------------
// CacheInner
// ---------------------------------------------------------------------------

impl CacheInner {
    pub(crate) fn shard_ctx<'a>(&self, shared: &'a CacheShared, idx: usize) -> ShardCtx<'a> {
        ShardCtx {
            sync: shared.shard(idx),
            timeout: self.config.lock_timeout,
            quantum: self.config.toc_grow_quantum,
            layout_version: TOC_LAYOUT_VERSION,
        }
    }

    fn max_size(&self) -> u64 {
        *self.maximum_size.lock()
    }

    /// Acquires the pieces of a tile guard: process-local segment hold,
    /// raw shared `tiles_lock`, and the tile's pointer.
    fn tile_guard_parts(
        &self,
        id: TileId,
    ) -> Result<(parking_lot::RwLockReadGuard<'_, SharedSegment>, *const u8, usize)> {
        // Recursive: a payload's deserialize may ask for tile bytes while
        // the calling lookup already holds the segment guard shared.
        let shm = self.shm.read_recursive();
        shm.state()
            .tiles_lock
            .lock_shared_raw(self.config.lock_timeout)?;

        let resolved = (|| {
            if id.file_index() >= self.tiles.file_count() {
                self.tiles.refresh()?;
            }
            self.tiles.tile_ptr(id)
        })();

        match resolved {
            Ok(ptr) => Ok((shm, ptr, self.tiles.tile_size())),
            Err(err) => {
                shm.state().tiles_lock.unlock_shared_raw();
                Err(err)
            }
        }
    }

    /// Pulls one free tile for `shard_idx`, creating and dealing out a new
    /// storage file when the shard's set is dry.
    pub(crate) fn allocate_tile(&self, shard_idx: usize) -> Result<TileId> {
        loop {
            {
                let shm = self.shm.read();
                let shared = shm.state();
                let _tiles = shared.tiles_lock.read(self.config.lock_timeout)?;
                let ctx = self.shard_ctx(shared, shard_idx);
                let toc = self.shards[shard_idx].lock_toc_read(&ctx)?;
                let arena = toc.arena();
                let _guard = ctx.sync.shard_lock.write(ctx.timeout)?;
                let record_off = shard::record_off(&arena)?;
                let _state = shard::StateGuard::enter(arena, record_off, shard_idx)?;
                if let Some(id) = shard::pop_free_tile(&arena)? {
                    return Ok(id);
                }
            }

            // Dry: append a storage file (unless a peer just did).
            let shm = self.shm.read();
            let shared = shm.state();
            let _tiles = shared.tiles_lock.write(self.config.lock_timeout)?;
            let before = self.tiles.file_count();
            self.tiles.refresh()?;
            if self.tiles.file_count() == before {
                let file_index = self.tiles.create_file()?;
                self.seed_file(shared, file_index)?;
            }
        }
    }

    /// Deals every tile of a freshly created storage file into the shards'
    /// free sets. Caller holds `tiles_lock` exclusively.
    fn seed_file(&self, shared: &CacheShared, file_index: u32) -> Result<()> {
        for idx in 0..SHARD_COUNT {
            let ids = self.tiles.tiles_of_shard(file_index, idx);
            self.insert_free_tiles_grow(shared, idx, &ids)?;
        }
        debug!(file_index, "tile storage file dealt to shard free sets");
        Ok(())
    }

    /// Inserts ids into one shard's free set, growing its ToC on demand.
    fn insert_free_tiles_grow(
        &self,
        shared: &CacheShared,
        idx: usize,
        ids: &[TileId],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ctx = self.shard_ctx(shared, idx);
        let mut attempts = 0usize;
        loop {
            let needed = {
                let toc = self.shards[idx].lock_toc_read(&ctx)?;
                let arena = toc.arena();
                let _guard = ctx.sync.shard_lock.write(ctx.timeout)?;
                let record_off = shard::record_off(&arena)?;
                let _state = shard::StateGuard::enter(arena, record_off, idx)?;
                match shard::insert_free_tiles(&arena, ids)? {
                    Ok(()) => return Ok(()),
                    Err(oos) => oos.requested,
                }
            };
            attempts += 1;
            ensure!(
                attempts <= OUT_OF_SPACE_RETRIES,
                "shard {:02x} ToC out of space seeding free tiles",
                idx
            );
            self.shards[idx].grow(&ctx, needed)?;
        }
    }

    /// Routes freed tiles back to their owning shards' free sets (ascending
    /// shard order) and punches out their pages. Caller must hold no shard
    /// or tile locks.
    pub(crate) fn release_tiles(&self, ids: &[TileId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let shm = self.shm.read();
        let shared = shm.state();
        {
            let _tiles = shared.tiles_lock.read(self.config.lock_timeout)?;
            for id in ids {
                self.tiles.invalidate(*id)?;
            }
        }

        let mut by_shard: Vec<Vec<TileId>> = vec![Vec::new(); SHARD_COUNT];
        for id in ids {
            by_shard[id.owning_shard()].push(*id);
        }
        for (idx, ids) in by_shard.iter().enumerate() {
            self.insert_free_tiles_grow(shared, idx, ids)?;
        }
        Ok(())
    }

    /// Post-insert hook: best-effort eviction to the configured ceiling.
    pub(crate) fn evict_after_insert(&self) {
        let target = self.max_size();
        if let Err(err) = eviction::evict_to(self, target) {
            if is_recovery_signal(&err) {
                warn!("eviction hit abandoned state, recovering");
                self.recover_and_wipe();
            } else {
                warn!(error = %err, "post-insert eviction failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Runs the full recovery path (segment reinitialization + wipe),
    /// swallowing secondary failures. Called after a recovery signal has
    /// already unwound to a boundary.
    pub(crate) fn recover_and_wipe(&self) {
        if let Err(err) = self.ensure_shared_memory_integrity() {
            warn!(error = %err, "shared memory recovery failed");
        }
    }

    /// The abandonment-recovery procedure. The first thread of this
    /// process to time out performs it; late thread arrivals wait for its
    /// completion. Reinitializes the shared segment via the semaphore
    /// handshake, then wipes the cache contents.
    fn ensure_shared_memory_integrity(&self) -> Result<()> {
        {
            let mut state = self.recovery.state.lock();
            state.0 += 1;
            if state.0 > 1 {
                let gen = state.1;
                while state.1 == gen {
                    self.recovery.cond.wait(&mut state);
                }
                state.0 -= 1;
                return Ok(());
            }
        }

        debug!("reinitializing shared lock segment after abandonment");
        let result = (|| -> Result<()> {
            {
                let mut shm = self.shm.write();
                if self.config.persistent {
                    let mut lock_slot = self.file_lock.lock();
                    let lock = lock_slot
                        .as_mut()
                        .ok_or_else(|| eyre::eyre!("persistent cache without a file lock"))?;
                    let (sem_valid, sem_invalid) = self
                        .sems
                        .as_ref()
                        .ok_or_else(|| eyre::eyre!("persistent cache without semaphores"))?;
                    *shm = reinit_shared_segment(&self.config, lock, sem_valid, sem_invalid)?;
                } else {
                    *shm = SharedSegment::anonymous()?;
                }
                // The fresh segment's coordination words are zero; declare
                // our still-mapped ToCs before anyone drains them.
                let shared = shm.state();
                for (idx, shard) in self.shards.iter().enumerate() {
                    shard.reregister(shared.shard(idx));
                }
            }
            self.wipe_all()
        })();

        let mut state = self.recovery.state.lock();
        state.0 -= 1;
        state.1 += 1;
        self.recovery.cond.notify_all();
        result
    }

    /// Wipes every shard's ToC and every tile file, then reseeds the free
    /// sets so the tile partition holds again.
    pub(crate) fn wipe_all(&self) -> Result<()> {
        warn!("wiping cache contents");
        {
            let shm = self.shm.read();
            let shared = shm.state();
            for idx in 0..SHARD_COUNT {
                let ctx = self.shard_ctx(shared, idx);
                self.shards[idx].wipe(&ctx)?;
            }

            let _tiles = shared.tiles_lock.write(self.config.lock_timeout)?;
            self.tiles.wipe()?;
            for file_index in 0..self.tiles.file_count() {
                self.seed_file(shared, file_index)?;
            }
        }
        Ok(())
    }
}

/// Steps 2-7 of the recovery protocol: every timed-out process posts
/// "invalid", releases its shared file-lock hold and races for the
/// exclusive lock; the winner rebuilds the segment; everyone re-opens,
/// handshakes through the semaphores and falls back to a shared hold.
fn reinit_shared_segment(
    config: &CacheConfig,
    lock: &mut FileLock,
    sem_valid: &NamedSemaphore,
    sem_invalid: &NamedSemaphore,
) -> Result<SharedSegment> {
    sem_invalid.post()?;
    lock.unlock()?;

    // Eventually succeeds: dead peers' holds were released by the kernel,
    // live peers release on their own timeout path.
    lock.lock_exclusive()?;

    let segment = if sem_valid.try_wait() {
        // Another recovering process already rebuilt the segment.
        SharedSegment::open(&config.shm_name())?
    } else {
        SharedSegment::create(&config.shm_name())?
    };

    sem_valid.post()?;
    let _ = sem_invalid.wait_timeout(config.lock_timeout)?;
    lock.unlock()?;

    // Drain: spin until every other recovering process has also observed
    // a valid mapping (its "invalid" post has been consumed and re-posted
    // by someone who has already passed the barrier).
    let deadline = Instant::now() + config.lock_timeout;
    while Instant::now() < deadline {
        if !sem_invalid.try_wait() {
            break;
        }
        sem_invalid.post()?;
        std::thread::sleep(Duration::from_millis(1));
    }

    lock.lock_shared()?;
    Ok(segment)
}
