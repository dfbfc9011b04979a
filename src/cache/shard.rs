//! # Cache Shards
//!
//! The cache splits into 256 independent shards, each owning a ToC mapping
//! (an [`Arena`] whose root is the [`ShardRecord`]), so concurrent callers
//! rarely contend: a key's shard is its top byte.
//!
//! This module holds everything per-shard:
//!
//! - the **remap protocol** coordinating ToC growth between processes
//!   (`lock_toc_read` / `grow`), driven by the `mapping_valid` and
//!   `active_readers` words in the shared lock segment;
//! - the **shard record** with the entry index, LRU endpoints, free-tile
//!   set, size accounting and the corruption sentinel;
//! - entry **index and deallocation** primitives used by the locker and
//!   the eviction engine.
//!
//! ## Lock discipline
//!
//! Interprocess locks first, the process-local mapping lock second, and
//! the local lock is never held across an interprocess acquisition or a
//! futex wait. Mutating the record requires the shard's interprocess
//! `shard_lock` exclusively plus the ToC lock at least shared.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use parking_lot::{RwLock, RwLockReadGuard};
use smallvec::SmallVec;
use tracing::{debug, warn};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{AbandonedLock, CorruptedCache};
use crate::ipc::futex;
use crate::ipc::locks::SharedReadGuard;
use crate::ipc::ShardSync;
use crate::storage::{Arena, MappedFile, OutOfSpace, RelVec, TileId};
use crate::zerocopy_accessors;

/// Sentinel values of [`ShardRecord::state`].
const BUCKET_OK: u32 = 0;
const BUCKET_IN_PROGRESS: u32 = 1;

/// Root record of a shard's ToC heap.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ShardRecord {
    /// Layout version; a mismatch at open wipes the shard.
    version: U32,
    /// Corruption sentinel: `BUCKET_IN_PROGRESS` while a mutating
    /// operation runs. Seeing it on entry means a peer died mid-mutation.
    state: U32,
    /// Bytes billed to this shard: payload bytes plus owned tile bytes.
    shard_size: U64,
    /// Arena offset of the least recently used entry (eviction candidate).
    lru_front: U64,
    /// Arena offset of the most recently used entry.
    lru_back: U64,
    /// Sorted (key, entry offset) pairs.
    pub entries: RelVec,
    /// Sorted encoded ids of tiles owned by this shard and currently free.
    pub free_tiles: RelVec,
}

impl ShardRecord {
    zerocopy_accessors! {
        version: u32,
        shard_size: u64,
        lru_front: u64,
        lru_back: u64,
    }

    pub fn is_ok(&self) -> bool {
        self.state.get() == BUCKET_OK
    }

    fn set_state_raw(&mut self, raw: u32) {
        self.state = U32::new(raw);
    }
}

/// RAII corruption sentinel. Entering any mutating shard operation flips
/// the record to `InProgress`; every exit path restores `Ok`. A record
/// found `InProgress` on entry belonged to a process that died mid-write.
pub struct StateGuard {
    arena: Arena,
    record_off: u64,
}

impl StateGuard {
    pub fn enter(arena: Arena, record_off: u64, shard_index: usize) -> Result<Self> {
        let record = arena.get_mut::<ShardRecord>(record_off)?;
        if !record.is_ok() {
            return Err(eyre::Report::new(CorruptedCache { shard: shard_index }));
        }
        record.set_state_raw(BUCKET_IN_PROGRESS);
        Ok(Self { arena, record_off })
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        if let Ok(record) = self.arena.get_mut::<ShardRecord>(self.record_off) {
            record.set_state_raw(BUCKET_OK);
        }
    }
}

/// Interprocess context a shard operation runs under.
#[derive(Clone, Copy)]
pub struct ShardCtx<'a> {
    pub sync: &'a ShardSync,
    pub timeout: Duration,
    pub quantum: usize,
    pub layout_version: u32,
}

impl ShardCtx<'_> {
    fn remaining(&self, deadline: Instant) -> Result<Duration> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(eyre::Report::new(AbandonedLock {
                timeout_ms: self.timeout.as_millis() as u64,
            }));
        }
        Ok(left)
    }
}

/// Drops this process's contribution to `active_readers` and wakes any
/// grower draining the mapping. Guarded against underflow: a recreated
/// lock segment starts every counter at zero even though mappings exist.
fn release_reader(sync: &ShardSync) {
    let _ = sync
        .active_readers
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
    futex::wake_all(&sync.active_readers);
}

/// Shared hold on a shard's ToC mapping: the interprocess ToC lock plus
/// the process-local mapping guard. While this exists the mapping cannot
/// move and `arena()` views are valid.
pub struct TocRead<'a> {
    _ipc: SharedReadGuard<'a>,
    map: RwLockReadGuard<'a, MappedFile>,
}

impl TocRead<'_> {
    pub fn arena(&self) -> Arena {
        Arena::new(self.map.base(), self.map.len())
    }
}

/// One cache shard: process-local handle over the mapped ToC file.
pub struct Shard {
    pub index: usize,
    path: Option<PathBuf>,
    toc: RwLock<MappedFile>,
}

impl Shard {
    /// Opens (or adopts) the shard's ToC, formatting a fresh heap when the
    /// file is new or carries a different layout version.
    pub fn open(index: usize, path: Option<PathBuf>, ctx: &ShardCtx<'_>) -> Result<Self> {
        let deadline = Instant::now() + ctx.timeout;
        let map = match &path {
            Some(p) => MappedFile::open_or_create(p, ctx.quantum)
                .wrap_err_with(|| format!("failed to open ToC for shard {:02x}", index))?,
            None => MappedFile::anonymous(ctx.quantum)?,
        };
        let shard = Self {
            index,
            path,
            toc: RwLock::new(map),
        };

        loop {
            let ipc = ctx.sync.toc_lock.write(ctx.remaining(deadline)?)?;
            let valid = ctx.sync.mapping_valid.load(Ordering::Acquire);
            let readers = ctx.sync.active_readers.load(Ordering::Acquire);
            if valid == 0 && readers > 0 {
                // A peer is mid-grow; wait it out before adopting a size.
                drop(ipc);
                futex::wait(&ctx.sync.mapping_valid, 0, Some(ctx.remaining(deadline)?));
                continue;
            }

            let mut map = shard.toc.write();
            map.remap()?;
            let arena = Arena::new(map.base(), map.len());
            if !arena.is_formatted(ctx.layout_version) {
                if let Some(stored) = arena.stored_version() {
                    warn!(
                        shard = index,
                        stored,
                        expected = ctx.layout_version,
                        "ToC layout version mismatch, wiping shard"
                    );
                }
                map.wipe(ctx.quantum)?;
                let arena = Arena::new(map.base(), map.len());
                arena.format(ctx.layout_version)?;
            }
            let arena = Arena::new(map.base(), map.len());
            Self::construct_root(&arena, ctx.layout_version)?;

            ctx.sync.active_readers.fetch_add(1, Ordering::AcqRel);
            ctx.sync.mapping_valid.store(1, Ordering::Release);
            futex::wake_all(&ctx.sync.mapping_valid);
            drop(map);
            drop(ipc);
            return Ok(shard);
        }
    }

    /// `find_or_construct` of the root [`ShardRecord`].
    fn construct_root(arena: &Arena, layout_version: u32) -> Result<u64> {
        let root = arena.root()?;
        if root != 0 {
            return Ok(root);
        }
        let off = match arena.allocate(std::mem::size_of::<ShardRecord>() as u64)? {
            Ok(off) => off,
            Err(oos) => {
                return Err(eyre::Report::new(oos))
                    .wrap_err("fresh ToC cannot hold its own shard record")
            }
        };
        let record = arena.get_mut::<ShardRecord>(off)?;
        record.set_version(layout_version);
        record.set_state_raw(BUCKET_OK);
        arena.set_root(off)?;
        Ok(off)
    }

    /// Acquires the ToC for reading, participating in any in-flight remap
    /// per the coordination words (see module docs).
    pub fn lock_toc_read<'a>(&'a self, ctx: &ShardCtx<'a>) -> Result<TocRead<'a>> {
        let deadline = Instant::now() + ctx.timeout;
        loop {
            let ipc = ctx.sync.toc_lock.read(ctx.remaining(deadline)?)?;
            if ctx.sync.mapping_valid.load(Ordering::Acquire) == 1 {
                let map = self.toc.read();
                if map.is_mapped() {
                    return Ok(TocRead { _ipc: ipc, map });
                }
                drop(map);
            }
            drop(ipc);

            // Participate in the remap: surrender our mapping so the
            // growing peer can resize, then wait for the new size.
            let ipc = ctx.sync.toc_lock.write(ctx.remaining(deadline)?)?;
            {
                let mut map = self.toc.write();
                if ctx.sync.mapping_valid.load(Ordering::Acquire) == 0 {
                    if map.is_mapped() {
                        map.unmap();
                        release_reader(ctx.sync);
                    }
                } else if !map.is_mapped() {
                    map.remap()?;
                    Arena::new(map.base(), map.len()).adopt_capacity()?;
                    ctx.sync.active_readers.fetch_add(1, Ordering::AcqRel);
                }
            }
            drop(ipc);

            if ctx.sync.mapping_valid.load(Ordering::Acquire) == 0 {
                futex::wait(&ctx.sync.mapping_valid, 0, Some(ctx.remaining(deadline)?));
            }
        }
    }

    /// Grows the ToC file by at least `min_free` more usable bytes,
    /// rounded up to the growth quantum, draining every peer's mapping
    /// first. On return the mapping is valid at the new size.
    pub fn grow(&self, ctx: &ShardCtx<'_>, min_free: u64) -> Result<()> {
        let deadline = Instant::now() + ctx.timeout;
        let quantum = ctx.quantum as u64;
        let add = min_free.div_ceil(quantum).max(1) * quantum;

        loop {
            let ipc = ctx.sync.toc_lock.write(ctx.remaining(deadline)?)?;
            let seen;
            {
                let mut map = self.toc.write();
                if ctx.sync.mapping_valid.load(Ordering::Acquire) == 1 && map.is_mapped() {
                    let arena = Arena::new(map.base(), map.len());
                    if arena.bump_remaining()? >= min_free {
                        // A racing grower already made room.
                        return Ok(());
                    }
                }

                ctx.sync.mapping_valid.store(0, Ordering::Release);
                if map.is_mapped() {
                    map.unmap();
                    release_reader(ctx.sync);
                }

                let readers = ctx.sync.active_readers.load(Ordering::Acquire);
                if readers == 0 {
                    // Every process is unmapped: resize and republish.
                    map.remap()?;
                    let new_size = map.len() as u64 + add;
                    map.resize(new_size as usize)?;
                    let arena = Arena::new(map.base(), map.len());
                    arena.adopt_capacity()?;
                    ctx.sync.active_readers.fetch_add(1, Ordering::AcqRel);
                    ctx.sync.mapping_valid.store(1, Ordering::Release);
                    futex::wake_all(&ctx.sync.mapping_valid);
                    debug!(shard = self.index, new_size, "ToC grown");
                    return Ok(());
                }
                seen = readers;
            }
            drop(ipc);
            futex::wait(&ctx.sync.active_readers, seen, Some(ctx.remaining(deadline)?));
        }
    }

    /// Re-truncates the ToC to one quantum and reformats it. Caller holds
    /// the ToC lock exclusively through `ctx` conventions (used by the
    /// full-cache wipe, which serializes all access at a higher level).
    pub fn wipe(&self, ctx: &ShardCtx<'_>) -> Result<()> {
        let deadline = Instant::now() + ctx.timeout;
        loop {
            let ipc = ctx.sync.toc_lock.write(ctx.remaining(deadline)?)?;
            let seen;
            {
                let mut map = self.toc.write();
                ctx.sync.mapping_valid.store(0, Ordering::Release);
                if map.is_mapped() {
                    map.unmap();
                    release_reader(ctx.sync);
                }
                let readers = ctx.sync.active_readers.load(Ordering::Acquire);
                if readers == 0 {
                    map.remap()?;
                    map.wipe(ctx.quantum)?;
                    let arena = Arena::new(map.base(), map.len());
                    arena.format(ctx.layout_version)?;
                    Self::construct_root(&arena, ctx.layout_version)?;
                    ctx.sync.active_readers.fetch_add(1, Ordering::AcqRel);
                    ctx.sync.mapping_valid.store(1, Ordering::Release);
                    futex::wake_all(&ctx.sync.mapping_valid);
                    debug!(shard = self.index, "ToC wiped");
                    return Ok(());
                }
                seen = readers;
            }
            drop(ipc);
            futex::wait(&ctx.sync.active_readers, seen, Some(ctx.remaining(deadline)?));
        }
    }

    /// Declares this process's live mapping to a freshly created lock
    /// segment. The recovery path swaps the segment for a zeroed one,
    /// which forgets that we are a registered reader; without this, the
    /// next drain would never account for us.
    pub fn reregister(&self, sync: &ShardSync) {
        let map = self.toc.read();
        if map.is_mapped() {
            sync.active_readers.fetch_add(1, Ordering::AcqRel);
            sync.mapping_valid.store(1, Ordering::Release);
        }
    }

    /// Flushes the ToC mapping to disk, best effort.
    pub fn sync_best_effort(&self) {
        let map = self.toc.read();
        if map.is_mapped() {
            let _ = map.sync();
        }
    }

    pub fn toc_path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Record-level helpers (run under toc shared + shard_lock as documented)
// ---------------------------------------------------------------------------

/// Resolves the root record of a held ToC view.
pub fn record_off(arena: &Arena) -> Result<u64> {
    let off = arena.root()?;
    ensure!(off != 0, "shard record missing from ToC heap");
    Ok(off)
}

#[allow(clippy::mut_from_ref)]
pub fn record_mut<'a>(arena: &'a Arena) -> Result<&'a mut ShardRecord> {
    arena.get_mut::<ShardRecord>(record_off(arena)?)
}

pub fn record<'a>(arena: &'a Arena) -> Result<&'a ShardRecord> {
    arena.get::<ShardRecord>(record_off(arena)?)
}

/// Looks up the entry offset for `key`. Requires `shard_lock` shared.
pub fn lookup(arena: &Arena, key: u64) -> Result<Option<u64>> {
    record(arena)?.entries.map_get(arena, key)
}

/// Inserts `key -> entry_off` into the index. Requires `shard_lock`
/// exclusive. May report [`OutOfSpace`].
pub fn index_insert(
    arena: &Arena,
    key: u64,
    entry_off: u64,
) -> Result<std::result::Result<(), OutOfSpace>> {
    record_mut(arena)?.entries.map_insert(arena, key, entry_off)
}

/// Removes an entry from the ToC: detaches the LRU node, returns its tiles
/// for redistribution, frees every arena block, erases the index pair, and
/// subtracts the billing from `shard_size`.
///
/// Requires `shard_lock` exclusive and the LRU lock NOT held (it is taken
/// here). Returns `(bytes_unbilled, tile_ids)`; the caller routes the tile
/// ids back to their owning shards' free sets.
pub fn deallocate_entry(
    arena: &Arena,
    ctx: &ShardCtx<'_>,
    entry_off: u64,
    tile_size: u64,
) -> Result<(u64, SmallVec<[TileId; 16]>)> {
    let (key, byte_size, tiles): (u64, u64, SmallVec<[TileId; 16]>) = {
        let entry = arena.get::<super::entry::EntryHeader>(entry_off)?;
        let ids = entry
            .tiles
            .as_slice(arena)?
            .iter()
            .map(|s| TileId::from_encoded(s.get()))
            .collect();
        (entry.key(), entry.byte_size(), ids)
    };

    {
        let _lru = ctx.sync.lru_lock.lock(ctx.timeout)?;
        super::lru::unlink(arena, entry_off)?;
    }

    let (payload_off, plugin_off, mut tiles_vec) = {
        let entry = arena.get_mut::<super::entry::EntryHeader>(entry_off)?;
        let p = entry.payload_off();
        let g = entry.plugin_id_off();
        let t = entry.tiles;
        entry.tiles = RelVec::empty();
        (p, g, t)
    };
    tiles_vec.clear_free(arena)?;
    if payload_off != 0 {
        arena.free(payload_off)?;
    }
    if plugin_off != 0 {
        arena.free(plugin_off)?;
    }
    arena.free(entry_off)?;

    let record = record_mut(arena)?;
    record.entries.map_remove(arena, key)?;
    let billed = byte_size + tiles.len() as u64 * tile_size;
    record.set_shard_size(record.shard_size().saturating_sub(billed));

    Ok((billed, tiles))
}

/// Pops the smallest free tile of this shard, if any. Requires
/// `shard_lock` exclusive.
pub fn pop_free_tile(arena: &Arena) -> Result<Option<TileId>> {
    let record = record_mut(arena)?;
    match record.free_tiles.first(arena)? {
        None => Ok(None),
        Some(encoded) => {
            record.free_tiles.remove_sorted(arena, encoded)?;
            Ok(Some(TileId::from_encoded(encoded)))
        }
    }
}

/// Returns tiles to this shard's free set: one up-front reservation (the
/// only fallible step), then infallible insertions. Requires `shard_lock`
/// exclusive.
pub fn insert_free_tiles(
    arena: &Arena,
    ids: &[TileId],
) -> Result<std::result::Result<(), OutOfSpace>> {
    let record = record_mut(arena)?;
    if let Err(oos) = record.free_tiles.reserve_exact(arena, ids.len() as u64)? {
        return Ok(Err(oos));
    }
    for id in ids {
        record
            .free_tiles
            .insert_sorted(arena, id.encoded())?
            .expect("reserved insert cannot run out of space");
    }
    Ok(Ok(()))
}
