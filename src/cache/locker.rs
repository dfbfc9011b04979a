//! # Entry Locker
//!
//! Every cache access flows through an [`EntryLocker`]: look the key up,
//! and end in exactly one of three states:
//!
//! - **Cached** — the payload deserialized into the caller's object; done.
//! - **ComputationPending** — another thread or process reserved the key
//!   and is computing it; [`EntryLocker::wait`] polls until it is Ready or
//!   the owner times out.
//! - **MustCompute** — this locker reserved the key (status Pending, owner
//!   tag stamped); the caller computes, then [`EntryLocker::insert`]s.
//!   Dropping without inserting rolls the reservation back.
//!
//! ## Races
//!
//! The lookup runs twice — once under the shard lock shared, again under
//! it exclusive — so concurrent callers for one key resolve to exactly one
//! MustCompute and the rest ComputationPending. Owner tags are only
//! meaningful within the process that wrote them: a peer process's Pending
//! entry is always "wait", never "mine". A same-thread re-entry (the
//! computation of an entry recursively fetching itself) is detected by tag
//! and resolved as a takeover instead of a self-deadlock.
//!
//! ## Waiting
//!
//! There is no interprocess per-entry condition variable: it would have to
//! live in the ToC mapping and survive remaps. Waiters poll, with the
//! interval growing 1.2x per iteration, re-running the lookup each time; a
//! caller-supplied timeout promotes the waiter to MustCompute (takeover).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::Result;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::entry::{EntryHeader, EntryState};
use super::payload::{
    check_trailer, CachePayload, DeserializeOutcome, PayloadReader, PayloadWriter,
    PAYLOAD_TRAILER_SIZE,
};
use super::{lru, shard, CacheInner};
use crate::config::constants::{
    OUT_OF_SPACE_RETRIES, WAIT_POLL_GROWTH, WAIT_POLL_MAX_MS, WAIT_POLL_START_MS,
};
use crate::error::Aborted;
use crate::storage::{Arena, TileId};

/// Result of constructing or re-polling a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerStatus {
    /// The payload was retrieved; the caller's object is filled in.
    Cached,
    /// Another thread or process is computing this entry.
    ComputationPending,
    /// This locker holds the reservation; compute and insert.
    MustCompute,
}

/// A unique tag for the current thread, stable for its lifetime and never
/// zero. Folded with the pid so tags from different processes differ too,
/// although the protocol never compares tags across processes.
pub(crate) fn current_thread_tag() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TAG: u64 = {
            let n = NEXT.fetch_add(1, Ordering::Relaxed);
            ((std::process::id() as u64) << 32) | n
        };
    }
    TAG.with(|t| *t)
}

enum ReadOutcome {
    Ok,
    Failed,
    NeedWriteLock,
}

/// Caller-visible handle over one entry's lifecycle.
pub struct EntryLocker<'p, P: CachePayload> {
    inner: Arc<CacheInner>,
    payload: &'p mut P,
    key: u64,
    shard_idx: usize,
    tag: u64,
    status: LockerStatus,
    plugin_id: String,
    staged_tiles: Vec<TileId>,
    inserted: bool,
    abort: Option<Arc<AtomicBool>>,
}

impl<'p, P: CachePayload> EntryLocker<'p, P> {
    pub(crate) fn create(
        inner: Arc<CacheInner>,
        key: u64,
        payload: &'p mut P,
    ) -> Result<Self> {
        let mut locker = Self {
            shard_idx: (key >> 56) as usize,
            tag: current_thread_tag(),
            status: LockerStatus::MustCompute,
            plugin_id: payload.holder_id().to_string(),
            staged_tiles: Vec::new(),
            inserted: false,
            abort: None,
            inner,
            payload,
            key,
        };
        // First lookup never takes over on timeout. An abandoned or
        // corrupted cache recovers here and degrades to MustCompute: the
        // freshly wiped cache simply has nothing for this key.
        match locker.lookup_and_set_status(Duration::ZERO, None) {
            Ok(()) => {}
            Err(err) if crate::error::is_recovery_signal(&err) => {
                warn!(error = %err, "lookup hit abandoned state, recovering");
                locker.inner.recover_and_wipe();
                locker.status = LockerStatus::MustCompute;
                locker.lookup_and_set_status(Duration::ZERO, None)?;
            }
            Err(err) => return Err(err),
        }
        Ok(locker)
    }

    pub fn status(&self) -> LockerStatus {
        self.status
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn payload(&self) -> &P {
        self.payload
    }

    /// The object being computed; only meaningful in MustCompute.
    pub fn payload_mut(&mut self) -> &mut P {
        self.payload
    }

    /// Installs a cancellation flag checked between wait polls.
    pub fn set_abort_flag(&mut self, flag: Arc<AtomicBool>) {
        self.abort = Some(flag);
    }

    /// Tile ids staged for this reservation so far.
    pub fn staged_tiles(&self) -> &[TileId] {
        &self.staged_tiles
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// One full lookup pass: read path, then write path when the read path
    /// cannot settle the status. `elapsed`/`caller_timeout` implement the
    /// takeover rule while waiting.
    fn lookup_and_set_status(
        &mut self,
        elapsed: Duration,
        caller_timeout: Option<Duration>,
    ) -> Result<()> {
        let timed_out = caller_timeout.is_some_and(|t| !t.is_zero() && elapsed >= t);
        let mut attempts = 0usize;

        loop {
            // Locks are confined to this block so tile releases and ToC
            // grows below run lock-free (tiles_lock orders before toc_lock).
            let next = {
                let inner = Arc::clone(&self.inner);
                let shm = inner.shm.read();
                let shared = shm.state();
                let ctx = inner.shard_ctx(shared, self.shard_idx);
                let toc = inner.shards[self.shard_idx].lock_toc_read(&ctx)?;
                let arena = toc.arena();

                // Read path under the shard lock shared.
                let settled = {
                    let _guard = ctx.sync.shard_lock.read(ctx.timeout)?;
                    match shard::lookup(&arena, self.key)? {
                        None => false,
                        Some(off) => {
                            let (state, owner) = {
                                let entry = arena.get::<EntryHeader>(off)?;
                                (entry.state(), entry.owner_tag())
                            };
                            match state {
                                EntryState::Ready => {
                                    match self.try_read_entry(&arena, off, false)? {
                                        ReadOutcome::Ok => {
                                            let _lru = ctx.sync.lru_lock.lock(ctx.timeout)?;
                                            lru::touch(&arena, off)?;
                                            self.status = LockerStatus::Cached;
                                            true
                                        }
                                        ReadOutcome::NeedWriteLock | ReadOutcome::Failed => false,
                                    }
                                }
                                EntryState::Pending if owner == self.tag => {
                                    if !self.payload.allow_multiple_fetch_per_thread() {
                                        warn!(
                                            key = format_args!("{:#018x}", self.key),
                                            "re-entrant fetch of a pending entry, taking over"
                                        );
                                    }
                                    false
                                }
                                EntryState::Pending if timed_out => false,
                                EntryState::Pending => {
                                    self.status = LockerStatus::ComputationPending;
                                    true
                                }
                                EntryState::Null => false,
                            }
                        }
                    }
                };

                if settled {
                    NextStep::Done
                } else {
                    self.write_path(&ctx, &arena, timed_out)?
                }
            };

            match next {
                NextStep::Done => return Ok(()),
                NextStep::Grow(bytes) => {
                    attempts += 1;
                    if attempts > OUT_OF_SPACE_RETRIES {
                        eyre::bail!(
                            "shard {:02x} ToC still out of space after {} grows",
                            self.shard_idx,
                            OUT_OF_SPACE_RETRIES
                        );
                    }
                    let shm = self.inner.shm.read();
                    let shared = shm.state();
                    let ctx = self.inner.shard_ctx(shared, self.shard_idx);
                    self.inner.shards[self.shard_idx].grow(&ctx, bytes)?;
                }
                NextStep::PurgeThenRetry(tiles) => {
                    self.inner.release_tiles(&tiles)?;
                }
            }
        }
    }

    /// The reservation pass, under the shard lock exclusive. Returns how
    /// the outer loop should proceed; `self.status` is set on `Done`.
    fn write_path(
        &mut self,
        ctx: &shard::ShardCtx<'_>,
        arena: &Arena,
        timed_out: bool,
    ) -> Result<NextStep> {
        let _guard = ctx.sync.shard_lock.write(ctx.timeout)?;
        let record_off = shard::record_off(arena)?;
        let _state = shard::StateGuard::enter(*arena, record_off, self.shard_idx)?;

        // Double-checked lookup: the world may have changed between locks.
        if let Some(off) = shard::lookup(arena, self.key)? {
            let (state, owner) = {
                let entry = arena.get::<EntryHeader>(off)?;
                (entry.state(), entry.owner_tag())
            };
            match state {
                EntryState::Ready => match self.try_read_entry(arena, off, true)? {
                    ReadOutcome::Ok => {
                        let _lru = ctx.sync.lru_lock.lock(ctx.timeout)?;
                        lru::touch(arena, off)?;
                        self.status = LockerStatus::Cached;
                        return Ok(NextStep::Done);
                    }
                    // NeedWriteLock while already holding write rights is a
                    // deserialization failure: purge and recompute.
                    ReadOutcome::NeedWriteLock | ReadOutcome::Failed => {
                        let (_, tiles) = shard::deallocate_entry(
                            arena,
                            ctx,
                            off,
                            self.inner.config.tile_size as u64,
                        )?;
                        return Ok(NextStep::PurgeThenRetry(tiles));
                    }
                },
                EntryState::Pending if owner == self.tag || timed_out => {
                    // Takeover (same-thread re-entry, or the foreign owner
                    // exceeded the caller's patience).
                    if owner != self.tag {
                        debug!(
                            key = format_args!("{:#018x}", self.key),
                            "taking over a timed-out pending entry"
                        );
                    }
                    let entry = arena.get_mut::<EntryHeader>(off)?;
                    entry.set_owner_tag(self.tag);
                    self.status = LockerStatus::MustCompute;
                    return Ok(NextStep::Done);
                }
                EntryState::Pending => {
                    self.status = LockerStatus::ComputationPending;
                    return Ok(NextStep::Done);
                }
                EntryState::Null => {
                    let (_, tiles) = shard::deallocate_entry(
                        arena,
                        ctx,
                        off,
                        self.inner.config.tile_size as u64,
                    )?;
                    if !tiles.is_empty() {
                        return Ok(NextStep::PurgeThenRetry(tiles));
                    }
                    // Fresh claim below.
                }
            }
        }

        // Reserve: construct a Pending entry, indexed but not yet in LRU.
        let entry_size = std::mem::size_of::<EntryHeader>() as u64;
        let off = match arena.allocate(entry_size)? {
            Ok(off) => off,
            Err(oos) => return Ok(NextStep::Grow(oos.requested)),
        };
        {
            let entry = arena.get_mut::<EntryHeader>(off)?;
            entry.set_key(self.key);
            entry.set_state(EntryState::Pending);
            entry.set_owner_tag(self.tag);
        }
        if shard::index_insert(arena, self.key, off)?.is_err() {
            arena.free(off)?;
            return Ok(NextStep::Grow(entry_size * 4));
        }
        self.status = LockerStatus::MustCompute;
        Ok(NextStep::Done)
    }

    /// Deserializes a Ready entry into the caller's payload, verifying the
    /// trailer tag and the reconstructed content hash.
    fn try_read_entry(
        &mut self,
        arena: &Arena,
        entry_off: u64,
        has_write_lock: bool,
    ) -> Result<ReadOutcome> {
        let entry = arena.get::<EntryHeader>(entry_off)?;
        let Some(block) = entry.payload(arena)? else {
            return Ok(ReadOutcome::Failed);
        };
        let Some(bytes) = check_trailer(block, self.key) else {
            debug!(
                key = format_args!("{:#018x}", self.key),
                "stored payload failed its hash tag, purging"
            );
            return Ok(ReadOutcome::Failed);
        };

        let mut reader = PayloadReader::new(bytes);
        match self.payload.deserialize(&mut reader, has_write_lock)? {
            DeserializeOutcome::Ok => {
                if self.payload.content_hash() != self.key {
                    debug!(
                        key = format_args!("{:#018x}", self.key),
                        "deserialized content hash mismatch, purging"
                    );
                    return Ok(ReadOutcome::Failed);
                }
                Ok(ReadOutcome::Ok)
            }
            DeserializeOutcome::Failed => Ok(ReadOutcome::Failed),
            DeserializeOutcome::NeedWriteLock => Ok(ReadOutcome::NeedWriteLock),
        }
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Polls until the entry leaves ComputationPending. With a nonzero
    /// `timeout`, expiry promotes this locker to MustCompute (takeover).
    /// Observes the abort flag between polls.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<LockerStatus> {
        if self.status != LockerStatus::ComputationPending {
            return Ok(self.status);
        }

        let started = Instant::now();
        let mut interval_ms = WAIT_POLL_START_MS as f64;
        loop {
            if let Some(flag) = &self.abort {
                if flag.load(Ordering::Acquire) {
                    return Err(eyre::Report::new(Aborted));
                }
            }

            let observer = self.inner.config.wait_observer.clone();
            observer.on_wait_begin();
            std::thread::sleep(Duration::from_millis(interval_ms as u64));
            observer.on_wait_end();
            interval_ms = (interval_ms * WAIT_POLL_GROWTH).min(WAIT_POLL_MAX_MS as f64);

            match self.lookup_and_set_status(started.elapsed(), timeout) {
                Ok(()) => {}
                Err(err) if crate::error::is_recovery_signal(&err) => {
                    warn!(error = %err, "wait poll hit abandoned state, recovering");
                    self.inner.recover_and_wipe();
                    self.status = LockerStatus::MustCompute;
                    return Ok(self.status);
                }
                Err(err) => return Err(err),
            }
            if self.status != LockerStatus::ComputationPending {
                return Ok(self.status);
            }
        }
    }

    // ------------------------------------------------------------------
    // Tiles
    // ------------------------------------------------------------------

    /// Claims `count` tiles for this reservation. They are billed and
    /// attached to the entry at insert; dropped without insert, they
    /// return to their owners' free sets.
    pub fn allocate_tiles(&mut self, count: usize) -> Result<Vec<TileId>> {
        eyre::ensure!(
            self.status == LockerStatus::MustCompute && !self.inserted,
            "tiles can only be allocated while holding the reservation"
        );
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match self.inner.allocate_tile(self.shard_idx) {
                Ok(id) => out.push(id),
                Err(err) => {
                    // Roll back this batch; already-staged tiles stay.
                    self.inner.release_tiles(&out)?;
                    return Err(err);
                }
            }
        }
        self.staged_tiles.extend_from_slice(&out);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Publishes the computed payload: serializes it into the ToC, tags
    /// it, bills the shard, links the LRU node and flips the entry Ready.
    pub fn insert(&mut self) -> Result<()> {
        match self.insert_impl() {
            Err(err) if crate::error::is_recovery_signal(&err) => {
                // Soft failure: the cache recovered and wiped, the entry
                // is simply not cached. The caller keeps its computed
                // payload and moves on.
                warn!(error = %err, "insert hit abandoned state, recovering");
                self.inner.recover_and_wipe();
                self.staged_tiles.clear();
                self.inserted = true;
                self.status = LockerStatus::Cached;
                Ok(())
            }
            other => other,
        }
    }

    fn insert_impl(&mut self) -> Result<()> {
        eyre::ensure!(
            self.status == LockerStatus::MustCompute && !self.inserted,
            "insert requires an unconsumed MustCompute locker"
        );

        let mut attempts = 0usize;
        loop {
            // Locks stay inside this block; grows and tile releases below
            // run without them (tiles_lock orders before toc_lock).
            let outcome = {
                let inner = Arc::clone(&self.inner);
                let shm = inner.shm.read();
                let shared = shm.state();
                let ctx = inner.shard_ctx(shared, self.shard_idx);
                let toc = inner.shards[self.shard_idx].lock_toc_read(&ctx)?;
                let arena = toc.arena();
                self.insert_locked(&ctx, &arena)?
            };

            let grow_bytes = match outcome {
                // Done without attaching (a recursive resolution published
                // first) and EntryGone (the cache was wiped under us) both
                // leave the staged tiles unattached; the cleanup below
                // returns them to the free sets (insertion is idempotent,
                // so a post-wipe reseed is harmless).
                InsertOutcome::Done | InsertOutcome::EntryGone => {
                    self.inserted = true;
                    break;
                }
                InsertOutcome::Grow(bytes) => bytes,
            };

            attempts += 1;
            if attempts > OUT_OF_SPACE_RETRIES {
                self.rollback();
                eyre::bail!(
                    "shard {:02x} ToC still out of space inserting after {} grows",
                    self.shard_idx,
                    OUT_OF_SPACE_RETRIES
                );
            }
            let shm = self.inner.shm.read();
            let shared = shm.state();
            let ctx = self.inner.shard_ctx(shared, self.shard_idx);
            self.inner.shards[self.shard_idx].grow(&ctx, grow_bytes)?;
        }

        // A successful publish cleared the staged list; anything left was
        // never attached to an entry and goes back to the free pool.
        if !self.staged_tiles.is_empty() {
            let staged = std::mem::take(&mut self.staged_tiles);
            self.inner.release_tiles(&staged)?;
        }

        self.status = LockerStatus::Cached;
        self.inner.evict_after_insert();
        Ok(())
    }

    /// One attempt under the locks.
    fn insert_locked(
        &mut self,
        ctx: &shard::ShardCtx<'_>,
        arena: &Arena,
    ) -> Result<InsertOutcome> {
        let _guard = ctx.sync.shard_lock.write(ctx.timeout)?;
        let record_off = shard::record_off(arena)?;
        let _state = shard::StateGuard::enter(*arena, record_off, self.shard_idx)?;

        let Some(off) = shard::lookup(arena, self.key)? else {
            return Ok(InsertOutcome::EntryGone);
        };

        {
            let entry = arena.get::<EntryHeader>(off)?;
            if entry.state() == EntryState::Ready && entry.owner_tag() == 0 {
                // A recursive resolution already published this entry.
                return Ok(InsertOutcome::Done);
            }
        }

        // Serialize payload + trailer into one arena block.
        let meta = self.payload.metadata_size() as u64;
        let block_size = meta + PAYLOAD_TRAILER_SIZE as u64;
        let payload_off = match arena.allocate(block_size)? {
            Ok(o) => o,
            Err(oos) => return Ok(InsertOutcome::Grow(oos.requested)),
        };
        let plugin_bytes = self.plugin_id.as_bytes();
        let plugin_off = if plugin_bytes.is_empty() {
            0
        } else {
            match arena.allocate(plugin_bytes.len() as u64)? {
                Ok(o) => o,
                Err(oos) => {
                    arena.free(payload_off)?;
                    return Ok(InsertOutcome::Grow(oos.requested + block_size));
                }
            }
        };

        let written = {
            let block = arena.bytes_mut(payload_off, block_size)?;
            let mut writer = PayloadWriter::new(&mut block[..meta as usize]);
            if let Err(err) = self.payload.serialize(&mut writer) {
                arena.free(payload_off)?;
                if plugin_off != 0 {
                    arena.free(plugin_off)?;
                }
                return Err(err.wrap_err("payload serialization failed"));
            }
            let written = writer.position();
            super::payload::write_trailer(block, written, self.key);
            written
        };
        if plugin_off != 0 {
            arena
                .bytes_mut(plugin_off, plugin_bytes.len() as u64)?
                .copy_from_slice(plugin_bytes);
        }

        // Attach the staged tiles.
        {
            let entry = arena.get_mut::<EntryHeader>(off)?;
            if entry
                .tiles
                .reserve_exact(arena, self.staged_tiles.len() as u64)?
                .is_err()
            {
                arena.free(payload_off)?;
                if plugin_off != 0 {
                    arena.free(plugin_off)?;
                }
                return Ok(InsertOutcome::Grow(self.staged_tiles.len() as u64 * 8 + block_size));
            }
            for id in &self.staged_tiles {
                entry
                    .tiles
                    .push(arena, id.encoded())?
                    .expect("reserved push cannot run out of space");
            }
        }

        let billed_payload = arena.allocation_size(payload_off)?
            + if plugin_off != 0 {
                arena.allocation_size(plugin_off)?
            } else {
                0
            };
        let tile_bytes = self.staged_tiles.len() as u64 * self.inner.config.tile_size as u64;

        {
            let entry = arena.get_mut::<EntryHeader>(off)?;
            entry.set_payload_off(payload_off);
            entry.set_payload_len(written as u64 + PAYLOAD_TRAILER_SIZE as u64);
            entry.set_plugin_id_off(plugin_off);
            entry.set_plugin_id_len(plugin_bytes.len() as u64);
            entry.set_byte_size(billed_payload);
        }
        {
            let record = shard::record_mut(arena)?;
            record.set_shard_size(record.shard_size() + billed_payload + tile_bytes);
        }
        {
            let _lru = ctx.sync.lru_lock.lock(ctx.timeout)?;
            lru::push_back(arena, off)?;
        }
        {
            let entry = arena.get_mut::<EntryHeader>(off)?;
            entry.set_owner_tag(0);
            entry.set_state(EntryState::Ready);
        }
        self.staged_tiles.clear();
        Ok(InsertOutcome::Done)
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Undoes an uncommitted reservation: destroys the Pending entry and
    /// returns staged tiles to their free sets. Runs on drop; failures
    /// escalate to the recovery path rather than propagating.
    fn rollback(&mut self) {
        let staged = std::mem::take(&mut self.staged_tiles);
        let result: Result<()> = (|| {
            {
                let shm = self.inner.shm.read();
                let shared = shm.state();
                let ctx = self.inner.shard_ctx(shared, self.shard_idx);
                let toc = self.inner.shards[self.shard_idx].lock_toc_read(&ctx)?;
                let arena = toc.arena();
                let _guard = ctx.sync.shard_lock.write(ctx.timeout)?;
                let record_off = shard::record_off(&arena)?;
                let _state = shard::StateGuard::enter(arena, record_off, self.shard_idx)?;

                if let Some(off) = shard::lookup(&arena, self.key)? {
                    let owned = {
                        let entry = arena.get::<EntryHeader>(off)?;
                        entry.state() == EntryState::Pending && entry.owner_tag() == self.tag
                    };
                    if owned {
                        let (_, tiles) = shard::deallocate_entry(
                            &arena,
                            &ctx,
                            off,
                            self.inner.config.tile_size as u64,
                        )?;
                        drop(_state);
                        drop(_guard);
                        drop(toc);
                        drop(shm);
                        self.inner.release_tiles(&tiles)?;
                    }
                }
            }
            self.inner.release_tiles(&staged)?;
            Ok(())
        })();

        if let Err(err) = result {
            if crate::error::is_recovery_signal(&err) {
                warn!("rollback hit abandoned state, starting recovery");
                self.inner.recover_and_wipe();
            } else {
                warn!(error = %err, "failed to roll back cache reservation");
            }
        }
    }
}

enum NextStep {
    Done,
    Grow(u64),
    PurgeThenRetry(SmallVec<[TileId; 16]>),
}

enum InsertOutcome {
    /// Entry published (or already published by a recursive resolution).
    Done,
    /// The entry vanished: the cache was wiped since the reservation.
    EntryGone,
    /// The ToC needs at least this many more bytes; grow and retry.
    Grow(u64),
}

impl<P: CachePayload> Drop for EntryLocker<'_, P> {
    fn drop(&mut self) {
        if self.status == LockerStatus::MustCompute && !self.inserted {
            self.rollback();
        }
    }
}
