//! # Eviction Engine
//!
//! Keeps the cache's total footprint under the configured ceiling by
//! removing least-recently-used entries, round-robin across shards so no
//! single shard is drained while others stay full.
//!
//! Eviction is best effort: it runs after insertions (and on demand), it
//! never blocks progress when the content is inherently larger than the
//! target, and it stops as soon as a full round over all shards evicts
//! nothing.

use eyre::Result;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{lru, shard, CacheInner};
use crate::config::constants::SHARD_COUNT;
use crate::storage::TileId;

/// Sum of every shard's billed bytes.
pub(crate) fn total_size(inner: &CacheInner) -> Result<u64> {
    let shm = inner.shm.read();
    let shared = shm.state();
    let mut total = 0u64;
    for idx in 0..SHARD_COUNT {
        let ctx = inner.shard_ctx(shared, idx);
        let toc = inner.shards[idx].lock_toc_read(&ctx)?;
        let arena = toc.arena();
        let _guard = ctx.sync.shard_lock.read(ctx.timeout)?;
        total += shard::record(&arena)?.shard_size();
    }
    Ok(total)
}

/// Evicts until the total footprint is at most `target`, or until a full
/// round over every shard frees nothing (everything left is unevictable).
pub(crate) fn evict_to(inner: &CacheInner, target: u64) -> Result<()> {
    loop {
        let mut current = total_size(inner)?;
        if current <= target {
            return Ok(());
        }

        let mut evicted_any = false;
        for idx in 0..SHARD_COUNT {
            if current <= target {
                break;
            }
            if let Some((billed, tiles)) = evict_front(inner, idx)? {
                trace!(shard = idx, billed, "evicted LRU entry");
                current = current.saturating_sub(billed);
                evicted_any = true;
                inner.release_tiles(&tiles)?;
            }
        }

        if !evicted_any {
            debug!(current, target, "eviction stopped: nothing left to evict");
            return Ok(());
        }
    }
}

/// Removes the least recently used entry of one shard, if it has any.
/// Returns the billed bytes freed and the tiles to redistribute.
#[allow(clippy::type_complexity)]
fn evict_front(
    inner: &CacheInner,
    idx: usize,
) -> Result<Option<(u64, SmallVec<[TileId; 16]>)>> {
    let shm = inner.shm.read();
    let shared = shm.state();
    let ctx = inner.shard_ctx(shared, idx);
    let toc = inner.shards[idx].lock_toc_read(&ctx)?;
    let arena = toc.arena();

    let _guard = ctx.sync.shard_lock.write(ctx.timeout)?;
    let record_off = shard::record_off(&arena)?;
    let _state = shard::StateGuard::enter(arena, record_off, idx)?;

    let front = {
        let _lru = ctx.sync.lru_lock.lock(ctx.timeout)?;
        lru::front(&arena)?
    };
    let Some(entry_off) = front else {
        return Ok(None);
    };

    let (billed, tiles) =
        shard::deallocate_entry(&arena, &ctx, entry_off, inner.config.tile_size as u64)?;
    Ok(Some((billed, tiles)))
}
