//! # Intrusive LRU List
//!
//! Recency ordering over a shard's entries, stored entirely inside the ToC
//! mapping: each [`EntryHeader`](super::entry::EntryHeader) carries
//! `lru_prev`/`lru_next` arena offsets and the shard record holds the
//! `lru_front` (least recent, eviction candidate) and `lru_back` (most
//! recent) endpoints. Offsets survive remaps and mean the same thing in
//! every process mapping the file.
//!
//! Callers hold the shard's interprocess `lru_lock` for every operation
//! here — including pure reads of the endpoints, because a concurrent
//! unlink rewires them.
//!
//! An entry is in the list iff it was inserted (made Ready); Pending
//! reservations are indexed but not yet ordered.

use eyre::{ensure, Result};

use super::entry::EntryHeader;
use super::shard::{record, record_mut};
use crate::storage::Arena;

/// Detaches `entry_off` from the list, fixing the endpoints when it was
/// front and/or back. Detaching an entry that is not linked is a no-op.
pub fn unlink(arena: &Arena, entry_off: u64) -> Result<()> {
    let (prev, next) = {
        let entry = arena.get::<EntryHeader>(entry_off)?;
        (entry.lru_prev(), entry.lru_next())
    };

    let rec = record_mut(arena)?;
    let linked = prev != 0 || next != 0 || rec.lru_front() == entry_off;
    if !linked {
        return Ok(());
    }

    if prev != 0 {
        arena.get_mut::<EntryHeader>(prev)?.set_lru_next(next);
    } else {
        rec.set_lru_front(next);
    }
    if next != 0 {
        arena.get_mut::<EntryHeader>(next)?.set_lru_prev(prev);
    } else {
        rec.set_lru_back(prev);
    }

    let entry = arena.get_mut::<EntryHeader>(entry_off)?;
    entry.set_lru_prev(0);
    entry.set_lru_next(0);
    Ok(())
}

/// Appends `entry_off` as the most recently used. The entry must be
/// detached (fresh insert, or unlinked first for a touch).
pub fn push_back(arena: &Arena, entry_off: u64) -> Result<()> {
    {
        let entry = arena.get::<EntryHeader>(entry_off)?;
        ensure!(
            entry.lru_prev() == 0 && entry.lru_next() == 0,
            "push_back of a linked entry"
        );
    }

    let back = record(arena)?.lru_back();
    if back != 0 {
        arena.get_mut::<EntryHeader>(back)?.set_lru_next(entry_off);
    }
    {
        let entry = arena.get_mut::<EntryHeader>(entry_off)?;
        entry.set_lru_prev(back);
        entry.set_lru_next(0);
    }

    let rec = record_mut(arena)?;
    if rec.lru_front() == 0 {
        rec.set_lru_front(entry_off);
    }
    rec.set_lru_back(entry_off);
    Ok(())
}

/// Moves an already-listed entry to the back (a cache hit).
pub fn touch(arena: &Arena, entry_off: u64) -> Result<()> {
    if record(arena)?.lru_back() == entry_off {
        return Ok(());
    }
    unlink(arena, entry_off)?;
    push_back(arena, entry_off)
}

/// The least recently used entry, if any.
pub fn front(arena: &Arena) -> Result<Option<u64>> {
    let front = record(arena)?.lru_front();
    Ok((front != 0).then_some(front))
}
