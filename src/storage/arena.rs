//! # In-Mapping Allocator
//!
//! Each shard's ToC file is an allocator-managed heap: the first bytes are
//! an [`ArenaHeader`], and everything else — the shard record, entry
//! headers, tile lists, serialized payloads — is carved out of the rest by
//! the allocator defined here. All bookkeeping lives *inside* the mapping,
//! so any process mapping the file sees the same heap.
//!
//! ## Why offsets, not pointers
//!
//! The same file is mapped at different addresses in different processes,
//! and even within one process the base moves on every grow/remap. Every
//! reference stored in the mapping is therefore a byte offset from the
//! mapping base, re-resolved against the current base on each access.
//! Offset zero is the arena header, which nothing ever allocates, so zero
//! doubles as the null offset.
//!
//! ## Block format
//!
//! ```text
//! allocated:  [ size: u64 ][ user bytes ... ]
//! free:       [ size: u64 ][ next: u64 ][ ... ]
//! ```
//!
//! `size` counts the whole block including its header and is always a
//! multiple of 8. Freed blocks go on a singly-linked first-fit list; a
//! fitting block is split when the remainder can stand alone. There is no
//! coalescing: ToC allocations are few, uniform, and recycled in place, and
//! the periodic cache wipe resets the heap wholesale.
//!
//! ## Concurrency
//!
//! The arena performs no locking. Callers follow the cache-wide rule:
//! shared ToC lock to read, plus the exclusive shard lock to mutate heap
//! state (allocate/free), exclusive ToC lock to grow.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::zerocopy_accessors;

/// Identifies a formatted arena; anything else is wiped and reformatted.
const ARENA_MAGIC: u64 = 0x7463_546f_4301_4152; // "tcToC" + "AR"

const BLOCK_HEADER_SIZE: u64 = 8;
/// Smallest block that can live on the free list (header + next + slack).
const MIN_BLOCK_SIZE: u64 = 24;

/// Allocation failure: the mapping has no fitting block and no bump room.
/// Recovered by growing the ToC file and retrying, never fatal by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSpace {
    /// Bytes the failed request needed.
    pub requested: u64,
}

impl std::fmt::Display for OutOfSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "arena out of space for {} bytes", self.requested)
    }
}

impl std::error::Error for OutOfSpace {}

/// First bytes of every ToC mapping.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ArenaHeader {
    magic: U64,
    layout_version: U32,
    _pad: U32,
    /// Mapping length this heap has adopted; grows with the file.
    capacity: U64,
    /// Next never-allocated offset.
    heap_top: U64,
    /// Head of the free-block list, 0 when empty.
    free_head: U64,
    /// Offset of the root record (the shard record), 0 before construction.
    root: U64,
}

impl ArenaHeader {
    zerocopy_accessors! {
        layout_version: u32,
        capacity: u64,
        heap_top: u64,
        free_head: u64,
        root: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct FreeBlock {
    size: U64,
    next: U64,
}

const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// A borrowed view of one mapped heap. Cheap to construct; holds the base
/// and length captured while the corresponding locks are held.
#[derive(Clone, Copy)]
pub struct Arena {
    base: *mut u8,
    len: u64,
}

impl Arena {
    /// # Safety contract (by convention, not the type system)
    ///
    /// `base..base+len` must be a live mapping, and the caller must hold
    /// the ToC lock of the owning shard at least shared for the lifetime
    /// of this view and of anything borrowed from it.
    pub fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len: len as u64,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    fn check_range(&self, off: u64, size: u64) -> Result<()> {
        ensure!(
            off.checked_add(size).is_some_and(|end| end <= self.len),
            "arena offset {}+{} out of bounds (len={})",
            off,
            size,
            self.len
        );
        Ok(())
    }

    /// Typed shared view at `off`.
    pub fn get<T: FromBytes + KnownLayout + Immutable>(&self, off: u64) -> Result<&T> {
        let size = std::mem::size_of::<T>() as u64;
        self.check_range(off, size)?;
        ensure!(off % 8 == 0, "misaligned arena offset {}", off);
        // SAFETY: bounds and alignment checked above; T is FromBytes so any
        // byte pattern is a valid T; the mapping outlives &self per the
        // construction contract.
        Ok(unsafe { &*(self.base.add(off as usize) as *const T) })
    }

    /// Typed exclusive view at `off`. Exclusivity is provided by the
    /// cache's lock discipline, not the borrow checker; see module docs.
    #[allow(clippy::mut_from_ref)]
    pub fn get_mut<T: FromBytes + IntoBytes + KnownLayout>(&self, off: u64) -> Result<&mut T> {
        let size = std::mem::size_of::<T>() as u64;
        self.check_range(off, size)?;
        ensure!(off % 8 == 0, "misaligned arena offset {}", off);
        // SAFETY: as in get(); mutation is serialized by the shard lock
        // held exclusively by the caller.
        Ok(unsafe { &mut *(self.base.add(off as usize) as *mut T) })
    }

    /// Raw byte slice at `off`.
    pub fn bytes(&self, off: u64, len: u64) -> Result<&[u8]> {
        self.check_range(off, len)?;
        // SAFETY: bounds checked; lifetime tied to &self.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(off as usize), len as usize) })
    }

    /// Raw mutable byte slice at `off`; same exclusivity convention as
    /// [`Arena::get_mut`].
    #[allow(clippy::mut_from_ref)]
    pub fn bytes_mut(&self, off: u64, len: u64) -> Result<&mut [u8]> {
        self.check_range(off, len)?;
        // SAFETY: bounds checked; mutation serialized by the shard lock.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(off as usize), len as usize) })
    }

    #[allow(clippy::mut_from_ref)]
    fn header(&self) -> Result<&mut ArenaHeader> {
        ensure!(
            self.len >= std::mem::size_of::<ArenaHeader>() as u64,
            "mapping too small for arena header"
        );
        // SAFETY: offset 0, size checked, repr(C) POD.
        Ok(unsafe { &mut *(self.base as *mut ArenaHeader) })
    }

    /// True when the mapping carries a formatted heap of this layout.
    pub fn is_formatted(&self, layout_version: u32) -> bool {
        self.len >= std::mem::size_of::<ArenaHeader>() as u64 && {
            // SAFETY: size checked; reading PODs.
            let hdr = unsafe { &*(self.base as *const ArenaHeader) };
            hdr.magic.get() == ARENA_MAGIC && hdr.layout_version() == layout_version
        }
    }

    /// Reads the stored layout version regardless of whether it matches.
    pub fn stored_version(&self) -> Option<u32> {
        (self.len >= std::mem::size_of::<ArenaHeader>() as u64).then(|| {
            // SAFETY: size checked.
            let hdr = unsafe { &*(self.base as *const ArenaHeader) };
            (hdr.magic.get() == ARENA_MAGIC).then(|| hdr.layout_version())
        })?
    }

    /// Writes a fresh empty heap over the mapping.
    pub fn format(&self, layout_version: u32) -> Result<()> {
        let len = self.len;
        let hdr = self.header()?;
        *hdr = ArenaHeader {
            magic: U64::new(ARENA_MAGIC),
            layout_version: U32::new(layout_version),
            _pad: U32::new(0),
            capacity: U64::new(len),
            heap_top: U64::new(align8(std::mem::size_of::<ArenaHeader>() as u64)),
            free_head: U64::new(0),
            root: U64::new(0),
        };
        Ok(())
    }

    /// Called after a grow+remap so the heap can bump into the new bytes.
    pub fn adopt_capacity(&self) -> Result<()> {
        let len = self.len;
        let hdr = self.header()?;
        if hdr.capacity() < len {
            hdr.set_capacity(len);
        }
        Ok(())
    }

    pub fn root(&self) -> Result<u64> {
        Ok(self.header()?.root())
    }

    pub fn set_root(&self, off: u64) -> Result<()> {
        self.header()?.set_root(off);
        Ok(())
    }

    /// Bytes still available to the bump region. Free-list blocks are not
    /// counted; this is a hint for grow sizing, not an exact figure.
    pub fn bump_remaining(&self) -> Result<u64> {
        let hdr = self.header()?;
        Ok(hdr.capacity().saturating_sub(hdr.heap_top()))
    }

    /// Allocates `n` user bytes, first-fit then bump. The returned offset
    /// addresses the user bytes (block header excluded) and is 8-aligned.
    /// The bytes are zeroed.
    pub fn allocate(&self, n: u64) -> Result<std::result::Result<u64, OutOfSpace>> {
        let need = align8(n).max(MIN_BLOCK_SIZE - BLOCK_HEADER_SIZE) + BLOCK_HEADER_SIZE;

        // First fit over the free list.
        let mut prev_link: Option<u64> = None;
        let mut cur = self.header()?.free_head();
        while cur != 0 {
            let (size, next) = {
                let blk = self.get::<FreeBlock>(cur)?;
                (blk.size.get(), blk.next.get())
            };
            ensure!(size >= MIN_BLOCK_SIZE, "corrupt free block at {}", cur);

            if size >= need {
                let take = if size - need >= MIN_BLOCK_SIZE {
                    // Split: the tail stays free.
                    let tail = cur + need;
                    let tail_blk = self.get_mut::<FreeBlock>(tail)?;
                    tail_blk.size = U64::new(size - need);
                    tail_blk.next = U64::new(next);
                    match prev_link {
                        None => self.header()?.set_free_head(tail),
                        Some(p) => self.get_mut::<FreeBlock>(p)?.next = U64::new(tail),
                    }
                    need
                } else {
                    match prev_link {
                        None => self.header()?.set_free_head(next),
                        Some(p) => self.get_mut::<FreeBlock>(p)?.next = U64::new(next),
                    }
                    size
                };

                self.get_mut::<U64>(cur)?.set(take);
                let user = cur + BLOCK_HEADER_SIZE;
                self.bytes_mut(user, take - BLOCK_HEADER_SIZE)?.fill(0);
                return Ok(Ok(user));
            }

            prev_link = Some(cur);
            cur = next;
        }

        // Bump.
        let hdr = self.header()?;
        let top = hdr.heap_top();
        let capacity = hdr.capacity();
        match top.checked_add(need) {
            Some(end) if end <= capacity => {
                hdr.set_heap_top(end);
                self.get_mut::<U64>(top)?.set(need);
                let user = top + BLOCK_HEADER_SIZE;
                self.bytes_mut(user, need - BLOCK_HEADER_SIZE)?.fill(0);
                Ok(Ok(user))
            }
            _ => Ok(Err(OutOfSpace { requested: n })),
        }
    }

    /// Returns a block to the free list. `user_off` must come from
    /// [`Arena::allocate`] on this heap.
    pub fn free(&self, user_off: u64) -> Result<()> {
        ensure!(
            user_off >= BLOCK_HEADER_SIZE,
            "free of non-allocated offset {}",
            user_off
        );
        let block = user_off - BLOCK_HEADER_SIZE;
        let size = self.get::<U64>(block)?.get();
        ensure!(
            size >= MIN_BLOCK_SIZE && block + size <= self.len,
            "free of corrupt block at {} (size {})",
            block,
            size
        );

        let head = self.header()?.free_head();
        let blk = self.get_mut::<FreeBlock>(block)?;
        blk.size = U64::new(size);
        blk.next = U64::new(head);
        self.header()?.set_free_head(block);
        Ok(())
    }

    /// Size in user bytes of the allocation at `user_off`.
    pub fn allocation_size(&self, user_off: u64) -> Result<u64> {
        ensure!(user_off >= BLOCK_HEADER_SIZE, "bad allocation offset");
        let size = self.get::<U64>(user_off - BLOCK_HEADER_SIZE)?.get();
        Ok(size - BLOCK_HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mapped_file::MappedFile;

    fn arena(size: usize) -> (MappedFile, Arena) {
        let seg = MappedFile::anonymous(size).unwrap();
        let a = Arena::new(seg.base(), seg.len());
        a.format(1).unwrap();
        (seg, a)
    }

    #[test]
    fn format_then_is_formatted() {
        let (_seg, a) = arena(4096);
        assert!(a.is_formatted(1));
        assert!(!a.is_formatted(2));
        assert_eq!(a.stored_version(), Some(1));
        assert_eq!(a.root().unwrap(), 0);
    }

    #[test]
    fn unformatted_mapping_is_detected() {
        let seg = MappedFile::anonymous(4096).unwrap();
        let a = Arena::new(seg.base(), seg.len());
        assert!(!a.is_formatted(1));
        assert_eq!(a.stored_version(), None);
    }

    #[test]
    fn allocations_are_disjoint_aligned_and_zeroed() {
        let (_seg, a) = arena(4096);

        let x = a.allocate(100).unwrap().unwrap();
        let y = a.allocate(100).unwrap().unwrap();

        assert_ne!(x, y);
        assert_eq!(x % 8, 0);
        assert_eq!(y % 8, 0);
        assert!(y >= x + 100 || x >= y + 100);
        assert!(a.bytes(x, 100).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn free_then_allocate_reuses_the_block() {
        let (_seg, a) = arena(4096);

        let x = a.allocate(128).unwrap().unwrap();
        a.free(x).unwrap();
        let y = a.allocate(128).unwrap().unwrap();

        assert_eq!(x, y);
    }

    #[test]
    fn splitting_leaves_a_usable_tail() {
        let (_seg, a) = arena(4096);

        let x = a.allocate(512).unwrap().unwrap();
        a.free(x).unwrap();

        let small = a.allocate(64).unwrap().unwrap();
        let tail = a.allocate(64).unwrap().unwrap();
        assert_eq!(small, x);
        assert!(tail > small);
        assert!(tail < x + 512 + BLOCK_HEADER_SIZE);
    }

    #[test]
    fn exhaustion_reports_out_of_space() {
        let (_seg, a) = arena(4096);

        let result = a.allocate(1 << 20).unwrap();
        assert_eq!(
            result.unwrap_err(),
            OutOfSpace {
                requested: 1 << 20
            }
        );
    }

    #[test]
    fn capacity_adoption_extends_the_bump_region() {
        let mut seg = MappedFile::anonymous(256).unwrap();
        let a = Arena::new(seg.base(), seg.len());
        a.format(1).unwrap();
        assert!(a.allocate(512).unwrap().is_err());

        seg.resize(4096).unwrap();
        let a = Arena::new(seg.base(), seg.len());
        a.adopt_capacity().unwrap();
        assert!(a.allocate(512).unwrap().is_ok());
    }

    #[test]
    fn allocation_size_round_trips() {
        let (_seg, a) = arena(4096);
        let x = a.allocate(100).unwrap().unwrap();
        // Rounded to 8 bytes.
        assert_eq!(a.allocation_size(x).unwrap(), 104);
    }
}
