//! # Arena-Backed Vectors
//!
//! [`RelVec`] is the one growable container stored inside ToC mappings: a
//! `(data offset, len, cap)` triple whose backing array is an arena block
//! of `u64` slots. Three usages cover every in-mapping collection:
//!
//! - **plain list** — an entry's tile ids, in allocation order;
//! - **sorted set** — a shard's free-tile ids (`insert_sorted`,
//!   `remove_sorted`, `first`);
//! - **sorted pair map** — the shard's entry index, `(key, entry offset)`
//!   pairs sorted by key with binary-search lookup. The map operations use
//!   a stride of two slots.
//!
//! Growth doubles the backing block (allocate-copy-free), so a push can
//! fail with [`OutOfSpace`] exactly like a direct arena allocation; callers
//! run it under the same grow-and-retry loop as everything else. A
//! `reserve_exact` is provided so multi-insert operations can make the only
//! fallible step happen up front and the insertions themselves infallible.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::arena::{Arena, OutOfSpace};

/// Growable array of `u64` slots inside an arena.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RelVec {
    data: U64,
    len: U64,
    cap: U64,
}

impl RelVec {
    /// An empty vector owning no arena block.
    pub fn empty() -> Self {
        Self {
            data: U64::new(0),
            len: U64::new(0),
            cap: U64::new(0),
        }
    }

    pub fn len(&self) -> u64 {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u64 {
        self.cap.get()
    }

    /// Borrow the live slots.
    pub fn as_slice<'a>(&self, arena: &'a Arena) -> Result<&'a [U64]> {
        if self.len() == 0 {
            return Ok(&[]);
        }
        let bytes = arena.bytes(self.data.get(), self.len() * 8)?;
        // SAFETY: U64 is an unaligned little-endian wrapper; any byte
        // sequence of the right length reinterprets validly.
        Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const U64, self.len() as usize) })
    }

    fn slots_mut<'a>(&self, arena: &'a Arena, count: u64) -> Result<&'a mut [U64]> {
        let bytes = arena.bytes_mut(self.data.get(), count * 8)?;
        // SAFETY: as in as_slice; exclusivity follows the shard lock.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut U64, count as usize)
        })
    }

    pub fn get(&self, arena: &Arena, index: u64) -> Result<u64> {
        ensure!(index < self.len(), "RelVec index {} out of bounds", index);
        Ok(self.as_slice(arena)?[index as usize].get())
    }

    pub fn set(&self, arena: &Arena, index: u64, value: u64) -> Result<()> {
        ensure!(index < self.len(), "RelVec index {} out of bounds", index);
        self.slots_mut(arena, self.len())?[index as usize].set(value);
        Ok(())
    }

    /// Ensures room for `additional` more slots. The only fallible step of
    /// a multi-insert when called first.
    pub fn reserve_exact(
        &mut self,
        arena: &Arena,
        additional: u64,
    ) -> Result<std::result::Result<(), OutOfSpace>> {
        let needed = self.len() + additional;
        if needed <= self.capacity() {
            return Ok(Ok(()));
        }
        let new_cap = needed.max(self.capacity() * 2).max(8);
        let new_data = match arena.allocate(new_cap * 8)? {
            Ok(off) => off,
            Err(oos) => return Ok(Err(oos)),
        };

        if self.len() > 0 {
            let src = arena.bytes(self.data.get(), self.len() * 8)?.as_ptr();
            let dst = arena.bytes_mut(new_data, self.len() * 8)?.as_mut_ptr();
            // SAFETY: distinct blocks (new_data was just allocated), both
            // bounds-checked above.
            unsafe { std::ptr::copy_nonoverlapping(src, dst, (self.len() * 8) as usize) };
        }
        if self.data.get() != 0 {
            arena.free(self.data.get())?;
        }
        self.data = U64::new(new_data);
        self.cap = U64::new(new_cap);
        Ok(Ok(()))
    }

    pub fn push(
        &mut self,
        arena: &Arena,
        value: u64,
    ) -> Result<std::result::Result<(), OutOfSpace>> {
        if let Err(oos) = self.reserve_exact(arena, 1)? {
            return Ok(Err(oos));
        }
        let len = self.len();
        self.len = U64::new(len + 1);
        self.slots_mut(arena, len + 1)?[len as usize].set(value);
        Ok(Ok(()))
    }

    /// Removes and returns the last slot.
    pub fn pop(&mut self, arena: &Arena) -> Result<Option<u64>> {
        let len = self.len();
        if len == 0 {
            return Ok(None);
        }
        let value = self.get(arena, len - 1)?;
        self.len = U64::new(len - 1);
        Ok(Some(value))
    }

    /// Frees the backing block and resets to empty.
    pub fn clear_free(&mut self, arena: &Arena) -> Result<()> {
        if self.data.get() != 0 {
            arena.free(self.data.get())?;
        }
        *self = Self::empty();
        Ok(())
    }

    fn shift(&self, arena: &Arena, from: u64, to: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let total = self.capacity();
        let slots = self.slots_mut(arena, total)?;
        let base = slots.as_mut_ptr();
        // SAFETY: from+count and to+count are within capacity (callers
        // reserve before shifting up); overlapping ranges handled by copy.
        unsafe {
            std::ptr::copy(
                base.add(from as usize),
                base.add(to as usize),
                count as usize,
            )
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sorted-set operations (stride 1)
    // ------------------------------------------------------------------

    fn lower_bound(&self, arena: &Arena, value: u64) -> Result<(u64, bool)> {
        let slice = self.as_slice(arena)?;
        match slice.binary_search_by_key(&value, |s| s.get()) {
            Ok(i) => Ok((i as u64, true)),
            Err(i) => Ok((i as u64, false)),
        }
    }

    /// Inserts keeping ascending order; duplicates are ignored.
    pub fn insert_sorted(
        &mut self,
        arena: &Arena,
        value: u64,
    ) -> Result<std::result::Result<(), OutOfSpace>> {
        let (pos, found) = self.lower_bound(arena, value)?;
        if found {
            return Ok(Ok(()));
        }
        if let Err(oos) = self.reserve_exact(arena, 1)? {
            return Ok(Err(oos));
        }
        let len = self.len();
        self.shift(arena, pos, pos + 1, len - pos)?;
        self.len = U64::new(len + 1);
        self.set(arena, pos, value)?;
        Ok(Ok(()))
    }

    /// Removes `value` if present; reports whether it was.
    pub fn remove_sorted(&mut self, arena: &Arena, value: u64) -> Result<bool> {
        let (pos, found) = self.lower_bound(arena, value)?;
        if !found {
            return Ok(false);
        }
        let len = self.len();
        self.shift(arena, pos + 1, pos, len - pos - 1)?;
        self.len = U64::new(len - 1);
        Ok(true)
    }

    /// Smallest element, if any.
    pub fn first(&self, arena: &Arena) -> Result<Option<u64>> {
        if self.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.get(arena, 0)?))
    }

    pub fn contains_sorted(&self, arena: &Arena, value: u64) -> Result<bool> {
        Ok(self.lower_bound(arena, value)?.1)
    }

    // ------------------------------------------------------------------
    // Sorted pair-map operations (stride 2: key at even slots)
    // ------------------------------------------------------------------

    pub fn map_len(&self) -> u64 {
        self.len() / 2
    }

    fn map_search(&self, arena: &Arena, key: u64) -> Result<(u64, bool)> {
        let slice = self.as_slice(arena)?;
        let pairs = slice.len() / 2;
        let (mut lo, mut hi) = (0usize, pairs);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = slice[mid * 2].get();
            if k == key {
                return Ok((mid as u64, true));
            } else if k < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok((lo as u64, false))
    }

    pub fn map_get(&self, arena: &Arena, key: u64) -> Result<Option<u64>> {
        let (pos, found) = self.map_search(arena, key)?;
        if !found {
            return Ok(None);
        }
        Ok(Some(self.get(arena, pos * 2 + 1)?))
    }

    /// Inserts or overwrites the value for `key`.
    pub fn map_insert(
        &mut self,
        arena: &Arena,
        key: u64,
        value: u64,
    ) -> Result<std::result::Result<(), OutOfSpace>> {
        let (pos, found) = self.map_search(arena, key)?;
        if found {
            self.set(arena, pos * 2 + 1, value)?;
            return Ok(Ok(()));
        }
        if let Err(oos) = self.reserve_exact(arena, 2)? {
            return Ok(Err(oos));
        }
        let len = self.len();
        self.shift(arena, pos * 2, pos * 2 + 2, len - pos * 2)?;
        self.len = U64::new(len + 2);
        self.set(arena, pos * 2, key)?;
        self.set(arena, pos * 2 + 1, value)?;
        Ok(Ok(()))
    }

    /// Removes `key`, returning its value.
    pub fn map_remove(&mut self, arena: &Arena, key: u64) -> Result<Option<u64>> {
        let (pos, found) = self.map_search(arena, key)?;
        if !found {
            return Ok(None);
        }
        let value = self.get(arena, pos * 2 + 1)?;
        let len = self.len();
        self.shift(arena, pos * 2 + 2, pos * 2, len - pos * 2 - 2)?;
        self.len = U64::new(len - 2);
        Ok(Some(value))
    }

    /// The `index`-th pair in key order.
    pub fn map_at(&self, arena: &Arena, index: u64) -> Result<(u64, u64)> {
        Ok((
            self.get(arena, index * 2)?,
            self.get(arena, index * 2 + 1)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mapped_file::MappedFile;

    fn arena() -> (MappedFile, Arena) {
        let seg = MappedFile::anonymous(64 * 1024).unwrap();
        let a = Arena::new(seg.base(), seg.len());
        a.format(1).unwrap();
        (seg, a)
    }

    #[test]
    fn push_get_pop_round_trip() {
        let (_seg, a) = arena();
        let mut v = RelVec::empty();

        for i in 0..100u64 {
            v.push(&a, i * 3).unwrap().unwrap();
        }
        assert_eq!(v.len(), 100);
        assert_eq!(v.get(&a, 41).unwrap(), 123);
        assert_eq!(v.pop(&a).unwrap(), Some(297));
        assert_eq!(v.len(), 99);
    }

    #[test]
    fn sorted_insert_keeps_order_and_dedups() {
        let (_seg, a) = arena();
        let mut v = RelVec::empty();

        for value in [5u64, 1, 9, 3, 7, 3] {
            v.insert_sorted(&a, value).unwrap().unwrap();
        }

        let items: Vec<u64> = v.as_slice(&a).unwrap().iter().map(|s| s.get()).collect();
        assert_eq!(items, vec![1, 3, 5, 7, 9]);
        assert_eq!(v.first(&a).unwrap(), Some(1));
        assert!(v.contains_sorted(&a, 7).unwrap());
        assert!(!v.contains_sorted(&a, 8).unwrap());
    }

    #[test]
    fn sorted_remove_shifts_down() {
        let (_seg, a) = arena();
        let mut v = RelVec::empty();
        for value in [1u64, 2, 3, 4] {
            v.insert_sorted(&a, value).unwrap().unwrap();
        }

        assert!(v.remove_sorted(&a, 2).unwrap());
        assert!(!v.remove_sorted(&a, 2).unwrap());

        let items: Vec<u64> = v.as_slice(&a).unwrap().iter().map(|s| s.get()).collect();
        assert_eq!(items, vec![1, 3, 4]);
    }

    #[test]
    fn map_insert_get_remove() {
        let (_seg, a) = arena();
        let mut m = RelVec::empty();

        m.map_insert(&a, 0x20, 200).unwrap().unwrap();
        m.map_insert(&a, 0x10, 100).unwrap().unwrap();
        m.map_insert(&a, 0x30, 300).unwrap().unwrap();

        assert_eq!(m.map_len(), 3);
        assert_eq!(m.map_get(&a, 0x10).unwrap(), Some(100));
        assert_eq!(m.map_get(&a, 0x20).unwrap(), Some(200));
        assert_eq!(m.map_get(&a, 0x15).unwrap(), None);

        // Pairs come back in key order.
        assert_eq!(m.map_at(&a, 0).unwrap(), (0x10, 100));
        assert_eq!(m.map_at(&a, 2).unwrap(), (0x30, 300));

        assert_eq!(m.map_remove(&a, 0x20).unwrap(), Some(200));
        assert_eq!(m.map_remove(&a, 0x20).unwrap(), None);
        assert_eq!(m.map_len(), 2);
    }

    #[test]
    fn map_insert_overwrites_existing_key() {
        let (_seg, a) = arena();
        let mut m = RelVec::empty();
        m.map_insert(&a, 1, 10).unwrap().unwrap();
        m.map_insert(&a, 1, 20).unwrap().unwrap();
        assert_eq!(m.map_len(), 1);
        assert_eq!(m.map_get(&a, 1).unwrap(), Some(20));
    }

    #[test]
    fn reserve_then_insert_does_not_allocate() {
        let (_seg, a) = arena();
        let mut v = RelVec::empty();
        v.reserve_exact(&a, 256).unwrap().unwrap();
        let cap = v.capacity();
        for i in 0..256u64 {
            v.insert_sorted(&a, i).unwrap().unwrap();
        }
        assert_eq!(v.capacity(), cap);
    }

    #[test]
    fn clear_free_returns_the_block() {
        let (_seg, a) = arena();
        let mut v = RelVec::empty();
        for i in 0..64u64 {
            v.push(&a, i).unwrap().unwrap();
        }
        v.clear_free(&a).unwrap();
        assert_eq!(v.len(), 0);
        assert_eq!(v.capacity(), 0);
    }

    #[test]
    fn out_of_space_surfaces_from_push() {
        let seg = MappedFile::anonymous(256).unwrap();
        let a = Arena::new(seg.base(), seg.len());
        a.format(1).unwrap();

        let mut v = RelVec::empty();
        let mut saw_oos = false;
        for i in 0..1000u64 {
            if v.push(&a, i).unwrap().is_err() {
                saw_oos = true;
                break;
            }
        }
        assert!(saw_oos);
    }
}
