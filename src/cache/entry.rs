//! # Entry Headers
//!
//! [`EntryHeader`] is the per-key record living inside a shard's ToC
//! mapping. Everything about a cached artifact except its tile pixels is
//! reachable from here: lifecycle status, the reserving thread's tag, size
//! accounting, the intrusive LRU node, the tile list, the reporting tag and
//! the serialized payload bytes (both as arena offsets).
//!
//! The LRU node is intrusive and offset-based: `lru_prev`/`lru_next` store
//! the arena offsets of neighboring *entry headers* (not separate node
//! records), and the shard record stores the front/back offsets. Offsets
//! survive remaps and are meaningful in every process.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::storage::{Arena, RelVec};
use crate::zerocopy_accessors;

/// Lifecycle of an entry inside the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Present but neither computed nor being computed.
    Null,
    /// Reserved by the thread identified by `owner_tag`; being computed.
    Pending,
    /// Computed and safe to read from any process.
    Ready,
}

impl EntryState {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Null),
            1 => Some(Self::Pending),
            2 => Some(Self::Ready),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Pending => 1,
            Self::Ready => 2,
        }
    }
}

/// Per-key record inside the ToC mapping.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EntryHeader {
    status: U32,
    _pad: U32,
    /// Tag of the thread that reserved the entry; zero unless Pending.
    /// Only meaningful within the process that wrote it: peers must treat
    /// any Pending entry as "wait", never as their own.
    owner_tag: U64,
    /// Bytes billed against the shard for the serialized payload.
    byte_size: U64,
    /// Arena offset of the previous entry in LRU order (0 = none).
    lru_prev: U64,
    /// Arena offset of the next entry in LRU order (0 = none).
    lru_next: U64,
    /// The full 64-bit key.
    key: U64,
    /// Encoded ids of the tiles this entry owns.
    pub tiles: RelVec,
    plugin_id_off: U64,
    plugin_id_len: U64,
    payload_off: U64,
    payload_len: U64,
}

impl EntryHeader {
    zerocopy_accessors! {
        owner_tag: u64,
        byte_size: u64,
        lru_prev: u64,
        lru_next: u64,
        key: u64,
        plugin_id_off: u64,
        plugin_id_len: u64,
        payload_off: u64,
        payload_len: u64,
    }

    pub fn state(&self) -> EntryState {
        EntryState::from_u32(self.status.get()).unwrap_or(EntryState::Null)
    }

    pub fn set_state(&mut self, state: EntryState) {
        self.status = U32::new(state.as_u32());
    }

    /// Borrows the serialized payload bytes, if any were stored.
    pub fn payload<'a>(&self, arena: &'a Arena) -> eyre::Result<Option<&'a [u8]>> {
        if self.payload_off() == 0 {
            return Ok(None);
        }
        Ok(Some(arena.bytes(self.payload_off(), self.payload_len())?))
    }

    /// Borrows the reporting tag.
    pub fn plugin_id<'a>(&self, arena: &'a Arena) -> eyre::Result<&'a str> {
        if self.plugin_id_off() == 0 {
            return Ok("");
        }
        let bytes = arena.bytes(self.plugin_id_off(), self.plugin_id_len())?;
        Ok(std::str::from_utf8(bytes).unwrap_or(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MappedFile;

    #[test]
    fn entry_state_round_trips_through_u32() {
        for state in [EntryState::Null, EntryState::Pending, EntryState::Ready] {
            assert_eq!(EntryState::from_u32(state.as_u32()), Some(state));
        }
        assert_eq!(EntryState::from_u32(99), None);
    }

    #[test]
    fn zeroed_header_is_a_null_entry() {
        let seg = MappedFile::anonymous(4096).unwrap();
        let arena = Arena::new(seg.base(), seg.len());
        arena.format(1).unwrap();

        let off = arena
            .allocate(std::mem::size_of::<EntryHeader>() as u64)
            .unwrap()
            .unwrap();
        let entry = arena.get::<EntryHeader>(off).unwrap();

        assert_eq!(entry.state(), EntryState::Null);
        assert_eq!(entry.owner_tag(), 0);
        assert_eq!(entry.lru_prev(), 0);
        assert!(entry.payload(&arena).unwrap().is_none());
        assert_eq!(entry.plugin_id(&arena).unwrap(), "");
        assert!(entry.tiles.is_empty());
    }

    #[test]
    fn state_and_tag_updates_stick() {
        let seg = MappedFile::anonymous(4096).unwrap();
        let arena = Arena::new(seg.base(), seg.len());
        arena.format(1).unwrap();
        let off = arena
            .allocate(std::mem::size_of::<EntryHeader>() as u64)
            .unwrap()
            .unwrap();

        {
            let entry = arena.get_mut::<EntryHeader>(off).unwrap();
            entry.set_state(EntryState::Pending);
            entry.set_owner_tag(0xDEAD);
            entry.set_key(0x0123_4567_89AB_CDEF);
        }

        let entry = arena.get::<EntryHeader>(off).unwrap();
        assert_eq!(entry.state(), EntryState::Pending);
        assert_eq!(entry.owner_tag(), 0xDEAD);
        assert_eq!(entry.key(), 0x0123_4567_89AB_CDEF);
    }
}
