//! # Payload Capability
//!
//! The cache never understands what it stores. A cached artifact
//! participates through the [`CachePayload`] capability: report an upper
//! bound on serialized size, write itself into a ToC allocation, read
//! itself back, and expose a content hash for round-trip verification.
//!
//! ## Corruption tagging
//!
//! A peer can die mid-`serialize`, leaving a partially written block that
//! a later reader would happily misparse. The cache therefore appends a
//! 16-byte trailer after the payload bytes — the entry key plus a CRC-64
//! of the payload bytes — written *last*. A reader first validates the
//! trailer; a missing or wrong trailer means the writer never finished (or
//! the bytes rotted) and the entry is purged and recomputed.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Bytes appended after the serialized payload: key (8) + CRC-64 (8).
pub const PAYLOAD_TRAILER_SIZE: usize = 16;

/// Outcome of [`CachePayload::deserialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeserializeOutcome {
    /// The payload reconstructed itself.
    Ok,
    /// The bytes are unusable; the entry will be purged and recomputed.
    Failed,
    /// Materialization needs exclusive shard access (for example to claim
    /// tiles); the lookup retries under the write lock.
    NeedWriteLock,
}

/// Capability set a cacheable artifact implements.
pub trait CachePayload {
    /// Upper bound on the bytes [`CachePayload::serialize`] will write.
    /// The ToC allocation is sized from this before serialization runs.
    fn metadata_size(&self) -> usize;

    /// Writes the payload's fields into the reserved ToC bytes.
    fn serialize(&self, writer: &mut PayloadWriter<'_>) -> Result<()>;

    /// Reconstructs the payload from stored bytes. `has_write_lock` tells
    /// the payload whether exclusive shard access is currently held.
    fn deserialize(
        &mut self,
        reader: &mut PayloadReader<'_>,
        has_write_lock: bool,
    ) -> Result<DeserializeOutcome>;

    /// Reporting tag grouped over in cache statistics.
    fn holder_id(&self) -> &str;

    /// Whether one thread may hold several lockers for the same key.
    fn allow_multiple_fetch_per_thread(&self) -> bool {
        false
    }

    /// Hash of the reconstructed content; compared against the entry key
    /// after deserialization.
    fn content_hash(&self) -> u64;
}

/// Cursor over the ToC bytes reserved for one payload.
pub struct PayloadWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> PayloadWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        ensure!(
            self.pos + bytes.len() <= self.buf.len(),
            "payload serialization exceeded its declared metadata_size ({} > {})",
            self.pos + bytes.len(),
            self.buf.len()
        );
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }
}

/// Cursor over a stored payload's bytes (trailer already stripped).
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + len <= self.buf.len(),
            "payload read past end ({} > {})",
            self.pos + len,
            self.buf.len()
        );
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }
}

/// Appends the hash tag after `payload_len` bytes of `block`. The last
/// store a writer performs on the block.
pub(crate) fn write_trailer(block: &mut [u8], payload_len: usize, key: u64) {
    let crc = CRC64.checksum(&block[..payload_len]);
    block[payload_len..payload_len + 8].copy_from_slice(&key.to_le_bytes());
    block[payload_len + 8..payload_len + PAYLOAD_TRAILER_SIZE].copy_from_slice(&crc.to_le_bytes());
}

/// Validates the trailer of a stored block; returns the payload bytes on
/// success, `None` when the block is from an unfinished or corrupt write.
pub(crate) fn check_trailer(block: &[u8], key: u64) -> Option<&[u8]> {
    if block.len() < PAYLOAD_TRAILER_SIZE {
        return None;
    }
    let payload_len = block.len() - PAYLOAD_TRAILER_SIZE;
    let stored_key = u64::from_le_bytes(block[payload_len..payload_len + 8].try_into().ok()?);
    let stored_crc = u64::from_le_bytes(block[payload_len + 8..].try_into().ok()?);
    if stored_key != key || CRC64.checksum(&block[..payload_len]) != stored_crc {
        return None;
    }
    Some(&block[..payload_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_and_reader_round_trip() {
        let mut buf = [0u8; 64];
        let mut w = PayloadWriter::new(&mut buf);
        w.write_u32(7).unwrap();
        w.write_u64(0xABCD).unwrap();
        w.write_bytes(b"tile").unwrap();
        let len = w.position();
        assert_eq!(len, 16);

        let mut r = PayloadReader::new(&buf[..len]);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u64().unwrap(), 0xABCD);
        assert_eq!(r.read_bytes(4).unwrap(), b"tile");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn writer_rejects_overflow() {
        let mut buf = [0u8; 4];
        let mut w = PayloadWriter::new(&mut buf);
        assert!(w.write_u64(1).is_err());
    }

    #[test]
    fn reader_rejects_overread() {
        let buf = [0u8; 4];
        let mut r = PayloadReader::new(&buf);
        assert!(r.read_u64().is_err());
    }

    #[test]
    fn trailer_round_trips() {
        let mut block = vec![0u8; 32 + PAYLOAD_TRAILER_SIZE];
        block[..5].copy_from_slice(b"bytes");
        write_trailer(&mut block, 32, 0x1122);

        let payload = check_trailer(&block, 0x1122).unwrap();
        assert_eq!(&payload[..5], b"bytes");
        assert_eq!(payload.len(), 32);
    }

    #[test]
    fn trailer_detects_wrong_key_and_corruption() {
        let mut block = vec![0u8; 8 + PAYLOAD_TRAILER_SIZE];
        write_trailer(&mut block, 8, 1);

        assert!(check_trailer(&block, 2).is_none());

        block[0] ^= 0xFF;
        assert!(check_trailer(&block, 1).is_none());
    }

    #[test]
    fn truncated_block_fails_the_check() {
        assert!(check_trailer(&[0u8; 8], 1).is_none());
    }
}
