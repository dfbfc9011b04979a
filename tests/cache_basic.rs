//! # Single-Process Cache Behavior
//!
//! End-to-end coverage of the lookup/compute/insert lifecycle, persistence
//! across reopen, size accounting, LRU eviction and the tile pool, all on
//! one process. Every scenario finishes with a full structural integrity
//! check (index/LRU agreement, tile partition, size accounting).

use std::sync::atomic::{AtomicU32, Ordering};

use eyre::Result;
use tempfile::tempdir;
use tilecache::{
    Cache, CacheConfig, CachePayload, DeserializeOutcome, LockerStatus, PayloadReader,
    PayloadWriter,
};

/// A key whose shard is its top byte.
fn key_in_shard(shard: u8, low: u64) -> u64 {
    ((shard as u64) << 56) | low
}

/// Minimal cacheable artifact: a blob plus the key it was computed for.
#[derive(Default, Clone, PartialEq, Debug)]
struct Blob {
    key: u64,
    bytes: Vec<u8>,
    tile_ids: Vec<u64>,
}

impl Blob {
    fn computed(key: u64, len: usize) -> Self {
        let bytes = (0..len).map(|i| (i as u8).wrapping_mul(31)).collect();
        Self {
            key,
            bytes,
            tile_ids: Vec::new(),
        }
    }
}

impl CachePayload for Blob {
    fn metadata_size(&self) -> usize {
        8 + 8 + self.bytes.len() + 8 + self.tile_ids.len() * 8
    }

    fn serialize(&self, writer: &mut PayloadWriter<'_>) -> Result<()> {
        writer.write_u64(self.key)?;
        writer.write_u64(self.bytes.len() as u64)?;
        writer.write_bytes(&self.bytes)?;
        writer.write_u64(self.tile_ids.len() as u64)?;
        for id in &self.tile_ids {
            writer.write_u64(*id)?;
        }
        Ok(())
    }

    fn deserialize(
        &mut self,
        reader: &mut PayloadReader<'_>,
        _has_write_lock: bool,
    ) -> Result<DeserializeOutcome> {
        self.key = reader.read_u64()?;
        let len = reader.read_u64()? as usize;
        self.bytes = reader.read_bytes(len)?.to_vec();
        let tiles = reader.read_u64()? as usize;
        self.tile_ids = (0..tiles)
            .map(|_| reader.read_u64())
            .collect::<Result<_>>()?;
        Ok(DeserializeOutcome::Ok)
    }

    fn holder_id(&self) -> &str {
        "test-blob"
    }

    fn content_hash(&self) -> u64 {
        self.key
    }
}

/// Unique names per test so parallel tests never share a lock segment or
/// semaphores.
fn unique_config(dir: &std::path::Path) -> tilecache::CacheBuilder {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    Cache::builder()
        .path(dir)
        .app_name(format!("TcBasic{}", std::process::id()))
        .cache_name(format!("T{n}"))
        .tile_size(4096)
        .tiles_per_shard_per_file(1)
}

fn open_small(dir: &std::path::Path) -> Cache {
    unique_config(dir).open().unwrap()
}

#[test]
fn insert_then_get_round_trips() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());

    let key = key_in_shard(0x01, 0x23456789abcdef);
    let computed = Blob::computed(key, 1000);

    {
        let mut blob = computed.clone();
        let mut locker = cache.get(key, &mut blob).unwrap();
        assert_eq!(locker.status(), LockerStatus::MustCompute);
        locker.insert().unwrap();
        assert_eq!(locker.status(), LockerStatus::Cached);
    }

    let mut reloaded = Blob::default();
    let locker = cache.get(key, &mut reloaded).unwrap();
    assert_eq!(locker.status(), LockerStatus::Cached);
    drop(locker);
    assert_eq!(reloaded, computed);

    // Payload bytes are billed (plus small allocation overhead).
    let size = cache.current_size().unwrap();
    assert!(size >= 1000 && size < 1400, "unexpected size {size}");

    cache.verify_integrity().unwrap();
}

#[test]
fn second_get_is_idempotent() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());
    let key = key_in_shard(0x10, 7);

    let mut blob = Blob::computed(key, 64);
    let mut locker = cache.get(key, &mut blob).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    locker.insert().unwrap();
    drop(locker);

    for _ in 0..3 {
        let mut out = Blob::default();
        let locker = cache.get(key, &mut out).unwrap();
        assert_eq!(locker.status(), LockerStatus::Cached);
        drop(locker);
        assert_eq!(out.bytes, blob.bytes);
    }
    cache.verify_integrity().unwrap();
}

#[test]
fn drop_without_insert_rolls_back() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());
    let key = key_in_shard(0x33, 1);

    {
        let mut blob = Blob::computed(key, 128);
        let locker = cache.get(key, &mut blob).unwrap();
        assert_eq!(locker.status(), LockerStatus::MustCompute);
        // Dropped without insert: the reservation must vanish.
    }

    let mut probe = Blob::default();
    let locker = cache.get(key, &mut probe).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    drop(locker);

    assert_eq!(cache.current_size().unwrap(), 0);
    cache.verify_integrity().unwrap();
}

#[test]
fn persists_across_reopen() {
    let dir = tempdir().unwrap();
    let key = key_in_shard(0x7f, 99);
    let computed = Blob::computed(key, 300);
    let builder = unique_config(dir.path());

    {
        let cache = builder.clone().open().unwrap();
        let mut blob = computed.clone();
        let mut locker = cache.get(key, &mut blob).unwrap();
        assert_eq!(locker.status(), LockerStatus::MustCompute);
        locker.insert().unwrap();
        cache.sync().unwrap();
    }

    let cache = builder.open().unwrap();
    let mut reloaded = Blob::default();
    let locker = cache.get(key, &mut reloaded).unwrap();
    assert_eq!(locker.status(), LockerStatus::Cached);
    drop(locker);
    assert_eq!(reloaded, computed);
    cache.verify_integrity().unwrap();
}

#[test]
fn eviction_removes_oldest_first() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());
    cache.set_maximum_size(10_000).unwrap();

    // All in one shard so LRU order is total.
    let keys: Vec<u64> = (0..15).map(|i| key_in_shard(0x05, i + 1)).collect();
    for &key in &keys {
        let mut blob = Blob::computed(key, 1000);
        let mut locker = cache.get(key, &mut blob).unwrap();
        assert_eq!(locker.status(), LockerStatus::MustCompute);
        locker.insert().unwrap();
    }

    assert!(cache.current_size().unwrap() <= 10_000);

    // The oldest five must be gone, the newest five still cached.
    for &key in &keys[..5] {
        let mut probe = Blob::default();
        let locker = cache.get(key, &mut probe).unwrap();
        assert_eq!(locker.status(), LockerStatus::MustCompute, "key {key:#x}");
    }
    for &key in &keys[10..] {
        let mut probe = Blob::default();
        let locker = cache.get(key, &mut probe).unwrap();
        assert_eq!(locker.status(), LockerStatus::Cached, "key {key:#x}");
        drop(locker);
    }
    cache.verify_integrity().unwrap();
}

#[test]
fn touch_on_get_protects_recently_used() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());

    let old = key_in_shard(0x09, 1);
    let young = key_in_shard(0x09, 2);
    for &key in &[old, young] {
        let mut blob = Blob::computed(key, 1000);
        let mut locker = cache.get(key, &mut blob).unwrap();
        locker.insert().unwrap();
    }

    // Touch the old entry, making `young` the eviction candidate.
    {
        let mut probe = Blob::default();
        let locker = cache.get(old, &mut probe).unwrap();
        assert_eq!(locker.status(), LockerStatus::Cached);
    }

    // Force eviction of exactly one entry.
    cache.set_maximum_size(1500).unwrap();

    let mut probe = Blob::default();
    let locker = cache.get(old, &mut probe).unwrap();
    assert_eq!(locker.status(), LockerStatus::Cached);
    drop(locker);

    let mut probe = Blob::default();
    let locker = cache.get(young, &mut probe).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    drop(locker);
    cache.verify_integrity().unwrap();
}

#[test]
fn tile_exhaustion_creates_a_second_storage_file() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());
    let key = key_in_shard(0x00, 42);

    let mut blob = Blob::computed(key, 32);
    let mut locker = cache.get(key, &mut blob).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    assert_eq!(cache.tile_file_count(), 1);

    // One tile per shard per file: the second tile of shard 0 forces a
    // new storage file, dealt out across all shards.
    let tiles = locker.allocate_tiles(2).unwrap();
    assert_eq!(tiles.len(), 2);
    assert_eq!(cache.tile_file_count(), 2);
    assert!(tiles.iter().all(|t| t.owning_shard() == 0));

    // Write pixels through the tile guards, read them back.
    {
        let mut tile = cache.tile_write(tiles[0]).unwrap();
        tile.fill(0xAB);
    }
    {
        let tile = cache.tile_read(tiles[0]).unwrap();
        assert_eq!(tile.len(), 4096);
        assert!(tile.iter().all(|&b| b == 0xAB));
    }

    locker.payload_mut().tile_ids = tiles.iter().map(|t| t.encoded()).collect();
    locker.insert().unwrap();
    drop(locker);

    // Billed: payload bytes plus two tiles.
    let size = cache.current_size().unwrap();
    assert!(size >= 2 * 4096, "unexpected size {size}");
    cache.verify_integrity().unwrap();

    // Removing the entry returns its tiles to the free pool.
    cache.remove(key).unwrap();
    assert_eq!(cache.current_size().unwrap(), 0);
    cache.verify_integrity().unwrap();
}

#[test]
fn clear_empties_everything() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());

    for i in 0..8 {
        let key = key_in_shard(i as u8 * 16, 5);
        let mut blob = Blob::computed(key, 200);
        let mut locker = cache.get(key, &mut blob).unwrap();
        locker.insert().unwrap();
    }
    assert!(cache.current_size().unwrap() > 0);

    cache.clear().unwrap();
    assert_eq!(cache.current_size().unwrap(), 0);
    cache.verify_integrity().unwrap();

    // The cache remains fully usable after a wipe.
    let key = key_in_shard(0x44, 6);
    let mut blob = Blob::computed(key, 100);
    let mut locker = cache.get(key, &mut blob).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    locker.insert().unwrap();
    cache.verify_integrity().unwrap();
}

#[test]
fn report_groups_by_plugin_id() {
    let dir = tempdir().unwrap();
    let cache = open_small(dir.path());

    for i in 0..4u64 {
        let key = key_in_shard(0x21, i + 1);
        let mut blob = Blob::computed(key, 50);
        let mut locker = cache.get(key, &mut blob).unwrap();
        locker.insert().unwrap();
    }

    let report = cache.report().unwrap();
    let stats = report.get("test-blob").expect("plugin stats present");
    assert_eq!(stats.entries, 4);
    assert!(stats.payload_bytes > 0);
    assert_eq!(stats.tile_count, 0);
}

#[test]
fn non_persistent_cache_works_without_files() {
    let config: CacheConfig = Cache::builder()
        .persistent(false)
        .tile_size(4096)
        .tiles_per_shard_per_file(1)
        .build();
    let cache = Cache::open(config).unwrap();

    let key = key_in_shard(0x61, 3);
    let mut blob = Blob::computed(key, 500);
    let mut locker = cache.get(key, &mut blob).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    locker.insert().unwrap();
    drop(locker);

    let mut reloaded = Blob::default();
    let locker = cache.get(key, &mut reloaded).unwrap();
    assert_eq!(locker.status(), LockerStatus::Cached);
    drop(locker);
    assert_eq!(reloaded.bytes, blob.bytes);
    cache.verify_integrity().unwrap();
}

#[test]
fn toc_grows_past_the_first_quantum() {
    let dir = tempdir().unwrap();
    // Tiny quantum so a handful of entries forces several grows.
    let cache = unique_config(dir.path())
        .toc_grow_quantum(8 * 1024)
        .open()
        .unwrap();

    let mut keys = Vec::new();
    for i in 0..24u64 {
        let key = key_in_shard(0x0a, i + 1);
        keys.push(key);
        let mut blob = Blob::computed(key, 2048);
        let mut locker = cache.get(key, &mut blob).unwrap();
        assert_eq!(locker.status(), LockerStatus::MustCompute);
        locker.insert().unwrap();
    }

    for &key in &keys {
        let mut probe = Blob::default();
        let locker = cache.get(key, &mut probe).unwrap();
        assert_eq!(locker.status(), LockerStatus::Cached);
        drop(locker);
        assert_eq!(probe.bytes.len(), 2048);
    }
    cache.verify_integrity().unwrap();
}
