//! # Concurrent and Recovery Behavior
//!
//! Races between threads on one key (single-writer semantics), takeover
//! after an owner gives up or stalls, and the abandoned-lock recovery
//! path, exercised by leaking an interprocess lock the way a killed peer
//! would.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use eyre::Result;
use tempfile::tempdir;
use tilecache::ipc::SharedSegment;
use tilecache::{
    Cache, CachePayload, DeserializeOutcome, LockerStatus, PayloadReader, PayloadWriter,
};

#[derive(Default, Clone)]
struct Blob {
    key: u64,
    bytes: Vec<u8>,
}

impl Blob {
    fn computed(key: u64, len: usize) -> Self {
        Self {
            key,
            bytes: (0..len).map(|i| (i as u8) ^ 0x5A).collect(),
        }
    }
}

impl CachePayload for Blob {
    fn metadata_size(&self) -> usize {
        16 + self.bytes.len()
    }

    fn serialize(&self, writer: &mut PayloadWriter<'_>) -> Result<()> {
        writer.write_u64(self.key)?;
        writer.write_u64(self.bytes.len() as u64)?;
        writer.write_bytes(&self.bytes)
    }

    fn deserialize(
        &mut self,
        reader: &mut PayloadReader<'_>,
        _has_write_lock: bool,
    ) -> Result<DeserializeOutcome> {
        self.key = reader.read_u64()?;
        let len = reader.read_u64()? as usize;
        self.bytes = reader.read_bytes(len)?.to_vec();
        Ok(DeserializeOutcome::Ok)
    }

    fn holder_id(&self) -> &str {
        "race-blob"
    }

    fn content_hash(&self) -> u64 {
        self.key
    }
}

fn unique_builder(dir: &std::path::Path) -> tilecache::CacheBuilder {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    Cache::builder()
        .path(dir)
        .app_name(format!("TcRace{}", std::process::id()))
        .cache_name(format!("T{n}"))
        .tile_size(4096)
        .tiles_per_shard_per_file(1)
}

const KEY: u64 = (0x2au64 << 56) | 0xfeed;

#[test]
fn racing_getters_see_exactly_one_must_compute() {
    let dir = tempdir().unwrap();
    let cache = unique_builder(dir.path()).open().unwrap();

    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));
    let must_compute_seen = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            let must_compute_seen = Arc::clone(&must_compute_seen);
            thread::spawn(move || -> Vec<u8> {
                let mut blob = Blob::default();
                barrier.wait();
                let mut locker = cache.get(KEY, &mut blob).unwrap();
                match locker.status() {
                    LockerStatus::MustCompute => {
                        must_compute_seen.fetch_add(1, Ordering::SeqCst);
                        // Simulate work so waiters really wait.
                        thread::sleep(Duration::from_millis(50));
                        *locker.payload_mut() = Blob::computed(KEY, 256);
                        locker.insert().unwrap();
                    }
                    LockerStatus::ComputationPending => {
                        let status = locker.wait(None).unwrap();
                        assert_eq!(status, LockerStatus::Cached);
                    }
                    LockerStatus::Cached => {}
                }
                drop(locker);
                blob.bytes
            })
        })
        .collect();

    let expected = Blob::computed(KEY, 256).bytes;
    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
    assert_eq!(must_compute_seen.load(Ordering::SeqCst), 1);
    cache.verify_integrity().unwrap();
}

#[test]
fn waiter_takes_over_after_owner_abandons() {
    let dir = tempdir().unwrap();
    let cache = unique_builder(dir.path()).open().unwrap();

    let barrier = Arc::new(Barrier::new(2));

    let owner = {
        let cache = cache.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut blob = Blob::default();
            let locker = cache.get(KEY, &mut blob).unwrap();
            assert_eq!(locker.status(), LockerStatus::MustCompute);
            barrier.wait();
            // Hold the reservation briefly, then give up without insert.
            thread::sleep(Duration::from_millis(80));
            drop(locker);
        })
    };

    let waiter = {
        let cache = cache.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut blob = Blob::default();
            let mut locker = cache.get(KEY, &mut blob).unwrap();
            // The owner holds the reservation right now.
            assert_eq!(locker.status(), LockerStatus::ComputationPending);
            // After the owner rolls back, the waiter is promoted.
            let status = locker.wait(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(status, LockerStatus::MustCompute);
            *locker.payload_mut() = Blob::computed(KEY, 64);
            locker.insert().unwrap();
        })
    };

    owner.join().unwrap();
    waiter.join().unwrap();

    let mut probe = Blob::default();
    let locker = cache.get(KEY, &mut probe).unwrap();
    assert_eq!(locker.status(), LockerStatus::Cached);
    drop(locker);
    assert_eq!(probe.bytes, Blob::computed(KEY, 64).bytes);
    cache.verify_integrity().unwrap();
}

#[test]
fn waiter_timeout_promotes_to_takeover() {
    let dir = tempdir().unwrap();
    let cache = unique_builder(dir.path()).open().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));

    // A stalled owner that only releases after the waiter finished.
    let owner = {
        let cache = cache.clone();
        let barrier = Arc::clone(&barrier);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            let mut blob = Blob::default();
            let locker = cache.get(KEY, &mut blob).unwrap();
            assert_eq!(locker.status(), LockerStatus::MustCompute);
            barrier.wait();
            release.wait();
            drop(locker);
        })
    };

    let waiter = {
        let cache = cache.clone();
        let barrier = Arc::clone(&barrier);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            barrier.wait();
            let mut blob = Blob::default();
            let mut locker = cache.get(KEY, &mut blob).unwrap();
            assert_eq!(locker.status(), LockerStatus::ComputationPending);
            // A short patience: the stalled owner exceeds it and the entry
            // is taken over.
            let status = locker.wait(Some(Duration::from_millis(200))).unwrap();
            assert_eq!(status, LockerStatus::MustCompute);
            *locker.payload_mut() = Blob::computed(KEY, 32);
            locker.insert().unwrap();
            release.wait();
        })
    };

    owner.join().unwrap();
    waiter.join().unwrap();

    let mut probe = Blob::default();
    let locker = cache.get(KEY, &mut probe).unwrap();
    assert_eq!(locker.status(), LockerStatus::Cached);
    drop(locker);
    assert_eq!(probe.bytes, Blob::computed(KEY, 32).bytes);
    cache.verify_integrity().unwrap();
}

#[test]
fn concurrent_distinct_keys_do_not_interfere() {
    let dir = tempdir().unwrap();
    let cache = unique_builder(dir.path()).open().unwrap();

    const THREADS: usize = 8;
    const PER_THREAD: u64 = 20;
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = ((t * 31 + i) << 56) | (t << 16) | i;
                    let mut blob = Blob::computed(key, 128);
                    let mut locker = cache.get(key, &mut blob).unwrap();
                    assert_eq!(locker.status(), LockerStatus::MustCompute);
                    locker.insert().unwrap();
                    drop(locker);

                    let mut probe = Blob::default();
                    let locker = cache.get(key, &mut probe).unwrap();
                    assert_eq!(locker.status(), LockerStatus::Cached);
                    drop(locker);
                    assert_eq!(probe.bytes, blob.bytes);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    cache.verify_integrity().unwrap();
}

#[test]
fn abandoned_lock_triggers_recovery_and_wipe() {
    let dir = tempdir().unwrap();
    let builder = unique_builder(dir.path()).lock_timeout(Duration::from_millis(300));
    let config = builder.build();
    let shm_name = config.shm_name();
    let cache = Cache::open(config).unwrap();

    // Populate an entry that the wipe must erase.
    let other_key = (0x42u64 << 56) | 7;
    {
        let mut blob = Blob::computed(other_key, 100);
        let mut locker = cache.get(other_key, &mut blob).unwrap();
        locker.insert().unwrap();
    }

    // Simulate a peer killed while holding shard 0x42's lock: acquire it
    // through a second mapping of the lock segment and never release.
    let stale = SharedSegment::open(&shm_name).unwrap();
    std::mem::forget(
        stale
            .state()
            .shard(0x42)
            .shard_lock
            .write(Duration::from_secs(1))
            .unwrap(),
    );

    // The next access times out, recovers, wipes, and degrades softly.
    let mut probe = Blob::default();
    let locker = cache.get(other_key, &mut probe).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    drop(locker);
    drop(stale);

    // Recovery closure: the cache is fully usable afterwards.
    let mut blob = Blob::computed(other_key, 100);
    let mut locker = cache.get(other_key, &mut blob).unwrap();
    assert_eq!(locker.status(), LockerStatus::MustCompute);
    locker.insert().unwrap();
    drop(locker);

    let mut probe = Blob::default();
    let locker = cache.get(other_key, &mut probe).unwrap();
    assert_eq!(locker.status(), LockerStatus::Cached);
    drop(locker);
    cache.verify_integrity().unwrap();
}
