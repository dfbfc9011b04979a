//! # Shared Lock Segment
//!
//! A fixed-size POSIX shared-memory object holding every interprocess lock
//! the cache uses: one triplet per shard (ToC lock, shard lock, LRU lock)
//! plus the per-shard mapping-coordination words and the global tile-storage
//! lock. This is the only fixed-size shared mapping; the per-shard ToC files
//! grow, and coordinating that growth is precisely what the words here are
//! for.
//!
//! The segment is designed so that **all-zero bytes are a fully valid,
//! fully unlocked state**. Creation is therefore just `shm_open` +
//! `ftruncate` (which zero-fills); no constructor races, no placement-new
//! protocol between processes. A magic word distinguishes "zeroed, ready to
//! adopt" from "written by an incompatible layout".
//!
//! Destroying and recreating this segment is the recovery path for abandoned
//! locks: see the coordinator.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::locks::{SharedMutex, SharedRwLock};
use crate::config::constants::{SHARD_COUNT, SHARED_SEGMENT_SIZE};

/// Identifies the layout of [`CacheShared`]; bump on any field change.
const SEGMENT_MAGIC: u64 = 0x7463_5348_4d01_0001; // "tcSHM" + layout 1

/// Per-shard interprocess synchronization block.
#[repr(C)]
pub struct ShardSync {
    /// Readers hold this shared while touching the ToC mapping; the grow
    /// protocol holds it exclusive.
    pub toc_lock: SharedRwLock,
    /// Protects the shard record: entry index, size accounting, free tiles,
    /// state sentinel.
    pub shard_lock: SharedRwLock,
    /// Protects the LRU list pointers and nodes.
    pub lru_lock: SharedMutex,
    /// 1 while the ToC file's current size is safe to access through any
    /// process's mapping. Cleared by a growing writer, republished after
    /// remap. Waiters sleep on this word.
    pub mapping_valid: AtomicU32,
    /// Number of processes currently holding a mapping of the ToC file.
    /// The growing writer sleeps on this word until it reaches zero.
    pub active_readers: AtomicU32,
}

/// The single record inside the shared segment.
#[repr(C)]
pub struct CacheShared {
    magic: AtomicU64,
    /// Guards the vector of tile-storage files: shared to read tile data,
    /// exclusive to append a storage file.
    pub tiles_lock: SharedRwLock,
    pub shards: [ShardSync; SHARD_COUNT],
}

impl CacheShared {
    pub fn shard(&self, index: usize) -> &ShardSync {
        &self.shards[index]
    }
}

enum Backing {
    /// Named POSIX shm object shared between processes.
    Named { _file: File, _name: CString },
    /// Process-private anonymous mapping (non-persistent cache).
    Anonymous,
}

/// A mapped handle onto the lock segment.
pub struct SharedSegment {
    map: MmapMut,
    _backing: Backing,
}

// SAFETY: the mapping is shared memory by design; all mutation goes through
// the atomics and futex-based locks inside CacheShared.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

fn shm_name(name: &str) -> Result<CString> {
    let with_slash = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(with_slash).wrap_err("shared segment name contains NUL")
}

fn open_fd(cname: &CString, excl: bool) -> Result<File> {
    let mut flags = libc::O_CREAT | libc::O_RDWR;
    if excl {
        flags |= libc::O_EXCL;
    }
    // SAFETY: valid NUL-terminated name; the returned fd is owned below.
    let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0o644 as libc::mode_t) };
    ensure!(
        fd >= 0,
        "shm_open('{}') failed: {}",
        cname.to_string_lossy(),
        std::io::Error::last_os_error()
    );
    // SAFETY: fd is a fresh descriptor we own.
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(SHARED_SEGMENT_SIZE as u64)
        .wrap_err("failed to size shared segment")?;
    Ok(file)
}

impl SharedSegment {
    /// Removes any previous instance and creates a zeroed segment. Callers
    /// must have proven they are the sole live process (exclusive file
    /// lock), since this invalidates every peer's locks.
    pub fn create(name: &str) -> Result<Self> {
        let cname = shm_name(name)?;
        Self::unlink(name);
        let file = open_fd(&cname, true)?;
        let seg = Self::map(file, cname)?;
        seg.state().magic.store(SEGMENT_MAGIC, Ordering::Release);
        Ok(seg)
    }

    /// Opens (or adopts) the existing segment created by a peer.
    pub fn open(name: &str) -> Result<Self> {
        let cname = shm_name(name)?;
        let file = open_fd(&cname, false)?;
        let seg = Self::map(file, cname)?;

        // First process to arrive on a zeroed segment stamps it; a stamp
        // from a different layout means mixed builds share one name.
        let magic = &seg.state().magic;
        match magic.compare_exchange(0, SEGMENT_MAGIC, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {}
            Err(existing) => ensure!(
                existing == SEGMENT_MAGIC,
                "shared segment '{}' has incompatible layout (magic {:#x})",
                name,
                existing
            ),
        }
        Ok(seg)
    }

    /// Process-private variant for the non-persistent cache: same record,
    /// anonymous backing, no name registered with the OS.
    pub fn anonymous() -> Result<Self> {
        let map = MmapMut::map_anon(SHARED_SEGMENT_SIZE)
            .wrap_err("failed to map anonymous lock segment")?;
        let seg = Self {
            map,
            _backing: Backing::Anonymous,
        };
        seg.state().magic.store(SEGMENT_MAGIC, Ordering::Release);
        Ok(seg)
    }

    fn map(file: File, name: CString) -> Result<Self> {
        const _: () = assert!(
            std::mem::size_of::<CacheShared>() <= SHARED_SEGMENT_SIZE,
            "CacheShared must fit the fixed segment size"
        );
        // SAFETY: the fd was just sized to SHARED_SEGMENT_SIZE; the mapping
        // is MAP_SHARED so peers observe the same bytes. External resizes do
        // not happen: the segment size is a compile-time constant.
        let map = unsafe {
            MmapMut::map_mut(&file).wrap_err_with(|| {
                format!("failed to map shared segment '{}'", name.to_string_lossy())
            })?
        };
        Ok(Self {
            map,
            _backing: Backing::Named { _file: file, _name: name },
        })
    }

    /// The lock record. Valid for the lifetime of this mapping.
    pub fn state(&self) -> &CacheShared {
        // SAFETY: the mapping is at least size_of::<CacheShared>() (compile
        // time assertion in map()), lives as long as self, and CacheShared
        // is valid for any byte pattern in which the lock words obey their
        // own invariants; all-zero (fresh segment) is the unlocked state.
        unsafe { &*(self.map.as_ptr() as *const CacheShared) }
    }

    /// Unregisters the name; existing mappings stay alive until unmapped.
    pub fn unlink(name: &str) {
        if let Ok(cname) = shm_name(name) {
            // SAFETY: unlink of a name; ENOENT is fine.
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unique(tag: &str) -> String {
        format!("tilecache-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn fresh_segment_has_unlocked_locks() {
        let name = unique("fresh");
        let seg = SharedSegment::create(&name).unwrap();

        let shard = seg.state().shard(0);
        let g = shard.shard_lock.write(Duration::from_secs(1)).unwrap();
        drop(g);
        assert!(seg.state().tiles_lock.try_read().is_some());

        SharedSegment::unlink(&name);
    }

    #[test]
    fn two_handles_see_the_same_words() {
        let name = unique("two");
        let a = SharedSegment::create(&name).unwrap();
        let b = SharedSegment::open(&name).unwrap();

        a.state()
            .shard(3)
            .active_readers
            .store(7, Ordering::Release);
        assert_eq!(b.state().shard(3).active_readers.load(Ordering::Acquire), 7);

        let held = a.state().shard(3).shard_lock.write(Duration::from_secs(1)).unwrap();
        assert!(b
            .state()
            .shard(3)
            .shard_lock
            .write(Duration::from_millis(30))
            .is_err());
        drop(held);

        SharedSegment::unlink(&name);
    }

    #[test]
    fn anonymous_segment_works_without_a_name() {
        let seg = SharedSegment::anonymous().unwrap();
        assert!(seg.state().shard(255).lru_lock.try_lock().is_some());
    }
}
