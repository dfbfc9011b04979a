//! # Shared Memory-Mapped Files
//!
//! `MappedFile` is the low-level building block under both the per-shard
//! ToC segments and the tile-storage files: a create-or-open file mapped
//! `MAP_SHARED` so that every process sees every store, with resize support
//! that preserves contents.
//!
//! ## Safety Model
//!
//! Unlike a single-process mapping, borrow checking cannot police accesses
//! here: the same bytes are mapped by unrelated processes, and within one
//! process a writer may mutate entry bytes while holding only the shard's
//! interprocess lock (not a Rust `&mut`). The rules are therefore:
//!
//! - The *mapping itself* (remap, resize, unmap) is only changed through
//!   `&mut self`, and the cache guarantees the interprocess ToC lock is
//!   held exclusively at those points, with every peer's `active_readers`
//!   drained (see the shard remap protocol).
//! - The *bytes* are reached through raw pointers whose aliasing discipline
//!   is the interprocess lock hierarchy, not the borrow checker. All typed
//!   access goes through the arena layer, which bounds-checks offsets.
//!
//! ## Backing
//!
//! A non-persistent cache uses the same code with anonymous memory: no
//! file, no sync, no hole punching, process-private.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    File { file: File, path: PathBuf },
    Anonymous,
}

/// A growable shared mapping over a file or anonymous memory.
#[derive(Debug)]
pub struct MappedFile {
    backing: Backing,
    map: Option<MmapMut>,
    len: usize,
}

// SAFETY: the raw-pointer byte access is governed by the cache's
// interprocess lock hierarchy; the struct itself is only mutated under
// &mut self.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Opens `path`, creating it at `min_size` bytes if absent, and maps it
    /// shared at its current size (grown to `min_size` if smaller).
    pub fn open_or_create(path: &Path, min_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open cache file '{}'", path.display()))?;

        let existing = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as usize;

        let size = existing.max(min_size);
        if size > existing {
            file.set_len(size as u64)
                .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), size))?;
        }

        let mut this = Self {
            backing: Backing::File {
                file,
                path: path.to_path_buf(),
            },
            map: None,
            len: size,
        };
        this.map_current()?;
        Ok(this)
    }

    /// Anonymous variant: process-private zeroed memory of `size` bytes.
    pub fn anonymous(size: usize) -> Result<Self> {
        let map = MmapMut::map_anon(size).wrap_err("failed to map anonymous segment")?;
        Ok(Self {
            backing: Backing::Anonymous,
            map: Some(map),
            len: size,
        })
    }

    fn map_current(&mut self) -> Result<()> {
        match &self.backing {
            Backing::File { file, path } => {
                // SAFETY: the file is open read-write and sized to self.len.
                // Peers mutate the mapped bytes concurrently by design; all
                // access above this layer is serialized by the interprocess
                // locks, and no Rust reference to the bytes outlives a lock
                // guard.
                let map = unsafe {
                    MmapMut::map_mut(file)
                        .wrap_err_with(|| format!("failed to map '{}'", path.display()))?
                };
                self.map = Some(map);
            }
            Backing::Anonymous => {
                debug_assert!(self.map.is_some(), "anonymous mapping never unmaps");
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            Backing::Anonymous => None,
        }
    }

    /// Base pointer of the mapping.
    pub fn base(&self) -> *mut u8 {
        let map = self.map.as_ref().expect("mapping accessed while unmapped");
        // Writable shared mapping: handing out *mut from &self is sound
        // because byte-level aliasing is governed by the interprocess locks,
        // exactly as it is between processes.
        map.as_ptr() as *mut u8
    }

    /// Drops the OS mapping while keeping the file open. Used by the remap
    /// protocol while a peer resizes the file.
    pub fn unmap(&mut self) {
        if matches!(self.backing, Backing::File { .. }) {
            self.map = None;
        }
    }

    /// Re-stats the file and maps it at its current size. The peer that
    /// resized already published the new length. Anonymous backings have
    /// no peers and keep their mapping.
    pub fn remap(&mut self) -> Result<()> {
        let Backing::File { file, path } = &self.backing else {
            return Ok(());
        };
        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as usize;
        self.len = size;
        self.map = None;
        self.map_current()
    }

    /// Grows (or shrinks) the backing to `new_size`, preserving the common
    /// prefix, and remaps. Caller holds the segment exclusively with all
    /// peer mappings drained.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        match &mut self.backing {
            Backing::File { file, path } => {
                if let Some(map) = &self.map {
                    map.flush_async().wrap_err("failed to flush before resize")?;
                }
                self.map = None;
                file.set_len(new_size as u64).wrap_err_with(|| {
                    format!("failed to resize '{}' to {} bytes", path.display(), new_size)
                })?;
                self.len = new_size;
                self.map_current()
            }
            Backing::Anonymous => {
                let mut map =
                    MmapMut::map_anon(new_size).wrap_err("failed to grow anonymous segment")?;
                if let Some(old) = &self.map {
                    let keep = self.len.min(new_size);
                    map[..keep].copy_from_slice(&old[..keep]);
                }
                self.map = Some(map);
                self.len = new_size;
                Ok(())
            }
        }
    }

    /// Truncates to zero and re-extends to `new_size`: all bytes read zero
    /// afterwards and the file occupies no blocks.
    pub fn wipe(&mut self, new_size: usize) -> Result<()> {
        match &mut self.backing {
            Backing::File { file, path } => {
                self.map = None;
                file.set_len(0)
                    .wrap_err_with(|| format!("failed to truncate '{}'", path.display()))?;
                file.set_len(new_size as u64)
                    .wrap_err_with(|| format!("failed to re-extend '{}'", path.display()))?;
                self.len = new_size;
                self.map_current()
            }
            Backing::Anonymous => {
                self.map =
                    Some(MmapMut::map_anon(new_size).wrap_err("failed to remap anonymous segment")?);
                self.len = new_size;
                Ok(())
            }
        }
    }

    /// Best-effort flush of the mapped bytes to disk.
    pub fn sync(&self) -> Result<()> {
        if let (Backing::File { .. }, Some(map)) = (&self.backing, &self.map) {
            map.flush().wrap_err("failed to sync mapping")?;
        }
        Ok(())
    }

    /// Deallocates the blocks behind `[offset, offset + len)` so the range
    /// reads zero and is never written back. Freed tiles go through here so
    /// stale pixel data does not reach disk.
    pub fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        if let Backing::File { file, path } = &self.backing {
            // SAFETY: fallocate on an owned descriptor; KEEP_SIZE leaves the
            // file length (and therefore every peer's mapping) untouched.
            let rc = unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    offset as libc::off_t,
                    len as libc::off_t,
                )
            };
            ensure!(
                rc == 0,
                "failed to punch hole in '{}' at {}+{}: {}",
                path.display(),
                offset,
                len,
                std::io::Error::last_os_error()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_reopen_preserves_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");

        {
            let seg = MappedFile::open_or_create(&path, 4096).unwrap();
            // SAFETY: exclusive test access.
            unsafe { *seg.base() = 0xAB };
            seg.sync().unwrap();
        }

        let seg = MappedFile::open_or_create(&path, 4096).unwrap();
        assert_eq!(seg.len(), 4096);
        // SAFETY: exclusive test access.
        assert_eq!(unsafe { *seg.base() }, 0xAB);
    }

    #[test]
    fn resize_preserves_prefix() {
        let dir = tempdir().unwrap();
        let mut seg = MappedFile::open_or_create(&dir.path().join("seg"), 4096).unwrap();

        // SAFETY: exclusive test access.
        unsafe { *seg.base().add(100) = 42 };
        seg.resize(8192).unwrap();

        assert_eq!(seg.len(), 8192);
        // SAFETY: exclusive test access.
        assert_eq!(unsafe { *seg.base().add(100) }, 42);
    }

    #[test]
    fn wipe_zeroes_contents() {
        let dir = tempdir().unwrap();
        let mut seg = MappedFile::open_or_create(&dir.path().join("seg"), 4096).unwrap();

        // SAFETY: exclusive test access.
        unsafe { *seg.base() = 7 };
        seg.wipe(4096).unwrap();
        // SAFETY: exclusive test access.
        assert_eq!(unsafe { *seg.base() }, 0);
    }

    #[test]
    fn anonymous_resize_preserves_prefix() {
        let mut seg = MappedFile::anonymous(1024).unwrap();
        // SAFETY: exclusive test access.
        unsafe { *seg.base().add(10) = 9 };
        seg.resize(2048).unwrap();
        // SAFETY: exclusive test access.
        assert_eq!(unsafe { *seg.base().add(10) }, 9);
        assert!(seg.path().is_none());
    }

    #[test]
    fn unmap_and_remap_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let mut seg = MappedFile::open_or_create(&path, 4096).unwrap();

        // SAFETY: exclusive test access.
        unsafe { *seg.base() = 3 };
        seg.unmap();
        assert!(!seg.is_mapped());
        seg.remap().unwrap();
        // SAFETY: exclusive test access.
        assert_eq!(unsafe { *seg.base() }, 3);
    }

    #[test]
    fn punch_hole_zeroes_the_range() {
        let dir = tempdir().unwrap();
        let seg = MappedFile::open_or_create(&dir.path().join("seg"), 16384).unwrap();

        // SAFETY: exclusive test access.
        unsafe {
            std::ptr::write_bytes(seg.base().add(4096), 0xFF, 4096);
        }
        seg.punch_hole(4096, 4096).unwrap();
        // SAFETY: exclusive test access.
        assert_eq!(unsafe { *seg.base().add(4096) }, 0);
        assert_eq!(unsafe { *seg.base().add(8191) }, 0);
    }
}
