//! # Tile Storage
//!
//! Large, uniformly-sized payload buffers (image tiles) do not go through
//! the ToC arena: they live in dedicated storage files, each exactly
//! `tiles_per_file` tiles of `tile_size` bytes, created at full size up
//! front (the blocks materialize lazily, so an empty storage file costs no
//! disk).
//!
//! ## Encoded tile ids
//!
//! A tile is addressed by a 64-bit id packing `(tile_index << 32) |
//! file_index`. The *owning shard* of a tile is `tile_index mod 256`,
//! which deals every storage file's tiles evenly across all 256 shards:
//! each shard draws from its own private slice of every file, so tile
//! allocation contends on the shard lock the caller already holds, not on
//! a global pool.
//!
//! The free sets themselves live in the shards' ToC mappings (they are
//! bookkeeping, and must survive the process); this module owns the files,
//! the id geometry, and the bytes.
//!
//! ## Concurrency
//!
//! The interprocess `tiles_lock` (in the shared lock segment) guards the
//! file vector: shared to resolve tile bytes, exclusive to append a file.
//! Within a process the vector additionally sits behind a `parking_lot`
//! RwLock so `refresh()` can splice in files a peer created. Tile byte
//! pointers stay valid across vector growth (mappings never move), which
//! is what lets a read guard hand out `&[u8]` while another process
//! appends storage.

use std::path::PathBuf;

use eyre::{ensure, Result};
use parking_lot::RwLock;
use tracing::debug;

use super::mapped_file::MappedFile;

/// Encoded tile address: `(tile_index << 32) | file_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(u64);

impl TileId {
    pub fn new(file_index: u32, tile_index: u32) -> Self {
        Self(((tile_index as u64) << 32) | file_index as u64)
    }

    pub fn from_encoded(encoded: u64) -> Self {
        Self(encoded)
    }

    pub fn encoded(self) -> u64 {
        self.0
    }

    pub fn file_index(self) -> u32 {
        self.0 as u32
    }

    pub fn tile_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Shard whose free set this tile belongs to when unused.
    pub fn owning_shard(self) -> usize {
        self.tile_index() as usize % crate::config::constants::SHARD_COUNT
    }
}

#[derive(Debug)]
enum TileBacking {
    Dir(PathBuf),
    Anonymous,
}

/// The set of tile-storage files of one cache instance.
pub struct TileStore {
    backing: TileBacking,
    tile_size: usize,
    tiles_per_file: usize,
    files: RwLock<Vec<MappedFile>>,
}

impl TileStore {
    fn file_name(index: u32) -> String {
        format!("TilesStorage{}", index + 1)
    }

    fn file_size(&self) -> usize {
        self.tile_size * self.tiles_per_file
    }

    /// Opens every existing `TilesStorageK` under `dir` (contiguous K from
    /// 1). Creates none; an empty store is valid until first allocation.
    pub fn open_dir(dir: PathBuf, tile_size: usize, tiles_per_file: usize) -> Result<Self> {
        let store = Self {
            backing: TileBacking::Dir(dir),
            tile_size,
            tiles_per_file,
            files: RwLock::new(Vec::new()),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Anonymous-memory variant for the non-persistent cache.
    pub fn anonymous(tile_size: usize, tiles_per_file: usize) -> Result<Self> {
        Ok(Self {
            backing: TileBacking::Anonymous,
            tile_size,
            tiles_per_file,
            files: RwLock::new(Vec::new()),
        })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn tiles_per_file(&self) -> usize {
        self.tiles_per_file
    }

    pub fn file_count(&self) -> u32 {
        self.files.read().len() as u32
    }

    /// Opens storage files that appeared since the last look (created by a
    /// peer process while it held `tiles_lock` exclusively).
    pub fn refresh(&self) -> Result<()> {
        let TileBacking::Dir(dir) = &self.backing else {
            return Ok(());
        };
        let mut files = self.files.write();
        loop {
            let next = files.len() as u32;
            let path = dir.join(Self::file_name(next));
            if !path.exists() {
                break;
            }
            let file = MappedFile::open_or_create(&path, self.file_size())?;
            ensure!(
                file.len() == self.file_size(),
                "tile storage '{}' has size {} (expected {})",
                path.display(),
                file.len(),
                self.file_size()
            );
            files.push(file);
        }
        Ok(())
    }

    /// Appends one storage file and returns its index. Caller holds the
    /// interprocess `tiles_lock` exclusively and reseeds the shards' free
    /// sets with this file's tiles.
    pub fn create_file(&self) -> Result<u32> {
        let mut files = self.files.write();
        let index = files.len() as u32;
        let file = match &self.backing {
            TileBacking::Dir(dir) => {
                let path = dir.join(Self::file_name(index));
                MappedFile::open_or_create(&path, self.file_size())?
            }
            TileBacking::Anonymous => MappedFile::anonymous(self.file_size())?,
        };
        files.push(file);
        debug!(file_index = index, size = self.file_size(), "tile storage file created");
        Ok(index)
    }

    /// The ids this file contributes to `shard`, ascending.
    pub fn tiles_of_shard(&self, file_index: u32, shard: usize) -> Vec<TileId> {
        let shard_count = crate::config::constants::SHARD_COUNT;
        (0..self.tiles_per_file)
            .skip(shard)
            .step_by(shard_count)
            .map(|tile_index| TileId::new(file_index, tile_index as u32))
            .collect()
    }

    fn locate(&self, id: TileId) -> Result<(u32, u64)> {
        ensure!(
            (id.tile_index() as usize) < self.tiles_per_file,
            "tile index {} out of range (tiles_per_file={})",
            id.tile_index(),
            self.tiles_per_file
        );
        Ok((
            id.file_index(),
            id.tile_index() as u64 * self.tile_size as u64,
        ))
    }

    /// Base pointer of the tile's bytes. Valid while the caller holds
    /// `tiles_lock` at least shared (which forbids wiping); the cache layer
    /// wraps this in guards that carry that lock.
    pub fn tile_ptr(&self, id: TileId) -> Result<*mut u8> {
        let (file_index, offset) = self.locate(id)?;
        let files = self.files.read();
        let file = files.get(file_index as usize).ok_or_else(|| {
            eyre::eyre!(
                "tile {} references storage file {} of {}",
                id.encoded(),
                file_index,
                files.len()
            )
        })?;
        // Mapping addresses never move while the file vector only grows;
        // the returned pointer outlives the vector read guard.
        Ok(unsafe { file.base().add(offset as usize) })
    }

    /// Drops the freed tile's blocks so stale contents are neither kept in
    /// memory nor written back to disk.
    pub fn invalidate(&self, id: TileId) -> Result<()> {
        let (file_index, offset) = self.locate(id)?;
        let files = self.files.read();
        if let Some(file) = files.get(file_index as usize) {
            file.punch_hole(offset, self.tile_size as u64)?;
        }
        Ok(())
    }

    /// Re-truncates every storage file to full-size zeroes. Caller holds
    /// `tiles_lock` exclusively and re-seeds every shard's free set.
    pub fn wipe(&self) -> Result<()> {
        let mut files = self.files.write();
        let size = self.file_size();
        for file in files.iter_mut() {
            file.wipe(size)?;
        }
        debug!(files = files.len(), "tile storage wiped");
        Ok(())
    }

    /// Best-effort flush of every storage file.
    pub fn sync(&self) -> Result<()> {
        for file in self.files.read().iter() {
            file.sync()?;
        }
        Ok(())
    }
}
