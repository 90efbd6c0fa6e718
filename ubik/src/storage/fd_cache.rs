//! A small LRU cache of open file descriptors, amortizing `open()` for the
//! flat back-end's random-access reads/writes. Append writes for the
//! log go through a separate cached stream (see [`crate::wal`]) and never
//! touch this cache.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use crate::error::CResult;
use crate::storage::FileId;

/// Default number of fds kept open at once.
pub const DEFAULT_CAPACITY: usize = 4;

struct Slot {
    file: FileId,
    handle: File,
}

/// Maps logical file ids to open `File` handles, evicting least-recently-used
/// entries once `capacity` is exceeded. Invalidated wholesale on
/// install/truncate of the underlying database.
pub struct FdCache {
    dir: PathBuf,
    capacity: usize,
    // Front = most recently used.
    slots: VecDeque<Slot>,
}

impl FdCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(dir, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        FdCache { dir: dir.into(), capacity: capacity.max(1), slots: VecDeque::new() }
    }

    /// Path on disk for a given logical file id, per the naming scheme:
    /// positive ids map to `PATH.DB<id>` (only id 0 used), negative ids map
    /// to `PATH.DBSYS<|id|>` (only -1, the log, used).
    pub fn path_for(&self, file: FileId) -> PathBuf {
        if file >= 0 {
            self.dir.join(format!("DB{}", file))
        } else {
            self.dir.join(format!("DBSYS{}", -file))
        }
    }

    fn touch(&mut self, idx: usize) {
        if idx != 0 {
            let slot = self.slots.remove(idx).expect("index within bounds");
            self.slots.push_front(slot);
        }
    }

    /// Borrows the handle for `file`, opening and caching it if necessary.
    pub fn get(&mut self, file: FileId) -> CResult<&mut File> {
        if let Some(idx) = self.slots.iter().position(|s| s.file == file) {
            self.touch(idx);
            return Ok(&mut self.slots[0].handle);
        }

        let handle = OpenOptions::new().read(true).write(true).create(true).open(self.path_for(file))?;
        if self.slots.len() >= self.capacity {
            self.slots.pop_back();
        }
        self.slots.push_front(Slot { file, handle });
        Ok(&mut self.slots[0].handle)
    }

    /// Drops every cached handle. Called wholesale when a database is
    /// installed or truncated, since old handles may point at now-stale
    /// inodes.
    pub fn invalidate_all(&mut self) {
        self.slots.clear();
    }

    /// Drops the cached handle for a single file id, if present.
    pub fn invalidate(&mut self, file: FileId) {
        self.slots.retain(|s| s.file != file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::with_capacity(dir.path(), 2);

        cache.get(0).unwrap();
        cache.get(1).unwrap();
        cache.get(2).unwrap(); // evicts file 0

        assert!(!cache.slots.iter().any(|s| s.file == 0));
        assert!(cache.slots.iter().any(|s| s.file == 1));
        assert!(cache.slots.iter().any(|s| s.file == 2));
    }

    #[test]
    fn invalidate_all_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::new(dir.path());
        cache.get(0).unwrap();
        cache.invalidate_all();
        assert!(cache.slots.is_empty());
    }
}
