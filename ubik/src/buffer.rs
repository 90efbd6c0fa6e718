//! The process-wide buffer cache: a fixed array of 1 KiB page slots shared
//! by every transaction, indexed by an open-chain hash on `page_number` and
//! doubly linked as an LRU. Mutated under `DBHOLD`; callers take
//! [`BufferCache`]'s own lock, which plays that role in this codebase.

use std::sync::Mutex;

use crate::error::{CResult, Error};
use crate::storage::{FileId, PhysicalStore};

/// Page size every buffer slot holds.
pub const PAGE_SIZE: usize = 1024;

/// Default buffer array size.
pub const DEFAULT_BUFFERS: usize = 20;

const NIL: usize = usize::MAX;

struct Buffer {
    /// Identifies which open database this page belongs to; lets the same
    /// process host more than one ubik instance without cross-contaminating
    /// their caches.
    dbase: u32,
    file: FileId,
    page: u32,
    data: Box<[u8; PAGE_SIZE]>,
    dirty: bool,
    /// Count of transactions currently pinning this buffer.
    lockers: u32,
    valid: bool,
    lru_prev: usize,
    lru_next: usize,
    hash_next: usize,
}

impl Buffer {
    fn empty() -> Self {
        Buffer {
            dbase: 0,
            file: 0,
            page: 0,
            data: Box::new([0u8; PAGE_SIZE]),
            dirty: false,
            lockers: 0,
            valid: false,
            lru_prev: NIL,
            lru_next: NIL,
            hash_next: NIL,
        }
    }
}

/// Handle to a pinned buffer, returned by [`BufferCache::read`]/`new_page`.
/// Callers must pass the `index` back to [`BufferCache::release`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    pub index: usize,
}

struct Inner {
    slots: Vec<Buffer>,
    /// Open-chain hash buckets over `page_number`, sized to a small prime
    /// multiple of the slot count.
    buckets: Vec<usize>,
    lru_head: usize,
    lru_tail: usize,
}

impl Inner {
    fn bucket_for(&self, page: u32) -> usize {
        (page as usize) % self.buckets.len()
    }

    fn unlink_lru(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].lru_prev, self.slots[idx].lru_next);
        if prev != NIL {
            self.slots[prev].lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.slots[next].lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
        self.slots[idx].lru_prev = NIL;
        self.slots[idx].lru_next = NIL;
    }

    fn push_mru(&mut self, idx: usize) {
        self.slots[idx].lru_prev = NIL;
        self.slots[idx].lru_next = self.lru_head;
        if self.lru_head != NIL {
            self.slots[self.lru_head].lru_prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NIL {
            self.lru_tail = idx;
        }
    }

    fn unlink_hash(&mut self, idx: usize) {
        if !self.slots[idx].valid {
            return;
        }
        let bucket = self.bucket_for(self.slots[idx].page);
        let mut cur = self.buckets[bucket];
        if cur == idx {
            self.buckets[bucket] = self.slots[idx].hash_next;
            self.slots[idx].hash_next = NIL;
            return;
        }
        while cur != NIL {
            let next = self.slots[cur].hash_next;
            if next == idx {
                self.slots[cur].hash_next = self.slots[idx].hash_next;
                self.slots[idx].hash_next = NIL;
                return;
            }
            cur = next;
        }
    }

    fn link_hash(&mut self, idx: usize) {
        let bucket = self.bucket_for(self.slots[idx].page);
        self.slots[idx].hash_next = self.buckets[bucket];
        self.buckets[bucket] = idx;
    }

    fn find(&self, dbase: u32, file: FileId, page: u32) -> Option<usize> {
        let bucket = self.bucket_for(page);
        let mut cur = self.buckets[bucket];
        while cur != NIL {
            let slot = &self.slots[cur];
            if slot.valid && slot.dbase == dbase && slot.file == file && slot.page == page {
                return Some(cur);
            }
            cur = slot.hash_next;
        }
        None
    }

    /// Reclaims a free or least-recently-used slot with `lockers == 0 &&
    /// !dirty`, panicking if none exists. This is the buffer cache's one
    /// hard-panic condition, mirroring a "no free buffers" fatal abort.
    fn reclaim(&mut self) -> usize {
        let mut cur = self.lru_tail;
        while cur != NIL {
            let prev = self.slots[cur].lru_prev;
            if self.slots[cur].lockers == 0 && !self.slots[cur].dirty {
                self.unlink_hash(cur);
                self.unlink_lru(cur);
                return cur;
            }
            cur = prev;
        }
        panic!("buffer cache exhausted: no slot with lockers == 0 && !dirty");
    }
}

/// The shared buffer cache. One instance per running server process.
pub struct BufferCache {
    inner: Mutex<Inner>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFERS)
    }

    pub fn with_capacity(n: usize) -> Self {
        let n = n.max(1);
        let slots = (0..n).map(|_| Buffer::empty()).collect();
        let buckets = vec![NIL; (n * 2).max(1)];
        BufferCache { inner: Mutex::new(Inner { slots, buckets, lru_head: NIL, lru_tail: NIL }) }
    }

    /// `DRead(tx, file, page)`: returns a pinned buffer holding `page`'s
    /// contents, reading through `store` on a miss. `is_write` must be true
    /// for the system's single write transaction; read transactions are
    /// refused a dirty buffer so they never observe uncommitted data.
    pub fn read(
        &self,
        store: &mut dyn PhysicalStore,
        dbase: u32,
        file: FileId,
        page: u32,
        is_write: bool,
    ) -> CResult<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.find(dbase, file, page) {
            if is_write || !inner.slots[idx].dirty {
                inner.slots[idx].lockers += 1;
                inner.unlink_lru(idx);
                inner.push_mru(idx);
                return Ok(BufferHandle { index: idx });
            }
        }

        let idx = inner.reclaim();
        let data = store.read(file, (page as u64) * PAGE_SIZE as u64, PAGE_SIZE)?;
        let slot = &mut inner.slots[idx];
        slot.dbase = dbase;
        slot.file = file;
        slot.page = page;
        slot.data.copy_from_slice(&data);
        slot.dirty = false;
        slot.lockers = 1;
        slot.valid = true;
        inner.link_hash(idx);
        inner.push_mru(idx);
        Ok(BufferHandle { index: idx })
    }

    /// `DNew(tx, file, page)`: like `read`, but the slot is zero-filled
    /// rather than read from storage, for pages being written for the first
    /// time.
    pub fn new_page(&self, dbase: u32, file: FileId, page: u32) -> CResult<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.find(dbase, file, page) {
            inner.slots[idx].lockers += 1;
            inner.unlink_lru(idx);
            inner.push_mru(idx);
            return Ok(BufferHandle { index: idx });
        }
        let idx = inner.reclaim();
        let slot = &mut inner.slots[idx];
        slot.dbase = dbase;
        slot.file = file;
        slot.page = page;
        slot.data = Box::new([0u8; PAGE_SIZE]);
        slot.dirty = true;
        slot.lockers = 1;
        slot.valid = true;
        inner.link_hash(idx);
        inner.push_mru(idx);
        Ok(BufferHandle { index: idx })
    }

    /// Reads the buffer's current bytes.
    pub fn bytes(&self, handle: BufferHandle) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        inner.slots[handle.index].data.to_vec()
    }

    /// Overwrites bytes at `offset` within the page, marking it dirty.
    pub fn write(&self, handle: BufferHandle, offset: usize, data: &[u8]) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[handle.index];
        if offset + data.len() > PAGE_SIZE {
            return Err(Error::Internal("buffer write out of page bounds".into()));
        }
        slot.data[offset..offset + data.len()].copy_from_slice(data);
        slot.dirty = true;
        Ok(())
    }

    /// `DRelease(p, dirty?)`: unpins the buffer, optionally marking it dirty.
    pub fn release(&self, handle: BufferHandle, dirty: bool) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[handle.index];
        slot.lockers = slot.lockers.saturating_sub(1);
        if dirty {
            slot.dirty = true;
        }
    }

    /// `DFlush(tx)`: writes every dirty buffer to disk, leaving dirty bits
    /// set. Must always be followed by [`BufferCache::sync`].
    pub fn flush(&self, store: &mut dyn PhysicalStore) -> CResult<()> {
        let inner = self.inner.lock().unwrap();
        for slot in inner.slots.iter().filter(|s| s.valid && s.dirty) {
            store.write(slot.file, (slot.page as u64) * PAGE_SIZE as u64, &*slot.data)?;
        }
        Ok(())
    }

    /// `DSync(tx)`: syncs every file touched by a dirty buffer and clears
    /// dirty bits, invalidating any other buffer for the same `(file,
    /// page)` that appeared while this one was dirty (duplicate read-tx
    /// copies taken before the write committed).
    pub fn sync(&self, store: &mut dyn PhysicalStore) -> CResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut files: Vec<FileId> = inner.slots.iter().filter(|s| s.valid && s.dirty).map(|s| s.file).collect();
        files.sort_unstable();
        files.dedup();
        for file in files {
            store.sync(file)?;
        }

        let dirty_keys: Vec<(u32, FileId, u32)> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid && s.dirty)
            .map(|(_, s)| (s.dbase, s.file, s.page))
            .collect();

        for slot in inner.slots.iter_mut().filter(|s| s.valid && s.dirty) {
            slot.dirty = false;
        }

        // Invalidate stale read-only duplicates of pages that were just
        // cleaned, keeping exactly the slot that is now the clean copy.
        for (dbase, file, page) in dirty_keys {
            let mut keep: Option<usize> = None;
            let mut stale = Vec::new();
            for (idx, slot) in inner.slots.iter().enumerate() {
                if slot.valid && slot.dbase == dbase && slot.file == file && slot.page == page {
                    if keep.is_none() {
                        keep = Some(idx);
                    } else {
                        stale.push(idx);
                    }
                }
            }
            for idx in stale {
                if inner.slots[idx].lockers == 0 {
                    inner.unlink_hash(idx);
                    inner.slots[idx].valid = false;
                }
            }
        }
        Ok(())
    }

    /// `DAbort(tx)`: clears dirty bits, invalidates every buffer belonging
    /// to `dbase`, and returns them to the LRU free pool.
    pub fn abort(&self, dbase: u32) {
        let mut inner = self.inner.lock().unwrap();
        let idxs: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid && s.dbase == dbase)
            .map(|(i, _)| i)
            .collect();
        for idx in idxs {
            inner.unlink_hash(idx);
            let slot = &mut inner.slots[idx];
            slot.dirty = false;
            slot.lockers = 0;
            slot.valid = false;
        }
    }

    /// `DInvalidate(file)`: drops every buffer for `file` within `dbase`,
    /// called after the physical file underneath has been swapped out
    /// (install, recovery fetch) so stale pages can never be served again.
    pub fn invalidate(&self, dbase: u32, file: FileId) {
        let mut inner = self.inner.lock().unwrap();
        let idxs: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.valid && s.dbase == dbase && s.file == file)
            .map(|(i, _)| i)
            .collect();
        for idx in idxs {
            inner.unlink_hash(idx);
            inner.slots[idx].valid = false;
            inner.slots[idx].dirty = false;
            inner.slots[idx].lockers = 0;
        }
    }
}

impl Default for BufferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::flat::FlatStore;
    use crate::storage::DB_FILE;

    #[test]
    fn read_miss_then_hit_reuses_same_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        let cache = BufferCache::with_capacity(2);

        let h1 = cache.read(&mut store, 0, DB_FILE, 0, false).unwrap();
        cache.release(h1, false);
        let h2 = cache.read(&mut store, 0, DB_FILE, 0, false).unwrap();
        assert_eq!(h1, h2);
        cache.release(h2, false);
    }

    #[test]
    fn write_then_flush_sync_persists_and_clears_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        let cache = BufferCache::with_capacity(2);

        let h = cache.new_page(0, DB_FILE, 0).unwrap();
        cache.write(h, 0, b"hi").unwrap();
        cache.release(h, true);

        cache.flush(&mut store).unwrap();
        cache.sync(&mut store).unwrap();

        assert_eq!(&store.read(DB_FILE, 0, 2).unwrap(), b"hi");
    }

    #[test]
    fn abort_clears_dbase_buffers() {
        let cache = BufferCache::with_capacity(2);
        let h = cache.new_page(0, DB_FILE, 0).unwrap();
        cache.release(h, true);
        cache.abort(0);

        let inner = cache.inner.lock().unwrap();
        assert!(inner.slots.iter().all(|s| !s.valid));
    }

    #[test]
    #[should_panic(expected = "buffer cache exhausted")]
    fn exhausting_all_pinned_slots_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        let cache = BufferCache::with_capacity(1);
        let _h1 = cache.read(&mut store, 0, DB_FILE, 0, false).unwrap();
        let _h2 = cache.read(&mut store, 0, DB_FILE, 1, false).unwrap();
    }
}
