//! `Raw*` transaction variants for offline tools (`ubikctl`): bypass the
//! quorum entirely and operate directly on a single site's physical store,
//! for use only while the server process that owns the database is not
//! running.

use crate::error::CResult;
use crate::storage::{FileId, PhysicalStore};
use crate::version::Version;

/// A raw, single-process transaction: no quorum dispatch, no WAL replay
/// beyond what opening the store already performed. `ubikctl` uses this
/// to patch a database file directly (`-fix`) or to read it for the
/// consistency scan.
pub struct RawTrans<'a> {
    store: &'a mut dyn PhysicalStore,
}

impl<'a> RawTrans<'a> {
    pub fn new(store: &'a mut dyn PhysicalStore) -> Self {
        RawTrans { store }
    }

    pub fn read(&mut self, file: FileId, pos: u64, len: usize) -> CResult<Vec<u8>> {
        self.store.read(file, pos, len)
    }

    pub fn write(&mut self, file: FileId, pos: u64, data: &[u8]) -> CResult<()> {
        self.store.write(file, pos, data)
    }

    pub fn label(&mut self) -> CResult<Version> {
        self.store.getlabel()
    }

    pub fn relabel(&mut self, version: Version) -> CResult<()> {
        self.store.setlabel(version)
    }

    /// Flushes and syncs, the raw equivalent of a transaction's commit.
    pub fn commit(&mut self) -> CResult<()> {
        self.store.sync(crate::storage::DB_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::flat::FlatStore;

    #[test]
    fn raw_trans_reads_and_writes_through_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        let mut raw = RawTrans::new(&mut store);
        raw.write(crate::storage::DB_FILE, 0, b"raw").unwrap();
        assert_eq!(raw.read(crate::storage::DB_FILE, 0, 3).unwrap(), b"raw");
        raw.relabel(Version::new(5, 1)).unwrap();
        assert_eq!(raw.label().unwrap(), Version::new(5, 1));
    }
}
