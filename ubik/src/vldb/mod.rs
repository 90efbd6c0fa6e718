//! VLDB indexing layer: a volume-location directory keyed by volume
//! id and name, carried as data inside an Ubik database rather than as a
//! separate service. The same five operations (`FindById`, `FindByName`,
//! `ThreadVLentry`, `UnthreadVLentry`, `NextEntry`) are available on both
//! physical back-ends; this module picks the schema implementation by the
//! database's own [`BackendKind`] tag and exposes one back-end-agnostic API
//! to callers.

pub mod entry;
pub mod flat;
pub mod kv;
pub mod upgrade;

use crate::error::{CResult, Error};
use crate::storage::{BackendKind, PhysicalStore};
pub use entry::VlEntry;

/// Which id field of a [`VlEntry`] an id belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdKind {
    Rw,
    Ro,
    Bk,
}

/// A cursor into `NextEntry`'s walk order. Flat mode orders by hash-bucket
/// slot index; KV mode orders by ascending RW id. Callers that only need
/// "all entries" can start from [`Cursor::START`] and stop at `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cursor(u32);

impl Cursor {
    pub const START: Cursor = Cursor(0);
}

/// Ensures the VLDB region/keyspace exists, creating an empty one if this is
/// a freshly-initialized database.
pub fn init_if_needed(backend: BackendKind, store: &mut dyn PhysicalStore) -> CResult<()> {
    match backend {
        BackendKind::Flat => flat::VldbFlat::new(store).init_if_needed(),
        BackendKind::Kv => kv::VldbKv::new(kv_application(store)?).init_if_needed(),
    }
}

fn kv_application(store: &mut dyn PhysicalStore) -> CResult<&mut dyn crate::storage::KvApplication> {
    store
        .as_kv_application()
        .ok_or_else(|| Error::BadType("VLDB KV operation requested on a non-KV back-end".into()))
}

pub fn find_by_id(backend: BackendKind, store: &mut dyn PhysicalStore, id: u32, kind: IdKind) -> CResult<Option<VlEntry>> {
    match backend {
        BackendKind::Flat => flat::VldbFlat::new(store).find_by_id(id, kind),
        BackendKind::Kv => kv::VldbKv::new(kv_application(store)?).find_by_id(id, kind),
    }
}

pub fn find_by_name(backend: BackendKind, store: &mut dyn PhysicalStore, name: &str) -> CResult<Option<VlEntry>> {
    match backend {
        BackendKind::Flat => flat::VldbFlat::new(store).find_by_name(name),
        BackendKind::Kv => kv::VldbKv::new(kv_application(store)?).find_by_name(name),
    }
}

/// `ThreadVLentry`: links a new or updated entry into the directory.
pub fn thread(backend: BackendKind, store: &mut dyn PhysicalStore, entry: VlEntry) -> CResult<()> {
    match backend {
        BackendKind::Flat => flat::VldbFlat::new(store).thread(entry).map(|_| ()),
        BackendKind::Kv => kv::VldbKv::new(kv_application(store)?).thread(entry),
    }
}

/// `UnthreadVLentry`: removes an entry by its RW id.
pub fn unthread(backend: BackendKind, store: &mut dyn PhysicalStore, rw_id: u32) -> CResult<()> {
    match backend {
        BackendKind::Flat => {
            let flat_store = flat::VldbFlat::new(store);
            unthread_flat(flat_store, rw_id)
        }
        BackendKind::Kv => kv::VldbKv::new(kv_application(store)?).unthread(rw_id),
    }
}

fn unthread_flat(mut vldb: flat::VldbFlat<'_>, rw_id: u32) -> CResult<()> {
    let mut cursor = 0u32;
    loop {
        match vldb.next_entry(cursor)? {
            Some((index, candidate)) if candidate.rw_id == rw_id => return vldb.unthread(index),
            Some((index, _)) => cursor = index,
            None => return Err(Error::NotFound(format!("no VLDB entry with RW id {rw_id}"))),
        }
    }
}

/// `NextEntry`: walks every entry in the directory in back-end-native
/// order, starting after `cursor`. Returns the entry found and the cursor
/// to resume from.
pub fn next_entry(backend: BackendKind, store: &mut dyn PhysicalStore, cursor: Cursor) -> CResult<Option<(Cursor, VlEntry)>> {
    match backend {
        BackendKind::Flat => Ok(flat::VldbFlat::new(store)
            .next_entry(cursor.0)?
            .map(|(index, entry)| (Cursor(index), entry))),
        BackendKind::Kv => {
            let mut vldb = kv::VldbKv::new(kv_application(store)?);
            Ok(vldb.next_entry(cursor.0)?.map(|entry| (Cursor(entry.rw_id), entry)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::flat::FlatStore;
    use crate::storage::kv::KvStoreOn;
    use crate::storage::memory::Memory;

    #[test]
    fn flat_dispatch_threads_and_finds() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        init_if_needed(BackendKind::Flat, &mut store).unwrap();

        thread(BackendKind::Flat, &mut store, VlEntry::new(1, "root.cell")).unwrap();
        let found = find_by_id(BackendKind::Flat, &mut store, 1, IdKind::Rw).unwrap().unwrap();
        assert_eq!(found.name, "root.cell");

        unthread(BackendKind::Flat, &mut store, 1).unwrap();
        assert!(find_by_id(BackendKind::Flat, &mut store, 1, IdKind::Rw).unwrap().is_none());
    }

    #[test]
    fn kv_dispatch_threads_and_finds() {
        let mut store = KvStoreOn::new(Memory::new());
        init_if_needed(BackendKind::Kv, &mut store).unwrap();

        thread(BackendKind::Kv, &mut store, VlEntry::new(5, "user.x")).unwrap();
        let found = find_by_name(BackendKind::Kv, &mut store, "user.x").unwrap().unwrap();
        assert_eq!(found.rw_id, 5);

        unthread(BackendKind::Kv, &mut store, 5).unwrap();
        assert!(find_by_name(BackendKind::Kv, &mut store, "user.x").unwrap().is_none());
    }

    #[test]
    fn next_entry_dispatch_stops_at_none() {
        let mut store = KvStoreOn::new(Memory::new());
        init_if_needed(BackendKind::Kv, &mut store).unwrap();
        thread(BackendKind::Kv, &mut store, VlEntry::new(2, "a")).unwrap();

        let (cursor, entry) = next_entry(BackendKind::Kv, &mut store, Cursor::START).unwrap().unwrap();
        assert_eq!(entry.rw_id, 2);
        assert!(next_entry(BackendKind::Kv, &mut store, cursor).unwrap().is_none());
    }
}
