//! Flat-schema VLDB: a 64-byte header, a 256-slot server-ip
//! table, a name-hash table, and three id-hash tables (RW/RO/BK), all
//! addressed by byte offset within the Ubik database file's `DB_FILE`
//! region. Entries are singly linked through their own `next_*` fields;
//! this module only maintains the bucket heads and the free list.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{CResult, Error};
use crate::storage::{PhysicalStore, DB_FILE};
use crate::vldb::entry::{VlEntry, FLAT_ENTRY_SIZE};
use crate::vldb::IdKind;

pub const VLDB_MAGIC: u32 = 0x4245_5434; // "BET4"
pub const SIT_SLOTS: usize = 256;
pub const HASH_BUCKETS: usize = 8191;

const HEADER_SIZE: u64 = 64;
const SIT_OFFSET: u64 = HEADER_SIZE;
const SIT_SIZE: u64 = SIT_SLOTS as u64 * 4;
const NAME_HASH_OFFSET: u64 = SIT_OFFSET + SIT_SIZE;
const NAME_HASH_SIZE: u64 = HASH_BUCKETS as u64 * 4;
const ID_HASH_OFFSET: u64 = NAME_HASH_OFFSET + NAME_HASH_SIZE;
const ID_HASH_SIZE: u64 = HASH_BUCKETS as u64 * 4;
/// Three id-hash tables: RW, RO, BK, in that order.
const ENTRIES_OFFSET: u64 = ID_HASH_OFFSET + 3 * ID_HASH_SIZE;

/// Hard ceiling on the flat VLDB's total size, mirroring the core flat
/// back-end's own ceiling.
pub const VLDB_SIZE_CEILING: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub eof_ptr: u32,
    pub free_ptr: u32,
    pub allocs: u32,
    pub frees: u32,
    pub max_volume_id: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u32::<BigEndian>(VLDB_MAGIC).unwrap();
        cursor.write_u32::<BigEndian>(self.eof_ptr).unwrap();
        cursor.write_u32::<BigEndian>(self.free_ptr).unwrap();
        cursor.write_u32::<BigEndian>(self.allocs).unwrap();
        cursor.write_u32::<BigEndian>(self.frees).unwrap();
        cursor.write_u32::<BigEndian>(self.max_volume_id).unwrap();
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE as usize]) -> CResult<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != VLDB_MAGIC {
            return Err(Error::BadType(format!("bad VLDB header magic {:#x}", magic)));
        }
        Ok(Header {
            eof_ptr: cursor.read_u32::<BigEndian>()?,
            free_ptr: cursor.read_u32::<BigEndian>()?,
            allocs: cursor.read_u32::<BigEndian>()?,
            frees: cursor.read_u32::<BigEndian>()?,
            max_volume_id: cursor.read_u32::<BigEndian>()?,
        })
    }
}

impl IdKind {
    fn table_index(self) -> u64 {
        match self {
            IdKind::Rw => 0,
            IdKind::Ro => 1,
            IdKind::Bk => 2,
        }
    }
}

pub struct VldbFlat<'a> {
    store: &'a mut dyn PhysicalStore,
}

impl<'a> VldbFlat<'a> {
    pub fn new(store: &'a mut dyn PhysicalStore) -> Self {
        VldbFlat { store }
    }

    /// Initializes a fresh, empty VLDB region if none exists yet.
    pub fn init_if_needed(&mut self) -> CResult<()> {
        if self.read_header().is_err() {
            self.write_header(Header { eof_ptr: 0, free_ptr: 0, allocs: 0, frees: 0, max_volume_id: 0 })?;
            for i in 0..SIT_SLOTS {
                self.write_u32(SIT_OFFSET + i as u64 * 4, 0)?;
            }
            for i in 0..HASH_BUCKETS {
                self.write_u32(NAME_HASH_OFFSET + i as u64 * 4, 0)?;
            }
            for kind in [IdKind::Rw, IdKind::Ro, IdKind::Bk] {
                for i in 0..HASH_BUCKETS {
                    self.write_u32(ID_HASH_OFFSET + kind.table_index() * ID_HASH_SIZE + i as u64 * 4, 0)?;
                }
            }
        }
        Ok(())
    }

    fn read_header(&mut self) -> CResult<Header> {
        let bytes = self.store.read(DB_FILE, 0, HEADER_SIZE as usize)?;
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf.copy_from_slice(&bytes);
        Header::decode(&buf)
    }

    fn write_header(&mut self, header: Header) -> CResult<()> {
        self.store.write(DB_FILE, 0, &header.encode())
    }

    fn read_u32(&mut self, offset: u64) -> CResult<u32> {
        let bytes = self.store.read(DB_FILE, offset, 4)?;
        Ok(BigEndian::read_u32(&bytes))
    }

    fn write_u32(&mut self, offset: u64, value: u32) -> CResult<()> {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.store.write(DB_FILE, offset, &buf)
    }

    fn name_bucket(name: &str) -> u64 {
        (name.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))) % HASH_BUCKETS as u64
    }

    fn id_bucket(id: u32) -> u64 {
        id as u64 % HASH_BUCKETS as u64
    }

    fn entry_offset(index: u32) -> u64 {
        ENTRIES_OFFSET + index as u64 * FLAT_ENTRY_SIZE as u64
    }

    pub fn read_entry(&mut self, index: u32) -> CResult<VlEntry> {
        let bytes = self.store.read(DB_FILE, Self::entry_offset(index), FLAT_ENTRY_SIZE)?;
        let mut buf = [0u8; FLAT_ENTRY_SIZE];
        buf.copy_from_slice(&bytes);
        VlEntry::decode_flat(&buf)
    }

    fn write_entry(&mut self, index: u32, entry: &VlEntry) -> CResult<()> {
        self.store.write(DB_FILE, Self::entry_offset(index), &entry.encode_flat()?)
    }

    /// Allocates a free slot: pops `free_ptr` if non-zero, else extends
    /// `eof_ptr`, up to [`VLDB_SIZE_CEILING`].
    fn alloc(&mut self) -> CResult<u32> {
        let mut header = self.read_header()?;
        if header.free_ptr != 0 {
            let index = header.free_ptr;
            let freed = self.read_entry(index)?;
            header.free_ptr = freed.next_name_hash;
            header.allocs += 1;
            self.write_header(header)?;
            return Ok(index);
        }
        let index = header.eof_ptr;
        if Self::entry_offset(index + 1) > VLDB_SIZE_CEILING {
            return Err(Error::Io(format!("VLDB would grow past the {} byte ceiling", VLDB_SIZE_CEILING)));
        }
        header.eof_ptr += 1;
        header.allocs += 1;
        self.write_header(header)?;
        Ok(index)
    }

    fn free(&mut self, index: u32) -> CResult<()> {
        let mut header = self.read_header()?;
        let mut tombstone = VlEntry::new(0, "");
        tombstone.next_name_hash = header.free_ptr;
        self.write_entry(index, &tombstone)?;
        header.free_ptr = index;
        header.frees += 1;
        self.write_header(header)
    }

    /// `ThreadVLentry`: allocates a slot, links it into the name-hash bucket
    /// and all three id-hash buckets, and writes it out.
    pub fn thread(&mut self, mut entry: VlEntry) -> CResult<u32> {
        let index = self.alloc()?;

        let name_bucket = Self::name_bucket(&entry.name);
        let name_head = self.read_u32(NAME_HASH_OFFSET + name_bucket * 4)?;
        entry.next_name_hash = name_head;

        for (i, id) in entry.ids().into_iter().enumerate() {
            let kind = [IdKind::Rw, IdKind::Ro, IdKind::Bk][i];
            if id == 0 {
                continue;
            }
            let bucket = Self::id_bucket(id);
            let head = self.read_u32(ID_HASH_OFFSET + kind.table_index() * ID_HASH_SIZE + bucket * 4)?;
            entry.next_id_hash[i] = head;
        }

        self.write_entry(index, &entry)?;
        self.write_u32(NAME_HASH_OFFSET + name_bucket * 4, index)?;
        for (i, id) in entry.ids().into_iter().enumerate() {
            if id == 0 {
                continue;
            }
            let kind = [IdKind::Rw, IdKind::Ro, IdKind::Bk][i];
            let bucket = Self::id_bucket(id);
            self.write_u32(ID_HASH_OFFSET + kind.table_index() * ID_HASH_SIZE + bucket * 4, index)?;
        }

        let mut header = self.read_header()?;
        header.max_volume_id = header.max_volume_id.max(entry.rw_id);
        self.write_header(header)?;
        Ok(index)
    }

    /// `UnthreadVLentry`: unlinks `index` from every bucket it's threaded
    /// into and returns its slot to the free list.
    pub fn unthread(&mut self, index: u32) -> CResult<()> {
        let entry = self.read_entry(index)?;

        let name_bucket = Self::name_bucket(&entry.name);
        self.unlink_chain(NAME_HASH_OFFSET + name_bucket * 4, index, |e| e.next_name_hash, |e, v| e.next_name_hash = v)?;

        for (i, id) in entry.ids().into_iter().enumerate() {
            if id == 0 {
                continue;
            }
            let kind = [IdKind::Rw, IdKind::Ro, IdKind::Bk][i];
            let bucket = Self::id_bucket(id);
            self.unlink_chain(ID_HASH_OFFSET + kind.table_index() * ID_HASH_SIZE + bucket * 4, index, move |e| e.next_id_hash[i], move |e, v| e.next_id_hash[i] = v)?;
        }

        self.free(index)
    }

    fn unlink_chain(
        &mut self,
        head_offset: u64,
        target: u32,
        next_of: impl Fn(&VlEntry) -> u32,
        set_next: impl Fn(&mut VlEntry, u32),
    ) -> CResult<()> {
        let head = self.read_u32(head_offset)?;
        if head == target {
            let entry = self.read_entry(target)?;
            self.write_u32(head_offset, next_of(&entry))?;
            return Ok(());
        }
        let mut cur = head;
        while cur != 0 {
            let mut entry = self.read_entry(cur)?;
            let next = next_of(&entry);
            if next == target {
                let target_entry = self.read_entry(target)?;
                set_next(&mut entry, next_of(&target_entry));
                self.write_entry(cur, &entry)?;
                return Ok(());
            }
            cur = next;
        }
        Err(Error::NotFound(format!("VLDB entry {target} not found in its hash chain")))
    }

    pub fn find_by_id(&mut self, id: u32, kind: IdKind) -> CResult<Option<VlEntry>> {
        let bucket = Self::id_bucket(id);
        let mut cur = self.read_u32(ID_HASH_OFFSET + kind.table_index() * ID_HASH_SIZE + bucket * 4)?;
        while cur != 0 {
            let entry = self.read_entry(cur)?;
            if entry.ids()[kind.table_index() as usize] == id {
                return Ok(Some(entry));
            }
            cur = entry.next_id_hash[kind.table_index() as usize];
        }
        Ok(None)
    }

    pub fn find_by_name(&mut self, name: &str) -> CResult<Option<VlEntry>> {
        let bucket = Self::name_bucket(name);
        let mut cur = self.read_u32(NAME_HASH_OFFSET + bucket * 4)?;
        while cur != 0 {
            let entry = self.read_entry(cur)?;
            if entry.name == name {
                return Ok(Some(entry));
            }
            cur = entry.next_name_hash;
        }
        Ok(None)
    }

    /// `NextEntry`: walks every allocated slot in index order starting after
    /// `after`, skipping freed slots (recognized by `rw_id == 0`).
    pub fn next_entry(&mut self, after: u32) -> CResult<Option<(u32, VlEntry)>> {
        let header = self.read_header()?;
        let mut index = after + 1;
        while index < header.eof_ptr {
            let entry = self.read_entry(index)?;
            if entry.rw_id != 0 {
                return Ok(Some((index, entry)));
            }
            index += 1;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::flat::FlatStore;

    fn store() -> FlatStore {
        let dir = tempfile::tempdir().unwrap();
        FlatStore::open_or_create(dir.path()).unwrap()
    }

    #[test]
    fn thread_then_find_by_id_and_name() {
        let mut backing = store();
        let mut vldb = VldbFlat::new(&mut backing);
        vldb.init_if_needed().unwrap();

        let entry = VlEntry::new(100, "root.cell");
        let index = vldb.thread(entry.clone()).unwrap();

        let by_id = vldb.find_by_id(100, IdKind::Rw).unwrap().unwrap();
        assert_eq!(by_id.name, "root.cell");
        let by_name = vldb.find_by_name("root.cell").unwrap().unwrap();
        assert_eq!(by_name.rw_id, 100);
        assert_eq!(vldb.read_entry(index).unwrap().rw_id, 100);
    }

    #[test]
    fn unthread_removes_from_both_chains() {
        let mut backing = store();
        let mut vldb = VldbFlat::new(&mut backing);
        vldb.init_if_needed().unwrap();

        let entry = VlEntry::new(7, "user.a");
        let slot = vldb.thread(entry).unwrap();
        assert!(vldb.find_by_id(7, IdKind::Rw).unwrap().is_some());

        vldb.unthread(slot).unwrap();
        assert!(vldb.find_by_id(7, IdKind::Rw).unwrap().is_none());
        assert!(vldb.find_by_name("user.a").unwrap().is_none());
    }

    #[test]
    fn next_entry_walks_allocated_slots_in_order() {
        let mut backing = store();
        let mut vldb = VldbFlat::new(&mut backing);
        vldb.init_if_needed().unwrap();

        vldb.thread(VlEntry::new(1, "a")).unwrap();
        vldb.thread(VlEntry::new(2, "b")).unwrap();

        let (idx, entry) = vldb.next_entry(0).unwrap().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(entry.rw_id, 2);
        assert!(vldb.next_entry(idx).unwrap().is_none());
    }
}
