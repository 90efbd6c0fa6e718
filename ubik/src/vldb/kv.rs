//! KV-schema VLDB: the same [`VlEntry`] records as the flat schema,
//! but addressed by key families instead of hash-bucket chains. A volume's
//! canonical record lives under `KEY_VOLID + rw_id`; its RO/BK ids and its
//! name are indirections that resolve back to that key. There is no
//! server-ip table or extent-block chain here — the KV back-end has no
//! fixed-size region to economize, so each record carries what it needs.

use byteorder::{BigEndian, ByteOrder};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::storage::KvApplication;
use crate::vldb::entry::VlEntry;
use crate::vldb::IdKind;

const TAG_CHEADERKV: u8 = 1;
const TAG_VOLID: u8 = 2;
const TAG_VOLNAME: u8 = 3;

const VALUE_INDIRECT: u8 = 0;
const VALUE_ENTRY: u8 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CHeaderKv {
    pub max_volume_id: u32,
}

fn key_cheaderkv() -> Vec<u8> {
    vec![TAG_CHEADERKV]
}

fn key_volid(id: u32) -> Vec<u8> {
    let mut key = vec![TAG_VOLID];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn key_volname(name: &str) -> Vec<u8> {
    let mut key = vec![TAG_VOLNAME];
    key.extend_from_slice(name.as_bytes());
    key
}

fn encode_indirect(rw_id: u32) -> Vec<u8> {
    let mut value = vec![VALUE_INDIRECT];
    value.extend_from_slice(&rw_id.to_be_bytes());
    value
}

fn decode_indirect(value: &[u8]) -> CResult<u32> {
    if value.len() != 5 || value[0] != VALUE_INDIRECT {
        return Err(Error::BadType("expected an indirection value in VLDB KV schema".into()));
    }
    Ok(BigEndian::read_u32(&value[1..5]))
}

fn encode_entry_value(entry: &VlEntry) -> CResult<Vec<u8>> {
    let mut value = vec![VALUE_ENTRY];
    value.extend_from_slice(&entry.encode_kv()?);
    Ok(value)
}

fn decode_entry_value(value: &[u8]) -> CResult<VlEntry> {
    if value.is_empty() || value[0] != VALUE_ENTRY {
        return Err(Error::BadType("expected a full entry value in VLDB KV schema".into()));
    }
    VlEntry::decode_kv(&value[1..])
}

pub struct VldbKv<'a> {
    store: &'a mut dyn KvApplication,
}

impl<'a> VldbKv<'a> {
    pub fn new(store: &'a mut dyn KvApplication) -> Self {
        VldbKv { store }
    }

    pub fn init_if_needed(&mut self) -> CResult<()> {
        if self.store.kv_get(&key_cheaderkv())?.is_none() {
            self.write_header(CHeaderKv::default())?;
        }
        Ok(())
    }

    fn read_header(&mut self) -> CResult<CHeaderKv> {
        match self.store.kv_get(&key_cheaderkv())? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(Into::into),
            None => Ok(CHeaderKv::default()),
        }
    }

    fn write_header(&mut self, header: CHeaderKv) -> CResult<()> {
        self.store.kv_put(&key_cheaderkv(), bincode::serialize(&header)?)
    }

    /// `ThreadVLentry`: writes the canonical record under `rw_id`, plus an
    /// indirection for each of `ro_id`/`bk_id` and the volume name.
    pub fn thread(&mut self, entry: VlEntry) -> CResult<()> {
        if entry.rw_id == 0 {
            return Err(Error::BadType("a VLDB entry must have a non-zero RW id".into()));
        }
        self.store.kv_put(&key_volid(entry.rw_id), encode_entry_value(&entry)?)?;
        if entry.ro_id != 0 {
            self.store.kv_put(&key_volid(entry.ro_id), encode_indirect(entry.rw_id))?;
        }
        if entry.bk_id != 0 {
            self.store.kv_put(&key_volid(entry.bk_id), encode_indirect(entry.rw_id))?;
        }
        self.store.kv_put(&key_volname(&entry.name), encode_indirect(entry.rw_id))?;

        let mut header = self.read_header()?;
        header.max_volume_id = header.max_volume_id.max(entry.rw_id);
        self.write_header(header)?;
        self.store.kv_commit()
    }

    /// `UnthreadVLentry`: removes the canonical record and every indirection
    /// that points at it.
    pub fn unthread(&mut self, rw_id: u32) -> CResult<()> {
        let entry = match self.find_by_id(rw_id, IdKind::Rw)? {
            Some(entry) => entry,
            None => return Err(Error::NotFound(format!("no VLDB entry with RW id {rw_id}"))),
        };
        self.store.kv_delete(&key_volid(entry.rw_id))?;
        if entry.ro_id != 0 {
            self.store.kv_delete(&key_volid(entry.ro_id))?;
        }
        if entry.bk_id != 0 {
            self.store.kv_delete(&key_volid(entry.bk_id))?;
        }
        self.store.kv_delete(&key_volname(&entry.name))?;
        self.store.kv_commit()
    }

    fn resolve(&mut self, value: Vec<u8>) -> CResult<Option<VlEntry>> {
        match value.first() {
            Some(&VALUE_ENTRY) => Ok(Some(decode_entry_value(&value)?)),
            Some(&VALUE_INDIRECT) => {
                let rw_id = decode_indirect(&value)?;
                match self.store.kv_get(&key_volid(rw_id))? {
                    Some(bytes) => Ok(Some(decode_entry_value(&bytes)?)),
                    None => Ok(None),
                }
            }
            _ => Err(Error::BadType("malformed VLDB KV value".into())),
        }
    }

    pub fn find_by_id(&mut self, id: u32, _kind: IdKind) -> CResult<Option<VlEntry>> {
        match self.store.kv_get(&key_volid(id))? {
            Some(value) => self.resolve(value),
            None => Ok(None),
        }
    }

    pub fn find_by_name(&mut self, name: &str) -> CResult<Option<VlEntry>> {
        match self.store.kv_get(&key_volname(name))? {
            Some(value) => self.resolve(value),
            None => Ok(None),
        }
    }

    /// `NextEntry`: scans every `KEY_VOLID` key in ascending id order,
    /// returning the first canonical (non-indirection) record whose `rw_id`
    /// is greater than `after`.
    pub fn next_entry(&mut self, after: u32) -> CResult<Option<VlEntry>> {
        let mut rows = self.store.kv_scan()?;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in rows {
            if key.first() != Some(&TAG_VOLID) || key.len() != 5 {
                continue;
            }
            let id = BigEndian::read_u32(&key[1..5]);
            if id <= after {
                continue;
            }
            if value.first() == Some(&VALUE_ENTRY) {
                return Ok(Some(decode_entry_value(&value)?));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::KvStoreOn;
    use crate::storage::memory::Memory;

    fn store() -> KvStoreOn<Memory> {
        KvStoreOn::new(Memory::new())
    }

    #[test]
    fn thread_then_find_by_all_ids_and_name() {
        let mut backing = store();
        let mut vldb = VldbKv::new(&mut backing);
        vldb.init_if_needed().unwrap();

        let mut entry = VlEntry::new(10, "root.cell");
        entry.ro_id = 11;
        entry.bk_id = 12;
        vldb.thread(entry).unwrap();

        assert_eq!(vldb.find_by_id(10, IdKind::Rw).unwrap().unwrap().name, "root.cell");
        assert_eq!(vldb.find_by_id(11, IdKind::Ro).unwrap().unwrap().rw_id, 10);
        assert_eq!(vldb.find_by_id(12, IdKind::Bk).unwrap().unwrap().rw_id, 10);
        assert_eq!(vldb.find_by_name("root.cell").unwrap().unwrap().rw_id, 10);
    }

    #[test]
    fn unthread_removes_canonical_and_indirections() {
        let mut backing = store();
        let mut vldb = VldbKv::new(&mut backing);
        vldb.init_if_needed().unwrap();

        let mut entry = VlEntry::new(20, "user.a");
        entry.ro_id = 21;
        vldb.thread(entry).unwrap();

        vldb.unthread(20).unwrap();
        assert!(vldb.find_by_id(20, IdKind::Rw).unwrap().is_none());
        assert!(vldb.find_by_id(21, IdKind::Ro).unwrap().is_none());
        assert!(vldb.find_by_name("user.a").unwrap().is_none());
    }

    #[test]
    fn next_entry_walks_in_ascending_rw_id_order() {
        let mut backing = store();
        let mut vldb = VldbKv::new(&mut backing);
        vldb.init_if_needed().unwrap();

        vldb.thread(VlEntry::new(5, "a")).unwrap();
        vldb.thread(VlEntry::new(9, "b")).unwrap();

        let first = vldb.next_entry(0).unwrap().unwrap();
        assert_eq!(first.rw_id, 5);
        let second = vldb.next_entry(first.rw_id).unwrap().unwrap();
        assert_eq!(second.rw_id, 9);
        assert!(vldb.next_entry(second.rw_id).unwrap().is_none());
    }
}
