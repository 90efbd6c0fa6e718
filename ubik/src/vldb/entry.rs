//! `nvlentry`: one volume's record, shared by both VLDB physical schemas
//!. The flat back-end threads entries through singly-linked hash
//! buckets via the `next_*` fields; the KV back-end stores an entry whole
//! under its RW id and never touches them.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{CResult, Error};

/// Longest volume name stored inline, a 65-byte (64 + NUL) field.
pub const MAX_NAME_LEN: usize = 64;

/// Fixed on-disk size of one flat-schema entry.
pub const FLAT_ENTRY_SIZE: usize = 148;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlEntry {
    pub rw_id: u32,
    pub ro_id: u32,
    pub bk_id: u32,
    pub name: String,
    /// Index into the flat schema's server-ip table identifying the volume's
    /// site; unused (left 0) by the KV schema.
    pub server_base: u32,
    pub next_name_hash: u32,
    /// `[RW, RO, BK]` id-hash chain links.
    pub next_id_hash: [u32; 3],
}

impl VlEntry {
    pub fn new(rw_id: u32, name: impl Into<String>) -> Self {
        let mut name = name.into();
        name.truncate(MAX_NAME_LEN);
        VlEntry { rw_id, ro_id: 0, bk_id: 0, name, server_base: 0, next_name_hash: 0, next_id_hash: [0, 0, 0] }
    }

    /// Encodes the entry into the flat schema's fixed 148-byte record.
    pub fn encode_flat(&self) -> CResult<[u8; FLAT_ENTRY_SIZE]> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::BadType(format!("volume name {:?} exceeds {} bytes", self.name, MAX_NAME_LEN)));
        }
        let mut buf = [0u8; FLAT_ENTRY_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        cursor.write_u32::<BigEndian>(self.rw_id)?;
        cursor.write_u32::<BigEndian>(self.ro_id)?;
        cursor.write_u32::<BigEndian>(self.bk_id)?;
        cursor.write_u32::<BigEndian>(self.server_base)?;
        cursor.write_u32::<BigEndian>(self.next_name_hash)?;
        for id in self.next_id_hash {
            cursor.write_u32::<BigEndian>(id)?;
        }
        let name_bytes = self.name.as_bytes();
        let pos = cursor.position() as usize;
        buf[pos..pos + name_bytes.len()].copy_from_slice(name_bytes);
        // Remaining bytes stay zero, matching a NUL-terminated, zero-padded
        // name field followed by reserved padding out to 148 bytes.
        Ok(buf)
    }

    pub fn decode_flat(buf: &[u8; FLAT_ENTRY_SIZE]) -> CResult<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let rw_id = cursor.read_u32::<BigEndian>()?;
        let ro_id = cursor.read_u32::<BigEndian>()?;
        let bk_id = cursor.read_u32::<BigEndian>()?;
        let server_base = cursor.read_u32::<BigEndian>()?;
        let next_name_hash = cursor.read_u32::<BigEndian>()?;
        let mut next_id_hash = [0u32; 3];
        for slot in &mut next_id_hash {
            *slot = cursor.read_u32::<BigEndian>()?;
        }
        let name_start = cursor.position() as usize;
        let name_end = buf[name_start..].iter().position(|&b| b == 0).map(|p| name_start + p).unwrap_or(buf.len());
        let name = String::from_utf8(buf[name_start..name_end].to_vec())?;
        Ok(VlEntry { rw_id, ro_id, bk_id, name, server_base, next_name_hash, next_id_hash })
    }

    /// Encodes the entry for the KV schema's `KEY_VOLID + rw_id -> nvlentry`
    /// mapping.
    pub fn encode_kv(&self) -> CResult<Vec<u8>> {
        bincode::serialize(self).map_err(Into::into)
    }

    pub fn decode_kv(bytes: &[u8]) -> CResult<Self> {
        bincode::deserialize(bytes).map_err(Into::into)
    }

    /// Every id a `ThreadVLentry`/`UnthreadVLentry` call must keep the
    /// id-hash chains consistent for.
    pub fn ids(&self) -> [u32; 3] {
        [self.rw_id, self.ro_id, self.bk_id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_roundtrip_preserves_fields() {
        let mut entry = VlEntry::new(42, "root.afs");
        entry.ro_id = 43;
        entry.bk_id = 44;
        entry.next_name_hash = 7;
        entry.next_id_hash = [1, 2, 3];

        let encoded = entry.encode_flat().unwrap();
        let decoded = VlEntry::decode_flat(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn kv_roundtrip_preserves_fields() {
        let entry = VlEntry::new(1, "user.foo");
        let encoded = entry.encode_kv().unwrap();
        let decoded = VlEntry::decode_kv(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn overlong_name_is_rejected() {
        let entry = VlEntry::new(1, "x".repeat(MAX_NAME_LEN + 1));
        assert_eq!(entry.encode_flat().unwrap_err().kind_name(), "UBADTYPE");
    }
}
