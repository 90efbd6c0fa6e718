//! The KV physical back-end: any [`Engine`] (concretely [`LogCask`]) wrapped
//! to expose the same [`PhysicalStore`] vocabulary as the flat back-end, so
//! the transaction layer can treat both uniformly. Unlike flat mode, KV
//! mode keeps no write-ahead log: the
//! engine's own commit is the durability boundary, and the database label
//! lives under a reserved key rather than a 64-byte file header.

use std::path::PathBuf;
use byteorder::{BigEndian, ByteOrder};

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::{FileId, KvApplication, PhysicalStore, Status, DB_FILE, LOG_FILE, RESERVED_KEY_PREFIX};
use crate::version::Version;

fn content_key(file: FileId) -> Vec<u8> {
    let mut key = vec![RESERVED_KEY_PREFIX, b'D'];
    key.extend_from_slice(&file.to_be_bytes());
    key
}

fn label_key() -> Vec<u8> {
    vec![RESERVED_KEY_PREFIX, b'L']
}

/// KV physical store generic over any [`Engine`] (in practice `LogCask`,
/// with `Memory` used in tests). `backup_path`, when set, names the single
/// file the underlying engine persists to, enabling [`KvStoreOn::copy_to`];
/// engines with no single backing file simply leave it `None`.
pub struct KvStoreOn<E: Engine> {
    engine: E,
    backup_path: Option<PathBuf>,
}

impl<E: Engine> KvStoreOn<E> {
    pub fn new(engine: E) -> Self {
        KvStoreOn { engine, backup_path: None }
    }

    pub fn with_backup_path(engine: E, path: PathBuf) -> Self {
        KvStoreOn { engine, backup_path: Some(path) }
    }

    fn get_blob(&mut self, file: FileId) -> CResult<Vec<u8>> {
        Ok(self.engine.get(&content_key(file))?.unwrap_or_default())
    }

    fn put_blob(&mut self, file: FileId, blob: Vec<u8>) -> CResult<()> {
        self.engine.set(&content_key(file), blob)
    }

    /// Copies the engine's on-disk file verbatim, for `.OLD`/backup purposes
    /// around install/freeze. Only available when the engine exposes
    /// a single backing path.
    pub fn copy_to(&mut self, dest: impl AsRef<std::path::Path>) -> CResult<()> {
        self.engine.flush()?;
        match &self.backup_path {
            Some(src) => {
                std::fs::copy(src, dest)?;
                Ok(())
            }
            None => Err(Error::Internal("engine has no backing path to copy".into())),
        }
    }
}

impl<E: Engine> PhysicalStore for KvStoreOn<E> {
    fn read(&mut self, file: FileId, pos: u64, len: usize) -> CResult<Vec<u8>> {
        let blob = self.get_blob(file)?;
        let start = pos as usize;
        let mut out = vec![0u8; len];
        let available = blob.len().saturating_sub(start);
        let copy_len = available.min(len);
        if copy_len > 0 {
            out[..copy_len].copy_from_slice(&blob[start..start + copy_len]);
        }
        Ok(out)
    }

    fn write(&mut self, file: FileId, pos: u64, data: &[u8]) -> CResult<()> {
        let mut blob = self.get_blob(file)?;
        let start = pos as usize;
        let end = start + data.len();
        if blob.len() < end {
            blob.resize(end, 0);
        }
        blob[start..end].copy_from_slice(data);
        self.put_blob(file, blob)
    }

    fn truncate(&mut self, file: FileId, len: u64) -> CResult<()> {
        let mut blob = self.get_blob(file)?;
        blob.resize(len as usize, 0);
        self.put_blob(file, blob)
    }

    fn sync(&mut self, _file: FileId) -> CResult<()> {
        self.engine.flush()
    }

    fn getlabel(&mut self) -> CResult<Version> {
        match self.engine.get(&label_key())? {
            Some(bytes) if bytes.len() == 8 => {
                let epoch = BigEndian::read_u32(&bytes[0..4]);
                let counter = BigEndian::read_u32(&bytes[4..8]);
                Ok(Version::new(epoch, counter))
            }
            Some(_) => Err(Error::BadVersion("label key holds malformed value".into())),
            None => Ok(Version::NEW),
        }
    }

    fn setlabel(&mut self, version: Version) -> CResult<()> {
        let mut bytes = [0u8; 8];
        BigEndian::write_u32(&mut bytes[0..4], version.epoch);
        BigEndian::write_u32(&mut bytes[4..8], version.counter);
        self.engine.set(&label_key(), bytes.to_vec())
    }

    fn append(&mut self, _data: &[u8]) -> CResult<()> {
        Err(Error::BadType("KV back-end keeps no log; append() is flat-only".into()))
    }

    fn stat(&mut self) -> CResult<Status> {
        self.engine.status()
    }

    fn file_len(&mut self, file: FileId) -> CResult<u64> {
        if file == LOG_FILE {
            return Ok(0);
        }
        Ok(self.get_blob(file)?.len() as u64)
    }

    fn as_kv_application(&mut self) -> Option<&mut dyn KvApplication> {
        Some(self)
    }
}

impl<E: Engine> KvStoreOn<E> {
    /// Iterates application keys in order, skipping everything under the
    /// Ubik-reserved prefix.
    pub fn next<'a>(&'a mut self) -> impl Iterator<Item = CResult<(Vec<u8>, Vec<u8>)>> + 'a
        where E::ScanIterator<'a>: 'a {
        self.engine.scan(..).filter(|item| {
            !matches!(item, Ok((key, _)) if key.first() == Some(&RESERVED_KEY_PREFIX))
        })
    }

    pub fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if key.first() == Some(&RESERVED_KEY_PREFIX) {
            return Err(Error::BadType("application keys may not use the reserved prefix".into()));
        }
        self.engine.get(key)
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        if key.first() == Some(&RESERVED_KEY_PREFIX) {
            return Err(Error::BadType("application keys may not use the reserved prefix".into()));
        }
        self.engine.set(key, value)
    }

    pub fn del(&mut self, key: &[u8]) -> CResult<()> {
        if key.first() == Some(&RESERVED_KEY_PREFIX) {
            return Err(Error::BadType("application keys may not use the reserved prefix".into()));
        }
        self.engine.delete(key)
    }

    pub fn commit(&mut self) -> CResult<()> {
        self.engine.flush()
    }
}

impl<E: Engine> KvApplication for KvStoreOn<E> {
    fn kv_get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.engine.get(key)
    }

    fn kv_put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.engine.set(key, value)
    }

    fn kv_delete(&mut self, key: &[u8]) -> CResult<()> {
        self.engine.delete(key)
    }

    fn kv_scan(&mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.engine.scan(..).collect()
    }

    fn kv_commit(&mut self) -> CResult<()> {
        self.engine.flush()
    }
}

/// Concrete KV store used by the server: a [`LogCask`] engine wrapped to
/// report its own path for backup purposes.
pub type LogCaskKvStore = KvStoreOn<crate::storage::log_cask::LogCask>;

pub fn open_log_cask_kv(path: PathBuf) -> CResult<LogCaskKvStore> {
    let engine = crate::storage::log_cask::LogCask::new(path.clone())?;
    Ok(KvStoreOn::with_backup_path(engine, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    #[test]
    fn label_defaults_to_new() {
        let mut kv = KvStoreOn::new(Memory::new());
        assert_eq!(kv.getlabel().unwrap(), Version::NEW);
    }

    #[test]
    fn setlabel_then_getlabel_roundtrips() {
        let mut kv = KvStoreOn::new(Memory::new());
        kv.setlabel(Version::new(3, 9)).unwrap();
        assert_eq!(kv.getlabel().unwrap(), Version::new(3, 9));
    }

    #[test]
    fn write_read_roundtrip_extends_with_zeros() {
        let mut kv = KvStoreOn::new(Memory::new());
        kv.write(DB_FILE, 4, b"hi").unwrap();
        let out = kv.read(DB_FILE, 0, 6).unwrap();
        assert_eq!(out, vec![0, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn append_is_rejected() {
        let mut kv = KvStoreOn::new(Memory::new());
        let err = kv.append(b"x").unwrap_err();
        assert_eq!(err.kind_name(), "UBADTYPE");
    }

    #[test]
    fn application_keys_cannot_use_reserved_prefix() {
        let mut kv = KvStoreOn::new(Memory::new());
        let err = kv.put(&[RESERVED_KEY_PREFIX, 1], vec![1]).unwrap_err();
        assert_eq!(err.kind_name(), "UBADTYPE");
    }

    #[test]
    fn next_skips_reserved_keys() {
        let mut kv = KvStoreOn::new(Memory::new());
        kv.setlabel(Version::new(2, 1)).unwrap();
        kv.put(b"a", vec![1]).unwrap();
        kv.put(b"b", vec![2]).unwrap();
        let seen: Vec<_> = kv.next().collect::<CResult<Vec<_>>>().unwrap();
        assert_eq!(seen, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![2])]);
    }
}
