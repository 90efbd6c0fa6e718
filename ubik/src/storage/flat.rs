//! The flat-file physical back-end: a single file addressed by
//! `(logical_file_id, byte_position)`, with a fixed 64-byte header and a
//! parallel write-ahead log.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CResult, Error};
use crate::storage::fd_cache::FdCache;
use crate::storage::{FileId, PhysicalStore, Status, DB_FILE, FLAT_HEADER_SIZE, FLAT_MAGIC, FLAT_SIZE_CEILING};
use crate::version::Version;

/// On-disk header occupying the first 64 bytes of the database file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub size: u32,
    pub version: Version,
}

impl Header {
    fn encode(&self) -> [u8; FLAT_HEADER_SIZE as usize] {
        let mut buf = [0u8; FLAT_HEADER_SIZE as usize];
        let mut cursor = std::io::Cursor::new(&mut buf[..]);
        cursor.write_u32::<BigEndian>(self.magic).unwrap();
        cursor.write_u32::<BigEndian>(self.size).unwrap();
        cursor.write_u32::<BigEndian>(self.version.epoch).unwrap();
        cursor.write_u32::<BigEndian>(self.version.counter).unwrap();
        buf
    }

    fn decode(buf: &[u8; FLAT_HEADER_SIZE as usize]) -> CResult<Self> {
        let mut cursor = std::io::Cursor::new(&buf[..]);
        let magic = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u32::<BigEndian>()?;
        if magic != FLAT_MAGIC {
            return Err(Error::Io(format!("bad flat header magic {:#x}", magic)));
        }
        let epoch = cursor.read_u32::<BigEndian>()?;
        let counter = cursor.read_u32::<BigEndian>()?;
        Ok(Header { magic, size, version: Version::new(epoch, counter) })
    }
}

/// Flat physical store rooted at `dir`, whose database file lives at
/// `dir/DB0` and whose log lives at `dir/DBSYS1` (via [`FdCache`]'s naming).
pub struct FlatStore {
    dir: PathBuf,
    fds: FdCache,
}

impl FlatStore {
    /// Opens an existing flat database rooted at `dir`, or creates a fresh
    /// one labelled `(1,1)` if none exists yet.
    pub fn open_or_create(dir: impl AsRef<Path>) -> CResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut store = FlatStore { dir: dir.clone(), fds: FdCache::new(dir) };

        let needs_init = {
            let f = store.fds.get(DB_FILE)?;
            f.metadata()?.len() < FLAT_HEADER_SIZE
        };
        if needs_init {
            store.write_header(Header { magic: FLAT_MAGIC, size: FLAT_HEADER_SIZE as u32, version: Version::NEW })?;
        } else {
            // Validate the header parses; surfaces a corrupt file early.
            store.read_header()?;
        }
        Ok(store)
    }

    fn read_header(&mut self) -> CResult<Header> {
        let f = self.fds.get(DB_FILE)?;
        f.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; FLAT_HEADER_SIZE as usize];
        f.read_exact(&mut buf)?;
        Header::decode(&buf)
    }

    fn write_header(&mut self, header: Header) -> CResult<()> {
        let f = self.fds.get(DB_FILE)?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&header.encode())?;
        f.sync_data()?;
        Ok(())
    }

    /// Absolute byte offset for `(file, pos)`, skipping the 64-byte header
    /// when `file == DB_FILE`.
    fn absolute_offset(&self, file: FileId, pos: u64) -> u64 {
        if file == DB_FILE {
            FLAT_HEADER_SIZE + pos
        } else {
            pos
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.fds.path_for(DB_FILE)
    }

    /// Streams a length-prefixed byte sequence into a freshly created
    /// `.TMP` file, labels it, and returns its path (`DISK_GetFile`'s
    /// `recv_stream` half).
    pub fn recv_stream(&mut self, mut reader: impl Read, expected_version: Version) -> CResult<PathBuf> {
        let tmp_path = self.dir.join("DB0.TMP");
        let mut tmp = std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;

        let len = reader.read_u64::<BigEndian>()?;
        let mut remaining = len;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            reader.read_exact(&mut buf[..chunk])?;
            tmp.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        tmp.sync_all()?;
        drop(tmp);

        // Old DISK_GetFile sends the label after the bytes; detect a
        // truncated stream missing it and fail
        // cleanly rather than silently installing a mislabeled database.
        let got_version: VersionWireOnWire = match reader.read_u32::<BigEndian>() {
            Ok(epoch) => {
                let counter = reader.read_u32::<BigEndian>()?;
                VersionWireOnWire::Present(Version::new(epoch, counter))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => VersionWireOnWire::Missing,
            Err(e) => return Err(e.into()),
        };

        match got_version {
            VersionWireOnWire::Present(v) if v == expected_version => {}
            VersionWireOnWire::Present(v) => {
                return Err(Error::BadVersion(format!("received db labelled {:?}, expected {:?}", v, expected_version)));
            }
            VersionWireOnWire::Missing => {
                return Err(Error::Io("stream truncated before trailing label".into()));
            }
        }

        let mut tmp_store = FlatStore { dir: self.dir.clone(), fds: FdCache::new(&self.dir) };
        tmp_store.fds.get(DB_FILE)?; // no-op, keeps symmetry with open paths
        set_label_at(&tmp_path, expected_version)?;
        Ok(tmp_path)
    }

    /// Validates the on-disk label equals `expected_version`, then streams
    /// the database's bytes followed by the label.
    pub fn send_stream(&mut self, mut writer: impl Write, expected_version: Version) -> CResult<()> {
        let header = self.read_header()?;
        if header.version != expected_version {
            return Err(Error::BadVersion(format!(
                "local label {:?} does not match expected {:?}",
                header.version, expected_version
            )));
        }

        let f = self.fds.get(DB_FILE)?;
        let len = f.metadata()?.len().saturating_sub(FLAT_HEADER_SIZE);
        f.seek(SeekFrom::Start(FLAT_HEADER_SIZE))?;
        writer.write_u64::<BigEndian>(len)?;
        let mut remaining = len;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            f.read_exact(&mut buf[..chunk])?;
            writer.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        writer.write_u32::<BigEndian>(header.version.epoch)?;
        writer.write_u32::<BigEndian>(header.version.counter)?;
        Ok(())
    }

    /// Copies the live database file to `dest`, for `.OLD`/backup purposes
    /// around install/freeze.
    pub fn copy_to(&mut self, dest: impl AsRef<Path>) -> CResult<()> {
        std::fs::copy(self.db_path(), dest)?;
        Ok(())
    }
}

enum VersionWireOnWire {
    Present(Version),
    Missing,
}

fn set_label_at(path: &Path, version: Version) -> CResult<()> {
    let mut f = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    if f.metadata()?.len() < FLAT_HEADER_SIZE {
        f.set_len(FLAT_HEADER_SIZE)?;
    }
    let header = Header { magic: FLAT_MAGIC, size: FLAT_HEADER_SIZE as u32, version };
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&header.encode())?;
    f.sync_data()?;
    Ok(())
}

impl PhysicalStore for FlatStore {
    fn read(&mut self, file: FileId, pos: u64, len: usize) -> CResult<Vec<u8>> {
        let offset = self.absolute_offset(file, pos);
        let f = self.fds.get(file)?;
        f.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&mut self, file: FileId, pos: u64, data: &[u8]) -> CResult<()> {
        if file == DB_FILE && FLAT_HEADER_SIZE + pos + data.len() as u64 > FLAT_SIZE_CEILING {
            return Err(Error::Io(format!(
                "write would grow database past the {} byte ceiling",
                FLAT_SIZE_CEILING
            )));
        }
        let offset = self.absolute_offset(file, pos);
        let f = self.fds.get(file)?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(())
    }

    fn truncate(&mut self, file: FileId, len: u64) -> CResult<()> {
        let absolute = if file == DB_FILE { FLAT_HEADER_SIZE + len } else { len };
        let f = self.fds.get(file)?;
        f.set_len(absolute)?;
        Ok(())
    }

    fn sync(&mut self, file: FileId) -> CResult<()> {
        let f = self.fds.get(file)?;
        f.sync_all()?;
        Ok(())
    }

    fn getlabel(&mut self) -> CResult<Version> {
        Ok(self.read_header()?.version)
    }

    fn setlabel(&mut self, version: Version) -> CResult<()> {
        let mut header = self.read_header().unwrap_or(Header { magic: FLAT_MAGIC, size: FLAT_HEADER_SIZE as u32, version });
        header.version = version;
        self.write_header(header)
    }

    fn append(&mut self, data: &[u8]) -> CResult<()> {
        let f = self.fds.get(crate::storage::LOG_FILE)?;
        f.seek(SeekFrom::End(0))?;
        f.write_all(data)?;
        Ok(())
    }

    fn file_len(&mut self, file: FileId) -> CResult<u64> {
        let f = self.fds.get(file)?;
        let len = f.metadata()?.len();
        Ok(if file == DB_FILE { len.saturating_sub(FLAT_HEADER_SIZE) } else { len })
    }

    fn stat(&mut self) -> CResult<Status> {
        let version = self.getlabel()?;
        let f = self.fds.get(DB_FILE)?;
        let total = f.metadata()?.len();
        Ok(Status {
            name: format!("flat@{:?}", version),
            keys: 0,
            size: total.saturating_sub(FLAT_HEADER_SIZE),
            total_disk_size: total,
            live_disk_size: total,
            garbage_disk_size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_is_labelled_1_1() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        assert_eq!(store.getlabel().unwrap(), Version::NEW);
    }

    #[test]
    fn write_read_roundtrip_skips_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        store.write(DB_FILE, 0, b"hello").unwrap();
        assert_eq!(store.read(DB_FILE, 0, 5).unwrap(), b"hello");

        let raw = std::fs::read(store.db_path()).unwrap();
        assert_eq!(&raw[FLAT_HEADER_SIZE as usize..FLAT_HEADER_SIZE as usize + 5], b"hello");
    }

    #[test]
    fn setlabel_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FlatStore::open_or_create(dir.path()).unwrap();
            store.setlabel(Version::new(2, 7)).unwrap();
        }
        let mut reopened = FlatStore::open_or_create(dir.path()).unwrap();
        assert_eq!(reopened.getlabel().unwrap(), Version::new(2, 7));
    }

    #[test]
    fn write_past_ceiling_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlatStore::open_or_create(dir.path()).unwrap();
        let err = store.write(DB_FILE, FLAT_SIZE_CEILING, b"x").unwrap_err();
        assert_eq!(err.kind_name(), "UIOERROR");
    }
}
