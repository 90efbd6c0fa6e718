pub mod engine;
pub mod log_cask;
pub mod memory;
pub mod fd_cache;
pub mod flat;
pub mod kv;

use serde_derive::{Deserialize, Serialize};
use crate::error::CResult;
use crate::version::Version;

/// In-memory map from key to its latest value position/length in a
/// log-structured file. BTreeMap so that compaction and iteration can walk
/// keys in order.
pub type KeyDir = std::collections::BTreeMap<Vec<u8>, (u64, u32)>;

/// Status of a storage engine, as exposed through `DISK_GetVersion`-adjacent
/// diagnostics and the `ubikctl debug` subcommand.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,
    /// The number of live keys in the engine.
    pub keys: u64,
    /// The logical size of live key/value pairs.
    pub size: u64,
    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,
    /// The on-disk size of live data.
    pub live_disk_size: u64,
    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

/// A scan iterator, with a blanket implementation (in lieu of trait aliases).
pub trait ScanIteratorT: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>> {}

impl<I: DoubleEndedIterator<Item = CResult<(Vec<u8>, Vec<u8>)>>> ScanIteratorT for I {}

/// Reserved key prefix under which Ubik stores its own metadata in a KV
/// database. All other keys are application data.
pub const RESERVED_KEY_PREFIX: u8 = 0x55;

/// Byte offset at which the flat header's application region begins.
pub const FLAT_HEADER_SIZE: u64 = 64;

/// Hard ceiling on a flat database's total size.
pub const FLAT_SIZE_CEILING: u64 = 2 * 1024 * 1024 * 1024;

/// `LEGACY_FLAT_MAGIC` is the magic value `{magic=0x00354545}` a flat
/// database's 64-byte header carries at offset 0.
pub const FLAT_MAGIC: u32 = 0x0035_4545;

/// The tagged physical back-end a database is opened with. Chosen at
/// creation time and detectable on open. The transaction layer
/// branches on this tag only for begin/commit/abort and delegates
/// everything else to the back-end's own implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Flat,
    Kv,
}

/// Direct key/value access for application layers built on the KV back-end
///, since [`PhysicalStore`]'s byte-offset
/// vocabulary has no notion of a key. Object-safe: `scan` materializes its
/// results rather than returning an iterator, since a KV database's
/// application-level scans are expected to stay small (one VLDB, not a
/// general-purpose workload).
pub trait KvApplication: Send + Sync {
    fn kv_get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;
    fn kv_put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;
    fn kv_delete(&mut self, key: &[u8]) -> CResult<()>;
    fn kv_scan(&mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>>;
    fn kv_commit(&mut self) -> CResult<()>;
}

/// A logical file identifier inside a flat database. Only `0` (the
/// database file) and `-1` (the log) are used.
pub type FileId = i32;

pub const DB_FILE: FileId = 0;
pub const LOG_FILE: FileId = -1;

/// The small operation vocabulary every physical back-end exposes, shared by
/// flat and KV storage. Transaction commit/
/// abort/begin are *not* part of this vocabulary: those differ enough
/// between flat (WAL-driven) and KV (engine-commit-driven) that the
/// transaction layer branches on [`BackendKind`] for them directly.
pub trait PhysicalStore: Send + Sync {
    /// Reads `len` bytes at `pos` from the given logical file.
    fn read(&mut self, file: FileId, pos: u64, len: usize) -> CResult<Vec<u8>>;

    /// Writes `data` at `pos` in the given logical file.
    fn write(&mut self, file: FileId, pos: u64, data: &[u8]) -> CResult<()>;

    /// Truncates the given logical file to `len` bytes.
    fn truncate(&mut self, file: FileId, len: u64) -> CResult<()>;

    /// Durably syncs the given logical file to disk.
    fn sync(&mut self, file: FileId) -> CResult<()>;

    /// Reads the database's current label.
    fn getlabel(&mut self) -> CResult<Version>;

    /// Writes a new database label.
    fn setlabel(&mut self, version: Version) -> CResult<()>;

    /// Appends bytes to the log file. Only meaningful for [`BackendKind::Flat`].
    fn append(&mut self, data: &[u8]) -> CResult<()>;

    /// Total on-disk size of the database's primary file/store.
    fn stat(&mut self) -> CResult<Status>;

    /// The current length in bytes of the given logical file, used by log
    /// replay to size its read without guessing.
    fn file_len(&mut self, file: FileId) -> CResult<u64>;

    /// Exposes this store's [`KvApplication`] facet, if it has one. Only the
    /// KV back-end implements this; flat stores keep the default `None`. Lets
    /// the VLDB dispatch layer reach key/value operations through the
    /// single `Box<dyn PhysicalStore>` held under `DBHOLD` without needing to
    /// downcast to a concrete engine type.
    fn as_kv_application(&mut self) -> Option<&mut dyn KvApplication> {
        None
    }
}
