//! `Context`: the per-process handle threading every piece of global state
//! through the transaction, vote, quorum and recovery layers, and the lock
//! order they must be acquired in:
//! `cache_lock -> DBHOLD -> beacon lock -> vote lock -> version lock ->
//! server-address lock`.
//!
//! `DBHOLD` here is `Context::dbhold`: the single mutex serializing access
//! to the buffer cache / physical store / transaction counters, since this
//! codebase has exactly one writer at a time system-wide.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::buffer::BufferCache;
use crate::config::ServerConfig;
use crate::quorum::PeerDirectory;
use crate::storage::{BackendKind, PhysicalStore};
use crate::version::Version;
use crate::vote::VoteCell;

/// In-flight database activity flags, checked by `BeginTrans` before
/// allowing a new write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivityFlags {
    pub writing: bool,
    pub sending: bool,
    pub receiving: bool,
}

impl ActivityFlags {
    pub fn blocks_write(&self) -> bool {
        self.writing || self.sending || self.receiving
    }
}

/// Everything guarded by `DBHOLD`.
pub struct DbHold {
    pub store: Box<dyn PhysicalStore>,
    pub label: Version,
    pub activity: ActivityFlags,
}

pub struct Context {
    pub server_id: Uuid,
    pub config: ServerConfig,
    pub backend: BackendKind,
    pub buffers: BufferCache,
    pub vote: VoteCell,
    pub directory: PeerDirectory,
    pub dbhold: Mutex<DbHold>,
    /// Monotonically increasing per-process counter; a write tid is
    /// `(epoch, tid_counter += 2)`.
    tid_counter: AtomicU32,
}

impl Context {
    pub fn new(
        server_id: Uuid,
        config: ServerConfig,
        backend: BackendKind,
        store: Box<dyn PhysicalStore>,
        label: Version,
        vote: VoteCell,
        directory: PeerDirectory,
    ) -> Self {
        Context {
            server_id,
            config,
            backend,
            buffers: BufferCache::new(),
            vote,
            directory,
            dbhold: Mutex::new(DbHold { store, label, activity: ActivityFlags::default() }),
            tid_counter: AtomicU32::new(1),
        }
    }

    /// Allocates the next write transaction id's counter component. The
    /// caller pairs it with the current epoch.
    pub fn next_tid_counter(&self) -> u32 {
        self.tid_counter.fetch_add(2, Ordering::SeqCst) + 2
    }

    pub fn quorum_size(&self) -> usize {
        self.vote.with(|v| v.quorum_size())
    }
}
