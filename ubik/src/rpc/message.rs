//! Wire messages for the two RPC services ubik servers speak to each other
//! over: the vote service (beacon/election) and the disk service
//! (remote transaction dispatch). All integers travel big-endian on the
//! wire; here that's `bincode`'s fixed-width encoding plus `VersionWire`'s
//! explicit `u64` pair standing in for XDR `hyper`.

use serde_derive::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::version::VersionWire;

pub type Tid = (u32, u32);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Vote(VoteRequest),
    Disk(DiskRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Vote(VoteResponse),
    Disk(DiskResponse),
}

/// Vote-service requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VoteRequest {
    /// Plain beacon: "are you willing to vote for me as sync site".
    Beacon { candidate: Uuid, version: VersionWire },
    /// Structured beacon carrying the candidate's full server-descriptor
    /// snapshot, used once peers agree to speak the newer dialect.
    SBeacon { candidate: Uuid, version: VersionWire, up: bool, current_db: bool },
    /// Legacy introspection dump (original `DebugOld`).
    SDebugOld,
    /// Structured introspection dump: current sync-site claim and per-peer
    /// bookkeeping.
    SDebug,
    Debug,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VoteResponse {
    Vote { granted: bool, version: VersionWire },
    Debug(DebugDump),
    Ok,
}

/// Snapshot of a server's vote/beacon state, returned by `SDebug`/`Debug`
///.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DebugDump {
    pub server_id: Uuid,
    pub is_sync_site: bool,
    pub sync_site_claim: Option<Uuid>,
    pub version: VersionWire,
    pub peers: Vec<PeerDebug>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDebug {
    pub server_id: Uuid,
    pub up: bool,
    pub current_db: bool,
    pub beacon_since_down: bool,
    pub last_vote_yes: bool,
}

/// Disk-service requests: remote transaction dispatch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiskRequest {
    Begin { tid: Tid, read_only: bool },
    Commit { tid: Tid, version: VersionWire },
    Abort { tid: Tid },
    ReleaseLocks { tid: Tid },
    Lock { tid: Tid, file: i32, pos: u64, len: u64, exclusive: bool },
    Write { tid: Tid, file: i32, pos: u64, data: Vec<u8> },
    WriteV { tid: Tid, writes: Vec<(i32, u64, Vec<u8>)> },
    GetVersion,
    SetVersion { tid: Tid, version: VersionWire },
    Probe,
    UpdateInterfaceAddr { addrs: Vec<SocketAddr> },
    GetFile { file: i32 },
    GetFile2 { file: i32 },
    /// Old-style redistribution push: the caller ships the raw file bytes
    /// it holds and the version they correspond to; the receiver installs
    /// them as its new live database.
    SendFile { file: i32, version: VersionWire, bytes: Vec<u8> },
    /// New-style, KV-aware redistribution push. Carries the same payload as
    /// `SendFile` in this codebase, since both back-ends install through the
    /// generic physical-store surface; kept as a distinct opcode to mirror
    /// the old/new split the wire protocol historically has.
    SendFile2 { file: i32, version: VersionWire, bytes: Vec<u8> },
    /// `FreezeBegin`: an operator tool's request to pause write processing
    /// ahead of an external database replacement.
    FreezeBegin { need_sync: bool, timeout_secs: u64, read_write: bool },
    /// `FreezeInstall`: pivots the frozen database to `new_version`, taking
    /// a `.OLD`-style backup first when `backup_suffix` is set.
    FreezeInstall {
        freeze_id: u64,
        old_version: VersionWire,
        new_version: VersionWire,
        new_suffix: String,
        backup_suffix: Option<String>,
    },
    /// `FreezeEnd`: releases the freeze lock, leaving the installed database
    /// (or, if no install happened, the original) in place.
    FreezeEnd { freeze_id: u64 },
    /// `FreezeAbort`/`FreezeAbortForce`.
    FreezeAbort { freeze_id: u64, force: bool },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiskResponse {
    Ack,
    Version(VersionWire),
    Bytes(Vec<u8>),
    /// A `(key, value)` record batch for `GetFile2`/`SendFile2`, with a
    /// trailing zero-length pair signalling EOF.
    Records(Vec<(Vec<u8>, Vec<u8>)>),
    /// `FreezeBegin`'s reply: the freeze id to echo back in `FreezeInstall`/
    /// `FreezeEnd`, the version frozen at, and the primary database path the
    /// client should write its candidate next to.
    Frozen { freeze_id: u64, version: VersionWire, db_path: String },
    Error { kind: String, message: String },
}

impl From<&crate::error::Error> for DiskResponse {
    fn from(e: &crate::error::Error) -> Self {
        DiskResponse::Error { kind: e.kind_name().to_string(), message: e.to_string() }
    }
}
