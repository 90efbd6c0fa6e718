//! Remote transaction dispatch: runs a disk RPC against every eligible peer
//! concurrently and aggregates the result into a quorum verdict.

use std::collections::HashMap;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::{CResult, Error};
use crate::rpc::message::{DiskRequest, DiskResponse, Request};
use crate::rpc::transport::Connection;
use crate::version::Version;
use crate::vote::VoteCell;

/// A single bulk dispatch may not address more than this many peers at
/// once; Ubik's remote-call builder fails fast before issuing any RPC.
pub const BULK_MAXCALLS: usize = 32;

/// Which peers a dispatch should even attempt to contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchFilter {
    /// Non-clone, `up && currentDB` peers: used for every remote call after
    /// the transaction's first `DISK_Begin`.
    Eligible,
    /// Additionally requires `beaconSinceDown && lastVote`: used only for
    /// the very first `DISK_Begin` of a new write transaction.
    FirstBegin,
}

/// The outcome of dispatching one request to the quorum.
pub struct QuorumResult {
    /// Peers that returned a non-error response.
    pub acked: Vec<Uuid>,
    /// Peers whose RPC failed or errored; already marked down in the vote
    /// state by the time this is returned.
    pub failed: Vec<Uuid>,
}

impl QuorumResult {
    pub fn reached(&self, quorum_size: usize) -> bool {
        // +1 for the sync site's own local commit, which the caller is
        // expected to have already performed before dispatching.
        self.acked.len() + 1 >= quorum_size
    }
}

/// Server descriptor table: maps peer id to its known addresses, used to
/// open connections on demand. Connection handles themselves are not
/// pooled here -- connections are refcounted and bracketed elsewhere by
/// `Quorum_StartIO`/`EndIO`; in this async codebase that bracket is simply
/// "the lifetime of the dispatch's own connection", since tokio drops the
/// socket at the end of the call without any cross-task sharing needed.
pub struct PeerDirectory {
    pub addrs: HashMap<Uuid, Vec<SocketAddr>>,
}

impl PeerDirectory {
    pub fn new(addrs: HashMap<Uuid, Vec<SocketAddr>>) -> Self {
        PeerDirectory { addrs }
    }

    pub(crate) async fn connect(&self, id: Uuid) -> CResult<Connection> {
        let candidates =
            self.addrs.get(&id).ok_or_else(|| Error::BadHost(format!("no known address for peer {id}")))?;
        let mut last_err = None;
        for addr in candidates {
            match Connection::connect(*addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::BadHost(format!("peer {id} has no addresses configured"))))
    }
}

fn eligible_peers(vote: &VoteCell, filter: DispatchFilter) -> Vec<Uuid> {
    vote.with(|state| {
        state
            .peers
            .values()
            .filter(|p| match filter {
                DispatchFilter::Eligible => p.eligible_for_dispatch(),
                DispatchFilter::FirstBegin => p.eligible_for_first_begin(),
            })
            .map(|p| p.id)
            .collect()
    })
}

/// Dispatches `request` to every peer selected by `filter`, concurrently,
/// marking failures down in `vote` as they occur.
pub async fn dispatch(
    directory: &PeerDirectory,
    vote: &VoteCell,
    filter: DispatchFilter,
    request: DiskRequest,
) -> CResult<QuorumResult> {
    let peers = eligible_peers(vote, filter);
    if peers.len() > BULK_MAXCALLS {
        return Err(Error::Internal(format!(
            "quorum bulk dispatch of {} calls exceeds BULK_MAXCALLS ({})",
            peers.len(),
            BULK_MAXCALLS
        )));
    }

    let mut acked = Vec::new();
    let mut failed = Vec::new();

    let calls = peers.into_iter().map(|id| {
        let request = request.clone();
        async move {
            let result = call_one(directory, &id, request).await;
            (id, result)
        }
    });
    let results = futures::future::join_all(calls).await;

    for (id, result) in results {
        match result {
            Ok(DiskResponse::Error { .. }) | Err(_) => {
                vote.with(|state| state.peer_failed(id));
                failed.push(id);
            }
            Ok(_) => acked.push(id),
        }
    }

    Ok(QuorumResult { acked, failed })
}

async fn call_one(directory: &PeerDirectory, id: &Uuid, request: DiskRequest) -> CResult<DiskResponse> {
    let mut conn = directory.connect(*id).await?;
    match conn.call(&Request::Disk(request)).await? {
        crate::rpc::message::Response::Disk(resp) => Ok(resp),
        _ => Err(Error::Internal("peer replied to a disk RPC with a vote-service message".into())),
    }
}

/// Attempts a single `DISK_Probe` against a peer regardless of its current
/// eligibility, for recovery's down-peer sweep. Returns the
/// peer's reported version on success.
pub async fn probe(directory: &PeerDirectory, id: Uuid) -> CResult<Version> {
    match call_one(directory, &id, DiskRequest::GetVersion).await? {
        DiskResponse::Version(v) => Ok(v.into()),
        _ => Err(Error::Internal("peer replied to DISK_Probe with an unexpected response".into())),
    }
}

/// `DISK_GetFile2` against a single peer, for recovery's fetch-best-db step.
pub async fn get_file2(directory: &PeerDirectory, id: Uuid, file: i32) -> CResult<Vec<u8>> {
    match call_one(directory, &id, DiskRequest::GetFile2 { file }).await? {
        DiskResponse::Bytes(bytes) => Ok(bytes),
        _ => Err(Error::Internal("peer replied to DISK_GetFile2 with an unexpected response".into())),
    }
}

/// `DISK_GetFile`, the fallback recovery's fetch-best-db step takes when
/// `get_file2` fails against an older peer.
pub async fn get_file(directory: &PeerDirectory, id: Uuid, file: i32) -> CResult<Vec<u8>> {
    match call_one(directory, &id, DiskRequest::GetFile { file }).await? {
        DiskResponse::Bytes(bytes) => Ok(bytes),
        _ => Err(Error::Internal("peer replied to DISK_GetFile with an unexpected response".into())),
    }
}

/// `DISK_SendFile2` against a single peer: pushes `bytes` labelled `version`
/// for the peer to install, used by recovery's redistribute step.
pub async fn send_file2(directory: &PeerDirectory, id: Uuid, file: i32, version: Version, bytes: Vec<u8>) -> CResult<()> {
    match call_one(directory, &id, DiskRequest::SendFile2 { file, version: version.into(), bytes }).await? {
        DiskResponse::Ack => Ok(()),
        _ => Err(Error::Internal("peer replied to DISK_SendFile2 with an unexpected response".into())),
    }
}

/// Stamps each acked peer's known committed version after a successful
/// `DISK_Commit` aggregate.
pub fn stamp_committed_version(vote: &VoteCell, acked: &[Uuid], version: Version) {
    vote.with(|state| {
        for id in acked {
            if let Some(peer) = state.peers.get_mut(id) {
                peer.committed_version = version;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vote::VoteState;

    #[test]
    fn quorum_reached_counts_local_commit() {
        let result = QuorumResult { acked: vec![Uuid::new_v4()], failed: vec![] };
        assert!(result.reached(2));
        assert!(!result.reached(3));
    }

    #[test]
    fn bulk_dispatch_over_cap_is_rejected() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let me = Uuid::new_v4();
            let peer_ids: Vec<Uuid> = (0..40).map(|_| Uuid::new_v4()).collect();
            let mut state = VoteState::new(me, peer_ids.clone());
            for id in &peer_ids {
                state.peer_responded(*id, std::time::Instant::now(), true, Version::NEW);
            }
            let vote = VoteCell::new(state);
            let directory = PeerDirectory::new(HashMap::new());

            let err = dispatch(&directory, &vote, DispatchFilter::Eligible, DiskRequest::GetVersion)
                .await
                .unwrap_err();
            assert_eq!(err.kind_name(), "UINTERNAL");
        });
    }
}
