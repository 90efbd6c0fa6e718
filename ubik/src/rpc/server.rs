//! The RPC server loop: accepts connections and dispatches incoming
//! Vote/Disk requests against shared [`Context`] state.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use crate::context::Context;
use crate::error::CResult;
use crate::freeze::FreezeGuard;
use crate::rpc::message::{
    DebugDump, DiskRequest, DiskResponse, PeerDebug, Request, Response, VoteRequest, VoteResponse,
};
use crate::rpc::transport::Connection;
use crate::storage::{BackendKind, PhysicalStore};
use crate::version::Version;

/// Serves incoming RPCs on `listener` until the process is torn down. Each
/// connection gets its own task; `ctx`/`freeze` are shared behind `Arc`.
pub async fn serve(listener: TcpListener, ctx: Arc<Context>, freeze: Arc<FreezeGuard>) -> CResult<()> {
    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let ctx = ctx.clone();
        let freeze = freeze.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx, freeze).await {
                log::warn!("rpc connection ended: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<Context>, freeze: Arc<FreezeGuard>) -> CResult<()> {
    let mut conn = Connection::new(stream);
    loop {
        let request = match conn.recv_request().await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let response = match request {
            Request::Vote(req) => Response::Vote(handle_vote(&ctx, req)),
            Request::Disk(req) => Response::Disk(handle_disk(&ctx, &freeze, req).await),
        };
        conn.send_response(&response).await?;
    }
}

fn handle_vote(ctx: &Context, req: VoteRequest) -> VoteResponse {
    let now = std::time::Instant::now();
    match req {
        VoteRequest::Beacon { candidate, version } => {
            let version: Version = version.into();
            let granted = ctx.vote.with(|v| {
                v.note_candidate(candidate, now);
                if v.should_grant(candidate, now) {
                    v.grant(candidate, now, false);
                    true
                } else {
                    false
                }
            });
            ctx.vote.with(|v| v.known_sync_version = v.known_sync_version.max(version));
            VoteResponse::Vote { granted, version: ctx.dbhold.lock().unwrap().label.into() }
        }
        VoteRequest::SBeacon { candidate, version, up, current_db } => {
            let version: Version = version.into();
            let granted = ctx.vote.with(|v| {
                v.note_candidate(candidate, now);
                let g = v.should_grant(candidate, now);
                if g {
                    v.grant(candidate, now, up && current_db);
                }
                g
            });
            VoteResponse::Vote { granted, version: ctx.dbhold.lock().unwrap().label.into() }
        }
        VoteRequest::Debug | VoteRequest::SDebug | VoteRequest::SDebugOld => {
            VoteResponse::Debug(debug_dump(ctx, now))
        }
    }
}

/// Builds the `DebugDump` introspection snapshot shared by `Debug`/`SDebug`/
/// `SDebugOld`.
fn debug_dump(ctx: &Context, now: std::time::Instant) -> DebugDump {
    ctx.vote.with(|v| DebugDump {
        server_id: ctx.server_id,
        is_sync_site: v.am_sync_site(now),
        sync_site_claim: v.sync_host,
        version: ctx.dbhold.lock().unwrap().label.into(),
        peers: v
            .peers
            .values()
            .map(|p| PeerDebug {
                server_id: p.id,
                up: p.up,
                current_db: p.current_db,
                beacon_since_down: p.beacon_since_down,
                last_vote_yes: p.last_vote_yes,
            })
            .collect(),
    })
}

async fn handle_disk(ctx: &Context, freeze: &FreezeGuard, req: DiskRequest) -> DiskResponse {
    match dispatch_disk(ctx, freeze, req).await {
        Ok(resp) => resp,
        Err(e) => DiskResponse::from(&e),
    }
}

async fn dispatch_disk(ctx: &Context, freeze: &FreezeGuard, req: DiskRequest) -> CResult<DiskResponse> {
    match req {
        DiskRequest::Begin { tid, .. } => {
            // A remote `DISK_Begin` carries the sync site's own tid and
            // this process just records the commit is in flight; the
            // write itself arrives via `Write`/`WriteV`.
            ctx.dbhold.lock().unwrap().activity.writing = true;
            ctx.vote.with(|v| v.known_write_tid = Some(tid));
            Ok(DiskResponse::Ack)
        }
        DiskRequest::Write { file, pos, data, .. } => {
            let mut hold = ctx.dbhold.lock().unwrap();
            hold.store.write(file, pos, &data)?;
            Ok(DiskResponse::Ack)
        }
        DiskRequest::WriteV { writes, .. } => {
            let mut hold = ctx.dbhold.lock().unwrap();
            for (file, pos, data) in writes {
                hold.store.write(file, pos, &data)?;
            }
            Ok(DiskResponse::Ack)
        }
        DiskRequest::Commit { version, .. } => {
            let mut hold = ctx.dbhold.lock().unwrap();
            hold.store.sync(crate::storage::DB_FILE)?;
            hold.store.setlabel(version.into())?;
            hold.label = version.into();
            Ok(DiskResponse::Ack)
        }
        DiskRequest::Abort { .. } => {
            ctx.buffers.abort(0);
            ctx.dbhold.lock().unwrap().activity.writing = false;
            ctx.vote.with(|v| v.known_write_tid = None);
            Ok(DiskResponse::Ack)
        }
        DiskRequest::ReleaseLocks { .. } => {
            ctx.dbhold.lock().unwrap().activity.writing = false;
            ctx.vote.with(|v| v.known_write_tid = None);
            Ok(DiskResponse::Ack)
        }
        DiskRequest::Lock { .. } => Ok(DiskResponse::Ack),
        DiskRequest::GetVersion | DiskRequest::Probe => {
            Ok(DiskResponse::Version(ctx.dbhold.lock().unwrap().label.into()))
        }
        DiskRequest::SetVersion { version, .. } => {
            let mut hold = ctx.dbhold.lock().unwrap();
            hold.store.setlabel(version.into())?;
            hold.label = version.into();
            Ok(DiskResponse::Ack)
        }
        DiskRequest::UpdateInterfaceAddr { .. } => Ok(DiskResponse::Ack),
        DiskRequest::GetFile { file } | DiskRequest::GetFile2 { file } => {
            let mut hold = ctx.dbhold.lock().unwrap();
            let len = hold.store.file_len(file)? as usize;
            let bytes = hold.store.read(file, 0, len)?;
            Ok(DiskResponse::Bytes(bytes))
        }
        DiskRequest::SendFile { file, version, bytes } | DiskRequest::SendFile2 { file, version, bytes } => {
            let version: Version = version.into();
            let primary = ctx.config.database_dir.clone();
            let candidate_path = crate::freeze::sibling_path(&primary, ".TMP");
            let mut candidate: Box<dyn PhysicalStore> = match ctx.backend {
                BackendKind::Flat => Box::new(crate::storage::flat::FlatStore::open_or_create(&candidate_path)?),
                BackendKind::Kv => Box::new(crate::storage::kv::open_log_cask_kv(candidate_path.clone())?),
            };
            candidate.write(file, 0, &bytes)?;
            candidate.setlabel(version)?;
            candidate.sync(file)?;
            drop(candidate);
            crate::freeze::install(ctx, ".TMP", version)?;
            Ok(DiskResponse::Ack)
        }
        DiskRequest::FreezeBegin { need_sync, timeout_secs, read_write } => {
            let begin = freeze.begin(
                ctx,
                crate::freeze::FreezeBeginRequest {
                    need_sync,
                    timeout: std::time::Duration::from_secs(timeout_secs),
                    read_write,
                },
            )?;
            Ok(DiskResponse::Frozen {
                freeze_id: begin.freeze_id,
                version: begin.version.into(),
                db_path: begin.db_path.to_string_lossy().into_owned(),
            })
        }
        DiskRequest::FreezeInstall { freeze_id, old_version, new_version, new_suffix, backup_suffix } => {
            freeze.install(
                ctx,
                crate::freeze::FreezeInstallRequest {
                    freeze_id,
                    old_version: old_version.into(),
                    new_version: new_version.into(),
                    new_suffix,
                    backup_suffix,
                },
            )?;
            Ok(DiskResponse::Ack)
        }
        DiskRequest::FreezeEnd { freeze_id } => {
            freeze.end(ctx, freeze_id)?;
            Ok(DiskResponse::Ack)
        }
        DiskRequest::FreezeAbort { freeze_id, force } => {
            freeze.abort(ctx, freeze_id, force)?;
            Ok(DiskResponse::Ack)
        }
    }
}

/// Runs the 4 s recovery tick loop forever, intended to be spawned once per
/// server process alongside [`serve`].
pub async fn run_recovery_loop(ctx: Arc<Context>, recovery: Arc<crate::recovery::Recovery>) {
    let mut interval = tokio::time::interval(crate::recovery::TICK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = recovery.tick(&ctx).await {
            log::warn!("recovery tick failed: {e}");
        }
    }
}

/// Runs the beacon sender loop, polling every peer every [`POLLTIME`] and
/// attempting promotion once quorum is observed.
pub async fn run_beacon_loop(ctx: Arc<Context>) {
    let mut interval = tokio::time::interval(crate::vote::POLLTIME);
    loop {
        interval.tick().await;
        if let Err(e) = beacon_round(&ctx).await {
            log::warn!("beacon round failed: {e}");
        }
    }
}

async fn beacon_round(ctx: &Context) -> CResult<()> {
    let (candidate, version) = (ctx.server_id, ctx.dbhold.lock().unwrap().label);

    let peer_ids: Vec<uuid::Uuid> = ctx.vote.with(|v| v.peers.keys().copied().collect());
    for id in peer_ids {
        let request = Request::Vote(VoteRequest::SBeacon {
            candidate,
            version: version.into(),
            up: true,
            current_db: true,
        });
        if let Ok(mut conn) = ctx.directory.connect(id).await {
            if let Ok(Response::Vote(VoteResponse::Vote { granted, version: peer_version })) =
                conn.call(&request).await
            {
                ctx.vote.with(|v| v.peer_responded(id, std::time::Instant::now(), granted, peer_version.into()));
            } else {
                ctx.vote.with(|v| v.peer_failed(id));
            }
        } else {
            ctx.vote.with(|v| v.peer_failed(id));
        }
    }

    let now = std::time::Instant::now();
    if ctx.vote.with(|v| v.try_promote(now)) {
        ctx.vote.with(|v| v.mark_advertised());
    }
    Ok(())
}
