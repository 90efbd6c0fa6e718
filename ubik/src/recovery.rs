//! Recovery: the long-running per-server task that restores quorum
//! invariants after a membership change or crash. Ticks every 4 s.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::context::Context;
use crate::error::CResult;
use crate::quorum;
use crate::rpc::message::DiskResponse;
use crate::storage::{BackendKind, PhysicalStore};
use crate::version::Version;

/// Recovery's state bit set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryFlags {
    pub sync_site: bool,
    pub found_db: bool,
    pub have_db: bool,
    pub sent_db: bool,
    pub label_db: bool,
}

pub const TICK_INTERVAL: Duration = Duration::from_secs(4);
pub const PROBE_THROTTLE: Duration = Duration::from_secs(30);

pub struct Recovery {
    flags: std::sync::Mutex<RecoveryFlags>,
    last_probe_secs: AtomicU32,
    /// The peer (and its reported version) `find_best_db` last determined
    /// holds the best database, if it isn't us.
    best_peer: std::sync::Mutex<Option<(uuid::Uuid, Version)>>,
}

impl Recovery {
    pub fn new() -> Self {
        Recovery {
            flags: std::sync::Mutex::new(RecoveryFlags::default()),
            last_probe_secs: AtomicU32::new(0),
            best_peer: std::sync::Mutex::new(None),
        }
    }

    pub fn flags(&self) -> RecoveryFlags {
        *self.flags.lock().unwrap()
    }

    /// Runs one 4 s tick of the recovery loop.
    pub async fn tick(&self, ctx: &Context) -> CResult<()> {
        self.probe_down_peers(ctx).await;

        let now = std::time::Instant::now();
        let is_sync = ctx.vote.with(|v| v.am_sync_site(now));
        if !is_sync {
            let mut flags = self.flags.lock().unwrap();
            flags.sync_site = false;
            return Ok(());
        }

        {
            let mut flags = self.flags.lock().unwrap();
            flags.sync_site = true;
        }

        if !self.flags().found_db {
            self.find_best_db(ctx).await?;
        }

        if !self.flags().have_db {
            self.fetch_best_db_if_needed(ctx).await?;
        }

        self.relabel_if_freshly_initialized(ctx)?;

        if !self.flags().sent_db {
            self.redistribute(ctx).await?;
        }

        Ok(())
    }

    /// Step 1: probe every down peer; throttled to once per
    /// [`PROBE_THROTTLE`].
    async fn probe_down_peers(&self, ctx: &Context) {
        let now_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let last = self.last_probe_secs.load(Ordering::SeqCst);
        if now_secs.saturating_sub(last) < PROBE_THROTTLE.as_secs() as u32 {
            return;
        }
        self.last_probe_secs.store(now_secs, Ordering::SeqCst);

        let down: Vec<uuid::Uuid> = ctx.vote.with(|v| v.peers.values().filter(|p| !p.up).map(|p| p.id).collect());
        if down.is_empty() {
            return;
        }

        let mut any_recovered = false;
        for id in down {
            if let Ok(version) = quorum::probe(&ctx.directory, id).await {
                ctx.vote.with(|v| v.peer_responded(id, std::time::Instant::now(), false, version));
                any_recovered = true;
            }
        }
        if any_recovered {
            // A previously down peer is reachable again; re-run the
            // best-database search since it may now outvote our pick.
            let mut flags = self.flags.lock().unwrap();
            flags.found_db = false;
        }
    }

    /// Step 3: poll every eligible peer's version individually (bulk
    /// `dispatch` discards per-peer payloads, and the tie-break here needs to
    /// know *which* peer holds the best version, not just how many
    /// responded), set `bestDBVersion` once a quorum of responses is in.
    async fn find_best_db(&self, ctx: &Context) -> CResult<()> {
        let peer_ids: Vec<uuid::Uuid> =
            ctx.vote.with(|v| v.peers.values().filter(|p| p.eligible_for_dispatch()).map(|p| p.id).collect());
        let local_version = ctx.dbhold.lock().unwrap().label;

        let mut responded = 0usize;
        let mut best: Option<(uuid::Uuid, Version)> = None;
        for id in &peer_ids {
            if let Ok(version) = quorum::probe(&ctx.directory, *id).await {
                responded += 1;
                if version > local_version && best.map_or(true, |(_, b)| version > b) {
                    best = Some((*id, version));
                }
            }
        }

        if responded + 1 >= ctx.quorum_size() {
            *self.best_peer.lock().unwrap() = best;
            let mut flags = self.flags.lock().unwrap();
            flags.found_db = true;
            flags.sent_db = false;
            flags.have_db = best.is_none();
        }
        Ok(())
    }

    /// Step 4: fetch the best database if a peer (not us) holds a newer
    /// version, installing it through the same candidate-store-then-pivot
    /// path `freeze::install` uses for a hot-swap.
    async fn fetch_best_db_if_needed(&self, ctx: &Context) -> CResult<()> {
        let best = *self.best_peer.lock().unwrap();
        let Some((peer, expected_version)) = best else {
            self.flags.lock().unwrap().have_db = true;
            return Ok(());
        };

        ctx.dbhold.lock().unwrap().activity.receiving = true;
        ctx.buffers.abort(0);

        let primary = ctx.config.database_dir.clone();
        let candidate_path = crate::freeze::sibling_path(&primary, ".TMP");
        let mut candidate: Box<dyn PhysicalStore> = match ctx.backend {
            BackendKind::Flat => Box::new(crate::storage::flat::FlatStore::open_or_create(&candidate_path)?),
            BackendKind::Kv => Box::new(crate::storage::kv::open_log_cask_kv(candidate_path.clone())?),
        };

        let fetched = match quorum::get_file2(&ctx.directory, peer, crate::storage::DB_FILE).await {
            Ok(bytes) => bytes,
            Err(_) => quorum::get_file(&ctx.directory, peer, crate::storage::DB_FILE).await?,
        };
        candidate.write(crate::storage::DB_FILE, 0, &fetched)?;
        candidate.setlabel(expected_version)?;
        candidate.sync(crate::storage::DB_FILE)?;
        drop(candidate);

        crate::freeze::install(ctx, ".TMP", expected_version)?;
        ctx.dbhold.lock().unwrap().activity.receiving = false;

        self.flags.lock().unwrap().have_db = true;
        Ok(())
    }

    /// Step 5: a freshly initialized database (`epoch == 1`) is relabeled
    /// to `(2, 1)` once quorum is stable, so non-clients may begin writing.
    fn relabel_if_freshly_initialized(&self, ctx: &Context) -> CResult<()> {
        let mut hold = ctx.dbhold.lock().unwrap();
        if hold.label.epoch == 1 {
            hold.store.setlabel(Version::FIRST_REAL)?;
            hold.label = Version::FIRST_REAL;
            let mut flags = self.flags.lock().unwrap();
            flags.label_db = true;
        }
        Ok(())
    }

    /// Step 6: push our version to every up peer whose version differs,
    /// bracketed by the `DBSENDING` activity flag.
    async fn redistribute(&self, ctx: &Context) -> CResult<()> {
        ctx.dbhold.lock().unwrap().activity.sending = true;
        let local_version = ctx.dbhold.lock().unwrap().label;

        let stale: Vec<uuid::Uuid> = ctx.vote.with(|v| {
            v.peers.values().filter(|p| p.up && p.committed_version != local_version).map(|p| p.id).collect()
        });

        let bytes = {
            let mut hold = ctx.dbhold.lock().unwrap();
            let len = hold.store.file_len(crate::storage::DB_FILE)? as usize;
            hold.store.read(crate::storage::DB_FILE, 0, len)?
        };

        let mut ok = true;
        for peer in &stale {
            let sent = quorum::send_file2(&ctx.directory, *peer, crate::storage::DB_FILE, local_version, bytes.clone())
                .await;
            if sent.is_err() {
                ok = false;
                ctx.vote.with(|v| v.peer_failed(*peer));
            }
        }

        ctx.dbhold.lock().unwrap().activity.sending = false;
        if ok {
            let mut flags = self.flags.lock().unwrap();
            flags.sent_db = true;
        }
        Ok(())
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Response helper used by the disk-side RPC handler for `GetVersion` /
/// `Probe`, kept alongside recovery since both are recovery-path replies.
pub fn version_response(version: Version) -> DiskResponse {
    DiskResponse::Version(version.into())
}
