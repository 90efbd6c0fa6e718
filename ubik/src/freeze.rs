//! Database install and the Freeze protocol: an external hot-swap of the
//! live database without ever leaving the primary path non-existent.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::context::Context;
use crate::error::{CResult, Error};
use crate::storage::{BackendKind, PhysicalStore};
use crate::version::Version;

/// `FreezeBegin`'s client-supplied parameters.
#[derive(Clone, Copy, Debug)]
pub struct FreezeBeginRequest {
    pub need_sync: bool,
    pub timeout: Duration,
    pub read_write: bool,
}

#[derive(Clone, Debug)]
pub struct FreezeBeginResponse {
    pub freeze_id: u64,
    pub version: Version,
    pub db_path: PathBuf,
}

/// `FreezeInstall`'s client-supplied parameters.
#[derive(Clone, Debug)]
pub struct FreezeInstallRequest {
    pub freeze_id: u64,
    pub old_version: Version,
    pub new_version: Version,
    pub new_suffix: String,
    pub backup_suffix: Option<String>,
}

/// Global single-at-a-time freeze lock: any
/// attempted re-entry while a freeze is active returns `USYNC`.
pub struct FreezeGuard {
    active: Mutex<Option<u64>>,
    next_id: AtomicU64,
}

impl FreezeGuard {
    pub fn new() -> Self {
        FreezeGuard { active: Mutex::new(None), next_id: AtomicU64::new(1) }
    }

    /// `FreezeBegin`: verifies quorum and writability, sets `DBSENDING`,
    /// assigns a monotonic `freezeid`.
    pub fn begin(&self, ctx: &Context, req: FreezeBeginRequest) -> CResult<FreezeBeginResponse> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(Error::NotReady("a freeze is already active on this server".into()));
        }

        let now = std::time::Instant::now();
        if req.need_sync && !ctx.vote.with(|v| v.am_sync_site(now)) {
            return Err(Error::NotSyncSite);
        }

        let mut hold = ctx.dbhold.lock().unwrap();
        if req.read_write && hold.activity.blocks_write() {
            return Err(Error::NotReady("database busy; cannot begin a read-write freeze".into()));
        }
        hold.activity.sending = true;
        let version = hold.label;
        drop(hold);

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        *active = Some(id);

        Ok(FreezeBeginResponse {
            freeze_id: id,
            version,
            db_path: ctx.config.database_dir.clone(),
        })
    }

    fn require_active(&self, freeze_id: u64) -> CResult<()> {
        let active = self.active.lock().unwrap();
        match *active {
            Some(id) if id == freeze_id => Ok(()),
            _ => Err(Error::NotReady(format!("freeze {freeze_id} is not the active freeze"))),
        }
    }

    /// `FreezeInstall`: verifies the client's view of the old label matches
    /// (or that a racing sync site already landed `new_version`), then pivots
    /// the database via [`install`].
    pub fn install(&self, ctx: &Context, req: FreezeInstallRequest) -> CResult<()> {
        self.require_active(req.freeze_id)?;

        let current = ctx.dbhold.lock().unwrap().label;
        if current != req.old_version && current != req.new_version {
            return Err(Error::BadVersion(format!(
                "FreezeInstall: expected old version {:?}, found {:?}",
                req.old_version, current
            )));
        }
        if current == req.new_version {
            // A racing sync site already installed this version; nothing
            // further to do.
            return Ok(());
        }

        if let Some(backup_suffix) = &req.backup_suffix {
            backup(ctx, backup_suffix)?;
        }

        install(ctx, &req.new_suffix, req.new_version)
    }

    /// `FreezeEnd`: successful end leaves the new database in place and
    /// releases the freeze lock.
    pub fn end(&self, ctx: &Context, freeze_id: u64) -> CResult<()> {
        self.require_active(freeze_id)?;
        ctx.dbhold.lock().unwrap().activity.sending = false;
        *self.active.lock().unwrap() = None;
        Ok(())
    }

    /// `FreezeAbort`/`FreezeAbortForce`: clears the freeze lock without
    /// installing anything. `force` skips the active-id match, for recovering
    /// from a dead client's stuck freeze.
    pub fn abort(&self, ctx: &Context, freeze_id: u64, force: bool) -> CResult<()> {
        if !force {
            self.require_active(freeze_id)?;
        }
        ctx.dbhold.lock().unwrap().activity.sending = false;
        *self.active.lock().unwrap() = None;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }
}

impl Default for FreezeGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomically pivots `PATH.DB<new_suffix>` into place as the live database
///. Verifies the new file's on-disk label, performs the back-end
/// specific rename dance, then flips `Context::dbhold` under its lock.
pub fn install(ctx: &Context, new_suffix: &str, new_version: Version) -> CResult<()> {
    let primary = ctx.config.database_dir.clone();
    let candidate = sibling_path(&primary, new_suffix);

    let label = match ctx.backend {
        BackendKind::Flat => crate::storage::flat::FlatStore::open_or_create(&candidate)?.getlabel()?,
        BackendKind::Kv => crate::storage::kv::open_log_cask_kv(candidate.clone())?.getlabel()?,
    };
    if label != new_version {
        return Err(Error::BadVersion(format!(
            "install(): candidate label {:?} does not match expected {:?}",
            label, new_version
        )));
    }

    match ctx.backend {
        BackendKind::Kv => pivot_kv(&primary, &candidate)?,
        BackendKind::Flat => pivot_flat(&primary, &candidate)?,
    }

    let mut hold = ctx.dbhold.lock().unwrap();
    // `urecovery_AbortAll`: any in-flight transaction on the old file is
    // meaningless once the pivot has happened underneath it.
    ctx.buffers.abort(0);
    ctx.buffers.invalidate(0, crate::storage::DB_FILE);
    ctx.buffers.invalidate(0, crate::storage::LOG_FILE);
    hold.store = match ctx.backend {
        BackendKind::Flat => Box::new(crate::storage::flat::FlatStore::open_or_create(&primary)?),
        BackendKind::Kv => Box::new(crate::storage::kv::open_log_cask_kv(primary.clone())?),
    };
    hold.label = new_version;
    hold.activity = crate::context::ActivityFlags::default();
    Ok(())
}

/// For flat back-ends: `link()` the live database to a backup suffix before
/// pivoting, so the original survives the coming `rename()`.
fn backup(ctx: &Context, backup_suffix: &str) -> CResult<()> {
    let primary = ctx.config.database_dir.clone();
    let backup_path = sibling_path(&primary, backup_suffix);
    // Both back-ends root the live database at a directory (`dir/DB0` +
    // `dir/DBSYS1` for flat; an engine directory for KV), so backing either
    // up is the same recursive copy.
    let _ = ctx.backend;
    if primary.exists() {
        copy_dir_recursive(&primary, &backup_path)?;
    }
    Ok(())
}

/// Flat: the preserving link to `old_suffix` happens in [`backup`] if
/// requested; here we just `rename(new, primary)`.
fn pivot_flat(primary: &Path, candidate: &Path) -> CResult<()> {
    std::fs::rename(candidate, primary).map_err(Error::from)
}

/// KV: move the directory under a permanent cellar path and symlink-swap it
/// into the primary path, so the rename that actually matters is the final
/// symlink-over-primary, which is atomic.
fn pivot_kv(primary: &Path, candidate: &Path) -> CResult<()> {
    let cellar = primary.with_extension("DB.d");
    std::fs::create_dir_all(&cellar).map_err(Error::from)?;

    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
    let counter = std::process::id();
    let dest = cellar.join(format!(
        "{}.{}.{}.DB0",
        primary.file_name().and_then(|n| n.to_str()).unwrap_or("db"),
        now,
        counter
    ));
    std::fs::rename(candidate, &dest).map_err(Error::from)?;

    let link_path = candidate;
    #[cfg(unix)]
    std::os::unix::fs::symlink(&dest, link_path).map_err(Error::from)?;
    #[cfg(not(unix))]
    std::fs::rename(&dest, link_path).map_err(Error::from)?;

    if primary.exists() || primary.symlink_metadata().is_ok() {
        let _ = std::fs::remove_file(primary);
    }
    std::fs::rename(link_path, primary).map_err(Error::from)
}

pub(crate) fn sibling_path(primary: &Path, suffix: &str) -> PathBuf {
    let mut name = primary.file_name().and_then(|n| n.to_str()).unwrap_or("db").to_string();
    name.push_str(suffix);
    primary.with_file_name(name)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> CResult<()> {
    std::fs::create_dir_all(dst).map_err(Error::from)?;
    for entry in std::fs::read_dir(src).map_err(Error::from)? {
        let entry = entry.map_err(Error::from)?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type().map_err(Error::from)?.is_dir() {
            copy_dir_recursive(&entry.path(), &dst_path)?;
        } else {
            std::fs::copy(entry.path(), &dst_path).map_err(Error::from)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_path_appends_suffix() {
        let primary = PathBuf::from("/var/ubik/NAME.DB0");
        assert_eq!(sibling_path(&primary, ".DB1"), PathBuf::from("/var/ubik/NAME.DB0.DB1"));
    }

    #[test]
    fn freeze_guard_rejects_concurrent_begin() {
        let guard = FreezeGuard::new();
        *guard.active.lock().unwrap() = Some(1);
        assert!(guard.is_active());
        let err = guard.require_active(2).unwrap_err();
        assert_eq!(err.kind_name(), "USYNC");
    }
}
