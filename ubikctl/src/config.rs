//! Opening and identifying an on-disk database given only a path, the way
//! `vldb_check`/`vldb_convert` figure out what they are pointed at before
//! the offline checker/upgrader can do any work.

use std::path::Path;

use ubik::context::Context;
use ubik::error::{CResult, Error};
use ubik::freeze::FreezeGuard;
use ubik::quorum::PeerDirectory;
use ubik::storage::flat::FlatStore;
use ubik::storage::{kv, BackendKind, PhysicalStore};
use ubik::version::Version;
use ubik::vote::{VoteCell, VoteState};

/// Guesses a database's physical back-end from what's on disk: the flat
/// back-end always leaves a `DB0` file directly under the database
/// directory (see `FdCache`'s naming), the KV back-end does not.
pub fn detect_backend(path: &Path) -> CResult<BackendKind> {
    if path.join("DB0").is_file() {
        return Ok(BackendKind::Flat);
    }
    if path.exists() {
        return Ok(BackendKind::Kv);
    }
    Err(Error::NotFound(format!("no database found at {}", path.display())))
}

/// Resolves the back-end to use: an explicit `-force-type` override, or
/// auto-detection against what's already on disk.
pub fn resolve_backend(path: &Path, force_type: Option<BackendKind>) -> CResult<BackendKind> {
    match force_type {
        Some(kind) => Ok(kind),
        None => detect_backend(path),
    }
}

pub fn open_store(path: &Path, backend: BackendKind) -> CResult<Box<dyn PhysicalStore>> {
    Ok(match backend {
        BackendKind::Flat => Box::new(FlatStore::open_or_create(path)?),
        BackendKind::Kv => Box::new(kv::open_log_cask_kv(path.to_path_buf())?),
    })
}

/// Builds a single-node `Context` good for exactly one in-process operation
/// (an online upgrade or a local freeze round-trip) against the database at
/// `path`. With no configured peers, `quorum_size() == 1`, so promoting this
/// transient site to sync site succeeds immediately.
pub fn transient_context(path: &Path, backend: BackendKind) -> CResult<(Context, FreezeGuard)> {
    let server_id = uuid::Uuid::new_v4();
    let mut store = open_store(path, backend)?;
    let label = store.getlabel()?;

    let mut state = VoteState::new(server_id, std::iter::empty::<uuid::Uuid>());
    state.try_promote(std::time::Instant::now());
    let vote = VoteCell::new(state);

    let mut config = ubik::config::ServerConfig::default();
    config.server_id = server_id;
    config.database_dir = path.to_path_buf();
    config.backend = backend;

    let directory = PeerDirectory::new(std::collections::HashMap::new());
    let ctx = Context::new(server_id, config, backend, store, label, vote, directory);
    Ok((ctx, FreezeGuard::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_backend_finds_flat_db0() {
        let dir = tempfile::tempdir().unwrap();
        FlatStore::open_or_create(dir.path()).unwrap();
        assert_eq!(detect_backend(dir.path()).unwrap(), BackendKind::Flat);
    }

    #[test]
    fn detect_backend_falls_back_to_kv() {
        let dir = tempfile::tempdir().unwrap();
        let kv_path = dir.path().join("kvdb");
        kv::open_log_cask_kv(kv_path.clone()).unwrap();
        assert_eq!(detect_backend(&kv_path).unwrap(), BackendKind::Kv);
    }

    #[test]
    fn detect_backend_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(detect_backend(&missing).is_err());
    }
}
