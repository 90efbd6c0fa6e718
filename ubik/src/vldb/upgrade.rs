//! Online/offline VLDB schema upgrade (flat <-> KV), the engine behind
//! `ubikctl -to`. Converting schemas means re-threading every
//! entry through the destination's own `ThreadVLentry`, since the two
//! schemas share [`VlEntry`] but not its on-disk shape. The destination's
//! epoch is always `source.epoch + 1`, so a stale client reading against
//! the old label notices the swap.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::context::Context;
use crate::error::{CResult, Error};
use crate::freeze::{self, FreezeBeginRequest, FreezeGuard, FreezeInstallRequest};
use crate::storage::{flat::FlatStore, kv, BackendKind, PhysicalStore};
use crate::version::Version;
use crate::vldb::{self, Cursor};

/// Copies every VLDB entry from `src` (read through `src_backend`'s schema)
/// into `dest` (written through `dest_backend`'s schema). Returns the number
/// of entries converted.
pub fn convert(
    src: &mut dyn PhysicalStore,
    src_backend: BackendKind,
    dest: &mut dyn PhysicalStore,
    dest_backend: BackendKind,
) -> CResult<u64> {
    vldb::init_if_needed(dest_backend, dest)?;

    let mut cursor = Cursor::START;
    let mut count = 0u64;
    loop {
        match vldb::next_entry(src_backend, src, cursor)? {
            Some((next_cursor, entry)) => {
                vldb::thread(dest_backend, dest, entry)?;
                cursor = next_cursor;
                count += 1;
            }
            None => break,
        }
    }
    Ok(count)
}

/// Offline conversion: opens both database directories directly (no server,
/// no freeze), converts, and labels the destination at `source.epoch + 1`.
/// This is what `ubikctl -to` drives when pointed at a database with no
/// server running against it.
pub fn upgrade_offline(src_dir: &Path, src_backend: BackendKind, dest_dir: &Path, dest_backend: BackendKind) -> CResult<Version> {
    if src_backend == dest_backend {
        return Err(Error::BadType("source and destination back-ends are already the same".into()));
    }

    let mut src_store: Box<dyn PhysicalStore> = match src_backend {
        BackendKind::Flat => Box::new(FlatStore::open_or_create(src_dir)?),
        BackendKind::Kv => Box::new(kv::open_log_cask_kv(src_dir.to_path_buf())?),
    };
    let src_label = src_store.getlabel()?;

    let mut dest_store: Box<dyn PhysicalStore> = match dest_backend {
        BackendKind::Flat => Box::new(FlatStore::open_or_create(dest_dir)?),
        BackendKind::Kv => Box::new(kv::open_log_cask_kv(dest_dir.to_path_buf())?),
    };

    convert(src_store.as_mut(), src_backend, dest_store.as_mut(), dest_backend)?;

    let new_version = Version::new(src_label.epoch + 1, 1);
    dest_store.setlabel(new_version)?;
    dest_store.sync(crate::storage::DB_FILE)?;
    Ok(new_version)
}

/// Online conversion against a running server:
/// begins a read-write freeze, materializes the converted database at a
/// `.CONV.<unix-seconds>` sibling path, then installs it exactly as
/// [`crate::freeze::install`] would for any other freeze.
///
/// This assumes `ctx.backend` is already `dest_backend` — i.e. the server
/// was started pointed at the target back-end kind and is upgrading its
/// on-disk data to match, not switching which back-end it speaks live. A
/// true live back-end swap would need `Context::backend` to change under
/// `DBHOLD`, which this codebase does not support.
pub async fn upgrade_online(ctx: &Context, freeze: &FreezeGuard, src_backend: BackendKind) -> CResult<()> {
    if ctx.backend == src_backend {
        return Err(Error::BadType("upgrade_online's destination must differ from the source back-end".into()));
    }

    let begin = freeze.begin(ctx, FreezeBeginRequest {
        need_sync: true,
        timeout: std::time::Duration::from_secs(60),
        read_write: true,
    })?;

    let suffix = format!(".CONV.{}", SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs());
    let candidate_dir = {
        let mut name = begin.db_path.file_name().and_then(|n| n.to_str()).unwrap_or("db").to_string();
        name.push_str(&suffix);
        begin.db_path.with_file_name(name)
    };

    let result = (|| -> CResult<Version> {
        let mut src_store: Box<dyn PhysicalStore> = match src_backend {
            BackendKind::Flat => Box::new(FlatStore::open_or_create(&begin.db_path)?),
            BackendKind::Kv => Box::new(kv::open_log_cask_kv(begin.db_path.clone())?),
        };
        let mut dest_store: Box<dyn PhysicalStore> = match ctx.backend {
            BackendKind::Flat => Box::new(FlatStore::open_or_create(&candidate_dir)?),
            BackendKind::Kv => Box::new(kv::open_log_cask_kv(candidate_dir.clone())?),
        };
        convert(src_store.as_mut(), src_backend, dest_store.as_mut(), ctx.backend)?;
        let new_version = Version::new(begin.version.epoch + 1, 1);
        dest_store.setlabel(new_version)?;
        dest_store.sync(crate::storage::DB_FILE)?;
        Ok(new_version)
    })();

    let new_version = match result {
        Ok(v) => v,
        Err(e) => {
            let _ = freeze.abort(ctx, begin.freeze_id, false);
            return Err(e);
        }
    };

    freeze.install(ctx, FreezeInstallRequest {
        freeze_id: begin.freeze_id,
        old_version: begin.version,
        new_version,
        new_suffix: suffix,
        backup_suffix: Some(".OLD".to_string()),
    })?;

    freeze.end(ctx, begin.freeze_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;
    use crate::vldb::entry::VlEntry;

    #[test]
    fn convert_flat_to_kv_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = FlatStore::open_or_create(dir.path()).unwrap();
        vldb::init_if_needed(BackendKind::Flat, &mut src).unwrap();
        vldb::thread(BackendKind::Flat, &mut src, VlEntry::new(1, "root.cell")).unwrap();
        vldb::thread(BackendKind::Flat, &mut src, VlEntry::new(2, "user.a")).unwrap();

        let mut dest = kv::KvStoreOn::new(Memory::new());
        let count = convert(&mut src, BackendKind::Flat, &mut dest, BackendKind::Kv).unwrap();
        assert_eq!(count, 2);

        let found = vldb::find_by_name(BackendKind::Kv, &mut dest, "user.a").unwrap().unwrap();
        assert_eq!(found.rw_id, 2);
    }

    #[test]
    fn upgrade_offline_bumps_epoch() {
        let src_dir = tempfile::tempdir().unwrap();
        let mut src = FlatStore::open_or_create(src_dir.path()).unwrap();
        src.setlabel(Version::new(4, 9)).unwrap();
        vldb::init_if_needed(BackendKind::Flat, &mut src).unwrap();
        vldb::thread(BackendKind::Flat, &mut src, VlEntry::new(1, "root.cell")).unwrap();
        drop(src);

        let dest_dir = tempfile::tempdir().unwrap();
        let new_version = upgrade_offline(src_dir.path(), BackendKind::Flat, dest_dir.path(), BackendKind::Kv).unwrap();
        assert_eq!(new_version, Version::new(5, 1));

        let mut dest = kv::open_log_cask_kv(dest_dir.path().to_path_buf()).unwrap();
        assert_eq!(dest.getlabel().unwrap(), Version::new(5, 1));
        let found = vldb::find_by_id(BackendKind::Kv, &mut dest, 1, vldb::IdKind::Rw).unwrap().unwrap();
        assert_eq!(found.name, "root.cell");
    }

    #[test]
    fn upgrade_offline_rejects_same_backend() {
        let dir = tempfile::tempdir().unwrap();
        let err = upgrade_offline(dir.path(), BackendKind::Flat, dir.path(), BackendKind::Flat).unwrap_err();
        assert_eq!(err.kind_name(), "UBADTYPE");
    }
}
