//! Subcommand dispatch: the default `vldb_check`-style consistency scan, and
//! the `-to`/`-online` upgrade path. Each entry point returns the process
//! exit code the CLI surface promises (`0` OK, `1` warning, `2` error,
//! `4` fatal) rather than a `Result`, since a found inconsistency is an
//! expected outcome here, not a failure to propagate.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use log::warn;

use ubik::error::Error;
use ubik::rpc::message::{DiskRequest, DiskResponse, Request, Response};
use ubik::rpc::transport::Connection;
use ubik::storage::{BackendKind, PhysicalStore};
use ubik::version::Version;
use ubik::vldb::{self, Cursor, IdKind};

use crate::config;

pub const EXIT_OK: i32 = 0;
pub const EXIT_WARNING: i32 = 1;
pub const EXIT_ERROR: i32 = 2;
pub const EXIT_FATAL: i32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ToBackend {
    #[clap(name = "vldb4")]
    Vldb4,
    #[clap(name = "vldb4-kv")]
    Vldb4Kv,
}

impl From<ToBackend> for BackendKind {
    fn from(to: ToBackend) -> Self {
        match to {
            ToBackend::Vldb4 => BackendKind::Flat,
            ToBackend::Vldb4Kv => BackendKind::Kv,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DistMode {
    Try,
    Skip,
    Required,
}

/// Everything the CLI surface in the switches list feeds into one run.
pub struct CheckArgs {
    pub database: PathBuf,
    pub fix: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub to: Option<ToBackend>,
    pub online: bool,
    pub addr: Option<SocketAddr>,
    pub backup_suffix: Option<String>,
    pub no_backup: bool,
    pub dist: DistMode,
    pub ignore_epoch: bool,
    pub force_type: Option<ToBackend>,
}

pub async fn run(args: CheckArgs) -> i32 {
    match args.to {
        Some(to) => run_upgrade(&args, to).await,
        None => run_check(&args),
    }
}

fn force_backend(force_type: Option<ToBackend>) -> Option<BackendKind> {
    force_type.map(BackendKind::from)
}

/// The default subcommand: an offline pass verifying that every entry is
/// reachable from its name hash and all of its id hashes, repairing simple
/// breakage (an entry present in the walk but missing from one of its own
/// hashes) when `-fix` is set.
fn run_check(args: &CheckArgs) -> i32 {
    let backend = match config::resolve_backend(&args.database, force_backend(args.force_type)) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("cannot identify database at {}: {e}", args.database.display());
            return EXIT_FATAL;
        }
    };
    let mut store = match config::open_store(&args.database, backend) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot open database: {e}");
            return EXIT_FATAL;
        }
    };

    if !args.ignore_epoch {
        match store.getlabel() {
            Ok(label) if label.epoch <= 1 => {
                if !args.quiet {
                    println!("warning: database label {label:?} has not yet been assigned a real epoch");
                }
            }
            Err(e) => {
                eprintln!("cannot read database label: {e}");
                return EXIT_FATAL;
            }
            _ => {}
        }
    }

    let mut total = 0u64;
    let mut broken = 0u64;
    let mut repaired = 0u64;
    let mut cursor = Cursor::START;

    loop {
        let next = match vldb::next_entry(backend, store.as_mut(), cursor) {
            Ok(n) => n,
            Err(e) => {
                eprintln!("walk failed: {e}");
                return EXIT_FATAL;
            }
        };
        let (next_cursor, entry) = match next {
            Some(pair) => pair,
            None => break,
        };
        cursor = next_cursor;
        total += 1;

        let mut ok = true;
        match vldb::find_by_id(backend, store.as_mut(), entry.rw_id, IdKind::Rw) {
            Ok(Some(found)) if found.rw_id == entry.rw_id => {}
            _ => ok = false,
        }
        match vldb::find_by_name(backend, store.as_mut(), &entry.name) {
            Ok(Some(found)) if found.rw_id == entry.rw_id => {}
            _ => ok = false,
        }
        for (id, kind) in [(entry.ro_id, IdKind::Ro), (entry.bk_id, IdKind::Bk)] {
            if id == 0 {
                continue;
            }
            match vldb::find_by_id(backend, store.as_mut(), id, kind) {
                Ok(Some(found)) if found.rw_id == entry.rw_id => {}
                _ => ok = false,
            }
        }

        if !ok {
            broken += 1;
            if args.verbose && !args.quiet {
                println!("entry {} ({}) missing from one or more hashes", entry.rw_id, entry.name);
            }
            if args.fix {
                match vldb::thread(backend, store.as_mut(), entry.clone()) {
                    Ok(()) => repaired += 1,
                    Err(e) => eprintln!("could not repair entry {}: {e}", entry.rw_id),
                }
            }
        }
    }

    if !args.quiet {
        println!("{total} entries scanned, {broken} inconsistent, {repaired} repaired");
    }

    if broken == 0 {
        EXIT_OK
    } else if args.fix && repaired == broken {
        EXIT_WARNING
    } else {
        EXIT_ERROR
    }
}

/// `-to {vldb4|vldb4-kv}`: converts the database to the named back-end,
/// in place. Offline mode converts directly on disk; `-online` drives the
/// same conversion against a live server over the freeze protocol, matching
/// the client-driven sequence an operator runs by hand (`FreezeBegin` ->
/// write the candidate -> `FreezeInstall` -> `FreezeEnd`).
async fn run_upgrade(args: &CheckArgs, to: ToBackend) -> i32 {
    let dest_backend: BackendKind = to.into();
    let src_backend = match config::resolve_backend(&args.database, force_backend(args.force_type)) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("cannot identify database at {}: {e}", args.database.display());
            return EXIT_FATAL;
        }
    };
    if src_backend == dest_backend {
        eprintln!("database at {} is already {:?}", args.database.display(), dest_backend);
        return EXIT_ERROR;
    }

    if args.dist == DistMode::Required {
        warn!("-dist required was requested but this tool has no peer-distribution RPC yet; continuing without it");
    }

    if args.online {
        run_upgrade_online(args, src_backend, dest_backend).await
    } else {
        run_upgrade_offline(args, src_backend, dest_backend)
    }
}

fn run_upgrade_offline(args: &CheckArgs, src_backend: BackendKind, dest_backend: BackendKind) -> i32 {
    let candidate = sibling_with_suffix(&args.database, &format!(".CONV.{}", now_secs()));
    let new_version = match ubik::vldb::upgrade::upgrade_offline(&args.database, src_backend, &candidate, dest_backend) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("conversion failed: {e}");
            return EXIT_ERROR;
        }
    };

    if !args.no_backup {
        let suffix = args.backup_suffix.clone().unwrap_or_else(|| ".OLD".to_string());
        if let Err(e) = copy_path(&args.database, &sibling_with_suffix(&args.database, &suffix)) {
            eprintln!("backup failed: {e}");
            return EXIT_ERROR;
        }
    }

    if let Err(e) = remove_path(&args.database) {
        eprintln!("could not remove old primary database: {e}");
        return EXIT_ERROR;
    }
    if let Err(e) = std::fs::rename(&candidate, &args.database) {
        eprintln!("could not install converted database: {e}");
        return EXIT_ERROR;
    }

    if !args.quiet {
        println!("upgraded {:?} -> {:?}, new version {:?}", src_backend, dest_backend, new_version);
    }
    EXIT_OK
}

/// Drives the freeze protocol against a live server the way an operator
/// would by hand: `FreezeBegin` over RPC, build the candidate database
/// locally (this tool and the server are assumed colocated on the same
/// filesystem, as `vlserver`'s own convert tool is), `FreezeInstall`/
/// `FreezeEnd` over RPC to pivot it in.
async fn run_upgrade_online(args: &CheckArgs, src_backend: BackendKind, dest_backend: BackendKind) -> i32 {
    let addr = match args.addr {
        Some(addr) => addr,
        None => {
            eprintln!("-online requires --addr <host:port> of the running server");
            return EXIT_FATAL;
        }
    };

    let mut conn = match Connection::connect(addr).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("could not connect to {addr}: {e}");
            return EXIT_FATAL;
        }
    };

    let begin_req = DiskRequest::FreezeBegin { need_sync: true, timeout_secs: 60, read_write: true };
    let (freeze_id, old_version, db_path) = match conn.call(&Request::Disk(begin_req)).await {
        Ok(Response::Disk(DiskResponse::Frozen { freeze_id, version, db_path })) => {
            (freeze_id, Version::from(version), PathBuf::from(db_path))
        }
        Ok(Response::Disk(DiskResponse::Error { kind, message })) => {
            eprintln!("FreezeBegin failed: {kind}: {message}");
            return EXIT_ERROR;
        }
        Ok(_) => {
            eprintln!("FreezeBegin: unexpected response");
            return EXIT_FATAL;
        }
        Err(e) => {
            eprintln!("FreezeBegin failed: {e}");
            return EXIT_FATAL;
        }
    };

    let suffix = format!(".CONV.{}", now_secs());
    let candidate = sibling_with_suffix(&db_path, &suffix);
    let new_version = Version::new(old_version.epoch + 1, 1);

    let convert_result = (|| -> Result<(), Error> {
        let mut src_store = config::open_store(&db_path, src_backend)?;
        let mut dest_store = config::open_store(&candidate, dest_backend)?;
        ubik::vldb::upgrade::convert(src_store.as_mut(), src_backend, dest_store.as_mut(), dest_backend)?;
        dest_store.setlabel(new_version)?;
        dest_store.sync(ubik::storage::DB_FILE)
    })();

    if let Err(e) = convert_result {
        eprintln!("conversion failed: {e}");
        let _ = conn.call(&Request::Disk(DiskRequest::FreezeAbort { freeze_id, force: false })).await;
        return EXIT_ERROR;
    }

    let backup_suffix = if args.no_backup { None } else { Some(args.backup_suffix.clone().unwrap_or_else(|| ".OLD".to_string())) };
    let install_req = DiskRequest::FreezeInstall {
        freeze_id,
        old_version: old_version.into(),
        new_version: new_version.into(),
        new_suffix: suffix,
        backup_suffix,
    };
    if let Err(e) = conn.call(&Request::Disk(install_req)).await {
        eprintln!("FreezeInstall failed: {e}");
        return EXIT_ERROR;
    }
    if let Err(e) = conn.call(&Request::Disk(DiskRequest::FreezeEnd { freeze_id })).await {
        eprintln!("FreezeEnd failed: {e}");
        return EXIT_ERROR;
    }

    if !args.quiet {
        println!("upgraded {:?} -> {:?} online, new version {:?}", src_backend, dest_backend, new_version);
    }
    EXIT_OK
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().and_then(|n| n.to_str()).unwrap_or("db").to_string();
    name.push_str(suffix);
    path.with_file_name(name)
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn copy_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        copy_dir_recursive(src, dst)
    } else {
        std::fs::copy(src, dst).map(|_| ())
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dst_path)?;
        } else {
            std::fs::copy(entry.path(), &dst_path)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
