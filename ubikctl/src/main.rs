//! `ubikctl`: the offline database checker/upgrader and interactive debug
//! shell, a thin CLI over the `ubik` library the same way `kvcli`'s
//! `main.rs` is a thin CLI over `kv`.

use std::net::SocketAddr;
use std::panic;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use ubikctl::command::{self, CheckArgs, DistMode, ToBackend};
use ubikctl::session::Session;

#[derive(Debug, Parser)]
#[command(author, version, about = "Ubik VLDB checker, upgrader and debug shell")]
struct Args {
    /// Database directory (flat) or engine path (KV) to operate on.
    #[clap(long = "database")]
    database: PathBuf,

    /// Repair simple breakage found during the consistency scan.
    #[clap(long = "fix", default_value = "false")]
    fix: bool,

    #[clap(long = "quiet", short = 'q', default_value = "false")]
    quiet: bool,

    #[clap(long = "verbose", short = 'v', default_value = "false")]
    verbose: bool,

    /// Convert the database to the named back-end.
    #[clap(long = "to", value_enum)]
    to: Option<ToBackend>,

    /// Perform the conversion against a live server via the freeze protocol.
    #[clap(long = "online", default_value = "false")]
    online: bool,

    /// Address of the running server, required by `-online` and `debug`.
    #[clap(long = "addr")]
    addr: Option<SocketAddr>,

    #[clap(long = "backup-suffix")]
    backup_suffix: Option<String>,

    #[clap(long = "no-backup", default_value = "false")]
    no_backup: bool,

    #[clap(long = "dist", value_enum, default_value = "try")]
    dist: DistMode,

    #[clap(long = "ignore-epoch", default_value = "false")]
    ignore_epoch: bool,

    /// Treat the database as this back-end instead of auto-detecting it.
    #[clap(long = "force-type", value_enum)]
    force_type: Option<ToBackend>,

    /// Drop into the interactive GetVersion/Read/Write/Freeze debug shell
    /// against `--addr` instead of running the checker/upgrader.
    #[clap(long = "debug", default_value = "false")]
    debug_shell: bool,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hooks();
    let args = Args::parse();

    let log_dir = format!("{}/.ubikctl", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = ubikctl::trace::init_logging(&log_dir, &args.log_level).await?;
    info!("ubikctl starting: {:?}", &args);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    if args.debug_shell {
        let addr = args.addr.context("debug shell requires --addr <host:port>")?;
        let mut session = Session::connect(addr).await.context("connecting to server")?;
        session.run_repl(std::io::stdin().lock(), std::io::stdout()).await?;
        return Ok(());
    }

    let exit_code = command::run(CheckArgs {
        database: args.database,
        fix: args.fix,
        quiet: args.quiet,
        verbose: args.verbose,
        to: args.to,
        online: args.online,
        addr: args.addr,
        backup_suffix: args.backup_suffix,
        no_backup: args.no_backup,
        dist: args.dist,
        ignore_epoch: args.ignore_epoch,
        force_type: args.force_type,
    })
    .await;

    std::process::exit(exit_code);
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };
    let default_hook = panic::take_hook();
    if std::env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);
            let file_path = human_panic::handle_dump(&meta, info);
            let _ = human_panic::print_msg(file_path, &meta);
        }));
    }
}
