//! `ubikd`: the server daemon. Opens the configured physical store, replays
//! its write-ahead log, and runs the beacon, recovery and RPC-accept loops
//! side by side until told to stop.

use std::collections::HashMap;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use log::info;
use tokio::net::TcpListener;
use uuid::Uuid;

use ubik::config::ServerConfig;
use ubik::context::Context;
use ubik::freeze::FreezeGuard;
use ubik::quorum::PeerDirectory;
use ubik::recovery::Recovery;
use ubik::storage::{flat::FlatStore, kv, BackendKind, PhysicalStore};
use ubik::vote::VoteCell;
use ubik::wal;

#[derive(Debug, Parser)]
#[command(author, version, about = "Ubik replicated database server")]
struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "ubikd.json")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_hooks();
    let args = Args::parse();

    let log_dir = format!("{}/.ubikd", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = ubikd_trace::init_logging(&log_dir, &args.log_level).await?;

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading server config from {}", args.config))?;
    info!("ubikd starting, server_id={}, backend={:?}", config.server_id, config.backend);

    let mut store: Box<dyn PhysicalStore> = match config.backend {
        BackendKind::Flat => Box::new(FlatStore::open_or_create(&config.database_dir)?),
        BackendKind::Kv => Box::new(kv::open_log_cask_kv(config.database_dir.clone())?),
    };
    let label = wal::recover(store.as_mut())?;
    info!("recovered database label {:?}", label);

    let peer_ids: Vec<Uuid> = config.cell.peers.iter().map(|p| p.id).collect();
    let mut addrs: HashMap<Uuid, Vec<std::net::SocketAddr>> = HashMap::new();
    for peer in &config.cell.peers {
        addrs.insert(peer.id, peer.addrs.clone());
    }

    let vote = VoteCell::new(ubik::vote::VoteState::new(config.server_id, peer_ids));
    let directory = PeerDirectory::new(addrs);
    let listen_addr = config.listen_addr;
    let backend = config.backend;
    let ctx = Arc::new(Context::new(config.server_id, config, backend, store, label, vote, directory));
    let freeze = Arc::new(FreezeGuard::new());
    let recovery = Arc::new(Recovery::new());

    let listener = TcpListener::bind(listen_addr).await.with_context(|| format!("binding {listen_addr}"))?;
    info!("listening on {listen_addr}");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    let serve_ctx = ctx.clone();
    let serve_freeze = freeze.clone();
    let serve_task = tokio::spawn(async move { ubik::rpc::server::serve(listener, serve_ctx, serve_freeze).await });

    let recovery_ctx = ctx.clone();
    let recovery_task = tokio::spawn(ubik::rpc::server::run_recovery_loop(recovery_ctx, recovery));

    let beacon_ctx = ctx.clone();
    let beacon_task = tokio::spawn(ubik::rpc::server::run_beacon_loop(beacon_ctx));

    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    serve_task.abort();
    recovery_task.abort();
    beacon_task.abort();
    info!("ubikd shut down");
    Ok(())
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

/// Small standalone logging setup (fern + tracing-appender, mirroring
/// `ubikctl::trace`) kept inline since the `ubikd` binary has no shared lib
/// target of its own to hang a module off.
mod ubikd_trace {
    use anyhow::Result;
    use log::LevelFilter;
    use std::io::BufWriter;
    use std::io::Write;
    use std::str::FromStr;
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    const MAX_LOG_FILES: usize = 10;

    pub async fn init_logging(dir: &str, level: &str) -> Result<Vec<Box<dyn Drop + Send + Sync + 'static>>> {
        let mut guards: Vec<Box<dyn Drop + Send + Sync + 'static>> = Vec::new();

        let rolling = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("ubikd.log")
            .max_log_files(MAX_LOG_FILES)
            .build(dir)?;
        let (non_blocking, flush_guard) = tracing_appender::non_blocking(rolling);
        let buffered = BufWriter::with_capacity(64 * 1024, non_blocking);
        guards.push(Box::new(flush_guard));

        let dispatch_file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}] - {} - [{}] {}",
                    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(LevelFilter::from_str(level)?)
            .chain(Box::new(buffered) as Box<dyn Write + Send>);

        let dispatch_stderr = fern::Dispatch::new().level(LevelFilter::Warn).chain(std::io::stderr());

        let logger = fern::Dispatch::new().chain(dispatch_file).chain(dispatch_stderr);
        if logger.apply().is_err() {
            eprintln!("logger has already been set");
            return Ok(Vec::new());
        }
        Ok(guards)
    }
}
