use anyhow::{Context, Result};
use argh::FromArgs;
use node_lib::config::Config;
use node_lib::upstream::{StaticUpstream, UpstreamWork};
use node_lib::{Node, util};
use sharelib::store::ShareStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(FromArgs)]
/// Share-chain node for a decentralized mining pool
struct Args {
    #[argh(option, default = "PathBuf::from(\"sharepool.toml\")")]
    /// configuration file location
    config: PathBuf,
    #[argh(option)]
    /// port to listen on for peers
    port: Option<u16>,
    #[argh(option)]
    /// directory for shares, addresses and logs
    data_dir: Option<PathBuf>,
    #[argh(switch)]
    /// write the default configuration to --config and exit
    generate_config: bool,
    #[argh(positional)]
    /// peers to stay connected to
    peers: Vec<String>,
}

fn init_tracing(data_dir: &Path) -> WorkerGuard {
    let file = tracing_appender::rolling::daily(data_dir, "node.log");
    let (writer, guard) = tracing_appender::non_blocking(file);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();
    if args.generate_config {
        Config::default().write(&args.config)?;
        println!("wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        Config::default()
    };
    if let Some(port) = args.port {
        config.p2p.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    config.p2p.connect.extend(args.peers);
    std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
        format!("cannot create data directory {}", config.storage.data_dir.display())
    })?;
    let _log_guard = init_tracing(&config.storage.data_dir);
    info!("starting {} on {}", config.p2p.sub_version, config.net.name);

    let upstream = Arc::new(StaticUpstream::new(UpstreamWork {
        version: config.upstream.version,
        previous_block: config.upstream.previous_block()?,
        bits: config.upstream.bits(),
        subsidy: config.upstream.subsidy,
        height: config.upstream.height,
        transactions: Vec::new(),
    }));
    let node = Node::new(config, upstream);
    let storage = &node.config.storage;

    let (store, replay) = ShareStore::open(
        &storage.data_dir,
        &storage.share_prefix,
        storage.segment_cap,
        &node.net,
    )?;
    let _store_writer = node.attach_store(store, replay).await;
    let addr_path = storage.addr_store_path();
    if let Err(e) = util::load_addr_store(&node, &addr_path).await {
        warn!("{e:#}, starting with an empty address book");
    }
    node.set_best_share().await;

    let port = node.config.p2p.port;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("cannot listen on port {port}"))?;
    info!("listening for peers on port {port}");

    // normally you would want to keep and join the handles
    let tasks = util::spawn_background(&node);
    let listening = tokio::spawn(util::listen(node.clone(), listener));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.cancel.cancel();
    if let Err(e) = listening.await {
        warn!("listener task failed: {e}");
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!("background task failed: {e}");
        }
    }
    util::save_addr_store(&node, &addr_path).await?;
    Ok(())
}
