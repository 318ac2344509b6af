//! Strata Monitor - cluster map authority daemon
//!
//! Serves the authoritative monitor and target maps. Startup loads the
//! monitor store, validates our identity against the stored monitor
//! map, and binds the listen address; `--mkfs` initializes a fresh
//! store instead. SIGTERM drains and exits cleanly.

mod store;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use store::MonitorStore;
use strata_common::{config::env_args, Fsid, TargetAddr};
use strata_map::MonMap;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-mon")]
#[command(about = "Strata cluster monitor daemon")]
#[command(version)]
struct Args {
    /// Monitor store directory
    #[arg(short, long, default_value = "/var/lib/strata/mon")]
    store: PathBuf,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/strata/strata.toml")]
    config: String,

    /// Listen address override (defaults to our monitor map entry)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Initialize a fresh monitor store and exit
    #[arg(long)]
    mkfs: bool,

    /// Cluster fsid for --mkfs (random when omitted)
    #[arg(long)]
    fsid: Option<String>,

    /// Monitor addresses for --mkfs, in rank order
    #[arg(long = "mon")]
    mons: Vec<String>,

    /// Our rank for --mkfs
    #[arg(long, default_value = "0")]
    rank: u32,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    monitor: MonSection,
    #[serde(default)]
    logging: LogSection,
}

#[derive(Debug, Deserialize, Default)]
struct MonSection {
    #[serde(default)]
    store: Option<PathBuf>,
    #[serde(default)]
    listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LogSection {
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // STRATA_ARGS come first so explicit flags win
    let mut argv: Vec<String> = std::env::args().take(1).collect();
    argv.extend(env_args());
    argv.extend(std::env::args().skip(1));
    let args = Args::parse_from(argv);

    let config: FileConfig = if std::path::Path::new(&args.config).exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&text).unwrap_or_else(|e| {
            eprintln!("warning: failed to parse config file: {e}");
            FileConfig::default()
        })
    } else {
        FileConfig::default()
    };

    let log_level = if args.log_level != "info" {
        args.log_level.clone()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store_dir = config.monitor.store.unwrap_or_else(|| args.store.clone());

    if args.mkfs {
        return mkfs(&store_dir, &args);
    }

    let store = match MonitorStore::open(&store_dir) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot open monitor store in {}: {e}", store_dir.display());
            std::process::exit(1);
        }
    };

    // identity and monitor map are required; a store without them was
    // never initialized
    let whoami = match store.get_u32("whoami") {
        Ok(w) => w,
        Err(e) => {
            error!("monitor store missing 'whoami': {e}");
            std::process::exit(1);
        }
    };
    let monmap = match store.get("monmap").and_then(|b| MonMap::decode(&b)) {
        Ok(m) => m,
        Err(e) => {
            error!("monitor store missing or corrupt 'monmap': {e}");
            std::process::exit(1);
        }
    };
    if monmap.addr_of(whoami).is_err() {
        error!("mon{whoami} does not exist in monitor map of {} monitors", monmap.len());
        std::process::exit(1);
    }

    let listen = args
        .listen
        .or(config.monitor.listen)
        .map_or_else(
            || Ok(monmap.addr_of(whoami).expect("validated above").to_socket()),
            |l| l.parse(),
        )
        .context("invalid listen address")?;

    info!(
        "starting mon{whoami} for cluster {} at {listen} from {}",
        monmap.fsid,
        store_dir.display()
    );

    let listener = match TcpListener::bind(listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind {listen}: {e}");
            std::process::exit(1);
        }
    };

    // serve until asked to stop; peers speak the map protocols over
    // the messenger layered on these connections
    let accept_loop = async {
        loop {
            match listener.accept().await {
                Ok((_sock, peer)) => info!(%peer, "peer connected"),
                Err(e) => warn!("accept error: {e}"),
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = shutdown_signal() => {
            info!("shutdown requested, draining");
        }
    }

    info!("mon{whoami} shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

/// Initialize a monitor store: generate the monitor map, record our
/// rank, and leave everything ready for the first start.
fn mkfs(store_dir: &PathBuf, args: &Args) -> anyhow::Result<()> {
    if args.mons.is_empty() {
        bail!("--mkfs requires at least one --mon address");
    }
    let fsid = match &args.fsid {
        Some(s) => s.parse::<Fsid>().map_err(|e| anyhow::anyhow!("{e}"))?,
        None => Fsid::generate(),
    };
    let addrs: Vec<TargetAddr> = args
        .mons
        .iter()
        .map(|m| m.parse())
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("bad --mon address: {e}"))?;
    if args.rank as usize >= addrs.len() {
        bail!("rank {} out of range for {} monitors", args.rank, addrs.len());
    }

    let monmap = MonMap::new(fsid, &addrs);
    let store = MonitorStore::open(store_dir).map_err(|e| anyhow::anyhow!("{e}"))?;
    store
        .put("monmap", &monmap.encode())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    store
        .put_u32("whoami", args.rank)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    info!(
        "initialized mon{} store for cluster {fsid} with {} monitors in {}",
        args.rank,
        monmap.len(),
        store_dir.display()
    );
    Ok(())
}
