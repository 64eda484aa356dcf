//! KeelDB standalone server

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use keel_repl::ReplNode;
use keel_storage::Position;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod kv;
mod listeners;

use config::ServerConfig;
use kv::KvStore;
use listeners::{Server, SnapshotStub};

/// KeelDB - replicated persistent key/value server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "keel.toml")]
    config: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keel={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting KeelDB server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config);

    let config = ServerConfig::load(std::path::Path::new(&args.config))?;
    let kv = Arc::new(KvStore::new());
    let node = ReplNode::open(
        config.node_config(),
        Arc::clone(&kv) as _,
        Arc::new(SnapshotStub),
    )?;

    // rebuild applied state from the log before serving
    let reader = node.store().lock().open_for_replay(Position::ZERO)?;
    kv.recover(reader)?;
    info!(position = %node.producer_position(), keys = kv.len(), "recovery complete");

    let server = Arc::new(Server {
        node: Arc::new(node),
        kv,
        config,
        shutdown: AtomicBool::new(false),
    });
    let handles = server.start()?;
    for handle in handles {
        if handle.join().is_err() {
            anyhow::bail!("server thread panicked");
        }
    }
    Ok(())
}
