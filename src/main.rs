//! ledgerkv - An In-Memory Key-Value Server with an Append-Only Log
//!
//! This is the main entry point for the ledgerkv server.
//! It restores the store from the append-only file, starts the expiry
//! sweeper, and serves clients until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use ledgerkv::commands::CommandHandler;
use ledgerkv::config::Config;
use ledgerkv::persistence::{restore, Aof};
use ledgerkv::server::Server;
use ledgerkv::storage::{start_expiry_sweeper, StorageEngine};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &Config, addr: &str) {
    println!(
        r#"
ledgerkv v{} - In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Listening on   {}
Append-only    {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        ledgerkv::VERSION,
        addr,
        if config.appendonly() {
            format!("{} (fsync: {})", config.aof_path.display(), config.appendfsync)
        } else {
            "disabled".to_string()
        }
    );
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|e| {
        eprintln!("Invalid log filter {:?} ({}), using \"info\"", filter, e);
        EnvFilter::new("info")
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping server...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level);

    // Create the storage engine (shared across all connections)
    let storage = Arc::new(StorageEngine::new());

    // Replay the log before the listener exists
    let aof = if config.appendonly() {
        let mut aof = Aof::open(&config.aof_path, config.appendfsync).with_context(|| {
            format!("failed to open AOF at {}", config.aof_path.display())
        })?;

        let summary = restore(&mut aof, &storage).with_context(|| {
            format!("failed to replay AOF at {}", config.aof_path.display())
        })?;

        if summary.skipped > 0 {
            info!(skipped = summary.skipped, "Some AOF records were not applied");
        }
        Some(Arc::new(aof))
    } else {
        info!("Append-only file disabled, data will not survive a restart");
        None
    };

    let handler = match &aof {
        Some(aof) => CommandHandler::with_aof(Arc::clone(&storage), Arc::clone(aof)),
        None => CommandHandler::new(Arc::clone(&storage)),
    };

    let sweeper = start_expiry_sweeper(Arc::clone(&storage), config.sweep_interval());

    let server = Server::bind(config.bind_address(), handler)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    let addr = server.local_addr()?;

    print_banner(&config, &addr.to_string());
    info!(addr = %addr, keys = storage.len(), "Server started");

    server.run(shutdown_signal()).await;

    sweeper.stop();

    if let Some(aof) = aof {
        aof.sync().context("failed to sync AOF on shutdown")?;
        info!(bytes = aof.len(), "AOF synced");
    }

    info!("Server shutdown complete");
    Ok(())
}
