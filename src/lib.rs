//! # ledgerkv - An In-Memory Key-Value Server with an Append-Only Log
//!
//! ledgerkv speaks a Redis-style request/reply protocol over TCP, keeps its
//! data in a sharded in-memory map with optional per-key expiry, and
//! survives restarts by replaying an append-only file of every SET and DEL.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              ledgerkv                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌──────────┐  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │───>│   AOF    │  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │    │ (append) │  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘    └────┬─────┘  │
//! │                                               │                │        │
//! │                                               ▼                │ replay │
//! │  ┌─────────────┐    ┌──────────────────────────────────────┐   │ at     │
//! │  │  Protocol   │    │            StorageEngine             │<──┘ start  │
//! │  │  Decoder    │    │  ┌────────┐ ┌────────┐ ┌────────┐    │            │
//! │  └─────────────┘    │  │Shard 0 │ │Shard 1 │ │...64   │    │            │
//! │                     │  └────────┘ └────────┘ └────────┘    │            │
//! │                     └──────────────────────────────────────┘            │
//! │                                       ▲                                 │
//! │                     ┌─────────────────┴─────────────────┐               │
//! │                     │  ExpirySweeper (Tokio task)       │               │
//! │                     └───────────────────────────────────┘               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use ledgerkv::commands::CommandHandler;
//! use ledgerkv::persistence::{restore, Aof, AofFsync};
//! use ledgerkv::server::Server;
//! use ledgerkv::storage::{start_expiry_sweeper, StorageEngine, DEFAULT_SWEEP_INTERVAL};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(StorageEngine::new());
//!
//!     // Rebuild the previous state before accepting clients
//!     let mut aof = Aof::open("database.aof", AofFsync::No)?;
//!     restore(&mut aof, &storage)?;
//!
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&storage), DEFAULT_SWEEP_INTERVAL);
//!
//!     let handler = CommandHandler::with_aof(storage, Arc::new(aof));
//!     let server = Server::bind("127.0.0.1:6379", handler).await?;
//!     server.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING`
//! - `COMMAND`
//! - `SET key value`
//! - `GET key`
//! - `DEL key`
//! - `EXPIRE key seconds`
//!
//! ## Module Overview
//!
//! - [`protocol`]: Command decoder and reply encoder
//! - [`storage`]: Thread-safe storage engine with TTL support
//! - [`persistence`]: Append-only file and startup replay
//! - [`commands`]: Command dispatch
//! - [`connection`]: Client connection management
//! - [`server`]: Accept loop
//! - [`config`]: Command-line and environment configuration
//!
//! ## Design Highlights
//!
//! ### Log Before Apply
//!
//! A SET or DEL is appended to the log before it touches the store, under
//! the log's lock. If the append fails the client gets an error and the
//! store is left alone, so the file always describes the store.
//!
//! ### Lazy + Active Expiry
//!
//! Keys with TTL are expired in two ways:
//! 1. **Lazy**: When a key is accessed, we check if it's expired
//! 2. **Active**: A background task periodically scans for expired keys
//!
//! Expiry is never written to the log. After a restart, keys come back
//! without their TTLs.

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::Config;
pub use connection::{handle_connection, ConnectionStats};
pub use persistence::{restore, Aof, AofError, AofFsync, ReplaySummary};
pub use protocol::{parse_command, Command, ParseError, Reply};
pub use server::Server;
pub use storage::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port ledgerkv listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host ledgerkv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// The default append-only file, relative to the working directory
pub const DEFAULT_AOF_PATH: &str = "database.aof";

/// Version of ledgerkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
