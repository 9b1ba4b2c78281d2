//! Server configuration.
//!
//! Every option can be given on the command line or through a
//! `LEDGERKV_*` environment variable; the command line wins.

use crate::persistence::AofFsync;
use crate::{DEFAULT_AOF_PATH, DEFAULT_HOST, DEFAULT_PORT};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// In-memory key-value server with an append-only log.
#[derive(Parser, Debug, Clone)]
#[command(name = "ledgerkv", version)]
pub struct Config {
    /// Host to bind to
    #[arg(long, env = "LEDGERKV_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "LEDGERKV_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path of the append-only file
    #[arg(long, env = "LEDGERKV_AOF_PATH", default_value = DEFAULT_AOF_PATH)]
    pub aof_path: PathBuf,

    /// When to fsync the append-only file
    #[arg(
        long,
        env = "LEDGERKV_APPENDFSYNC",
        value_enum,
        default_value_t = AofFsync::No
    )]
    pub appendfsync: AofFsync,

    /// Keep everything in memory, without an append-only file
    #[arg(long, env = "LEDGERKV_NO_APPENDONLY")]
    pub no_appendonly: bool,

    /// Milliseconds between expiry sweeps
    #[arg(
        long,
        env = "LEDGERKV_SWEEP_INTERVAL_MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sweep_interval_ms: u64,

    /// Log filter, e.g. `info` or `ledgerkv=debug`
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn appendonly(&self) -> bool {
        !self.no_appendonly
    }
}
