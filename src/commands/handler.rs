//! Command Handler
//!
//! Dispatches decoded commands to the storage engine and, for mutations, to
//! the append-only file.
//!
//! ## Supported Commands
//!
//! - `PING` - Test connection
//! - `COMMAND` - Compatibility stub, replies `OK`
//! - `SET key value` - Set a key, clearing any expiry (logged)
//! - `GET key` - Get a key's value
//! - `DEL key` - Delete a key (logged)
//! - `EXPIRE key seconds` - Set a key's time to live (not logged)
//!
//! Only the minimum argument count is checked; extra arguments are ignored.
//!
//! ## Mutation Path
//!
//! ```text
//!   SET / DEL
//!       │
//!       ▼
//! ┌─────────────┐  append fails   ┌──────────────────┐
//! │ Aof::append │────────────────>│ -ERR failed to   │
//! └──────┬──────┘                 │ persist command  │
//!        │ ok                     └──────────────────┘
//!        ▼
//! ┌───────────────┐
//! │ StorageEngine │
//! └───────────────┘
//! ```

use crate::persistence::Aof;
use crate::protocol::{Command, Reply};
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

/// Handles commands by dispatching them to the appropriate handlers.
#[derive(Clone)]
pub struct CommandHandler {
    /// The storage engine
    storage: Arc<StorageEngine>,
    /// Log that mutations are appended to, if persistence is enabled
    aof: Option<Arc<Aof>>,
}

impl CommandHandler {
    /// Creates a handler that keeps everything in memory.
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage, aof: None }
    }

    /// Creates a handler that appends SET and DEL to `aof` before applying them.
    pub fn with_aof(storage: Arc<StorageEngine>, aof: Arc<Aof>) -> Self {
        Self {
            storage,
            aof: Some(aof),
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    /// Executes a command and returns the reply.
    ///
    /// Protocol-level problems never get here; anything wrong with the
    /// command itself comes back as an error reply.
    pub fn execute(&self, command: &Command) -> Reply {
        let verb = match command.verb() {
            Some(verb) => verb,
            None => return Reply::error("ERR empty command"),
        };

        let name = String::from_utf8_lossy(verb).to_ascii_uppercase();
        trace!(command = %name, args = command.len(), "Executing command");

        self.dispatch(&name, command)
    }

    /// Dispatches a command to its handler.
    fn dispatch(&self, name: &str, command: &Command) -> Reply {
        let args = command.args();

        match name {
            "PING" => self.cmd_ping(),
            "COMMAND" => self.cmd_command(),
            "SET" => self.cmd_set(args),
            "GET" => self.cmd_get(args),
            "DEL" => self.cmd_del(args),
            "EXPIRE" => self.cmd_expire(args),

            _ => Reply::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&args[0])
            )),
        }
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn wrong_arity(name: &str) -> Reply {
        Reply::error(format!(
            "ERR wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        ))
    }

    /// Appends `record` to the log, then runs `apply`.
    ///
    /// Without a log, `apply` just runs.
    fn persist<F>(&self, record: Command, apply: F) -> Reply
    where
        F: FnOnce() -> Reply,
    {
        let aof = match &self.aof {
            Some(aof) => aof,
            None => return apply(),
        };

        match aof.append_with(&record, apply) {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, command = %record, "Failed to append to AOF");
                Reply::error(format!("ERR failed to persist command: {}", e))
            }
        }
    }

    // ========================================================================
    // Key-Value Commands
    // ========================================================================

    /// SET key value
    fn cmd_set(&self, args: &[Bytes]) -> Reply {
        let [_, key, value, ..] = args else {
            return Self::wrong_arity("SET");
        };

        let record = Command::new(vec![
            Bytes::from_static(b"SET"),
            key.clone(),
            value.clone(),
        ]);

        self.persist(record, || {
            self.storage.set(key.clone(), value.clone());
            Reply::ok()
        })
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> Reply {
        let [_, key, ..] = args else {
            return Self::wrong_arity("GET");
        };

        match self.storage.get(key) {
            Some(value) => Reply::bulk(value),
            None => Reply::null(),
        }
    }

    /// DEL key
    ///
    /// Replies 1 whether or not the key existed.
    fn cmd_del(&self, args: &[Bytes]) -> Reply {
        let [_, key, ..] = args else {
            return Self::wrong_arity("DEL");
        };

        let record = Command::new(vec![Bytes::from_static(b"DEL"), key.clone()]);

        self.persist(record, || {
            self.storage.delete(key);
            Reply::integer(1)
        })
    }

    /// EXPIRE key seconds
    ///
    /// Replies 1 even when the key does not exist, in which case nothing
    /// happens. The TTL lives in memory only.
    fn cmd_expire(&self, args: &[Bytes]) -> Reply {
        let [_, key, seconds, ..] = args else {
            return Self::wrong_arity("EXPIRE");
        };

        let seconds = match std::str::from_utf8(seconds)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(s) => s,
            None => return Reply::error("ERR value is not an integer or out of range"),
        };

        self.storage.set_expiry(key, Duration::from_secs(seconds));
        Reply::integer(1)
    }

    // ========================================================================
    // Server Commands
    // ========================================================================

    /// PING
    fn cmd_ping(&self) -> Reply {
        Reply::pong()
    }

    /// COMMAND
    ///
    /// Clients send this on connect to discover commands; a bare `OK` is
    /// enough to keep them going.
    fn cmd_command(&self) -> Reply {
        Reply::ok()
    }
}
