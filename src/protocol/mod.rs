//! Wire Protocol Implementation
//!
//! This module implements the Redis-style request/reply protocol spoken by
//! ledgerkv, both on client sockets and inside the append-only file.
//!
//! ## Modules
//!
//! - `types`: [`Command`] and [`Reply`], plus their serialization
//! - `parser`: incremental decoder for commands (array and inline forms)
//!
//! ## Example
//!
//! ```
//! use ledgerkv::protocol::{parse_command, Command, Reply};
//! use bytes::Bytes;
//!
//! // Decoding incoming data
//! let data = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
//! let (command, consumed) = parse_command(data).unwrap().unwrap();
//! assert_eq!(command, Command::from_strs(&["GET", "name"]));
//! assert_eq!(consumed, data.len());
//!
//! // Encoding replies
//! let reply = Reply::bulk(Bytes::from("Ariz"));
//! assert_eq!(reply.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_command, ParseError, ParseResult};
pub use types::{Command, Reply};
