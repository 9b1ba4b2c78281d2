//! Wire Protocol Data Types
//!
//! This module defines the two values that cross the wire:
//!
//! - [`Command`]: what a client (or the append-only file) sends us, an
//!   ordered list of arguments whose first element is the verb.
//! - [`Reply`]: what we send back, exactly one per command.
//!
//! ## Protocol Format
//!
//! Each frame starts with a type prefix byte:
//! - `+` Status
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array (requests and log records only)
//!
//! All frames are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Status: `+OK\r\n`
//! Error: `-ERR unknown command 'FOO'\r\n`
//! Integer: `:1\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Null Bulk String: `$-1\r\n`
//! Command: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// The CRLF terminator used by the protocol
pub const CRLF: &[u8] = b"\r\n";

/// Protocol type prefixes
pub mod prefix {
    pub const STATUS: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A reply sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Short success string, e.g. `OK` or `PONG`.
    /// Format: `+<text>\r\n`
    Status(String),

    /// Error message.
    /// Format: `-<message>\r\n`
    Error(String),

    /// 64-bit signed integer.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Present value, possibly empty. Binary-safe.
    /// Format: `$<length>\r\n<data>\r\n`
    Bulk(Bytes),

    /// Missing value marker.
    /// Format: `$-1\r\n`
    Null,
}

impl Reply {
    /// Creates a new status reply.
    ///
    /// # Example
    /// ```
    /// use ledgerkv::protocol::Reply;
    /// let ok = Reply::status("OK");
    /// assert_eq!(ok.serialize(), b"+OK\r\n");
    /// ```
    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    /// Creates a new error reply.
    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    /// Creates a new bulk string reply.
    ///
    /// # Example
    /// ```
    /// use ledgerkv::protocol::Reply;
    /// use bytes::Bytes;
    /// let bulk = Reply::bulk(Bytes::from("hello"));
    /// assert_eq!(bulk.serialize(), b"$5\r\nhello\r\n");
    /// ```
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn null() -> Self {
        Reply::Null
    }

    /// Common reply for successful operations
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn pong() -> Self {
        Reply::Status("PONG".to_string())
    }

    /// Serializes the reply to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                buf.push(prefix::STATUS);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Bulk(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Reply::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Reply::Null => write!(f, "(nil)"),
        }
    }
}

/// A decoded client command.
///
/// The first argument is the verb. Arguments are raw bytes, so values may
/// contain anything the bulk string framing can carry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(args: Vec<Bytes>) -> Self {
        Self { args }
    }

    /// Builds a command from string slices.
    ///
    /// # Example
    /// ```
    /// use ledgerkv::protocol::Command;
    /// let cmd = Command::from_strs(&["SET", "name", "Ariz"]);
    /// assert_eq!(cmd.len(), 3);
    /// ```
    pub fn from_strs(args: &[&str]) -> Self {
        Self {
            args: args
                .iter()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect(),
        }
    }

    /// The verb, as sent (no case folding).
    pub fn verb(&self) -> Option<&Bytes> {
        self.args.first()
    }

    /// Returns true if the verb matches `name`, ignoring ASCII case.
    pub fn is(&self, name: &str) -> bool {
        self.verb()
            .map(|v| v.eq_ignore_ascii_case(name.as_bytes()))
            .unwrap_or(false)
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of arguments, verb included.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Serializes the command as an array of bulk strings.
    ///
    /// This is the only form written to the append-only file; the inline
    /// form is never produced.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.serialize_into(&mut buf);
        buf.freeze()
    }

    pub fn serialize_into(&self, buf: &mut BytesMut) {
        buf.put_u8(prefix::ARRAY);
        buf.put_slice(self.args.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        for arg in &self.args {
            buf.put_u8(prefix::BULK_STRING);
            buf.put_slice(arg.len().to_string().as_bytes());
            buf.put_slice(CRLF);
            buf.put_slice(arg);
            buf.put_slice(CRLF);
        }
    }

    /// Upper bound on the size of the serialized form.
    fn encoded_len(&self) -> usize {
        // prefix + up to 20 digits + CRLF per header
        let header = 1 + 20 + 2;
        header + self.args.iter().map(|a| header + a.len() + 2).sum::<usize>()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}
