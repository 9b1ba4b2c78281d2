//! Incremental Command Decoder
//!
//! This module turns raw bytes into [`Command`]s. The same decoder is used
//! for client sockets and for replaying the append-only file.
//!
//! ## How the Decoder Works
//!
//! The decoder reads from a buffer and returns either:
//! - `Ok(Some((command, consumed)))` - Decoded a command, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the frame is incomplete
//! - `Err(ParseError)` - The bytes can never form a valid frame
//!
//! This lets the caller:
//! 1. Append incoming data to a buffer
//! 2. Call [`parse_command`] to attempt decoding
//! 3. If successful, advance the buffer by `consumed` bytes
//! 4. If incomplete, wait for more data
//! 5. If error, disconnect the client (or abort startup on replay)
//!
//! ## Accepted Framing
//!
//! A frame starting with `*` must be an array of bulk strings. Every other
//! element type is rejected rather than skipped, so the argument count can
//! never drift from the argument content.
//!
//! Any other first byte starts an inline command: one line terminated by
//! `\n` (a preceding `\r` is stripped), split on ASCII whitespace. A blank
//! line decodes to an empty command.

use crate::protocol::types::{prefix, Command, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A count or length field is not a decimal integer
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// A count or length field is not valid UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// An array element that is not a bulk string
    #[error("expected bulk string in command array, got {0:#04x}")]
    UnexpectedElement(u8),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The frame exceeds a size limit
    #[error("message too large: {size} (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for decoding operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of arguments in a single command
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum length of an inline command line
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// A `*<count>` or `$<len>` header longer than this cannot be valid.
const MAX_HEADER_SIZE: usize = 32;

/// Attempts to decode one command from the front of `buf`.
///
/// # Example
///
/// ```
/// use ledgerkv::protocol::parse_command;
///
/// let input = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
/// let (cmd, consumed) = parse_command(input).unwrap().unwrap();
/// assert!(cmd.is("GET"));
/// assert_eq!(consumed, input.len());
///
/// // Half a frame is not an error, just not enough data yet
/// assert!(parse_command(&input[..10]).unwrap().is_none());
/// ```
pub fn parse_command(buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
    match buf.first() {
        None => Ok(None),
        Some(&prefix::ARRAY) => parse_array(buf),
        Some(_) => parse_inline(buf),
    }
}

/// Parses an array of bulk strings: `*<count>\r\n<elements...>`
fn parse_array(buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
    debug_assert!(buf[0] == prefix::ARRAY);

    let (count, mut consumed) = match parse_header(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };

    if count < 0 {
        return Err(ParseError::InvalidArrayLength(count));
    }

    let count = count as usize;
    if count > MAX_ARRAY_LEN {
        return Err(ParseError::MessageTooLarge {
            size: count,
            max: MAX_ARRAY_LEN,
        });
    }

    // Don't trust the declared count for the allocation
    let mut args = Vec::with_capacity(count.min(16));

    for _ in 0..count {
        let rest = &buf[consumed..];
        match rest.first() {
            None => return Ok(None),
            Some(&prefix::BULK_STRING) => {}
            Some(&other) => return Err(ParseError::UnexpectedElement(other)),
        }

        match parse_bulk_string(rest)? {
            Some((data, element_consumed)) => {
                args.push(data);
                consumed += element_consumed;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((Command::new(args), consumed)))
}

/// Parses a bulk string: `$<length>\r\n<data>\r\n`
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
    debug_assert!(buf[0] == prefix::BULK_STRING);

    let (length, data_start) = match parse_header(buf)? {
        Some(header) => header,
        None => return Ok(None),
    };

    // Commands never carry null bulk strings, so -1 is as invalid as -2
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total_needed = data_start + length + 2;
    if buf.len() < total_needed {
        return Ok(None);
    }

    if &buf[data_start + length..total_needed] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
    Ok(Some((data, total_needed)))
}

/// Parses a `<prefix><integer>\r\n` header line.
///
/// Returns the integer and the number of bytes the header occupies.
fn parse_header(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    let end = match find_crlf(&buf[1..]) {
        Some(pos) => pos,
        None if buf.len() > MAX_HEADER_SIZE => {
            return Err(ParseError::ProtocolError(
                "length header is not terminated".to_string(),
            ))
        }
        None => return Ok(None),
    };

    let digits =
        std::str::from_utf8(&buf[1..1 + end]).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

    let n: i64 = digits
        .parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(format!("{:?}: {}", digits, e)))?;

    Ok(Some((n, 1 + end + 2)))
}

/// Parses an inline command: `GET key\r\n` or `GET key\n`
fn parse_inline(buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
    let newline = match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None if buf.len() > MAX_INLINE_SIZE => {
            return Err(ParseError::MessageTooLarge {
                size: buf.len(),
                max: MAX_INLINE_SIZE,
            })
        }
        None => return Ok(None),
    };

    let line = match buf[..newline].last() {
        Some(b'\r') => &buf[..newline - 1],
        _ => &buf[..newline],
    };

    let args = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();

    Ok(Some((Command::new(args), newline + 1)))
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}
