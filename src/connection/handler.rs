//! Connection Handler Module
//!
//! This module handles individual client connections to ledgerkv.
//! Each client gets its own handler task that runs in a loop,
//! reading commands and sending replies.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │      Main Loop               │
//!    │                              │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Decode buffered commands│ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Execute, queue replies  │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │  ┌─────────────────────────┐ │
//!    │  │ Flush, read more bytes  │ │
//!    │  └───────────┬─────────────┘ │
//!    │              │               │
//!    │              ▼               │
//!    │         [Loop back]          │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. Client disconnects / protocol error
//!        │
//!        ▼
//! 5. Handler task ends
//! ```
//!
//! ## Buffer Management
//!
//! We use a BytesMut buffer to accumulate incoming data. This is important
//! because TCP is a stream protocol - we might receive partial commands,
//! or multiple commands in a single read. The decoder's own size limits
//! bound how large the buffer can grow.

use crate::commands::CommandHandler;
use crate::protocol::{parse_command, Command, ParseError, Reply};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Handles a single client connection.
///
/// Generic over the byte stream, so the same loop drives a `TcpStream` in
/// production and a scripted mock in tests.
pub struct ConnectionHandler<S> {
    /// The client stream, with buffered writes
    stream: BufWriter<S>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// Scratch buffer replies are encoded into
    reply_buf: Vec<u8>,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            reply_buf: Vec::with_capacity(256),
            command_handler,
            stats,
        }
    }

    /// Runs the main connection loop.
    ///
    /// Returns `Err(ConnectionError::ClientDisconnected)` when the client
    /// closes the connection between commands, which is the normal way for
    /// a session to end.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        debug!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => debug!(client = %self.addr, "Client disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Client disconnected")
                }
                ConnectionError::Io(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by client")
                }
                _ => info!(client = %self.addr, error = %e, "Connection closed with error"),
            },
        }

        self.stats.connection_closed();
        result
    }

    /// The main read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            loop {
                match self.try_parse_command() {
                    Ok(Some(command)) => self.process(command).await?,
                    Ok(None) => break,
                    Err(e) => {
                        self.reject(&e).await;
                        return Err(ConnectionError::Parse(e));
                    }
                }
            }

            // Pipelined replies go out together
            self.stream.flush().await?;

            self.read_more_data().await?;
        }
    }

    /// Attempts to decode a command from the buffer.
    fn try_parse_command(&mut self) -> Result<Option<Command>, ParseError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match parse_command(&self.buffer) {
            Ok(Some((command, consumed))) => {
                self.buffer.advance(consumed);
                trace!(
                    client = %self.addr,
                    consumed = consumed,
                    remaining = self.buffer.len(),
                    "Parsed command"
                );
                Ok(Some(command))
            }
            Ok(None) => {
                trace!(
                    client = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete command, need more data"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error");
                Err(e)
            }
        }
    }

    async fn process(&mut self, command: Command) -> Result<(), ConnectionError> {
        // `*0` or a blank inline line: no reply
        if command.is_empty() {
            trace!(client = %self.addr, "Skipping empty command");
            return Ok(());
        }

        let reply = self.command_handler.execute(&command);
        self.stats.command_processed();

        self.write_reply(&reply).await
    }

    /// Sends a best-effort error reply before the connection is closed.
    async fn reject(&mut self, error: &ParseError) {
        let reply = Reply::error(format!("ERR Protocol error: {}", error));
        let sent = match self.write_reply(&reply).await {
            Ok(()) => self.stream.flush().await.map_err(ConnectionError::from),
            Err(e) => Err(e),
        };

        if let Err(e) = sent {
            debug!(client = %self.addr, error = %e, "Failed to send protocol error");
        }
    }

    /// Reads more data from the stream into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;

        if n == 0 {
            return if self.buffer.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                // Partial command in buffer
                Err(ConnectionError::UnexpectedEof)
            };
        }

        self.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");

        Ok(())
    }

    /// Queues a reply on the write buffer. The caller flushes.
    async fn write_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        self.reply_buf.clear();
        reply.serialize_into(&mut self.reply_buf);

        self.stream.write_all(&self.reply_buf).await?;
        self.stats.bytes_written(self.reply_buf.len());
        trace!(
            client = %self.addr,
            bytes = self.reply_buf.len(),
            "Queued reply"
        );
        Ok(())
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial command)
    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// Handles a client connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handler = ConnectionHandler::new(stream, addr, command_handler, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::io::Builder;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn create_handler() -> (CommandHandler, Arc<StorageEngine>) {
        let storage = Arc::new(StorageEngine::new());
        (CommandHandler::new(Arc::clone(&storage)), storage)
    }

    async fn run_mock(mock: tokio_test::io::Mock) -> (Result<(), ConnectionError>, Arc<StorageEngine>) {
        let (handler, storage) = create_handler();
        let stats = Arc::new(ConnectionStats::new());
        let result = ConnectionHandler::new(mock, test_addr(), handler, stats)
            .run()
            .await;
        (result, storage)
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .build();

        let (result, _) = run_mock(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_scenario_in_order() {
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .read(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .write(b"+OK\r\n")
            .read(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .write(b"$4\r\nAriz\r\n")
            .read(b"*2\r\n$3\r\nDEL\r\n$4\r\nname\r\n")
            .write(b":1\r\n")
            .read(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .write(b"$-1\r\n")
            .read(b"*1\r\n$3\r\nFOO\r\n")
            .write(b"-ERR unknown command 'FOO'\r\n")
            .build();

        let (result, storage) = run_mock(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_pipelined_commands() {
        let mock = Builder::new()
            .read(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$2\r\nv1\r\nGET k1\r\nPING\r\n")
            .write(b"+OK\r\n$2\r\nv1\r\n+PONG\r\n")
            .build();

        let (result, storage) = run_mock(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert_eq!(storage.get(&Bytes::from("k1")), Some(Bytes::from("v1")));
    }

    #[tokio::test]
    async fn test_command_split_across_reads() {
        let mock = Builder::new()
            .read(b"*3\r\n$3\r\nSET\r\n$3\r\nke")
            .read(b"y\r\n$5\r\nva")
            .read(b"lue\r\n")
            .write(b"+OK\r\n")
            .build();

        let (result, storage) = run_mock(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
        assert_eq!(storage.get(&Bytes::from("key")), Some(Bytes::from("value")));
    }

    #[tokio::test]
    async fn test_empty_commands_get_no_reply() {
        let mock = Builder::new()
            .read(b"*0\r\n\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .build();

        let (result, _) = run_mock(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_semantic_errors_keep_connection_open() {
        let mock = Builder::new()
            .read(b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n")
            .write(b"-ERR wrong number of arguments for 'set' command\r\n")
            .read(b"PING\r\n")
            .write(b"+PONG\r\n")
            .build();

        let (result, _) = run_mock(mock).await;
        assert!(matches!(result, Err(ConnectionError::ClientDisconnected)));
    }

    #[tokio::test]
    async fn test_protocol_error_replies_then_closes() {
        // The trailing PING is never answered
        let mock = Builder::new()
            .read(b"PING\r\n*-1\r\nPING\r\n")
            .write(b"+PONG\r\n-ERR Protocol error: invalid array length: -1\r\n")
            .build();

        let (result, _) = run_mock(mock).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Parse(ParseError::InvalidArrayLength(-1)))
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_command() {
        let mock = Builder::new().read(b"*2\r\n$3\r\nGET\r\n").build();

        let (result, _) = run_mock(mock).await;
        assert!(matches!(result, Err(ConnectionError::UnexpectedEof)));
    }

    async fn create_test_server() -> (SocketAddr, Arc<ConnectionStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let storage = Arc::new(StorageEngine::new());
        let stats = Arc::new(ConnectionStats::new());

        let stats_clone = Arc::clone(&stats);

        tokio::spawn(async move {
            while let Ok((stream, client_addr)) = listener.accept().await {
                let handler = CommandHandler::new(Arc::clone(&storage));
                let stats = Arc::clone(&stats_clone);
                tokio::spawn(handle_connection(stream, client_addr, handler, stats));
            }
        });

        (addr, stats)
    }

    #[tokio::test]
    async fn test_tcp_set_get() {
        let (addr, _) = create_test_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\nAriz\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");

        client
            .write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
            .await
            .unwrap();

        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$4\r\nAriz\r\n");
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, stats) = create_test_server().await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).await.unwrap();

        // Give the server time to accept the connection
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let _ = client.read(&mut buf).await.unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 14);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 7);

        drop(client);

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
