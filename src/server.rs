//! TCP server.
//!
//! Accepts clients and spawns one task per connection. Every task shares
//! the same [`CommandHandler`], and through it the same store and log.

use crate::commands::CommandHandler;
use crate::connection::{handle_connection, ConnectionStats};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, error, info};

pub struct Server {
    listener: TcpListener,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
}

impl Server {
    /// Binds the listener. No connection is accepted until [`Server::run`].
    pub async fn bind<A: ToSocketAddrs>(addr: A, handler: CommandHandler) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            handler,
            stats: Arc::new(ConnectionStats::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Accepts connections until `shutdown` completes.
    ///
    /// Connections that are already open keep running on their own tasks.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let handler = self.handler.clone();
                        let stats = Arc::clone(&self.stats);

                        tokio::spawn(async move {
                            handle_connection(stream, addr, handler, stats).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        info!(
            connections = self.stats.connections_accepted.load(Ordering::Relaxed),
            commands = self.stats.commands_processed.load(Ordering::Relaxed),
            "Stopped accepting connections"
        );
    }
}
