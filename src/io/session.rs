//! Per-connection session task
//!
//! A session owns its socket and parser. The read loop hands every chunk
//! to the parser and writes whatever control bytes it returns; it ends on
//! a zero-length read, a fatal socket error, or the shutdown signal.

use crate::protocol::Parser;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// One analyzer connection
pub struct Session {
    socket: TcpStream,
    peer: SocketAddr,
    listener_name: String,
    port: u16,
    connected_at: DateTime<Utc>,
    parser: Box<dyn Parser>,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        listener_name: String,
        port: u16,
        parser: Box<dyn Parser>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Session {
            socket,
            peer,
            listener_name,
            port,
            connected_at: Utc::now(),
            parser,
            shutdown,
        }
    }

    /// Drive the connection until it closes or shutdown is signalled
    pub async fn run(mut self) {
        info!(
            peer = %self.peer,
            listener = %self.listener_name,
            port = self.port,
            "Analyzer connected"
        );

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!(peer = %self.peer, "Session shutting down");
                        break;
                    }
                }
                read = self.socket.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!(peer = %self.peer, "Connection closed by analyzer");
                            break;
                        }
                        Ok(n) => {
                            trace!(peer = %self.peer, bytes = n, "Data received");
                            if let Some(reply) = self.parser.handle_data(&buf[..n]) {
                                if let Err(e) = self.socket.write_all(&reply).await {
                                    warn!(peer = %self.peer, error = %e, "Reply write failed");
                                    break;
                                }
                            }
                        }
                        Err(e) if matches!(
                            e.kind(),
                            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                        ) => continue,
                        Err(e) => {
                            warn!(peer = %self.peer, error = %e, "Socket read failed");
                            break;
                        }
                    }
                }
            }
        }

        let duration = Utc::now() - self.connected_at;
        info!(
            peer = %self.peer,
            listener = %self.listener_name,
            seconds = duration.num_seconds(),
            "Analyzer disconnected"
        );
    }
}
