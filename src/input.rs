//! External event ingestion.
//!
//! An input source is how events reach every worker instance at once: each
//! process connects to the same upstream feed and broadcasts what it reads,
//! so subscribers are served no matter which instance accepted them.  The
//! shipped source speaks newline-delimited JSON over TCP and reconnects
//! with a capped backoff; anything implementing `InputSource` can be wired
//! in instead.

use crate::event::Event;
use crate::server::Server;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

/// An asynchronous producer of events. `start` binds the source to the
/// server and begins ingestion; the source calls `server.broadcast` for
/// every message it produces.
pub trait InputSource: Send + 'static {
    fn start(self: Box<Self>, server: Arc<Server>) -> JoinHandle<()>;
}

/// Reads newline-delimited JSON event objects from a TCP feed.
pub struct TcpInputSource {
    address: String,
}

impl TcpInputSource {
    pub fn new(address: impl Into<String>) -> Self {
        TcpInputSource {
            address: address.into(),
        }
    }
}

impl InputSource for TcpInputSource {
    fn start(self: Box<Self>, server: Arc<Server>) -> JoinHandle<()> {
        tokio::spawn(feed_loop(self.address, server))
    }
}

async fn feed_loop(address: String, server: Arc<Server>) {
    let mut backoff = Duration::from_secs(1);
    loop {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                info!(feed = %address, "input source connected");
                backoff = Duration::from_secs(1);
                ingest(stream, &server).await;
                warn!(feed = %address, "input source disconnected");
            }
            Err(e) => {
                warn!(feed = %address, error = %e, "input source connect failed");
            }
        }
        sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

async fn ingest(stream: TcpStream, server: &Arc<Server>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let mut event = Event::new(line);
                if event.compile() {
                    server.broadcast(event);
                } else {
                    server
                        .stats()
                        .invalid_events_rcv
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("input source produced an invalid event");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "input source read error");
                break;
            }
        }
    }
}
