//! Listener, accept loop, and the per-connection request driver.
//!
//! Every accepted socket gets two tasks: a driver that reads request bytes,
//! feeds the HTTP parser, and routes the completed request; and a flusher
//! that drains the client's send buffer (see `client::run_flusher`).  Once a
//! client subscribes to a channel the driver keeps reading only to notice
//! hang-ups — subscribers are not expected to send anything further.

use crate::channel::{self, Channel, ChannelRegistry};
use crate::client::{self, Client};
use crate::config::Config;
use crate::event::Event;
use crate::http::{ParseStatus, RequestParser};
use crate::response::Response;
use crate::stats::{self, ServerStats};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const RECV_BUFSIZ: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

/// What the driver should do after a parser status was handled.
enum Flow {
    /// Keep reading on this connection.
    Continue,
    /// The client was admitted to a channel; stop feeding the parser.
    Subscribed,
    /// Tear the connection down immediately.
    CloseNow,
    /// Stop reading; the flusher closes once the send buffer drains.
    CloseAfterFlush,
}

pub struct Server {
    config: Config,
    channels: ChannelRegistry,
    stats: ServerStats,
}

impl Server {
    /// Build the server and eagerly create the statically configured
    /// channels. Must be called inside a tokio runtime (channel workers are
    /// spawned here).
    pub fn new(config: Config) -> Arc<Self> {
        let channels = ChannelRegistry::new(config.default_channel.clone());
        for (name, channel_config) in &config.channels {
            channels.create(name, channel_config.clone());
            info!(channel = %name, "configured channel created");
        }
        Arc::new(Server {
            config,
            channels,
            stats: ServerStats::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener =
            TcpListener::bind((self.config.server.bindip, self.config.server.port)).await?;
        Ok(listener)
    }

    /// Accept connections forever, spawning a driver per client. Accept
    /// errors (file descriptor exhaustion included) are logged and retried
    /// after a short pause.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.drive_connection(stream, addr).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Route events from an input source to their channel. The channel is
    /// resolved from the event's basepath, honoring dynamic creation.
    pub fn broadcast(&self, event: Event) -> bool {
        let name = event.basepath().to_owned();
        if name.is_empty() {
            self.stats.invalid_events_rcv.fetch_add(1, Ordering::Relaxed);
            warn!("discarding event without a channel path");
            return false;
        }
        match self.resolve_channel(&name) {
            Some(ch) => {
                ch.broadcast(&event);
                true
            }
            None => {
                warn!(channel = %name, "discarding event for unknown channel");
                false
            }
        }
    }

    fn resolve_channel(&self, name: &str) -> Option<Arc<Channel>> {
        if self.config.server.allow_undefined_channels {
            Some(self.channels.get_or_create(name))
        } else {
            self.channels.get(name)
        }
    }

    async fn drive_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        debug!(peer = %addr, "client connected");
        let (mut reader, writer) = stream.into_split();
        let client = Arc::new(Client::new(addr));
        tokio::spawn(client::run_flusher(client.clone(), writer));

        let mut parser = RequestParser::new();
        let mut buf = [0u8; RECV_BUFSIZ];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(peer = %addr, "client hung up");
                    client.mark_dead();
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %addr, error = %e, "client read error");
                    self.stats.router_read_errors.fetch_add(1, Ordering::Relaxed);
                    client.mark_dead();
                    return;
                }
            };

            // Attached subscribers should not be sending; drain and ignore.
            if client.channel().is_some() {
                continue;
            }

            match self.handle_request(&client, &mut parser, &buf[..n]) {
                Flow::Continue => {}
                Flow::Subscribed => {
                    // The handshake is done with; free the request state.
                    parser = RequestParser::new();
                }
                Flow::CloseNow => {
                    client.mark_dead();
                    return;
                }
                Flow::CloseAfterFlush => {
                    client.flush_and_destroy();
                    return;
                }
            }
        }
    }

    fn handle_request(
        &self,
        client: &Arc<Client>,
        parser: &mut RequestParser,
        data: &[u8],
    ) -> Flow {
        match parser.parse(data) {
            ParseStatus::Incomplete | ParseStatus::PostIncomplete => Flow::Continue,
            ParseStatus::Failed => {
                self.stats.invalid_http_req.fetch_add(1, Ordering::Relaxed);
                Flow::CloseNow
            }
            ParseStatus::TooBig => {
                self.stats.oversized_http_req.fetch_add(1, Ordering::Relaxed);
                Flow::CloseNow
            }
            ParseStatus::PostInvalidLength => {
                respond(client, 411, "Content-Length required.\n");
                Flow::CloseAfterFlush
            }
            ParseStatus::PostTooLarge => {
                debug!(peer = %client.addr(), "client sent too much POST data");
                respond(client, 413, "POST body too large.\n");
                Flow::CloseAfterFlush
            }
            ParseStatus::PostStart => {
                if !self.config.server.enable_post {
                    respond(client, 400, "POST is disabled.\n");
                    return Flow::CloseAfterFlush;
                }
                client.send(Response::new(100).render().as_bytes(), true);
                Flow::Continue
            }
            ParseStatus::PostOk => {
                if self.config.server.enable_post {
                    self.post_handler(client, parser);
                } else {
                    respond(client, 400, "POST is disabled.\n");
                }
                Flow::CloseAfterFlush
            }
            ParseStatus::Ok => self.route_request(client, parser),
        }
    }

    fn route_request(&self, client: &Arc<Client>, request: &RequestParser) -> Flow {
        match request.path() {
            "/" => {
                respond(client, 200, "OK\n");
                Flow::CloseAfterFlush
            }
            "/stats" => {
                let mut res = Response::new(200);
                res.header("Content-Type", "application/json");
                res.header("Cache-Control", "no-cache");
                res.body(stats::render(&self.stats, &self.channels.all()));
                client.send(res.render().as_bytes(), true);
                Flow::CloseAfterFlush
            }
            _ => {
                let name = request.basepath();
                if name.is_empty() {
                    respond(client, 404, "Channel does not exist.\n");
                    return Flow::CloseAfterFlush;
                }
                match self.resolve_channel(name) {
                    Some(ch) => {
                        ch.add_client(client.clone(), request);
                        Flow::Subscribed
                    }
                    None => {
                        respond(client, 404, "Channel does not exist.\n");
                        Flow::CloseAfterFlush
                    }
                }
            }
        }
    }

    /// Handle a completed POST: build the event with the URL path forced
    /// over the JSON one, check the publisher ACL, then broadcast.
    fn post_handler(&self, client: &Arc<Client>, request: &RequestParser) {
        let channel_path = request.path().trim_start_matches('/');
        let mut event = Event::new(request.post_data());
        event.set_path(channel_path);
        let valid = event.compile();
        let name = request.basepath();
        let peer = client.addr().ip();

        let ch = match self.channels.get(name) {
            None => {
                if !self.config.server.allow_undefined_channels {
                    respond(client, 404, "Channel does not exist.\n");
                    return;
                }
                if !channel::is_allowed_to_publish(peer, self.channels.default_config()) {
                    debug!(peer = %peer, channel = %name, "publish denied");
                    respond(client, 403, "Not allowed to publish.\n");
                    return;
                }
                if !valid {
                    self.stats.invalid_events_rcv.fetch_add(1, Ordering::Relaxed);
                    respond(client, 400, "Invalid event.\n");
                    return;
                }
                self.channels.get_or_create(name)
            }
            Some(ch) => {
                if !channel::is_allowed_to_publish(peer, ch.config()) {
                    debug!(peer = %peer, channel = %name, "publish denied");
                    respond(client, 403, "Not allowed to publish.\n");
                    return;
                }
                if !valid {
                    self.stats.invalid_events_rcv.fetch_add(1, Ordering::Relaxed);
                    respond(client, 400, "Invalid event.\n");
                    return;
                }
                ch
            }
        };

        ch.broadcast(&event);
        respond(client, 200, "");
    }
}

fn respond(client: &Client, status: u16, body: &str) {
    let mut res = Response::new(status);
    if !body.is_empty() {
        res.body(body);
    }
    client.send(res.render().as_bytes(), true);
}
