//! Named channels: subscriber lists, the event ring cache, and fan-out.
//!
//! Every channel owns an unbounded message queue drained by a single worker
//! task, so events broadcast to a channel reach each subscriber in enqueue
//! order.  Subscriber admission and `Last-Event-ID` replay travel through
//! the same queue, which keeps replayed history ordered against live
//! broadcasts without any extra coordination.

use crate::client::{Client, SubscriptionKind};
use crate::config::ChannelConfig;
use crate::event::Event;
use crate::http::RequestParser;
use crate::response::Response;
use crate::stats::ChannelSnapshot;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ChannelCounters {
    pub num_broadcasted_events: AtomicU64,
    pub num_connects: AtomicU64,
    pub num_disconnects: AtomicU64,
    pub num_errors: AtomicU64,
}

#[derive(Debug)]
struct CachedEvent {
    id: String,
    data: String,
}

enum ChannelMessage {
    /// A serialized event to fan out. `target` is the event subpath; when
    /// non-empty only clients subscribed on that subpath receive it.
    Event {
        id: Option<String>,
        data: String,
        target: String,
    },
    /// Admit a client to the subscriber list, replaying cached history
    /// newer than `last_id` first when one is given.
    Subscribe {
        client: Arc<Client>,
        last_id: Option<String>,
    },
}

pub struct Channel {
    id: String,
    config: ChannelConfig,
    clients: RwLock<Vec<Arc<Client>>>,
    cache: Mutex<VecDeque<CachedEvent>>,
    queue: mpsc::UnboundedSender<ChannelMessage>,
    counters: ChannelCounters,
}

impl Channel {
    /// Create the channel and start its fan-out worker.
    pub fn new(id: &str, config: ChannelConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel {
            id: id.to_owned(),
            config,
            clients: RwLock::new(Vec::new()),
            cache: Mutex::new(VecDeque::new()),
            queue: tx,
            counters: ChannelCounters::default(),
        });
        tokio::spawn(fanout_worker(channel.clone(), rx));
        channel
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn counters(&self) -> &ChannelCounters {
        &self.counters
    }

    pub fn num_clients(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Admit a subscriber: send the SSE preamble, record its filters and
    /// subpath, and hand it to the fan-out worker (which performs the list
    /// insert and any requested history replay in queue order).
    pub fn add_client(&self, client: Arc<Client>, request: &RequestParser) {
        let mut preamble = Response::new(200);
        preamble.header("Content-Type", "text/event-stream");
        preamble.header("Cache-Control", "no-cache");
        preamble.header("Connection", "keep-alive");
        if let Some(origin) = self.cors_origin(request.header("origin")) {
            preamble.header("Access-Control-Allow-Origin", &origin);
        }
        client.send(preamble.render().as_bytes(), true);

        if let Some(raw) = request.query_param("event") {
            for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                client.subscribe(key, SubscriptionKind::EventType);
            }
        }
        if let Some(raw) = request.query_param("id") {
            for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                client.subscribe(key, SubscriptionKind::Id);
            }
        }

        client.set_channel(&self.id);
        client.set_subpath(request.subpath());
        self.counters.num_connects.fetch_add(1, Ordering::Relaxed);

        let last_id = request
            .header("last-event-id")
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        debug!(channel = %self.id, peer = %client.addr(), "subscriber admitted");
        let _ = self.queue.send(ChannelMessage::Subscribe { client, last_id });
    }

    /// Queue a compiled event for fan-out.
    pub fn broadcast(&self, event: &Event) {
        let data = event.serialize();
        if data.is_empty() {
            warn!(channel = %self.id, "dropping event that serializes to nothing");
            return;
        }
        let _ = self.queue.send(ChannelMessage::Event {
            id: event.id().map(str::to_owned),
            data,
            target: event.subpath().to_owned(),
        });
    }

    /// Resolve the CORS response header for a subscriber's Origin, if the
    /// channel admits it.
    fn cors_origin(&self, request_origin: Option<&str>) -> Option<String> {
        let origins = &self.config.allowed_origins;
        if origins.is_empty() {
            return None;
        }
        if origins.iter().any(|o| o == "*") {
            return Some("*".to_owned());
        }
        request_origin
            .filter(|req| origins.iter().any(|o| o == req))
            .map(str::to_owned)
    }

    pub fn stats_snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            id: self.id.clone(),
            clients: self.num_clients() as u64,
            broadcasted_events: self.counters.num_broadcasted_events.load(Ordering::Relaxed),
            cached_events: self.cache.lock().unwrap().len() as u64,
            cache_size: self.config.cache_length as u64,
            total_connects: self.counters.num_connects.load(Ordering::Relaxed),
            total_disconnects: self.counters.num_disconnects.load(Ordering::Relaxed),
            client_errors: self.counters.num_errors.load(Ordering::Relaxed),
        }
    }

    fn cache_insert(&self, id: Option<String>, data: &str) {
        let Some(id) = id else { return };
        if self.config.cache_length == 0 {
            return;
        }
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= self.config.cache_length {
            cache.pop_front();
        }
        cache.push_back(CachedEvent {
            id,
            data: data.to_owned(),
        });
    }

    /// Replay cached events strictly newer than `last_id` to one client, in
    /// cache order, capped at the channel's history limit. An unknown id
    /// replays nothing.
    fn replay_to(&self, client: &Arc<Client>, last_id: &str) {
        let cache = self.cache.lock().unwrap();
        let Some(pos) = cache.iter().position(|e| e.id == last_id) else {
            return;
        };
        let pending: Vec<&CachedEvent> = cache.iter().skip(pos + 1).collect();
        let limit = self.config.history_limit;
        let start = if limit > 0 && pending.len() > limit {
            pending.len() - limit
        } else {
            0
        };
        for cached in &pending[start..] {
            if client.is_filter_acceptable(&cached.data) {
                client.send(cached.data.as_bytes(), true);
            }
        }
    }

    fn reap_dead(&self) {
        let mut clients = self.clients.write().unwrap();
        let before = clients.len();
        clients.retain(|c| !c.is_dead());
        let removed = (before - clients.len()) as u64;
        if removed > 0 {
            self.counters
                .num_disconnects
                .fetch_add(removed, Ordering::Relaxed);
            debug!(channel = %self.id, removed, "reaped dead subscribers");
        }
    }
}

async fn fanout_worker(channel: Arc<Channel>, mut queue: mpsc::UnboundedReceiver<ChannelMessage>) {
    while let Some(message) = queue.recv().await {
        match message {
            ChannelMessage::Subscribe { client, last_id } => {
                channel.clients.write().unwrap().push(client.clone());
                if let Some(last_id) = last_id {
                    channel.replay_to(&client, &last_id);
                }
            }
            ChannelMessage::Event { id, data, target } => {
                channel.cache_insert(id, &data);
                channel
                    .counters
                    .num_broadcasted_events
                    .fetch_add(1, Ordering::Relaxed);

                let mut saw_dead = false;
                {
                    let clients = channel.clients.read().unwrap();
                    for client in clients.iter() {
                        if client.is_dead() {
                            saw_dead = true;
                            continue;
                        }
                        if !target.is_empty() && client.subpath() != target {
                            continue;
                        }
                        if !client.is_filter_acceptable(&data) {
                            continue;
                        }
                        let dropped = client.send(data.as_bytes(), true);
                        if dropped > 0 {
                            channel
                                .counters
                                .num_errors
                                .fetch_add(dropped as u64, Ordering::Relaxed);
                        }
                    }
                }
                if saw_dead {
                    channel.reap_dead();
                }
            }
        }
    }
}

/// Publisher ACL: an empty range list admits anyone; otherwise the peer
/// address must fall inside one of the configured ranges.
pub fn is_allowed_to_publish(peer: IpAddr, config: &ChannelConfig) -> bool {
    if config.allowed_publishers.is_empty() {
        return true;
    }
    config.allowed_publishers.iter().any(|net| net.contains(&peer))
}

// ---------------------------------------------------------------------------
// Channel registry
// ---------------------------------------------------------------------------

/// All channels by id. Channels are created eagerly from static config or
/// lazily on demand, and live until process exit.
pub struct ChannelRegistry {
    map: RwLock<HashMap<String, Arc<Channel>>>,
    default_config: ChannelConfig,
}

impl ChannelRegistry {
    pub fn new(default_config: ChannelConfig) -> Self {
        ChannelRegistry {
            map: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    pub fn default_config(&self) -> &ChannelConfig {
        &self.default_config
    }

    /// Create a channel with an explicit config (startup path).
    pub fn create(&self, id: &str, config: ChannelConfig) -> Arc<Channel> {
        let mut map = self.map.write().unwrap();
        map.entry(id.to_owned())
            .or_insert_with(|| Channel::new(id, config))
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.map.read().unwrap().get(id).cloned()
    }

    /// Fetch a channel, creating it from the default config if absent.
    pub fn get_or_create(&self, id: &str) -> Arc<Channel> {
        {
            let map = self.map.read().unwrap();
            if let Some(ch) = map.get(id) {
                return ch.clone();
            }
        }
        self.create(id, self.default_config.clone())
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<Arc<Channel>> = self.map.read().unwrap().values().cloned().collect();
        channels.sort_by(|a, b| a.id().cmp(b.id()));
        channels
    }
}
