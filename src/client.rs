//! One connected TCP peer.
//!
//! A `Client` is shared between its connection driver task, at most one
//! channel's subscriber list, and any fan-out sweep currently touching it.
//! All outbound bytes go through the send buffer; a dedicated flusher task
//! owns the socket write half and drains the buffer whenever it is woken.
//! Teardown is two-phase: `mark_dead` flags the client so sweeps skip it and
//! the flusher exits, and the channel reaps it on its next pass.

use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;

/// Ceiling on buffered unsent bytes per client. Above this, whole SSE
/// records are dropped from the head of the buffer.
pub const SEND_BUFFER_LIMIT: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    EventType,
    Id,
}

#[derive(Debug)]
struct Subscription {
    key: String,
    kind: SubscriptionKind,
}

#[derive(Debug)]
pub struct Client {
    addr: SocketAddr,
    sndbuf: Mutex<BytesMut>,
    wakeup: Notify,
    dead: AtomicBool,
    destroy_after_flush: AtomicBool,
    channel: OnceLock<String>,
    subpath: OnceLock<String>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Client {
    pub fn new(addr: SocketAddr) -> Self {
        Client {
            addr,
            sndbuf: Mutex::new(BytesMut::new()),
            wakeup: Notify::new(),
            dead: AtomicBool::new(false),
            destroy_after_flush: AtomicBool::new(false),
            channel: OnceLock::new(),
            subpath: OnceLock::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Append `data` to the send buffer and, when `flush` is set, wake the
    /// flusher. Returns the number of whole SSE records dropped from the
    /// head to keep the buffer under `SEND_BUFFER_LIMIT`.
    pub fn send(&self, data: &[u8], flush: bool) -> usize {
        let dropped;
        {
            let mut buf = self.sndbuf.lock().unwrap();
            buf.extend_from_slice(data);
            dropped = prune_records(&mut buf);
        }
        if flush {
            self.wakeup.notify_one();
        }
        dropped
    }

    /// Take everything currently buffered, leaving the buffer empty.
    pub fn take_pending(&self) -> Bytes {
        let mut buf = self.sndbuf.lock().unwrap();
        buf.split().freeze()
    }

    pub fn pending_len(&self) -> usize {
        self.sndbuf.lock().unwrap().len()
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Ask the flusher to close the connection once the buffer drains.
    pub fn flush_and_destroy(&self) {
        self.destroy_after_flush.store(true, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    pub fn is_destroy_after_flush(&self) -> bool {
        self.destroy_after_flush.load(Ordering::SeqCst)
    }

    /// Bind the client to a channel. Set at most once, on admission.
    pub fn set_channel(&self, id: &str) {
        let _ = self.channel.set(id.to_owned());
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.get().map(String::as_str)
    }

    pub fn set_subpath(&self, subpath: &str) {
        let _ = self.subpath.set(subpath.to_owned());
    }

    /// Subpath the client subscribed on; empty means the channel root.
    pub fn subpath(&self) -> &str {
        self.subpath.get().map(String::as_str).unwrap_or("")
    }

    pub fn subscribe(&self, key: &str, kind: SubscriptionKind) {
        if self.is_subscribed(key, kind) {
            return;
        }
        self.subscriptions.lock().unwrap().push(Subscription {
            key: key.to_owned(),
            kind,
        });
    }

    pub fn is_subscribed(&self, key: &str, kind: SubscriptionKind) -> bool {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.kind == kind && s.key == key)
    }

    /// Check a serialized SSE frame against the client's filters. For each
    /// kind with at least one subscription, the frame's corresponding field
    /// must match one of the subscribed keys.
    pub fn is_filter_acceptable(&self, frame: &str) -> bool {
        let subs = self.subscriptions.lock().unwrap();
        let wants_event = subs.iter().any(|s| s.kind == SubscriptionKind::EventType);
        let wants_id = subs.iter().any(|s| s.kind == SubscriptionKind::Id);
        if !wants_event && !wants_id {
            return true;
        }

        if wants_event {
            let matched = sse_field(frame, "event").is_some_and(|v| {
                subs.iter()
                    .any(|s| s.kind == SubscriptionKind::EventType && s.key == v)
            });
            if !matched {
                return false;
            }
        }
        if wants_id {
            let matched = sse_field(frame, "id").is_some_and(|v| {
                subs.iter()
                    .any(|s| s.kind == SubscriptionKind::Id && s.key == v)
            });
            if !matched {
                return false;
            }
        }
        true
    }
}

/// Drive one client's socket writes: drain the send buffer whenever woken,
/// until the client dies or a requested flush-and-destroy completes.
pub async fn run_flusher(client: std::sync::Arc<Client>, mut writer: OwnedWriteHalf) {
    loop {
        if client.is_dead() {
            break;
        }
        let pending = client.take_pending();
        if pending.is_empty() {
            if client.is_destroy_after_flush() {
                let _ = writer.shutdown().await;
                client.mark_dead();
                break;
            }
            client.wakeup.notified().await;
            continue;
        }
        if writer.write_all(&pending).await.is_err() {
            client.mark_dead();
            break;
        }
    }
}

/// Drop whole SSE records (terminated by a blank line) from the head of
/// `buf` until it fits `SEND_BUFFER_LIMIT`. A single record larger than the
/// limit is kept; records are never split mid-frame.
fn prune_records(buf: &mut BytesMut) -> usize {
    let mut dropped = 0;
    while buf.len() > SEND_BUFFER_LIMIT {
        match record_end(buf) {
            Some(end) if end < buf.len() => {
                buf.advance(end);
                dropped += 1;
            }
            _ => break,
        }
    }
    dropped
}

fn record_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2)
}

/// Extract the value of the first `<field>: ` line of a serialized frame.
fn sse_field<'a>(frame: &'a str, field: &str) -> Option<&'a str> {
    let prefix = format!("{field}: ");
    frame.lines().find_map(|line| line.strip_prefix(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client::new("127.0.0.1:12345".parse().unwrap())
    }

    fn record(id: usize, payload_len: usize) -> String {
        format!("id: {id}\ndata: {}\n\n", "x".repeat(payload_len))
    }

    #[test]
    fn send_accumulates_until_taken() {
        let c = client();
        c.send(b"id: 1\ndata: a\n\n", true);
        c.send(b"id: 2\ndata: b\n\n", false);
        assert_eq!(c.pending_len(), 30);
        let taken = c.take_pending();
        assert_eq!(&taken[..], b"id: 1\ndata: a\n\nid: 2\ndata: b\n\n");
        assert_eq!(c.pending_len(), 0);
        assert!(c.take_pending().is_empty());
    }

    #[test]
    fn oversized_buffer_drops_whole_records_from_the_head() {
        let c = client();
        let mut dropped = 0;
        for i in 0..6 {
            dropped += c.send(record(i, 300 * 1024).as_bytes(), false);
        }
        assert!(dropped > 0);
        assert!(c.pending_len() <= SEND_BUFFER_LIMIT);
        // The head of the remaining buffer is a frame boundary.
        let remaining = c.take_pending();
        assert!(remaining.starts_with(b"id: "));
        assert!(remaining.ends_with(b"\n\n"));
    }

    #[test]
    fn a_single_record_larger_than_the_limit_is_kept_whole() {
        let c = client();
        let big = record(1, SEND_BUFFER_LIMIT + 1024);
        let dropped = c.send(big.as_bytes(), false);
        assert_eq!(dropped, 0);
        assert_eq!(c.pending_len(), big.len());
    }

    #[test]
    fn no_filters_accepts_everything() {
        let c = client();
        assert!(c.is_filter_acceptable("id: 1\ndata: x\n\n"));
        assert!(c.is_filter_acceptable("data: x\n\n"));
    }

    #[test]
    fn event_filter_matches_only_subscribed_types() {
        let c = client();
        c.subscribe("alert", SubscriptionKind::EventType);
        c.subscribe("warn", SubscriptionKind::EventType);
        assert!(c.is_filter_acceptable("event: alert\ndata: x\n\n"));
        assert!(c.is_filter_acceptable("event: warn\ndata: x\n\n"));
        assert!(!c.is_filter_acceptable("event: info\ndata: x\n\n"));
        // Frame without an event field fails an active event filter.
        assert!(!c.is_filter_acceptable("data: x\n\n"));
    }

    #[test]
    fn id_filter_is_independent_of_event_filter() {
        let c = client();
        c.subscribe("7", SubscriptionKind::Id);
        assert!(c.is_filter_acceptable("id: 7\nevent: anything\ndata: x\n\n"));
        assert!(!c.is_filter_acceptable("id: 8\ndata: x\n\n"));

        c.subscribe("alert", SubscriptionKind::EventType);
        assert!(c.is_filter_acceptable("id: 7\nevent: alert\ndata: x\n\n"));
        assert!(!c.is_filter_acceptable("id: 7\nevent: info\ndata: x\n\n"));
        assert!(!c.is_filter_acceptable("id: 8\nevent: alert\ndata: x\n\n"));
    }

    #[test]
    fn data_lines_do_not_shadow_field_lines() {
        let c = client();
        c.subscribe("alert", SubscriptionKind::EventType);
        assert!(!c.is_filter_acceptable("data: event: alert\n\n"));
    }

    #[test]
    fn duplicate_subscriptions_are_ignored() {
        let c = client();
        c.subscribe("a", SubscriptionKind::EventType);
        c.subscribe("a", SubscriptionKind::EventType);
        assert!(c.is_subscribed("a", SubscriptionKind::EventType));
        assert!(!c.is_subscribed("a", SubscriptionKind::Id));
    }

    #[test]
    fn channel_binding_is_set_once() {
        let c = client();
        assert_eq!(c.channel(), None);
        c.set_channel("news");
        c.set_channel("other");
        assert_eq!(c.channel(), Some("news"));
    }

    #[tokio::test]
    async fn flusher_writes_buffered_bytes_and_honors_destroy_after_flush() {
        use std::sync::Arc;
        use tokio::io::AsyncReadExt;
        use tokio::net::{TcpListener, TcpStream};
        use tokio::time::{Duration, timeout};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (peer, accepted) = tokio::join!(connect, listener.accept());
        let mut peer = peer.unwrap();
        let (stream, _) = accepted.unwrap();
        let (_rd, wr) = stream.into_split();

        let client = Arc::new(Client::new(addr));
        client.send(b"data: hello\n\n", true);
        client.flush_and_destroy();
        let flusher = tokio::spawn(run_flusher(client.clone(), wr));

        let mut received = Vec::new();
        timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .expect("flusher should close the connection")
            .unwrap();
        assert_eq!(received, b"data: hello\n\n");

        timeout(Duration::from_secs(5), flusher)
            .await
            .expect("flusher should exit")
            .unwrap();
        assert!(client.is_dead());
    }
}
