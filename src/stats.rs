//! Process-wide counters and the `/stats` JSON document.

use crate::channel::Channel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct ServerStats {
    started_at: DateTime<Utc>,
    pub invalid_http_req: AtomicU64,
    pub oversized_http_req: AtomicU64,
    pub invalid_events_rcv: AtomicU64,
    pub router_read_errors: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        ServerStats {
            started_at: Utc::now(),
            invalid_http_req: AtomicU64::new(0),
            oversized_http_req: AtomicU64::new(0),
            invalid_events_rcv: AtomicU64::new(0),
            router_read_errors: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        Utc::now().signed_duration_since(self.started_at).num_seconds()
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub global: GlobalSnapshot,
    pub channels: Vec<ChannelSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct GlobalSnapshot {
    pub uptime: i64,
    pub clients: u64,
    pub channels: u64,
    pub broadcasted_events: u64,
    pub channel_connects: u64,
    pub channel_disconnects: u64,
    pub channel_client_errors: u64,
    pub router_read_errors: u64,
    pub invalid_http_req: u64,
    pub oversized_http_req: u64,
    pub invalid_events_rcv: u64,
}

#[derive(Debug, Serialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub clients: u64,
    pub broadcasted_events: u64,
    pub cached_events: u64,
    pub cache_size: u64,
    pub total_connects: u64,
    pub total_disconnects: u64,
    pub client_errors: u64,
}

/// Assemble the stats document from the global counters and a channel list.
pub fn snapshot(stats: &ServerStats, channels: &[Arc<Channel>]) -> StatsSnapshot {
    let channels: Vec<ChannelSnapshot> = channels.iter().map(|ch| ch.stats_snapshot()).collect();

    let global = GlobalSnapshot {
        uptime: stats.uptime_seconds(),
        clients: channels.iter().map(|c| c.clients).sum(),
        channels: channels.len() as u64,
        broadcasted_events: channels.iter().map(|c| c.broadcasted_events).sum(),
        channel_connects: channels.iter().map(|c| c.total_connects).sum(),
        channel_disconnects: channels.iter().map(|c| c.total_disconnects).sum(),
        channel_client_errors: channels.iter().map(|c| c.client_errors).sum(),
        router_read_errors: stats.router_read_errors.load(Ordering::Relaxed),
        invalid_http_req: stats.invalid_http_req.load(Ordering::Relaxed),
        oversized_http_req: stats.oversized_http_req.load(Ordering::Relaxed),
        invalid_events_rcv: stats.invalid_events_rcv.load(Ordering::Relaxed),
    };

    StatsSnapshot { global, channels }
}

/// Render the stats document as JSON.
pub fn render(stats: &ServerStats, channels: &[Arc<Channel>]) -> String {
    serde_json::to_string(&snapshot(stats, channels)).expect("stats snapshot serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    #[tokio::test]
    async fn snapshot_aggregates_channel_counters() {
        let stats = ServerStats::new();
        stats.invalid_http_req.store(3, Ordering::Relaxed);

        let a = Channel::new("a", ChannelConfig::default());
        let b = Channel::new("b", ChannelConfig::default());
        a.counters().num_connects.store(2, Ordering::Relaxed);
        b.counters().num_connects.store(5, Ordering::Relaxed);
        b.counters().num_errors.store(1, Ordering::Relaxed);

        let snap = snapshot(&stats, &[a, b]);
        assert_eq!(snap.global.channels, 2);
        assert_eq!(snap.global.channel_connects, 7);
        assert_eq!(snap.global.channel_client_errors, 1);
        assert_eq!(snap.global.invalid_http_req, 3);
        assert_eq!(snap.channels.len(), 2);
    }

    #[tokio::test]
    async fn render_produces_valid_json() {
        let stats = ServerStats::new();
        let ch = Channel::new("news", ChannelConfig::default());
        let json = render(&stats, &[ch]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["global"]["uptime"].is_i64());
        assert_eq!(parsed["channels"][0]["id"], "news");
        assert_eq!(parsed["channels"][0]["cache_size"], 500);
    }
}
