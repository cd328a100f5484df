//! Server configuration loading.
//!
//! JSON is the sole config source; default path `./conf/config.json`.
//! Every section and field is optional — absent values fall back to the
//! defaults below — but present values must validate (the bind address must
//! parse, publisher ranges must be valid CIDR or bare addresses).
//!
//! # Recognized options
//! - `server.port`, `server.bindip`, `server.enablePost`,
//!   `server.allowUndefinedChannels`
//! - `defaultChannel.{cacheLength, allowedPublishers, allowedOrigins,
//!   historyRequestedLimit}` — applied to channels created on demand
//! - `channels.<name>.{...}` — same fields, per statically configured channel
//! - `input.enabled`, `input.address` — the external event feed toggle

use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub default_channel: ChannelConfig,
    pub channels: Vec<(String, ChannelConfig)>,
    pub input: InputConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bindip: IpAddr,
    pub enable_post: bool,
    pub allow_undefined_channels: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Ring cache capacity in events.
    pub cache_length: usize,
    /// CIDR ranges allowed to publish; empty means anyone.
    pub allowed_publishers: Vec<IpNet>,
    /// Origins admitted for CORS; `"*"` admits all, empty emits no header.
    pub allowed_origins: Vec<String>,
    /// Cap on events replayed for a `Last-Event-ID` request; 0 means no cap.
    pub history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct InputConfig {
    pub enabled: bool,
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8090,
            bindip: IpAddr::from([0, 0, 0, 0]),
            enable_post: true,
            allow_undefined_channels: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            cache_length: 500,
            allowed_publishers: Vec::new(),
            allowed_origins: Vec::new(),
            history_limit: 0,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        InputConfig {
            enabled: false,
            address: "127.0.0.1:9999".to_owned(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            default_channel: ChannelConfig::default(),
            channels: Vec::new(),
            input: InputConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw JSON deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    server: Option<RawServerConfig>,
    default_channel: Option<RawChannelConfig>,
    channels: Option<HashMap<String, RawChannelConfig>>,
    input: Option<RawInputConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerConfig {
    port: Option<u16>,
    bindip: Option<String>,
    enable_post: Option<bool>,
    allow_undefined_channels: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChannelConfig {
    cache_length: Option<usize>,
    allowed_publishers: Option<Vec<String>>,
    allowed_origins: Option<Vec<String>>,
    history_requested_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInputConfig {
    enabled: Option<bool>,
    address: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a file path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&json)
}

/// Load config from a JSON string.
pub fn load_config_from_str(json: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let server = match raw.server {
        Some(s) => {
            let defaults = ServerConfig::default();
            let bindip = match s.bindip {
                Some(ip) => ip.parse::<IpAddr>().map_err(|_| ConfigError::InvalidValue {
                    field: "server.bindip".to_owned(),
                    reason: format!("'{ip}' is not an IP address"),
                })?,
                None => defaults.bindip,
            };
            ServerConfig {
                port: s.port.unwrap_or(defaults.port),
                bindip,
                enable_post: s.enable_post.unwrap_or(defaults.enable_post),
                allow_undefined_channels: s
                    .allow_undefined_channels
                    .unwrap_or(defaults.allow_undefined_channels),
            }
        }
        None => ServerConfig::default(),
    };

    let default_channel = match raw.default_channel {
        Some(c) => channel_config("defaultChannel", c)?,
        None => ChannelConfig::default(),
    };

    let mut channels = Vec::new();
    if let Some(raw_channels) = raw.channels {
        for (name, c) in raw_channels {
            if name.is_empty() || name.contains('/') {
                return Err(ConfigError::InvalidValue {
                    field: format!("channels.{name}"),
                    reason: "channel names must be non-empty single path segments".to_owned(),
                });
            }
            let cfg = channel_config(&format!("channels.{name}"), c)?;
            channels.push((name, cfg));
        }
    }
    channels.sort_by(|a, b| a.0.cmp(&b.0));

    let input = match raw.input {
        Some(i) => {
            let defaults = InputConfig::default();
            InputConfig {
                enabled: i.enabled.unwrap_or(defaults.enabled),
                address: i.address.unwrap_or(defaults.address),
            }
        }
        None => InputConfig::default(),
    };

    Ok(Config {
        server,
        default_channel,
        channels,
        input,
    })
}

fn channel_config(field: &str, raw: RawChannelConfig) -> Result<ChannelConfig, ConfigError> {
    let defaults = ChannelConfig::default();
    let mut allowed_publishers = Vec::new();
    for entry in raw.allowed_publishers.unwrap_or_default() {
        allowed_publishers.push(parse_ip_range(field, &entry)?);
    }
    Ok(ChannelConfig {
        cache_length: raw.cache_length.unwrap_or(defaults.cache_length),
        allowed_publishers,
        allowed_origins: raw.allowed_origins.unwrap_or_default(),
        history_limit: raw
            .history_requested_limit
            .unwrap_or(defaults.history_limit),
    })
}

/// Parse a CIDR range; a bare address is accepted as a host route.
fn parse_ip_range(field: &str, entry: &str) -> Result<IpNet, ConfigError> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    if let Ok(addr) = entry.parse::<IpAddr>() {
        return Ok(IpNet::from(addr));
    }
    Err(ConfigError::InvalidValue {
        field: format!("{field}.allowedPublishers"),
        reason: format!("'{entry}' is not a CIDR range or IP address"),
    })
}
