#![forbid(unsafe_code)]

// Server configuration loaded from environment variables

use crate::ice::{IceConfig, TurnConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Runtime settings for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Upper bound on concurrent WebSocket connections
    pub max_connections: usize,
    /// Directory served for every path not handled by the API
    pub static_dir: PathBuf,
    /// Close a connection that sends nothing for this long, pongs included
    pub idle_timeout: Duration,
    /// How often the server pings each connection
    pub ping_interval: Duration,
    /// Largest accepted inbound frame, in bytes
    pub max_message_size: usize,
    /// Token bucket size and refill rate for inbound events
    pub rate_limit_per_sec: u64,
    /// Bearer token protecting `/metrics`
    pub metrics_token: Option<String>,
    pub ice: IceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            max_connections: 10_000,
            static_dir: PathBuf::from("public"),
            idle_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(25),
            max_message_size: 65_536,
            rate_limit_per_sec: 100,
            metrics_token: None,
            ice: IceConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults
    /// and unparsable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let mut max_connections = parse_or(&lookup, "MAX_CONNECTIONS", defaults.max_connections);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", defaults.max_connections);
            max_connections = defaults.max_connections;
        }

        let idle_timeout = positive_secs(&lookup, "IDLE_TIMEOUT_SECS", defaults.idle_timeout);
        let ping_interval = positive_secs(&lookup, "PING_INTERVAL_SECS", defaults.ping_interval);

        let stun_urls = lookup("STUN_URLS")
            .map(|v| split_urls(&v))
            .unwrap_or(defaults.ice.stun_urls);

        let turn = match (lookup("TURN_URLS"), lookup("TURN_SECRET")) {
            (Some(urls), Some(secret)) => Some(TurnConfig {
                urls: split_urls(&urls),
                secret,
                ttl_secs: parse_or(&lookup, "TURN_TTL", 86_400),
            }),
            _ => None,
        };

        Self {
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr),
            port: parse_or(&lookup, "PORT", defaults.port),
            max_connections,
            static_dir: lookup("STATIC_DIR").map(PathBuf::from).unwrap_or(defaults.static_dir),
            idle_timeout,
            ping_interval,
            max_message_size: parse_or(&lookup, "MAX_MESSAGE_SIZE", defaults.max_message_size),
            rate_limit_per_sec: parse_or(&lookup, "RATE_LIMIT_PER_SEC", defaults.rate_limit_per_sec).max(1),
            metrics_token: lookup("METRICS_TOKEN").filter(|t| !t.is_empty()),
            ice: IceConfig { stun_urls, turn },
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Ping period actually used per connection: at most half the idle
    /// timeout so a live client answers before it would be dropped, and
    /// never below 100ms.
    pub fn heartbeat_interval(&self) -> Duration {
        self.ping_interval
            .min(self.idle_timeout / 2)
            .max(MIN_HEARTBEAT_INTERVAL)
    }
}

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Whole seconds from `key`; zero is rejected like an unparsable value
fn positive_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match parse_or(lookup, key, default.as_secs()) {
        0 => {
            warn!("{}=0 is not allowed, using default {}s", key, default.as_secs());
            default
        }
        secs => Duration::from_secs(secs),
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Invalid {}={:?}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
