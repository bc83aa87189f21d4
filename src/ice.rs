#![forbid(unsafe_code)]

// ICE server list handed to clients before they open peer sessions.
// TURN entries use coturn time-limited credentials (HMAC-SHA1, --use-auth-secret).

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

type HmacSha1 = Hmac<Sha1>;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// TURN server configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// TURN server URLs (e.g. ["turn:example.com:3478", "turns:example.com:5349"])
    pub urls: Vec<String>,
    /// Shared secret for generating time-limited credentials
    pub secret: String,
    /// Credential TTL in seconds
    pub ttl_secs: u64,
}

/// STUN and optional TURN servers offered to clients
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            turn: None,
        }
    }
}

/// ICE server entry sent to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceConfig {
    /// Server list for one client; `label` ends up in the TURN username.
    pub fn ice_servers(&self, label: &str) -> Vec<IceServer> {
        let mut servers = Vec::with_capacity(2);
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if let Some(turn) = &self.turn {
            if let Some(server) = turn.generate_credentials(label) {
                servers.push(server);
            }
        }
        servers
    }
}

impl TurnConfig {
    /// Generate time-limited credentials.
    ///
    /// coturn format: username = "expiry_timestamp:label"
    ///               credential = base64(HMAC-SHA1(secret, username))
    pub fn generate_credentials(&self, label: &str) -> Option<IceServer> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;

        let username = format!("{expiry}:{label}");

        let mut mac = match HmacSha1::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(e) => {
                warn!("Cannot derive TURN credentials: {}", e);
                return None;
            }
        };
        mac.update(username.as_bytes());
        let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Some(IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        })
    }
}
