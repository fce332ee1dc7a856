//! Transport configuration.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Characters escaped in query keys and values (everything but
/// `A-Z a-z 0-9 - _ . ! ~ * ' ( )`).
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Query parameter carrying the auth token.
pub const TOKEN_PARAM: &str = "token";

/// Configuration for one [`SyncTransport`](crate::transport::SyncTransport).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Relay base URL, e.g. `wss://relay.example.com/sync`.
    pub server_url: String,
    /// Document room name, appended to the base URL.
    pub room: String,
    /// Query parameters; the auth token lives here.
    pub params: BTreeMap<String, String>,
    /// Connect as soon as the transport starts.
    pub connect: bool,
    /// Disable the in-process broadcast fallback.
    pub disable_bc: bool,
    /// Ceiling for the reconnect backoff.
    pub max_backoff: Duration,
    /// Consecutive failed attempts before automatic retry stops.
    pub max_connection_errors: u32,
    /// Close the socket when nothing was received for this long.
    pub reconnect_timeout: Duration,
    /// Re-send sync step 1 periodically while connected.
    pub resync_interval: Option<Duration>,
    /// Remote awareness states not renewed within this window expire.
    pub awareness_outdated_timeout: Duration,
    /// Capacity of the transport event channel.
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:1234".to_string(),
            room: String::new(),
            params: BTreeMap::new(),
            connect: true,
            disable_bc: false,
            max_backoff: Duration::from_millis(2500),
            max_connection_errors: 10,
            reconnect_timeout: Duration::from_secs(30),
            resync_interval: None,
            awareness_outdated_timeout: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

impl TransportConfig {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room: room.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.with_param(TOKEN_PARAM, token)
    }

    pub fn with_auto_connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_broadcast_fallback(mut self, enabled: bool) -> Self {
        self.disable_bc = !enabled;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_max_connection_errors(mut self, max: u32) -> Self {
        self.max_connection_errors = max;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = Some(interval);
        self
    }

    pub fn with_awareness_outdated_timeout(mut self, timeout: Duration) -> Self {
        self.awareness_outdated_timeout = timeout;
        self
    }

    /// `{server_url}/{room}` plus the encoded query, if any.
    pub fn url(&self) -> String {
        let mut url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room);
        if !self.params.is_empty() {
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        utf8_percent_encode(k, QUERY_COMPONENT),
                        utf8_percent_encode(v, QUERY_COMPONENT)
                    )
                })
                .collect();
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    /// Key of the local broadcast group for this room.
    pub fn hub_key(&self) -> String {
        crate::broadcast::LocalHub::key(&self.server_url, &self.room)
    }

    /// Point at a new base/room and token. Returns true when the resulting
    /// URL differs from the previous one.
    pub fn rotate(&mut self, server_url: &str, room: &str, token: &str) -> bool {
        let before = self.url();
        self.server_url = server_url.to_owned();
        self.room = room.to_owned();
        self.params.insert(TOKEN_PARAM.to_owned(), token.to_owned());
        self.url() != before
    }
}
