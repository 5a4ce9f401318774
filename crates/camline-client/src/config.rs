//! Client configuration.
//!
//! Durations serialize as whole seconds, matching the intervals the
//! protocol itself deals in.

use std::time::Duration;

use camline_protocol::CHAT_PORT;
use serde::{Deserialize, Serialize};

/// Default endpoint serving the chat-server directory document.
const DEFAULT_SERVER_CONFIG_URL: &str = "https://www.camline.example/_js/serverconfig.js";

/// Default endpoint resolving out-of-band ext-data references.
const DEFAULT_EXTDATA_URL: &str = "https://www.camline.example/php/ExtResp.php";

/// Default domain suffix appended to directory-supplied server names.
const DEFAULT_SERVER_DOMAIN: &str = "camline.example";

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Account name; "guest" connects anonymously.
    pub username: String,
    /// Account password; "guest" for anonymous sessions.
    pub password: String,
    /// Chat-server TCP port.
    pub chat_port: u16,
    /// URL of the server directory document.
    pub server_config_url: String,
    /// Domain suffix appended to directory-supplied server names.
    pub server_domain: String,
    /// URL of the ext-data resolution endpoint.
    pub extdata_url: String,
    /// Interval between keepalive no-op commands while connected.
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,
    /// Delay before an automatic reconnect attempt.
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,
    /// Timeout for establishing the TCP connection.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: "guest".to_string(),
            password: "guest".to_string(),
            chat_port: CHAT_PORT,
            server_config_url: DEFAULT_SERVER_CONFIG_URL.to_string(),
            server_domain: DEFAULT_SERVER_DOMAIN.to_string(),
            extdata_url: DEFAULT_EXTDATA_URL.to_string(),
            keepalive_interval: Duration::from_secs(120),
            reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Creates a config with the given credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Builder: set the chat-server port.
    pub fn with_chat_port(mut self, port: u16) -> Self {
        self.chat_port = port;
        self
    }

    /// Builder: set the keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Builder: set the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Builder: set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Login payload in the `user:password` wire form.
    pub fn login_payload(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}
