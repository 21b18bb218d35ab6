use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_HOST: &str = "broker.hivemq.com";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_TOPIC: &str = "semester_project/water_quality";
pub const DEFAULT_PATH: &str = "/mqtt";

/// Broker dial parameters as edited by the user and kept in the configuration store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    /// WebSocket path on the broker, e.g. "/mqtt"
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(rename = "useSSL", alias = "use_ssl")]
    pub use_ssl: bool,
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            topic: DEFAULT_TOPIC.to_string(),
            path: default_path(),
            use_ssl: false,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(())
    }

    /// WebSocket URI the client dials, `ws[s]://host:port/path`.
    pub fn uri(&self) -> String {
        let scheme = if self.use_ssl { "wss" } else { "ws" };
        let path = self.path.trim();
        let path = if path.is_empty() {
            String::new()
        } else if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("{scheme}://{}:{}{}", self.host.trim(), self.port, path)
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]", self.uri(), self.topic)
    }
}

/// Session parameters that are not user editable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub clean_session: bool,
    /// Capacity of the client's request channel
    pub request_capacity: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            client_id_prefix: "aquadash".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            clean_session: true,
            request_capacity: 10,
        }
    }
}

impl BrokerOptions {
    /// Fresh client id for each connecting instance so the broker never sees
    /// two sessions with the same id.
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, Uuid::new_v4().simple())
    }
}
