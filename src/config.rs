use crate::error::{Result, TesiraError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport carrying the TTP session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Telnet,
    Ssh,
}

impl TransportKind {
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Telnet => 23,
            TransportKind::Ssh => 22,
        }
    }
}

/// Connection settings for one Tesira device
///
/// Every field has a default, so a JSON document only needs the fields that
/// differ:
///
/// ```
/// use tesira_ttp::ClientConfig;
///
/// let config = ClientConfig::from_json(r#"{ "address": "10.0.0.20" }"#).unwrap();
/// assert_eq!(config.port, 23);
/// assert_eq!(config.username, "default");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Display name used in log lines
    pub name: String,

    pub address: String,

    pub transport: TransportKind,

    pub port: u16,

    pub username: String,

    pub password: String,

    /// Credentials tried once after the primary ones are rejected
    pub fallback_username: String,

    pub fallback_password: String,

    /// Wait after a failed connect attempt
    pub retry_interval_ms: u64,

    /// Wait before trying the fallback credentials
    pub fallback_delay_ms: u64,

    /// Wait before reconnecting after an established session drops
    pub reconnect_delay_ms: u64,

    /// Delay between Connected and resending subscriptions
    pub resubscribe_delay_ms: u64,

    pub connect_timeout_ms: u64,

    pub handshake_timeout_ms: u64,

    /// Writer cycle period
    pub poll_interval_ms: u64,

    /// Writer cycles a command may stay unanswered
    pub stall_threshold: u32,

    /// Idle time after which a keep-alive query is sent
    pub keep_alive_interval_ms: u64,

    /// Rate argument of subscribe commands
    pub subscription_rate_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "Tesira".to_string(),
            address: String::new(),
            transport: TransportKind::Telnet,
            port: TransportKind::Telnet.default_port(),
            username: factory_login(),
            password: factory_login(),
            fallback_username: factory_login(),
            fallback_password: String::new(),
            retry_interval_ms: 30_000,
            fallback_delay_ms: 5_000,
            reconnect_delay_ms: 1_000,
            resubscribe_delay_ms: 1_000,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            poll_interval_ms: 20,
            stall_threshold: crate::pipeline::DEFAULT_STALL_THRESHOLD,
            keep_alive_interval_ms: 30_000,
            subscription_rate_ms: 200,
        }
    }
}

/// Factory login, used for both the username and the primary password
fn factory_login() -> String {
    "default".to_string()
}

impl ClientConfig {
    /// Config for `address` with everything else defaulted
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON config document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Switch transport, moving the port to that transport's default
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self.port = transport.default_port();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(TesiraError::Config("address must not be empty".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(TesiraError::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.stall_threshold == 0 {
            return Err(TesiraError::Config("stall_threshold must be positive".to_string()));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_behaviour() {
        let config = ClientConfig::new("192.168.1.50");
        assert_eq!(config.port, 23);
        assert_eq!(config.username, "default");
        assert_eq!(config.password, "default");
        assert_eq!(config.fallback_username, "default");
        assert_eq!(config.fallback_password, "");
        assert_eq!(config.retry_interval(), Duration::from_secs(30));
        assert_eq!(config.fallback_delay(), Duration::from_secs(5));
        assert_eq!(config.resubscribe_delay(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.stall_threshold, 100);
        assert_eq!(config.subscription_rate_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ssh_transport_uses_port_22() {
        let config = ClientConfig::new("192.168.1.50").with_transport(TransportKind::Ssh);
        assert_eq!(config.port, 22);

        let config = ClientConfig::from_json(r#"{"address":"10.1.1.4","transport":"ssh","port":2222}"#).unwrap();
        assert_eq!(config.transport, TransportKind::Ssh);
        assert_eq!(config.port, 2222);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = ClientConfig::from_json(
            r#"{"name":"Ballroom","address":"10.1.1.4","username":"admin","password":"secret","retry_interval_ms":500}"#,
        )
        .unwrap();
        assert_eq!(config.name, "Ballroom");
        assert_eq!(config.username, "admin");
        assert_eq!(config.fallback_username, "default");
        assert_eq!(config.retry_interval_ms, 500);
        assert_eq!(config.keep_alive_interval_ms, 30_000);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            ClientConfig::from_json("{}"),
            Err(TesiraError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json(r#"{"address":"x","poll_interval_ms":0}"#),
            Err(TesiraError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json(r#"{"address":"x","stall_threshold":0}"#),
            Err(TesiraError::Config(_))
        ));
        assert!(matches!(
            ClientConfig::from_json("{\"address\":"),
            Err(TesiraError::Json(_))
        ));
    }
}
