//! # Configuration Management
//!
//! Centralized configuration for the chat server.
//!
//! This module provides structured configuration for the listener, TLS
//! termination, per-connection limits, session-crypto timing, and the send
//! queue.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides via `apply_env_overrides()`
//!
//! ## Security Considerations
//! - Rate-limit defaults absorb normal chat traffic while bounding abuse
//! - Timeout values bound every wait on the connection path
//! - TLS settings reject protocol versions below the configured minimum

use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current wire protocol version carried in envelopes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest plaintext a single envelope may carry (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Fixed allowance for envelope framing on top of the plaintext.
pub const ENVELOPE_OVERHEAD: usize = 128;

/// Hard ceiling on a frame's length prefix.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + ENVELOPE_OVERHEAD;

/// Largest decoded application message (4 MiB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Deadline for the transport handshake (TLS accept + HELLO exchange).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the first auth frame after key exchange.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a disconnecting connection may drain its send queue.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long server-wide shutdown waits for connection drains.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main configuration structure containing all configurable settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerConfig {
    /// Listener settings
    #[serde(default)]
    pub listen: ListenConfig,

    /// TLS termination settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Per-connection limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Session-crypto timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Send-queue behavior
    #[serde(default)]
    pub send: SendConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Static credentials for the built-in verifier
    #[serde(default)]
    pub auth: AuthConfig,
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            ChatError::ConfigInvalid(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ChatError::ConfigInvalid(format!("failed to parse TOML: {e}")))
    }

    /// Override settings from `SECURECHAT_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SECURECHAT_LISTEN_ADDRESS") {
            self.listen.address = addr;
        }
        if let Ok(port) = std::env::var("SECURECHAT_LISTEN_PORT") {
            if let Ok(val) = port.parse::<u16>() {
                self.listen.port = val;
            }
        }
        if let Ok(max) = std::env::var("SECURECHAT_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                self.limits.max_connections = val;
            }
        }
        if let Ok(rekey) = std::env::var("SECURECHAT_REKEY_INTERVAL_SEC") {
            if let Ok(val) = rekey.parse::<u64>() {
                self.session.rekey_interval_sec = val;
            }
        }
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the
    /// configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.listen.validate());
        errors.extend(self.tls.validate());
        errors.extend(self.limits.validate());
        errors.extend(self.session.validate());
        errors.extend(self.send.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ChatError::ConfigInvalid(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub address: String,

    /// Bind port
    pub port: u16,

    /// Receive buffer size applied to accepted sockets
    pub recv_buffer_size: usize,

    /// Send buffer size applied to accepted sockets
    pub send_buffer_size: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0"),
            port: 8443,
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
        }
    }
}

impl ListenConfig {
    /// Validate listener configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("listen.address cannot be empty".to_string());
        } else if self.address.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "invalid listen.address: '{}' (expected an IP address)",
                self.address
            ));
        }

        if self.recv_buffer_size < 4096 {
            errors.push("listen.recv_buffer_size too small (minimum: 4 KiB)".to_string());
        }
        if self.send_buffer_size < 4096 {
            errors.push("listen.send_buffer_size too small (minimum: 4 KiB)".to_string());
        }

        errors
    }

    /// The socket address to bind.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.address, self.port)
            .parse()
            .map_err(|e| ChatError::ConfigInvalid(format!("invalid listen address: {e}")))
    }
}

/// TLS termination configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether to terminate TLS on accepted connections
    pub enabled: bool,

    /// Path to the PEM certificate chain
    pub cert: Option<PathBuf>,

    /// Path to the PEM PKCS#8 private key
    pub key: Option<PathBuf>,

    /// Minimum accepted TLS version ("1.2" or "1.3")
    pub min_version: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: None,
            key: None,
            min_version: String::from("1.3"),
        }
    }
}

impl TlsConfig {
    /// Validate TLS configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.enabled {
            match &self.cert {
                None => errors.push("tls.cert is required when tls.enabled".to_string()),
                Some(p) if !p.exists() => {
                    errors.push(format!("tls.cert does not exist: {}", p.display()));
                }
                _ => {}
            }
            match &self.key {
                None => errors.push("tls.key is required when tls.enabled".to_string()),
                Some(p) if !p.exists() => {
                    errors.push(format!("tls.key does not exist: {}", p.display()));
                }
                _ => {}
            }
        }

        if self.min_version != "1.2" && self.min_version != "1.3" {
            errors.push(format!(
                "tls.min_version must be \"1.2\" or \"1.3\", got '{}'",
                self.min_version
            ));
        }

        errors
    }
}

/// Per-connection limit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Hard cap on concurrent connections; excess accepts are rejected
    pub max_connections: usize,

    /// Sustained message rate per connection
    pub messages_per_sec: u32,

    /// Message burst capacity
    pub burst: u32,

    /// Sustained byte rate per connection
    pub bytes_per_sec: u64,

    /// Byte burst capacity
    pub bytes_burst: u64,

    /// Permitted login attempts per minute before lockout
    pub login_attempts_per_min: u32,

    /// Lockout duration after exhausting login attempts
    pub lockout_seconds: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            messages_per_sec: 100,
            burst: 200,
            bytes_per_sec: 1024 * 1024,
            bytes_burst: 2 * 1024 * 1024,
            login_attempts_per_min: 5,
            lockout_seconds: 300,
        }
    }
}

impl LimitsConfig {
    /// Validate limit configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("limits.max_connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "limits.max_connections very high: {} (ensure file-descriptor limits allow this)",
                self.max_connections
            ));
        }

        if self.messages_per_sec == 0 {
            errors.push("limits.messages_per_sec must be greater than 0".to_string());
        }
        if self.burst < self.messages_per_sec {
            errors.push("limits.burst must be at least limits.messages_per_sec".to_string());
        }
        if self.bytes_per_sec == 0 {
            errors.push("limits.bytes_per_sec must be greater than 0".to_string());
        }
        if self.bytes_burst < self.bytes_per_sec {
            errors.push("limits.bytes_burst must be at least limits.bytes_per_sec".to_string());
        }
        if self.login_attempts_per_min == 0 {
            errors.push("limits.login_attempts_per_min must be greater than 0".to_string());
        }
        if self.lockout_seconds == 0 {
            errors.push("limits.lockout_seconds must be greater than 0".to_string());
        }

        errors
    }

    /// Lockout duration after the login bucket empties.
    pub fn lockout(&self) -> Duration {
        Duration::from_secs(self.lockout_seconds)
    }
}

/// Session-crypto timing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between session rekeys
    pub rekey_interval_sec: u64,

    /// Seconds between keep-alive probes
    pub keepalive_sec: u64,

    /// Seconds of inbound silence before a connection is reaped
    pub idle_timeout_sec: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey_interval_sec: 1800,
            keepalive_sec: 30,
            idle_timeout_sec: 300,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.rekey_interval_sec < 60 {
            errors.push("session.rekey_interval_sec too short (minimum: 60s)".to_string());
        }
        if self.keepalive_sec == 0 {
            errors.push("session.keepalive_sec must be greater than 0".to_string());
        }
        if self.idle_timeout_sec <= self.keepalive_sec {
            errors.push(
                "session.idle_timeout_sec must exceed session.keepalive_sec".to_string(),
            );
        }

        errors
    }

    /// Interval between session rekeys.
    pub fn rekey_interval(&self) -> Duration {
        Duration::from_secs(self.rekey_interval_sec)
    }

    /// Interval between keep-alive probes.
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_sec)
    }

    /// Inbound silence tolerated before reaping.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }
}

/// Send-queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SendConfig {
    /// Bounded queue capacity per connection
    pub queue_capacity: usize,

    /// Milliseconds to wait for a delivery acknowledgement
    pub ack_timeout_ms: u64,

    /// Re-send attempts before the sender is notified of failure
    pub max_retries: u32,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            ack_timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl SendConfig {
    /// Validate send-queue configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.queue_capacity == 0 {
            errors.push("send.queue_capacity must be greater than 0".to_string());
        } else if self.queue_capacity > 1_000_000 {
            errors.push(format!(
                "send.queue_capacity too large: {} (max recommended: 1,000,000)",
                self.queue_capacity
            ));
        }
        if self.ack_timeout_ms < 100 {
            errors.push("send.ack_timeout_ms too short (minimum: 100ms)".to_string());
        }

        errors
    }

    /// Delivery-acknowledgement deadline.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter ("trace" | "debug" | "info" | "warn" | "error")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

/// Static credentials consumed by the built-in verifier.
///
/// Stands in for an external identity backend; the verifier interface stays
/// pluggable.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// username -> password table
    pub users: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn parses_full_toml() {
        let toml = r#"
            [listen]
            address = "127.0.0.1"
            port = 9000
            recv_buffer_size = 65536
            send_buffer_size = 65536

            [limits]
            max_connections = 64
            messages_per_sec = 50
            burst = 100
            bytes_per_sec = 524288
            bytes_burst = 1048576
            login_attempts_per_min = 3
            lockout_seconds = 120

            [session]
            rekey_interval_sec = 600
            keepalive_sec = 15
            idle_timeout_sec = 120

            [send]
            queue_capacity = 500
            ack_timeout_ms = 5000
            max_retries = 2

            [auth.users]
            alice = "Secret!1"
        "#;
        let config = ServerConfig::from_toml(toml).unwrap();
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.limits.burst, 100);
        assert_eq!(config.session.rekey_interval_sec, 600);
        assert_eq!(config.send.queue_capacity, 500);
        assert_eq!(config.auth.users.get("alice").unwrap(), "Secret!1");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn partial_tables_fall_back_to_field_defaults() {
        // A present-but-incomplete section must not be a missing-field
        // error.
        let config = ServerConfig::from_toml(
            "[limits]\nmessages_per_sec = 50\nburst = 100\n",
        )
        .unwrap();
        assert_eq!(config.limits.messages_per_sec, 50);
        assert_eq!(config.limits.max_connections, 1000);
        assert_eq!(config.limits.lockout_seconds, 300);
    }

    #[test]
    fn rejects_invalid_address() {
        let mut config = ServerConfig::default();
        config.listen.address = "not-an-ip".into();
        assert!(!config.validate().is_empty());
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn rejects_burst_below_rate() {
        let mut config = ServerConfig::default();
        config.limits.burst = 10;
        config.limits.messages_per_sec = 100;
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("limits.burst")));
    }

    #[test]
    fn tls_requires_cert_and_key() {
        let mut config = ServerConfig::default();
        config.tls.enabled = true;
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("tls.cert")));
        assert!(errors.iter().any(|e| e.contains("tls.key")));
    }
}
