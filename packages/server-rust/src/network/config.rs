//! Listener configuration for the inbound HTTP and framed RPC servers.

use std::time::Duration;

use switchyard_core::{ConfigError, StaticConfig};

/// Inbound HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Upper bound on one request, enforced by the timeout layer.
    pub request_timeout: Duration,
    /// How long `serve` waits for in-flight requests after shutdown.
    pub drain_timeout: Duration,
    /// Largest request body read into memory.
    pub max_body_bytes: usize,
    /// Name reported by the health endpoint.
    pub service_name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            max_body_bytes: 4 * 1024 * 1024,
            service_name: "switchyard".to_string(),
        }
    }
}

fn port(config: &StaticConfig, key: &str) -> Result<u16, ConfigError> {
    let raw = config.int_or(key, 0)?;
    u16::try_from(raw).map_err(|_| ConfigError::OutOfRange {
        key: key.to_string(),
        value: raw,
    })
}

fn millis(config: &StaticConfig, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = i64::try_from(default.as_millis()).unwrap_or(i64::MAX);
    let raw = config.int_or(key, default_ms)?;
    Ok(Duration::from_millis(u64::try_from(raw).unwrap_or(0)))
}

impl NetworkConfig {
    /// Reads `http.host`, `http.port`, `http.requestTimeout`,
    /// `http.drainTimeout` (milliseconds), `http.maxBodyBytes` and
    /// `serviceName`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a present key has the wrong type or
    /// the port is out of range.
    pub fn from_config(config: &StaticConfig) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            host: config.string_or("http.host", &d.host)?,
            port: port(config, "http.port")?,
            request_timeout: millis(config, "http.requestTimeout", d.request_timeout)?,
            drain_timeout: millis(config, "http.drainTimeout", d.drain_timeout)?,
            max_body_bytes: usize::try_from(config.int_or("http.maxBodyBytes", 4 * 1024 * 1024)?)
                .unwrap_or(d.max_body_bytes),
            service_name: config.string_or("serviceName", &d.service_name)?,
        })
    }
}

/// Per-connection settings of the framed RPC listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bounded channel capacity for outbound frames per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when queueing a response frame.
    pub send_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Framed RPC listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub service_name: String,
    pub process_name: String,
    /// How long `serve` waits for in-flight requests before closing
    /// connections.
    pub drain_timeout: Duration,
    pub connection: ConnectionConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            service_name: "switchyard".to_string(),
            process_name: "switchyard".to_string(),
            drain_timeout: Duration::from_secs(30),
            connection: ConnectionConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Reads `tchannel.host`, `tchannel.port`, `tchannel.serviceName`,
    /// `tchannel.processName` and `tchannel.drainTimeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a present key has the wrong type or
    /// the port is out of range.
    pub fn from_config(config: &StaticConfig) -> Result<Self, ConfigError> {
        let d = Self::default();
        let service_name = config.string_or("tchannel.serviceName", &d.service_name)?;
        Ok(Self {
            host: config.string_or("tchannel.host", &d.host)?,
            port: port(config, "tchannel.port")?,
            process_name: config.string_or("tchannel.processName", &service_name)?,
            service_name,
            drain_timeout: millis(config, "tchannel.drainTimeout", d.drain_timeout)?,
            connection: ConnectionConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn network_config_from_store() {
        let store = StaticConfig::from_pairs([
            ("http.port", json!(8093)),
            ("http.requestTimeout", json!(1500)),
            ("serviceName", json!("example-gateway")),
        ]);
        let config = NetworkConfig::from_config(&store).unwrap();
        assert_eq!(config.port, 8093);
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.service_name, "example-gateway");
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let store = StaticConfig::from_pairs([("http.port", json!(70000))]);
        assert!(NetworkConfig::from_config(&store).is_err());
    }

    #[test]
    fn rpc_process_name_defaults_to_service_name() {
        let store = StaticConfig::from_pairs([("tchannel.serviceName", json!("bounce"))]);
        let config = RpcConfig::from_config(&store).unwrap();
        assert_eq!(config.service_name, "bounce");
        assert_eq!(config.process_name, "bounce");
        assert_eq!(config.connection.outbound_channel_capacity, 256);
    }
}
