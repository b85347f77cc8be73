//! Client descriptors and per-call timeout options, read from the config
//! store at startup.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use switchyard_core::{ConfigError, Headers, StaticConfig};

use super::breaker::CircuitBreakerConfig;

/// Config key holding the process-wide request UUID header name.
pub const GLOBAL_UUID_HEADER_KEY: &str = "http.clients.requestUUIDHeaderKey";
/// Config key holding the process-wide procedure header name.
pub const GLOBAL_PROCEDURE_HEADER_KEY: &str = "http.clients.requestProcedureHeaderKey";

const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);
const DEFAULT_SCALE_FACTOR: f64 = 1.1;

/// Errors building a client descriptor.
#[derive(Debug, thiserror::Error)]
pub enum ClientConfigError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("client {client_id}: invalid routing pattern {pattern:?} for header {header}")]
    InvalidRoutePattern {
        client_id: String,
        header: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("client {client_id}: alternate service {service} has no entry in servicesDetailMap")]
    UnknownAlternate { client_id: String, service: String },
}

/// Outbound protocol of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientProtocol {
    /// HTTP/1.1 with JSON bodies.
    Http,
    /// Length-delimited frames over TCP with MessagePack payloads.
    FramedRpc,
    /// HTTP/2 length-prefixed messages.
    Grpc,
}

impl ClientProtocol {
    /// Value of the `clienttype` metric tag and context annotation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ClientProtocol::Http => "http",
            ClientProtocol::FramedRpc => "rpc",
            ClientProtocol::Grpc => "grpc",
        }
    }

    fn base_address(self, ip: &str, port: i64) -> String {
        match self {
            ClientProtocol::Http | ClientProtocol::Grpc => format!("http://{ip}:{port}"),
            ClientProtocol::FramedRpc => format!("{ip}:{port}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Alternate routing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutingConfigEntry {
    header_name: String,
    header_value: String,
    service_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceDetail {
    ip: String,
    port: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlternatesConfig {
    #[serde(default)]
    routing_configs: Vec<RoutingConfigEntry>,
    #[serde(default)]
    services_detail_map: BTreeMap<String, ServiceDetail>,
}

/// Sends a call to another service when a header matches.
#[derive(Debug, Clone)]
pub struct AlternateRoute {
    pub header_name: String,
    pub pattern: Regex,
    pub service_name: String,
    pub base_address: String,
}

/// Where one outbound call goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub base_address: String,
    pub service_name: String,
}

// ---------------------------------------------------------------------------
// ClientDescriptor
// ---------------------------------------------------------------------------

/// Static description of a downstream service. Immutable after startup.
#[derive(Debug, Clone)]
pub struct ClientDescriptor {
    pub client_id: String,
    pub protocol: ClientProtocol,
    /// `http://ip:port` for HTTP and gRPC, `ip:port` for framed RPC.
    pub base_address: String,
    pub service_name: String,
    /// Wire procedure (`Service::method`) to local short name.
    pub method_name_map: HashMap<String, String>,
    pub default_headers: Headers,
    pub timeout: Duration,
    pub timeout_per_attempt: Option<Duration>,
    pub routing_key: Option<String>,
    pub request_uuid_header_key: Option<String>,
    pub procedure_header_key: Option<String>,
    pub circuit_breaker_disabled: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub alternates: Vec<AlternateRoute>,
}

fn duration_ms(raw: i64) -> Duration {
    Duration::from_millis(u64::try_from(raw).unwrap_or(0))
}

impl ClientDescriptor {
    /// A descriptor with defaults, for wiring by hand and in tests.
    #[must_use]
    pub fn new(client_id: &str, protocol: ClientProtocol, base_address: &str, timeout: Duration) -> Self {
        Self {
            client_id: client_id.to_string(),
            protocol,
            base_address: base_address.to_string(),
            service_name: client_id.to_string(),
            method_name_map: HashMap::new(),
            default_headers: Headers::new(),
            timeout,
            timeout_per_attempt: None,
            routing_key: None,
            request_uuid_header_key: None,
            procedure_header_key: None,
            circuit_breaker_disabled: false,
            circuit_breaker: CircuitBreakerConfig {
                timeout,
                ..CircuitBreakerConfig::default()
            },
            alternates: Vec::new(),
        }
    }

    /// Adds a wire procedure and its short name.
    #[must_use]
    pub fn with_method(mut self, procedure: &str, short_name: &str) -> Self {
        self.method_name_map
            .insert(procedure.to_string(), short_name.to_string());
        self
    }

    /// Reads `clients.<client_id>.*`.
    ///
    /// `ip`, `port` and `timeout` are required. Default headers merge
    /// `http.defaultHeaders` under `clients.<id>.defaultHeaders`.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientConfigError`] when a required key is missing, a key
    /// has the wrong type, or an alternate route is malformed.
    pub fn from_config(
        config: &StaticConfig,
        client_id: &str,
        protocol: ClientProtocol,
        method_name_map: HashMap<String, String>,
    ) -> Result<Self, ClientConfigError> {
        let key = |k: &str| format!("clients.{client_id}.{k}");

        let ip = config.get_string(&key("ip"))?;
        let port = config.get_int(&key("port"))?;
        let timeout = duration_ms(config.get_int(&key("timeout"))?);
        let timeout_per_attempt = if config.contains_key(&key("timeoutPerAttempt")) {
            Some(duration_ms(config.get_int(&key("timeoutPerAttempt"))?))
        } else {
            None
        };

        let mut default_headers: Headers = config.string_map_or_empty(&key("defaultHeaders"))?.into();
        let global: Headers = config.string_map_or_empty("http.defaultHeaders")?.into();
        default_headers.merge_defaults(&global);

        let request_uuid_header_key = match config.optional_string(&key("requestUUIDHeaderKey"))? {
            Some(k) => Some(k),
            None => config.optional_string(GLOBAL_UUID_HEADER_KEY)?,
        };
        let procedure_header_key = match config.optional_string(&key("requestProcedureHeaderKey"))? {
            Some(k) => Some(k),
            None => config.optional_string(GLOBAL_PROCEDURE_HEADER_KEY)?,
        };

        let alternates = if config.contains_key(&key("alternates")) {
            let raw: AlternatesConfig = config.get_struct(&key("alternates"))?;
            build_alternates(client_id, protocol, raw)?
        } else {
            Vec::new()
        };

        Ok(Self {
            client_id: client_id.to_string(),
            protocol,
            base_address: protocol.base_address(&ip, port),
            service_name: config.string_or(&key("serviceName"), client_id)?,
            method_name_map,
            default_headers,
            timeout,
            timeout_per_attempt,
            routing_key: config.optional_string(&key("routingKey"))?,
            request_uuid_header_key,
            procedure_header_key,
            circuit_breaker_disabled: config.bool_or(&key("circuitBreakerDisabled"), false)?,
            circuit_breaker: CircuitBreakerConfig::from_config(config, client_id, timeout)?,
            alternates,
        })
    }

    /// Short name for a wire procedure, falling back to the procedure.
    #[must_use]
    pub fn short_name<'a>(&'a self, procedure: &'a str) -> &'a str {
        self.method_name_map
            .get(procedure)
            .map_or(procedure, String::as_str)
    }

    /// Picks the destination for a call. Outbound headers are checked
    /// before the inbound request's; the first matching route wins.
    #[must_use]
    pub fn resolve_target(&self, outbound: &Headers, inbound: &Headers) -> CallTarget {
        for route in &self.alternates {
            let value = outbound
                .get(&route.header_name)
                .or_else(|| inbound.get(&route.header_name));
            if value.is_some_and(|v| route.pattern.is_match(v)) {
                return CallTarget {
                    base_address: route.base_address.clone(),
                    service_name: route.service_name.clone(),
                };
            }
        }
        CallTarget {
            base_address: self.base_address.clone(),
            service_name: self.service_name.clone(),
        }
    }
}

fn build_alternates(
    client_id: &str,
    protocol: ClientProtocol,
    raw: AlternatesConfig,
) -> Result<Vec<AlternateRoute>, ClientConfigError> {
    raw.routing_configs
        .into_iter()
        .map(|entry| {
            let anchored = format!("^(?:{})$", entry.header_value);
            let pattern = Regex::new(&anchored).map_err(|source| ClientConfigError::InvalidRoutePattern {
                client_id: client_id.to_string(),
                header: entry.header_name.clone(),
                pattern: entry.header_value.clone(),
                source,
            })?;
            let detail = raw.services_detail_map.get(&entry.service_name).ok_or_else(|| {
                ClientConfigError::UnknownAlternate {
                    client_id: client_id.to_string(),
                    service: entry.service_name.clone(),
                }
            })?;
            Ok(AlternateRoute {
                header_name: entry.header_name,
                pattern,
                base_address: protocol.base_address(&detail.ip, detail.port),
                service_name: entry.service_name,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// TimeoutOptions
// ---------------------------------------------------------------------------

/// Deadline and retry policy for one client method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutOptions {
    /// Budget across every attempt. `None` defers to the client timeout.
    pub overall: Option<Duration>,
    /// Budget of a single attempt. `None` defers to the descriptor.
    pub per_attempt: Option<Duration>,
    /// Attempt cap. `0` means one attempt at the client timeout.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub scale_factor: f64,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            overall: None,
            per_attempt: None,
            max_attempts: 1,
            backoff_base: DEFAULT_BACKOFF,
            scale_factor: DEFAULT_SCALE_FACTOR,
        }
    }
}

impl TimeoutOptions {
    /// Reads `endpoints.<endpoint_id>.<method>.*`. Retry settings apply
    /// only when `timeoutPerAttempt` is present; otherwise the defaults
    /// (single attempt, client timeout) are returned.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a present key has the wrong type.
    pub fn from_config(config: &StaticConfig, endpoint_id: &str, method: &str) -> Result<Self, ConfigError> {
        let key = |k: &str| format!("endpoints.{endpoint_id}.{method}.{k}");
        if !config.contains_key(&key("timeoutPerAttempt")) {
            return Ok(Self::default());
        }

        let per_attempt = duration_ms(config.get_int(&key("timeoutPerAttempt"))?);
        let backoff_base = duration_ms(config.int_or(&key("backOffTimeAcrossRetries"), 10)?);
        let max_attempts = u32::try_from(config.int_or(&key("retryCount"), 1)?).unwrap_or(0);
        let scale_factor = config.float_or(&key("scaleFactor"), DEFAULT_SCALE_FACTOR)?;

        let retries = max_attempts.saturating_sub(1);
        let overall = (per_attempt + backoff_base) * retries + per_attempt;

        Ok(Self {
            overall: Some(overall),
            per_attempt: Some(per_attempt),
            max_attempts,
            backoff_base,
            scale_factor,
        })
    }

    /// Backoff before attempt `index + 1`: `base * scale^index`.
    #[must_use]
    pub fn backoff(&self, index: u32) -> Duration {
        let factor = self.scale_factor.max(0.0).powi(i32::try_from(index).unwrap_or(i32::MAX));
        self.backoff_base.mul_f64(factor.min(1e6))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store() -> StaticConfig {
        StaticConfig::from_pairs([
            ("clients.baz.ip", json!("127.0.0.1")),
            ("clients.baz.port", json!(4001)),
            ("clients.baz.timeout", json!(2500)),
            ("clients.baz.serviceName", json!("Baz")),
            ("clients.baz.defaultHeaders", json!({"x-client": "baz"})),
            ("http.defaultHeaders", json!({"x-client": "global", "x-app": "gw"})),
            ("http.clients.requestUUIDHeaderKey", json!("x-request-uuid")),
            (
                "clients.baz.alternates",
                json!({
                    "routingConfigs": [
                        {"headerName": "x-test-env", "headerValue": "test-.*", "serviceName": "bazStaging"}
                    ],
                    "servicesDetailMap": {"bazStaging": {"ip": "10.0.0.2", "port": 5001}}
                }),
            ),
        ])
    }

    #[test]
    fn descriptor_from_config() {
        let d = ClientDescriptor::from_config(&store(), "baz", ClientProtocol::Http, HashMap::new()).unwrap();
        assert_eq!(d.base_address, "http://127.0.0.1:4001");
        assert_eq!(d.timeout, Duration::from_millis(2500));
        assert_eq!(d.timeout_per_attempt, None);
        assert_eq!(d.service_name, "Baz");
        assert_eq!(d.default_headers.get("x-client"), Some("baz"));
        assert_eq!(d.default_headers.get("x-app"), Some("gw"));
        assert_eq!(d.request_uuid_header_key.as_deref(), Some("x-request-uuid"));
        assert!(!d.circuit_breaker_disabled);
        assert_eq!(d.circuit_breaker.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn missing_required_key_fails() {
        let err = ClientDescriptor::from_config(&StaticConfig::new(), "nope", ClientProtocol::Http, HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ClientConfigError::Config(ConfigError::Missing { .. })));
    }

    #[test]
    fn alternate_route_matches_header() {
        let d = ClientDescriptor::from_config(&store(), "baz", ClientProtocol::FramedRpc, HashMap::new()).unwrap();
        let inbound: Headers = [("x-test-env", "test-42")].into_iter().collect();
        let target = d.resolve_target(&Headers::new(), &inbound);
        assert_eq!(target.base_address, "10.0.0.2:5001");
        assert_eq!(target.service_name, "bazStaging");

        let inbound: Headers = [("x-test-env", "prod")].into_iter().collect();
        let target = d.resolve_target(&Headers::new(), &inbound);
        assert_eq!(target.base_address, "127.0.0.1:4001");
    }

    #[test]
    fn bad_alternate_is_rejected() {
        let config = store().with_overrides([(
            "clients.baz.alternates",
            json!({"routingConfigs": [{"headerName": "h", "headerValue": "(", "serviceName": "x"}]}),
        )]);
        let err = ClientDescriptor::from_config(&config, "baz", ClientProtocol::Http, HashMap::new()).unwrap_err();
        assert!(matches!(err, ClientConfigError::InvalidRoutePattern { .. }));
    }

    #[test]
    fn timeout_options_from_config() {
        let config = StaticConfig::from_pairs([
            ("endpoints.bar.hello.timeoutPerAttempt", json!(100)),
            ("endpoints.bar.hello.retryCount", json!(3)),
            ("endpoints.bar.hello.backOffTimeAcrossRetries", json!(20)),
        ]);
        let opts = TimeoutOptions::from_config(&config, "bar", "hello").unwrap();
        assert_eq!(opts.per_attempt, Some(Duration::from_millis(100)));
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(opts.overall, Some(Duration::from_millis(340)));
        assert_eq!(opts.backoff(0), Duration::from_millis(20));
        assert!(opts.backoff(2) > opts.backoff(1));

        let opts = TimeoutOptions::from_config(&config, "bar", "other").unwrap();
        assert_eq!(opts, TimeoutOptions::default());
    }

    #[test]
    fn short_name_falls_back_to_procedure() {
        let d = ClientDescriptor::new("bar", ClientProtocol::Http, "http://localhost:1", Duration::from_secs(1))
            .with_method("Bar::helloWorld", "Hello");
        assert_eq!(d.short_name("Bar::helloWorld"), "Hello");
        assert_eq!(d.short_name("Bar::other"), "Bar::other");
    }
}
