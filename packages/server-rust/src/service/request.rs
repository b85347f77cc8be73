//! Inbound request wrapper shared by the HTTP and framed RPC listeners.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::Query;
use bytes::Bytes;
use http::Uri;
use serde::de::DeserializeOwned;
use switchyard_core::{codec, ErrorKind, GatewayError, Headers, Origin, PayloadFormat};

use super::response::ServerResponse;

/// Wire protocol an endpoint is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Rpc,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Rpc => "rpc",
        }
    }

    /// Payload encoding used on this protocol.
    #[must_use]
    pub fn payload_format(self) -> PayloadFormat {
        match self {
            Protocol::Http => PayloadFormat::Json,
            Protocol::Rpc => PayloadFormat::MsgPack,
        }
    }
}

/// A decoded inbound request.
#[derive(Debug)]
pub struct ServerRequest {
    protocol: Protocol,
    /// HTTP verb, or the procedure name for RPC.
    method: String,
    /// Request path for HTTP, the procedure for RPC.
    address: String,
    uri: Option<Uri>,
    headers: Headers,
    raw_body: Bytes,
    params: HashMap<String, String>,
    query: OnceLock<Vec<(String, String)>>,
    start: Instant,
}

impl ServerRequest {
    /// An HTTP request. `uri` supplies the path and query string.
    #[must_use]
    pub fn http(method: impl Into<String>, uri: Uri, headers: Headers, body: Bytes) -> Self {
        Self {
            protocol: Protocol::Http,
            method: method.into().to_ascii_uppercase(),
            address: uri.path().to_string(),
            uri: Some(uri),
            headers,
            raw_body: body,
            params: HashMap::new(),
            query: OnceLock::new(),
            start: Instant::now(),
        }
    }

    /// A framed RPC request for `procedure` (`Service::Method`).
    #[must_use]
    pub fn rpc(procedure: impl Into<String>, headers: Headers, body: Bytes) -> Self {
        let procedure = procedure.into();
        Self {
            protocol: Protocol::Rpc,
            method: procedure.clone(),
            address: procedure,
            uri: None,
            headers,
            raw_body: body,
            params: HashMap::new(),
            query: OnceLock::new(),
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    /// A path parameter captured by the router.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Decodes the body into `T` using the protocol's payload format.
    ///
    /// On failure a 400 response is written to `res` and `None` is returned,
    /// so the caller can simply return.
    pub fn read_and_unmarshal<T: DeserializeOwned>(&self, res: &mut ServerResponse) -> Option<T> {
        match codec::decode(self.protocol.payload_format(), &self.raw_body) {
            Ok(value) => Some(value),
            Err(err) => {
                let envelope = GatewayError::new(ErrorKind::BadRequest, "Could not parse request body")
                    .with_origin(Origin::Codec)
                    .with_cause(err);
                res.send_error(400, "Could not parse request body", Some(envelope));
                None
            }
        }
    }

    /// Checks that every header in `required` is present. Writes a 400 for
    /// the first one missing.
    pub fn check_headers<S: AsRef<str>>(&self, required: &[S], res: &mut ServerResponse) -> bool {
        match self.headers.first_missing(required) {
            None => true,
            Some(missing) => {
                res.send_error(
                    400,
                    format!("Missing mandatory header: {missing}"),
                    None,
                );
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Query string
    // -----------------------------------------------------------------------

    fn query_pairs(&self) -> &[(String, String)] {
        self.query.get_or_init(|| {
            self.uri
                .as_ref()
                .and_then(|uri| Query::<Vec<(String, String)>>::try_from_uri(uri).ok())
                .map(|Query(pairs)| pairs)
                .unwrap_or_default()
        })
    }

    /// First value for `key` in the query string.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query_pairs()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in order.
    #[must_use]
    pub fn query_values(&self, key: &str) -> Vec<&str> {
        self.query_pairs()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[must_use]
    pub fn has_query_value(&self, key: &str) -> bool {
        self.query_value(key).is_some()
    }

    /// Writes a 400 when `key` is absent from the query string.
    pub fn check_query_value(&self, key: &str, res: &mut ServerResponse) -> bool {
        if self.has_query_value(key) {
            true
        } else {
            res.send_error(400, format!("Missing mandatory query parameter: {key}"), None);
            false
        }
    }

    /// Parses `key` as a boolean. Absent keys yield `Some(None)`; a value
    /// that does not parse writes a 400 and yields `None`.
    pub fn query_bool(&self, key: &str, res: &mut ServerResponse) -> Option<Option<bool>> {
        self.parse_query(key, res)
    }

    pub fn query_int(&self, key: &str, res: &mut ServerResponse) -> Option<Option<i64>> {
        self.parse_query(key, res)
    }

    pub fn query_float(&self, key: &str, res: &mut ServerResponse) -> Option<Option<f64>> {
        self.parse_query(key, res)
    }

    fn parse_query<T: FromStr>(&self, key: &str, res: &mut ServerResponse) -> Option<Option<T>> {
        let Some(raw) = self.query_value(key) else {
            return Some(None);
        };
        if let Ok(value) = raw.parse() {
            Some(Some(value))
        } else {
            res.send_error(
                400,
                format!("Could not parse query parameter {key}: {raw}"),
                None,
            );
            None
        }
    }
}
