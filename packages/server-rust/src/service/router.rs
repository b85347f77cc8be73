//! Endpoint registry and dispatch.
//!
//! HTTP endpoints live in a segment trie: literal children are tried
//! first, then a single `:param` child, then a trailing `*` tail that
//! swallows the rest of the path. RPC endpoints are matched exactly on
//! `Service::Method`.
//!
//! The table is read on every request and written only while the gateway
//! is being assembled, so it sits behind an [`ArcSwap`]: dispatch is a
//! lock-free load, registration clones the table, modifies the copy and
//! stores it back under a writer mutex.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use switchyard_core::GatewayError;

use super::endpoint::{Endpoint, EndpointRef};
use super::request::{Protocol, ServerRequest};

/// Param key used for an unnamed trailing wildcard.
pub const WILDCARD_PARAM: &str = "*";

// ---------------------------------------------------------------------------
// RouteError
// ---------------------------------------------------------------------------

/// Registration failures. All of them are configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("endpoint already registered for {protocol} {method} {address}")]
    Duplicate {
        protocol: &'static str,
        method: String,
        address: String,
    },

    #[error("path must start with '/': {path}")]
    InvalidPath { path: String },

    #[error("wildcard is only allowed as the last segment: {path}")]
    MisplacedWildcard { path: String },

    #[error("conflicting path parameters :{existing} and :{requested} in {path}")]
    ParamConflict {
        existing: String,
        requested: String,
        path: String,
    },

    #[error("empty parameter name in {path}")]
    EmptyParam { path: String },
}

impl From<RouteError> for GatewayError {
    fn from(err: RouteError) -> Self {
        GatewayError::configuration(err.to_string())
            .with_location("router::register")
            .with_cause(err)
    }
}

// ---------------------------------------------------------------------------
// Path trie
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ParamChild {
    name: String,
    node: Node,
}

#[derive(Debug, Clone, Default)]
struct WildcardTail {
    name: String,
    /// Verb -> endpoint.
    handlers: HashMap<String, EndpointRef>,
}

#[derive(Debug, Clone, Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<ParamChild>>,
    wildcard: Option<WildcardTail>,
    /// Verb -> endpoint for a path ending at this node.
    handlers: HashMap<String, EndpointRef>,
}

enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    Wildcard(&'a str),
}

fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

fn parse_template(path: &str) -> Result<Vec<Segment<'_>>, RouteError> {
    if !path.starts_with('/') {
        return Err(RouteError::InvalidPath { path: path.to_string() });
    }
    let raw = split_path(path);
    let last = raw.len().saturating_sub(1);
    raw.iter()
        .enumerate()
        .map(|(i, seg)| {
            if let Some(name) = seg.strip_prefix('*') {
                if i != last {
                    return Err(RouteError::MisplacedWildcard { path: path.to_string() });
                }
                Ok(Segment::Wildcard(if name.is_empty() { WILDCARD_PARAM } else { name }))
            } else if let Some(name) = seg.strip_prefix(':') {
                if name.is_empty() {
                    return Err(RouteError::EmptyParam { path: path.to_string() });
                }
                Ok(Segment::Param(name))
            } else if seg.contains('*') {
                Err(RouteError::MisplacedWildcard { path: path.to_string() })
            } else {
                Ok(Segment::Literal(seg))
            }
        })
        .collect()
}

impl Node {
    fn insert(&mut self, path: &str, method: &str, endpoint: EndpointRef) -> Result<(), RouteError> {
        let duplicate = || RouteError::Duplicate {
            protocol: Protocol::Http.as_str(),
            method: method.to_string(),
            address: path.to_string(),
        };

        let mut node = self;
        for segment in parse_template(path)? {
            match segment {
                Segment::Literal(lit) => {
                    node = node.literals.entry(lit.to_string()).or_default();
                }
                Segment::Param(name) => {
                    let child = node.param.get_or_insert_with(|| {
                        Box::new(ParamChild {
                            name: name.to_string(),
                            node: Node::default(),
                        })
                    });
                    if child.name != name {
                        return Err(RouteError::ParamConflict {
                            existing: child.name.clone(),
                            requested: name.to_string(),
                            path: path.to_string(),
                        });
                    }
                    node = &mut child.node;
                }
                Segment::Wildcard(name) => {
                    let tail = node.wildcard.get_or_insert_with(|| WildcardTail {
                        name: name.to_string(),
                        handlers: HashMap::new(),
                    });
                    if tail.name != name {
                        return Err(RouteError::ParamConflict {
                            existing: tail.name.clone(),
                            requested: name.to_string(),
                            path: path.to_string(),
                        });
                    }
                    if tail.handlers.contains_key(method) {
                        return Err(duplicate());
                    }
                    tail.handlers.insert(method.to_string(), endpoint);
                    return Ok(());
                }
            }
        }

        if node.handlers.contains_key(method) {
            return Err(duplicate());
        }
        node.handlers.insert(method.to_string(), endpoint);
        Ok(())
    }

    /// Depth-first lookup. `path_matched` is set when some route matches
    /// the path under any verb, which distinguishes 405 from 404.
    fn find<'n>(
        &'n self,
        segments: &[&str],
        method: &str,
        params: &mut Vec<(String, String)>,
        path_matched: &mut bool,
    ) -> Option<&'n EndpointRef> {
        let Some((head, rest)) = segments.split_first() else {
            *path_matched |= !self.handlers.is_empty();
            return self.handlers.get(method);
        };

        if let Some(child) = self.literals.get(*head) {
            if let Some(found) = child.find(rest, method, params, path_matched) {
                return Some(found);
            }
        }

        if let Some(param) = &self.param {
            params.push((param.name.clone(), (*head).to_string()));
            if let Some(found) = param.node.find(rest, method, params, path_matched) {
                return Some(found);
            }
            params.pop();
        }

        if let Some(tail) = &self.wildcard {
            *path_matched |= !tail.handlers.is_empty();
            if let Some(found) = tail.handlers.get(method) {
                params.push((tail.name.clone(), segments.join("/")));
                return Some(found);
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct RouteTable {
    http: Node,
    rpc: HashMap<String, EndpointRef>,
    endpoints: Vec<EndpointRef>,
}

/// Registry of endpoints keyed by `(protocol, method, address)`.
#[derive(Default)]
pub struct Router {
    table: ArcSwap<RouteTable>,
    writer: Mutex<()>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint under its descriptor.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteError`] when the address collides with an existing
    /// registration or the path template is malformed. The table is left
    /// unchanged on error.
    pub fn register(&self, endpoint: Endpoint) -> Result<EndpointRef, RouteError> {
        let endpoint = Arc::new(endpoint);
        let _guard = self.writer.lock();
        let mut table = RouteTable::clone(&self.table.load());

        let d = endpoint.descriptor();
        match d.protocol {
            Protocol::Http => {
                table.http.insert(&d.address, &d.method, Arc::clone(&endpoint))?;
            }
            Protocol::Rpc => {
                if table.rpc.contains_key(&d.address) {
                    return Err(RouteError::Duplicate {
                        protocol: Protocol::Rpc.as_str(),
                        method: d.method.clone(),
                        address: d.address.clone(),
                    });
                }
                table.rpc.insert(d.address.clone(), Arc::clone(&endpoint));
            }
        }
        table.endpoints.push(Arc::clone(&endpoint));

        tracing::debug!(
            endpoint_id = %d.endpoint_id,
            handler_id = %d.handler_id,
            protocol = d.protocol.as_str(),
            method = %d.method,
            address = %d.address,
            "Registered endpoint"
        );
        self.table.store(Arc::new(table));
        Ok(endpoint)
    }

    /// Resolves an HTTP verb and path.
    ///
    /// # Errors
    ///
    /// `NotFound` (404) when no template matches the path, and `NotFound`
    /// with status 405 when the path is registered for other verbs.
    pub fn dispatch_http(
        &self,
        method: &str,
        path: &str,
    ) -> Result<(EndpointRef, HashMap<String, String>), GatewayError> {
        let table = self.table.load();
        let segments = split_path(path);
        let method = method.to_ascii_uppercase();
        let mut params = Vec::new();
        let mut path_matched = false;

        match table.http.find(&segments, &method, &mut params, &mut path_matched) {
            Some(endpoint) => Ok((Arc::clone(endpoint), params.into_iter().collect())),
            None if path_matched => Err(GatewayError::method_not_allowed(format!(
                "Method {method} not allowed for {path}"
            ))
            .with_location("router::dispatch")),
            None => Err(GatewayError::not_found(format!("No endpoint registered for {path}"))
                .with_location("router::dispatch")),
        }
    }

    /// Resolves an RPC procedure (`Service::Method`).
    ///
    /// # Errors
    ///
    /// `NotFound` when no endpoint serves the procedure.
    pub fn dispatch_rpc(&self, procedure: &str) -> Result<EndpointRef, GatewayError> {
        self.table
            .load()
            .rpc
            .get(procedure)
            .cloned()
            .ok_or_else(|| {
                GatewayError::not_found(format!("no such procedure: {procedure}"))
                    .with_location("router::dispatch")
            })
    }

    /// Resolves `req` and stores captured path params on it.
    ///
    /// # Errors
    ///
    /// See [`Router::dispatch_http`] and [`Router::dispatch_rpc`].
    pub fn dispatch(&self, req: &mut ServerRequest) -> Result<EndpointRef, GatewayError> {
        match req.protocol() {
            Protocol::Http => {
                let (endpoint, params) = self.dispatch_http(req.method(), req.address())?;
                req.set_params(params);
                Ok(endpoint)
            }
            Protocol::Rpc => self.dispatch_rpc(req.address()),
        }
    }

    /// Every registered endpoint, in registration order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndpointRef> {
        self.table.load().endpoints.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("endpoints", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
