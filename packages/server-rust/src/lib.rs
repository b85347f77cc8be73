//! Switchyard Server: an edge API gateway runtime.
//!
//! Inbound HTTP and framed RPC requests are routed to endpoints, each of
//! which runs an ordered execution stack ending in a workflow. Workflows
//! call downstream services through typed clients guarded by per-method
//! circuit breakers, retries and deadlines. [`gateway::GatewayBuilder`]
//! wires it all together at startup.

pub mod client;
pub mod gateway;
pub mod network;
pub mod rpc;
pub mod service;

pub use gateway::{init_logging_from, Gateway, GatewayBuilder};
