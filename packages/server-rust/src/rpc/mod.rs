//! Framed binary RPC: wire frames, the inbound listener and deputy
//! forwarding.

pub mod connection;
pub mod deputy;
pub mod frame;
pub mod server;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry, OutboundFrame, SendError};
pub use deputy::{DeputyConfig, DeputyForwarder};
pub use frame::{RpcErrorCode, RpcRequestFrame, RpcResponseFrame, RpcStatus};
pub use server::{process_request, RpcServer};
