//! Outbound clients: descriptors, transports, circuit breakers and the
//! call envelope that ties them together.

pub mod breaker;
pub mod call;
pub mod options;
pub mod response;
pub mod transport;

pub use breaker::{
    BreakerPermit, BreakerRejection, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry,
};
pub use call::{ClientCaller, ClientMethod, ClientOutcome};
pub use options::{AlternateRoute, CallTarget, ClientConfigError, ClientDescriptor, ClientProtocol, TimeoutOptions};
pub use response::{ClientResponse, DeclaredException, UnexpectedStatus};
pub use transport::{
    transport_for, FramedRpcTransport, GrpcTransport, HttpTransport, OutboundRequest, OutboundResponse, Transport,
    TransportError,
};
