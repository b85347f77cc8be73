//! Switchyard Core: config store, header container, error envelope, trace
//! context and payload codecs shared by the gateway runtime.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod trace;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use codec::{CodecError, PayloadFormat};
pub use config::{ConfigError, StaticConfig};
pub use error::{ErrorBody, ErrorBuilder, ErrorKind, GatewayError, Origin};
pub use header::Headers;
pub use trace::SpanContext;
