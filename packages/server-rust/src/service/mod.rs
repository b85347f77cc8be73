//! Request execution framework.
//!
//! A request flows through these layers:
//!
//! 1. **Routing** (`router`): protocol, verb and path or procedure to an endpoint
//! 2. **Endpoint** (`endpoint`): span, metrics and panic recovery around one stack
//! 3. **Execution stack** (`stack`): ordered adapter nodes ending in a terminal
//! 4. **Workflow** (`workflow`): typed business logic behind the terminal
//!
//! `context`, `request` and `response` carry per-request state;
//! `metrics`, `tracer` and `logging` are the scoped observability handles;
//! `worker` and `runtime_metrics` run periodic background collection.

pub mod context;
pub mod endpoint;
pub mod logging;
pub mod metrics;
pub mod request;
pub mod response;
pub mod router;
pub mod runtime_metrics;
pub mod stack;
pub mod tracer;
pub mod worker;
pub mod workflow;

pub use context::{Annotations, RequestContext, REQUEST_UUID_HEADER};
pub use endpoint::{Endpoint, EndpointDescriptor, EndpointRef, RequestForwarder, DEPUTY_HEADER};
pub use logging::{init_logging, ContextLogger, LogOutput, LoggerConfig};
pub use metrics::{ContextMetrics, InMemoryMetrics, MetricsSink, RecorderSink};
pub use request::{Protocol, ServerRequest};
pub use response::{FlushedResponse, ResponseState, ServerResponse};
pub use router::{RouteError, Router};
pub use runtime_metrics::{start_runtime_metrics, RuntimeMetricsCollector, RuntimeMetricsOptions};
pub use stack::{ExecutionStack, SharedState, StackNode, Terminal};
pub use tracer::{FinishedSpan, InMemoryReporter, SpanReporter, Tracer};
pub use worker::{BackgroundRunnable, BackgroundWorker};
pub use workflow::{
    propagate_headers, BusinessException, NoException, Workflow, WorkflowHandler, WorkflowOutcome, WorkflowResponse,
};
