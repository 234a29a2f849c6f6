//! meshlet: worker-side control-plane runtime for multi-service hosts.
//!
//! Each worker process owns one duplex channel back to its parent
//! orchestrator and uses it for typed request/response/notification
//! messaging, log shipping, service-mesh HTTP interception, and bind
//! reporting. Losing the channel is fatal: the worker exits with the
//! reserved disconnect code instead of running unsupervised.

pub mod bridge;
pub mod config;
mod fd_redirect;
pub mod listen;
pub mod logging;
pub mod mesh;
pub mod worker;

pub use bridge::channel::{
    CHANNEL_LOST_EXIT_CODE, ChannelError, ChannelEvent, ChannelLost, DuplexChannel,
};
pub use bridge::endpoint::{CommandHandler, ControlEndpoint, EndpointOptions, RequestError};
pub use bridge::envelope::{Envelope, EnvelopeId, EnvelopeKind, WireError};
pub use config::{LoggerOptions, PortPlan, WorkerContext};
pub use listen::{BindOptions, ListenReporter};
pub use logging::{ControlTracingLayer, LogRecord};
pub use mesh::dispatch::{DispatchError, DispatchHandler, DispatchRequest, Dispatcher};
pub use mesh::interceptor::{INTERNAL_HOST_SUFFIX, MeshInterceptor};
pub use mesh::network::NetworkDispatcher;
pub use worker::{WorkerRuntime, attach};
