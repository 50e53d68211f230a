#![warn(clippy::pedantic, clippy::nursery, clippy::cargo, clippy::perf)]

//! # `metrics_tcp_collector`
//!
//! A telemetry pipeline: agents collect metrics and ship them over TCP to a
//! collector made of forked worker processes, each running its own
//! single-threaded reactor.
//!
//! Every message on the wire is a frame: ten zero-padded ASCII digits giving
//! the payload length, followed by the payload. See [`frame`].
//!
//! ## Async Support
//!
//! An async client transport is available via the `tokio` feature flag. When enabled,
//! `AsyncTransport` can be used from a Tokio runtime. Enable with:
//!
//! ```toml
//! [dependencies]
//! metrics_tcp_collector = { version = "...", features = ["tokio"] }
//! ```
//!
//! The collector side never needs Tokio: each worker drives its sockets with `mio`.
//!
//! See README and demos for details.

mod agent;
mod collector;
mod error;
mod events;
pub mod frame;
mod recorder;
mod transport;

pub use agent::{Agent, AgentHandle, Collect, Ship, default_host};
pub use collector::{
    Exit, Forked, HandlerError, MetricsSink, OsProcesses, ProcessControl, Reactor,
    ReactorConfig, ReactorHandle, RequestHandler, State, Supervisor, TcpCollector,
};
pub use error::MetricsError;
pub use events::{MetricData, MetricEvent, MetricKind, MetricMetadata, MetricOperation, Record};
pub use recorder::SnapshotRecorder;
#[cfg(feature = "tokio")]
pub use transport::AsyncTransport;
pub use transport::{HostList, Transport};
