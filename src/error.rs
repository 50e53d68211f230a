use crate::{frame::FrameError, recorder::SnapshotRecorder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to set SnapshotRecorder: {0}")]
    Recorder(#[from] metrics::SetRecorderError<SnapshotRecorder>),
    #[error("couldnt serialize record: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("failed to deserialize record: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid host entry {0:?}, expected host:port")]
    InvalidHost(String),
    #[error("process control failed: {0}")]
    Process(#[from] nix::errno::Errno),
    #[error("too many worker restarts ({restarts}), giving up")]
    RestartBudgetExceeded { restarts: usize },
    #[error("collector rejected the record with {0:?}")]
    Rejected(String),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("delivery failed on all {hosts} hosts")]
    TransportExhausted { hosts: usize },
}
