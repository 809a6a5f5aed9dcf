use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Socket gateway failures. Fatal when raised during startup.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("address {addr} is already in use")]
    AddressInUse { addr: String },
    #[error("no connection has been accepted yet")]
    NotConnected,
    #[error("a connection from {peer} is already active")]
    AlreadyConnected { peer: SocketAddr },
    #[error("line contains an embedded newline")]
    InvalidLine,
    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True when the active connection can no longer be written to.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::WriteZero
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expected {expected} fields, found {found}")]
    Arity { expected: usize, found: usize },
    #[error("column {column}: {value:?} is not a number")]
    InvalidNumber { column: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error("feature vector has {found} values, model expects {expected}")]
    FeatureLength { expected: usize, found: usize },
    #[error("feature {index} is not finite")]
    NonFinite { index: usize },
    #[error("model produced no prediction for this row")]
    Missing,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink i/o: {0}")]
    Io(#[from] io::Error),
    #[error("sink {0} is closed")]
    Closed(&'static str),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("read model artifact: {0}")]
    Io(#[from] io::Error),
    #[error("decode model artifact: {0}")]
    Format(#[from] serde_json::Error),
    #[error("model references unknown feature column {0:?}")]
    UnknownFeature(String),
    #[error("model has {features} features but {coefficients} coefficients")]
    Shape { features: usize, coefficients: usize },
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("series i/o: {0}")]
    Io(#[from] io::Error),
    #[error("series csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("no series found for entities {0:?}")]
    NoSeries(Vec<u32>),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("batch {seq}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        seq: u64,
        from: crate::engine::BatchState,
        to: crate::engine::BatchState,
    },
}

/// Errors that stop the pipeline from starting.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
