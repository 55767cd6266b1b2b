use crate::model::EventCategory;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to open log source {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("log source {path} is not a valid gzip stream")]
    InvalidCompression { path: PathBuf },
    #[error("failed reading log source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A line carried a category marker but did not decode as a log record.
#[derive(Debug, Error)]
#[error("line {line_no} matched {category} but failed to decode: {source}")]
pub struct ClassifyError {
    pub line_no: u64,
    pub category: EventCategory,
    #[source]
    pub source: serde_json::Error,
}

/// A batch could not be written. Logged and counted, never propagated.
#[derive(Debug, Error)]
#[error("failed to flush {events} {category} events: {source:#}")]
pub struct FlushError {
    pub category: EventCategory,
    pub events: usize,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host name must not be empty")]
    EmptyHost,
    #[error("log retrieval failed: {0:#}")]
    Retrieval(anyhow::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("ingestion failed for host {host}: {source}")]
    Host {
        host: String,
        #[source]
        source: HostError,
    },
    #[error("ingestion task for host {host} did not complete: {reason}")]
    TaskFailed { host: String, reason: String },
}

impl OrchestrationError {
    pub fn host(&self) -> &str {
        match self {
            Self::Host { host, .. } | Self::TaskFailed { host, .. } => host,
        }
    }
}
