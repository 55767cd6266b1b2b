pub mod batch;
pub mod classify;
pub mod decode;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod retrieval;
pub mod sink;

pub use crate::batch::{BatchAccumulator, BatchStats, EventSink};
pub use crate::classify::{classify_line, match_category};
pub use crate::decode::{decode_reader, open_log_stream, LogLines, LogStream};
pub use crate::error::{ClassifyError, DecodeError, FlushError, HostError, OrchestrationError};
pub use crate::model::{EventCategory, LogEvent};
pub use crate::orchestrator::{
    cleanup_artifacts, ingest_cluster, ingest_host_stream, HostIngestSummary, IngestOptions,
    IngestReport,
};
pub use crate::retrieval::{
    hosts_from_connection_string, LocalLogRetriever, LogArtifact, LogRetriever, LogWindow,
};
pub use crate::sink::ClickHouseEventSink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Run-wide counters shared by every host task.
#[derive(Default)]
pub struct IngestMetrics {
    pub lines_read: AtomicU64,
    pub events_classified: AtomicU64,
    pub events_written: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub last_error: Mutex<String>,
}

impl IngestMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lines_read: self.lines_read.load(Ordering::Relaxed),
            events_classified: self.events_classified.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .expect("metrics last_error mutex poisoned")
                .clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub events_classified: u64,
    pub events_written: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub last_error: String,
}
