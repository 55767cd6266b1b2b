use crate::batch::{BatchAccumulator, BatchStats, EventSink};
use crate::classify::classify_line;
use crate::decode::{open_log_stream, LogLines, LogStream};
use crate::error::{HostError, OrchestrationError};
use crate::retrieval::{LogRetriever, LogWindow};
use crate::IngestMetrics;
use slowscope_config::IngestConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub max_host_workers: usize,
    pub keep_artifacts: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            max_host_workers: 8,
            keep_artifacts: false,
        }
    }
}

impl From<&IngestConfig> for IngestOptions {
    fn from(cfg: &IngestConfig) -> Self {
        Self {
            batch_size: cfg.batch_size,
            max_host_workers: cfg.max_host_workers,
            keep_artifacts: cfg.keep_artifacts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIngestSummary {
    pub host: String,
    pub lines_read: u64,
    pub batches: BatchStats,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// One entry per host, in the order the hosts were given.
    pub hosts: Vec<HostIngestSummary>,
    pub artifacts_removed: usize,
}

impl IngestReport {
    pub fn total_events(&self) -> u64 {
        self.hosts.iter().map(|h| h.batches.total_events()).sum()
    }

    pub fn failed_flushes(&self) -> u64 {
        self.hosts.iter().map(|h| h.batches.failed_flushes).sum()
    }
}

/// Decodes, classifies and batches one host's stream to completion. A decode
/// or classify error stops the host immediately; batches still buffered at
/// that point are not written.
pub async fn ingest_host_stream<S>(
    sink: &S,
    metrics: &IngestMetrics,
    host: &str,
    source: &Path,
    stream: LogStream,
    batch_size: usize,
) -> Result<HostIngestSummary, HostError>
where
    S: EventSink + ?Sized,
{
    if host.trim().is_empty() {
        return Err(HostError::EmptyHost);
    }

    let mut lines = LogLines::new(source, stream);
    let mut accumulator = BatchAccumulator::new(sink, metrics, host, batch_size);

    while let Some(line) = lines.next_line()? {
        metrics.lines_read.fetch_add(1, Ordering::Relaxed);
        if let Some(event) = classify_line(&line, lines.line_no(), host)? {
            metrics.events_classified.fetch_add(1, Ordering::Relaxed);
            accumulator.push(event).await;
        }
    }

    let lines_read = lines.line_no();
    let batches = accumulator.finish().await;
    info!(
        "host={} lines={} events={} flushes={} failed_flushes={}",
        host,
        lines_read,
        batches.total_events(),
        batches.flushes,
        batches.failed_flushes
    );

    Ok(HostIngestSummary {
        host: host.to_string(),
        lines_read,
        batches,
    })
}

async fn ingest_host<R, S>(
    retriever: &R,
    sink: &S,
    metrics: &IngestMetrics,
    ledger: &Mutex<Vec<PathBuf>>,
    host: &str,
    window: &LogWindow,
    batch_size: usize,
) -> Result<HostIngestSummary, HostError>
where
    R: LogRetriever + ?Sized,
    S: EventSink + ?Sized,
{
    info!("retrieving logs for host={host}");
    let artifact = retriever
        .fetch(host, window)
        .await
        .map_err(HostError::Retrieval)?;

    if artifact.temporary {
        ledger
            .lock()
            .expect("artifact ledger mutex poisoned")
            .push(artifact.path.clone());
    }

    debug!("host={} reading {}", host, artifact.path.display());
    let stream = open_log_stream(&artifact.path)?;
    ingest_host_stream(sink, metrics, host, &artifact.path, stream, batch_size).await
}

/// Runs one task per host, at most `max_host_workers` at a time, and waits
/// for all of them. If any host fails, every temporary artifact is removed
/// and the first failure to complete is returned. Rows already written are
/// left in the store.
pub async fn ingest_cluster<R, S>(
    retriever: Arc<R>,
    sink: Arc<S>,
    metrics: Arc<IngestMetrics>,
    hosts: &[String],
    window: LogWindow,
    options: IngestOptions,
) -> Result<IngestReport, OrchestrationError>
where
    R: LogRetriever + ?Sized + 'static,
    S: EventSink + ?Sized + 'static,
{
    if let Some(host) = hosts.iter().find(|host| host.trim().is_empty()) {
        return Err(OrchestrationError::Host {
            host: host.clone(),
            source: HostError::EmptyHost,
        });
    }

    let sem = Arc::new(Semaphore::new(options.max_host_workers.max(1)));
    let ledger = Arc::new(Mutex::new(Vec::<PathBuf>::new()));
    let mut tasks = JoinSet::new();

    for (idx, host) in hosts.iter().cloned().enumerate() {
        let retriever = retriever.clone();
        let sink = sink.clone();
        let metrics = metrics.clone();
        let ledger = ledger.clone();
        let sem = sem.clone();

        tasks.spawn(async move {
            let work_host = host.clone();
            let work = tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|_| "host worker pool closed".to_string())?;
                Ok::<_, String>(
                    ingest_host(
                        &*retriever,
                        &*sink,
                        &metrics,
                        &ledger,
                        &work_host,
                        &window,
                        options.batch_size,
                    )
                    .await,
                )
            });

            let result = match work.await {
                Ok(Ok(Ok(summary))) => Ok(summary),
                Ok(Ok(Err(source))) => Err(OrchestrationError::Host {
                    host: host.clone(),
                    source,
                }),
                Ok(Err(reason)) => Err(OrchestrationError::TaskFailed {
                    host: host.clone(),
                    reason,
                }),
                Err(join_err) => Err(OrchestrationError::TaskFailed {
                    host: host.clone(),
                    reason: join_err.to_string(),
                }),
            };
            (idx, result)
        });
    }

    let mut summaries = Vec::with_capacity(hosts.len());
    let mut first_error: Option<OrchestrationError> = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, Ok(summary))) => summaries.push((idx, summary)),
            Ok((_, Err(err))) => {
                error!("{err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            Err(join_err) => {
                error!("host task join failed: {join_err}");
                if first_error.is_none() {
                    first_error = Some(OrchestrationError::TaskFailed {
                        host: "unknown".to_string(),
                        reason: join_err.to_string(),
                    });
                }
            }
        }
    }

    let artifacts = std::mem::take(&mut *ledger.lock().expect("artifact ledger mutex poisoned"));

    if let Some(err) = first_error {
        let removed = cleanup_artifacts(&artifacts).await;
        warn!(
            "ingestion aborted by host={}; removed {} of {} artifacts",
            err.host(),
            removed,
            artifacts.len()
        );
        return Err(err);
    }

    let artifacts_removed = if options.keep_artifacts {
        info!("keeping {} downloaded artifacts", artifacts.len());
        0
    } else {
        cleanup_artifacts(&artifacts).await
    };

    summaries.sort_by_key(|(idx, _)| *idx);
    Ok(IngestReport {
        hosts: summaries.into_iter().map(|(_, summary)| summary).collect(),
        artifacts_removed,
    })
}

/// Best-effort removal; every path is attempted even when one fails.
pub async fn cleanup_artifacts(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => removed += 1,
            Err(exc) if exc.kind() == std::io::ErrorKind::NotFound => {}
            Err(exc) => warn!("failed to delete artifact {}: {exc}", path.display()),
        }
    }
    removed
}
