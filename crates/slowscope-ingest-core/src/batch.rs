use crate::error::FlushError;
use crate::model::{EventCategory, LogEvent};
use crate::IngestMetrics;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Destination for flushed batches, one call per (category, batch).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn insert_events(&self, category: EventCategory, events: &[LogEvent]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub events: [u64; 3],
    pub flushes: u64,
    pub failed_flushes: u64,
}

impl BatchStats {
    pub fn events_for(&self, category: EventCategory) -> u64 {
        self.events[category.index()]
    }

    pub fn total_events(&self) -> u64 {
        self.events.iter().sum()
    }
}

/// Three independent per-category buffers for one stream. A buffer is flushed
/// as soon as it reaches the threshold; the others are left alone.
pub struct BatchAccumulator<'a, S: ?Sized> {
    sink: &'a S,
    metrics: &'a IngestMetrics,
    host: &'a str,
    threshold: usize,
    buffers: [Vec<LogEvent>; 3],
    stats: BatchStats,
}

impl<'a, S: EventSink + ?Sized> BatchAccumulator<'a, S> {
    pub fn new(sink: &'a S, metrics: &'a IngestMetrics, host: &'a str, threshold: usize) -> Self {
        Self {
            sink,
            metrics,
            host,
            threshold: threshold.max(1),
            buffers: Default::default(),
            stats: BatchStats::default(),
        }
    }

    pub fn pending(&self, category: EventCategory) -> usize {
        self.buffers[category.index()].len()
    }

    pub async fn push(&mut self, event: LogEvent) {
        let category = event.category;
        let idx = category.index();
        self.buffers[idx].push(event);
        self.stats.events[idx] += 1;

        if self.buffers[idx].len() >= self.threshold {
            self.flush(category).await;
        }
    }

    /// Flushes every non-empty buffer once, in category order.
    pub async fn finish(mut self) -> BatchStats {
        for category in EventCategory::ALL {
            self.flush(category).await;
        }
        self.stats
    }

    async fn flush(&mut self, category: EventCategory) {
        // Taken up front: a failed write still drops the batch.
        let batch = std::mem::take(&mut self.buffers[category.index()]);
        if batch.is_empty() {
            return;
        }

        debug!(
            "writing {} batch of {} events for host={}",
            category,
            batch.len(),
            self.host
        );
        self.stats.flushes += 1;
        self.metrics.flushes.fetch_add(1, Ordering::Relaxed);

        match self.sink.insert_events(category, &batch).await {
            Ok(()) => {
                self.metrics
                    .events_written
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Err(source) => {
                let err = FlushError {
                    category,
                    events: batch.len(),
                    source,
                };
                self.stats.failed_flushes += 1;
                self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                *self
                    .metrics
                    .last_error
                    .lock()
                    .expect("metrics last_error mutex poisoned") = err.to_string();
                warn!("host={}: {err}", self.host);
            }
        }
    }
}
