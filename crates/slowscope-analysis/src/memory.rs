use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slowscope_ingest_core::{EventCategory, EventSink, LogEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::domain::{PrimaryTransition, QueryShapeRollup};
use crate::error::{AnalysisError, AnalysisResult};
use crate::repo::SlowQueryRepository;

const BYTES_READ: &[&str] = &["storage", "data", "bytesRead"];
const BYTES_WRITTEN: &[&str] = &["storage", "data", "bytesWritten"];
const DURATION_MILLIS: &[&str] = &["durationMillis"];
const NUM_YIELDS: &[&str] = &["numYields"];

/// In-process namespace: keeps written batches and answers the same
/// queries as the ClickHouse repository. Used by dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryCollections>,
}

#[derive(Default)]
struct MemoryCollections {
    events: HashMap<EventCategory, Vec<LogEvent>>,
    rollups: Vec<QueryShapeRollup>,
}

type GroupKey = (String, String, bool);

struct Group {
    count: u64,
    totals: [i64; 4],
    maxima: [i64; 4],
    example: (DateTime<Utc>, String, LogEvent),
}

impl Group {
    fn new(metrics: [i64; 4], event: &LogEvent, doc: String) -> Self {
        Self {
            count: 1,
            totals: metrics,
            maxima: metrics,
            example: (event.t, doc, event.clone()),
        }
    }

    fn add(&mut self, metrics: [i64; 4], event: &LogEvent, doc: String) {
        self.count += 1;
        for (idx, value) in metrics.into_iter().enumerate() {
            self.totals[idx] = self.totals[idx].saturating_add(value);
            self.maxima[idx] = self.maxima[idx].max(value);
        }
        if (event.t, &doc) < (self.example.0, &self.example.1) {
            self.example = (event.t, doc, event.clone());
        }
    }

    fn into_rollup(self, (driver, hash, is_collscan): GroupKey) -> QueryShapeRollup {
        let avg = |idx: usize| self.totals[idx] as f64 / self.count as f64;
        QueryShapeRollup {
            driver,
            hash,
            is_collscan,
            count: self.count,
            total_bytes_read: self.totals[0],
            total_bytes_written: self.totals[1],
            total_duration_millis: self.totals[2],
            total_num_yields: self.totals[3],
            max_bytes_read: self.maxima[0],
            max_written: self.maxima[1],
            max_duration_millis: self.maxima[2],
            max_num_yields: self.maxima[3],
            avg_bytes_read: avg(0),
            avg_written: avg(1),
            avg_duration_millis: avg(2),
            avg_num_yields: avg(3),
            query_example: self.example.2,
        }
    }
}

fn driver_of(metadata: &LogEvent) -> String {
    format!(
        "{}:{}",
        metadata.attr_str(&["doc", "driver", "name"]),
        metadata.attr_str(&["doc", "driver", "version"])
    )
}

fn metrics_of(event: &LogEvent) -> [i64; 4] {
    [
        event.attr_i64(BYTES_READ),
        event.attr_i64(BYTES_WRITTEN),
        event.attr_i64(DURATION_MILLIS),
        event.attr_i64(NUM_YIELDS),
    ]
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self, category: EventCategory) -> Vec<LogEvent> {
        self.inner
            .lock()
            .expect("memory store mutex poisoned")
            .events
            .get(&category)
            .cloned()
            .unwrap_or_default()
    }

    pub fn rollups(&self) -> Vec<QueryShapeRollup> {
        self.inner
            .lock()
            .expect("memory store mutex poisoned")
            .rollups
            .clone()
    }
}

#[async_trait]
impl EventSink for MemoryStore {
    async fn insert_events(&self, category: EventCategory, events: &[LogEvent]) -> AnyResult<()> {
        self.inner
            .lock()
            .expect("memory store mutex poisoned")
            .events
            .entry(category)
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }
}

#[async_trait]
impl SlowQueryRepository for MemoryStore {
    async fn build_rollups(&self) -> AnalysisResult<()> {
        let mut guard = self.inner.lock().expect("memory store mutex poisoned");
        let inner = &mut *guard;

        let mut drivers_by_ctxhost: HashMap<&str, Vec<String>> = HashMap::new();
        for metadata in inner
            .events
            .get(&EventCategory::ClientMetadata)
            .into_iter()
            .flatten()
        {
            drivers_by_ctxhost
                .entry(metadata.ctxhost.as_str())
                .or_default()
                .push(driver_of(metadata));
        }

        let mut groups: BTreeMap<GroupKey, Group> = BTreeMap::new();
        for event in inner
            .events
            .get(&EventCategory::SlowQuery)
            .into_iter()
            .flatten()
        {
            let hash = event.attr_str(&["queryHash"]);
            if hash.is_empty() {
                continue;
            }
            let Some(drivers) = drivers_by_ctxhost.get(event.ctxhost.as_str()) else {
                continue;
            };

            let is_collscan = event.attr_str(&["planSummary"]) == "COLLSCAN";
            let metrics = metrics_of(event);
            let doc = serde_json::to_string(event).map_err(|err| {
                AnalysisError::backend(format!("failed to encode slow query {hash}: {err}"))
            })?;
            // Each matching metadata event counts once, like the join does.
            for driver in drivers {
                let key = (driver.clone(), hash.to_string(), is_collscan);
                match groups.get_mut(&key) {
                    Some(group) => group.add(metrics, event, doc.clone()),
                    None => {
                        groups.insert(key, Group::new(metrics, event, doc.clone()));
                    }
                }
            }
        }

        let rollups: Vec<QueryShapeRollup> = groups
            .into_iter()
            .map(|(key, group)| group.into_rollup(key))
            .collect();
        inner.rollups = rollups;
        Ok(())
    }

    async fn top_rollups(&self, limit: usize) -> AnalysisResult<Vec<QueryShapeRollup>> {
        let mut rollups = self.rollups();
        rollups.sort_by(|a, b| {
            b.total_duration_millis
                .cmp(&a.total_duration_millis)
                .then_with(|| a.driver.cmp(&b.driver))
                .then_with(|| a.hash.cmp(&b.hash))
                .then_with(|| a.is_collscan.cmp(&b.is_collscan))
        });
        rollups.truncate(limit);
        Ok(rollups)
    }

    async fn slowest_example(&self, hash: &str) -> AnalysisResult<Option<LogEvent>> {
        let inner = self.inner.lock().expect("memory store mutex poisoned");
        let slowest = inner
            .events
            .get(&EventCategory::SlowQuery)
            .into_iter()
            .flatten()
            .filter(|event| event.attr_str(&["queryHash"]) == hash)
            .fold(None::<&LogEvent>, |best, event| match best {
                Some(current)
                    if (current.attr_i64(DURATION_MILLIS), std::cmp::Reverse(current.t))
                        >= (event.attr_i64(DURATION_MILLIS), std::cmp::Reverse(event.t)) =>
                {
                    Some(current)
                }
                _ => Some(event),
            });
        Ok(slowest.cloned())
    }

    async fn primary_transitions(&self) -> AnalysisResult<Vec<PrimaryTransition>> {
        let mut transitions: Vec<PrimaryTransition> = self
            .events(EventCategory::PrimaryTransition)
            .into_iter()
            .map(|event| PrimaryTransition {
                host: event.host,
                t: event.t,
            })
            .collect();
        transitions.sort_by(|a, b| a.t.cmp(&b.t).then_with(|| a.host.cmp(&b.host)));
        Ok(transitions)
    }
}
