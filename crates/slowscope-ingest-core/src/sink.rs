use crate::batch::EventSink;
use crate::model::{EventCategory, LogEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use slowscope_clickhouse::ClickHouseClient;

const CLICKHOUSE_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Writes each batch into the namespace table named after its category.
#[derive(Clone)]
pub struct ClickHouseEventSink {
    clickhouse: ClickHouseClient,
}

impl ClickHouseEventSink {
    pub fn new(clickhouse: ClickHouseClient) -> Self {
        Self { clickhouse }
    }
}

/// Column layout shared by the three raw event tables. `attr` is stored as
/// JSON text and `doc` keeps the whole event for later retrieval.
pub fn event_row(event: &LogEvent) -> Result<Value> {
    let attr = serde_json::to_string(&event.attr).context("failed to encode attr")?;
    let doc = serde_json::to_string(event).context("failed to encode event document")?;

    Ok(json!({
        "t": event.t.format(CLICKHOUSE_TS_FORMAT).to_string(),
        "s": event.s,
        "c": event.c,
        "id": event.id,
        "ctx": event.ctx,
        "msg": event.msg,
        "attr": attr,
        "host": event.host,
        "ctxhost": event.ctxhost,
        "doc": doc,
    }))
}

#[async_trait]
impl EventSink for ClickHouseEventSink {
    async fn insert_events(&self, category: EventCategory, events: &[LogEvent]) -> Result<()> {
        let rows = events.iter().map(event_row).collect::<Result<Vec<_>>>()?;
        self.clickhouse
            .insert_json_rows(category.collection(), &rows)
            .await
            .with_context(|| {
                format!(
                    "insert into {}.{} failed",
                    self.clickhouse.database(),
                    category.collection()
                )
            })
    }
}
