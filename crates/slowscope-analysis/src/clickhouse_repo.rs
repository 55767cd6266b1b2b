use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use slowscope_clickhouse::{escape_identifier, escape_literal, ClickHouseClient};
use slowscope_ingest_core::{EventCategory, LogEvent};
use tracing::{debug, info};

use crate::domain::{PrimaryTransition, QueryShapeRollup};
use crate::error::{AnalysisError, AnalysisResult};
use crate::repo::SlowQueryRepository;

pub const ROLLUP_TABLE: &str = "slowQueriesByDriver";

/// Repository over one run namespace. The client must already be bound to
/// that namespace via `ClickHouseClient::for_namespace`.
#[derive(Clone)]
pub struct ClickHouseSlowQueryRepository {
    ch: ClickHouseClient,
}

#[derive(Debug, Deserialize)]
struct DocRow {
    doc: String,
}

#[derive(Debug, Deserialize)]
struct TransitionRow {
    host: String,
    t_ms: i64,
}

impl ClickHouseSlowQueryRepository {
    pub fn new(ch: ClickHouseClient) -> Self {
        Self { ch }
    }

    pub fn namespace(&self) -> &str {
        self.ch.database()
    }

    fn table_ref(&self, table: &str) -> String {
        format!(
            "{}.{}",
            escape_identifier(self.ch.database()),
            escape_identifier(table)
        )
    }

    fn map_backend<T>(&self, result: AnyResult<T>) -> AnalysisResult<T> {
        result.map_err(|err| AnalysisError::backend(format!("{err:#}")))
    }

    fn rollup_insert_sql(&self) -> String {
        format!(
            "INSERT INTO {rollups} \
             SELECT \
               m.driver AS driver, \
               s.queryHash AS hash, \
               s.planSummary = 'COLLSCAN' AS isCollscan, \
               count() AS count, \
               sum(s.bytesRead) AS totalBytesRead, \
               sum(s.bytesWritten) AS totalBytesWritten, \
               sum(s.durationMillis) AS totalDurationMillis, \
               sum(s.numYields) AS totalNumYields, \
               max(s.bytesRead) AS maxBytesRead, \
               max(s.bytesWritten) AS maxWritten, \
               max(s.durationMillis) AS maxDurationMillis, \
               max(s.numYields) AS maxNumYields, \
               avg(s.bytesRead) AS avgBytesRead, \
               avg(s.bytesWritten) AS avgWritten, \
               avg(s.durationMillis) AS avgDurationMillis, \
               avg(s.numYields) AS avgNumYields, \
               argMin(s.doc, (s.t, s.doc)) AS queryExample \
             FROM {slow} AS s \
             ALL INNER JOIN {metadata} AS m ON s.ctxhost = m.ctxhost \
             WHERE s.queryHash != '' \
             GROUP BY driver, hash, isCollscan",
            rollups = self.table_ref(ROLLUP_TABLE),
            slow = self.table_ref(EventCategory::SlowQuery.collection()),
            metadata = self.table_ref(EventCategory::ClientMetadata.collection()),
        )
    }
}

#[async_trait]
impl SlowQueryRepository for ClickHouseSlowQueryRepository {
    async fn build_rollups(&self) -> AnalysisResult<()> {
        let truncate = format!("TRUNCATE TABLE {}", self.table_ref(ROLLUP_TABLE));
        self.map_backend(self.ch.execute(&truncate).await)?;
        self.map_backend(self.ch.execute(&self.rollup_insert_sql()).await)?;
        info!("rebuilt {} in {}", ROLLUP_TABLE, self.namespace());
        Ok(())
    }

    async fn top_rollups(&self, limit: usize) -> AnalysisResult<Vec<QueryShapeRollup>> {
        let query = format!(
            "SELECT driver, hash, isCollscan, count, \
               totalBytesRead, totalBytesWritten, totalDurationMillis, totalNumYields, \
               maxBytesRead, maxWritten, maxDurationMillis, maxNumYields, \
               avgBytesRead, avgWritten, avgDurationMillis, avgNumYields, queryExample \
             FROM {} \
             ORDER BY totalDurationMillis DESC, driver ASC, hash ASC, isCollscan ASC \
             LIMIT {} \
             FORMAT JSONEachRow",
            self.table_ref(ROLLUP_TABLE),
            limit
        );
        let rows = self.map_backend(self.ch.query_json_each_row(&query, None).await)?;
        debug!("loaded {} rollups from {}", rows.len(), self.namespace());
        Ok(rows)
    }

    async fn slowest_example(&self, hash: &str) -> AnalysisResult<Option<LogEvent>> {
        let query = format!(
            "SELECT doc FROM {} \
             WHERE queryHash = {} \
             ORDER BY durationMillis DESC, t ASC \
             LIMIT 1 \
             FORMAT JSONEachRow",
            self.table_ref(EventCategory::SlowQuery.collection()),
            escape_literal(hash)
        );
        let rows: Vec<DocRow> = self.map_backend(self.ch.query_json_each_row(&query, None).await)?;
        rows.into_iter()
            .next()
            .map(|row| {
                serde_json::from_str::<LogEvent>(&row.doc).map_err(|err| {
                    AnalysisError::backend(format!("stored slow query {hash} is not an event: {err}"))
                })
            })
            .transpose()
    }

    async fn primary_transitions(&self) -> AnalysisResult<Vec<PrimaryTransition>> {
        let query = format!(
            "SELECT host, toUnixTimestamp64Milli(t) AS t_ms FROM {} \
             ORDER BY t ASC, host ASC \
             FORMAT JSONEachRow",
            self.table_ref(EventCategory::PrimaryTransition.collection())
        );
        let rows: Vec<TransitionRow> =
            self.map_backend(self.ch.query_json_each_row(&query, None).await)?;

        rows.into_iter()
            .map(|row| {
                let t = Utc.timestamp_millis_opt(row.t_ms).single().ok_or_else(|| {
                    AnalysisError::backend(format!("invalid transition time {}", row.t_ms))
                })?;
                Ok(PrimaryTransition { host: row.host, t })
            })
            .collect()
    }
}
