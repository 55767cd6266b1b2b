use async_trait::async_trait;
use slowscope_ingest_core::LogEvent;

use crate::domain::{PrimaryTransition, QueryShapeRollup};
use crate::error::AnalysisResult;

/// Read side of a run namespace.
#[async_trait]
pub trait SlowQueryRepository: Send + Sync {
    /// Recomputes the per-driver query shape rollups from scratch, replacing
    /// whatever a previous call stored.
    async fn build_rollups(&self) -> AnalysisResult<()>;

    /// Rollups by total duration, descending; ties by (driver, hash,
    /// isCollscan) ascending.
    async fn top_rollups(&self, limit: usize) -> AnalysisResult<Vec<QueryShapeRollup>>;

    /// Slow query with this hash and the largest `durationMillis`.
    async fn slowest_example(&self, hash: &str) -> AnalysisResult<Option<LogEvent>>;

    async fn primary_transitions(&self) -> AnalysisResult<Vec<PrimaryTransition>>;
}
