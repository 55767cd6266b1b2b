mod clickhouse_repo;
mod domain;
mod engine;
mod error;
mod memory;
mod repo;
pub mod report;

pub use clickhouse_repo::{ClickHouseSlowQueryRepository, ROLLUP_TABLE};
pub use domain::{
    AnalysisOutcome, PrimaryTransition, QueryShapeRollup, RankedShape, SlowQueryRecord,
};
pub use engine::{analyze, rank_query_shapes};
pub use error::{AnalysisError, AnalysisResult};
pub use memory::MemoryStore;
pub use repo::SlowQueryRepository;
pub use report::{
    primary_transition_context, report_prompt, slow_query_prompt, PromptOnlyRenderer,
    ReportRenderer,
};
