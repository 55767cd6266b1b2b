use tracing::{info, warn};

use crate::domain::{AnalysisOutcome, RankedShape, SlowQueryRecord};
use crate::error::{AnalysisError, AnalysisResult};
use crate::repo::SlowQueryRepository;

/// Takes the `limit` costliest rollups and pairs each with its slowest
/// event, attributed to the rollup's driver. A rollup without any matching
/// slow query means the namespace is inconsistent and aborts the ranking.
pub async fn rank_query_shapes<R>(repo: &R, limit: usize) -> AnalysisResult<Vec<RankedShape>>
where
    R: SlowQueryRepository + ?Sized,
{
    let rollups = repo.top_rollups(limit).await?;
    let mut ranked = Vec::with_capacity(rollups.len());

    for (idx, rollup) in rollups.into_iter().enumerate() {
        let Some(event) = repo.slowest_example(&rollup.hash).await? else {
            return Err(AnalysisError::consistency(rollup.hash));
        };
        ranked.push(RankedShape {
            rank: idx + 1,
            slowest: SlowQueryRecord {
                driver: rollup.driver.clone(),
                event,
            },
            rollup,
        });
    }

    Ok(ranked)
}

/// Rebuilds the rollups, ranks them, and collects the primary transitions
/// that give the report its timeline.
pub async fn analyze<R>(repo: &R, limit: usize) -> AnalysisResult<AnalysisOutcome>
where
    R: SlowQueryRepository + ?Sized,
{
    repo.build_rollups().await?;
    let ranked = rank_query_shapes(repo, limit).await?;
    if ranked.is_empty() {
        warn!("no slow query shapes matched client metadata");
    }

    let transitions = repo.primary_transitions().await?;
    info!(
        "ranked {} query shapes; {} primary transitions",
        ranked.len(),
        transitions.len()
    );
    Ok(AnalysisOutcome {
        ranked,
        transitions,
    })
}
