use anyhow::Result;
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::fmt::Write as _;

use crate::domain::{PrimaryTransition, RankedShape};

const PROMPT_PREAMBLE: &str = "\
Your job is to generate a markdown report analyzing the provided MongoDB slow queries. \
Focus on why they are slow (missing indexes, query antipatterns and the like). Keep it concise and pragmatic: \
use lists for your findings, and tie each suggestion to the statistics provided \
(for example, fewer bytes read means less disk pressure).
For the ESR rule, analyze the role of each field in the query as equality, sort or range; \
only direct equality and the $in operator count as equality operators.
Don't just point out whether an index is used; suggest superior indexes when applicable, following the ESR guideline.
Mention the originating driver so the reader knows where a query comes from.
Use the slowest query log provided with each query shape to support your points, \
and include it as a code block in that shape's section.
";

/// Markdown prompt describing the ranked shapes, one section per shape.
pub fn slow_query_prompt(records: &[RankedShape]) -> String {
    let mut prompt = String::from("# Slow query analysis\n\n");
    prompt.push_str(PROMPT_PREAMBLE);
    let _ = writeln!(
        prompt,
        "There are {} slow query shapes to analyze, each getting its own section. \
         Below is the slowest query from each shape:",
        records.len()
    );

    for record in records {
        let rollup = &record.rollup;
        let _ = writeln!(prompt, "\n## Slow query shape no. {}\n", record.rank);
        let _ = writeln!(prompt, "Query shape appearances: {}", rollup.count);
        let _ = writeln!(prompt, "Avg Bytes Read: {:.6}", rollup.avg_bytes_read);
        let _ = writeln!(prompt, "Avg Bytes Written: {:.6}", rollup.avg_written);
        let _ = writeln!(prompt, "Avg Duration Millis: {:.6}", rollup.avg_duration_millis);
        let _ = writeln!(
            prompt,
            "Total Duration of slow queries (Millis): {}",
            rollup.total_duration_millis
        );
        let _ = writeln!(prompt, "Avg Num Yields: {:.6}", rollup.avg_num_yields);
        let _ = writeln!(prompt, "Originating driver: {}", record.slowest.driver);
        prompt.push_str("Slowest query log:\n\n```json\n");
        let attr = serde_json::to_string_pretty(&record.slowest.event.attr)
            .unwrap_or_else(|_| "{}".to_string());
        prompt.push_str(&attr);
        prompt.push_str("\n```\n\n");
    }

    prompt
}

/// `<host> became primary on <time>` lines joined with `; `, empty when no
/// node changed role during the window.
pub fn primary_transition_context(transitions: &[PrimaryTransition]) -> String {
    transitions
        .iter()
        .map(|tr| {
            format!(
                "{} became primary on {}",
                tr.host,
                tr.t.to_rfc3339_opts(SecondsFormat::Millis, true)
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Turns the analysis prompt into the final report text.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render(&self, prompt: &str) -> Result<String>;
}

/// Writes the prompt itself as the report, for runs without a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptOnlyRenderer;

#[async_trait]
impl ReportRenderer for PromptOnlyRenderer {
    async fn render(&self, prompt: &str) -> Result<String> {
        Ok(prompt.to_string())
    }
}

/// Prompt followed by the primary-transition context, when there is any.
pub fn report_prompt(records: &[RankedShape], transitions: &[PrimaryTransition]) -> String {
    let mut prompt = slow_query_prompt(records);
    let context = primary_transition_context(transitions);
    if !context.is_empty() {
        let _ = writeln!(
            prompt,
            "Additional context on when nodes became primary in the cluster: {context}."
        );
    }
    prompt
}
