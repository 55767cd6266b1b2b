mod cli;

use crate::cli::{
    AnalyzeArgs, Cli, CliCommand, DbCommand, IngestArgs, ReportArgs, RunArgs, SourceArgs,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use serde_json::json;
use slowscope_analysis::{
    analyze, report_prompt, AnalysisOutcome, ClickHouseSlowQueryRepository, MemoryStore,
    PromptOnlyRenderer, ReportRenderer, SlowQueryRepository,
};
use slowscope_clickhouse::{run_namespace, ClickHouseClient, DoctorReport};
use slowscope_config::AppConfig;
use slowscope_ingest_core::{
    hosts_from_connection_string, ingest_cluster, ClickHouseEventSink, EventSink, IngestMetrics,
    IngestOptions, IngestReport, LocalLogRetriever, LogWindow,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn load_cfg(raw_config: Option<PathBuf>) -> Result<(PathBuf, AppConfig)> {
    let explicit = raw_config.is_some();
    let config_path = slowscope_config::resolve_config_path(raw_config);
    if !explicit && !config_path.exists() {
        warn!("no config at {}; using defaults", config_path.display());
        return Ok((config_path, slowscope_config::default_config()));
    }
    let cfg = slowscope_config::load_config(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    Ok((config_path, cfg))
}

fn resolve_hosts(cfg: &AppConfig, overrides: &[String]) -> Result<Vec<String>> {
    if !overrides.is_empty() {
        let hosts: Vec<String> = overrides
            .iter()
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .collect();
        if hosts.is_empty() {
            bail!("--host values must not be blank");
        }
        return Ok(hosts);
    }
    if !cfg.cluster.hosts.is_empty() {
        return Ok(cfg.cluster.hosts.clone());
    }
    if !cfg.cluster.connection_string.is_empty() {
        return hosts_from_connection_string(&cfg.cluster.connection_string)
            .context("failed to read hosts from cluster.connection_string");
    }
    bail!("no hosts to ingest: set cluster.hosts, cluster.connection_string or pass --host")
}

fn ingest_options(cfg: &AppConfig, source: &SourceArgs) -> IngestOptions {
    let mut options = IngestOptions::from(&cfg.ingest);
    if let Some(batch_size) = source.batch_size {
        options.batch_size = batch_size.max(1);
    }
    options.keep_artifacts |= source.keep_artifacts;
    options
}

fn new_namespace(cfg: &AppConfig) -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    run_namespace(&cfg.cluster.name, &stamp)
}

async fn ingest_into<S>(
    cfg: &AppConfig,
    source: &SourceArgs,
    sink: Arc<S>,
) -> Result<(IngestReport, Arc<IngestMetrics>)>
where
    S: EventSink + 'static,
{
    let hosts = resolve_hosts(cfg, &source.hosts)?;
    let log_dir = source
        .log_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.ingest.log_dir));
    let window = LogWindow::from_iso8601_period(&cfg.cluster.period, Utc::now())
        .context("invalid cluster.period")?;
    let options = ingest_options(cfg, source);
    let metrics = Arc::new(IngestMetrics::default());

    info!(
        "ingesting {} hosts from {} (batch_size={}, workers={})",
        hosts.len(),
        log_dir.display(),
        options.batch_size,
        options.max_host_workers
    );

    let report = ingest_cluster(
        Arc::new(LocalLogRetriever::new(log_dir)),
        sink,
        metrics.clone(),
        &hosts,
        window,
        options,
    )
    .await?;
    Ok((report, metrics))
}

async fn cmd_ingest(
    cfg: &AppConfig,
    clickhouse: &ClickHouseClient,
    args: &IngestArgs,
) -> Result<(String, IngestReport)> {
    let namespace = match &args.namespace {
        Some(namespace) => namespace.clone(),
        None => new_namespace(cfg),
    };
    let ch = clickhouse.for_namespace(&namespace)?;
    ch.ensure_namespace()
        .await
        .with_context(|| format!("failed to create namespace {namespace}"))?;

    let sink = Arc::new(ClickHouseEventSink::new(ch));
    let (report, metrics) = ingest_into(cfg, &args.source, sink).await?;
    let snapshot = metrics.snapshot();
    info!(
        "namespace={} lines={} events_written={} flush_failures={}",
        namespace, snapshot.lines_read, snapshot.events_written, snapshot.flush_failures
    );
    Ok((namespace, report))
}

async fn cmd_analyze<R>(
    repo: &R,
    cfg: &AppConfig,
    args: &ReportArgs,
) -> Result<(PathBuf, AnalysisOutcome)>
where
    R: SlowQueryRepository + ?Sized,
{
    let top = args.top.unwrap_or(cfg.report.top_n);
    let outcome = analyze(repo, top).await?;

    let prompt = report_prompt(&outcome.ranked, &outcome.transitions);
    let report = PromptOnlyRenderer.render(&prompt).await?;
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.report.output_file));
    std::fs::write(&output, report)
        .with_context(|| format!("failed to write report {}", output.display()))?;
    Ok((output, outcome))
}

fn render_ingest(json_output: bool, namespace: &str, report: &IngestReport) -> Result<()> {
    if json_output {
        let hosts: Vec<_> = report
            .hosts
            .iter()
            .map(|h| {
                json!({
                    "host": h.host,
                    "lines_read": h.lines_read,
                    "events": h.batches.total_events(),
                    "flushes": h.batches.flushes,
                    "failed_flushes": h.batches.failed_flushes,
                })
            })
            .collect();
        let summary = json!({
            "namespace": namespace,
            "hosts": hosts,
            "artifacts_removed": report.artifacts_removed,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("namespace: {namespace}");
    for host in &report.hosts {
        println!(
            "  {}: {} lines, {} events, {} flushes ({} failed)",
            host.host,
            host.lines_read,
            host.batches.total_events(),
            host.batches.flushes,
            host.batches.failed_flushes
        );
    }
    Ok(())
}

fn render_analysis(json_output: bool, output: &Path, outcome: &AnalysisOutcome) -> Result<()> {
    if json_output {
        let summary = json!({
            "report": output.display().to_string(),
            "ranked": outcome.ranked,
            "transitions": outcome.transitions,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    for shape in &outcome.ranked {
        println!(
            "{:>3}. {} {}{} total={}ms count={} slowest={}ms",
            shape.rank,
            shape.rollup.driver,
            shape.rollup.hash,
            if shape.rollup.is_collscan { " COLLSCAN" } else { "" },
            shape.rollup.total_duration_millis,
            shape.rollup.count,
            shape.slowest.event.attr_i64(&["durationMillis"])
        );
    }
    println!("report: {}", output.display());
    Ok(())
}

fn render_db_doctor(json_output: bool, report: &DoctorReport) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "clickhouse: {}",
        if report.clickhouse_healthy { "healthy" } else { "unreachable" }
    );
    if let Some(version) = &report.clickhouse_version {
        println!("clickhouse version: {version}");
    }
    println!("database: {}", report.database);
    println!("database exists: {}", report.database_exists);
    println!(
        "missing tables: {}",
        if report.missing_tables.is_empty() {
            "none".to_string()
        } else {
            report.missing_tables.join(", ")
        }
    );
    if !report.errors.is_empty() {
        println!("errors: {}", report.errors.join(" | "));
    }
    Ok(())
}

fn doctor_is_healthy(report: &DoctorReport) -> bool {
    report.clickhouse_healthy
        && report.database_exists
        && report.missing_tables.is_empty()
        && report.errors.is_empty()
}

async fn cmd_run(
    cfg: &AppConfig,
    clickhouse: &ClickHouseClient,
    args: &RunArgs,
    json_output: bool,
) -> Result<()> {
    if args.in_memory {
        let store = Arc::new(MemoryStore::new());
        let (report, _) = ingest_into(cfg, &args.source, store.clone()).await?;
        render_ingest(json_output, "memory", &report)?;
        let (output, outcome) = cmd_analyze(&*store, cfg, &args.report).await?;
        return render_analysis(json_output, &output, &outcome);
    }

    let ingest_args = IngestArgs {
        source: args.source.clone(),
        namespace: None,
    };
    let (namespace, report) = cmd_ingest(cfg, clickhouse, &ingest_args).await?;
    render_ingest(json_output, &namespace, &report)?;

    let repo = ClickHouseSlowQueryRepository::new(clickhouse.for_namespace(&namespace)?);
    let (output, outcome) = cmd_analyze(&repo, cfg, &args.report).await?;
    render_analysis(json_output, &output, &outcome)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (config_path, cfg) = load_cfg(cli.config.clone())?;
    info!("using config {}", config_path.display());
    let clickhouse = ClickHouseClient::new(cfg.clickhouse.clone())?;

    match cli.command {
        CliCommand::Ingest(args) => {
            let (namespace, report) = cmd_ingest(&cfg, &clickhouse, &args).await?;
            render_ingest(cli.json, &namespace, &report)?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Analyze(AnalyzeArgs { namespace, report }) => {
            let repo = ClickHouseSlowQueryRepository::new(clickhouse.for_namespace(&namespace)?);
            let (output, outcome) = cmd_analyze(&repo, &cfg, &report).await?;
            render_analysis(cli.json, &output, &outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Run(args) => {
            cmd_run(&cfg, &clickhouse, &args, cli.json).await?;
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Db(args) => match args.command {
            DbCommand::Ping => {
                clickhouse.ping().await.context("clickhouse ping failed")?;
                println!("clickhouse: ok ({})", cfg.clickhouse.url);
                Ok(ExitCode::SUCCESS)
            }
            DbCommand::Doctor { namespace } => {
                let ch = match namespace {
                    Some(namespace) => clickhouse.for_namespace(&namespace)?,
                    None => clickhouse.clone(),
                };
                let report = ch.doctor_report().await?;
                render_db_doctor(cli.json, &report)?;
                if doctor_is_healthy(&report) {
                    Ok(ExitCode::SUCCESS)
                } else {
                    Ok(ExitCode::from(1))
                }
            }
        },
    }
}
