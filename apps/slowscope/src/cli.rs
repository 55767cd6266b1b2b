use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "slowscope",
    about = "Ingest MongoDB server logs and rank the costliest slow query shapes"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Print machine-readable summaries.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Load host logs into a fresh run namespace.
    Ingest(IngestArgs),
    /// Rank query shapes in an existing namespace and write the report.
    Analyze(AnalyzeArgs),
    /// Ingest, then analyze the namespace just written.
    Run(RunArgs),
    Db(DbArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    /// Directory holding `<host>.log` or `<host>.log.gz` files.
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
    /// Hosts to ingest; defaults to the configured cluster members.
    #[arg(long = "host", value_name = "HOST:PORT")]
    pub hosts: Vec<String>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long, default_value_t = false)]
    pub keep_artifacts: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    #[arg(long)]
    pub top: Option<usize>,
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct IngestArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    /// Write into this namespace instead of deriving a new one.
    #[arg(long)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct AnalyzeArgs {
    #[arg(long)]
    pub namespace: String,
    #[command(flatten)]
    pub report: ReportArgs,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,
    #[command(flatten)]
    pub report: ReportArgs,
    /// Keep everything in process memory instead of ClickHouse.
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,
}

#[derive(Debug, Args)]
pub struct DbArgs {
    #[command(subcommand)]
    pub command: DbCommand,
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Ping,
    Doctor {
        #[arg(long)]
        namespace: Option<String>,
    },
}
