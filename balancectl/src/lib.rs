use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use balance_core::{
    acquire_code, http_client, latest_screenshot, load_scraper_config, push_metrics,
    render_exposition, render_gauge, search_for_dir, to_metrics, ErrorKind, ExtractedTable,
    JailEntry, Metric, MetricColumns, RetryPolicy, RunLedger, RunRecord, ScraperConfig, Url,
};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] balance_core::ConfigError),
    #[error("{0}")]
    Scrape(#[from] balance_core::ScrapeError),
    #[error("ledger error: {0}")]
    Ledger(#[from] balance_core::LedgerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Balance retrieval control interface", long_about = None)]
pub struct Cli {
    /// Path to scraper.toml
    #[arg(long, default_value = "configs/scraper.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// One-time code relay
    #[command(subcommand)]
    Otp(OtpCommands),
    /// Convert extracted tables into metrics
    #[command(subcommand)]
    Metrics(MetricsCommands),
    /// Retrieval history
    #[command(subcommand)]
    Runs(RunsCommands),
    /// Institutions held back after a captured failure
    #[command(subcommand)]
    Jail(JailCommands),
    /// Diagnostic captures
    #[command(subcommand)]
    Artifacts(ArtifactsCommands),
}

#[derive(Subcommand, Debug)]
pub enum OtpCommands {
    /// Wait for a one-time code for an institution and print it
    Wait(OtpWaitArgs),
}

#[derive(Args, Debug)]
pub struct OtpWaitArgs {
    /// Institution name as listed in the config
    #[arg(long)]
    pub institution: String,
    /// Override the configured OTP directory
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Override the configured timeout
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum MetricsCommands {
    /// Render exposition text from a JSON table dump
    Render(MetricsArgs),
    /// Render and PUT to a push gateway
    Push(MetricsPushArgs),
}

#[derive(Args, Debug)]
pub struct MetricsArgs {
    /// JSON file holding a list of tables
    #[arg(long)]
    pub input: PathBuf,
    #[arg(long)]
    pub institution: String,
    #[arg(long, default_value = "account")]
    pub account_col: String,
    #[arg(long, default_value = "symbol")]
    pub symbol_col: String,
    #[arg(long, default_value = "balance")]
    pub value_col: String,
    #[arg(long, default_value = "account_type")]
    pub account_type_col: String,
    /// Metric name
    #[arg(long, default_value = balance_core::TOTAL_ASSETS)]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct MetricsPushArgs {
    #[command(flatten)]
    pub metrics: MetricsArgs,
    /// Push gateway base URL
    #[arg(long)]
    pub gateway: String,
    #[arg(long, default_value = "balances")]
    pub job: String,
}

#[derive(Subcommand, Debug)]
pub enum RunsCommands {
    /// Most recent retrieval runs
    List(RunsListArgs),
    /// Pass/fail status per institution with the newest screenshot of each failure
    Report(RunsReportArgs),
}

#[derive(Args, Debug)]
pub struct RunsReportArgs {
    #[arg(long, value_enum, default_value_t = ReportFilter::All)]
    pub include: ReportFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFilter {
    All,
    Success,
    Fail,
}

#[derive(Args, Debug)]
pub struct RunsListArgs {
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum JailCommands {
    /// Institutions currently jailed
    List,
    /// Let an institution run again
    Release(JailReleaseArgs),
}

#[derive(Args, Debug)]
pub struct JailReleaseArgs {
    pub institution: String,
}

#[derive(Subcommand, Debug)]
pub enum ArtifactsCommands {
    /// Newest screenshot, optionally for one institution
    Latest(ArtifactsLatestArgs),
}

#[derive(Args, Debug)]
pub struct ArtifactsLatestArgs {
    #[arg(long)]
    pub institution: Option<String>,
}

pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Otp(OtpCommands::Wait(args)) => {
            let code = context.otp_wait(args)?;
            render(&code, cli.format)?;
        }
        Commands::Metrics(MetricsCommands::Render(args)) => {
            let rendered = context.metrics_render(args)?;
            render(&rendered, cli.format)?;
        }
        Commands::Metrics(MetricsCommands::Push(args)) => {
            let pushed = context.metrics_push(args)?;
            render(&pushed, cli.format)?;
        }
        Commands::Runs(RunsCommands::List(args)) => {
            let runs = RunList {
                rows: context.ledger()?.recent_runs(args.limit)?,
            };
            render(&runs, cli.format)?;
        }
        Commands::Runs(RunsCommands::Report(args)) => {
            let report = context.runs_report(args.include)?;
            render(&report, cli.format)?;
        }
        Commands::Jail(JailCommands::List) => {
            let jail = JailList {
                rows: context.ledger()?.jailed()?,
            };
            render(&jail, cli.format)?;
        }
        Commands::Jail(JailCommands::Release(args)) => {
            if !context.ledger()?.release(&args.institution)? {
                return Err(AppError::MissingResource(format!(
                    "{} is not jailed",
                    args.institution
                )));
            }
            render(
                &Released {
                    institution: args.institution.clone(),
                },
                cli.format,
            )?;
        }
        Commands::Artifacts(ArtifactsCommands::Latest(args)) => {
            let artifact = context.latest_artifact(args.institution.as_deref())?;
            render(&artifact, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ScraperConfig,
    config_dir: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_scraper_config(&cli.config)?;
        let config_dir = cli
            .config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self { config, config_dir })
    }

    /// Relative config paths resolve against the working directory first,
    /// then against the directory holding the config file.
    fn resolve(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() || path.exists() {
            return path;
        }
        let beside = self.config_dir.join(&path);
        if beside.exists() {
            beside
        } else {
            path
        }
    }

    fn ledger(&self) -> Result<RunLedger> {
        let observability = &self.config.observability;
        Ok(RunLedger::new(
            self.resolve(&observability.failure_log),
            self.resolve(&observability.ledger_db),
        )?)
    }

    fn runtime() -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?)
    }

    fn otp_wait(&self, args: &OtpWaitArgs) -> Result<OtpCode> {
        let mut mfa = self.config.mfa_for(&args.institution);
        mfa.otp_source_directory = match &args.dir {
            Some(dir) => dir.clone(),
            None => self.resolve(&self.config.mfa.otp_source_directory),
        };
        if let Some(timeout) = args.timeout_ms {
            mfa.timeout = Duration::from_millis(timeout);
        }
        let code = Self::runtime()?.block_on(acquire_code(&mfa))?;
        Ok(OtpCode {
            institution: args.institution.clone(),
            code,
        })
    }

    fn metrics(&self, args: &MetricsArgs) -> Result<Vec<Metric>> {
        let tables: Vec<ExtractedTable> = serde_json::from_str(&fs::read_to_string(&args.input)?)?;
        let columns = MetricColumns::new(
            &args.account_col,
            &args.symbol_col,
            &args.value_col,
            &args.account_type_col,
        );
        Ok(to_metrics(&tables, &args.institution, &columns)?)
    }

    fn metrics_render(&self, args: &MetricsArgs) -> Result<RenderedMetrics> {
        let metrics = self.metrics(args)?;
        let exposition = render_exposition(&args.name, &metrics);
        Ok(RenderedMetrics {
            name: args.name.clone(),
            metrics,
            exposition,
        })
    }

    fn metrics_push(&self, args: &MetricsPushArgs) -> Result<PushReport> {
        let gateway = Url::parse(&args.gateway)
            .map_err(|err| AppError::InvalidArgument(format!("gateway {}: {err}", args.gateway)))?;
        let metrics = self.metrics(&args.metrics)?;
        let body = render_gauge(&args.metrics.name, "Balance reported by the institution", &metrics);
        let policy = RetryPolicy::new(self.config.retry.clone());
        let client = http_client()?;
        let outcome = Self::runtime()?.block_on(push_metrics(
            &client,
            &gateway,
            &args.job,
            &body,
            &policy,
        ))?;
        info!(job = %args.job, samples = metrics.len(), "metrics pushed");
        Ok(PushReport {
            job: args.job.clone(),
            samples: metrics.len(),
            attempts: outcome.attempts,
        })
    }

    fn error_dir(&self) -> PathBuf {
        let configured = self.resolve(&self.config.diagnostics.error_dir);
        if configured.is_dir() {
            return configured;
        }
        std::env::current_dir()
            .ok()
            .and_then(|cwd| search_for_dir(&cwd, "errors"))
            .unwrap_or(configured)
    }

    /// Latest outcome per institution. Failed or jailed institutions carry
    /// the jail screenshot, else the newest one in the error directory.
    fn runs_report(&self, include: ReportFilter) -> Result<RunsReport> {
        let ledger = self.ledger()?;
        let jailed = ledger.jailed()?;
        let error_dir = self.error_dir();
        let mut rows = Vec::new();
        for run in ledger.latest_runs()? {
            let jail = jailed
                .iter()
                .find(|entry| entry.institution.eq_ignore_ascii_case(&run.institution));
            let passed = run.success && jail.is_none();
            let wanted = match include {
                ReportFilter::All => true,
                ReportFilter::Success => passed,
                ReportFilter::Fail => !passed,
            };
            if !wanted {
                continue;
            }
            let screenshot = if passed {
                None
            } else {
                match jail.and_then(|entry| entry.screenshot.clone()) {
                    Some(path) => Some(path),
                    None if error_dir.is_dir() => {
                        latest_screenshot(&error_dir, Some(&run.institution))?
                    }
                    None => None,
                }
            };
            rows.push(ReportRow {
                institution: run.institution.clone(),
                passed,
                jailed: jail.is_some(),
                last_run: run.timestamp,
                error_kind: run.error_kind,
                screenshot,
            });
        }
        Ok(RunsReport { rows })
    }

    fn latest_artifact(&self, institution: Option<&str>) -> Result<LatestArtifact> {
        let error_dir = self.error_dir();
        if !error_dir.is_dir() {
            return Err(AppError::MissingResource(format!(
                "error directory {}",
                error_dir.display()
            )));
        }
        let screenshot = latest_screenshot(&error_dir, institution)?;
        Ok(LatestArtifact {
            error_dir,
            snapshot: screenshot.as_ref().map(|path| path.with_extension("html")),
            screenshot,
        })
    }
}

#[derive(Debug, Serialize)]
struct OtpCode {
    institution: String,
    code: String,
}

impl DisplayFallback for OtpCode {
    fn display(&self) -> String {
        self.code.clone()
    }
}

#[derive(Debug, Serialize)]
struct RenderedMetrics {
    name: String,
    metrics: Vec<Metric>,
    #[serde(skip)]
    exposition: String,
}

impl DisplayFallback for RenderedMetrics {
    fn display(&self) -> String {
        self.exposition.trim_end().to_string()
    }
}

#[derive(Debug, Serialize)]
struct PushReport {
    job: String,
    samples: usize,
    attempts: usize,
}

impl DisplayFallback for PushReport {
    fn display(&self) -> String {
        format!(
            "pushed {} samples to job {} in {} attempt(s)",
            self.samples, self.job, self.attempts
        )
    }
}

#[derive(Debug, Serialize)]
struct RunList {
    rows: Vec<RunRecord>,
}

impl DisplayFallback for RunList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No runs recorded".to_string();
        }
        let mut lines = Vec::new();
        for run in &self.rows {
            let outcome = match (&run.error_kind, run.success) {
                (_, true) => "ok".to_string(),
                (Some(kind), false) => format!("failed ({kind})"),
                (None, false) => "failed".to_string(),
            };
            lines.push(format!(
                "{} | {} | {} | {}ms{}",
                run.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                run.institution,
                outcome,
                run.duration_ms,
                run.artifact
                    .as_ref()
                    .map(|path| format!(" | {}", path.display()))
                    .unwrap_or_default(),
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ReportRow {
    institution: String,
    passed: bool,
    jailed: bool,
    last_run: DateTime<Utc>,
    error_kind: Option<ErrorKind>,
    screenshot: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunsReport {
    rows: Vec<ReportRow>,
}

impl DisplayFallback for RunsReport {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Nothing to report".to_string();
        }
        let passed = self.rows.iter().filter(|row| row.passed).count();
        let mut lines = vec![format!(
            "{} passed, {} failed",
            passed,
            self.rows.len() - passed
        )];
        for row in &self.rows {
            let status = match (row.passed, row.jailed, row.error_kind) {
                (true, _, _) => "passed".to_string(),
                (false, true, _) => "jailed".to_string(),
                (false, false, Some(kind)) => format!("failed ({kind})"),
                (false, false, None) => "failed".to_string(),
            };
            lines.push(format!(
                "{} | {} | {}{}",
                row.institution,
                status,
                row.last_run.to_rfc3339_opts(SecondsFormat::Secs, true),
                row.screenshot
                    .as_ref()
                    .map(|path| format!(" | {}", path.display()))
                    .unwrap_or_default(),
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct JailList {
    rows: Vec<JailEntry>,
}

impl DisplayFallback for JailList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "Jail is empty".to_string();
        }
        self.rows
            .iter()
            .map(|entry| {
                format!(
                    "{} | since {} | {} | {}",
                    entry.institution,
                    entry.jailed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    entry.reason,
                    entry
                        .screenshot
                        .as_ref()
                        .map(|path| path.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
struct Released {
    institution: String,
}

impl DisplayFallback for Released {
    fn display(&self) -> String {
        format!("{} released", self.institution)
    }
}

#[derive(Debug, Serialize)]
struct LatestArtifact {
    error_dir: PathBuf,
    screenshot: Option<PathBuf>,
    snapshot: Option<PathBuf>,
}

impl DisplayFallback for LatestArtifact {
    fn display(&self) -> String {
        match &self.screenshot {
            Some(path) => path.display().to_string(),
            None => format!("No screenshots in {}", self.error_dir.display()),
        }
    }
}
