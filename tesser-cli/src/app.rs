use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tesser_config::{load_config, AppConfig};
use tesser_ledger::LedgerMutation;
use tesser_reconcile::{ReconciliationReport, ReportSink, ReportStore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::runtime::{build_runtime, open_ledger, open_report_store};
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{init_tracing, spawn_metrics_server, MetricsSink, ReconcileMetrics};

#[derive(Parser)]
#[command(author, version, about = "Tesser state reconciliation")]
pub struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Compare exchange state with the ledger
    Reconcile {
        #[command(subcommand)]
        action: ReconcileCommand,
    },
    /// Probe ledger and exchange readiness
    Health,
    /// Inspect persisted reconciliation reports
    Report {
        #[command(subcommand)]
        action: ReportCommand,
    },
    /// Maintain the ledger journal
    Ledger {
        #[command(subcommand)]
        action: LedgerCommand,
    },
}

#[derive(Subcommand)]
pub enum ReconcileCommand {
    /// Run a single session and print its summary
    Run(ReconcileRunArgs),
    /// Run sessions on a fixed interval until interrupted
    Watch(ReconcileWatchArgs),
}

#[derive(Subcommand)]
pub enum ReportCommand {
    /// Print a stored report in full
    Show(ReportShowArgs),
    /// Print summaries of the most recent reports
    List(ReportListArgs),
}

#[derive(Subcommand)]
pub enum LedgerCommand {
    /// Commit a JSON array of mutations as one atomic batch
    Import(LedgerImportArgs),
    /// Print the latest ledger version
    Show,
}

#[derive(Args)]
pub struct ReconcileRunArgs {
    /// Session deadline in seconds; defaults to reconciliation.session_timeout_secs
    #[arg(long)]
    timeout: Option<u64>,
    /// Exit with an error when the report contains critical discrepancies
    #[arg(long)]
    strict: bool,
    /// Include every discrepancy in the output, not only the summary
    #[arg(long)]
    details: bool,
}

#[derive(Args)]
pub struct ReconcileWatchArgs {
    /// Seconds between sessions; defaults to reconciliation.interval_secs
    #[arg(long)]
    interval: Option<u64>,
    /// Address for the Prometheus endpoint; defaults to metrics_addr
    #[arg(long)]
    metrics_addr: Option<String>,
}

#[derive(Args)]
pub struct ReportShowArgs {
    session_id: Uuid,
}

#[derive(Args)]
pub struct ReportListArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Args)]
pub struct LedgerImportArgs {
    file: PathBuf,
    /// Reference stored with every journal record of the batch
    #[arg(long)]
    reference: Option<String>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    init_tracing(&filter, config.log_path.as_deref()).context("failed to initialize logging")?;

    match cli.command {
        Commands::Reconcile {
            action: ReconcileCommand::Run(args),
        } => args.run(&config).await?,
        Commands::Reconcile {
            action: ReconcileCommand::Watch(args),
        } => args.run(&config).await?,
        Commands::Health => run_health(&config).await?,
        Commands::Report { action } => handle_report(action, &config)?,
        Commands::Ledger { action } => handle_ledger(action, &config)?,
    }

    Ok(())
}

impl ReconcileRunArgs {
    async fn run(&self, config: &AppConfig) -> Result<()> {
        let runtime = build_runtime(config, Vec::new())?;
        let timeout = self
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.reconciliation.session_timeout());
        let shutdown = ShutdownSignal::new();
        let report = runtime
            .engine
            .perform_full_reconciliation_with_cancel(timeout, shutdown.token())
            .await?;

        print_json(&report_output(&report, self.details))?;
        let critical = report.summary().critical_count;
        if self.strict && critical > 0 {
            bail!("reconciliation found {critical} critical discrepancies");
        }
        Ok(())
    }
}

impl ReconcileWatchArgs {
    async fn run(&self, config: &AppConfig) -> Result<()> {
        let metrics = Arc::new(ReconcileMetrics::new().context("failed to build metrics")?);
        let sinks: Vec<Arc<dyn ReportSink>> = vec![Arc::new(MetricsSink::new(metrics.clone()))];
        let runtime = build_runtime(config, sinks)?;

        let addr_raw = self
            .metrics_addr
            .clone()
            .unwrap_or_else(|| config.metrics_addr.clone());
        let addr: SocketAddr = addr_raw
            .parse()
            .with_context(|| format!("invalid metrics address {addr_raw}"))?;
        let metrics_task = spawn_metrics_server(metrics.registry(), addr);

        let interval = self
            .interval
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.reconciliation.interval());
        let shutdown = ShutdownSignal::new();
        info!(
            interval_secs = interval.as_secs(),
            exchanges = runtime.engine.exchanges().count(),
            "starting scheduled reconciliation"
        );
        let schedule = runtime
            .engine
            .clone()
            .spawn_schedule(interval, shutdown.token())?;

        shutdown.wait().await;
        if let Err(err) = schedule.await {
            warn!(error = %err, "reconciliation schedule ended abnormally");
        }
        metrics_task.abort();
        Ok(())
    }
}

async fn run_health(config: &AppConfig) -> Result<()> {
    let runtime = build_runtime(config, Vec::new())?;
    let status = runtime.engine.health_check().await;
    print_json(&status)?;
    if !status.engine_ready {
        bail!("engine is not ready");
    }
    Ok(())
}

fn handle_report(cmd: ReportCommand, config: &AppConfig) -> Result<()> {
    let store = open_report_store(&config.reports)?;
    match cmd {
        ReportCommand::Show(args) => {
            let Some(report) = store.get(args.session_id)? else {
                bail!("no report stored for session {}", args.session_id);
            };
            print_json(&report)?;
        }
        ReportCommand::List(args) => {
            let summaries: Vec<_> = store
                .recent(args.limit)?
                .iter()
                .map(ReconciliationReport::to_summary)
                .collect();
            print_json(&summaries)?;
        }
    }
    Ok(())
}

fn handle_ledger(cmd: LedgerCommand, config: &AppConfig) -> Result<()> {
    let ledger = open_ledger(&config.ledger)?;
    match cmd {
        LedgerCommand::Import(args) => {
            let raw = fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let mutations: Vec<LedgerMutation> = serde_json::from_str(&raw)
                .with_context(|| format!("invalid mutation file {}", args.file.display()))?;
            let count = mutations.len();
            let reference = args.reference.unwrap_or_else(|| {
                args.file
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "import".to_string())
            });
            let state = ledger
                .commit(mutations, &reference)
                .context("ledger rejected the import")?;
            info!(count, version = state.version, %reference, "ledger import committed");
            print_json(&json!({
                "imported": count,
                "version": state.version,
                "sequence": state.sequence,
            }))?;
        }
        LedgerCommand::Show => {
            print_json(ledger.latest().as_ref())?;
        }
    }
    Ok(())
}

fn report_output(report: &ReconciliationReport, details: bool) -> serde_json::Value {
    let mut output = json!(report.to_summary());
    if details {
        output["discrepancies"] = json!(report.discrepancies());
        output["notes"] = json!(report.session().notes);
    }
    output
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
