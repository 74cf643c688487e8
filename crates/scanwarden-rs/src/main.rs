use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use scanwarden::{
    api::{execute_tool, ToolExecutionRequest},
    models::ScanEvent,
    plan::{ScanMode, ToolPlan},
    progress::Subscription,
    AppConfig, MemoryScanStore, ProcessRunner, ProgressBroadcaster, ScanOrchestrator,
};
use tracing::{info, warn};

/// Runs external security scanners and normalizes their findings.
#[derive(Parser)]
#[command(name = "scanwarden", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to $SCANWARDEN_CONFIG or ./scanwarden.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan mode against a target and print the aggregated result
    Scan {
        target: String,

        #[arg(short, long, default_value = "network-recon")]
        mode: String,

        /// Identifier for the scan; generated when omitted
        #[arg(long)]
        scan_id: Option<String>,
    },
    /// Run a single tool
    Exec {
        tool: String,
        target: String,

        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Tool arguments; `{target}` and `{url}` are substituted
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// List scan modes and the tools they run
    Modes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Arc::new(match &cli.config {
        Some(path) => AppConfig::from_sources(path, |key| env::var(key).ok())?,
        None => AppConfig::load()?,
    });

    match cli.command {
        Commands::Scan { target, mode, scan_id } => run_scan(config, target, mode, scan_id).await,
        Commands::Exec {
            tool,
            target,
            timeout_ms,
            args,
        } => {
            let runner = ProcessRunner::new(config.clone());
            let request = ToolExecutionRequest {
                tool,
                target,
                args: (!args.is_empty()).then_some(args),
                timeout: timeout_ms,
            };
            let response = execute_tool(&runner, &config, request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::Modes => {
            for mode in ScanMode::ALL {
                let plan = ToolPlan::for_mode(mode, &config)?;
                println!("{mode} ({:?})", plan.discipline);
                for spec in &plan.invocations {
                    println!("  {} {} [timeout {}s]", spec.tool, spec.args.join(" "), spec.timeout_ms / 1_000);
                }
            }
            Ok(())
        }
    }
}

async fn run_scan(config: Arc<AppConfig>, target: String, mode: String, scan_id: Option<String>) -> anyhow::Result<()> {
    let scan_id = scan_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let store = MemoryScanStore::new();
    let orchestrator = ScanOrchestrator::new(
        Arc::new(ProcessRunner::new(config.clone())),
        ProgressBroadcaster::new(),
        Arc::new(store.clone()),
        config,
    );

    let events = tokio::spawn(log_events(orchestrator.subscribe(&scan_id)));
    let handle = orchestrator.spawn_scan(scan_id.clone(), target, mode)?;

    let interrupt = {
        let orchestrator = orchestrator.clone();
        let scan_id = scan_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(scan_id = %scan_id, "interrupt received, cancelling scan");
                if let Err(e) = orchestrator.cancel_scan(&scan_id).await {
                    warn!(error = %e, "cancel failed");
                }
            }
        })
    };

    let outcome = handle.join().await;
    interrupt.abort();
    let _ = tokio::time::timeout(Duration::from_secs(1), events).await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            if let Some(results) = store.scan(&scan_id).await.and_then(|record| record.results) {
                let partial: serde_json::Value =
                    serde_json::from_str(&results).context("stored results are not valid JSON")?;
                println!("{}", serde_json::to_string_pretty(&partial)?);
            }
            Err(e.into())
        }
    }
}

async fn log_events(mut events: Subscription) {
    while let Some(event) = events.recv().await {
        match event {
            ScanEvent::ScanUpdate(update) => info!(
                scan_id = %update.scan_id,
                phase = ?update.phase,
                progress = update.percent,
                vulnerabilities = ?update.vulnerabilities_so_far,
                "{}",
                update.message
            ),
            ScanEvent::ScanComplete { scan_id, results } => info!(
                scan_id = %scan_id,
                vulnerabilities = results.vulnerabilities.len(),
                "scan complete"
            ),
            ScanEvent::ScanError { scan_id, error } => warn!(scan_id = %scan_id, error = %error, "scan error"),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();
}
