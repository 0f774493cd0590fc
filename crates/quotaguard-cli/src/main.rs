use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quotaguard_core::{costs, QuotaCalendar, SystemClock, UpstreamError, DEFAULT_UNIT_COST};
use quotaguard_runtime::{CallRequest, GuardConfig, LogAlertSink, MemoryStore, RetryOrchestrator};

#[derive(Parser)]
#[command(name = "quotaguard")]
#[command(about = "Quota, circuit breaker and retry guard for metered APIs", long_about = None)]
struct Cli {
    /// Guard configuration (YAML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the operation cost table
    Costs {
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file and print the effective settings
    Validate { path: PathBuf },
    /// Print the current quota day and the next reset instant
    ResetTime {
        /// Override the configured quota timezone
        #[arg(long, value_parser = parse_timezone)]
        timezone: Option<Tz>,
    },
    /// Drive a synthetic flaky upstream through the guard on an in-memory store
    Simulate {
        /// Calls to make
        #[arg(long, default_value_t = 20)]
        calls: u32,

        #[arg(long, default_value = "videos.list")]
        operation: String,

        /// Every Nth upstream attempt fails (0 = never)
        #[arg(long, default_value_t = 3)]
        fail_every: u32,

        /// HTTP status returned by failing attempts
        #[arg(long, default_value_t = 503)]
        status: u16,

        /// Initial retry backoff, e.g. "50ms"
        #[arg(long, value_parser = humantime::parse_duration)]
        backoff: Option<Duration>,
    },
}

fn parse_timezone(raw: &str) -> Result<Tz, String> {
    raw.parse::<Tz>()
        .map_err(|e| format!("unknown IANA timezone '{raw}': {e}"))
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "quotaguard=debug,quotaguard_runtime=debug"
    } else {
        "quotaguard=info,quotaguard_runtime=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<GuardConfig> {
    match path {
        Some(path) => GuardConfig::from_yaml_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(GuardConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Costs { json } => print_costs(json)?,
        Commands::Validate { path } => {
            let config = load_config(Some(&path))?;
            println!("{}", serde_yaml::to_string(&config)?);
            eprintln!("{} is valid", path.display());
        }
        Commands::ResetTime { timezone } => {
            let config = load_config(cli.config.as_ref())?;
            let calendar = QuotaCalendar::new(timezone.unwrap_or(config.quota.timezone));
            let now = chrono::Utc::now();
            let reset_at = calendar.next_reset(now);
            let output = json!({
                "timezone": calendar.timezone().name(),
                "quota_date": calendar.date_at(now),
                "reset_at": reset_at,
                "reset_at_local": reset_at.with_timezone(&calendar.timezone()).to_rfc3339(),
                "resets_in": humantime::format_duration(Duration::from_secs(
                    (reset_at - now).num_seconds().max(0) as u64
                ))
                .to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Simulate {
            calls,
            operation,
            fail_every,
            status,
            backoff,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(backoff) = backoff {
                config.retry.initial_backoff = backoff;
            }
            simulate(config, calls, operation, fail_every, status).await?;
        }
    }

    Ok(())
}

fn print_costs(as_json: bool) -> Result<()> {
    if as_json {
        let table: serde_json::Map<String, serde_json::Value> = costs::entries()
            .map(|(op, cost)| (op.to_string(), json!(cost)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    for (operation, cost) in costs::entries() {
        println!("{operation:<24} {cost:>5}");
    }
    println!("{:<24} {:>5}", "(other)", DEFAULT_UNIT_COST);
    Ok(())
}

async fn simulate(
    config: GuardConfig,
    calls: u32,
    operation: String,
    fail_every: u32,
    status: u16,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = RetryOrchestrator::builder()
        .config(config)
        .store(store.clone())
        .clock(Arc::new(SystemClock))
        .alerts(Arc::new(LogAlertSink))
        .build()
        .await
        .context("building orchestrator")?;

    let declared = costs::estimate_cost(&operation);
    let attempts = AtomicU32::new(0);
    let mut succeeded = 0u32;

    for n in 1..=calls {
        let outcome = orchestrator
            .execute(CallRequest::new(operation.clone(), declared), || async {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if fail_every > 0 && attempt % fail_every == 0 {
                    Err(UpstreamError::http(status, "synthetic failure"))
                } else {
                    Ok(attempt)
                }
            })
            .await?;

        match &outcome.result {
            Ok(_) => succeeded += 1,
            Err(e) => tracing::warn!(call = n, error = %e, "Call failed"),
        }
        tracing::info!(
            call = n,
            success = outcome.is_success(),
            retries = outcome.metrics.retry_count,
            duration_ms = outcome.metrics.duration_ms,
            "Call finished"
        );
    }

    let report = json!({
        "calls": calls,
        "succeeded": succeeded,
        "upstream_attempts": attempts.load(Ordering::SeqCst),
        "ledger_rows": store.usage_rows().len(),
        "quota": orchestrator.quota_status().await,
        "circuit": orchestrator.circuit_snapshot(),
        "performance": orchestrator.performance(&operation).await,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
