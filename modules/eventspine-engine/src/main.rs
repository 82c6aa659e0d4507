//! Replays recorded envelopes through the event spine.
//!
//! Input is newline-delimited JSON, one wire-format envelope per line. Each
//! envelope is validated and processed with an echo handler that honors the
//! envelope's chaos metadata. Idempotency stats and the telemetry summary are
//! printed as JSON when the run finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use eventspine_common::SpineConfig;
use eventspine_engine::{EventSpine, SpineError};
use eventspine_envelope::{validate_event_json, EventEnvelope};
use eventspine_idempotency::{IdempotencyStore, PgReceiptRepository};
use eventspine_trace::Tracer;

#[derive(Parser)]
#[command(name = "eventspine-replay")]
#[command(about = "Replay recorded event envelopes through the idempotency engine and tracer")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process an ndjson file of envelopes
    Run {
        /// Path to the envelope file
        file: PathBuf,

        /// Load receipts from Postgres before the run and save them after
        #[arg(long)]
        persist: bool,

        /// Tenant whose receipts are loaded (defaults to SANDBOX_TENANT)
        #[arg(long)]
        tenant: Option<String>,
    },

    /// Apply pending database migrations
    Migrate,
}

#[derive(Debug, Default, Serialize)]
struct ReplayReport {
    lines: usize,
    invalid: usize,
    executed: usize,
    replayed: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json)?;

    let config = SpineConfig::from_env();
    config.log_redacted();

    match cli.command {
        Commands::Run {
            file,
            persist,
            tenant,
        } => run(&config, &file, persist, tenant.as_deref()).await,
        Commands::Migrate => migrate(&config).await,
    }
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("eventspine=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn connect(config: &SpineConfig) -> Result<PgPool> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL must be set");
    };
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(url)
        .await
        .context("Failed to connect to Postgres")?;
    info!("Connected to database");
    Ok(pool)
}

async fn migrate(config: &SpineConfig) -> Result<()> {
    let pool = connect(config).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Migrations complete");
    Ok(())
}

async fn run(config: &SpineConfig, file: &Path, persist: bool, tenant: Option<&str>) -> Result<()> {
    let mut store = IdempotencyStore::from_config(config);
    if persist {
        if config.durable_store_enabled() {
            let pool = connect(config).await?;
            store = store.with_repository(Arc::new(PgReceiptRepository::new(pool)));
        } else {
            warn!("--persist ignored: SIM_MODE is set or DATABASE_URL is missing");
        }
    }
    let spine = EventSpine::new(Arc::new(store), Arc::new(Tracer::from_config(config)));

    if persist {
        let loaded = spine.store().load_from_database(tenant).await;
        info!(loaded, "Receipts restored");
    }

    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut report = ReplayReport::default();
    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        report.lines += 1;

        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("Line {line_no} is not valid JSON"))?;
        let check = validate_event_json(&value);
        if !check.valid {
            warn!(line = line_no, errors = ?check.errors, "Skipping invalid envelope");
            report.invalid += 1;
            continue;
        }
        let envelope: EventEnvelope<Value> = serde_json::from_value(value)
            .with_context(|| format!("Line {line_no} does not decode as an envelope"))?;

        match spine.process_event(&envelope, echo).await {
            Ok(processed) if processed.outcome.was_cached => report.replayed += 1,
            Ok(_) => report.executed += 1,
            Err(SpineError::InvalidEnvelope { errors, .. }) => {
                warn!(line = line_no, ?errors, "Skipping invalid envelope");
                report.invalid += 1;
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "Envelope failed");
                report.failed += 1;
            }
        }
    }

    if persist {
        let saved = spine.store().persist_to_database().await;
        info!(saved, "Receipts persisted");
    }

    info!(
        lines = report.lines,
        executed = report.executed,
        replayed = report.replayed,
        failed = report.failed,
        invalid = report.invalid,
        "Replay finished"
    );

    let output = json!({
        "replay": report,
        "idempotency": spine.store().get_stats(),
        "telemetry": spine.tracer().get_telemetry_summary(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Echoes the envelope back. A simulated failure fails the attempt, and an
/// injected delay is slept before responding.
async fn echo(envelope: &EventEnvelope<Value>) -> Result<Value> {
    if let Some(chaos) = &envelope.chaos {
        if let Some(failure) = chaos.simulated_failure {
            bail!("simulated {failure} failure");
        }
        if let Some(ms) = chaos.injected_delay_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
    Ok(json!({
        "eventId": envelope.event_id,
        "eventType": envelope.event_type,
        "handledBy": "eventspine-replay",
        "payload": envelope.payload,
    }))
}
