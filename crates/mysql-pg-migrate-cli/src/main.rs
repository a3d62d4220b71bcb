//! mysql2pg - copy MySQL query results into PostgreSQL tables.

use clap::Parser;
use mysql_pg_migrate::{Config, MigrateError, Orchestrator, RunResult, UnitStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mysql2pg")]
#[command(about = "Copy the results of MySQL queries into PostgreSQL tables")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file [default: $HOME/.mysql2pg.yaml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of units running at once
    #[arg(long)]
    workers: Option<usize>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Returns whether every unit completed.
async fn run() -> Result<bool, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path().ok_or_else(|| {
            MigrateError::Config("cannot determine home directory; pass --config".into())
        })?,
    };

    let mut config = Config::load(&config_path)?;
    info!("Loaded configuration from {:?}", config_path);

    if let Some(w) = cli.workers {
        if w == 0 {
            return Err(MigrateError::Config("--workers must be at least 1".into()));
        }
        config.migration.workers = Some(w);
    }

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler()?;

    let orchestrator = Orchestrator::new(config).await?;
    let result = orchestrator.run(cancel_token).await?;

    if cli.output_json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result);
    }

    Ok(result.is_success())
}

fn print_summary(result: &RunResult) {
    println!("Run {}: {:?}", result.run_id, result.status);
    for unit in &result.units {
        let detail = match unit.status {
            UnitStatus::Completed => format!("{} rows", unit.rows_transferred),
            _ => unit.error.clone().unwrap_or_else(|| "-".to_string()),
        };
        println!(
            "  [{}] {:<30} {:<12} {:>8.2}s  {}",
            unit.index,
            unit.destination_table,
            unit.status.as_str(),
            unit.elapsed.as_secs_f64(),
            detail
        );
    }
    println!(
        "Units: {} completed, {} failed, {} total",
        result.units_completed, result.units_failed, result.units_total
    );
    println!("Rows: {}", result.rows_transferred);
    println!("Elapsed: {:.2}s", result.duration_seconds);
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // RUST_LOG wins over --verbosity when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Rolling back in-flight units...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Rolling back in-flight units...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
