//! Migration orchestrator - main workflow coordinator.

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::source::{MysqlPool, SourcePool};
use crate::target::{PgPool, TargetPool};
use crate::transfer::{plan_units, MigrationResult, TransferEngine, TransferOptions, UnitStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourcePool>,
    target: Arc<dyn TargetPool>,
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every unit committed.
    Completed,
    /// At least one unit failed or its query could not run.
    Failed,
    /// The run was cancelled before every unit finished.
    Cancelled,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// When the migration started.
    pub started_at: DateTime<Utc>,

    /// When the migration completed.
    pub completed_at: DateTime<Utc>,

    /// Wall-clock duration of the whole run in seconds.
    pub duration_seconds: f64,

    /// Per-unit results, ordered by unit index.
    pub units: Vec<MigrationResult>,

    /// Total units planned.
    pub units_total: usize,

    /// Units committed.
    pub units_completed: usize,

    /// Units that failed, including units whose query failed.
    pub units_failed: usize,

    /// Rows committed across all units.
    pub rows_transferred: u64,

    /// Labels (`table#index`) of units that did not complete.
    pub failed_units: Vec<String>,
}

impl RunResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

impl Orchestrator {
    /// Connect both stores and check they answer.
    pub async fn new(config: Config) -> Result<Self> {
        let units = config.unit_count();
        let m = &config.migration;

        let source = MysqlPool::new(
            &config.src,
            m.get_max_mysql_connections(),
            m.get_read_ahead_rows(),
        )
        .await?;

        let target = PgPool::new(
            &config.dest,
            m.get_max_pg_connections(units),
            m.get_copy_buffer_rows(),
        )
        .await?;

        let source: Arc<dyn SourcePool> = Arc::new(source);
        let target: Arc<dyn TargetPool> = Arc::new(target);
        check_connectivity(source.as_ref(), target.as_ref()).await?;

        Ok(Self::with_pools(config, source, target))
    }

    /// Build an orchestrator over already connected pools.
    pub fn with_pools(config: Config, source: Arc<dyn SourcePool>, target: Arc<dyn TargetPool>) -> Self {
        Self {
            config,
            source,
            target,
        }
    }

    /// Run every unit and report the aggregate result.
    ///
    /// Unit failures do not make this return an error; they are reported in
    /// the result and reflected in its status.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunResult> {
        let started_at = Utc::now();
        let start = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        let units = plan_units(&self.config.tables);
        let workers = self.config.migration.effective_workers(units.len());

        info!(
            event = "run_start",
            run_id = %run_id,
            units = units.len(),
            workers = workers,
            source = self.source.db_type(),
            target = self.target.db_type(),
            "Starting migration run {} ({} units, {} workers)",
            run_id,
            units.len(),
            workers
        );
        self.check_pool_sizes(units.len(), workers);

        let engine = Arc::new(TransferEngine::new(
            self.source.clone(),
            self.target.clone(),
            TransferOptions::from_config(&self.config.migration),
        ));
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut handles = Vec::with_capacity(units.len());
        let mut results = Vec::with_capacity(units.len());

        for unit in &units {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                results.push(MigrationResult::not_started(unit));
                continue;
            };

            let engine = engine.clone();
            let cancel = cancel.clone();
            let task_unit = unit.clone();
            let dispatched = Instant::now();

            let handle = tokio::spawn(async move {
                let result = engine.execute(&task_unit, &cancel).await;
                drop(permit);
                result
            });

            handles.push((unit, dispatched, handle));
        }

        for (unit, dispatched, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!("{}: task panicked - {}", unit.label(), e);
                    results.push(MigrationResult::crashed(
                        unit,
                        dispatched.elapsed(),
                        format!("Task panicked: {}", e),
                    ));
                }
            }
        }
        results.sort_by_key(|r| r.index);

        let elapsed = start.elapsed();
        let result = aggregate(run_id, started_at, elapsed.as_secs_f64(), results);

        let summary = format!(
            "Migration run {}: {} of {} units completed, {} rows in {:.2}s",
            result.run_id,
            result.units_completed,
            result.units_total,
            result.rows_transferred,
            result.duration_seconds
        );
        let status = format!("{:?}", result.status).to_lowercase();
        if result.is_success() {
            info!(
                event = "run_complete",
                run_id = %result.run_id,
                status = %status,
                rows = result.rows_transferred,
                elapsed_ms = elapsed.as_millis() as u64,
                "{}",
                summary
            );
        } else {
            warn!(
                event = "run_complete",
                run_id = %result.run_id,
                status = %status,
                rows = result.rows_transferred,
                elapsed_ms = elapsed.as_millis() as u64,
                failed = ?result.failed_units,
                "{}",
                summary
            );
        }

        self.source.close().await;
        self.target.close().await;

        Ok(result)
    }

    /// Warn when a pool is smaller than the number of units that can run at once.
    fn check_pool_sizes(&self, units: usize, workers: usize) {
        let m = &self.config.migration;
        let mysql = m.get_max_mysql_connections();
        let pg = m.get_max_pg_connections(units);
        if mysql < workers {
            warn!(
                "max_mysql_connections ({}) is below the worker count ({}); units will wait for connections",
                mysql, workers
            );
        }
        if pg < workers {
            warn!(
                "max_pg_connections ({}) is below the worker count ({}); units will wait for connections",
                pg, workers
            );
        }
    }
}

/// Ping both stores. Either failing is fatal for the run.
async fn check_connectivity(source: &dyn SourcePool, target: &dyn TargetPool) -> Result<()> {
    source
        .ping()
        .await
        .map_err(|e| MigrateError::connectivity("MySQL", e))?;
    target
        .ping()
        .await
        .map_err(|e| MigrateError::connectivity("PostgreSQL", e))?;
    Ok(())
}

fn aggregate(
    run_id: String,
    started_at: DateTime<Utc>,
    duration_seconds: f64,
    units: Vec<MigrationResult>,
) -> RunResult {
    let units_completed = units.iter().filter(|r| r.is_success()).count();
    let failed: Vec<&MigrationResult> = units
        .iter()
        .filter(|r| matches!(r.status, UnitStatus::Failed | UnitStatus::QueryFailed))
        .collect();
    let any_cancelled = units.iter().any(|r| r.status == UnitStatus::Cancelled);

    let status = if !failed.is_empty() {
        RunStatus::Failed
    } else if any_cancelled {
        RunStatus::Cancelled
    } else {
        RunStatus::Completed
    };

    RunResult {
        run_id,
        status,
        started_at,
        completed_at: Utc::now(),
        duration_seconds,
        units_total: units.len(),
        units_completed,
        units_failed: failed.len(),
        rows_transferred: units.iter().map(|r| r.rows_transferred).sum(),
        failed_units: failed
            .iter()
            .map(|r| format!("{}#{}", r.destination_table, r.index))
            .collect(),
        units,
    }
}
