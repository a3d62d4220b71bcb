//! Per-unit transfer: one source query streamed into one destination table.
//!
//! Each attempt executes the query, opens a COPY inside a fresh destination
//! transaction, streams rows in cursor order and commits. Any failure after the
//! query ran rolls the transaction back, so a unit either lands completely or
//! not at all.

use crate::config::MigrationConfig;
use crate::error::{MigrateError, Result};
use crate::source::{RowCursor, SourcePool};
use crate::target::{BulkLoadSink, TargetPool};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for a single retry backoff.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How long a rollback may take before its connection is discarded instead.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// One source query feeding one destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    /// Position in enumeration order, starting at 0.
    pub index: usize,
    pub destination_table: String,
    pub source_query: String,
}

impl MigrationUnit {
    /// Short label for logs and failure lists.
    pub fn label(&self) -> String {
        format!("{}#{}", self.destination_table, self.index)
    }
}

/// Flatten the table mapping into units: tables in document order, queries in
/// list order, indexes assigned sequentially.
pub fn plan_units(tables: &IndexMap<String, Vec<String>>) -> Vec<MigrationUnit> {
    tables
        .iter()
        .flat_map(|(table, queries)| queries.iter().map(move |q| (table, q)))
        .enumerate()
        .map(|(index, (table, query))| MigrationUnit {
            index,
            destination_table: table.clone(),
            source_query: query.clone(),
        })
        .collect()
}

/// Lifecycle of one transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    Dispatched,
    QueryExecuted,
    Streaming,
    Finalizing,
    Committed,
    Failed,
}

impl UnitPhase {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: UnitPhase) -> bool {
        use UnitPhase::*;
        matches!(
            (self, next),
            (Dispatched, QueryExecuted)
                | (QueryExecuted, Streaming)
                | (Streaming, Finalizing)
                | (Finalizing, Committed)
                | (QueryExecuted | Streaming | Finalizing, Failed)
        )
    }
}

/// Tracks the phase of one attempt and logs each transition.
struct PhaseTracker {
    index: usize,
    phase: UnitPhase,
}

impl PhaseTracker {
    fn new(index: usize) -> Self {
        Self {
            index,
            phase: UnitPhase::Dispatched,
        }
    }

    fn advance(&mut self, next: UnitPhase) {
        if !self.phase.can_transition(next) {
            warn!(
                "unit {}: unexpected phase change {:?} -> {:?}",
                self.index, self.phase, next
            );
        }
        debug!(unit = self.index, from = ?self.phase, to = ?next, "phase transition");
        self.phase = next;
    }
}

/// Final status of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    /// The source query could not be executed; nothing was written.
    QueryFailed,
    /// Streaming or committing failed; the transaction was rolled back.
    Failed,
    Cancelled,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Completed => "completed",
            UnitStatus::QueryFailed => "query_failed",
            UnitStatus::Failed => "failed",
            UnitStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one unit.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub index: usize,
    pub destination_table: String,
    /// Rows committed to the destination. Zero unless `status` is `completed`.
    pub rows_transferred: u64,
    #[serde(rename = "elapsed_seconds", serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    pub status: UnitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts made, including retries. Zero if the unit never started.
    pub attempts: u32,
}

impl MigrationResult {
    /// Result for a unit that was never started.
    pub fn not_started(unit: &MigrationUnit) -> Self {
        Self {
            index: unit.index,
            destination_table: unit.destination_table.clone(),
            rows_transferred: 0,
            elapsed: Duration::ZERO,
            status: UnitStatus::Cancelled,
            error: None,
            attempts: 0,
        }
    }

    /// Result for a unit whose worker task died.
    pub fn crashed(unit: &MigrationUnit, elapsed: Duration, message: String) -> Self {
        Self {
            index: unit.index,
            destination_table: unit.destination_table.clone(),
            rows_transferred: 0,
            elapsed,
            status: UnitStatus::Failed,
            error: Some(message),
            attempts: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}

fn as_secs_f64<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Retry and deadline settings for units.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Retries after a transient failure. Zero disables retrying.
    pub max_retries: usize,
    /// Delay before the first retry; doubles for each further retry.
    pub retry_base_delay: Duration,
    /// Deadline for one attempt.
    pub unit_timeout: Option<Duration>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(500),
            unit_timeout: None,
        }
    }
}

impl TransferOptions {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.get_retry_base_delay_ms()),
            unit_timeout: config.unit_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Backoff before retry number `retry` (1-based).
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

/// Runs migration units against a shared source and destination.
pub struct TransferEngine {
    source: Arc<dyn SourcePool>,
    target: Arc<dyn TargetPool>,
    options: TransferOptions,
}

impl TransferEngine {
    pub fn new(source: Arc<dyn SourcePool>, target: Arc<dyn TargetPool>, options: TransferOptions) -> Self {
        Self {
            source,
            target,
            options,
        }
    }

    /// Transfer one unit, retrying transient failures. Never returns an error:
    /// every outcome is reported through the result's status.
    pub async fn execute(&self, unit: &MigrationUnit, cancel: &CancellationToken) -> MigrationResult {
        info!(
            event = "unit_start",
            index = unit.index,
            table = %unit.destination_table,
            "Starting unit {}: {}",
            unit.label(),
            unit.source_query
        );

        let start = Instant::now();
        let mut attempts: u32 = 0;

        let (status, rows, err) = loop {
            attempts += 1;
            match self.run_attempt(unit, cancel).await {
                Ok(rows) => break (UnitStatus::Completed, rows, None),
                Err(MigrateError::Cancelled) => break (UnitStatus::Cancelled, 0, None),
                Err(e @ MigrateError::QueryExecution { .. }) => {
                    break (UnitStatus::QueryFailed, 0, Some(e))
                }
                Err(e) => {
                    let retries_used = attempts as usize - 1;
                    if e.is_transient() && retries_used < self.options.max_retries {
                        let delay = self.options.backoff(attempts);
                        warn!(
                            "{}: attempt {} failed ({}), retrying in {:?}",
                            unit.label(),
                            attempts,
                            e,
                            delay
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break (UnitStatus::Cancelled, 0, None),
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                    break (UnitStatus::Failed, 0, Some(e));
                }
            }
        };

        let elapsed = start.elapsed();
        let result = MigrationResult {
            index: unit.index,
            destination_table: unit.destination_table.clone(),
            rows_transferred: rows,
            elapsed,
            status,
            error: err.as_ref().map(|e| e.to_string()),
            attempts,
        };

        match &err {
            None => info!(
                event = "unit_complete",
                index = unit.index,
                table = %unit.destination_table,
                rows = rows,
                elapsed_ms = elapsed.as_millis() as u64,
                status = status.as_str(),
                "{}: {} rows in {:.2}s ({})",
                unit.label(),
                rows,
                elapsed.as_secs_f64(),
                status.as_str()
            ),
            Some(e) => error!(
                event = "unit_complete",
                index = unit.index,
                table = %unit.destination_table,
                rows = 0u64,
                elapsed_ms = elapsed.as_millis() as u64,
                status = status.as_str(),
                attempts = attempts,
                "{}: {} after {} attempt(s): {}",
                unit.label(),
                status.as_str(),
                attempts,
                e
            ),
        }

        result
    }

    /// One attempt: query, COPY, commit. Returns rows committed.
    async fn run_attempt(&self, unit: &MigrationUnit, cancel: &CancellationToken) -> Result<u64> {
        let mut phase = PhaseTracker::new(unit.index);
        let started = tokio::time::Instant::now();
        let deadline = self.options.unit_timeout.map(|t| started + t);

        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }

        let query = self.source.execute(&unit.source_query);
        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
            _ = sleep_until(deadline) => return Err(self.deadline_error(unit)),
            executed = query => executed,
        };
        // Waiting for a connection or losing it is not a query failure.
        let mut cursor = executed.map_err(|e| {
            if e.is_transient() {
                e
            } else {
                MigrateError::QueryExecution {
                    index: unit.index,
                    message: e.to_string(),
                }
            }
        })?;
        phase.advance(UnitPhase::QueryExecuted);

        let columns = cursor.columns().to_vec();
        debug!("{}: columns {:?}", unit.label(), columns);

        let begun = self
            .bounded(
                unit,
                cancel,
                deadline,
                self.target.begin_bulk_load(&unit.destination_table, &columns),
            )
            .await;
        let mut sink = match begun {
            Ok(sink) => sink,
            Err(e) => {
                phase.advance(UnitPhase::Failed);
                cursor.close().await;
                return Err(e);
            }
        };
        phase.advance(UnitPhase::Streaming);

        let copied = self
            .copy_rows(unit, &mut *cursor, &mut *sink, columns.len(), cancel, deadline)
            .await;
        cursor.close().await;

        let rows = match copied {
            Ok(rows) => rows,
            Err(e) => {
                phase.advance(UnitPhase::Failed);
                rollback(unit, sink).await;
                return Err(e);
            }
        };

        phase.advance(UnitPhase::Finalizing);
        let finalized = self.bounded(unit, cancel, deadline, sink.finalize()).await;
        let accepted = match finalized {
            Ok(n) => n,
            Err(e) => {
                phase.advance(UnitPhase::Failed);
                rollback(unit, sink).await;
                return Err(e);
            }
        };
        if accepted != rows {
            warn!(
                "{}: destination accepted {} rows, {} were sent",
                unit.label(),
                accepted,
                rows
            );
        }

        // COMMIT runs to completion even when cancelled. A failed COMMIT commits
        // nothing: the sink discards its connection.
        if let Err(e) = sink.commit().await {
            phase.advance(UnitPhase::Failed);
            return Err(e);
        }
        phase.advance(UnitPhase::Committed);

        Ok(rows)
    }

    /// Await `fut` unless the unit is cancelled or its deadline passes first.
    async fn bounded<T>(
        &self,
        unit: &MigrationUnit,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MigrateError::Cancelled),
            _ = sleep_until(deadline) => Err(self.deadline_error(unit)),
            out = fut => out,
        }
    }

    /// Stream every cursor row into the sink, in cursor order.
    async fn copy_rows(
        &self,
        unit: &MigrationUnit,
        cursor: &mut dyn RowCursor,
        sink: &mut dyn BulkLoadSink,
        width: usize,
        cancel: &CancellationToken,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<u64> {
        let expired = sleep_until(deadline);
        tokio::pin!(expired);

        let mut rows: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
                _ = &mut expired => return Err(self.deadline_error(unit)),
                next = cursor.next_row() => next?,
            };

            let Some(row) = next else {
                return Ok(rows);
            };

            if row.len() != width {
                return Err(MigrateError::transfer(
                    &unit.destination_table,
                    format!(
                        "row {} has {} cells, expected {}",
                        rows + 1,
                        row.len(),
                        width
                    ),
                ));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
                _ = &mut expired => return Err(self.deadline_error(unit)),
                written = sink.write(&row) => written?,
            }
            rows += 1;
        }
    }

    fn deadline_error(&self, unit: &MigrationUnit) -> MigrateError {
        let secs = self.options.unit_timeout.map(|t| t.as_secs()).unwrap_or(0);
        MigrateError::transfer(
            &unit.destination_table,
            format!("unit {} exceeded its {}s deadline", unit.index, secs),
        )
    }
}

async fn rollback(unit: &MigrationUnit, sink: Box<dyn BulkLoadSink>) {
    match tokio::time::timeout(ROLLBACK_TIMEOUT, sink.rollback()).await {
        Ok(Ok(())) => debug!("{}: transaction rolled back", unit.label()),
        Ok(Err(e)) => warn!("{}: rollback failed: {}", unit.label(), e),
        Err(_) => warn!(
            "{}: rollback timed out after {:?}, connection discarded",
            unit.label(),
            ROLLBACK_TIMEOUT
        ),
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
