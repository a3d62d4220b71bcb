//! In-memory source and destination used by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{MigrateError, Result};
use crate::source::{RowCursor, RowTuple, SourcePool};
use crate::target::{BulkLoadSink, TargetPool};

/// Build a row from string cells.
pub(crate) fn row(cells: &[Option<&str>]) -> RowTuple {
    cells.iter().map(|c| c.map(|s| s.as_bytes().to_vec())).collect()
}

struct ResultSet {
    columns: Vec<String>,
    rows: Vec<RowTuple>,
}

/// Source answering a fixed set of queries. Unknown queries fail.
#[derive(Default)]
pub(crate) struct MemorySource {
    results: HashMap<String, ResultSet>,
    row_delay: Option<Duration>,
    executions: AtomicUsize,
    pool_timeouts: usize,
}

impl MemorySource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_query(mut self, query: &str, columns: &[&str], rows: Vec<RowTuple>) -> Self {
        self.results.insert(
            query.to_string(),
            ResultSet {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
        self
    }

    /// Sleep before every row, to keep units running long enough to overlap.
    pub(crate) fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    /// The first `times` executions time out waiting for a connection.
    pub(crate) fn with_pool_timeouts(mut self, times: usize) -> Self {
        self.pool_timeouts = times;
        self
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourcePool for MemorySource {
    async fn execute(&self, query: &str) -> Result<Box<dyn RowCursor>> {
        let previous = self.executions.fetch_add(1, Ordering::SeqCst);
        if previous < self.pool_timeouts {
            return Err(MigrateError::pool(
                sqlx::Error::PoolTimedOut,
                "acquiring MySQL connection",
            ));
        }
        let rs = self.results.get(query).ok_or_else(|| {
            MigrateError::Source(sqlx::Error::Protocol(format!(
                "You have an error in your SQL syntax near '{}'",
                query
            )))
        })?;
        Ok(Box::new(MemoryCursor {
            columns: rs.columns.clone(),
            rows: rs.rows.iter().cloned().collect(),
            delay: self.row_delay,
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

struct MemoryCursor {
    columns: Vec<String>,
    rows: VecDeque<RowTuple>,
    delay: Option<Duration>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<RowTuple>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) {
        self.rows.clear();
    }
}

/// Planned write failure for one destination table.
#[derive(Clone)]
struct FailurePlan {
    after_rows: usize,
    /// Failing loads left; `None` fails every load.
    remaining: Option<usize>,
    transient: bool,
}

/// Where a load into a table hangs forever.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stall {
    Begin,
    Write,
}

#[derive(Default)]
struct TargetState {
    committed: HashMap<String, Vec<RowTuple>>,
    columns: HashMap<String, Vec<String>>,
    commits: usize,
    rollbacks: usize,
    failures: HashMap<String, FailurePlan>,
    stalls: HashMap<String, Stall>,
    finalize_failures: HashSet<String>,
    /// Commit failures left per table, and whether they are transient.
    commit_failures: HashMap<String, (usize, bool)>,
    unreachable: bool,
}

/// Destination keeping committed rows per table.
#[derive(Default, Clone)]
pub(crate) struct MemoryTarget {
    state: Arc<Mutex<TargetState>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MemoryTarget {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every load into `table` fails after `after_rows` rows with a data error.
    pub(crate) fn failing_table(self, table: &str, after_rows: usize) -> Self {
        self.plan(table, after_rows, None, false);
        self
    }

    /// The first `times` loads into `table` lose their connection after `after_rows` rows.
    pub(crate) fn flaky_table(self, table: &str, after_rows: usize, times: usize) -> Self {
        self.plan(table, after_rows, Some(times), true);
        self
    }

    /// Pings fail as if the server were down.
    pub(crate) fn unreachable(self) -> Self {
        self.lock().unreachable = true;
        self
    }

    pub(crate) fn stalled_table(self, table: &str, stall: Stall) -> Self {
        self.lock().stalls.insert(table.to_string(), stall);
        self
    }

    /// Every COPY into `table` is rejected when it ends.
    pub(crate) fn failing_finalize(self, table: &str) -> Self {
        self.lock().finalize_failures.insert(table.to_string());
        self
    }

    /// The first `times` commits into `table` fail.
    pub(crate) fn failing_commit(self, table: &str, times: usize, transient: bool) -> Self {
        self.lock()
            .commit_failures
            .insert(table.to_string(), (times, transient));
        self
    }

    fn plan(&self, table: &str, after_rows: usize, remaining: Option<usize>, transient: bool) {
        self.lock().failures.insert(
            table.to_string(),
            FailurePlan {
                after_rows,
                remaining,
                transient,
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<RowTuple> {
        self.lock().committed.get(table).cloned().unwrap_or_default()
    }

    pub(crate) fn columns(&self, table: &str) -> Vec<String> {
        self.lock().columns.get(table).cloned().unwrap_or_default()
    }

    pub(crate) fn commits(&self) -> usize {
        self.lock().commits
    }

    pub(crate) fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    /// Highest number of loads open at the same time.
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn truncate_all(&self) {
        self.lock().committed.clear();
    }
}

#[async_trait]
impl TargetPool for MemoryTarget {
    async fn begin_bulk_load(&self, table: &str, columns: &[String]) -> Result<Box<dyn BulkLoadSink>> {
        let stall = self.lock().stalls.get(table).copied();
        if stall == Some(Stall::Begin) {
            std::future::pending::<()>().await;
        }

        let (fail_after, fail_finalize) = {
            let mut state = self.lock();
            state.columns.insert(table.to_string(), columns.to_vec());
            let fail_after = match state.failures.get_mut(table) {
                Some(plan) => {
                    let armed = match plan.remaining {
                        Some(0) => false,
                        Some(n) => {
                            plan.remaining = Some(n - 1);
                            true
                        }
                        None => true,
                    };
                    armed.then(|| plan.clone())
                }
                None => None,
            };
            (fail_after, state.finalize_failures.contains(table))
        };

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(MemorySink {
            table: table.to_string(),
            pending: Vec::new(),
            fail: fail_after,
            fail_finalize,
            stall_writes: stall == Some(Stall::Write),
            target: self.clone(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        if self.lock().unreachable {
            return Err(connection_reset());
        }
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

struct MemorySink {
    table: String,
    pending: Vec<RowTuple>,
    fail: Option<FailurePlan>,
    fail_finalize: bool,
    stall_writes: bool,
    target: MemoryTarget,
}

fn connection_reset() -> MigrateError {
    MigrateError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

#[async_trait]
impl BulkLoadSink for MemorySink {
    async fn write(&mut self, row: &[Option<Vec<u8>>]) -> Result<()> {
        if self.stall_writes {
            std::future::pending::<()>().await;
        }
        if let Some(plan) = &self.fail {
            if self.pending.len() >= plan.after_rows {
                return Err(if plan.transient {
                    connection_reset()
                } else {
                    MigrateError::transfer(&self.table, "invalid input syntax for type integer")
                });
            }
        }
        self.pending.push(row.to_vec());
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<u64> {
        if self.fail_finalize {
            return Err(MigrateError::transfer(
                &self.table,
                "duplicate key value violates unique constraint",
            ));
        }
        Ok(self.pending.len() as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let rows = std::mem::take(&mut self.pending);
        let mut state = self.target.lock();
        if let Some((left, transient)) = state.commit_failures.get_mut(&self.table) {
            if *left > 0 {
                *left -= 1;
                return Err(if *transient {
                    connection_reset()
                } else {
                    MigrateError::transfer(&self.table, "deferred constraint violated at commit")
                });
            }
        }
        state
            .committed
            .entry(self.table.clone())
            .or_default()
            .extend(rows);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.pending.clear();
        self.target.lock().rollbacks += 1;
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.target.active.fetch_sub(1, Ordering::SeqCst);
    }
}
