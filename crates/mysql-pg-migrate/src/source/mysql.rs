//! MySQL source implementation.
//!
//! Uses SQLx for connection pooling. Each cursor owns a dedicated pooled
//! connection for its lifetime and streams rows over the text protocol from a
//! background task into a bounded channel.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Executor, Row, Statement};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RowCursor, RowTuple, SourcePool};
use crate::config::{SourceConfig, SslMode};
use crate::error::{MigrateError, Result};

/// How long one pool acquire waits before it is logged and retried.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum lifetime of a pooled connection.
const CONNECTION_MAX_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Number of row chunks in flight between the reader task and the cursor.
const READ_AHEAD_CHUNKS: usize = 4;

/// MySQL source pool.
pub struct MysqlPool {
    pool: sqlx::MySqlPool,
    read_ahead_rows: usize,
}

impl MysqlPool {
    /// Connect to MySQL with at most `max_conns` connections.
    pub async fn new(config: &SourceConfig, max_conns: usize, read_ahead_rows: usize) -> Result<Self> {
        let (host, port) = config.host_and_port();

        let options = MySqlConnectOptions::new()
            .host(&host)
            .port(port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(mysql_ssl_mode(config.ssl_mode));

        let pool = MySqlPoolOptions::new()
            .max_connections(max_conns.max(1) as u32)
            .min_connections(0)
            .max_lifetime(CONNECTION_MAX_LIFETIME)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::connectivity("MySQL", e))?;

        info!(
            "Connected to MySQL source: {}:{}/{} (max {} connections, ssl_mode={:?})",
            host, port, config.database, max_conns, config.ssl_mode
        );

        Ok(Self {
            pool,
            read_ahead_rows: read_ahead_rows.max(1),
        })
    }

    /// Wait for a pooled connection. Units beyond the pool size queue here
    /// until a connection frees up; the caller bounds the wait.
    async fn acquire(&self) -> Result<PoolConnection<MySql>> {
        loop {
            match self.pool.acquire().await {
                Ok(conn) => return Ok(conn),
                Err(sqlx::Error::PoolTimedOut) => {
                    debug!(
                        "Still waiting for a MySQL connection ({} open)",
                        self.pool.size()
                    );
                }
                Err(e) => return Err(MigrateError::pool(e, "acquiring MySQL connection")),
            }
        }
    }
}

/// Map the configured mode onto MySQL's. Unset prefers TLS without requiring it.
fn mysql_ssl_mode(mode: Option<SslMode>) -> MySqlSslMode {
    match mode {
        None => MySqlSslMode::Preferred,
        Some(SslMode::Disable) => MySqlSslMode::Disabled,
        Some(SslMode::Require) => MySqlSslMode::Required,
        Some(SslMode::VerifyCa) => MySqlSslMode::VerifyCa,
        Some(SslMode::VerifyFull) => MySqlSslMode::VerifyIdentity,
    }
}

#[async_trait]
impl SourcePool for MysqlPool {
    async fn execute(&self, query: &str) -> Result<Box<dyn RowCursor>> {
        let mut conn = self.acquire().await?;

        // Prepare only to learn the result columns; rows come from the text protocol.
        let columns: Vec<String> = {
            let stmt = (&mut *conn).prepare(query).await?;
            stmt.columns().iter().map(|c| c.name().to_string()).collect()
        };

        debug!("Query prepared with {} columns", columns.len());

        let chunk_rows = self.read_ahead_rows.div_ceil(READ_AHEAD_CHUNKS).max(1);
        let (tx, rx) = mpsc::channel(READ_AHEAD_CHUNKS);
        let sql = query.to_string();

        let reader = tokio::spawn(async move {
            if let Err(e) = stream_rows(conn, sql, chunk_rows, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        let cursor = MysqlCursor::open(columns, rx, reader).await?;
        Ok(Box::new(cursor))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mysql"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Stream `sql` into `tx` in chunks of `chunk_rows` rows.
///
/// If the cursor goes away mid-result, the connection is detached from the
/// pool and dropped: a half-read result set cannot be reused.
async fn stream_rows(
    mut conn: PoolConnection<MySql>,
    sql: String,
    chunk_rows: usize,
    tx: &mpsc::Sender<Result<Vec<RowTuple>>>,
) -> Result<()> {
    let mut abandoned = false;
    {
        // A plain &str carries no arguments, so SQLx uses COM_QUERY.
        let mut rows = (&mut *conn).fetch(sql.as_str());
        let mut chunk = Vec::with_capacity(chunk_rows);

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    abandoned = true;
                    break;
                }
                next = rows.try_next() => next?,
            };

            let Some(row) = next else { break };
            chunk.push(decode_row(&row)?);

            if chunk.len() >= chunk_rows {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_rows));
                if tx.send(Ok(full)).await.is_err() {
                    abandoned = true;
                    break;
                }
            }
        }

        if !abandoned && !chunk.is_empty() {
            let _ = tx.send(Ok(chunk)).await;
        }
    }

    if abandoned {
        debug!("Cursor closed before end of result set, discarding connection");
        drop(conn.detach());
    }
    Ok(())
}

/// Decode every cell as raw bytes. NULL stays `None`.
fn decode_row(row: &MySqlRow) -> Result<RowTuple> {
    (0..row.len())
        .map(|i| {
            row.try_get_unchecked::<Option<Vec<u8>>, _>(i)
                .map_err(MigrateError::from)
        })
        .collect()
}

/// Cursor over a MySQL result set fed by a background reader task.
pub struct MysqlCursor {
    columns: Vec<String>,
    rx: mpsc::Receiver<Result<Vec<RowTuple>>>,
    buffered: std::vec::IntoIter<RowTuple>,
    reader: Option<JoinHandle<()>>,
}

impl MysqlCursor {
    /// Wait for the first chunk so errors raised while the server runs the
    /// query surface here rather than from `next_row`.
    async fn open(
        columns: Vec<String>,
        mut rx: mpsc::Receiver<Result<Vec<RowTuple>>>,
        reader: JoinHandle<()>,
    ) -> Result<Self> {
        let first = match rx.recv().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                if let Err(join) = reader.await {
                    warn!("MySQL reader task ended abnormally: {}", join);
                }
                return Err(e);
            }
            None => Vec::new(),
        };

        Ok(Self {
            columns,
            rx,
            buffered: first.into_iter(),
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl RowCursor for MysqlCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<RowTuple>> {
        loop {
            if let Some(row) = self.buffered.next() {
                return Ok(Some(row));
            }
            match self.rx.recv().await {
                Some(Ok(chunk)) => self.buffered = chunk.into_iter(),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.rx.close();
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                warn!("MySQL reader task ended abnormally: {}", e);
            }
        }
    }
}
