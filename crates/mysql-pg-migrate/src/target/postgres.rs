//! PostgreSQL destination using deadpool-postgres and the COPY protocol.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio_postgres::{CopyInSink, NoTls};
use tracing::{debug, info, warn};

use super::copy::{copy_statement, encode_row};
use super::tls::make_connector;
use super::{BulkLoadSink, TargetPool};
use crate::config::TargetConfig;
use crate::error::{MigrateError, Result};

/// Initial COPY buffer capacity.
const COPY_BUFFER_CAPACITY: usize = 1024 * 1024;

/// PostgreSQL target pool implementation.
pub struct PgPool {
    pool: Pool,
    copy_buffer_rows: usize,
}

impl PgPool {
    /// Create a new PostgreSQL target pool. Connections open lazily.
    pub async fn new(config: &TargetConfig, max_conns: usize, copy_buffer_rows: usize) -> Result<Self> {
        let pg_config = config.pg_config();
        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match make_connector(config.ssl_mode)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };

        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL pool"))?;

        info!(
            "PostgreSQL pool ready: {}:{}/{} (max {} connections, ssl_mode={:?})",
            config.host, config.port, config.database, max_conns, config.ssl_mode
        );

        Ok(Self {
            pool,
            copy_buffer_rows: copy_buffer_rows.max(1),
        })
    }

    async fn get_client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "acquiring PostgreSQL connection"))
    }
}

#[async_trait]
impl TargetPool for PgPool {
    async fn begin_bulk_load(&self, table: &str, columns: &[String]) -> Result<Box<dyn BulkLoadSink>> {
        let client = self.get_client().await?;
        client.batch_execute("BEGIN").await?;

        let stmt = copy_statement(table, columns);
        debug!("{}", stmt);

        let copy = match client.copy_in(stmt.as_str()).await {
            Ok(copy) => copy,
            Err(e) => {
                if let Err(rb) = client.batch_execute("ROLLBACK").await {
                    warn!("ROLLBACK after failed COPY start on {}: {}", table, rb);
                    drop(Object::take(client));
                }
                return Err(e.into());
            }
        };

        Ok(Box::new(PgBulkLoadSink {
            table: table.to_string(),
            client: Some(client),
            copy: Some(Box::pin(copy)),
            buf: BytesMut::with_capacity(COPY_BUFFER_CAPACITY),
            buffered_rows: 0,
            flush_rows: self.copy_buffer_rows,
        }))
    }

    async fn ping(&self) -> Result<()> {
        let client = self.get_client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// A COPY into one table inside an open transaction.
///
/// While `client` is set the transaction is open. Dropping the sink in that
/// state detaches the connection from the pool so the server rolls back when
/// it closes.
pub struct PgBulkLoadSink {
    table: String,
    client: Option<Object>,
    copy: Option<Pin<Box<CopyInSink<Bytes>>>>,
    buf: BytesMut,
    buffered_rows: usize,
    flush_rows: usize,
}

impl PgBulkLoadSink {
    async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let copy = self
            .copy
            .as_mut()
            .ok_or_else(|| MigrateError::transfer(&self.table, "COPY already finished"))?;
        copy.send(self.buf.split().freeze()).await?;
        self.buffered_rows = 0;
        Ok(())
    }

    async fn end_transaction(&mut self, sql: &str) -> Result<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| MigrateError::transfer(&self.table, "transaction already closed"))?;
        match client.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Connection state is unknown; keep it out of the pool.
                drop(Object::take(client));
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl BulkLoadSink for PgBulkLoadSink {
    async fn write(&mut self, row: &[Option<Vec<u8>>]) -> Result<()> {
        encode_row(&mut self.buf, row);
        self.buffered_rows += 1;
        if self.buffered_rows >= self.flush_rows {
            self.flush().await?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<u64> {
        self.flush().await?;
        let mut copy = self
            .copy
            .take()
            .ok_or_else(|| MigrateError::transfer(&self.table, "COPY already finished"))?;
        let rows = copy.as_mut().finish().await?;
        debug!("COPY into {} finished: {} rows", self.table, rows);
        Ok(rows)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.copy.is_some() {
            return Err(MigrateError::transfer(
                &self.table,
                "commit called before COPY was finalized",
            ));
        }
        self.end_transaction("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        // Dropping an unfinished CopyInSink aborts the COPY with CopyFail.
        self.copy = None;
        self.buf.clear();
        self.end_transaction("ROLLBACK").await
    }
}

impl Drop for PgBulkLoadSink {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!(
                "Bulk load into {} dropped with an open transaction, discarding connection",
                self.table
            );
            drop(Object::take(client));
        }
    }
}
