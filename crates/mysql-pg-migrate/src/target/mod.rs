//! Destination database operations.

mod copy;
mod postgres;
mod tls;

pub use copy::{copy_statement, encode_row, escape_copy_bytes, qualify_table, quote_ident};
pub use postgres::{PgBulkLoadSink, PgPool};
pub use tls::make_connector;

use crate::error::Result;
use async_trait::async_trait;

/// One open bulk load into a destination table, inside its own transaction.
///
/// Rows become visible only after [`finalize`](BulkLoadSink::finalize) and
/// [`commit`](BulkLoadSink::commit) both succeed.
#[async_trait]
pub trait BulkLoadSink: Send {
    /// Append one row, in the column order given to `begin_bulk_load`.
    async fn write(&mut self, row: &[Option<Vec<u8>>]) -> Result<()>;

    /// Flush buffered rows and end the load. Returns the rows the server accepted.
    async fn finalize(&mut self) -> Result<u64>;

    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Abandon the load and roll back the transaction.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Trait for target database operations.
#[async_trait]
pub trait TargetPool: Send + Sync {
    /// Open a transaction and start a bulk load into `table`.
    async fn begin_bulk_load(&self, table: &str, columns: &[String]) -> Result<Box<dyn BulkLoadSink>>;

    /// Check that the database is reachable.
    async fn ping(&self) -> Result<()>;

    /// Get the database type.
    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}
