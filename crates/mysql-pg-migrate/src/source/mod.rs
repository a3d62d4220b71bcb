//! Source database operations.
//!
//! A [`SourcePool`] executes one query per migration unit and hands back a
//! forward-only [`RowCursor`]. Cells are raw textual bytes; `None` is SQL NULL.

mod mysql;

pub use mysql::{MysqlCursor, MysqlPool};

use crate::error::Result;
use async_trait::async_trait;

/// One result row, in cursor column order.
pub type RowTuple = Vec<Option<Vec<u8>>>;

/// Forward-only cursor over the result set of one source query.
#[async_trait]
pub trait RowCursor: Send {
    /// Column names in result order. Available before the first row.
    fn columns(&self) -> &[String];

    /// Next row, or `None` once the result set is exhausted.
    async fn next_row(&mut self) -> Result<Option<RowTuple>>;

    /// Stop reading and release the underlying connection.
    async fn close(&mut self);
}

/// Trait for source database operations.
#[async_trait]
pub trait SourcePool: Send + Sync {
    /// Execute `query` and return a cursor over its rows.
    async fn execute(&self, query: &str) -> Result<Box<dyn RowCursor>>;

    /// Check that the database is reachable.
    async fn ping(&self) -> Result<()>;

    /// Get the database type.
    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}
