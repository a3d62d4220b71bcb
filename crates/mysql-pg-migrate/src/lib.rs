//! # mysql-pg-migrate
//!
//! Copies the result sets of configured MySQL queries into PostgreSQL tables.
//!
//! Each query is one migration unit. Units run concurrently, each streaming
//! its rows through `COPY ... FROM STDIN` inside its own transaction, so a
//! unit lands completely or not at all.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_pg_migrate::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mysql_pg_migrate::Result<()> {
//!     let config = Config::load("mysql2pg.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run(CancellationToken::new()).await?;
//!     println!("Migrated {} rows", result.rows_transferred);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod source;
pub mod target;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, SslMode, TargetConfig};
pub use error::{MigrateError, Result};
pub use orchestrator::{Orchestrator, RunResult, RunStatus};
pub use source::{MysqlPool, RowCursor, RowTuple, SourcePool};
pub use target::{BulkLoadSink, PgPool, TargetPool};
pub use transfer::{MigrationResult, MigrationUnit, TransferEngine, TransferOptions, UnitStatus};
