//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source or destination store unreachable at startup.
    #[error("Cannot connect to {store}: {message}")]
    Connectivity { store: String, message: String },

    /// A source query could not be executed for one migration unit.
    #[error("Query for unit {index} failed: {message}")]
    QueryExecution { index: usize, message: String },

    /// Source database error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// Destination database error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Connectivity error
    pub fn connectivity(store: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::Connectivity {
            store: store.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the failed unit from scratch may succeed.
    ///
    /// Connection loss, pool exhaustion and serialization conflicts qualify.
    /// Data errors (bad input for a column type, constraint violations) do not.
    pub fn is_transient(&self) -> bool {
        match self {
            MigrateError::Pool { .. } | MigrateError::Io(_) => true,
            MigrateError::Source(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            MigrateError::Target(e) => {
                if e.is_closed() {
                    return true;
                }
                match e.code() {
                    // Class 08: connection exception; 40001/40P01: serialization and deadlock
                    Some(state) => {
                        let code = state.code();
                        code.starts_with("08") || code == "40001" || code == "40P01"
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// Process exit code for this error. Every failure that reaches the CLI exits with 1.
    pub fn exit_code(&self) -> u8 {
        1
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
