//! Configuration type definitions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MySQL).
    pub src: SourceConfig,

    /// Destination database configuration (PostgreSQL).
    pub dest: TargetConfig,

    /// Destination table name mapped to the source queries that fill it.
    /// Document order is kept and determines unit indexes.
    #[serde(default)]
    pub tables: IndexMap<String, Vec<String>>,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Total number of migration units (one per source query).
    pub fn unit_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Source database (MySQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host, optionally as `host:port`.
    pub host: String,

    /// Database port. Overrides a port given in `host`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    #[serde(alias = "user")]
    pub username: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// TLS mode. Unset uses TLS when the server offers it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_mode: Option<SslMode>,
}

impl SourceConfig {
    /// Split `host` into hostname and port, falling back to 3306.
    pub fn host_and_port(&self) -> (String, u16) {
        let (host, embedded) = split_host_port(&self.host);
        (host, self.port.or(embedded).unwrap_or(DEFAULT_MYSQL_PORT))
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Destination database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    #[serde(alias = "user")]
    pub username: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// TLS mode (default: disable).
    #[serde(default)]
    pub ssl_mode: SslMode,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// TLS modes, named after PostgreSQL `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plain TCP.
    #[default]
    Disable,
    /// TLS without certificate verification.
    Require,
    /// TLS with certificate verification against the webpki roots.
    VerifyCa,
    /// TLS with certificate and hostname verification.
    VerifyFull,
}

impl SslMode {
    /// Check if this mode requires TLS.
    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }
}

/// Migration behavior configuration.
///
/// Every field is optional; accessors return the effective value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MigrationConfig {
    /// Maximum units running at once. Unset runs every unit concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// MySQL pool size (default: 30).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mysql_connections: Option<usize>,

    /// PostgreSQL pool size (default: effective worker count, capped at 64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,

    /// Rows encoded before a COPY buffer is flushed to the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_buffer_rows: Option<usize>,

    /// Rows buffered between the source cursor and the COPY writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_ahead_rows: Option<usize>,

    /// Retries for a unit that failed with a transient error (default: 0).
    #[serde(default)]
    pub max_retries: usize,

    /// Base delay for exponential retry backoff in milliseconds (default: 500).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Per-unit deadline in seconds. Unset means no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_timeout_secs: Option<u64>,
}

impl MigrationConfig {
    /// Effective concurrency for a run of `units` units.
    pub fn effective_workers(&self, units: usize) -> usize {
        match self.workers {
            Some(w) => w.min(units.max(1)),
            None => units,
        }
        .max(1)
    }

    pub fn get_max_mysql_connections(&self) -> usize {
        self.max_mysql_connections.unwrap_or(DEFAULT_MYSQL_CONNECTIONS)
    }

    pub fn get_max_pg_connections(&self, units: usize) -> usize {
        self.max_pg_connections
            .unwrap_or_else(|| self.effective_workers(units).min(MAX_DEFAULT_PG_CONNECTIONS))
    }

    pub fn get_copy_buffer_rows(&self) -> usize {
        self.copy_buffer_rows.unwrap_or(10_000)
    }

    pub fn get_read_ahead_rows(&self) -> usize {
        self.read_ahead_rows.unwrap_or(1_000)
    }

    pub fn get_retry_base_delay_ms(&self) -> u64 {
        self.retry_base_delay_ms.unwrap_or(500)
    }
}

const DEFAULT_MYSQL_PORT: u16 = 3306;
const DEFAULT_MYSQL_CONNECTIONS: usize = 30;
const MAX_DEFAULT_PG_CONNECTIONS: usize = 64;

/// Split `host:port`, accepting bracketed IPv6 literals such as `[::1]:3306`.
fn split_host_port(raw: &str) -> (String, Option<u16>) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (raw.to_string(), None),
        },
        _ => (raw.to_string(), None),
    }
}

fn default_pg_port() -> u16 {
    5432
}
