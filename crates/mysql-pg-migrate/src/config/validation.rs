//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.src.host.trim().is_empty() {
        return Err(MigrateError::Config("src.host is required".into()));
    }
    if config.src.database.trim().is_empty() {
        return Err(MigrateError::Config("src.database is required".into()));
    }
    if config.src.username.trim().is_empty() {
        return Err(MigrateError::Config("src.username is required".into()));
    }

    // Destination validation
    if config.dest.host.trim().is_empty() {
        return Err(MigrateError::Config("dest.host is required".into()));
    }
    if config.dest.database.trim().is_empty() {
        return Err(MigrateError::Config("dest.database is required".into()));
    }
    if config.dest.username.trim().is_empty() {
        return Err(MigrateError::Config("dest.username is required".into()));
    }

    // Tables
    if config.tables.is_empty() {
        return Err(MigrateError::Config(
            "tables must map at least one destination table to a query".into(),
        ));
    }
    for (table, queries) in &config.tables {
        if table.trim().is_empty() {
            return Err(MigrateError::Config("table names cannot be empty".into()));
        }
        if let Some(pos) = queries.iter().position(|q| q.trim().is_empty()) {
            return Err(MigrateError::Config(format!(
                "tables.{}[{}] is an empty query",
                table, pos
            )));
        }
    }

    // Migration config validation - only check if explicitly set
    let m = &config.migration;
    for (name, value) in [
        ("workers", m.workers),
        ("max_mysql_connections", m.max_mysql_connections),
        ("max_pg_connections", m.max_pg_connections),
        ("copy_buffer_rows", m.copy_buffer_rows),
        ("read_ahead_rows", m.read_ahead_rows),
    ] {
        if value == Some(0) {
            return Err(MigrateError::Config(format!(
                "migration.{} must be at least 1",
                name
            )));
        }
    }
    if m.unit_timeout_secs == Some(0) {
        return Err(MigrateError::Config(
            "migration.unit_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MigrationConfig, SourceConfig, SslMode, TargetConfig};
    use indexmap::IndexMap;

    fn valid_config() -> Config {
        let mut tables = IndexMap::new();
        tables.insert(
            "users".to_string(),
            vec!["SELECT id, name, email FROM users".to_string()],
        );
        Config {
            src: SourceConfig {
                host: "localhost".to_string(),
                port: None,
                database: "shop".to_string(),
                username: "root".to_string(),
                password: "password".to_string(),
                ssl_mode: None,
            },
            dest: TargetConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "warehouse".to_string(),
                username: "postgres".to_string(),
                password: "password".to_string(),
                ssl_mode: SslMode::Disable,
            },
            tables,
            migration: MigrationConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.src.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_dest_username() {
        let mut config = valid_config();
        config.dest.username = "  ".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("dest.username"));
    }

    #[test]
    fn test_empty_tables_rejected() {
        let mut config = valid_config();
        config.tables.clear();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_blank_query_rejected() {
        let mut config = valid_config();
        config
            .tables
            .insert("orders".to_string(), vec!["SELECT 1".into(), " ".into()]);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("tables.orders[1]"));
    }

    #[test]
    fn test_table_with_no_queries_allowed() {
        let mut config = valid_config();
        config.tables.insert("archive".to_string(), Vec::new());
        assert!(validate(&config).is_ok());
        assert_eq!(config.unit_count(), 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = valid_config();
        config.migration.workers = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_copy_buffer_rejected() {
        let mut config = valid_config();
        config.migration.copy_buffer_rows = Some(0);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("copy_buffer_rows"));
    }
}
