//! Replication pair configuration with validation
//!
//! All connection endpoints, names and cadences for one replication pair
//! live in an explicit [`BridgeConfig`] value handed to the supervisor at
//! activation; the engine holds no process-wide settings and no built-in
//! credentials.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::Dialect;
use std::time::Duration;

/// Default replica server id for binlog subscriptions, far away from the
/// range operators usually hand out manually.
pub const DEFAULT_SERVER_ID: u32 = u32::MAX - 55;

/// Configuration for one replication pair.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub source_dialect: Dialect,
    pub target_dialect: Dialect,
    pub source_url: String,
    pub target_url: String,
    /// Replication slot name (PostgreSQL sources)
    pub slot_name: String,
    /// Publication name (PostgreSQL sources)
    pub publication_name: String,
    /// Replicated table on the source; `schema.table` for MySQL sources
    pub table_source: String,
    /// Table written on the target
    pub table_dest: String,
    pub poll_interval_secs: u64,
    /// Replica server id for binlog subscriptions (MySQL sources)
    pub server_id: u32,
}

impl BridgeConfig {
    /// Create a validated configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_dialect: Dialect,
        target_dialect: Dialect,
        source_url: String,
        target_url: String,
        slot_name: String,
        publication_name: String,
        table_source: String,
        table_dest: String,
        poll_interval_secs: u64,
        server_id: u32,
    ) -> BridgeResult<Self> {
        if source_url.trim().is_empty() {
            return Err(BridgeError::config("Source connection string cannot be empty"));
        }
        if target_url.trim().is_empty() {
            return Err(BridgeError::config("Target connection string cannot be empty"));
        }
        if table_source.trim().is_empty() {
            return Err(BridgeError::config("Source table name cannot be empty"));
        }
        if table_dest.trim().is_empty() {
            return Err(BridgeError::config("Target table name cannot be empty"));
        }

        match source_dialect {
            Dialect::Postgresql => {
                validate_pg_identifier("Slot name", &slot_name)?;
                validate_pg_identifier("Publication name", &publication_name)?;
            }
            Dialect::Mysql => {
                if !table_source.contains('.') {
                    return Err(BridgeError::config(
                        "MySQL sources need a schema-qualified source table (schema.table)",
                    ));
                }
                if server_id == 0 {
                    return Err(BridgeError::config(
                        "server_id 0 is reserved; choose a unique replica id",
                    ));
                }
            }
            Dialect::Redshift => {
                return Err(BridgeError::config(
                    "redshift is supported as a target only",
                ));
            }
        }

        if poll_interval_secs == 0 {
            return Err(BridgeError::config("Poll interval must be at least 1 second"));
        }

        Ok(Self {
            source_dialect,
            target_dialect,
            source_url,
            target_url,
            slot_name,
            publication_name,
            table_source,
            table_dest,
            poll_interval_secs,
            server_id,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Bare source table name, without any schema qualifier.
    pub fn source_table_name(&self) -> &str {
        bare_table(&self.table_source)
    }

    /// Bare target table name, without any schema qualifier.
    pub fn dest_table_name(&self) -> &str {
        bare_table(&self.table_dest)
    }

    /// `(schema, table)` filter for the binlog subscription.
    pub fn binlog_filter(&self) -> BridgeResult<(String, String)> {
        match self.table_source.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok((schema.to_string(), table.to_string()))
            }
            _ => Err(BridgeError::config(format!(
                "'{}' is not a schema-qualified table name",
                self.table_source
            ))),
        }
    }
}

fn bare_table(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

// PostgreSQL identifier rules: alphanumerics and underscores, at most 63
// bytes.
fn validate_pg_identifier(what: &str, value: &str) -> BridgeResult<()> {
    if value.trim().is_empty() {
        return Err(BridgeError::config(format!("{what} cannot be empty")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(BridgeError::config(format!(
            "{what} can only contain alphanumeric characters and underscores"
        )));
    }
    if value.len() > 63 {
        return Err(BridgeError::config(format!(
            "{what} cannot be longer than 63 characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> BridgeResult<BridgeConfig> {
        BridgeConfig::new(
            Dialect::Postgresql,
            Dialect::Mysql,
            "host=localhost user=postgres dbname=src".into(),
            "mysql://user:pw@localhost:3306/dst".into(),
            "user_slot".into(),
            "test_pub".into(),
            "t".into(),
            "t".into(),
            1,
            DEFAULT_SERVER_ID,
        )
    }

    #[test]
    fn accepts_a_valid_pair() {
        let config = base().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.source_table_name(), "t");
    }

    #[test]
    fn rejects_empty_urls_and_tables() {
        let err = BridgeConfig::new(
            Dialect::Postgresql,
            Dialect::Postgresql,
            "".into(),
            "x".into(),
            "s".into(),
            "p".into(),
            "t".into(),
            "t".into(),
            1,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration { .. }));
    }

    #[test]
    fn rejects_bad_slot_identifiers() {
        for bad in ["my-slot", "slot name", "s".repeat(64).as_str()] {
            let result = BridgeConfig::new(
                Dialect::Postgresql,
                Dialect::Postgresql,
                "src".into(),
                "dst".into(),
                bad.into(),
                "pub".into(),
                "t".into(),
                "t".into(),
                1,
                1,
            );
            assert!(result.is_err(), "slot name {bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_redshift_as_a_source() {
        let result = BridgeConfig::new(
            Dialect::Redshift,
            Dialect::Postgresql,
            "src".into(),
            "dst".into(),
            "s".into(),
            "p".into(),
            "t".into(),
            "t".into(),
            1,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn mysql_sources_require_qualified_tables() {
        let result = BridgeConfig::new(
            Dialect::Mysql,
            Dialect::Postgresql,
            "mysql://u@localhost/db".into(),
            "dst".into(),
            "s".into(),
            "p".into(),
            "t".into(),
            "t".into(),
            1,
            1,
        );
        assert!(result.is_err());

        let config = BridgeConfig::new(
            Dialect::Mysql,
            Dialect::Postgresql,
            "mysql://u@localhost/db".into(),
            "dst".into(),
            "s".into(),
            "p".into(),
            "db.t".into(),
            "t".into(),
            1,
            1,
        )
        .unwrap();
        assert_eq!(config.binlog_filter().unwrap(), ("db".to_string(), "t".to_string()));
        assert_eq!(config.source_table_name(), "t");
    }
}
