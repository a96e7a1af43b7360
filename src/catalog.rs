//! Relation catalog cache
//!
//! Maps relation OIDs to column metadata. Relation frames from the stream
//! are authoritative for identity and column order; declared type names are
//! resolved lazily from the source system catalog the first time a DML
//! record needs rendering, and invalidated whenever a newer Relation frame
//! replaces the entry.
//!
//! Each DML worker owns its own cache; nothing here is process-global.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::{CatalogEntry, Oid, RelationMeta};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Per-worker cache of relation metadata and declared column types.
#[derive(Debug, Default)]
pub struct CatalogCache {
    relations: HashMap<Oid, RelationMeta>,
    declared: HashMap<Oid, HashMap<String, String>>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store relation metadata from the stream. A newer Relation frame for
    /// the same OID replaces the entry atomically and drops any declared
    /// types resolved for the previous shape.
    pub fn upsert_relation(&mut self, relation: RelationMeta) {
        debug!(
            "Caching relation {} ({}.{}) with {} columns",
            relation.oid,
            relation.namespace,
            relation.name,
            relation.columns.len()
        );
        self.declared.remove(&relation.oid);
        self.relations.insert(relation.oid, relation);
    }

    pub fn relation(&self, oid: Oid) -> Option<&RelationMeta> {
        self.relations.get(&oid)
    }

    /// Attach declared type names (by column name) for a cached relation.
    pub fn set_declared(&mut self, oid: Oid, types: HashMap<String, String>) {
        self.declared.insert(oid, types);
    }

    pub fn has_declared(&self, oid: Oid) -> bool {
        self.declared.contains_key(&oid)
    }

    /// Drop everything cached for an OID.
    pub fn invalidate(&mut self, oid: Oid) {
        self.relations.remove(&oid);
        self.declared.remove(&oid);
    }

    /// Assemble the renderer's view of a relation: physical column order
    /// from the Relation frame joined with declared types by name.
    pub fn entry(&self, oid: Oid) -> BridgeResult<CatalogEntry> {
        let relation = self
            .relations
            .get(&oid)
            .ok_or_else(|| BridgeError::catalog(format!("no cached relation for OID {oid}")))?;
        let declared = self.declared.get(&oid).ok_or_else(|| {
            BridgeError::catalog(format!(
                "no declared types resolved for relation {} ({})",
                oid, relation.name
            ))
        })?;

        let mut columns = Vec::with_capacity(relation.columns.len());
        for col in &relation.columns {
            let declared_type = declared.get(&col.name).ok_or_else(|| {
                BridgeError::catalog(format!(
                    "column {} of relation {} missing from the source catalog",
                    col.name, relation.name
                ))
            })?;
            columns.push((col.name.clone(), declared_type.clone()));
        }

        Ok(CatalogEntry {
            namespace: relation.namespace.clone(),
            table: relation.name.clone(),
            columns,
        })
    }
}

/// Lookup of declared column types against the source system catalog.
#[async_trait]
pub trait SourceCatalog: Send {
    /// Resolve `(column_name, declared_type)` for a table by name.
    async fn column_types(&mut self, table: &str) -> BridgeResult<HashMap<String, String>>;
}

/// PostgreSQL source catalog probe backed by `pg_catalog`.
pub struct PgCatalogProbe {
    client: tokio_postgres::Client,
}

impl PgCatalogProbe {
    pub async fn connect(url: &str) -> BridgeResult<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Source catalog connection error: {e}");
            }
        });
        info!("Connected source catalog probe");
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceCatalog for PgCatalogProbe {
    async fn column_types(&mut self, table: &str) -> BridgeResult<HashMap<String, String>> {
        let rows = self
            .client
            .query(
                "SELECT attname AS column_name, \
                        pg_catalog.format_type(atttypid, atttypmod) AS data_type \
                 FROM pg_catalog.pg_attribute \
                 WHERE attrelid = (SELECT oid FROM pg_catalog.pg_class WHERE relname = $1) \
                   AND attnum > 0 \
                   AND NOT attisdropped",
                &[&table],
            )
            .await?;

        let mut types = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get(0);
            let declared: String = row.get(1);
            types.insert(name, declared);
        }
        debug!("Resolved {} column types for table {}", types.len(), table);
        Ok(types)
    }
}

/// MySQL source catalog probe backed by `information_schema`.
///
/// String-family types are reported under their canonical names
/// (`character varying`, `character`) so the renderer's quoting rule applies
/// uniformly across source engines.
pub struct MySqlCatalogProbe {
    conn: mysql_async::Conn,
    database: String,
}

impl MySqlCatalogProbe {
    pub async fn connect(url: &str) -> BridgeResult<Self> {
        let opts = mysql_async::Opts::from_url(url)?;
        let database = opts.db_name().unwrap_or_default().to_string();
        let conn = mysql_async::Conn::new(opts).await?;
        info!("Connected source catalog probe for database {database}");
        Ok(Self { conn, database })
    }
}

/// Report MySQL string-family types under their canonical names so the
/// renderer's quoting rule applies uniformly across source engines.
pub fn canonical_mysql_type(data_type: &str) -> String {
    match data_type {
        "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" => {
            "character varying".to_string()
        }
        "char" => "character".to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SourceCatalog for MySqlCatalogProbe {
    async fn column_types(&mut self, table: &str) -> BridgeResult<HashMap<String, String>> {
        use mysql_async::prelude::*;

        let rows: Vec<(String, String)> = self
            .conn
            .exec(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = ? AND table_schema = ? \
                 ORDER BY ordinal_position",
                (table, &self.database),
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type)| (name, canonical_mysql_type(&data_type)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnMeta;

    fn users_meta(oid: Oid) -> RelationMeta {
        RelationMeta {
            oid,
            xid: 0,
            namespace: "public".into(),
            name: "users".into(),
            replica_identity: b'd',
            columns: vec![
                ColumnMeta {
                    flags: 1,
                    name: "id".into(),
                    type_oid: 23,
                    type_modifier: -1,
                },
                ColumnMeta {
                    flags: 0,
                    name: "name".into(),
                    type_oid: 1043,
                    type_modifier: 64,
                },
            ],
        }
    }

    fn users_types() -> HashMap<String, String> {
        HashMap::from([
            ("id".to_string(), "integer".to_string()),
            ("name".to_string(), "character varying(64)".to_string()),
        ])
    }

    #[test]
    fn entry_joins_relation_order_with_declared_types() {
        let mut cache = CatalogCache::new();
        cache.upsert_relation(users_meta(16384));
        cache.set_declared(16384, users_types());

        let entry = cache.entry(16384).unwrap();
        assert_eq!(entry.table, "users");
        assert_eq!(
            entry.columns,
            vec![
                ("id".to_string(), "integer".to_string()),
                ("name".to_string(), "character varying(64)".to_string()),
            ]
        );
    }

    #[test]
    fn entry_requires_relation_and_declared_types() {
        let mut cache = CatalogCache::new();
        assert!(cache.entry(1).is_err());

        cache.upsert_relation(users_meta(1));
        assert!(cache.entry(1).is_err());
        assert!(!cache.has_declared(1));
    }

    #[test]
    fn newer_relation_replaces_entry_and_drops_declared_types() {
        let mut cache = CatalogCache::new();
        cache.upsert_relation(users_meta(16384));
        cache.set_declared(16384, users_types());
        assert!(cache.entry(16384).is_ok());

        // the source re-emits the relation after a schema change
        let mut reshaped = users_meta(16384);
        reshaped.columns.push(ColumnMeta {
            flags: 0,
            name: "age".into(),
            type_oid: 23,
            type_modifier: -1,
        });
        cache.upsert_relation(reshaped);

        assert!(!cache.has_declared(16384));
        assert!(cache.entry(16384).is_err());
        assert_eq!(cache.relation(16384).unwrap().columns.len(), 3);
    }

    #[test]
    fn entry_reports_columns_unknown_to_the_source_catalog() {
        let mut cache = CatalogCache::new();
        cache.upsert_relation(users_meta(2));
        cache.set_declared(
            2,
            HashMap::from([("id".to_string(), "integer".to_string())]),
        );
        let err = cache.entry(2).unwrap_err();
        assert!(err.is_catalog());
    }

    #[test]
    fn mysql_string_family_normalizes_to_canonical_names() {
        assert_eq!(canonical_mysql_type("varchar"), "character varying");
        assert_eq!(canonical_mysql_type("char"), "character");
        assert_eq!(canonical_mysql_type("text"), "character varying");
        assert_eq!(canonical_mysql_type("int"), "int");
    }
}
