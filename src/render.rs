//! SQL statement rendering for decoded change records
//!
//! Builds one statement per DML record for the target dialect. Literal
//! encoding is type-aware: values whose declared source type contains
//! `character` are single-quoted, everything else is emitted bare and NULL
//! renders as the bare token. Identifiers interpolate unquoted while they
//! are plain lower-case names; reserved words and mixed-case names get the
//! target dialect's quoting.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::{CatalogEntry, ColumnValue, Dialect, TupleData, TupleKind};

/// Map canonical source type names onto target names. Unknown types pass
/// through unchanged.
pub fn map_type(declared: &str) -> &str {
    match declared {
        "integer" => "int",
        "character varying" => "varchar",
        other => other,
    }
}

// Words that must be quoted when used as identifiers, shared across the
// supported dialects.
const RESERVED_WORDS: &[&str] = &[
    "all", "alter", "and", "any", "as", "asc", "between", "by", "case", "check", "create",
    "cross", "default", "delete", "desc", "distinct", "drop", "else", "end", "exists", "from",
    "grant", "group", "having", "in", "index", "inner", "insert", "into", "is", "join", "key",
    "left", "like", "limit", "not", "null", "offset", "on", "or", "order", "outer", "primary",
    "references", "right", "select", "set", "some", "table", "then", "to", "union", "update",
    "user", "values", "when", "where", "with",
];

fn needs_quoting(ident: &str) -> bool {
    let mut chars = ident.chars();
    let plain = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    !plain || RESERVED_WORDS.contains(&ident)
}

/// Quote an identifier for the given dialect when it needs it.
pub fn quote_ident(dialect: Dialect, ident: &str) -> String {
    if !needs_quoting(ident) {
        return ident.to_string();
    }
    match dialect {
        Dialect::Postgresql | Dialect::Redshift => format!("\"{}\"", ident.replace('"', "\"\"")),
        Dialect::Mysql => format!("`{}`", ident.replace('`', "``")),
    }
}

/// Render a column value as a SQL literal for the given declared type.
///
/// Returns `None` for the unchanged-TOAST sentinel, which must never reach
/// a statement.
pub fn literal(declared_type: &str, value: &ColumnValue) -> Option<String> {
    match value {
        ColumnValue::Unchanged => None,
        ColumnValue::Null => Some("NULL".to_string()),
        ColumnValue::Text(text) => {
            if declared_type.contains("character") {
                Some(format!("'{}'", text.replace('\'', "''")))
            } else {
                Some(text.clone())
            }
        }
    }
}

/// Statement renderer parameterized by target dialect.
#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    dialect: Dialect,
}

impl Renderer {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn ident(&self, name: &str) -> String {
        quote_ident(self.dialect, name)
    }

    fn check_width(&self, entry: &CatalogEntry, tuple: &TupleData) -> BridgeResult<()> {
        if entry.columns.len() != tuple.len() {
            return Err(BridgeError::catalog(format!(
                "tuple has {} columns but catalog entry for {} has {}",
                tuple.len(),
                entry.table,
                entry.columns.len()
            )));
        }
        Ok(())
    }

    /// `INSERT INTO <table> (<cols>) VALUES (<vals>);` — columns in catalog
    /// order, values in tuple order.
    pub fn insert(
        &self,
        table: &str,
        entry: &CatalogEntry,
        tuple: &TupleData,
    ) -> BridgeResult<String> {
        self.check_width(entry, tuple)?;

        let mut columns = Vec::with_capacity(tuple.len());
        let mut values = Vec::with_capacity(tuple.len());
        for ((name, declared), value) in entry.columns.iter().zip(&tuple.columns) {
            let rendered = literal(declared, value).ok_or_else(|| {
                BridgeError::protocol(format!(
                    "unchanged-TOAST sentinel for column {name} in an insert tuple"
                ))
            })?;
            columns.push(self.ident(name));
            values.push(rendered);
        }

        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({});",
            self.ident(table),
            columns.join(", "),
            values.join(", ")
        ))
    }

    /// `UPDATE <table> SET <changed> WHERE <unchanged>;`
    ///
    /// The SET clause names every column whose value differs between the old
    /// and new image; the WHERE clause names every column that kept its
    /// value, serving as the row identifier. Columns carrying the TOAST
    /// sentinel on either side are omitted from both clauses. Returns
    /// `Ok(None)` when either clause would be empty.
    pub fn update(
        &self,
        table: &str,
        entry: &CatalogEntry,
        old_kind: TupleKind,
        old: &TupleData,
        new: &TupleData,
    ) -> BridgeResult<Option<String>> {
        self.check_width(entry, old)?;
        self.check_width(entry, new)?;

        let mut set_parts = Vec::new();
        let mut where_parts = Vec::new();

        for (i, (name, declared)) in entry.columns.iter().enumerate() {
            let old_value = &old.columns[i];
            let new_value = &new.columns[i];
            if old_value.is_unchanged() || new_value.is_unchanged() {
                continue;
            }

            if old_value != new_value {
                // literal() only returns None for the sentinel, excluded above
                if let Some(rendered) = literal(declared, new_value) {
                    set_parts.push(format!("{} = {}", self.ident(name), rendered));
                }
            } else if let Some(predicate) = self.predicate(name, declared, old_value, old_kind) {
                where_parts.push(predicate);
            }
        }

        if set_parts.is_empty() || where_parts.is_empty() {
            return Ok(None);
        }

        Ok(Some(format!(
            "UPDATE {} SET {} WHERE {};",
            self.ident(table),
            set_parts.join(", "),
            where_parts.join(" AND ")
        )))
    }

    /// `DELETE FROM <table> WHERE <old image>;` — every column the old tuple
    /// provides becomes part of the predicate. Returns `Ok(None)` when the
    /// old image yields no usable predicate.
    pub fn delete(
        &self,
        table: &str,
        entry: &CatalogEntry,
        old_kind: TupleKind,
        old: &TupleData,
    ) -> BridgeResult<Option<String>> {
        self.check_width(entry, old)?;

        let mut where_parts = Vec::new();
        for ((name, declared), value) in entry.columns.iter().zip(&old.columns) {
            if let Some(predicate) = self.predicate(name, declared, value, old_kind) {
                where_parts.push(predicate);
            }
        }

        if where_parts.is_empty() {
            return Ok(None);
        }

        Ok(Some(format!(
            "DELETE FROM {} WHERE {};",
            self.ident(table),
            where_parts.join(" AND ")
        )))
    }

    // One row-matching predicate. A null in a full old image matches with IS
    // NULL; a null in a key-only image just marks an unprovided column and
    // produces nothing.
    fn predicate(
        &self,
        name: &str,
        declared: &str,
        value: &ColumnValue,
        old_kind: TupleKind,
    ) -> Option<String> {
        match value {
            ColumnValue::Unchanged => None,
            ColumnValue::Null => match old_kind {
                TupleKind::Old => Some(format!("{} IS NULL", self.ident(name))),
                _ => None,
            },
            ColumnValue::Text(_) => {
                literal(declared, value).map(|rendered| format!("{} = {}", self.ident(name), rendered))
            }
        }
    }

    /// `TRUNCATE <table>;` with no cascade options.
    pub fn truncate(&self, table: &str) -> String {
        format!("TRUNCATE {};", self.ident(table))
    }

    /// `ALTER TABLE <t> ADD COLUMN <c> <type>;` with the declared type run
    /// through the dialect mapping.
    pub fn add_column(&self, table: &str, column: &str, declared: &str) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {};",
            self.ident(table),
            self.ident(column),
            map_type(declared)
        )
    }

    /// `ALTER TABLE <t> DROP COLUMN <c>;`
    pub fn drop_column(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {};",
            self.ident(table),
            self.ident(column)
        )
    }

    /// Column type alteration, dialect-specific: `ALTER COLUMN <c> TYPE <t>`
    /// for the PostgreSQL family, `MODIFY <c> <t>` for MySQL.
    pub fn modify_column(&self, table: &str, column: &str, declared: &str) -> String {
        let mapped = map_type(declared);
        match self.dialect {
            Dialect::Postgresql | Dialect::Redshift => format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {};",
                self.ident(table),
                self.ident(column),
                mapped
            ),
            Dialect::Mysql => format!(
                "ALTER TABLE {} MODIFY {} {};",
                self.ident(table),
                self.ident(column),
                mapped
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CatalogEntry {
        CatalogEntry {
            namespace: "public".into(),
            table: "t".into(),
            columns: vec![
                ("id".to_string(), "integer".to_string()),
                ("name".to_string(), "character varying".to_string()),
            ],
        }
    }

    fn tuple(values: &[ColumnValue]) -> TupleData {
        TupleData {
            columns: values.to_vec(),
        }
    }

    fn text(s: &str) -> ColumnValue {
        ColumnValue::Text(s.to_string())
    }

    fn pg() -> Renderer {
        Renderer::new(Dialect::Postgresql)
    }

    #[test]
    fn renders_insert() {
        let sql = pg()
            .insert("t", &entry(), &tuple(&[text("1001"), text("alice")]))
            .unwrap();
        assert_eq!(sql, "INSERT INTO t (id, name) VALUES (1001, 'alice');");
    }

    #[test]
    fn renders_update_with_changed_and_unchanged_columns() {
        let old = tuple(&[text("1001"), text("alice")]);
        let new = tuple(&[text("1001"), text("bob")]);
        let sql = pg()
            .update("t", &entry(), TupleKind::Old, &old, &new)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "UPDATE t SET name = 'bob' WHERE id = 1001;");
    }

    #[test]
    fn renders_delete_with_full_row_predicate() {
        let old = tuple(&[text("1001"), text("bob")]);
        let sql = pg()
            .delete("t", &entry(), TupleKind::Old, &old)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "DELETE FROM t WHERE id = 1001 AND name = 'bob';");
    }

    #[test]
    fn renders_truncate() {
        assert_eq!(pg().truncate("t"), "TRUNCATE t;");
    }

    #[test]
    fn character_types_quote_and_numeric_types_do_not() {
        assert_eq!(literal("character varying(64)", &text("alice")).unwrap(), "'alice'");
        assert_eq!(literal("character", &text("x")).unwrap(), "'x'");
        assert_eq!(literal("integer", &text("7")).unwrap(), "7");
        assert_eq!(literal("bigint", &ColumnValue::Null).unwrap(), "NULL");
        assert_eq!(literal("character varying", &ColumnValue::Null).unwrap(), "NULL");
        assert_eq!(literal("integer", &ColumnValue::Unchanged), None);
    }

    #[test]
    fn string_literals_escape_embedded_quotes() {
        let sql = pg()
            .insert("t", &entry(), &tuple(&[text("1"), text("o'brien")]))
            .unwrap();
        assert_eq!(sql, "INSERT INTO t (id, name) VALUES (1, 'o''brien');");
    }

    #[test]
    fn update_set_and_where_partition_the_column_set() {
        let wide = CatalogEntry {
            namespace: "public".into(),
            table: "t".into(),
            columns: vec![
                ("id".to_string(), "integer".to_string()),
                ("name".to_string(), "character varying".to_string()),
                ("age".to_string(), "integer".to_string()),
            ],
        };
        let old = tuple(&[text("1"), text("alice"), text("30")]);
        let new = tuple(&[text("1"), text("bob"), text("31")]);
        let sql = pg()
            .update("t", &wide, TupleKind::Old, &old, &new)
            .unwrap()
            .unwrap();

        // every column appears in exactly one clause
        assert_eq!(sql, "UPDATE t SET name = 'bob', age = 31 WHERE id = 1;");
        let (set_clause, where_clause) = sql.split_once(" WHERE ").unwrap();
        for col in ["id", "name", "age"] {
            let in_set = set_clause.contains(&format!("{col} = "));
            let in_where = where_clause.contains(&format!("{col} = "));
            assert!(in_set ^ in_where, "column {col} must be in exactly one clause");
        }
    }

    #[test]
    fn update_omits_toast_sentinels_from_both_clauses() {
        let wide = CatalogEntry {
            namespace: "public".into(),
            table: "t".into(),
            columns: vec![
                ("id".to_string(), "integer".to_string()),
                ("payload".to_string(), "text".to_string()),
                ("name".to_string(), "character varying".to_string()),
            ],
        };
        let old = tuple(&[text("1"), ColumnValue::Unchanged, text("alice")]);
        let new = tuple(&[text("1"), ColumnValue::Unchanged, text("bob")]);
        let sql = pg()
            .update("t", &wide, TupleKind::Old, &old, &new)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "UPDATE t SET name = 'bob' WHERE id = 1;");
    }

    #[test]
    fn update_without_changes_or_without_anchor_yields_nothing() {
        let same = tuple(&[text("1"), text("alice")]);
        assert!(pg()
            .update("t", &entry(), TupleKind::Old, &same, &same)
            .unwrap()
            .is_none());

        let old = tuple(&[text("1"), text("alice")]);
        let new = tuple(&[text("2"), text("bob")]);
        assert!(pg()
            .update("t", &entry(), TupleKind::Old, &old, &new)
            .unwrap()
            .is_none());
    }

    #[test]
    fn null_matching_depends_on_old_image_kind() {
        let old_full = tuple(&[text("1"), ColumnValue::Null]);
        let sql = pg()
            .delete("t", &entry(), TupleKind::Old, &old_full)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "DELETE FROM t WHERE id = 1 AND name IS NULL;");

        // key-only image: the null just marks an unprovided column
        let old_key = tuple(&[text("1"), ColumnValue::Null]);
        let sql = pg()
            .delete("t", &entry(), TupleKind::Key, &old_key)
            .unwrap()
            .unwrap();
        assert_eq!(sql, "DELETE FROM t WHERE id = 1;");
    }

    #[test]
    fn width_mismatch_is_a_catalog_error() {
        let narrow = tuple(&[text("1")]);
        assert!(pg().insert("t", &entry(), &narrow).is_err());
    }

    #[test]
    fn reserved_and_mixed_case_identifiers_are_quoted_per_dialect() {
        let sql = pg().truncate("order");
        assert_eq!(sql, "TRUNCATE \"order\";");

        let my = Renderer::new(Dialect::Mysql);
        assert_eq!(my.truncate("order"), "TRUNCATE `order`;");
        assert_eq!(quote_ident(Dialect::Postgresql, "CamelCase"), "\"CamelCase\"");
        assert_eq!(quote_ident(Dialect::Mysql, "plain_name"), "plain_name");
    }

    #[test]
    fn modify_column_uses_dialect_syntax_and_type_mapping() {
        let my = Renderer::new(Dialect::Mysql);
        assert_eq!(my.modify_column("t", "id", "integer"), "ALTER TABLE t MODIFY id int;");

        assert_eq!(
            pg().modify_column("t", "name", "character varying"),
            "ALTER TABLE t ALTER COLUMN name TYPE varchar;"
        );
        assert_eq!(
            Renderer::new(Dialect::Redshift).modify_column("t", "id", "integer"),
            "ALTER TABLE t ALTER COLUMN id TYPE int;"
        );
    }

    #[test]
    fn insert_renders_from_a_decoded_frame() {
        use crate::catalog::CatalogCache;
        use crate::decoder::FrameDecoder;
        use crate::types::Change;
        use std::collections::HashMap;

        let mut relation = vec![b'R'];
        relation.extend_from_slice(&16384u32.to_be_bytes());
        relation.extend_from_slice(&701u32.to_be_bytes());
        relation.extend_from_slice(b"public\0");
        relation.extend_from_slice(b"t\0");
        relation.push(b'd');
        relation.extend_from_slice(&2u16.to_be_bytes());
        relation.push(1);
        relation.extend_from_slice(b"id\0");
        relation.extend_from_slice(&23u32.to_be_bytes());
        relation.extend_from_slice(&(-1i32).to_be_bytes());
        relation.push(0);
        relation.extend_from_slice(b"name\0");
        relation.extend_from_slice(&1043u32.to_be_bytes());
        relation.extend_from_slice(&(-1i32).to_be_bytes());

        let mut insert = vec![b'I'];
        insert.extend_from_slice(&16384u32.to_be_bytes());
        insert.push(b'N');
        insert.extend_from_slice(&2u16.to_be_bytes());
        insert.push(b't');
        insert.extend_from_slice(&4u32.to_be_bytes());
        insert.extend_from_slice(b"1001");
        insert.push(b't');
        insert.extend_from_slice(&5u32.to_be_bytes());
        insert.extend_from_slice(b"alice");

        let mut cache = CatalogCache::new();
        match FrameDecoder::decode(&relation).unwrap() {
            Change::Relation(rel) => cache.upsert_relation(rel),
            other => panic!("expected Relation, got {}", other.kind()),
        }
        cache.set_declared(
            16384,
            HashMap::from([
                ("id".to_string(), "integer".to_string()),
                ("name".to_string(), "character varying".to_string()),
            ]),
        );

        let entry = cache.entry(16384).unwrap();
        match FrameDecoder::decode(&insert).unwrap() {
            Change::Insert {
                relation_oid,
                new_tuple,
            } => {
                assert_eq!(relation_oid, 16384);
                assert_eq!(new_tuple.len(), entry.columns.len());
                let sql = pg().insert("t", &entry, &new_tuple).unwrap();
                assert_eq!(sql, "INSERT INTO t (id, name) VALUES (1001, 'alice');");
            }
            other => panic!("expected Insert, got {}", other.kind()),
        }
    }

    #[test]
    fn add_column_maps_declared_types() {
        assert_eq!(pg().add_column("t", "age", "integer"), "ALTER TABLE t ADD COLUMN age int;");
        assert_eq!(
            pg().add_column("t", "note", "text"),
            "ALTER TABLE t ADD COLUMN note text;"
        );
    }
}
