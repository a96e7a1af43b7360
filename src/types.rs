//! Shared data types for the replication bridge
//!
//! This module is the bottom layer of the crate: decoded change records,
//! relation/catalog metadata and the target dialect enum. Everything else
//! (decoder, renderer, applier, reconciler, supervisor) depends on it and
//! nothing here depends on them.

use crate::errors::BridgeError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

// Type aliases matching PostgreSQL internal types
pub type XLogRecPtr = u64; // WAL location pointer
pub type Xid = u32; // Transaction ID
pub type Oid = u32; // Object ID
pub type TimestampTz = i64; // Microseconds since 2000-01-01T00:00:00Z

/// One raw entry pulled from the replication slot: the WAL position the
/// payload was read at, the transaction it belongs to, and the undecoded
/// logical-decoding frame.
#[derive(Debug, Clone)]
pub struct RawChange {
    pub lsn: XLogRecPtr,
    pub xid: Xid,
    pub data: Vec<u8>,
}

/// Tuple-type marker preceding each TupleData on the wire.
///
/// `New` carries the full new row image, `Key` an old image restricted to
/// the replica-identity key columns, `Old` the full old row image. Update
/// and delete decoding is driven by this marker, never by payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TupleKind {
    New,
    Key,
    Old,
}

impl TupleKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'N' => Some(TupleKind::New),
            b'K' => Some(TupleKind::Key),
            b'O' => Some(TupleKind::Old),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            TupleKind::New => b'N',
            TupleKind::Key => b'K',
            TupleKind::Old => b'O',
        }
    }
}

/// A single column value inside a tuple image.
///
/// `Unchanged` is the TOASTed-value sentinel: it is carried through update
/// records but never materialized as a SQL literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ColumnValue {
    Null,
    Unchanged,
    Text(String),
}

impl ColumnValue {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, ColumnValue::Unchanged)
    }
}

/// A complete row image: one value per column, in the relation's physical
/// column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

impl TupleData {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Column metadata carried by a Relation frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMeta {
    /// 1 if the column is part of the replica-identity key, 0 otherwise
    pub flags: u8,
    pub name: String,
    pub type_oid: Oid,
    pub type_modifier: i32,
}

/// Table metadata carried by a Relation frame. The column ordering is
/// authoritative and matches the physical tuple layout of every subsequent
/// DML frame for this OID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationMeta {
    pub oid: Oid,
    pub xid: Xid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnMeta>,
}

/// A decoded logical-decoding message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Change {
    /// Transaction start; every following DML record belongs to this
    /// transaction until the matching Commit.
    Begin {
        lsn: XLogRecPtr,
        commit_ts: TimestampTz,
        xid: Xid,
    },

    /// Transaction end.
    Commit {
        flags: u8,
        commit_lsn: XLogRecPtr,
        end_lsn: XLogRecPtr,
        commit_ts: TimestampTz,
    },

    /// Table schema announcement, sent before the first DML record that
    /// references the relation in a session.
    Relation(RelationMeta),

    Insert {
        relation_oid: Oid,
        new_tuple: TupleData,
    },

    Update {
        relation_oid: Oid,
        /// Marker of the old image when one was sent (`Key` or `Old`)
        old_kind: Option<TupleKind>,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },

    Delete {
        relation_oid: Oid,
        old_kind: TupleKind,
        old_tuple: TupleData,
    },

    Truncate {
        xid: Xid,
        relation_oids: Vec<Oid>,
        options: u8,
    },
}

impl Change {
    /// Message kind as a string for logging and tracing
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Begin { .. } => "Begin",
            Change::Commit { .. } => "Commit",
            Change::Relation { .. } => "Relation",
            Change::Insert { .. } => "Insert",
            Change::Update { .. } => "Update",
            Change::Delete { .. } => "Delete",
            Change::Truncate { .. } => "Truncate",
        }
    }
}

/// One table's column catalog as the renderer sees it: the relation's
/// physical column order joined with the declared type names resolved from
/// the source system catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub namespace: String,
    pub table: String,
    /// (column name, declared type), e.g. `("name", "character varying(64)")`
    pub columns: Vec<(String, String)>,
}

/// Supported database engines.
///
/// `Postgresql` and `Mysql` are valid as both source and target; `Redshift`
/// speaks the PostgreSQL wire protocol and is target-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dialect {
    Postgresql,
    Mysql,
    Redshift,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Postgresql => "postgresql",
            Dialect::Mysql => "mysql",
            Dialect::Redshift => "redshift",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Dialect::Postgresql),
            "mysql" => Ok(Dialect::Mysql),
            "redshift" => Ok(Dialect::Redshift),
            other => Err(BridgeError::config(format!(
                "Unsupported dialect '{other}': expected one of postgresql, mysql, redshift"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_parses_known_tokens() {
        assert_eq!("postgresql".parse::<Dialect>().unwrap(), Dialect::Postgresql);
        assert_eq!("MySQL".parse::<Dialect>().unwrap(), Dialect::Mysql);
        assert_eq!(" redshift ".parse::<Dialect>().unwrap(), Dialect::Redshift);
    }

    #[test]
    fn dialect_rejects_unknown_token() {
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn tuple_kind_round_trips_markers() {
        for b in [b'N', b'K', b'O'] {
            assert_eq!(TupleKind::from_byte(b).unwrap().as_byte(), b);
        }
        assert!(TupleKind::from_byte(b'X').is_none());
    }
}
