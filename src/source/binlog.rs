//! Binary-log row-event reader for MySQL sources
//!
//! Subscribes to the source's binlog as a replica and turns
//! Write/Update/DeleteRows events for the configured tables into the same
//! change records the slot pipeline produces. Row events carry no column
//! names, so each table's column list is resolved once from
//! `information_schema.columns` and announced downstream as a synthetic
//! Relation record before the first row change.
//!
//! The server must run with `binlog_format=row`; the replica `server_id`
//! is chosen by the engine and must be unique among the source's replicas.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::*;
use futures::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
enum RowsKind {
    Insert,
    Update,
    Delete,
}

struct SeenTable {
    oid: Oid,
    columns: usize,
}

/// Reader over one binlog subscription.
pub struct BinlogReader {
    stream: BinlogStream,
    catalog_conn: Conn,
    /// `(schema, table)` pairs this pair replicates; everything else in the
    /// binlog is skipped.
    tables: Vec<(String, String)>,
    seen: HashMap<(String, String), SeenTable>,
    next_oid: Oid,
}

impl BinlogReader {
    /// Connect as a replica and open the binlog stream. A second plain
    /// connection serves the `information_schema` lookups.
    pub async fn connect(
        url: &str,
        server_id: u32,
        tables: Vec<(String, String)>,
    ) -> BridgeResult<Self> {
        let opts = Opts::from_url(url)
            .map_err(|e| BridgeError::connection(format!("invalid mysql url: {e}")))?;
        let catalog_conn = Conn::new(opts.clone())
            .await
            .map_err(|e| BridgeError::connection(format!("connecting to mysql source: {e}")))?;
        let conn = Conn::new(opts)
            .await
            .map_err(|e| BridgeError::connection(format!("connecting to mysql source: {e}")))?;
        let stream = conn
            .get_binlog_stream(BinlogStreamRequest::new(server_id))
            .await
            .map_err(|e| {
                BridgeError::connection(format!("subscribing to binlog as server {server_id}: {e}"))
            })?;
        info!("Subscribed to binlog with server_id {server_id}");

        Ok(Self {
            stream,
            catalog_conn,
            tables,
            seen: HashMap::new(),
            next_oid: 1,
        })
    }

    /// Block until the binlog yields row events for a replicated table and
    /// return them as change records, preceded by a Relation record the
    /// first time a table (or a new column shape of it) is seen.
    pub async fn next_changes(&mut self) -> BridgeResult<Vec<Change>> {
        loop {
            let Some(event) = self.stream.next().await else {
                return Err(BridgeError::connection("binlog stream ended"));
            };
            let event = event?;
            let Some(data) = event.read_data()? else {
                continue;
            };
            let EventData::RowsEvent(rows_event) = data else {
                continue;
            };

            let kind = match &rows_event {
                RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                    RowsKind::Insert
                }
                RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => {
                    RowsKind::Update
                }
                RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                    RowsKind::Delete
                }
                _ => continue,
            };

            // Materialize everything that borrows the table-map entry before
            // touching the catalog connection.
            let (schema, table, column_count, images) = {
                let table_id = rows_event.table_id();
                let Some(tme) = self.stream.get_tme(table_id) else {
                    warn!("Rows event for table id {table_id} without a table map, skipping");
                    continue;
                };
                let schema = tme.database_name().to_string();
                let table = tme.table_name().to_string();
                if !self
                    .tables
                    .iter()
                    .any(|(s, t)| *s == schema && *t == table)
                {
                    debug!("Skipping binlog event for unreplicated table {schema}.{table}");
                    continue;
                }

                let mut images = Vec::new();
                for row in rows_event.rows(tme) {
                    let (before, after) = row?;
                    images.push((
                        before.as_ref().map(row_to_tuple),
                        after.as_ref().map(row_to_tuple),
                    ));
                }
                (schema, table, tme.columns_count() as usize, images)
            };

            let mut changes = Vec::new();
            let oid = self
                .announce_relation(&schema, &table, column_count, &mut changes)
                .await?;

            for (before, after) in images {
                match (kind, before, after) {
                    (RowsKind::Insert, _, Some(new_tuple)) => changes.push(Change::Insert {
                        relation_oid: oid,
                        new_tuple,
                    }),
                    (RowsKind::Update, Some(old_tuple), Some(new_tuple)) => {
                        changes.push(Change::Update {
                            relation_oid: oid,
                            old_kind: Some(TupleKind::Old),
                            old_tuple: Some(old_tuple),
                            new_tuple,
                        })
                    }
                    (RowsKind::Delete, Some(old_tuple), _) => changes.push(Change::Delete {
                        relation_oid: oid,
                        old_kind: TupleKind::Old,
                        old_tuple,
                    }),
                    _ => warn!("Rows event for {schema}.{table} with incomplete row images"),
                }
            }

            if !changes.is_empty() {
                return Ok(changes);
            }
        }
    }

    // Emit a Relation record when a table (or a new column shape of one)
    // shows up, resolving the column list from information_schema.
    async fn announce_relation(
        &mut self,
        schema: &str,
        table: &str,
        column_count: usize,
        changes: &mut Vec<Change>,
    ) -> BridgeResult<Oid> {
        let key = (schema.to_string(), table.to_string());
        if let Some(seen) = self.seen.get(&key)
            && seen.columns == column_count
        {
            return Ok(seen.oid);
        }

        let columns: Vec<(String, String)> = self
            .catalog_conn
            .exec(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_name = ? AND table_schema = ? \
                 ORDER BY ordinal_position",
                (table, schema),
            )
            .await?;
        if columns.len() != column_count {
            warn!(
                "Table map for {schema}.{table} announces {column_count} columns, \
                 information_schema reports {}",
                columns.len()
            );
        }

        let oid = match self.seen.get(&key) {
            Some(seen) => seen.oid,
            None => {
                let oid = self.next_oid;
                self.next_oid += 1;
                oid
            }
        };
        self.seen.insert(
            key,
            SeenTable {
                oid,
                columns: column_count,
            },
        );

        changes.push(Change::Relation(RelationMeta {
            oid,
            xid: 0,
            namespace: schema.to_string(),
            name: table.to_string(),
            replica_identity: b'f',
            columns: columns
                .into_iter()
                .map(|(name, _data_type)| ColumnMeta {
                    flags: 0,
                    name,
                    type_oid: 0,
                    type_modifier: -1,
                })
                .collect(),
        }));
        debug!("Announced relation {oid} for {schema}.{table}");
        Ok(oid)
    }
}

fn row_to_tuple(row: &BinlogRow) -> TupleData {
    let mut columns = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        columns.push(match row.as_ref(i) {
            // column absent from the row image
            None => ColumnValue::Unchanged,
            Some(BinlogValue::Value(Value::NULL)) => ColumnValue::Null,
            Some(BinlogValue::Value(value)) => ColumnValue::Text(value_text(value)),
            // partial JSON diffs are never materialized as literals
            Some(_) => ColumnValue::Unchanged,
        });
    }
    TupleData { columns }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(y, mo, d, 0, 0, 0, 0) => format!("{y:04}-{mo:02}-{d:02}"),
        Value::Date(y, mo, d, h, mi, s, us) => {
            format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}.{us:06}")
        }
        Value::Time(neg, d, h, mi, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + *d * 24;
            format!("{sign}{hours:02}:{mi:02}:{s:02}.{us:06}")
        }
        Value::NULL => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_values_render_as_text() {
        assert_eq!(value_text(&Value::Int(-7)), "-7");
        assert_eq!(value_text(&Value::UInt(42)), "42");
        assert_eq!(value_text(&Value::Bytes(b"alice".to_vec())), "alice");
        assert_eq!(value_text(&Value::Date(2024, 5, 1, 0, 0, 0, 0)), "2024-05-01");
        assert_eq!(
            value_text(&Value::Date(2024, 5, 1, 13, 30, 2, 500)),
            "2024-05-01 13:30:02.000500"
        );
        assert_eq!(value_text(&Value::Time(true, 1, 2, 3, 4, 5)), "-26:03:04.000005");
    }
}
