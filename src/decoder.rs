//! Logical-decoding frame codec
//!
//! Parses the binary change frames pulled from the replication slot
//! (begin/commit/relation/insert/update/delete/truncate) into [`Change`]
//! records, and encodes records back to frame bytes.
//!
//! Layout per frame: one tag byte, then fixed-layout big-endian integers and
//! NUL-terminated UTF-8 strings. Each row image is preceded by a tuple-type
//! marker (`N`, `K` or `O`); update decoding follows the markers rather than
//! assuming a fixed old/new split.

use crate::buffer::{ByteReader, ByteWriter};
use crate::errors::{BridgeError, BridgeResult};
use crate::types::*;
use tracing::debug;

// Tuple column categories
pub const COLUMN_NULL: u8 = b'n';
pub const COLUMN_UNCHANGED_TOAST: u8 = b'u';
pub const COLUMN_TEXT: u8 = b't';

/// Decoder for logical replication frames
pub struct FrameDecoder;

impl FrameDecoder {
    /// Decode one raw frame into a change record.
    ///
    /// Unknown tags, short buffers and unexpected tuple-type bytes are
    /// protocol errors carrying the tag and byte offset; the caller treats
    /// them as fatal for the current batch.
    pub fn decode(buffer: &[u8]) -> BridgeResult<Change> {
        if buffer.is_empty() {
            return Err(BridgeError::protocol("empty frame"));
        }

        let mut reader = ByteReader::new(buffer);
        let tag = reader.read_u8()?;
        debug!("Decoding frame tag: {}", tag as char);

        match tag {
            b'B' => Self::decode_begin(&mut reader),
            b'C' => Self::decode_commit(&mut reader),
            b'R' => Self::decode_relation(&mut reader),
            b'I' => Self::decode_insert(&mut reader),
            b'U' => Self::decode_update(&mut reader),
            b'D' => Self::decode_delete(&mut reader),
            b'T' => Self::decode_truncate(&mut reader),
            _ => Err(BridgeError::protocol_at("unknown message tag", tag, 0)),
        }
    }

    fn decode_begin(reader: &mut ByteReader<'_>) -> BridgeResult<Change> {
        let lsn = reader.read_u64()?;
        let commit_ts = reader.read_i64()?;
        let xid = reader.read_u32()?;

        Ok(Change::Begin {
            lsn,
            commit_ts,
            xid,
        })
    }

    fn decode_commit(reader: &mut ByteReader<'_>) -> BridgeResult<Change> {
        let flags = reader.read_u8()?;
        let commit_lsn = reader.read_u64()?;
        let end_lsn = reader.read_u64()?;
        let commit_ts = reader.read_i64()?;

        Ok(Change::Commit {
            flags,
            commit_lsn,
            end_lsn,
            commit_ts,
        })
    }

    fn decode_relation(reader: &mut ByteReader<'_>) -> BridgeResult<Change> {
        let oid = reader.read_u32()?;
        let xid = reader.read_u32()?;
        let namespace = reader.read_cstr()?;
        let name = reader.read_cstr()?;
        let replica_identity = reader.read_u8()?;
        let column_count = reader.read_u16()?;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let flags = reader.read_u8()?;
            let column_name = reader.read_cstr()?;
            let type_oid = reader.read_u32()?;
            let type_modifier = reader.read_i32()?;
            columns.push(ColumnMeta {
                flags,
                name: column_name,
                type_oid,
                type_modifier,
            });
        }

        Ok(Change::Relation(RelationMeta {
            oid,
            xid,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn decode_insert(reader: &mut ByteReader<'_>) -> BridgeResult<Change> {
        let relation_oid = reader.read_u32()?;

        let marker_at = reader.position();
        let marker = reader.read_u8()?;
        if marker != b'N' {
            return Err(BridgeError::protocol_at(
                "insert frame must carry a new tuple marker",
                marker,
                marker_at,
            ));
        }

        let new_tuple = Self::decode_tuple(reader)?;

        Ok(Change::Insert {
            relation_oid,
            new_tuple,
        })
    }

    fn decode_update(reader: &mut ByteReader<'_>) -> BridgeResult<Change> {
        let relation_oid = reader.read_u32()?;

        let marker_at = reader.position();
        let marker_byte = reader.read_u8()?;
        let marker = TupleKind::from_byte(marker_byte).ok_or_else(|| {
            BridgeError::protocol_at("invalid tuple marker in update frame", marker_byte, marker_at)
        })?;

        // The marker decides the layout: 'K'/'O' announce an old image that
        // is always followed by an 'N'-marked new image, 'N' means the new
        // image alone.
        let (old_kind, old_tuple) = match marker {
            TupleKind::Key | TupleKind::Old => {
                let old = Self::decode_tuple(reader)?;
                let new_marker_at = reader.position();
                let new_marker = reader.read_u8()?;
                if new_marker != b'N' {
                    return Err(BridgeError::protocol_at(
                        "expected new tuple marker after old tuple in update frame",
                        new_marker,
                        new_marker_at,
                    ));
                }
                (Some(marker), Some(old))
            }
            TupleKind::New => (None, None),
        };

        let new_tuple = Self::decode_tuple(reader)?;

        Ok(Change::Update {
            relation_oid,
            old_kind,
            old_tuple,
            new_tuple,
        })
    }

    fn decode_delete(reader: &mut ByteReader<'_>) -> BridgeResult<Change> {
        let relation_oid = reader.read_u32()?;

        let marker_at = reader.position();
        let marker_byte = reader.read_u8()?;
        let old_kind = match TupleKind::from_byte(marker_byte) {
            Some(k @ (TupleKind::Key | TupleKind::Old)) => k,
            _ => {
                return Err(BridgeError::protocol_at(
                    "delete frame must carry a key or old tuple marker",
                    marker_byte,
                    marker_at,
                ));
            }
        };

        let old_tuple = Self::decode_tuple(reader)?;

        Ok(Change::Delete {
            relation_oid,
            old_kind,
            old_tuple,
        })
    }

    fn decode_truncate(reader: &mut ByteReader<'_>) -> BridgeResult<Change> {
        let xid = reader.read_u32()?;
        let relation_count = reader.read_u32()?;
        let options = reader.read_u8()?;

        if !reader.has_bytes(relation_count as usize * 4) {
            return Err(BridgeError::protocol(format!(
                "truncate frame announces {} relations but the buffer is short at byte {}",
                relation_count,
                reader.position()
            )));
        }

        let mut relation_oids = Vec::with_capacity(relation_count as usize);
        for _ in 0..relation_count {
            relation_oids.push(reader.read_u32()?);
        }

        Ok(Change::Truncate {
            xid,
            relation_oids,
            options,
        })
    }

    fn decode_tuple(reader: &mut ByteReader<'_>) -> BridgeResult<TupleData> {
        let column_count = reader.read_u16()?;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let category_at = reader.position();
            let category = reader.read_u8()?;

            let value = match category {
                COLUMN_NULL => ColumnValue::Null,
                COLUMN_UNCHANGED_TOAST => {
                    debug!("Unchanged TOAST value in tuple");
                    ColumnValue::Unchanged
                }
                COLUMN_TEXT => {
                    let length = reader.read_u32()?;
                    let data_at = reader.position();
                    let bytes = reader.read_bytes(length as usize)?;
                    let text = std::str::from_utf8(bytes).map_err(|_| {
                        BridgeError::protocol_at(
                            "invalid UTF-8 in text column",
                            COLUMN_TEXT,
                            data_at,
                        )
                    })?;
                    ColumnValue::Text(text.to_owned())
                }
                _ => {
                    return Err(BridgeError::protocol_at(
                        "unknown tuple column category",
                        category,
                        category_at,
                    ));
                }
            };

            columns.push(value);
        }

        Ok(TupleData { columns })
    }
}

/// Encode a change record back to its frame bytes.
///
/// The inverse of [`FrameDecoder::decode`]: for every well-formed frame `F`,
/// `encode_change(&decode(F)?) == F`.
pub fn encode_change(change: &Change) -> Vec<u8> {
    let mut w = ByteWriter::new();

    match change {
        Change::Begin {
            lsn,
            commit_ts,
            xid,
        } => {
            w.write_u8(b'B');
            w.write_u64(*lsn);
            w.write_i64(*commit_ts);
            w.write_u32(*xid);
        }
        Change::Commit {
            flags,
            commit_lsn,
            end_lsn,
            commit_ts,
        } => {
            w.write_u8(b'C');
            w.write_u8(*flags);
            w.write_u64(*commit_lsn);
            w.write_u64(*end_lsn);
            w.write_i64(*commit_ts);
        }
        Change::Relation(rel) => {
            w.write_u8(b'R');
            w.write_u32(rel.oid);
            w.write_u32(rel.xid);
            w.write_cstr(&rel.namespace);
            w.write_cstr(&rel.name);
            w.write_u8(rel.replica_identity);
            w.write_u16(rel.columns.len() as u16);
            for col in &rel.columns {
                w.write_u8(col.flags);
                w.write_cstr(&col.name);
                w.write_u32(col.type_oid);
                w.write_i32(col.type_modifier);
            }
        }
        Change::Insert {
            relation_oid,
            new_tuple,
        } => {
            w.write_u8(b'I');
            w.write_u32(*relation_oid);
            w.write_u8(b'N');
            encode_tuple(&mut w, new_tuple);
        }
        Change::Update {
            relation_oid,
            old_kind,
            old_tuple,
            new_tuple,
        } => {
            w.write_u8(b'U');
            w.write_u32(*relation_oid);
            if let (Some(kind), Some(old)) = (old_kind, old_tuple) {
                w.write_u8(kind.as_byte());
                encode_tuple(&mut w, old);
            }
            w.write_u8(b'N');
            encode_tuple(&mut w, new_tuple);
        }
        Change::Delete {
            relation_oid,
            old_kind,
            old_tuple,
        } => {
            w.write_u8(b'D');
            w.write_u32(*relation_oid);
            w.write_u8(old_kind.as_byte());
            encode_tuple(&mut w, old_tuple);
        }
        Change::Truncate {
            xid,
            relation_oids,
            options,
        } => {
            w.write_u8(b'T');
            w.write_u32(*xid);
            w.write_u32(relation_oids.len() as u32);
            w.write_u8(*options);
            for oid in relation_oids {
                w.write_u32(*oid);
            }
        }
    }

    w.into_inner()
}

fn encode_tuple(w: &mut ByteWriter, tuple: &TupleData) {
    w.write_u16(tuple.columns.len() as u16);
    for value in &tuple.columns {
        match value {
            ColumnValue::Null => w.write_u8(COLUMN_NULL),
            ColumnValue::Unchanged => w.write_u8(COLUMN_UNCHANGED_TOAST),
            ColumnValue::Text(text) => {
                w.write_u8(COLUMN_TEXT);
                w.write_u32(text.len() as u32);
                w.write_bytes(text.as_bytes());
            }
        }
    }
}
