//! Replication-slot frame reader for PostgreSQL sources
//!
//! Pulls pending logical-decoding frames out of a replication slot with
//! `pg_logical_slot_get_binary_changes`, one SQL round trip per batch. The
//! call consumes what it returns, so the slot itself is the cursor; a failed
//! query consumes nothing and the next poll resumes where the last one left
//! off.

use crate::errors::{BridgeError, BridgeResult};
use crate::types::RawChange;
use tokio_postgres::NoTls;
use tokio_postgres::types::PgLsn;
use tracing::{debug, error, info};

/// Reader over one replication slot / publication pair.
pub struct SlotReader {
    client: tokio_postgres::Client,
    slot_name: String,
    publication_name: String,
}

impl SlotReader {
    /// Connect to the source and verify the replication prerequisites.
    /// A missing slot or publication is fatal and surfaces to the
    /// supervisor; nothing is created implicitly.
    pub async fn connect(
        url: &str,
        slot_name: &str,
        publication_name: &str,
    ) -> BridgeResult<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| BridgeError::connection(format!("connecting to source: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Source connection error: {e}");
            }
        });
        info!("Connected to source database");

        let reader = Self {
            client,
            slot_name: slot_name.to_string(),
            publication_name: publication_name.to_string(),
        };
        reader.check_replication_slot().await?;
        reader.check_publication().await?;
        Ok(reader)
    }

    async fn check_replication_slot(&self) -> BridgeResult<()> {
        let rows = self
            .client
            .query(
                "SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot_name],
            )
            .await?;
        if rows.is_empty() {
            return Err(BridgeError::connection(format!(
                "Replication slot '{}' does not exist. Create it with: \
                 SELECT pg_create_logical_replication_slot('{}', 'pgoutput');",
                self.slot_name, self.slot_name
            )));
        }
        Ok(())
    }

    async fn check_publication(&self) -> BridgeResult<()> {
        let rows = self
            .client
            .query(
                "SELECT pubname FROM pg_publication WHERE pubname = $1",
                &[&self.publication_name],
            )
            .await?;
        if rows.is_empty() {
            return Err(BridgeError::connection(format!(
                "Publication '{}' does not exist. Create it with: \
                 CREATE PUBLICATION \"{}\" FOR TABLE <table>;",
                self.publication_name, self.publication_name
            )));
        }
        Ok(())
    }

    /// Fetch everything currently pending on the slot. Returns an empty
    /// batch when the source has nothing; the caller decides the poll
    /// cadence.
    pub async fn pending_changes(&self) -> BridgeResult<Vec<RawChange>> {
        let sql = format!(
            "SELECT lsn, xid::text, data FROM pg_logical_slot_get_binary_changes('{}', NULL, NULL, 'proto_version', '1', 'publication_names', '{}')",
            self.slot_name, self.publication_name
        );

        let rows = self.client.query(&sql, &[]).await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: PgLsn = row.get(0);
            let xid: String = row.get(1);
            let data: Vec<u8> = row.get(2);
            let xid = xid.parse::<u32>().map_err(|_| {
                BridgeError::protocol(format!("slot returned non-numeric xid '{xid}'"))
            })?;
            changes.push(RawChange {
                lsn: u64::from(lsn),
                xid,
                data,
            });
        }

        if !changes.is_empty() {
            debug!(
                "Fetched {} pending change(s) from slot {}",
                changes.len(),
                self.slot_name
            );
        }
        Ok(changes)
    }
}
