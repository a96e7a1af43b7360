//! Worker supervision for replication pairs
//!
//! Each activated pair gets two cooperatively scheduled workers: a DML
//! worker driving the read → decode → render → apply pipeline, and a DDL
//! worker running the schema reconciler on its own cadence. Workers own
//! their database handles outright; nothing is shared between them. An
//! error inside one iteration is logged and the loop continues — dropping
//! and rebuilding its handles when the connection is the problem — so the
//! loops only exit when the supervisor signals stop.

use crate::apply::{Applier, DbHandle, connect_handle};
use crate::catalog::{CatalogCache, MySqlCatalogProbe, PgCatalogProbe, SourceCatalog};
use crate::config::BridgeConfig;
use crate::decoder::FrameDecoder;
use crate::errors::{BridgeError, BridgeResult};
use crate::reconcile::reconcile_table;
use crate::render::Renderer;
use crate::source::{BinlogReader, SlotReader};
use crate::timestamp::format_pg_timestamp;
use crate::types::{CatalogEntry, Change, Dialect, Oid, XLogRecPtr};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a replication pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairState {
    Running,
    Stopped,
}

/// Status snapshot for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PairStatus {
    pub state: PairState,
    /// Highest LSN observed on the source stream (zero for binlog pairs)
    pub last_lsn: XLogRecPtr,
}

struct PairHandle {
    status: Arc<Mutex<PairStatus>>,
    stop: Arc<AtomicBool>,
    dml: JoinHandle<()>,
    ddl: JoinHandle<()>,
}

/// Launches and tracks replication pairs.
#[derive(Default)]
pub struct Supervisor {
    pairs: Mutex<HashMap<u64, PairHandle>>,
    next_pair_id: AtomicU64,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate one replication pair. Connects every handle the two workers
    /// need, then schedules them and returns the pair id; replication runs
    /// in the background from that point. Configuration and connection
    /// failures surface here and no worker starts.
    pub async fn start(&self, config: BridgeConfig) -> BridgeResult<u64> {
        let renderer = Renderer::new(config.target_dialect);
        let status = Arc::new(Mutex::new(PairStatus {
            state: PairState::Running,
            last_lsn: 0,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let context = build_dml_context(&config, renderer, status.clone()).await?;
        let dml = match config.source_dialect {
            Dialect::Postgresql => {
                let reader = SlotReader::connect(
                    &config.source_url,
                    &config.slot_name,
                    &config.publication_name,
                )
                .await?;
                tokio::spawn(run_slot_dml(reader, context, config.clone(), stop.clone()))
            }
            Dialect::Mysql => {
                let reader = BinlogReader::connect(
                    &config.source_url,
                    config.server_id,
                    vec![config.binlog_filter()?],
                )
                .await?;
                tokio::spawn(run_binlog_dml(reader, context, config.clone(), stop.clone()))
            }
            Dialect::Redshift => {
                return Err(BridgeError::config("redshift is supported as a target only"));
            }
        };

        let ddl_source = connect_handle(config.source_dialect, &config.source_url).await?;
        let ddl_target = connect_handle(config.target_dialect, &config.target_url).await?;
        let ddl = tokio::spawn(run_ddl(
            ddl_source,
            ddl_target,
            renderer,
            config.clone(),
            stop.clone(),
        ));

        let pair_id = self.next_pair_id.fetch_add(1, Ordering::SeqCst);
        self.pairs.lock().unwrap().insert(
            pair_id,
            PairHandle {
                status,
                stop,
                dml,
                ddl,
            },
        );
        info!(
            "Replication pair {pair_id} scheduled: {} -> {} for table {}",
            config.source_dialect, config.target_dialect, config.table_source
        );
        Ok(pair_id)
    }

    /// Status snapshot for a pair, if it exists.
    pub fn status(&self, pair_id: u64) -> Option<PairStatus> {
        self.pairs
            .lock()
            .unwrap()
            .get(&pair_id)
            .map(|handle| *handle.status.lock().unwrap())
    }

    /// Signal a pair to stop and wait for both workers to wind down between
    /// iterations.
    pub async fn stop(&self, pair_id: u64) {
        let Some(handle) = self.pairs.lock().unwrap().remove(&pair_id) else {
            return;
        };
        handle.stop.store(true, Ordering::SeqCst);
        let _ = handle.dml.await;
        let _ = handle.ddl.await;
        handle.status.lock().unwrap().state = PairState::Stopped;
        info!("Replication pair {pair_id} stopped");
    }

    /// Stop every active pair.
    pub async fn stop_all(&self) {
        let ids: Vec<u64> = self.pairs.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }
}

/// Everything the DML pipeline needs past the reader: the per-worker
/// catalog cache, the source catalog probe, the renderer and the target
/// applier.
struct DmlContext {
    cache: CatalogCache,
    probe: Box<dyn SourceCatalog>,
    applier: Applier,
    renderer: Renderer,
    table_source: String,
    table_dest: String,
    status: Arc<Mutex<PairStatus>>,
}

async fn build_dml_context(
    config: &BridgeConfig,
    renderer: Renderer,
    status: Arc<Mutex<PairStatus>>,
) -> BridgeResult<DmlContext> {
    let applier = Applier::new(connect_handle(config.target_dialect, &config.target_url).await?);
    let probe: Box<dyn SourceCatalog> = match config.source_dialect {
        Dialect::Postgresql => Box::new(PgCatalogProbe::connect(&config.source_url).await?),
        Dialect::Mysql => Box::new(MySqlCatalogProbe::connect(&config.source_url).await?),
        Dialect::Redshift => {
            return Err(BridgeError::config("redshift is supported as a target only"));
        }
    };
    Ok(DmlContext {
        cache: CatalogCache::new(),
        probe,
        applier,
        renderer,
        table_source: config.source_table_name().to_string(),
        table_dest: config.dest_table_name().to_string(),
        status,
    })
}

impl DmlContext {
    fn observe_lsn(&self, lsn: XLogRecPtr) {
        if lsn > 0 {
            let mut status = self.status.lock().unwrap();
            status.last_lsn = status.last_lsn.max(lsn);
        }
    }

    /// Catalog entry for a DML record, resolving declared types from the
    /// source catalog on first need. `Ok(None)` means the relation is not
    /// the one this pair replicates.
    async fn entry_for(&mut self, oid: Oid) -> BridgeResult<Option<CatalogEntry>> {
        let (matches, table) = match self.cache.relation(oid) {
            None => {
                return Err(BridgeError::catalog(format!(
                    "DML record for OID {oid} without a preceding Relation message"
                )));
            }
            Some(rel) => (rel.name == self.table_source, rel.name.clone()),
        };
        if !matches {
            debug!("Skipping change for unreplicated table {table}");
            return Ok(None);
        }

        if !self.cache.has_declared(oid) {
            let types = self.probe.column_types(&table).await?;
            if types.is_empty() {
                return Err(BridgeError::catalog(format!(
                    "source catalog knows no columns for table {table}"
                )));
            }
            self.cache.set_declared(oid, types);
        }
        self.cache.entry(oid).map(Some)
    }

    async fn process(&mut self, change: Change) -> BridgeResult<()> {
        match change {
            Change::Begin {
                lsn,
                commit_ts,
                xid,
            } => {
                debug!(
                    "Transaction {xid} begins at lsn {lsn}, committed {}",
                    format_pg_timestamp(commit_ts)
                );
            }
            Change::Commit {
                end_lsn, commit_ts, ..
            } => {
                debug!(
                    "Transaction commit, end lsn {end_lsn} at {}",
                    format_pg_timestamp(commit_ts)
                );
            }
            Change::Relation(rel) => {
                info!(
                    "Relation {}: {}.{} with {} column(s)",
                    rel.oid,
                    rel.namespace,
                    rel.name,
                    rel.columns.len()
                );
                self.cache.upsert_relation(rel);
            }
            Change::Insert {
                relation_oid,
                new_tuple,
            } => {
                if let Some(entry) = self.entry_for(relation_oid).await? {
                    let sql = self.renderer.insert(&self.table_dest, &entry, &new_tuple)?;
                    self.applier.apply(&sql).await?;
                }
            }
            Change::Update {
                relation_oid,
                old_kind,
                old_tuple,
                new_tuple,
            } => {
                if let Some(entry) = self.entry_for(relation_oid).await? {
                    match (old_kind, old_tuple) {
                        (Some(kind), Some(old)) => {
                            match self.renderer.update(
                                &self.table_dest,
                                &entry,
                                kind,
                                &old,
                                &new_tuple,
                            )? {
                                Some(sql) => {
                                    self.applier.apply(&sql).await?;
                                }
                                None => warn!(
                                    "Update on {} yields no SET or no WHERE clause, skipping",
                                    entry.table
                                ),
                            }
                        }
                        _ => warn!(
                            "Update on {} carries no old image to match rows by, skipping",
                            entry.table
                        ),
                    }
                }
            }
            Change::Delete {
                relation_oid,
                old_kind,
                old_tuple,
            } => {
                if let Some(entry) = self.entry_for(relation_oid).await? {
                    match self
                        .renderer
                        .delete(&self.table_dest, &entry, old_kind, &old_tuple)?
                    {
                        Some(sql) => {
                            self.applier.apply(&sql).await?;
                        }
                        None => warn!(
                            "Delete on {} yields no usable predicate, skipping",
                            entry.table
                        ),
                    }
                }
            }
            Change::Truncate { relation_oids, .. } => {
                let truncates_pair_table = relation_oids.iter().any(|oid| {
                    self.cache
                        .relation(*oid)
                        .is_some_and(|rel| rel.name == self.table_source)
                });
                if truncates_pair_table {
                    let sql = self.renderer.truncate(&self.table_dest);
                    self.applier.apply(&sql).await?;
                }
            }
        }
        Ok(())
    }

    /// Per-event error containment: catalog problems skip the event, apply
    /// problems roll back one statement, anything else bubbles up to the
    /// worker loop.
    async fn process_contained(&mut self, change: Change) -> BridgeResult<()> {
        match self.process(change).await {
            Ok(()) => Ok(()),
            Err(e @ BridgeError::Catalog { .. }) => {
                warn!("Skipping event: {e}");
                Ok(())
            }
            Err(e @ BridgeError::Apply { .. }) => {
                error!("Statement rejected by target, continuing batch: {e}");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}

async fn run_slot_dml(
    mut reader: SlotReader,
    mut ctx: DmlContext,
    config: BridgeConfig,
    stop: Arc<AtomicBool>,
) {
    let interval = config.poll_interval();
    info!("DML worker started (slot source)");
    'worker: while !stop.load(Ordering::SeqCst) {
        match slot_dml_iteration(&reader, &mut ctx).await {
            Ok(0) => sleep(interval).await,
            Ok(n) => debug!("Processed {n} change record(s)"),
            Err(e) => {
                // connection-level failure: drop the handles and rebuild
                error!("Replication iteration failed: {e}; reconnecting");
                loop {
                    sleep(interval).await;
                    if stop.load(Ordering::SeqCst) {
                        break 'worker;
                    }
                    let rebuilt = async {
                        let reader = SlotReader::connect(
                            &config.source_url,
                            &config.slot_name,
                            &config.publication_name,
                        )
                        .await?;
                        let ctx =
                            build_dml_context(&config, ctx.renderer, ctx.status.clone()).await?;
                        Ok::<_, BridgeError>((reader, ctx))
                    }
                    .await;
                    match rebuilt {
                        Ok((new_reader, new_ctx)) => {
                            reader = new_reader;
                            ctx = new_ctx;
                            info!("DML pipeline reconnected");
                            break;
                        }
                        Err(e) => error!("Reconnect failed: {e}"),
                    }
                }
            }
        }
    }
    info!("DML worker stopped");
}

async fn slot_dml_iteration(reader: &SlotReader, ctx: &mut DmlContext) -> BridgeResult<usize> {
    let batch = reader.pending_changes().await?;
    if batch.is_empty() {
        return Ok(0);
    }

    let mut processed = 0;
    for raw in batch {
        ctx.observe_lsn(raw.lsn);
        let change = match FrameDecoder::decode(&raw.data) {
            Ok(change) => change,
            Err(e) => {
                // protocol errors poison the rest of the batch
                error!("Protocol error at lsn {}: {e}; skipping rest of batch", raw.lsn);
                break;
            }
        };
        debug!("Decoded {} at lsn {}", change.kind(), raw.lsn);
        if tracing::enabled!(tracing::Level::TRACE)
            && let Ok(json) = serde_json::to_string(&change)
        {
            tracing::trace!("Change record: {json}");
        }
        ctx.process_contained(change).await?;
        processed += 1;
    }
    Ok(processed)
}

async fn run_binlog_dml(
    mut reader: BinlogReader,
    mut ctx: DmlContext,
    config: BridgeConfig,
    stop: Arc<AtomicBool>,
) {
    let interval = config.poll_interval();
    info!("DML worker started (binlog source)");
    'worker: while !stop.load(Ordering::SeqCst) {
        // bound each wait so the stop flag is rechecked at the poll cadence
        let outcome = match tokio::time::timeout(interval, reader.next_changes()).await {
            Err(_) => continue,
            Ok(outcome) => outcome,
        };

        let failed = match outcome {
            Err(e) => {
                error!("Binlog read failed: {e}");
                true
            }
            Ok(changes) => {
                let mut failed = false;
                for change in changes {
                    if let Err(e) = ctx.process_contained(change).await {
                        error!("Replication iteration failed: {e}");
                        failed = true;
                        break;
                    }
                }
                failed
            }
        };

        if failed {
            // rebuild the subscription and the target handles
            loop {
                sleep(interval).await;
                if stop.load(Ordering::SeqCst) {
                    break 'worker;
                }
                let rebuilt = async {
                    let filter = config.binlog_filter()?;
                    let reader =
                        BinlogReader::connect(&config.source_url, config.server_id, vec![filter])
                            .await?;
                    let ctx = build_dml_context(&config, ctx.renderer, ctx.status.clone()).await?;
                    Ok::<_, BridgeError>((reader, ctx))
                }
                .await;
                match rebuilt {
                    Ok((new_reader, new_ctx)) => {
                        reader = new_reader;
                        ctx = new_ctx;
                        info!("DML pipeline reconnected");
                        break;
                    }
                    Err(e) => error!("Reconnect failed: {e}"),
                }
            }
        }
    }
    info!("DML worker stopped");
}

async fn run_ddl(
    mut source: Box<dyn DbHandle>,
    mut target: Box<dyn DbHandle>,
    renderer: Renderer,
    config: BridgeConfig,
    stop: Arc<AtomicBool>,
) {
    let interval = config.poll_interval();
    let table_source = config.source_table_name().to_string();
    let table_dest = config.dest_table_name().to_string();
    info!("DDL worker started for table {table_source}");
    while !stop.load(Ordering::SeqCst) {
        match reconcile_table(
            source.as_mut(),
            target.as_mut(),
            &renderer,
            &table_source,
            &table_dest,
        )
        .await
        {
            Ok(0) => {}
            Ok(applied) => info!("Reconciled {applied} schema change(s) on {table_dest}"),
            Err(e) => {
                error!("Reconciliation pass failed: {e}");
                // fresh handles next pass in case a connection died
                match connect_handle(config.source_dialect, &config.source_url).await {
                    Ok(handle) => source = handle,
                    Err(e) => error!("Reconnecting reconciler source failed: {e}"),
                }
                match connect_handle(config.target_dialect, &config.target_url).await {
                    Ok(handle) => target = handle,
                    Err(e) => error!("Reconnecting reconciler target failed: {e}"),
                }
            }
        }
        sleep(interval).await;
    }
    info!("DDL worker stopped");
}
