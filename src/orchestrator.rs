//! Per-Table Orchestrator (C5) — the replication state machine for one
//! table (spec §4.1).
//!
//! Grounded on `original_source/src/sync/PostgreSQLToPostgres.cpp`'s
//! top-level `processTableParallel` decision procedure (Steps 0–6) and
//! on `other_examples`' `serenorg-database-replicator` xmin-reconciler
//! (`0e9a70b9_...`) for the delete-reconciliation merge-join shape
//! (§4.1.2).

use std::sync::Arc;
use std::time::Instant;

use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

use crate::adapters::{self, ColumnInfo, SourceAdapter};
use crate::catalog::{CatalogEntry, CatalogStore, PkStrategy, Status};
use crate::config::Config;
use crate::error::SyncError;
use crate::normalize::{normalize, NormalizedValue};
use crate::pipeline::{self, DataChunk, Inserter, Preparer, PreparedBatch};
use crate::writer::{BulkWriter, Row};

/// Rows sampled per consistency-check batch (spec §4.1.1).
const CONSISTENCY_BATCH_SIZE: usize = 1000;
/// PKs checked per single existence query during delete reconciliation
/// (spec §4.1.2 `checkBatchSize`).
const CHECK_BATCH_SIZE: usize = 500;
/// Rows scanned per cycle during update reconciliation (spec §4.1.3).
const MAX_UPDATE_SCAN: usize = 10_000;
/// Hard cap on transfer-loop iterations, guarding against cursor
/// non-progress bugs (spec §4.1 Step 5).
const MAX_CHUNK_ITERATIONS: usize = 10_000;

pub struct Orchestrator<'a> {
    pub catalog: &'a CatalogStore,
    pub lake: &'a Client,
    pub config: &'a Config,
}

/// Outcome of one full cycle for a table, used by the scheduler to update
/// retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NoData,
    ListeningChanges,
    FullLoadNextCycle,
    Error,
}

impl<'a> Orchestrator<'a> {
    /// Run exactly one cycle for `entry` (spec §4.1). Opens a fresh
    /// source connection for the duration of the call and releases it on
    /// every exit path.
    pub async fn run_cycle(&self, entry: &CatalogEntry) -> Result<CycleOutcome, SyncError> {
        let started = Instant::now();
        let source = adapters::open_adapter(entry.db_engine, &entry.connection_string).await?;

        let result = self.run_cycle_inner(entry, source.as_ref(), started).await;

        if let Err(ref e) = result {
            warn!(
                schema = entry.schema_name,
                table = entry.table_name,
                error = %e,
                "cycle ended in error"
            );
            self.catalog
                .update_status(&entry.schema_name, &entry.table_name, entry.db_engine, Status::Error)
                .await?;
        }

        result
    }

    async fn run_cycle_inner(
        &self,
        entry: &CatalogEntry,
        source: &dyn SourceAdapter,
        started: Instant,
    ) -> Result<CycleOutcome, SyncError> {
        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();

        // Step 0 — Count.
        let mut source_count = source.count(schema, table).await.unwrap_or(0);
        let mut target_count = self.count_lake(schema, table).await.unwrap_or(0);
        info!(schema, table, source_count, target_count, "counted rows");

        // Step 1 — Truncate on FULL_LOAD / RESET.
        let forced_full_load = matches!(entry.status, Status::FullLoad | Status::Reset);
        if forced_full_load {
            self.truncate_lake(schema, table).await?;
            self.catalog
                .reset_cursor(schema, table, entry.db_engine)
                .await?;
            target_count = 0;
        }

        // Step 2 — Empty-source shortcuts.
        if source_count == 0 && target_count == 0 {
            self.catalog
                .update_status(schema, table, entry.db_engine, Status::NoData)
                .await?;
            return Ok(CycleOutcome::NoData);
        }
        if source_count == 0 && target_count > 0 {
            self.catalog
                .update_status(schema, table, entry.db_engine, Status::ListeningChanges)
                .await?;
            return Ok(CycleOutcome::ListeningChanges);
        }

        // Step 3 — Equal-count branch.
        if source_count == target_count && !forced_full_load {
            let consistent = self.consistency_check(entry, source).await?;
            if consistent {
                if entry.last_sync_column.is_some() {
                    self.update_reconciliation(entry, source).await?;
                }
                self.catalog
                    .update_status(schema, table, entry.db_engine, Status::ListeningChanges)
                    .await?;
                return Ok(CycleOutcome::ListeningChanges);
            }
            // Mismatch despite equal counts: fall through to transfer.
        } else if source_count == target_count {
            self.catalog
                .update_status(schema, table, entry.db_engine, Status::ListeningChanges)
                .await?;
            return Ok(CycleOutcome::ListeningChanges);
        }

        // Step 4 — Deletes detected.
        if source_count < target_count {
            match entry.pk_strategy {
                PkStrategy::Pk => {
                    self.reconcile_deletes(entry, source).await?;
                    target_count = self.count_lake(schema, table).await.unwrap_or(0);
                    if target_count <= source_count {
                        self.catalog
                            .update_status(schema, table, entry.db_engine, Status::ListeningChanges)
                            .await?;
                        return Ok(CycleOutcome::ListeningChanges);
                    }
                }
                PkStrategy::Offset => {
                    self.truncate_lake(schema, table).await?;
                    self.catalog
                        .update_status(schema, table, entry.db_engine, Status::FullLoad)
                        .await?;
                    return Ok(CycleOutcome::FullLoadNextCycle);
                }
                PkStrategy::Cdc => {
                    // CDC tables don't use the count-driven loop at all;
                    // they're driven by the CDC consumer (C8) instead.
                    self.catalog
                        .update_status(schema, table, entry.db_engine, Status::ListeningChanges)
                        .await?;
                    return Ok(CycleOutcome::ListeningChanges);
                }
            }
        }

        // Step 5 — Transfer loop.
        let outcome = self.transfer_loop(entry, source, started, &mut source_count, &mut target_count).await?;
        Ok(outcome)
    }

    async fn count_lake(&self, schema: &str, table: &str) -> Result<u64, SyncError> {
        let sql = format!("SELECT COUNT(*) FROM {}.{}", quote_ident(schema), quote_ident(table));
        let row = self
            .lake
            .query_one(&sql, &[])
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn truncate_lake(&self, schema: &str, table: &str) -> Result<(), SyncError> {
        let sql = format!(
            "TRUNCATE TABLE {}.{} CASCADE",
            quote_ident(schema),
            quote_ident(table)
        );
        self.lake
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))
    }

    /// Step 5 — chunked transfer loop. Dispatches to the pipelined path
    /// (C7) for wide PK-strategy tables (spec §4.5), the serial loop
    /// otherwise (§9 Open Question decision on the selection threshold,
    /// see DESIGN.md).
    async fn transfer_loop(
        &self,
        entry: &CatalogEntry,
        source: &dyn SourceAdapter,
        started: Instant,
        source_count: &mut u64,
        target_count: &mut u64,
    ) -> Result<CycleOutcome, SyncError> {
        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();
        let columns = source.discover_schema(schema, table).await?;
        let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

        let wide = entry.pk_strategy == PkStrategy::Pk
            && entry.has_pk
            && column_names.len() >= self.config.wide_table_column_threshold;

        if wide {
            self.transfer_loop_pipelined(entry, source, &columns, &column_names, target_count)
                .await
        } else {
            self.transfer_loop_serial(entry, source, &columns, &column_names, started, source_count, target_count)
                .await
        }
    }

    /// Serial variant of Step 5: one fetch-then-upsert iteration at a
    /// time, via the uniform `SourceAdapter::fetch_chunk` primitive so
    /// every engine — including MongoDB, which has no SQL to build — goes
    /// through the same path (spec §4.2).
    async fn transfer_loop_serial(
        &self,
        entry: &CatalogEntry,
        source: &dyn SourceAdapter,
        columns: &[ColumnInfo],
        column_names: &[String],
        started: Instant,
        source_count: &mut u64,
        target_count: &mut u64,
    ) -> Result<CycleOutcome, SyncError> {
        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();
        let chunk_size = self.config.chunk_size;
        let writer = BulkWriter::new(self.lake, self.config);

        let mut cursor = entry.last_processed_pk.clone();
        let mut iterations = 0usize;
        let mut any_progress = false;
        let mut last_error: Option<SyncError> = None;

        loop {
            if started.elapsed() > self.config.max_processing_duration() {
                warn!(schema, table, "transfer loop exceeded max processing time");
                last_error = Some(SyncError::CursorStall("max processing time exceeded".into()));
                break;
            }
            if iterations >= MAX_CHUNK_ITERATIONS {
                warn!(schema, table, "transfer loop exceeded max chunk iterations");
                last_error = Some(SyncError::CursorStall("max chunk iterations exceeded".into()));
                break;
            }
            iterations += 1;

            let raw_rows = match source
                .fetch_chunk(schema, table, column_names, entry.pk_strategy, &entry.pk_columns, cursor.as_deref(), chunk_size)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            };
            let returned = raw_rows.len();

            if returned > 0 {
                let normalized_rows: Vec<Row> = raw_rows
                    .into_iter()
                    .map(|raw| normalize_row(&raw, columns))
                    .collect();

                let pk_columns = if entry.has_pk { entry.pk_columns.clone() } else { vec![] };
                match writer
                    .bulk_upsert(schema, table, column_names, &pk_columns, normalized_rows.clone())
                    .await
                {
                    Ok(applied) => {
                        *target_count += applied;
                        any_progress = true;
                        if entry.pk_strategy == PkStrategy::Pk {
                            if let Some(tail) = normalized_rows.last() {
                                cursor = Some(pk_cursor_value(tail, column_names, &entry.pk_columns));
                            }
                        }
                    }
                    Err(e) => {
                        last_error = Some(e);
                        break;
                    }
                }
            }

            if returned < chunk_size || *target_count >= *source_count {
                break;
            }
        }

        if any_progress || last_error.is_none() {
            self.catalog
                .finish_cycle(
                    schema,
                    table,
                    entry.db_engine,
                    Status::ListeningChanges,
                    cursor.as_deref(),
                    &serde_json::json!({}),
                )
                .await?;
            Ok(CycleOutcome::ListeningChanges)
        } else {
            Err(last_error.unwrap_or(SyncError::InternalError("transfer loop aborted with no error set".into())))
        }
    }

    /// Pipelined variant of Step 5 (C7, spec §4.5) for wide tables:
    /// gathers the full chunk stream up front via `fetch_chunk` (same
    /// fetch primitive as the serial loop), then hands it to
    /// `pipeline::run_pipeline` for concurrent normalize/upsert. Chunk
    /// numbers are 1-based so `0` unambiguously means "nothing applied
    /// yet" (matches `pipeline::run_pipeline`'s own convention).
    async fn transfer_loop_pipelined(
        &self,
        entry: &CatalogEntry,
        source: &dyn SourceAdapter,
        columns: &[ColumnInfo],
        column_names: &[String],
        target_count: &mut u64,
    ) -> Result<CycleOutcome, SyncError> {
        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();
        let chunk_size = self.config.chunk_size;

        let mut chunks = Vec::new();
        let mut chunk_end_cursors: Vec<(u64, String)> = Vec::new();
        let mut cursor = entry.last_processed_pk.clone();
        let mut chunk_no = 1u64;

        loop {
            let raw_rows = source
                .fetch_chunk(schema, table, column_names, entry.pk_strategy, &entry.pk_columns, cursor.as_deref(), chunk_size)
                .await?;
            let returned = raw_rows.len();
            let is_last = returned < chunk_size;

            if returned > 0 {
                if let Some(last_raw) = raw_rows.last() {
                    cursor = Some(pk_cursor_value(last_raw, column_names, &entry.pk_columns));
                    chunk_end_cursors.push((chunk_no, cursor.clone().unwrap()));
                }
                chunks.push(DataChunk {
                    chunk_no,
                    schema: schema.to_string(),
                    table: table.to_string(),
                    rows: raw_rows,
                    is_last,
                });
                chunk_no += 1;
            }

            if is_last || chunks.len() >= MAX_CHUNK_ITERATIONS {
                if chunks.len() >= MAX_CHUNK_ITERATIONS {
                    warn!(schema, table, "pipelined transfer exceeded max chunk iterations");
                }
                break;
            }
        }

        if chunks.is_empty() {
            self.catalog
                .finish_cycle(schema, table, entry.db_engine, Status::ListeningChanges, cursor.as_deref(), &serde_json::json!({}))
                .await?;
            return Ok(CycleOutcome::ListeningChanges);
        }

        let (lake_client, connection) = tokio_postgres::connect(&self.config.lake_dsn, NoTls)
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "pipelined transfer lake connection terminated");
            }
        });
        let lake_client = Arc::new(lake_client);
        let config = Arc::new(self.config.clone());

        let columns_owned: Vec<ColumnInfo> = columns.to_vec();
        let preparer: Preparer = Box::new(move |chunk: DataChunk| {
            let rows: Vec<Row> = chunk.rows.iter().map(|raw| normalize_row(raw, &columns_owned)).collect();
            PreparedBatch {
                chunk_no: chunk.chunk_no,
                schema: chunk.schema,
                table: chunk.table,
                rows,
                is_last: chunk.is_last,
            }
        });

        let pk_columns = if entry.has_pk { entry.pk_columns.clone() } else { vec![] };
        let column_names_owned = column_names.to_vec();
        let inserter: Inserter = Box::new(move |batch: PreparedBatch| {
            let lake_client = Arc::clone(&lake_client);
            let config = Arc::clone(&config);
            let column_names = column_names_owned.clone();
            let pk_columns = pk_columns.clone();
            Box::pin(async move {
                let writer = BulkWriter::new(&lake_client, &config);
                writer.bulk_upsert(&batch.schema, &batch.table, &column_names, &pk_columns, batch.rows).await
            })
        });

        let max_applied = pipeline::run_pipeline(self.config, chunks, preparer, inserter).await?;

        if max_applied == 0 {
            return Err(SyncError::CursorStall("pipeline made no progress on wide-table transfer".into()));
        }
        if (max_applied as usize) < chunk_end_cursors.len() {
            warn!(schema, table, applied = max_applied, total = chunk_end_cursors.len(), "pipeline stopped short of the full chunk stream");
        }

        let new_cursor = chunk_end_cursors
            .into_iter()
            .find(|(no, _)| *no == max_applied)
            .map(|(_, c)| c);

        *target_count = self.count_lake(schema, table).await.unwrap_or(*target_count);
        self.catalog
            .finish_cycle(schema, table, entry.db_engine, Status::ListeningChanges, new_cursor.as_deref(), &serde_json::json!({}))
            .await?;
        Ok(CycleOutcome::ListeningChanges)
    }

    /// §4.1.1 consistency check: PK subset sampled batch-wise. For no-PK
    /// tables, compares counts only.
    async fn consistency_check(&self, entry: &CatalogEntry, source: &dyn SourceAdapter) -> Result<bool, SyncError> {
        if !entry.has_pk {
            return Ok(true);
        }

        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();
        let mut cursor: Option<String> = None;

        loop {
            let lake_pks = self
                .fetch_lake_pk_batch(schema, table, &entry.pk_columns, cursor.as_deref(), CONSISTENCY_BATCH_SIZE)
                .await?;
            if lake_pks.is_empty() {
                return Ok(true);
            }

            let existing = self
                .source_pks_exist(source, schema, table, &entry.pk_columns, &lake_pks)
                .await?;
            if existing.iter().any(|&ok| !ok) {
                return Ok(false);
            }

            if lake_pks.len() < CONSISTENCY_BATCH_SIZE {
                return Ok(true);
            }
            cursor = lake_pks.last().map(|row| row.join("|"));
        }
    }

    /// §4.1.2 delete reconciliation: merge-join over keyset-paginated lake
    /// PKs against source existence checks.
    async fn reconcile_deletes(&self, entry: &CatalogEntry, source: &dyn SourceAdapter) -> Result<u64, SyncError> {
        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();
        let batch_size = self.config.chunk_size;
        let mut cursor: Option<String> = None;
        let mut total_deleted = 0u64;

        loop {
            let lake_pks = self
                .fetch_lake_pk_batch(schema, table, &entry.pk_columns, cursor.as_deref(), batch_size)
                .await?;
            if lake_pks.is_empty() {
                break;
            }

            let existing = self
                .source_pks_exist(source, schema, table, &entry.pk_columns, &lake_pks)
                .await?;
            let to_delete: Vec<&Vec<String>> = lake_pks
                .iter()
                .zip(existing.iter())
                .filter(|(_, &present)| !present)
                .map(|(pk, _)| pk)
                .collect();

            if !to_delete.is_empty() {
                total_deleted += self.delete_batch(schema, table, &entry.pk_columns, &to_delete).await?;
            }

            if lake_pks.len() < batch_size {
                break;
            }
            cursor = lake_pks.last().map(|row| row.join("|"));
        }

        info!(schema, table, total_deleted, "delete reconciliation complete");
        Ok(total_deleted)
    }

    async fn fetch_lake_pk_batch(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<Vec<Vec<String>>, SyncError> {
        let pk_list = pk_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let order_by = pk_list.clone();

        let where_clause = match cursor {
            Some(cursor_val) => {
                let parts: Vec<&str> = cursor_val.split('|').collect();
                format!(" WHERE ({pk_list}) > ({})", parts.iter().map(|p| format!("'{}'", p.replace('\'', "''"))).collect::<Vec<_>>().join(", "))
            }
            None => String::new(),
        };

        let sql = format!(
            "SELECT {pk_list} FROM {}.{}{where_clause} ORDER BY {order_by} LIMIT {batch_size}",
            quote_ident(schema),
            quote_ident(table)
        );

        let rows = self
            .lake
            .query(&sql, &[])
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| {
                (0..pk_columns.len())
                    .map(|i| row.try_get::<_, String>(i).unwrap_or_default())
                    .collect()
            })
            .collect())
    }

    async fn source_pks_exist(
        &self,
        source: &dyn SourceAdapter,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        pks: &[Vec<String>],
    ) -> Result<Vec<bool>, SyncError> {
        let mut result = vec![false; pks.len()];

        for chunk_start in (0..pks.len()).step_by(CHECK_BATCH_SIZE) {
            let chunk_end = (chunk_start + CHECK_BATCH_SIZE).min(pks.len());
            let chunk = &pks[chunk_start..chunk_end];

            let predicate = chunk
                .iter()
                .map(|pk| {
                    let clauses = pk_columns
                        .iter()
                        .zip(pk.iter())
                        .map(|(col, val)| format!("{} = '{}'", col, val.replace('\'', "''")))
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    format!("({clauses})")
                })
                .collect::<Vec<_>>()
                .join(" OR ");

            let pk_list = pk_columns.join(", ");
            let sql = format!("SELECT {pk_list} FROM {schema}.{table} WHERE {predicate}");
            let rows = source.execute_query(&sql).await?;

            let found: std::collections::HashSet<String> = rows
                .iter()
                .map(|row| row.iter().map(|v| v.clone().unwrap_or_default()).collect::<Vec<_>>().join("|"))
                .collect();

            for (i, pk) in chunk.iter().enumerate() {
                if found.contains(&pk.join("|")) {
                    result[chunk_start + i] = true;
                }
            }
        }

        Ok(result)
    }

    async fn delete_batch(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        pks: &[&Vec<String>],
    ) -> Result<u64, SyncError> {
        let predicate = pks
            .iter()
            .map(|pk| {
                let clauses = pk_columns
                    .iter()
                    .zip(pk.iter())
                    .map(|(col, val)| format!("{} = '{}'", quote_ident(col), val.replace('\'', "''")))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!("({clauses})")
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        let sql = format!(
            "DELETE FROM {}.{} WHERE {predicate}",
            quote_ident(schema),
            quote_ident(table)
        );
        self.lake
            .execute(&sql, &[])
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))
    }

    /// §4.1.3 update reconciliation via `last_sync_column`. Unlike the
    /// transfer loop, this never inserts: a row absent on the lake is left
    /// for the transfer loop to pick up, and only columns that actually
    /// changed are written (a narrow `UPDATE`, not a full-row upsert).
    async fn update_reconciliation(&self, entry: &CatalogEntry, source: &dyn SourceAdapter) -> Result<(), SyncError> {
        let Some(sync_column) = entry.last_sync_column.as_deref() else {
            return Ok(());
        };
        if entry.pk_columns.is_empty() {
            return Ok(());
        }
        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();
        let watermark = entry
            .last_sync_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());

        let sql = format!(
            "SELECT * FROM {schema}.{table} WHERE {sync_column} > '{watermark}' \
             ORDER BY {sync_column} LIMIT {MAX_UPDATE_SCAN}"
        );
        let columns = source.discover_schema(schema, table).await?;
        let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let rows = source.execute_query(&sql).await?;

        if rows.is_empty() {
            return Ok(());
        }

        let pk_indices: Vec<usize> = entry
            .pk_columns
            .iter()
            .map(|pk| column_names.iter().position(|c| c == pk).unwrap_or(0))
            .collect();

        for raw in rows {
            let normalized = normalize_row(&raw, &columns);
            let pk_values: Vec<String> = pk_indices
                .iter()
                .map(|&i| normalized.get(i).and_then(|v| v.clone()).unwrap_or_default())
                .collect();

            let Some(lake_row) = self
                .fetch_lake_row(schema, table, &column_names, &entry.pk_columns, &pk_values)
                .await?
            else {
                // Rows absent on the lake are ignored here; the transfer
                // loop handles inserts (spec §4.1.3 step 4).
                continue;
            };

            let changed: Vec<(&str, &Option<String>)> = column_names
                .iter()
                .zip(normalized.iter())
                .zip(lake_row.iter())
                .filter(|((_, new), old)| new != old)
                .map(|((name, new), _)| (name.as_str(), new))
                .collect();

            if changed.is_empty() {
                continue;
            }

            self.apply_narrow_update(schema, table, &entry.pk_columns, &pk_values, &changed)
                .await?;
        }

        Ok(())
    }

    /// Fetch one lake row by PK, as already-stringified cells in
    /// `column_names` order, for field-by-field comparison against a
    /// normalised source row. Returns `None` if no lake row matches.
    async fn fetch_lake_row(
        &self,
        schema: &str,
        table: &str,
        column_names: &[String],
        pk_columns: &[String],
        pk_values: &[String],
    ) -> Result<Option<Row>, SyncError> {
        let column_list = column_names.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let predicate = pk_columns
            .iter()
            .zip(pk_values.iter())
            .map(|(col, val)| format!("{} = '{}'", quote_ident(col), val.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(" AND ");

        let sql = format!(
            "SELECT {column_list} FROM {}.{} WHERE {predicate}",
            quote_ident(schema),
            quote_ident(table)
        );
        let rows = self
            .lake
            .query(&sql, &[])
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

        Ok(rows.into_iter().next().map(|row| {
            (0..column_names.len())
                .map(|i| row.try_get::<_, Option<String>>(i).unwrap_or(None))
                .collect()
        }))
    }

    /// Issue a single narrow `UPDATE ... SET col = val, ... WHERE pk`
    /// covering only the columns that changed (spec §4.1.3 step 3).
    async fn apply_narrow_update(
        &self,
        schema: &str,
        table: &str,
        pk_columns: &[String],
        pk_values: &[String],
        changed: &[(&str, &Option<String>)],
    ) -> Result<(), SyncError> {
        let set_clause = changed
            .iter()
            .map(|(col, val)| {
                let rendered = match val {
                    None => "NULL".to_string(),
                    Some(v) => format!("'{}'", v.replace('\'', "''")),
                };
                format!("{} = {rendered}", quote_ident(col))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = pk_columns
            .iter()
            .zip(pk_values.iter())
            .map(|(col, val)| format!("{} = '{}'", quote_ident(col), val.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(" AND ");

        let sql = format!(
            "UPDATE {}.{} SET {set_clause} WHERE {predicate}",
            quote_ident(schema),
            quote_ident(table)
        );
        self.lake
            .execute(&sql, &[])
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(())
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn normalize_row(raw: &[Option<String>], columns: &[ColumnInfo]) -> Row {
    raw.iter()
        .zip(columns.iter())
        .map(|(value, col)| match normalize(value.as_deref(), col.pg_type()) {
            NormalizedValue::Null => None,
            NormalizedValue::Value(v) => Some(v),
        })
        .collect()
}

fn pk_cursor_value(row: &Row, columns: &[String], pk_columns: &[String]) -> String {
    pk_columns
        .iter()
        .map(|pk| {
            let idx = columns.iter().position(|c| c == pk).unwrap_or(0);
            row.get(idx).and_then(|v| v.clone()).unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join("|")
}
