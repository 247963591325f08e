//! Parallel Chunk Pipeline (C7) — Fetcher → Preparer pool → Inserter pool
//! with bounded queues, used inside C5 for large tables (spec §4.5).
//!
//! Grounded on `original_source/include/sync/DatabaseToPostgresSync.h`'s
//! `ThreadSafeQueue<DataChunk>`/`<PreparedBatch>`/`<ProcessedResult>` plus
//! `batchInserterThread`'s worker-pool-over-one-queue shape, translated to
//! bounded `tokio::sync::mpsc` channels fanned out to `batch_preparers`
//! and `batch_inserters` tasks sharing each receiver behind a
//! `tokio::sync::Mutex`.
//!
//! Ordering is NOT preserved between preparers/inserters (spec §5):
//! UPSERTs on distinct PKs commute, and re-fetching already-applied rows
//! on the next cycle is a harmless no-op, so the cursor only needs the
//! lowest chunk number that failed, not stage order or full completion.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::config::Config;
use crate::error::SyncError;
use crate::writer::Row;

/// Raw rows out of the source, not yet normalised (spec §3.3).
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub chunk_no: u64,
    pub schema: String,
    pub table: String,
    pub rows: Vec<Vec<Option<String>>>,
    pub is_last: bool,
}

/// Normalised + assembled UPSERT payload, ready for C4 (spec §3.3).
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub chunk_no: u64,
    pub schema: String,
    pub table: String,
    pub rows: Vec<Row>,
    pub is_last: bool,
}

/// Terminal outcome of one batch's C4 application (spec §3.3).
#[derive(Debug, Clone)]
pub struct ProcessedResult {
    pub chunk_no: u64,
    pub rows_processed: u64,
    pub ok: bool,
    pub err: Option<String>,
}

/// A function that normalises one `DataChunk` into a `PreparedBatch`
/// (runs C3 per cell, then assembles the statement shape); supplied by
/// the orchestrator so this module stays engine-agnostic.
pub type Preparer = Box<dyn Fn(DataChunk) -> PreparedBatch + Send + Sync>;

/// A function that applies one `PreparedBatch` via C4 and reports rows
/// affected.
pub type Inserter =
    Box<dyn Fn(PreparedBatch) -> futures_util::future::BoxFuture<'static, Result<u64, SyncError>> + Send + Sync>;

/// Drive the three-stage pipeline to completion for one table's chunk
/// stream. `chunks` already encodes the fetcher's cursor logic (§4.1 Step
/// 5); this function owns only the preparer/inserter fan-out and
/// backpressure.
///
/// Returns the highest chunk number that was fully, successfully applied
/// — the cursor MUST NOT advance past this (spec §4.5: "If any inserter
/// reports failure for chunk c, the cursor MUST NOT advance past c-1").
pub async fn run_pipeline(
    config: &Config,
    chunks: Vec<DataChunk>,
    preparer: Preparer,
    inserter: Inserter,
) -> Result<u64, SyncError> {
    let queue_depth = config.max_queue_size;
    let (raw_tx, mut raw_rx) = mpsc::channel::<DataChunk>(queue_depth);
    let (prepared_tx, mut prepared_rx) = mpsc::channel::<PreparedBatch>(queue_depth);
    let (result_tx, mut result_rx) = mpsc::channel::<ProcessedResult>(queue_depth);

    let backpressure_sleep = config.backpressure_sleep();
    let backpressure_timeout = config.backpressure_timeout();

    // Fetcher: push pre-built chunks, honouring the same bounded-retry
    // backpressure as the other stages (spec §4.5).
    let fetcher = tokio::spawn(async move {
        for chunk in chunks {
            send_with_backpressure(&raw_tx, chunk, backpressure_sleep, backpressure_timeout).await;
        }
    });

    // Preparer pool: `batch_preparers` tasks pulling off one shared
    // receiver. `recv()` itself is serialised by the mutex, but the
    // (potentially CPU-bound) normalisation work per chunk runs
    // concurrently across the pool.
    let raw_rx = Arc::new(AsyncMutex::new(raw_rx));
    let preparer = Arc::new(preparer);
    let num_preparers = config.batch_preparers.max(1);
    let mut preparer_tasks = Vec::with_capacity(num_preparers);
    for _ in 0..num_preparers {
        let raw_rx = Arc::clone(&raw_rx);
        let preparer = Arc::clone(&preparer);
        let prepared_tx = prepared_tx.clone();
        preparer_tasks.push(tokio::spawn(async move {
            loop {
                let chunk = raw_rx.lock().await.recv().await;
                let Some(chunk) = chunk else { break };
                let batch = preparer(chunk);
                send_with_backpressure(&prepared_tx, batch, backpressure_sleep, backpressure_timeout).await;
            }
        }));
    }
    drop(prepared_tx);

    // Inserter pool: `batch_inserters` tasks, same fan-out shape.
    let prepared_rx = Arc::new(AsyncMutex::new(prepared_rx));
    let inserter = Arc::new(inserter);
    let num_inserters = config.batch_inserters.max(1);
    let mut inserter_tasks = Vec::with_capacity(num_inserters);
    for _ in 0..num_inserters {
        let prepared_rx = Arc::clone(&prepared_rx);
        let inserter = Arc::clone(&inserter);
        let result_tx = result_tx.clone();
        inserter_tasks.push(tokio::spawn(async move {
            loop {
                let batch = prepared_rx.lock().await.recv().await;
                let Some(batch) = batch else { break };
                let chunk_no = batch.chunk_no;
                let result = match inserter(batch).await {
                    Ok(rows_processed) => ProcessedResult {
                        chunk_no,
                        rows_processed,
                        ok: true,
                        err: None,
                    },
                    Err(e) => ProcessedResult {
                        chunk_no,
                        rows_processed: 0,
                        ok: false,
                        err: Some(e.to_string()),
                    },
                };
                send_with_backpressure(&result_tx, result, backpressure_sleep, backpressure_timeout).await;
            }
        }));
    }
    drop(result_tx);

    let _ = fetcher.await;
    for task in preparer_tasks {
        let _ = task.await;
    }
    for task in inserter_tasks {
        let _ = task.await;
    }

    // Preparers/inserters run concurrently, so failures don't arrive in
    // chunk order; take the lowest failed chunk number across the whole
    // run rather than the first one observed.
    let mut max_applied_chunk: Option<u64> = None;
    let mut failed_chunk: Option<u64> = None;
    while let Some(result) = result_rx.recv().await {
        if result.ok {
            max_applied_chunk = Some(max_applied_chunk.map_or(result.chunk_no, |m| m.max(result.chunk_no)));
        } else {
            failed_chunk = Some(failed_chunk.map_or(result.chunk_no, |m| m.min(result.chunk_no)));
        }
    }

    match (max_applied_chunk, failed_chunk) {
        (_, Some(failed)) => {
            warn!(chunk_no = failed, "pipeline inserter reported failure");
            Ok(failed.saturating_sub(1))
        }
        (Some(max), None) => Ok(max),
        (None, None) => Ok(0),
    }
}

/// Retry submitting to a bounded channel for up to `timeout`, sleeping
/// `interval` between attempts, before giving up and dropping the item
/// (spec §4.5: "sleep briefly ... retry for a bounded period ... before
/// dropping the chunk").
async fn send_with_backpressure<T: Send + 'static>(
    tx: &mpsc::Sender<T>,
    mut item: T,
    interval: std::time::Duration,
    timeout: std::time::Duration,
) {
    let deadline = Instant::now() + timeout;
    loop {
        match tx.try_send(item) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(returned)) => {
                item = returned;
                if Instant::now() >= deadline {
                    warn!("pipeline queue full past backpressure timeout, dropping item");
                    return;
                }
                sleep(interval).await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            catalog_dsn = "postgres://localhost/catalog"
            lake_dsn = "postgres://localhost/lake"
            max_queue_size = 2
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pipeline_applies_all_chunks_in_order_of_completion() {
        let config = test_config();
        let chunks = vec![
            DataChunk {
                chunk_no: 1,
                schema: "s".into(),
                table: "t".into(),
                rows: vec![vec![Some("1".into())]],
                is_last: false,
            },
            DataChunk {
                chunk_no: 2,
                schema: "s".into(),
                table: "t".into(),
                rows: vec![vec![Some("2".into())]],
                is_last: true,
            },
        ];

        let preparer: Preparer = Box::new(|chunk| PreparedBatch {
            chunk_no: chunk.chunk_no,
            schema: chunk.schema,
            table: chunk.table,
            rows: chunk.rows,
            is_last: chunk.is_last,
        });

        let inserter: Inserter = Box::new(|batch| {
            Box::pin(async move { Ok(batch.rows.len() as u64) })
        });

        let max_applied = run_pipeline(&config, chunks, preparer, inserter).await.unwrap();
        assert_eq!(max_applied, 2);
    }

    #[tokio::test]
    async fn test_pipeline_stops_cursor_before_failed_chunk() {
        let config = test_config();
        let chunks = vec![
            DataChunk {
                chunk_no: 1,
                schema: "s".into(),
                table: "t".into(),
                rows: vec![vec![Some("1".into())]],
                is_last: false,
            },
            DataChunk {
                chunk_no: 2,
                schema: "s".into(),
                table: "t".into(),
                rows: vec![vec![Some("2".into())]],
                is_last: true,
            },
        ];

        let preparer: Preparer = Box::new(|chunk| PreparedBatch {
            chunk_no: chunk.chunk_no,
            schema: chunk.schema,
            table: chunk.table,
            rows: chunk.rows,
            is_last: chunk.is_last,
        });

        let inserter: Inserter = Box::new(|batch| {
            Box::pin(async move {
                if batch.chunk_no == 2 {
                    Err(SyncError::Transient("boom".into()))
                } else {
                    Ok(batch.rows.len() as u64)
                }
            })
        });

        let max_applied = run_pipeline(&config, chunks, preparer, inserter).await.unwrap();
        assert_eq!(max_applied, 1);
    }
}
