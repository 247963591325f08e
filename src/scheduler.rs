//! Cycle Scheduler (C9) — periodic per-engine driver that asks the catalog
//! for active tables, sorts them by priority, and submits them to the
//! table worker pool (spec §4.4, §9).
//!
//! Grounded on `original_source`'s per-engine sync classes being driven by
//! an outer polling loop, generalised here into one engine-agnostic driver
//! running one `tokio::time::sleep` loop per engine, each feeding the same
//! [`TableWorkerPool`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio_postgres::NoTls;
use tracing::{error, info, warn};

use crate::catalog::{sort_by_priority, CatalogEntry, CatalogStore, DbEngine, PkStrategy, Status};
use crate::cdc::CdcConsumer;
use crate::config::Config;
use crate::error::{RetryPolicy, RetryState, SyncError};
use crate::orchestrator::Orchestrator;
use crate::pool::{PoolStats, Task, TableWorkerPool};

/// Keyed by `(schema, table, engine)`, not just `(schema, table)`: two
/// engines can legitimately replicate same-named tables into the lake
/// (spec §5 distinguishes tables by engine as well as name), and a
/// schema/table-only key would let their retry/in-progress state collide.
type RetryKey = (String, String, DbEngine);

/// Periodic driver for one or more source engines. Cheap to clone: every
/// field is an `Arc`, so each engine's polling loop gets its own handle
/// sharing the same catalog connection, retry-state map, and config.
#[derive(Clone)]
pub struct CycleScheduler {
    catalog: Arc<CatalogStore>,
    config: Arc<Config>,
    retry_states: Arc<Mutex<HashMap<RetryKey, RetryState>>>,
    retry_policy: RetryPolicy,
    /// Process-wide re-entry guard (spec §5 "`{tableKey → inProgress}` map
    /// ... re-entering a table already marked in-progress is forbidden").
    in_progress: Arc<Mutex<HashSet<RetryKey>>>,
}

impl CycleScheduler {
    pub fn new(catalog: CatalogStore, config: Config) -> Self {
        Self {
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            retry_states: Arc::new(Mutex::new(HashMap::new())),
            retry_policy: RetryPolicy::default(),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run one polling loop per engine in `engines`, forever. Returns only
    /// if every loop's task panics or is cancelled (normally this runs
    /// until the process receives a shutdown signal and the caller drops
    /// the returned handle's owning task).
    pub async fn run(&self, engines: &[DbEngine]) {
        let mut handles = Vec::with_capacity(engines.len());
        for &engine in engines {
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_engine_loop(engine).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn run_engine_loop(&self, engine: DbEngine) {
        loop {
            match self.run_one_cycle(engine).await {
                Ok(stats) => info!(
                    engine = engine.as_str(),
                    completed = stats.completed_tasks,
                    failed = stats.failed_tasks,
                    "cycle complete"
                ),
                Err(e) => error!(engine = engine.as_str(), error = %e, "cycle failed"),
            }
            tokio::time::sleep(self.config.cycle_interval()).await;
        }
    }

    /// Run exactly one cycle for `engine`: read active tables, sort by
    /// priority, cap at `max_tables_per_cycle`, skip tables still in retry
    /// backoff, and submit the rest to a fresh worker pool (spec §4.4).
    pub async fn run_one_cycle(&self, engine: DbEngine) -> Result<PoolStats, SyncError> {
        let mut entries = self.catalog.active_tables(engine).await?;
        sort_by_priority(&mut entries);
        if let Some(cap) = self.config.max_tables_per_cycle {
            entries.truncate(cap);
        }

        let now_ms = current_epoch_ms();
        let pool = TableWorkerPool::new(self.config.max_workers);
        let (done_tx, mut done_rx) = mpsc::channel::<(RetryKey, bool)>(entries.len().max(1));

        let mut submitted = 0usize;
        for entry in entries {
            let key = (entry.schema_name.clone(), entry.table_name.clone(), entry.db_engine);
            if self.is_in_backoff(&key, now_ms).await {
                continue;
            }
            if !self.try_claim_in_progress(&key).await {
                warn!(schema = %key.0, table = %key.1, engine = key.2.as_str(), "table already in progress, skipping re-entry");
                continue;
            }
            submitted += 1;
            pool.submit(self.build_task(entry, done_tx.clone())).await;
        }
        drop(done_tx);

        let stats = pool.wait_for_completion().await;

        while let Some((key, success)) = done_rx.recv().await {
            self.release_in_progress(&key).await;
            self.record_outcome(key, success, now_ms).await;
        }

        if submitted == 0 {
            info!(engine = engine.as_str(), "no tables submitted this cycle (all in backoff or inactive)");
        }
        Ok(stats)
    }

    async fn is_in_backoff(&self, key: &RetryKey, now_ms: u64) -> bool {
        let states = self.retry_states.lock().await;
        states.get(key).is_some_and(|s| s.is_in_backoff(now_ms))
    }

    /// Atomically mark `key` in-progress unless it already is. Returns
    /// `false` if the table is already being processed (spec §5: "re-
    /// entering a table already marked in-progress is forbidden").
    async fn try_claim_in_progress(&self, key: &RetryKey) -> bool {
        let mut in_progress = self.in_progress.lock().await;
        in_progress.insert(key.clone())
    }

    async fn release_in_progress(&self, key: &RetryKey) {
        self.in_progress.lock().await.remove(key);
    }

    async fn record_outcome(&self, key: RetryKey, success: bool, now_ms: u64) {
        let mut states = self.retry_states.lock().await;
        let state = states.entry(key).or_default();
        if success {
            state.reset();
        } else {
            state.record_failure(&self.retry_policy, now_ms);
        }
    }

    /// Build the opaque task the pool runs: opens a fresh, worker-owned
    /// lake connection (spec §4.4 "never shares the lake connection"),
    /// dispatches to the CDC consumer or the full orchestrator cycle
    /// depending on the table's strategy and status, and reports its
    /// outcome back over `done`.
    fn build_task(&self, entry: CatalogEntry, done: mpsc::Sender<(RetryKey, bool)>) -> Task {
        let catalog = Arc::clone(&self.catalog);
        let config = Arc::clone(&self.config);
        let lake_dsn = self.config.lake_dsn.clone();

        Box::pin(async move {
            let key = (entry.schema_name.clone(), entry.table_name.clone(), entry.db_engine);

            let (lake_client, connection) = match tokio_postgres::connect(&lake_dsn, NoTls).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(schema = %key.0, table = %key.1, error = %e, "failed to open lake connection");
                    let _ = done.send((key, false)).await;
                    return;
                }
            };
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "lake connection terminated");
                }
            });

            // CDC-strategy tables that have already completed their initial
            // full load are driven by the change-log consumer instead of
            // the count-comparison state machine; FULL_LOAD/RESET still go
            // through the orchestrator regardless of strategy, since there
            // is nothing in the change log to consume until the first load
            // has run (spec §4.6 assumes an already-populated lake).
            let use_cdc = entry.pk_strategy == PkStrategy::Cdc
                && matches!(entry.status, Status::ListeningChanges | Status::InProgress);

            let outcome: Result<(), SyncError> = if use_cdc {
                CdcConsumer {
                    catalog: &catalog,
                    lake: &lake_client,
                    config: &config,
                }
                .consume(&entry)
                .await
                .map(|_| ())
            } else {
                Orchestrator {
                    catalog: &catalog,
                    lake: &lake_client,
                    config: &config,
                }
                .run_cycle(&entry)
                .await
                .map(|_| ())
            };

            let success = outcome.is_ok();
            if let Err(e) = &outcome {
                warn!(schema = %key.0, table = %key.1, error = %e, "table cycle failed");
            }
            let _ = done.send((key, success)).await;
        })
    }
}

fn current_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_state_backoff_blocks_resubmission() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        };
        let mut state = RetryState::new();
        let now = 1_000_000u64;
        assert!(!state.is_in_backoff(now));

        state.record_failure(&policy, now);
        assert!(state.is_in_backoff(now + 10));
        assert!(!state.is_in_backoff(now + 100_000));
    }

    #[test]
    fn test_current_epoch_ms_is_nonzero() {
        assert!(current_epoch_ms() > 0);
    }

    #[tokio::test]
    async fn test_is_in_backoff_defaults_false_for_unknown_table() {
        let states: Arc<Mutex<HashMap<RetryKey, RetryState>>> = Arc::new(Mutex::new(HashMap::new()));
        let key: RetryKey = ("public".to_string(), "accounts".to_string(), DbEngine::Postgres);
        let locked = states.lock().await;
        assert!(!locked.get(&key).is_some_and(|s| s.is_in_backoff(0)));
    }

    #[tokio::test]
    async fn test_record_outcome_resets_on_success_after_failure() {
        let retry_states: Arc<Mutex<HashMap<RetryKey, RetryState>>> = Arc::new(Mutex::new(HashMap::new()));
        let policy = RetryPolicy::default();
        let key: RetryKey = ("s".to_string(), "t".to_string(), DbEngine::Postgres);

        {
            let mut states = retry_states.lock().await;
            let state = states.entry(key.clone()).or_default();
            state.record_failure(&policy, 1_000);
            assert_eq!(state.attempts, 1);
        }
        {
            let mut states = retry_states.lock().await;
            let state = states.entry(key.clone()).or_default();
            state.reset();
        }

        let states = retry_states.lock().await;
        assert_eq!(states.get(&key).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_in_progress_set_rejects_reentry_same_key() {
        let in_progress: Arc<Mutex<HashSet<RetryKey>>> = Arc::new(Mutex::new(HashSet::new()));
        let key: RetryKey = ("s".to_string(), "t".to_string(), DbEngine::Postgres);

        assert!(in_progress.lock().await.insert(key.clone()));
        assert!(!in_progress.lock().await.insert(key.clone()));

        in_progress.lock().await.remove(&key);
        assert!(in_progress.lock().await.insert(key));
    }

    #[tokio::test]
    async fn test_in_progress_set_allows_distinct_engines_same_table() {
        let in_progress: Arc<Mutex<HashSet<RetryKey>>> = Arc::new(Mutex::new(HashSet::new()));
        let pg_key: RetryKey = ("s".to_string(), "t".to_string(), DbEngine::Postgres);
        let maria_key: RetryKey = ("s".to_string(), "t".to_string(), DbEngine::MariaDb);

        assert!(in_progress.lock().await.insert(pg_key));
        assert!(in_progress.lock().await.insert(maria_key));
    }
}
