//! Multi-source data-lake synchronizer.
//!
//! Replicates tables from MariaDB, MSSQL, Oracle, PostgreSQL, and MongoDB
//! sources into a single PostgreSQL "lake", driven by a durable catalog of
//! per-table replication state (`metadata.catalog`). Each table moves
//! through a small state machine (full load → listening for changes →
//! incremental reconciliation or CDC replay) that is resumed, not
//! restarted, on every cycle.
//!
//! # Module map
//!
//! - [`catalog`] — the durable per-table state store.
//! - [`adapters`] — one source driver per engine behind a single trait.
//! - [`normalize`] — source-cell-to-PostgreSQL-literal normalisation.
//! - [`writer`] — batched upsert application with error-class recovery.
//! - [`orchestrator`] — the per-table replication state machine.
//! - [`pool`] — the fixed-size table worker pool.
//! - [`pipeline`] — the parallel fetch/prepare/insert pipeline for wide
//!   tables.
//! - [`cdc`] — the change-log consumer and trigger setup SQL.
//! - [`scheduler`] — the periodic per-engine cycle driver.
//! - [`hash`] — content hashing for primary-key-less tables.
//! - [`config`] — runtime configuration (TOML + environment overrides).
//! - [`error`] — the shared error type and retry policy.

pub mod adapters;
pub mod catalog;
pub mod cdc;
pub mod config;
pub mod error;
pub mod hash;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod scheduler;
pub mod writer;
