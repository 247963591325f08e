//! Catalog layer — durable per-table replication state in `metadata.catalog`.
//!
//! The catalog is not a local data structure; it IS shared durable state
//! (design notes §9). All status/cursor mutations go through
//! [`CatalogStore::update_status`] or [`CatalogStore::finish_cycle`], which
//! issue single-statement atomic `UPDATE`s and are additionally serialised
//! behind [`CatalogStore`]'s internal mutex so two workers can never
//! interleave a read-modify-write on the same row. The mutex is never held
//! across a network round-trip to a source database — only around the
//! catalog UPDATE itself.

use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::error::SyncError;

/// Source database engine. Selects which adapter handles a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbEngine {
    MariaDb,
    Mssql,
    Oracle,
    Postgres,
    MongoDb,
}

impl DbEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbEngine::MariaDb => "MariaDB",
            DbEngine::Mssql => "MSSQL",
            DbEngine::Oracle => "Oracle",
            DbEngine::Postgres => "PostgreSQL",
            DbEngine::MongoDb => "MongoDB",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "MariaDB" => Ok(DbEngine::MariaDb),
            "MSSQL" => Ok(DbEngine::Mssql),
            "Oracle" => Ok(DbEngine::Oracle),
            "PostgreSQL" => Ok(DbEngine::Postgres),
            "MongoDB" => Ok(DbEngine::MongoDb),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown db_engine: {other}"
            ))),
        }
    }
}

/// Catalog lifecycle status (spec §3.1, §4.1.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    FullLoad,
    Reset,
    ListeningChanges,
    NoData,
    InProgress,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::FullLoad => "FULL_LOAD",
            Status::Reset => "RESET",
            Status::ListeningChanges => "LISTENING_CHANGES",
            Status::NoData => "NO_DATA",
            Status::InProgress => "IN_PROGRESS",
            Status::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "FULL_LOAD" => Ok(Status::FullLoad),
            "RESET" => Ok(Status::Reset),
            "LISTENING_CHANGES" => Ok(Status::ListeningChanges),
            "NO_DATA" => Ok(Status::NoData),
            "IN_PROGRESS" => Ok(Status::InProgress),
            "ERROR" => Ok(Status::Error),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown status: {other}"
            ))),
        }
    }

    /// Submission priority for the worker pool (spec §4.4): lower sorts
    /// first.
    pub fn priority(&self) -> u8 {
        match self {
            Status::FullLoad => 0,
            Status::Reset => 1,
            Status::ListeningChanges => 2,
            Status::NoData | Status::InProgress | Status::Error => 3,
        }
    }
}

/// Cursor pagination / consumption mode (spec §3.1, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkStrategy {
    Pk,
    Offset,
    Cdc,
}

impl PkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PkStrategy::Pk => "PK",
            PkStrategy::Offset => "OFFSET",
            PkStrategy::Cdc => "CDC",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "PK" => Ok(PkStrategy::Pk),
            "OFFSET" => Ok(PkStrategy::Offset),
            "CDC" => Ok(PkStrategy::Cdc),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown pk_strategy: {other}"
            ))),
        }
    }
}

/// One row of `metadata.catalog` (spec §3.1).
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub schema_name: String,
    pub table_name: String,
    pub db_engine: DbEngine,
    pub connection_string: String,
    pub status: Status,
    pub pk_strategy: PkStrategy,
    pub pk_columns: Vec<String>,
    pub has_pk: bool,
    pub last_processed_pk: Option<String>,
    pub last_sync_column: Option<String>,
    pub last_sync_time: Option<chrono::DateTime<chrono::Utc>>,
    pub sync_metadata: Json,
    pub active: bool,
}

impl CatalogEntry {
    /// `v1|v2|…|vn` cursor split into its component values.
    pub fn cursor_parts(&self) -> Option<Vec<&str>> {
        self.last_processed_pk
            .as_deref()
            .map(|c| c.split('|').collect())
    }

    pub fn last_change_id(&self) -> i64 {
        self.sync_metadata
            .get("last_change_id")
            .and_then(Json::as_i64)
            .unwrap_or(0)
    }
}

fn row_to_entry(row: &tokio_postgres::Row) -> Result<CatalogEntry, SyncError> {
    let db_engine: String = row.get("db_engine");
    let status: String = row.get("status");
    let pk_strategy: String = row.get("pk_strategy");
    let pk_columns: Vec<String> = row.get("pk_columns");
    let sync_metadata: Json = row.try_get("sync_metadata").unwrap_or(Json::Object(Default::default()));

    Ok(CatalogEntry {
        schema_name: row.get("schema_name"),
        table_name: row.get("table_name"),
        db_engine: DbEngine::parse(&db_engine)?,
        connection_string: row.get("connection_string"),
        status: Status::parse(&status)?,
        pk_strategy: PkStrategy::parse(&pk_strategy)?,
        has_pk: !pk_columns.is_empty(),
        pk_columns,
        last_processed_pk: row.get("last_processed_pk"),
        last_sync_column: row.get("last_sync_column"),
        last_sync_time: row.get("last_sync_time"),
        sync_metadata,
        active: row.get("active"),
    })
}

const SELECT_COLUMNS: &str = "schema_name, table_name, db_engine, connection_string, status, \
     pk_strategy, pk_columns, last_processed_pk, last_sync_column, last_sync_time, \
     sync_metadata, active";

/// Catalog accessor. Holds the catalog's PostgreSQL client plus the
/// process-wide mutex that serialises every status/cursor write (spec §5,
/// §9 "Global mutable catalog").
pub struct CatalogStore {
    client: Client,
    update_lock: Arc<Mutex<()>>,
}

impl CatalogStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            update_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Active tables for one engine, ordered `(schema_name, table_name)`.
    ///
    /// Mirrors spec §6's pinned read: `WHERE active = true AND db_engine =
    /// $1 AND status <> 'NO_DATA'`.
    pub async fn active_tables(&self, engine: DbEngine) -> Result<Vec<CatalogEntry>, SyncError> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM metadata.catalog \
                     WHERE active = true AND db_engine = $1 AND status <> 'NO_DATA' \
                     ORDER BY schema_name, table_name"
                ),
                &[&engine.as_str()],
            )
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

        rows.iter().map(row_to_entry).collect()
    }

    pub async fn get(
        &self,
        schema: &str,
        table: &str,
        engine: DbEngine,
    ) -> Result<CatalogEntry, SyncError> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM metadata.catalog \
                     WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3"
                ),
                &[&schema, &table, &engine.as_str()],
            )
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?
            .ok_or_else(|| SyncError::NotFound(format!("{schema}.{table}")))?;

        row_to_entry(&row)
    }

    /// Single-statement atomic status write (spec §6, §9). Used for
    /// terminal transitions that don't also update cursor/sync_metadata.
    pub async fn update_status(
        &self,
        schema: &str,
        table: &str,
        engine: DbEngine,
        status: Status,
    ) -> Result<(), SyncError> {
        let _guard = self.update_lock.lock().await;
        self.client
            .execute(
                "UPDATE metadata.catalog SET status = $1 \
                 WHERE schema_name = $2 AND table_name = $3 AND db_engine = $4",
                &[&status.as_str(), &schema, &table, &engine.as_str()],
            )
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    /// Atomic terminal-state write: status, cursor, sync time, and a
    /// sync_metadata merge in one statement (spec §6).
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_cycle(
        &self,
        schema: &str,
        table: &str,
        engine: DbEngine,
        status: Status,
        last_processed_pk: Option<&str>,
        sync_metadata_patch: &Json,
    ) -> Result<(), SyncError> {
        let _guard = self.update_lock.lock().await;
        self.client
            .execute(
                "UPDATE metadata.catalog \
                 SET status = $1, last_processed_pk = $2, last_sync_time = now(), \
                 sync_metadata = sync_metadata || $3 \
                 WHERE schema_name = $4 AND table_name = $5 AND db_engine = $6",
                &[
                    &status.as_str(),
                    &last_processed_pk,
                    sync_metadata_patch,
                    &schema,
                    &table,
                    &engine.as_str(),
                ],
            )
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    /// Reset a FULL_LOAD/RESET entry's cursor before the transfer loop
    /// (spec §4.1 Step 1).
    pub async fn reset_cursor(
        &self,
        schema: &str,
        table: &str,
        engine: DbEngine,
    ) -> Result<(), SyncError> {
        let _guard = self.update_lock.lock().await;
        self.client
            .execute(
                "UPDATE metadata.catalog \
                 SET last_processed_pk = NULL, sync_metadata = '{}'::jsonb \
                 WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3",
                &[&schema, &table, &engine.as_str()],
            )
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(())
    }
}

/// Sort catalog entries by submission priority (spec §4.4): `FULL_LOAD >
/// RESET > LISTENING_CHANGES > others`, ties broken by `(schema_name,
/// table_name)`.
pub fn sort_by_priority(entries: &mut [CatalogEntry]) {
    entries.sort_by(|a, b| {
        a.status
            .priority()
            .cmp(&b.status.priority())
            .then_with(|| a.schema_name.cmp(&b.schema_name))
            .then_with(|| a.table_name.cmp(&b.table_name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(schema: &str, table: &str, status: Status) -> CatalogEntry {
        CatalogEntry {
            schema_name: schema.into(),
            table_name: table.into(),
            db_engine: DbEngine::Postgres,
            connection_string: String::new(),
            status,
            pk_strategy: PkStrategy::Pk,
            pk_columns: vec!["id".into()],
            has_pk: true,
            last_processed_pk: None,
            last_sync_column: None,
            last_sync_time: None,
            sync_metadata: Json::Object(Default::default()),
            active: true,
        }
    }

    #[test]
    fn test_engine_round_trip() {
        for e in [
            DbEngine::MariaDb,
            DbEngine::Mssql,
            DbEngine::Oracle,
            DbEngine::Postgres,
            DbEngine::MongoDb,
        ] {
            assert_eq!(DbEngine::parse(e.as_str()).unwrap(), e);
        }
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            Status::FullLoad,
            Status::Reset,
            Status::ListeningChanges,
            Status::NoData,
            Status::InProgress,
            Status::Error,
        ] {
            assert_eq!(Status::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_priority_sort() {
        let mut entries = vec![
            entry("a", "z", Status::ListeningChanges),
            entry("a", "a", Status::FullLoad),
            entry("b", "a", Status::Reset),
            entry("a", "b", Status::FullLoad),
        ];
        sort_by_priority(&mut entries);
        let order: Vec<_> = entries
            .iter()
            .map(|e| (e.schema_name.as_str(), e.table_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("a", "a"), ("a", "b"), ("b", "a"), ("a", "z")]
        );
    }

    #[test]
    fn test_cursor_parts_composite() {
        let mut e = entry("s", "t", Status::ListeningChanges);
        e.last_processed_pk = Some("5|abc".into());
        assert_eq!(e.cursor_parts(), Some(vec!["5", "abc"]));
    }

    #[test]
    fn test_last_change_id_defaults_zero() {
        let e = entry("s", "t", Status::ListeningChanges);
        assert_eq!(e.last_change_id(), 0);
    }
}
