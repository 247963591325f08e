//! Source Adapter (C2) — one implementation per source engine, all
//! exposing the same capability set (spec §4.2) so the orchestrator (C5)
//! never branches on engine identity.

pub mod mariadb;
pub mod mongodb;
pub mod mssql;
pub mod oracle;
pub mod postgres;

use async_trait::async_trait;

use crate::catalog::{DbEngine, PkStrategy};
use crate::error::SyncError;
use crate::normalize::PgType;

/// Sentinel distinguishing SQL NULL from an empty string in raw rows
/// returned by `ExecuteQuery` (spec §4.2). Adapters translate their
/// native NULL representation to `None` before this point, so by the
/// time a row reaches the orchestrator, NULL is always `None` — this
/// constant documents the wire-level convention some adapters use
/// internally (e.g. ODBC) before that translation happens.
pub const NULL_SENTINEL: &str = "NULL";

/// Per-cell truncation cap (spec §4.2, design default).
pub const MAX_CELL_BYTES: usize = 32 * 1024;

/// One discovered column (spec §4.2 `DiscoverSchema`).
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub source_type: String,
    pub nullable: bool,
    pub pk: bool,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub default: Option<String>,
}

impl ColumnInfo {
    /// Best-effort mapping from this column's source type name to the
    /// target PostgreSQL normalisation type. Adapters override
    /// per-engine `dataTypeMap` lookups; this is the fallback.
    pub fn pg_type(&self) -> PgType {
        let t = self.source_type.to_ascii_uppercase();
        if t.contains("INT") {
            if t.contains("BIG") {
                PgType::Bigint
            } else {
                PgType::Integer
            }
        } else if t.contains("NUMERIC") || t.contains("DECIMAL") || t.contains("NUMBER") || t.contains("DOUBLE") || t.contains("FLOAT") {
            PgType::Numeric
        } else if t.contains("BOOL") {
            PgType::Boolean
        } else if t.contains("TIMESTAMP") || t.contains("DATETIME") {
            PgType::Timestamp
        } else if t == "DATE" {
            PgType::Date
        } else if t.contains("TIME") {
            PgType::Time
        } else if t.contains("BLOB") || t.contains("BYTEA") || t.contains("BINARY") || t.contains("RAW") {
            PgType::Bytea
        } else if t.contains("JSON") {
            PgType::Jsonb
        } else {
            PgType::Text
        }
    }
}

/// A raw row: one `Option<String>` per queried column, in column order.
/// `None` is the adapter's already-decoded SQL NULL; adapters never leak
/// engine-native NULL markers past `execute_query`.
pub type RawRow = Vec<Option<String>>;

/// Uniform per-engine driver contract (spec §4.2).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Parse `connection_string` (permissive `KEY=VALUE;…`, spec §6) and
    /// open a connection. Missing required fields fail early.
    async fn open(connection_string: &str) -> Result<Self, SyncError>
    where
        Self: Sized;

    /// Probe query (`SELECT 1` or equivalent).
    async fn test_connection(&self) -> Result<(), SyncError>;

    /// Run a query and return rows. Cells over `MAX_CELL_BYTES` are
    /// truncated, not silently corrupted — callers can detect truncation
    /// by comparing returned length against the cap.
    async fn execute_query(&self, sql: &str) -> Result<Vec<RawRow>, SyncError>;

    /// `COUNT(*)` helper used by §4.1 Step 0. Defensive: any parse
    /// failure or overflow yields 0, never an error.
    async fn count(&self, schema: &str, table: &str) -> Result<u64, SyncError> {
        let sql = format!("SELECT COUNT(*) FROM {schema}.{table}");
        let rows = self.execute_query(&sql).await?;
        Ok(rows
            .first()
            .and_then(|r| r.first())
            .and_then(|c| c.as_deref())
            .and_then(|c| c.parse::<u64>().ok())
            .unwrap_or(0))
    }

    /// Ordered column metadata (spec §4.2 `DiscoverSchema`).
    async fn discover_schema(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SyncError>;

    /// Primary key columns, in declared order (spec §4.2
    /// `PrimaryKeyColumns`).
    async fn primary_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, SyncError>;

    /// Fetch one chunk of rows for the transfer loop (spec §4.1 Step 5 /
    /// §4.5 Fetcher stage). Default: build the engine-neutral
    /// cursor/offset `SELECT` and run it through `execute_query`. MongoDB
    /// overrides this since there is no SQL to build (spec §4.2 "MongoDB
    /// adapter is structurally different").
    async fn fetch_chunk(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        pk_strategy: PkStrategy,
        pk_columns: &[String],
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRow>, SyncError> {
        let sql = build_select_sql(schema, table, columns, pk_strategy, pk_columns, cursor, limit);
        self.execute_query(&sql).await
    }
}

/// Build the chunked extraction `SELECT` (spec §4.1 Step 5), shared by
/// every SQL adapter's default `fetch_chunk`.
pub fn build_select_sql(
    schema: &str,
    table: &str,
    columns: &[String],
    pk_strategy: PkStrategy,
    pk_columns: &[String],
    cursor: Option<&str>,
    chunk_size: usize,
) -> String {
    let column_list = columns.join(", ");

    match pk_strategy {
        PkStrategy::Pk => {
            let pk_list = pk_columns.join(", ");
            let where_clause = match cursor {
                Some(c) if !c.is_empty() => {
                    let parts: Vec<&str> = c.split('|').collect();
                    let quoted = parts
                        .iter()
                        .map(|p| format!("'{}'", p.replace('\'', "''")))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!(" WHERE ({pk_list}) > ({quoted})")
                }
                _ => String::new(),
            };
            format!(
                "SELECT {column_list} FROM {schema}.{table}{where_clause} ORDER BY {pk_list} ASC LIMIT {chunk_size}"
            )
        }
        PkStrategy::Offset | PkStrategy::Cdc => {
            format!("SELECT {column_list} FROM {schema}.{table} LIMIT {chunk_size}")
        }
    }
}

/// Truncate a cell to `MAX_CELL_BYTES`, returning whether truncation
/// occurred (so the caller can log it rather than silently corrupt the
/// row, per spec §4.2).
pub fn truncate_cell(value: String) -> (String, bool) {
    if value.len() <= MAX_CELL_BYTES {
        (value, false)
    } else {
        let mut end = MAX_CELL_BYTES;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        (value[..end].to_string(), true)
    }
}

/// Parse a permissive `KEY=VALUE` / `;`-separated connection string
/// (spec §6). Keys are matched case-sensitively per engine by the caller.
pub fn parse_connection_string(raw: &str) -> std::collections::HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Validate a port string, falling back to `default_port` on any parse
/// failure or out-of-range value (spec §4.2: ports validated 1..65535).
pub fn validate_port(raw: Option<&str>, default_port: u16) -> u16 {
    raw.and_then(|p| p.parse::<u32>().ok())
        .filter(|&p| (1..=65535).contains(&p))
        .map(|p| p as u16)
        .unwrap_or(default_port)
}

/// Open the adapter matching `engine`, dispatching to the concrete
/// per-engine implementation (spec §9 "per-engine polymorphism via
/// capability interface" — everything past this factory speaks only the
/// `SourceAdapter` trait).
pub async fn open_adapter(
    engine: DbEngine,
    connection_string: &str,
) -> Result<Box<dyn SourceAdapter>, SyncError> {
    Ok(match engine {
        DbEngine::MariaDb => Box::new(mariadb::MariaDbAdapter::open(connection_string).await?),
        DbEngine::Mssql => Box::new(mssql::MssqlAdapter::open(connection_string).await?),
        DbEngine::Oracle => Box::new(oracle::OracleAdapter::open(connection_string).await?),
        DbEngine::Postgres => Box::new(postgres::PostgresAdapter::open(connection_string).await?),
        DbEngine::MongoDb => Box::new(mongodb::MongoDbAdapter::open(connection_string).await?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connection_string() {
        let parsed = parse_connection_string("host=db1; port=5432 ;user=app ;password=secret");
        assert_eq!(parsed.get("host"), Some(&"db1".to_string()));
        assert_eq!(parsed.get("port"), Some(&"5432".to_string()));
        assert_eq!(parsed.get("user"), Some(&"app".to_string()));
    }

    #[test]
    fn test_parse_connection_string_ignores_unknown_and_malformed() {
        let parsed = parse_connection_string("host=db1;garbage;=novalue;port=1433");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("port"), Some(&"1433".to_string()));
    }

    #[test]
    fn test_validate_port_defaults_on_invalid() {
        assert_eq!(validate_port(Some("not-a-port"), 3306), 3306);
        assert_eq!(validate_port(Some("0"), 3306), 3306);
        assert_eq!(validate_port(Some("99999"), 3306), 3306);
        assert_eq!(validate_port(Some("3307"), 3306), 3307);
        assert_eq!(validate_port(None, 3306), 3306);
    }

    #[test]
    fn test_truncate_cell() {
        let (value, truncated) = truncate_cell("short".to_string());
        assert!(!truncated);
        assert_eq!(value, "short");

        let long = "x".repeat(MAX_CELL_BYTES + 100);
        let (value, truncated) = truncate_cell(long);
        assert!(truncated);
        assert_eq!(value.len(), MAX_CELL_BYTES);
    }

    #[test]
    fn test_build_select_sql_pk_strategy_seeds_from_cursor() {
        let sql = build_select_sql(
            "hr",
            "emp",
            &["id".into(), "name".into()],
            PkStrategy::Pk,
            &["id".into()],
            Some("3"),
            2,
        );
        assert!(sql.contains("WHERE (id) > ('3')"));
        assert!(sql.contains("ORDER BY id ASC LIMIT 2"));
    }

    #[test]
    fn test_build_select_sql_pk_strategy_no_cursor() {
        let sql = build_select_sql(
            "hr",
            "emp",
            &["id".into(), "name".into()],
            PkStrategy::Pk,
            &["id".into()],
            None,
            2,
        );
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn test_pg_type_inference() {
        let col = |t: &str| ColumnInfo {
            name: "c".into(),
            source_type: t.into(),
            nullable: true,
            pk: false,
            length: None,
            precision: None,
            scale: None,
            default: None,
        };
        assert_eq!(col("VARCHAR2").pg_type(), PgType::Text);
        assert_eq!(col("NUMBER").pg_type(), PgType::Numeric);
        assert_eq!(col("BIGINT").pg_type(), PgType::Bigint);
        assert_eq!(col("INT").pg_type(), PgType::Integer);
        assert_eq!(col("TIMESTAMP").pg_type(), PgType::Timestamp);
        assert_eq!(col("BLOB").pg_type(), PgType::Bytea);
    }
}
