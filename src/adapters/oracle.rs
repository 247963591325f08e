//! Oracle source adapter, via ODBC.
//!
//! No common pure-Rust Oracle driver appears anywhere in the reference
//! pack; `odbc-api` (used for generic ODBC sources elsewhere in the pack)
//! stands in, driven by an Oracle Instant Client ODBC driver configured
//! outside this crate. Connection-string grammar follows
//! `original_source`'s Oracle TNS-ish fields (`service`/`host`/`port`).
//!
//! Grounded on `original_source/src/sync/OracleToPostgres.cpp`'s
//! `dataTypeMap` (NUMBER→NUMERIC, VARCHAR2/VARCHAR→VARCHAR,
//! CLOB/NCLOB/LONG→TEXT, BLOB/RAW/LONG RAW/BFILE→BYTEA, DATE/TIMESTAMP→
//! TIMESTAMP, JSON→JSONB).

use std::sync::OnceLock;

use async_trait::async_trait;
use odbc_api::{buffers::TextRowSet, Cursor, Environment, ResultSetMetadata};

use crate::adapters::{parse_connection_string, truncate_cell, validate_port, ColumnInfo, RawRow, SourceAdapter};
use crate::error::SyncError;

fn odbc_environment() -> &'static Environment {
    static ENV: OnceLock<Environment> = OnceLock::new();
    ENV.get_or_init(|| Environment::new().expect("failed to initialise ODBC environment"))
}

/// Oracle NUMBER/VARCHAR2/CLOB/etc → PostgreSQL target type mapping.
pub fn oracle_type_map(source_type: &str) -> &'static str {
    match source_type.to_ascii_uppercase().as_str() {
        "NUMBER" => "NUMERIC",
        "VARCHAR2" | "VARCHAR" | "NVARCHAR2" | "CHAR" | "NCHAR" => "VARCHAR",
        "CLOB" | "NCLOB" | "LONG" => "TEXT",
        "BLOB" | "RAW" | "LONG RAW" | "BFILE" => "BYTEA",
        "DATE" | "TIMESTAMP" => "TIMESTAMP",
        "JSON" => "JSONB",
        _ => "TEXT",
    }
}

pub struct OracleAdapter {
    connection_string: String,
}

#[async_trait]
impl SourceAdapter for OracleAdapter {
    async fn open(connection_string: &str) -> Result<Self, SyncError> {
        let fields = parse_connection_string(connection_string);
        let host = fields
            .get("host")
            .ok_or_else(|| SyncError::InvalidArgument("Oracle connection string missing host".into()))?;
        let service = fields
            .get("service")
            .ok_or_else(|| SyncError::InvalidArgument("Oracle connection string missing service".into()))?;
        let port = validate_port(fields.get("port").map(|s| s.as_str()), 1521);
        let user = fields.get("user").cloned().unwrap_or_default();
        let password = fields.get("password").cloned().unwrap_or_default();

        let odbc_conn_string = format!(
            "Driver={{Oracle}};Host={host};Port={port};Service Name={service};Uid={user};Pwd={password};"
        );

        // Probe the connection eagerly so `open` fails fast, matching the
        // other adapters' early-fail-on-connect contract.
        odbc_environment()
            .connect_with_connection_string(&odbc_conn_string, Default::default())
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

        Ok(Self {
            connection_string: odbc_conn_string,
        })
    }

    async fn test_connection(&self) -> Result<(), SyncError> {
        let query = self.connection_string.clone();
        tokio::task::spawn_blocking(move || {
            let conn = odbc_environment()
                .connect_with_connection_string(&query, Default::default())
                .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
            conn.execute("SELECT 1 FROM DUAL", ())
                .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
            Ok::<(), SyncError>(())
        })
        .await
        .map_err(|e| SyncError::InternalError(e.to_string()))?
    }

    async fn execute_query(&self, sql: &str) -> Result<Vec<RawRow>, SyncError> {
        let conn_string = self.connection_string.clone();
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<RawRow>, SyncError> {
            let conn = odbc_environment()
                .connect_with_connection_string(&conn_string, Default::default())
                .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

            let mut cursor = conn
                .execute(&sql, ())
                .map_err(|e| SyncError::Transient(e.to_string()))?
                .ok_or_else(|| SyncError::Transient("query returned no result set".into()))?;

            let num_cols = cursor
                .num_result_cols()
                .map_err(|e| SyncError::Transient(e.to_string()))? as usize;

            let mut buffers = TextRowSet::for_cursor(1000, &mut cursor, Some(MAX_TEXT_COL_SIZE))
                .map_err(|e| SyncError::Transient(e.to_string()))?;
            let mut row_set_cursor = cursor
                .bind_buffer(&mut buffers)
                .map_err(|e| SyncError::Transient(e.to_string()))?;

            let mut rows = Vec::new();
            while let Some(batch) = row_set_cursor
                .fetch()
                .map_err(|e| SyncError::Transient(e.to_string()))?
            {
                for row_index in 0..batch.num_rows() {
                    let row: RawRow = (0..num_cols)
                        .map(|col| {
                            batch
                                .at_as_str(col, row_index)
                                .ok()
                                .flatten()
                                .map(|s| truncate_cell(s.to_string()).0)
                        })
                        .collect();
                    rows.push(row);
                }
            }
            Ok(rows)
        })
        .await
        .map_err(|e| SyncError::InternalError(e.to_string()))?
    }

    async fn discover_schema(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SyncError> {
        let sql = format!(
            "SELECT column_name, data_type, nullable, data_length, data_precision, data_scale, data_default \
             FROM all_tab_columns \
             WHERE owner = '{}' AND table_name = '{}' \
             ORDER BY column_id",
            schema.to_ascii_uppercase(),
            table.to_ascii_uppercase()
        );
        let rows = self.execute_query(&sql).await?;
        let pk_columns = self.primary_key_columns(schema, table).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let name = r[0].clone().unwrap_or_default();
                ColumnInfo {
                    pk: pk_columns.contains(&name),
                    name,
                    source_type: r[1].clone().unwrap_or_default(),
                    nullable: r[2].as_deref() == Some("Y"),
                    length: r[3].as_deref().and_then(|v| v.parse().ok()),
                    precision: r[4].as_deref().and_then(|v| v.parse().ok()),
                    scale: r[5].as_deref().and_then(|v| v.parse().ok()),
                    default: r[6].clone(),
                }
            })
            .collect())
    }

    async fn primary_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, SyncError> {
        let sql = format!(
            "SELECT cols.column_name \
             FROM all_constraints cons, all_cons_columns cols \
             WHERE cons.constraint_type = 'P' \
               AND cons.constraint_name = cols.constraint_name \
               AND cons.owner = cols.owner \
               AND cons.owner = '{}' AND cons.table_name = '{}' \
             ORDER BY cols.position",
            schema.to_ascii_uppercase(),
            table.to_ascii_uppercase()
        );
        let rows = self.execute_query(&sql).await?;
        Ok(rows.into_iter().filter_map(|r| r[0].clone()).collect())
    }
}

const MAX_TEXT_COL_SIZE: usize = super::MAX_CELL_BYTES;
