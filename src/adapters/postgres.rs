//! PostgreSQL source adapter.
//!
//! Connection parsing follows `tokio_postgres`'s own DSN grammar directly
//! (`host=… user=… password=… dbname=… port=…`) rather than the generic
//! `KEY=VALUE;` grammar — PostgreSQL's native libpq keyword/value format
//! already matches it closely enough that there's no separate dialect to
//! maintain (spec §4.2 "engine-specific SQL dialects ... are the only
//! place where adapters diverge").
//!
//! Cells are stringified before normalisation (C3) like every other
//! adapter, including when the source is PostgreSQL itself. Normalisation
//! is idempotent (P6), so running it uniformly here costs nothing and
//! keeps the orchestrator engine-agnostic rather than special-casing one
//! source.

use async_trait::async_trait;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row};

use crate::adapters::{truncate_cell, ColumnInfo, RawRow, SourceAdapter};
use crate::error::SyncError;

pub struct PostgresAdapter {
    client: Client,
}

#[async_trait]
impl SourceAdapter for PostgresAdapter {
    async fn open(connection_string: &str) -> Result<Self, SyncError> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "postgres source connection terminated");
            }
        });

        Ok(Self { client })
    }

    async fn test_connection(&self) -> Result<(), SyncError> {
        self.client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> Result<Vec<RawRow>, SyncError> {
        let rows = self
            .client
            .query(sql, &[])
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        Ok(rows.iter().map(row_to_raw_row).collect())
    }

    async fn discover_schema(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SyncError> {
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type, is_nullable, character_maximum_length, \
                 numeric_precision, numeric_scale, column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let pk_columns = self.primary_key_columns(schema, table).await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let name: String = r.get(0);
                ColumnInfo {
                    pk: pk_columns.contains(&name),
                    name,
                    source_type: r.get(1),
                    nullable: r.get::<_, String>(2) == "YES",
                    length: r.get::<_, Option<i32>>(3).map(|v| v as u32),
                    precision: r.get::<_, Option<i32>>(4).map(|v| v as u32),
                    scale: r.get::<_, Option<i32>>(5).map(|v| v as u32),
                    default: r.get(6),
                }
            })
            .collect())
    }

    async fn primary_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, SyncError> {
        let rows = self
            .client
            .query(
                "SELECT a.attname \
                 FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = (quote_ident($1) || '.' || quote_ident($2))::regclass \
                   AND i.indisprimary \
                 ORDER BY array_position(i.indkey, a.attnum)",
                &[&schema, &table],
            )
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }
}

fn row_to_raw_row(row: &Row) -> RawRow {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_cell_to_string(row, i, col.type_()).map(|v| truncate_cell(v).0))
        .collect()
}

fn pg_cell_to_string(row: &Row, i: usize, ty: &Type) -> Option<String> {
    match *ty {
        Type::TEXT | Type::VARCHAR | Type::BPCHAR => row.get::<_, Option<String>>(i),
        Type::INT2 => row.get::<_, Option<i16>>(i).map(|v| v.to_string()),
        Type::INT4 => row.get::<_, Option<i32>>(i).map(|v| v.to_string()),
        Type::INT8 => row.get::<_, Option<i64>>(i).map(|v| v.to_string()),
        Type::FLOAT4 => row.get::<_, Option<f32>>(i).map(|v| v.to_string()),
        Type::FLOAT8 => row.get::<_, Option<f64>>(i).map(|v| v.to_string()),
        Type::BOOL => row.get::<_, Option<bool>>(i).map(|v| v.to_string()),
        Type::TIMESTAMP => row
            .get::<_, Option<chrono::NaiveDateTime>>(i)
            .map(|v| v.to_string()),
        Type::TIMESTAMPTZ => row
            .get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)
            .map(|v| v.to_rfc3339()),
        Type::DATE => row.get::<_, Option<chrono::NaiveDate>>(i).map(|v| v.to_string()),
        Type::JSON | Type::JSONB => row
            .get::<_, Option<serde_json::Value>>(i)
            .map(|v| v.to_string()),
        _ => row.get::<_, Option<String>>(i),
    }
}

#[cfg(test)]
mod tests {
    // `PostgresAdapter` requires a live connection; covered by the
    // orchestrator's scenario tests against `testcontainers`.
}
