//! Bulk Writer (C4) — batched INSERT / INSERT…ON CONFLICT against the lake,
//! with error-class-specific recovery (spec §4.3).
//!
//! Grounded on `original_source/src/sync/DatabaseToPostgresSync.cpp`'s
//! `performBulkInsert`/`performBulkUpsert`, translated from build-a-string
//! literal SQL (the original quotes every value inline via `txn.quote`)
//! into the same shape using `tokio_postgres`.

use tokio_postgres::Client;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SyncError;

/// One row ready for the writer: already normalised values, `None` means
/// SQL `NULL`, in the same column order as the caller's `columns` list.
pub type Row = Vec<Option<String>>;

/// Hard cap on rows per statement (spec §4.3.1 `MAX_BATCH_SIZE`).
const MAX_BATCH_SIZE: usize = 5000;
/// Serialised query size cap, in bytes (spec §4.3.1 `MAX_QUERY_SIZE`).
const MAX_QUERY_SIZE: usize = 1024 * 1024;

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn render_value(value: &Option<String>) -> String {
    match value {
        None => "NULL".to_string(),
        Some(v) => quote_literal(v),
    }
}

/// Build the pipe-joined fingerprint for a row's PK columns, using
/// `<NULL>` as the sentinel for any NULL component (spec §4.3.3).
fn pk_fingerprint(row: &Row, pk_indices: &[usize]) -> String {
    pk_indices
        .iter()
        .map(|&i| row[i].as_deref().unwrap_or("<NULL>"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Collapse duplicate conflict targets within a batch, keeping the LAST
/// occurrence (spec §4.3.3 / §5 ordering guarantees — CDC replay on the
/// same PK must have the last `change_id` win). Rows with any NULL PK
/// component are dropped with a warning.
pub fn collapse_duplicates(rows: Vec<Row>, pk_indices: &[usize]) -> Vec<Row> {
    if pk_indices.is_empty() {
        return rows;
    }

    let mut order: Vec<String> = Vec::new();
    let mut last_by_key: std::collections::HashMap<String, Row> = std::collections::HashMap::new();

    for row in rows {
        if pk_indices.iter().any(|&i| row[i].is_none()) {
            warn!("dropping row with NULL primary-key component");
            continue;
        }
        let key = pk_fingerprint(&row, pk_indices);
        if !last_by_key.contains_key(&key) {
            order.push(key.clone());
        }
        last_by_key.insert(key, row);
    }

    order
        .into_iter()
        .filter_map(|key| last_by_key.remove(&key))
        .collect()
}

/// Split rows into sub-batches bounded by row count and estimated
/// serialised size (spec §4.3.1). `max_batch` is the configured
/// `chunk_size`, capped by `MAX_BATCH_SIZE` — the per-statement row count
/// must never exceed the configured batch size even when a caller (e.g.
/// CDC replay) hands over more rows than one extraction chunk would.
fn chunk_rows(rows: &[Row], columns: &[String], max_batch: usize) -> Vec<&[Row]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut size = 0usize;

    for (i, row) in rows.iter().enumerate() {
        let row_size: usize = row
            .iter()
            .map(|v| v.as_ref().map(|s| s.len() + 4).unwrap_or(4))
            .sum::<usize>()
            + columns.len();

        let would_exceed_size = size + row_size > MAX_QUERY_SIZE;
        let would_exceed_count = i - start >= max_batch;

        if (would_exceed_size || would_exceed_count) && i > start {
            chunks.push(&rows[start..i]);
            start = i;
            size = 0;
        }
        size += row_size;
    }
    if start < rows.len() {
        chunks.push(&rows[start..]);
    }
    chunks
}

pub struct BulkWriter<'a> {
    client: &'a Client,
    config: &'a Config,
}

impl<'a> BulkWriter<'a> {
    pub fn new(client: &'a Client, config: &'a Config) -> Self {
        Self { client, config }
    }

    async fn set_statement_timeout(&self) -> Result<(), SyncError> {
        self.client
            .batch_execute(&format!(
                "SET statement_timeout = {}",
                self.config.statement_timeout().as_millis()
            ))
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))
    }

    /// Configured rows-per-statement cap (spec §4.3.1: "row count per
    /// statement ≤ batchSize, default 1000, hard cap MAX_BATCH_SIZE").
    fn max_batch(&self) -> usize {
        self.config.chunk_size.min(MAX_BATCH_SIZE)
    }

    /// No-conflict-handling bulk insert, for tables with no usable PK.
    pub async fn bulk_insert(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: Vec<Row>,
    ) -> Result<u64, SyncError> {
        self.set_statement_timeout().await?;

        let mut total = 0u64;
        for chunk in chunk_rows(&rows, columns, self.max_batch()) {
            let sql = build_insert_sql(schema, table, columns, chunk, None);
            total += self.execute_with_recovery(schema, table, &sql, chunk, columns, None).await?;
        }
        Ok(total)
    }

    /// `INSERT … ON CONFLICT (pk) DO UPDATE SET …`. When `pk_columns` is
    /// empty, falls back to a plain insert (no PK) or, for no-PK CDC
    /// replay, the caller passes the synthetic `_hash` column as the
    /// conflict target instead.
    pub async fn bulk_upsert(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        pk_columns: &[String],
        rows: Vec<Row>,
    ) -> Result<u64, SyncError> {
        if pk_columns.is_empty() {
            return self.bulk_insert(schema, table, columns, rows).await;
        }

        self.set_statement_timeout().await?;

        let pk_indices: Vec<usize> = pk_columns
            .iter()
            .map(|pk| {
                columns
                    .iter()
                    .position(|c| c == pk)
                    .ok_or_else(|| SyncError::InvalidArgument(format!("pk column {pk} not in columns")))
            })
            .collect::<Result<_, _>>()?;

        let mut total = 0u64;
        for chunk in chunk_rows(&rows, columns, self.max_batch()) {
            let deduped = collapse_duplicates(chunk.to_vec(), &pk_indices);
            if deduped.is_empty() {
                continue;
            }
            let sql = build_insert_sql(schema, table, columns, &deduped, Some(pk_columns));
            total += self
                .execute_with_recovery(schema, table, &sql, &deduped, columns, Some(pk_columns))
                .await?;
        }
        Ok(total)
    }

    /// Execute `sql`, applying the three-class recovery policy on failure
    /// (spec §4.3.2). `rows`/`columns`/`pk_columns` are needed to rebuild
    /// per-row statements if isolation kicks in.
    async fn execute_with_recovery(
        &self,
        schema: &str,
        table: &str,
        sql: &str,
        rows: &[Row],
        columns: &[String],
        pk_columns: Option<&[String]>,
    ) -> Result<u64, SyncError> {
        match self.client.execute(sql, &[]).await {
            Ok(n) => Ok(n),
            Err(e) => {
                let msg = e.to_string();
                match SyncError::classify_pg_message(&msg) {
                    Some(SyncError::SchemaMismatch(_)) => {
                        self.relax_not_null(schema, table, &msg).await?;
                        self.client
                            .execute(sql, &[])
                            .await
                            .map_err(|e| SyncError::SchemaMismatch(e.to_string()))
                    }
                    Some(SyncError::TransactionAborted(_)) => {
                        warn!(schema, table, "transaction aborted, isolating rows");
                        self.client
                            .batch_execute("ROLLBACK")
                            .await
                            .map_err(|e| SyncError::ConnectionError(e.to_string()))
                            .ok();
                        self.insert_rows_isolated(
                            schema,
                            table,
                            columns,
                            pk_columns,
                            rows,
                            self.config.max_individual_row_retries,
                        )
                        .await
                    }
                    Some(SyncError::BadEncoding(_)) => {
                        warn!(schema, table, "bad encoding, isolating rows");
                        self.insert_rows_isolated(
                            schema,
                            table,
                            columns,
                            pk_columns,
                            rows,
                            self.config.max_binary_error_retries,
                        )
                        .await
                    }
                    _ => Err(SyncError::Transient(msg)),
                }
            }
        }
    }

    /// Parse `column "X"` substrings out of the PostgreSQL error message
    /// and drop NOT NULL on each (spec §4.3.2).
    async fn relax_not_null(&self, schema: &str, table: &str, message: &str) -> Result<(), SyncError> {
        let columns = parse_violating_columns(message);
        for column in columns {
            info!(schema, table, column = %column, "relaxing NOT NULL constraint");
            let sql = format!(
                "ALTER TABLE {}.{} ALTER COLUMN {} DROP NOT NULL",
                quote_ident(schema),
                quote_ident(table),
                quote_ident(&column)
            );
            self.client
                .batch_execute(&sql)
                .await
                .map_err(|e| SyncError::SchemaMismatch(e.to_string()))?;
        }
        Ok(())
    }

    /// Re-run each row in its own statement, bounded by `max_retries`
    /// total attempts across the whole batch. Rows that still fail after
    /// isolation are skipped, not fatal (spec §4.3.2).
    async fn insert_rows_isolated(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        pk_columns: Option<&[String]>,
        rows: &[Row],
        max_retries: u64,
    ) -> Result<u64, SyncError> {
        let mut applied = 0u64;
        let mut attempts = 0u64;

        for row in rows {
            if attempts >= max_retries {
                warn!(schema, table, "row isolation retry budget exhausted");
                break;
            }
            attempts += 1;
            let single = std::slice::from_ref(row);
            let sql = build_insert_sql(schema, table, columns, single, pk_columns);
            match self.client.execute(&sql, &[]).await {
                Ok(n) => applied += n,
                Err(e) => warn!(schema, table, error = %e, "skipping row after isolation failure"),
            }
        }
        Ok(applied)
    }
}

fn parse_violating_columns(message: &str) -> Vec<String> {
    let mut columns = Vec::new();
    let mut rest = message;
    while let Some(start) = rest.find("column \"") {
        let after = &rest[start + "column \"".len()..];
        if let Some(end) = after.find('"') {
            columns.push(after[..end].to_string());
            rest = &after[end + 1..];
        } else {
            break;
        }
    }
    columns
}

fn build_insert_sql(
    schema: &str,
    table: &str,
    columns: &[String],
    rows: &[Row],
    pk_columns: Option<&[String]>,
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let values_list = rows
        .iter()
        .map(|row| {
            let values = row.iter().map(render_value).collect::<Vec<_>>().join(", ");
            format!("({values})")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "INSERT INTO {}.{} ({column_list}) VALUES {values_list}",
        quote_ident(schema),
        quote_ident(table)
    );

    if let Some(pk_columns) = pk_columns {
        if !pk_columns.is_empty() {
            let conflict_target = pk_columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let set_clause = columns
                .iter()
                .filter(|c| !pk_columns.contains(c))
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            if set_clause.is_empty() {
                sql.push_str(&format!(" ON CONFLICT ({conflict_target}) DO NOTHING"));
            } else {
                sql.push_str(&format!(" ON CONFLICT ({conflict_target}) DO UPDATE SET {set_clause}"));
            }
        }
    }

    sql
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[Option<&str>]) -> Row {
        values.iter().map(|v| v.map(|s| s.to_string())).collect()
    }

    #[test]
    fn test_collapse_duplicates_keeps_last() {
        let rows = vec![row(&[Some("7"), Some("X")]), row(&[Some("7"), Some("Y")])];
        let collapsed = collapse_duplicates(rows, &[0]);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0][1], Some("Y".to_string()));
    }

    #[test]
    fn test_collapse_duplicates_drops_null_pk() {
        let rows = vec![row(&[None, Some("X")]), row(&[Some("1"), Some("Y")])];
        let collapsed = collapse_duplicates(rows, &[0]);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0][0], Some("1".to_string()));
    }

    #[test]
    fn test_collapse_duplicates_preserves_order_of_first_occurrence() {
        let rows = vec![
            row(&[Some("2"), Some("a")]),
            row(&[Some("1"), Some("b")]),
            row(&[Some("2"), Some("c")]),
        ];
        let collapsed = collapse_duplicates(rows, &[0]);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0][0], Some("2".to_string()));
        assert_eq!(collapsed[0][1], Some("c".to_string()));
        assert_eq!(collapsed[1][0], Some("1".to_string()));
    }

    #[test]
    fn test_build_insert_sql_no_conflict() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![row(&[Some("1"), Some("Ann")])];
        let sql = build_insert_sql("hr", "emp", &columns, &rows, None);
        assert!(sql.contains("INSERT INTO \"hr\".\"emp\""));
        assert!(sql.contains("(1, 'Ann')"));
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn test_build_insert_sql_with_conflict() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![row(&[Some("1"), None])];
        let pk = vec!["id".to_string()];
        let sql = build_insert_sql("hr", "emp", &columns, &rows, Some(&pk));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""));
        assert!(sql.contains("(1, NULL)"));
    }

    #[test]
    fn test_parse_violating_columns() {
        let msg = "null value in column \"name\" violates not-null constraint";
        assert_eq!(parse_violating_columns(msg), vec!["name".to_string()]);
    }

    #[test]
    fn test_chunk_rows_respects_batch_size() {
        let columns = vec!["id".to_string()];
        let rows: Vec<Row> = (0..MAX_BATCH_SIZE + 10)
            .map(|i| row(&[Some(Box::leak(i.to_string().into_boxed_str()))]))
            .collect();
        let chunks = chunk_rows(&rows, &columns, MAX_BATCH_SIZE);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].len() <= MAX_BATCH_SIZE);
    }

    #[test]
    fn test_chunk_rows_bounded_by_configured_chunk_size() {
        let columns = vec!["id".to_string()];
        let rows: Vec<Row> = (0..25).map(|i| row(&[Some(Box::leak(i.to_string().into_boxed_str()))])).collect();
        let chunks = chunk_rows(&rows, &columns, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }
}
