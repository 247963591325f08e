//! CDC Consumer (C8) — reads ordered `ds_change_log` batches from a source
//! and applies them to the lake idempotently (spec §4.6).
//!
//! Grounded on `original_source/include/sync`'s per-engine sync classes,
//! which all keep a `lastChangeId`-style cursor and replay a change feed
//! into the lake via the same bulk-upsert path as a full load; this module
//! generalises that replay loop across engines via [`SourceAdapter`] instead
//! of one copy per engine.

use serde_json::Value as Json;
use tokio_postgres::Client;
use tracing::warn;

use crate::adapters::{self, ColumnInfo, SourceAdapter};
use crate::catalog::{CatalogEntry, CatalogStore, Status};
use crate::config::Config;
use crate::error::SyncError;
use crate::hash;
use crate::normalize::{normalize, NormalizedValue};
use crate::writer::BulkWriter;

/// One row of `datasync_metadata.ds_change_log` (spec §3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    fn parse(raw: &str) -> Result<Self, SyncError> {
        match raw {
            "I" => Ok(Operation::Insert),
            "U" => Ok(Operation::Update),
            "D" => Ok(Operation::Delete),
            other => Err(SyncError::InvalidArgument(format!("unknown CDC operation: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub change_id: i64,
    pub operation: Operation,
    pub pk_values: Json,
    pub row_data: Option<Json>,
}

/// Consumer for one catalog entry's CDC stream. Mirrors [`crate::orchestrator::Orchestrator`]'s
/// shape: borrows the catalog and lake for the duration of one call.
pub struct CdcConsumer<'a> {
    pub catalog: &'a CatalogStore,
    pub lake: &'a Client,
    pub config: &'a Config,
}

impl<'a> CdcConsumer<'a> {
    /// Drain every available batch for `entry`, advancing `last_change_id`
    /// after each batch is applied (spec §4.6 step 6-7). Returns the total
    /// number of upserted rows.
    pub async fn consume(&self, entry: &CatalogEntry) -> Result<u64, SyncError> {
        let source = adapters::open_adapter(entry.db_engine, &entry.connection_string).await?;
        self.consume_with_source(entry, source.as_ref()).await
    }

    async fn consume_with_source(
        &self,
        entry: &CatalogEntry,
        source: &dyn SourceAdapter,
    ) -> Result<u64, SyncError> {
        let schema = entry.schema_name.as_str();
        let table = entry.table_name.as_str();
        let chunk_size = self.config.chunk_size;
        let columns = source.discover_schema(schema, table).await?;

        let mut last_change_id = entry.last_change_id();
        let mut total_applied = 0u64;

        loop {
            let batch = self.fetch_batch(source, schema, table, last_change_id, chunk_size).await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();
            let max_id = batch.iter().map(|e| e.change_id).max().unwrap_or(last_change_id);

            let (deletes, upserts): (Vec<_>, Vec<_>) =
                batch.into_iter().partition(|e| e.operation == Operation::Delete);

            if !deletes.is_empty() {
                self.apply_deletes(schema, table, entry, &deletes).await?;
            }
            if !upserts.is_empty() {
                total_applied += self
                    .apply_upserts(source, schema, table, &columns, entry, upserts)
                    .await?;
            }

            // Advance strictly after the lake mutations above, never before
            // (spec §4.6 step 6: "never before, so that a crash replays at
            // worst the last batch").
            self.catalog
                .finish_cycle(
                    schema,
                    table,
                    entry.db_engine,
                    Status::ListeningChanges,
                    entry.last_processed_pk.as_deref(),
                    &serde_json::json!({ "last_change_id": max_id }),
                )
                .await?;
            last_change_id = max_id;

            if batch_len < chunk_size {
                break;
            }
        }

        Ok(total_applied)
    }

    async fn fetch_batch(
        &self,
        source: &dyn SourceAdapter,
        schema: &str,
        table: &str,
        last_change_id: i64,
        chunk_size: usize,
    ) -> Result<Vec<ChangeLogEntry>, SyncError> {
        let sql = format!(
            "SELECT change_id, operation, pk_values, row_data FROM datasync_metadata.ds_change_log \
             WHERE schema_name = '{schema}' AND table_name = '{table}' AND change_id > {last_change_id} \
             ORDER BY change_id LIMIT {chunk_size}"
        );
        let rows = source.execute_query(&sql).await?;
        rows.iter().map(parse_change_row).collect()
    }

    /// Delete rows addressed by `pk_values`. No-PK tables are skipped with
    /// a warning: the change log only carries the source's own hash for a
    /// deleted row, which was never reproduced on the lake side (the lake's
    /// `_hash` is recomputed from `row_data` on upsert, see
    /// [`Self::apply_upserts`]), so there is nothing to match against
    /// (spec §9 "no-PK CDC ... accepted limitation").
    async fn apply_deletes(
        &self,
        schema: &str,
        table: &str,
        entry: &CatalogEntry,
        deletes: &[ChangeLogEntry],
    ) -> Result<u64, SyncError> {
        if !entry.has_pk {
            warn!(schema, table, count = deletes.len(), "skipping no-PK CDC deletes, no reconstructable key");
            return Ok(0);
        }

        // Build one DELETE covering every row in this batch, OR-joining a
        // per-row AND predicate over the PK columns (mirrors
        // `orchestrator::delete_batch`'s shape).
        let mut predicates = Vec::new();
        for e in deletes {
            let mut and_clauses = Vec::new();
            let mut reconstructable = true;
            for col in &entry.pk_columns {
                match e.pk_values.get(col).and_then(json_scalar_to_string) {
                    Some(v) => and_clauses.push(format!("{} = '{}'", quote_ident(col), v.replace('\'', "''"))),
                    None => {
                        reconstructable = false;
                        break;
                    }
                }
            }
            if reconstructable && !and_clauses.is_empty() {
                predicates.push(format!("({})", and_clauses.join(" AND ")));
            } else {
                warn!(schema, table, change_id = e.change_id, "skipping delete with unreconstructable PK");
            }
        }

        if predicates.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM {}.{} WHERE {}",
            quote_ident(schema),
            quote_ident(table),
            predicates.join(" OR ")
        );
        self.lake
            .execute(&sql, &[])
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))
    }

    /// Apply a batch of inserts/updates via the bulk writer (spec §4.6 step
    /// 4-5). For no-PK tables, recomputes a `_hash` conflict target from
    /// the projected row rather than trusting the source's own hash, so
    /// repeated CDC replay of the same row is idempotent regardless of what
    /// hash algorithm the source-side trigger used.
    async fn apply_upserts(
        &self,
        source: &dyn SourceAdapter,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        entry: &CatalogEntry,
        upserts: Vec<ChangeLogEntry>,
    ) -> Result<u64, SyncError> {
        let mut rows = Vec::with_capacity(upserts.len());

        for change in upserts {
            let row_data = match change.row_data {
                Some(data) => data,
                None => match self.fetch_row_by_pk(source, schema, table, columns, &entry.pk_columns, &change.pk_values).await {
                    Some(data) => data,
                    None => {
                        warn!(schema, table, change_id = change.change_id, "could not reconstruct row, skipping");
                        continue;
                    }
                },
            };

            let mut values: Vec<Option<String>> = Vec::with_capacity(columns.len());
            for col in columns {
                let raw = row_data.get(&col.name).and_then(json_scalar_to_string);
                values.push(match normalize(raw.as_deref(), col.pg_type()) {
                    NormalizedValue::Null => None,
                    NormalizedValue::Value(v) => Some(v),
                });
            }

            if !entry.has_pk {
                let refs: Vec<Option<&str>> = values.iter().map(|v| v.as_deref()).collect();
                values.push(Some(hash::row_hash_multi(&refs).to_string()));
            }

            rows.push(values);
        }

        if rows.is_empty() {
            return Ok(0);
        }

        let mut column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let pk_columns = if entry.has_pk {
            entry.pk_columns.clone()
        } else {
            column_names.push("_hash".to_string());
            vec!["_hash".to_string()]
        };

        let writer = BulkWriter::new(self.lake, self.config);
        writer.bulk_upsert(schema, table, &column_names, &pk_columns, rows).await
    }

    /// Fallback fetch for upserts whose change-log row carries no
    /// `row_data` (spec §4.6 step 4). Only possible when the table has a
    /// reconstructable PK.
    async fn fetch_row_by_pk(
        &self,
        source: &dyn SourceAdapter,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        pk_columns: &[String],
        pk_values: &Json,
    ) -> Option<Json> {
        if pk_columns.is_empty() {
            return None;
        }

        let mut clauses = Vec::new();
        for col in pk_columns {
            let v = pk_values.get(col).and_then(json_scalar_to_string)?;
            clauses.push(format!("{col} = '{}'", v.replace('\'', "''")));
        }

        let column_list = columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT {column_list} FROM {schema}.{table} WHERE {}", clauses.join(" AND "));
        let rows = source.execute_query(&sql).await.ok()?;
        let row = rows.into_iter().next()?;

        let mut obj = serde_json::Map::new();
        for (col, val) in columns.iter().zip(row.into_iter()) {
            obj.insert(col.name.clone(), val.map(Json::String).unwrap_or(Json::Null));
        }
        Some(Json::Object(obj))
    }
}

fn parse_change_row(row: &Vec<Option<String>>) -> Result<ChangeLogEntry, SyncError> {
    let change_id: i64 = row
        .first()
        .and_then(|v| v.as_deref())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| SyncError::InternalError("ds_change_log row missing change_id".into()))?;
    let operation = row
        .get(1)
        .and_then(|v| v.as_deref())
        .ok_or_else(|| SyncError::InternalError("ds_change_log row missing operation".into()))
        .and_then(Operation::parse)?;
    let pk_values: Json = row
        .get(2)
        .and_then(|v| v.as_deref())
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or(Json::Object(Default::default()));
    let row_data: Option<Json> = row
        .get(3)
        .and_then(|v| v.as_deref())
        .and_then(|v| serde_json::from_str(v).ok());

    Ok(ChangeLogEntry {
        change_id,
        operation,
        pk_values,
        row_data,
    })
}

fn json_scalar_to_string(value: &Json) -> Option<String> {
    match value {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        Json::Bool(b) => Some(b.to_string()),
        Json::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// One-time DDL installing the change-log table (spec §6 "CDC table
/// `datasync_metadata.ds_change_log`"). Safe to run repeatedly.
pub fn change_log_table_setup_sql() -> &'static str {
    r#"
CREATE SCHEMA IF NOT EXISTS datasync_metadata;
CREATE TABLE IF NOT EXISTS datasync_metadata.ds_change_log (
    change_id BIGSERIAL PRIMARY KEY,
    change_time TIMESTAMPTZ NOT NULL DEFAULT now(),
    operation CHAR(1) NOT NULL CHECK (operation IN ('I', 'U', 'D')),
    schema_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    pk_values JSONB NOT NULL,
    row_data JSONB
);
CREATE INDEX IF NOT EXISTS ds_change_log_change_id_idx
    ON datasync_metadata.ds_change_log (schema_name, table_name, change_id);
CREATE INDEX IF NOT EXISTS ds_change_log_change_time_idx
    ON datasync_metadata.ds_change_log (schema_name, table_name, change_time);
"#
}

/// One-time DDL installing the trigger function + trigger for one
/// PostgreSQL-sourced table (spec §4.6 "Trigger setup"). MySQL/Oracle use a
/// binlog-equivalent or OCI-level capture mechanism instead of a SQL
/// trigger and are out of scope for this function (see DESIGN.md).
pub fn postgres_trigger_setup_sql(schema: &str, table: &str, pk_columns: &[String]) -> String {
    let pk_values_new = pk_values_expr(pk_columns, "NEW");
    let pk_values_old = pk_values_expr(pk_columns, "OLD");
    let function_name = format!("{schema}.ds_fn_{table}");
    let trigger_name = format!("ds_trg_{table}");

    format!(
        r#"
CREATE OR REPLACE FUNCTION {function_name}() RETURNS trigger AS $$
BEGIN
    IF TG_OP = 'DELETE' THEN
        INSERT INTO datasync_metadata.ds_change_log
            (operation, schema_name, table_name, pk_values, row_data)
        VALUES ('D', '{schema}', '{table}', {pk_values_old}, NULL);
        RETURN OLD;
    ELSIF TG_OP = 'UPDATE' THEN
        INSERT INTO datasync_metadata.ds_change_log
            (operation, schema_name, table_name, pk_values, row_data)
        VALUES ('U', '{schema}', '{table}', {pk_values_new}, to_jsonb(NEW));
        RETURN NEW;
    ELSE
        INSERT INTO datasync_metadata.ds_change_log
            (operation, schema_name, table_name, pk_values, row_data)
        VALUES ('I', '{schema}', '{table}', {pk_values_new}, to_jsonb(NEW));
        RETURN NEW;
    END IF;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS {trigger_name} ON {schema}.{table};
CREATE TRIGGER {trigger_name}
    AFTER INSERT OR UPDATE OR DELETE ON {schema}.{table}
    FOR EACH ROW EXECUTE FUNCTION {function_name}();
"#
    )
}

fn pk_values_expr(pk_columns: &[String], row_var: &str) -> String {
    if pk_columns.is_empty() {
        format!("jsonb_build_object('_hash', md5({row_var}::text))")
    } else {
        let pairs = pk_columns
            .iter()
            .map(|c| format!("'{c}', {row_var}.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("jsonb_build_object({pairs})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(change_id: &str, op: &str, pk: &str, data: Option<&str>) -> Vec<Option<String>> {
        vec![
            Some(change_id.to_string()),
            Some(op.to_string()),
            Some(pk.to_string()),
            data.map(|d| d.to_string()),
        ]
    }

    #[test]
    fn test_parse_change_row_insert() {
        let parsed = parse_change_row(&row("10", "I", r#"{"id":5}"#, Some(r#"{"id":5,"name":"Di"}"#))).unwrap();
        assert_eq!(parsed.change_id, 10);
        assert_eq!(parsed.operation, Operation::Insert);
        assert_eq!(parsed.pk_values, serde_json::json!({"id": 5}));
        assert!(parsed.row_data.is_some());
    }

    #[test]
    fn test_parse_change_row_delete_has_no_row_data() {
        let parsed = parse_change_row(&row("11", "D", r#"{"id":5}"#, None)).unwrap();
        assert_eq!(parsed.operation, Operation::Delete);
        assert!(parsed.row_data.is_none());
    }

    #[test]
    fn test_parse_change_row_rejects_unknown_operation() {
        assert!(parse_change_row(&row("1", "X", "{}", None)).is_err());
    }

    #[test]
    fn test_json_scalar_to_string() {
        assert_eq!(json_scalar_to_string(&Json::String("a".into())), Some("a".to_string()));
        assert_eq!(json_scalar_to_string(&Json::Bool(true)), Some("true".to_string()));
        assert_eq!(json_scalar_to_string(&Json::Null), None);
    }

    #[test]
    fn test_pk_values_expr_single_vs_composite() {
        let single = pk_values_expr(&["id".to_string()], "NEW");
        assert_eq!(single, "jsonb_build_object('id', NEW.id)");

        let composite = pk_values_expr(&["a".to_string(), "b".to_string()], "NEW");
        assert_eq!(composite, "jsonb_build_object('a', NEW.a, 'b', NEW.b)");
    }

    #[test]
    fn test_pk_values_expr_no_pk_uses_hash() {
        let expr = pk_values_expr(&[], "OLD");
        assert_eq!(expr, "jsonb_build_object('_hash', md5(OLD::text))");
    }

    #[test]
    fn test_trigger_setup_sql_contains_all_three_branches() {
        let sql = postgres_trigger_setup_sql("public", "accounts", &["id".to_string()]);
        assert!(sql.contains("TG_OP = 'DELETE'"));
        assert!(sql.contains("TG_OP = 'UPDATE'"));
        assert!(sql.contains("ds_trg_accounts"));
    }

    #[test]
    fn test_change_log_table_setup_sql_creates_expected_indexes() {
        let sql = change_log_table_setup_sql();
        assert!(sql.contains("ds_change_log_change_id_idx"));
        assert!(sql.contains("ds_change_log_change_time_idx"));
    }
}
