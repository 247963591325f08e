//! MongoDB source adapter — structurally different from the SQL adapters
//! (spec §4.2 "MongoDB adapter is structurally different"): there is no
//! SQL, the field set is discovered by sampling documents, and only
//! `FULL_LOAD` is meaningful.
//!
//! Grounded on `original_source/src/sync/MongoDBToPostgres.cpp`'s
//! `discoverCollectionFields` (sampling, always seeds `_id`) and
//! `shouldSyncCollection` (24h reload gate).

use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures_util::stream::TryStreamExt;
use mongodb::{options::FindOptions, Client};

use crate::adapters::{parse_connection_string, truncate_cell, ColumnInfo, RawRow, SourceAdapter};
use crate::catalog::PkStrategy;
use crate::error::SyncError;

/// Up to this many documents are sampled for field discovery (spec
/// §4.2).
const SAMPLE_SIZE: i64 = 100;

/// Minimum interval between reloads of a Mongo collection (spec §4.2).
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Reserved column carrying any unrecognised or nested field as JSON.
pub const DOCUMENT_COLUMN: &str = "_document";

pub struct MongoDbAdapter {
    client: Client,
}

/// Whether a Mongo collection should be (re)loaded, given the last sync
/// time recorded in the catalog (spec §4.2: "a TRUNCATE-then-reload runs
/// at most once per 24 hours").
pub fn should_reload(last_sync_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_sync_time {
        None => true,
        Some(last) => now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO) >= RELOAD_INTERVAL,
    }
}

/// Map a BSON value's dynamic type to the normalisation target type name,
/// matching `original_source`'s Mongo `dataTypeMap`.
pub fn mongo_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::String(_) => "TEXT",
        Bson::Int32(_) => "INTEGER",
        Bson::Int64(_) => "BIGINT",
        Bson::Double(_) | Bson::Decimal128(_) => "NUMERIC",
        Bson::Boolean(_) => "BOOLEAN",
        Bson::DateTime(_) => "TIMESTAMP",
        Bson::ObjectId(_) => "TEXT",
        Bson::Array(_) | Bson::Document(_) => "JSONB",
        Bson::Binary(_) => "BYTEA",
        Bson::Null => "TEXT",
        _ => "JSONB",
    }
}

fn bson_scalar_to_string(value: &Bson) -> Option<String> {
    match value {
        Bson::Null => None,
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(i) => Some(i.to_string()),
        Bson::Int64(i) => Some(i.to_string()),
        Bson::Double(d) => Some(d.to_string()),
        Bson::Decimal128(d) => Some(d.to_string()),
        Bson::Boolean(b) => Some(b.to_string()),
        Bson::DateTime(dt) => Some(dt.to_chrono().to_rfc3339()),
        Bson::ObjectId(id) => Some(id.to_hex()),
        other => Some(serde_json::to_string(&bson_to_json(other)).unwrap_or_default()),
    }
}

fn bson_to_json(value: &Bson) -> serde_json::Value {
    serde_json::to_value(value.clone()).unwrap_or(serde_json::Value::Null)
}

/// Keyset-pagination filter for a collection scan: `{_id: {$gt: cursor}}`
/// once a cursor is established, matching the SQL adapters' `WHERE (pk) >
/// (cursor)` (spec §4.1 Step 5). An unparseable or absent cursor means
/// "start from the beginning".
fn cursor_filter(cursor: Option<&str>) -> Document {
    match cursor.and_then(|c| ObjectId::parse_str(c).ok()) {
        Some(oid) => doc! { "_id": { "$gt": oid } },
        None => Document::new(),
    }
}

/// Discover the scalar field set from a sample of documents, always
/// seeding `_id` first (spec §4.2 / `discoverCollectionFields`). Nested
/// objects/arrays are not promoted to their own columns; they, along
/// with any field absent from the sample, are collapsed under
/// [`DOCUMENT_COLUMN`].
pub fn discover_fields(sample: &[Document]) -> Vec<String> {
    let mut fields = vec!["_id".to_string()];
    for doc in sample {
        for (key, value) in doc {
            if key == "_id" || fields.contains(key) {
                continue;
            }
            if matches!(value, Bson::Document(_) | Bson::Array(_)) {
                continue;
            }
            fields.push(key.clone());
        }
    }
    fields
}

/// Project one document onto the discovered scalar field set plus the
/// catch-all `_document` JSON column, which carries every field not in
/// `fields` (nested objects, arrays, and fields absent from the sample).
pub fn project_document(doc: &Document, fields: &[String]) -> RawRow {
    let mut row: RawRow = fields
        .iter()
        .map(|f| doc.get(f).and_then(bson_scalar_to_string).map(|v| truncate_cell(v).0))
        .collect();

    let mut leftover = Document::new();
    for (key, value) in doc {
        if !fields.contains(key) {
            leftover.insert(key.clone(), value.clone());
        }
    }
    row.push(if leftover.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&bson_to_json(&Bson::Document(leftover))).unwrap_or_default())
    });

    row
}

impl MongoDbAdapter {
    /// Sample up to `SAMPLE_SIZE` documents from `schema.table` (database
    /// = schema, collection = table) and return the discovered field set
    /// plus the reserved document column.
    pub async fn discover_collection_fields(&self, database: &str, collection: &str) -> Result<Vec<String>, SyncError> {
        let coll = self.client.database(database).collection::<Document>(collection);
        let mut cursor = coll
            .find(Document::new())
            .with_options(FindOptions::builder().limit(SAMPLE_SIZE).build())
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let mut sample = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?
        {
            sample.push(doc);
        }

        let mut fields = discover_fields(&sample);
        fields.push(DOCUMENT_COLUMN.to_string());
        Ok(fields)
    }
}

#[async_trait]
impl SourceAdapter for MongoDbAdapter {
    async fn open(connection_string: &str) -> Result<Self, SyncError> {
        // Mongo connection strings are already `mongodb://...` URIs; the
        // permissive KEY=VALUE grammar is only consulted for a bare
        // host/port override, matching this adapter's narrower needs.
        let uri = if connection_string.starts_with("mongodb://") || connection_string.starts_with("mongodb+srv://") {
            connection_string.to_string()
        } else {
            let fields = parse_connection_string(connection_string);
            let host = fields
                .get("host")
                .ok_or_else(|| SyncError::InvalidArgument("MongoDB connection string missing host".into()))?;
            let port = fields.get("port").map(|s| s.as_str()).unwrap_or("27017");
            format!("mongodb://{host}:{port}")
        };

        let client = Client::with_uri_str(&uri)
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(Self { client })
    }

    async fn test_connection(&self) -> Result<(), SyncError> {
        self.client
            .list_database_names()
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        Ok(())
    }

    /// Not used for Mongo: rows come from `discover_collection_fields` +
    /// direct collection scans in the orchestrator, not ad hoc SQL.
    async fn execute_query(&self, _sql: &str) -> Result<Vec<RawRow>, SyncError> {
        Err(SyncError::InvalidArgument(
            "MongoDB adapter does not support ad hoc query execution".into(),
        ))
    }

    async fn discover_schema(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SyncError> {
        let fields = self.discover_collection_fields(schema, table).await?;
        Ok(fields
            .into_iter()
            .map(|name| {
                let pk = name == "_id";
                let is_document = name == DOCUMENT_COLUMN;
                ColumnInfo {
                    source_type: if is_document {
                        "object".to_string()
                    } else if pk {
                        "objectId".to_string()
                    } else {
                        "string".to_string()
                    },
                    nullable: !pk,
                    pk,
                    length: None,
                    precision: None,
                    scale: None,
                    default: None,
                    name,
                }
            })
            .collect())
    }

    async fn primary_key_columns(&self, _schema: &str, _table: &str) -> Result<Vec<String>, SyncError> {
        Ok(vec!["_id".to_string()])
    }

    /// Exact count (spec §4.1 Step 0 needs an exact comparison against the
    /// lake, not the estimate `estimatedDocumentCount` would give).
    async fn count(&self, schema: &str, table: &str) -> Result<u64, SyncError> {
        let coll = self.client.database(schema).collection::<Document>(table);
        coll.count_documents(Document::new())
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))
    }

    /// Collection scan in `_id` order, keyset-paginated the same way the
    /// SQL adapters paginate on their PK (spec §4.1 Step 5). `columns` is
    /// whatever `discover_schema` returned, so it already carries the
    /// reserved [`DOCUMENT_COLUMN`] projection target.
    async fn fetch_chunk(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        _pk_strategy: PkStrategy,
        _pk_columns: &[String],
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRow>, SyncError> {
        let coll = self.client.database(schema).collection::<Document>(table);

        let filter = cursor_filter(cursor);
        let options = FindOptions::builder()
            .sort(doc! { "_id": 1 })
            .limit(limit as i64)
            .build();

        let mut cursor = coll
            .find(filter)
            .with_options(options)
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        let mut rows = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?
        {
            rows.push(project_document(&doc, columns));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc(pairs: &[(&str, Bson)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone());
        }
        d
    }

    #[test]
    fn test_discover_fields_always_seeds_id() {
        let sample = vec![doc(&[("name", Bson::String("Ann".into()))])];
        let fields = discover_fields(&sample);
        assert_eq!(fields[0], "_id");
        assert!(fields.contains(&"name".to_string()));
    }

    #[test]
    fn test_discover_fields_skips_nested() {
        let nested = Bson::Document(doc(&[("a", Bson::Int32(1))]));
        let sample = vec![doc(&[("name", Bson::String("Ann".into())), ("meta", nested)])];
        let fields = discover_fields(&sample);
        assert!(!fields.contains(&"meta".to_string()));
    }

    #[test]
    fn test_project_document_collapses_leftover_into_document_column() {
        let fields = vec!["_id".to_string(), "name".to_string(), DOCUMENT_COLUMN.to_string()];
        let d = doc(&[
            ("_id", Bson::String("abc".into())),
            ("name", Bson::String("Ann".into())),
            ("extra", Bson::Int32(7)),
        ]);
        let row = project_document(&d, &fields);
        assert_eq!(row[0], Some("abc".to_string()));
        assert_eq!(row[1], Some("Ann".to_string()));
        assert!(row[2].is_some());
        assert!(row[2].as_ref().unwrap().contains("extra"));
    }

    #[test]
    fn test_should_reload_gate() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        assert!(should_reload(None, now));

        let recent = now - chrono::Duration::hours(1);
        assert!(!should_reload(Some(recent), now));

        let stale = now - chrono::Duration::hours(25);
        assert!(should_reload(Some(stale), now));
    }

    #[test]
    fn test_cursor_filter_empty_without_cursor() {
        assert_eq!(cursor_filter(None), Document::new());
        assert_eq!(cursor_filter(Some("not-an-oid")), Document::new());
    }

    #[test]
    fn test_cursor_filter_seeds_gt_from_valid_oid() {
        let oid = ObjectId::new();
        let filter = cursor_filter(Some(&oid.to_hex()));
        assert_eq!(filter, doc! { "_id": { "$gt": oid } });
    }

    #[test]
    fn test_mongo_type_map() {
        assert_eq!(mongo_type_name(&Bson::String("x".into())), "TEXT");
        assert_eq!(mongo_type_name(&Bson::Int32(1)), "INTEGER");
        assert_eq!(mongo_type_name(&Bson::Int64(1)), "BIGINT");
        assert_eq!(mongo_type_name(&Bson::Boolean(true)), "BOOLEAN");
        assert_eq!(mongo_type_name(&Bson::Array(vec![])), "JSONB");
    }
}
