//! MariaDB/MySQL source adapter.
//!
//! Grounded on `original_source/include/sync/MariaDBToPostgres.h`'s
//! connection-string grammar (`host`/`user`/`password`/`db`/`port`,
//! default port 3306).

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, OptsBuilder, Pool};

use crate::adapters::{
    parse_connection_string, truncate_cell, validate_port, ColumnInfo, RawRow, SourceAdapter,
};
use crate::error::SyncError;

pub struct MariaDbAdapter {
    pool: Pool,
}

#[async_trait]
impl SourceAdapter for MariaDbAdapter {
    async fn open(connection_string: &str) -> Result<Self, SyncError> {
        let fields = parse_connection_string(connection_string);

        let host = fields
            .get("host")
            .ok_or_else(|| SyncError::InvalidArgument("MariaDB connection string missing host".into()))?;
        let db = fields
            .get("db")
            .ok_or_else(|| SyncError::InvalidArgument("MariaDB connection string missing db".into()))?;
        let user = fields
            .get("user")
            .ok_or_else(|| SyncError::InvalidArgument("MariaDB connection string missing user".into()))?;
        let password = fields.get("password").cloned().unwrap_or_default();
        let port = validate_port(fields.get("port").map(|s| s.as_str()), 3306);

        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(host.clone())
            .tcp_port(port)
            .user(Some(user.clone()))
            .pass(Some(password))
            .db_name(Some(db.clone()))
            .into();

        let pool = Pool::new(opts);
        Ok(Self { pool })
    }

    async fn test_connection(&self) -> Result<(), SyncError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;
        conn.query_drop("SELECT 1")
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))
    }

    async fn execute_query(&self, sql: &str) -> Result<Vec<RawRow>, SyncError> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

        let rows: Vec<mysql_async::Row> = conn
            .query(sql)
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| {
                        row.as_ref(i).and_then(|value| {
                            mysql_value_to_string(value).map(|v| truncate_cell(v).0)
                        })
                    })
                    .collect()
            })
            .collect())
    }

    async fn discover_schema(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SyncError> {
        let sql = format!(
            "SELECT column_name, data_type, is_nullable, column_key, \
             character_maximum_length, numeric_precision, numeric_scale, column_default \
             FROM information_schema.columns \
             WHERE table_schema = '{schema}' AND table_name = '{table}' \
             ORDER BY ordinal_position"
        );
        let rows = self.execute_query(&sql).await?;
        Ok(rows
            .into_iter()
            .map(|r| ColumnInfo {
                name: r[0].clone().unwrap_or_default(),
                source_type: r[1].clone().unwrap_or_default(),
                nullable: r[2].as_deref() == Some("YES"),
                pk: r[3].as_deref() == Some("PRI"),
                length: r[4].as_deref().and_then(|v| v.parse().ok()),
                precision: r[5].as_deref().and_then(|v| v.parse().ok()),
                scale: r[6].as_deref().and_then(|v| v.parse().ok()),
                default: r[7].clone(),
            })
            .collect())
    }

    async fn primary_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, SyncError> {
        let columns = self.discover_schema(schema, table).await?;
        Ok(columns
            .into_iter()
            .filter(|c| c.pk)
            .map(|c| c.name)
            .collect())
    }
}

fn mysql_value_to_string(value: &mysql_async::Value) -> Option<String> {
    use mysql_async::Value;
    match value {
        Value::NULL => None,
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Date(y, m, d, h, min, s, micro) => {
            Some(format!("{y:04}-{m:02}-{d:02} {h:02}:{min:02}:{s:02}.{micro:06}"))
        }
        Value::Time(neg, days, h, min, s, micro) => {
            let sign = if *neg { "-" } else { "" };
            Some(format!("{sign}{}:{min:02}:{s:02}.{micro:06}", *days as u32 * 24 + *h as u32))
        }
    }
}
