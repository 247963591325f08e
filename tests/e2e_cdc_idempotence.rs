//! End-to-end scenario: CDC replay idempotence (spec §8 scenario 5).
//! Consuming the same `ds_change_log` slice twice must leave the lake
//! and `last_change_id` unchanged after the second run.

mod common;

use common::TestDb;
use lakesync::catalog::{CatalogStore, DbEngine};
use lakesync::cdc::{change_log_table_setup_sql, CdcConsumer};
use lakesync::config::Config;
use tokio_postgres::NoTls;

fn test_config(dsn: &str) -> Config {
    toml::from_str(&format!(
        r#"
        catalog_dsn = "{dsn}"
        lake_dsn = "{dsn}"
        chunk_size = 100
        "#
    ))
    .unwrap()
}

#[tokio::test]
async fn cdc_replay_is_idempotent() {
    let db = TestDb::with_catalog().await;
    let lake_dsn = db.dsn(db.host_port().await);
    let source_dsn = db.create_source_database("srcdb5").await;

    let (source_client, source_conn) = tokio_postgres::connect(&source_dsn, NoTls).await.unwrap();
    tokio::spawn(source_conn);
    source_client
        .batch_execute(
            "CREATE SCHEMA hr; \
             CREATE TABLE hr.emp (id INT PRIMARY KEY, name TEXT);",
        )
        .await
        .unwrap();
    source_client.batch_execute(change_log_table_setup_sql()).await.unwrap();
    source_client
        .execute(
            "INSERT INTO datasync_metadata.ds_change_log \
             (change_id, operation, schema_name, table_name, pk_values, row_data) VALUES \
             (10, 'I', 'hr', 'emp', '{\"id\":5}'::jsonb, '{\"id\":5,\"name\":\"Di\"}'::jsonb), \
             (11, 'U', 'hr', 'emp', '{\"id\":5}'::jsonb, '{\"id\":5,\"name\":\"De\"}'::jsonb)",
            &[],
        )
        .await
        .unwrap();

    db.execute("CREATE SCHEMA hr; CREATE TABLE hr.emp (id INT PRIMARY KEY, name TEXT);").await;

    db.insert_catalog_row(
        "hr",
        "emp",
        "PostgreSQL",
        &source_dsn,
        "LISTENING_CHANGES",
        "CDC",
        &["id"],
    )
    .await;
    db.client
        .execute(
            "UPDATE metadata.catalog SET sync_metadata = '{\"last_change_id\": 9}'::jsonb \
             WHERE schema_name = 'hr' AND table_name = 'emp'",
            &[],
        )
        .await
        .unwrap();

    let (catalog_client, conn) = tokio_postgres::connect(&lake_dsn, NoTls).await.unwrap();
    tokio::spawn(conn);
    let catalog = CatalogStore::new(catalog_client);
    let config = test_config(&lake_dsn);

    let entry = catalog.get("hr", "emp", DbEngine::Postgres).await.unwrap();
    assert_eq!(entry.last_change_id(), 9);

    let applied = {
        let consumer = CdcConsumer {
            catalog: &catalog,
            lake: &db.client,
            config: &config,
        };
        consumer.consume(&entry).await.unwrap()
    };
    assert_eq!(applied, 2);

    let row = db.client.query_one("SELECT id, name FROM hr.emp WHERE id = 5", &[]).await.unwrap();
    let name: String = row.get(1);
    assert_eq!(name, "De");

    let entry_after_first = catalog.get("hr", "emp", DbEngine::Postgres).await.unwrap();
    assert_eq!(entry_after_first.last_change_id(), 11);

    // Consuming the same slice again is a no-op: no new change_id rows
    // exist past 11, so the batch fetch returns empty immediately.
    let applied_again = {
        let consumer = CdcConsumer {
            catalog: &catalog,
            lake: &db.client,
            config: &config,
        };
        consumer.consume(&entry_after_first).await.unwrap()
    };
    assert_eq!(applied_again, 0);

    let row = db.client.query_one("SELECT id, name FROM hr.emp WHERE id = 5", &[]).await.unwrap();
    let name: String = row.get(1);
    assert_eq!(name, "De");

    let entry_final = catalog.get("hr", "emp", DbEngine::Postgres).await.unwrap();
    assert_eq!(entry_final.last_change_id(), 11);
}
