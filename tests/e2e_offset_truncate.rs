//! End-to-end scenario: OFFSET-strategy table with deletes truncates and
//! falls back to FULL_LOAD rather than reconciling in place (spec §8
//! scenario 3), since OFFSET pagination has no stable cursor to resume
//! a partial delete-aware pass from.

mod common;

use common::TestDb;
use lakesync::catalog::{CatalogStore, DbEngine, Status};
use lakesync::config::Config;
use lakesync::orchestrator::{CycleOutcome, Orchestrator};
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
async fn offset_table_with_deletes_truncates_to_full_load() {
    let db = TestDb::with_catalog().await;
    let lake_dsn = db.dsn(db.host_port().await);
    let source_dsn = db.create_source_database("srcdb3").await;

    let (source_client, source_conn) = tokio_postgres::connect(&source_dsn, NoTls).await.unwrap();
    tokio::spawn(source_conn);
    source_client
        .batch_execute(
            "CREATE SCHEMA hr; \
             CREATE TABLE hr.emp (id INT, name TEXT); \
             INSERT INTO hr.emp (id, name) VALUES (1,'Ann'), (3,'Ci');",
        )
        .await
        .unwrap();

    db.execute(
        "CREATE SCHEMA hr; \
         CREATE TABLE hr.emp (id INT, name TEXT); \
         INSERT INTO hr.emp (id, name) VALUES (1,'Ann'), (2,'Bo'), (3,'Ci');",
    )
    .await;

    db.insert_catalog_row(
        "hr",
        "emp",
        "PostgreSQL",
        &source_dsn,
        "LISTENING_CHANGES",
        "OFFSET",
        &[],
    )
    .await;

    let (catalog_client, conn) = tokio_postgres::connect(&lake_dsn, NoTls).await.unwrap();
    tokio::spawn(conn);
    let catalog = CatalogStore::new(catalog_client);
    let config = test_config(&lake_dsn);
    let entry = catalog.get("hr", "emp", DbEngine::Postgres).await.unwrap();

    let outcome = {
        let orchestrator = Orchestrator {
            catalog: &catalog,
            lake: &db.client,
            config: &config,
        };
        orchestrator.run_cycle(&entry).await.unwrap()
    };
    assert_eq!(outcome, CycleOutcome::FullLoadNextCycle);
    assert_eq!(db.count("hr.emp").await, 0);

    let updated = catalog.get("hr", "emp", DbEngine::Postgres).await.unwrap();
    assert_eq!(updated.status, Status::FullLoad);

    // Next cycle rebuilds the lake from the (now-deleted) source state.
    let entry = catalog.get("hr", "emp", DbEngine::Postgres).await.unwrap();
    let outcome = {
        let orchestrator = Orchestrator {
            catalog: &catalog,
            lake: &db.client,
            config: &config,
        };
        orchestrator.run_cycle(&entry).await.unwrap()
    };
    assert_eq!(outcome, CycleOutcome::ListeningChanges);

    let rows = db.client.query("SELECT id, name FROM hr.emp ORDER BY id", &[]).await.unwrap();
    let got: Vec<(i32, String)> = rows.iter().map(|r| (r.get(0), r.get(1))).collect();
    assert_eq!(got, vec![(1, "Ann".to_string()), (3, "Ci".to_string())]);
}
