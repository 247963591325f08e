//! End-to-end scenario: cold FULL_LOAD, single PK (spec §8 scenario 1).
//!
//! Two databases in one container stand in for a separate source and
//! lake — the orchestrator speaks only through `SourceAdapter`, so a
//! PostgreSQL-sourced table exercises the same state machine a
//! MariaDB/MSSQL/Oracle/MongoDB source would.

mod common;

use common::TestDb;
use lakesync::catalog::{CatalogStore, DbEngine, PkStrategy, Status};
use lakesync::config::Config;
use lakesync::orchestrator::{CycleOutcome, Orchestrator};
use tokio_postgres::NoTls;

fn test_config(catalog_dsn: &str, lake_dsn: &str) -> Config {
    toml::from_str(&format!(
        r#"
        catalog_dsn = "{catalog_dsn}"
        lake_dsn = "{lake_dsn}"
        chunk_size = 2
        "#
    ))
    .unwrap()
}

#[tokio::test]
async fn cold_full_load_single_pk() {
    let db = TestDb::with_catalog().await;
    let lake_dsn = db.dsn(db.host_port().await);
    let source_dsn = db.create_source_database("srcdb").await;

    let (source_client, source_conn) = tokio_postgres::connect(&source_dsn, NoTls).await.unwrap();
    tokio::spawn(source_conn);
    source_client
        .batch_execute(
            "CREATE SCHEMA hr; \
             CREATE TABLE hr.emp (id INT PRIMARY KEY, name TEXT); \
             INSERT INTO hr.emp (id, name) VALUES (1,'Ann'), (2,'Bo'), (3,'Ci');",
        )
        .await
        .unwrap();

    db.execute("CREATE SCHEMA hr; CREATE TABLE hr.emp (id INT PRIMARY KEY, name TEXT);").await;

    db.insert_catalog_row("hr", "emp", "PostgreSQL", &source_dsn, "FULL_LOAD", "PK", &["id"])
        .await;

    let (catalog_client, conn) = tokio_postgres::connect(&lake_dsn, NoTls).await.unwrap();
    tokio::spawn(conn);
    let catalog = CatalogStore::new(catalog_client);

    let config = test_config(&lake_dsn, &lake_dsn);
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
    assert_eq!(got, vec![(1, "Ann".to_string()), (2, "Bo".to_string()), (3, "Ci".to_string())]);

    let updated = catalog.get("hr", "emp", DbEngine::Postgres).await.unwrap();
    assert_eq!(updated.status, Status::ListeningChanges);
    assert_eq!(updated.pk_strategy, PkStrategy::Pk);
    assert_eq!(updated.last_processed_pk.as_deref(), Some("3"));
}
