//! End-to-end scenario: NOT NULL relaxation auto-recovery (spec §8
//! scenario 4). A target column declared NOT NULL receives a NULL value;
//! the first insert attempt fails, the writer drops the constraint, and
//! the retry succeeds.

mod common;

use common::TestDb;
use lakesync::config::Config;
use lakesync::writer::BulkWriter;

fn test_config() -> Config {
    toml::from_str(
        r#"
        catalog_dsn = "postgres://localhost/catalog"
        lake_dsn = "postgres://localhost/lake"
        "#,
    )
    .unwrap()
}

#[tokio::test]
async fn not_null_violation_triggers_column_relaxation_and_retry() {
    let db = TestDb::new().await;
    db.execute("CREATE SCHEMA hr; CREATE TABLE hr.emp (id INT PRIMARY KEY, name TEXT NOT NULL);")
        .await;

    let config = test_config();
    let writer = BulkWriter::new(&db.client, &config);

    let columns = vec!["id".to_string(), "name".to_string()];
    let pk_columns = vec!["id".to_string()];
    let rows = vec![vec![Some("4".to_string()), None]];

    let applied = writer
        .bulk_upsert("hr", "emp", &columns, &pk_columns, rows)
        .await
        .expect("upsert should recover from the NOT NULL violation");
    assert_eq!(applied, 1);

    let row = db.client.query_one("SELECT id, name FROM hr.emp WHERE id = 4", &[]).await.unwrap();
    let id: i32 = row.get(0);
    let name: Option<String> = row.get(1);
    assert_eq!(id, 4);
    assert_eq!(name, None);

    let is_nullable: String = db
        .client
        .query_one(
            "SELECT is_nullable FROM information_schema.columns \
             WHERE table_schema = 'hr' AND table_name = 'emp' AND column_name = 'name'",
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(is_nullable, "YES");
}
