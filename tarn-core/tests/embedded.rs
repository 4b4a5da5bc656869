//! End-to-end checks against the in-process engine.

#![cfg(feature = "embedded")]

use serde_json::json;
use tarn_core::{
    Connection, EmbeddedEngine, Engine, EngineConfig, EngineFactory, ErrorKind, FileRegistration,
    CANONICAL_DATABASE,
};

async fn ready_engine() -> EmbeddedEngine {
    let engine = EmbeddedEngine::new(EngineConfig::in_memory());
    engine.initialize().await.unwrap();
    engine
}

#[tokio::test]
async fn executes_queries_on_the_worker_thread() {
    let engine = ready_engine().await;

    let rows = engine.execute("SELECT 42 AS answer", &[]).await.unwrap();
    assert_eq!(rows.row_count, 1);
    assert_eq!(rows.rows[0]["answer"], json!(42));
    assert_eq!(rows.columns[0].name, "answer");
    assert!(rows.query_time_ms.is_some());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn initialize_twice_is_a_no_op() {
    let engine = ready_engine().await;
    engine.initialize().await.unwrap();
    assert!(engine.is_ready());
    engine.shutdown().await.unwrap();
    assert!(!engine.is_ready());
}

#[tokio::test]
async fn parameters_bind_through_prepared_execution() {
    let engine = ready_engine().await;

    let rows = engine
        .execute("SELECT ? + 1 AS v", &[json!(41)])
        .await
        .unwrap();
    assert_eq!(rows.rows[0]["v"], json!(42));

    let rows = engine
        .execute("SELECT upper(?) AS shouted", &[json!("quiet")])
        .await
        .unwrap();
    assert_eq!(rows.rows[0]["shouted"], json!("QUIET"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn streams_yield_the_whole_result_as_one_batch() {
    let engine = ready_engine().await;

    let mut stream = engine
        .stream("SELECT * FROM range(5)", &[])
        .await
        .unwrap();

    let batch = stream.next().await.unwrap().unwrap();
    assert_eq!(batch.num_rows(), 5);
    assert!(stream.next().await.is_none());
    assert!(!stream.is_closed());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn connections_share_the_database_but_not_the_session() {
    let engine = ready_engine().await;

    let mut writer = engine.create_connection().await.unwrap();
    let mut reader = engine.create_connection().await.unwrap();
    assert_ne!(writer.id().as_str(), reader.id().as_str());

    writer
        .execute(
            "CREATE TABLE people(id INTEGER, name VARCHAR)",
            &[],
        )
        .await
        .unwrap();
    writer
        .execute("INSERT INTO people VALUES (1, 'ada'), (2, 'lin')", &[])
        .await
        .unwrap();

    let rows = reader
        .execute("SELECT count(*) AS n FROM people", &[])
        .await
        .unwrap();
    assert_eq!(rows.rows[0]["n"], json!(2));

    writer.close().await.unwrap();
    reader.close().await.unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn prepared_statements_survive_multiple_executions() {
    let engine = ready_engine().await;
    let mut conn = engine.create_connection().await.unwrap();

    let statement = conn.prepare("SELECT ? * 2 AS doubled").await.unwrap();
    assert_eq!(statement.query(&[json!(21)]).await.unwrap().rows[0]["doubled"], json!(42));
    assert_eq!(statement.query(&[json!(5)]).await.unwrap().rows[0]["doubled"], json!(10));

    statement.close().await.unwrap();
    statement.close().await.unwrap();

    let error = statement.query(&[json!(1)]).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Query);

    conn.close().await.unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn query_errors_carry_the_sql_and_classification() {
    let engine = ready_engine().await;

    let error = engine
        .execute("SELECT FROM nowhere_at_all", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        error.kind(),
        ErrorKind::Query | ErrorKind::Catalog
    ));
    assert_eq!(error.sql().is_some(), error.kind() == ErrorKind::Query);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn path_registrations_are_rejected_handles_are_tracked() {
    let engine = ready_engine().await;

    let error = engine
        .register_file(FileRegistration::path("raw", "/tmp/raw.csv"))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::File);

    let handle_path = std::env::temp_dir().join("tarn-embedded-handle-test.csv");
    std::fs::write(&handle_path, "a,b\n1,2\n").unwrap();
    let file = std::fs::File::open(&handle_path).unwrap();

    engine
        .register_file(FileRegistration::handle("upload", file))
        .await
        .unwrap();

    let files = engine.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "upload");

    engine.drop_file("upload").await.unwrap();
    assert!(engine.list_files().await.unwrap().is_empty());

    let error = engine.drop_file("upload").await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::File);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn pools_run_queries_end_to_end() {
    let engine = ready_engine().await;

    let pool = engine.create_pool(Some(3)).await.unwrap();
    assert_eq!(pool.options().max_size, 3);

    let rows = pool.query("SELECT 1 AS one").await.unwrap();
    assert_eq!(rows.rows[0]["one"], json!(1));

    let stats = pool.stats().await;
    assert!(stats.created >= 1);
    assert_eq!(stats.acquired, stats.released);

    pool.close().await;
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn catalog_normalizes_the_system_database() {
    let engine = ready_engine().await;

    engine
        .execute("CREATE TABLE trips(id BIGINT, fare DOUBLE)", &[])
        .await
        .unwrap();

    let model = engine.catalog().await.unwrap();
    let database = model.get(CANONICAL_DATABASE).expect("canonical database");

    let objects: Vec<&str> = database
        .schemas
        .iter()
        .flat_map(|schema| schema.objects.iter().map(|o| o.name.as_str()))
        .collect();
    assert!(objects.contains(&"trips"));

    let databases = engine.databases().await.unwrap();
    assert!(databases.iter().any(|name| name == CANONICAL_DATABASE));

    let tables = engine.tables(CANONICAL_DATABASE).await.unwrap();
    assert!(tables.iter().any(|name| name == "trips"));

    let columns = engine
        .columns(CANONICAL_DATABASE, "trips")
        .await
        .unwrap();
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0].name, "id");
    assert_eq!(columns[0].logical_type, "BIGINT");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn checkpoint_succeeds_in_memory() {
    let engine = ready_engine().await;
    engine.checkpoint().await.unwrap();
    assert!(engine.list_extensions().await.unwrap().is_empty());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn factory_caches_embedded_engines() {
    let factory = EngineFactory::new();

    let first = factory.create(EngineConfig::in_memory()).await.unwrap();
    let second = factory.create(EngineConfig::in_memory()).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    factory.destroy_all().await;
    assert!(!factory.is_cached(&EngineConfig::in_memory()).await);
}
