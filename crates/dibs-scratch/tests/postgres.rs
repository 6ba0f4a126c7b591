//! Workspace lifecycle against a real PostgreSQL.
//!
//! Run with: cargo nextest run -p dibs-scratch --test postgres --run-ignored all
//!
//! Note: Requires Docker to be running.

use std::sync::Arc;
use std::time::Duration;

use dibs_scratch::pg::{PgAdvisoryLock, PgInstance};
use dibs_scratch::{DistributedLock, Error, Instance, Options, TempSchema};
use dockside::{Container, containers};
use tokio_postgres::{Client, NoTls};

/// Start a PostgreSQL container and build an instance pointing at it.
async fn setup_postgres() -> (Container, Arc<PgInstance>, Client) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let container = Container::run(containers::postgres("16-alpine", "test"))
        .expect("failed to start postgres container");
    container
        .wait_for_log(
            "database system is ready to accept connections",
            Duration::from_secs(30),
        )
        .expect("postgres did not become ready");
    let port = container
        .wait_for_port(5432, Duration::from_secs(10))
        .expect("postgres port not available");

    let conn_str = format!("host=127.0.0.1 port={port} user=postgres password=test");

    // postgres may not be fully ready even after the port is open
    let mut attempts = 0;
    let (client, connection) = loop {
        attempts += 1;
        match tokio_postgres::connect(&conn_str, NoTls).await {
            Ok(result) => break result,
            Err(e) if attempts < 10 => {
                tracing::debug!("connection attempt {attempts} failed: {e}, retrying...");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => panic!("failed to connect to postgres after {attempts} attempts: {e}"),
        }
    };
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection error: {e}");
        }
    });

    let instance = PgInstance::from_url(&conn_str).expect("invalid connection string");
    (container, Arc::new(instance), client)
}

fn options(instance: &Arc<PgInstance>) -> Options<PgInstance> {
    Options::new(instance.clone()).lock_wait_timeout(Duration::from_millis(500))
}

async fn lock_is_free(instance: &PgInstance, schema: &str) -> bool {
    let name = dibs_scratch::lock_name(schema);
    let locker = PgAdvisoryLock;
    match locker.acquire(instance, &name, Duration::ZERO).await {
        Ok(handle) => {
            locker.release(handle, &name).await.unwrap();
            true
        }
        Err(_) => false,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_provision_introspect_cleanup() {
    let (_container, instance, _client) = setup_postgres().await;
    let locker = Arc::new(PgAdvisoryLock);

    let ws = TempSchema::provision(
        options(&instance)
            .schema_name("_skeema_tmp")
            .default_character_set("UTF8"),
        locker,
    )
    .await
    .unwrap();
    assert!(instance.has_schema("_skeema_tmp").await.unwrap());
    assert!(!lock_is_free(&instance, "_skeema_tmp").await);
    assert!(ws.introspect_schema().await.unwrap().is_empty());

    let pool = ws.connection_pool("statement_timeout=5000").await.unwrap();
    let conn = pool.get().await.unwrap();
    conn.batch_execute(
        "CREATE TABLE widget (id BIGINT PRIMARY KEY, name TEXT NOT NULL, note TEXT);
         CREATE INDEX widget_name_idx ON widget (name);",
    )
    .await
    .unwrap();
    let timeout = conn.query_one("SHOW statement_timeout", &[]).await.unwrap();
    assert_eq!(timeout.get::<_, String>(0), "5s");
    drop(conn);

    let snapshot = ws.introspect_schema().await.unwrap();
    let widget = snapshot.table("widget").expect("widget table");
    let names: Vec<_> = widget.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "note"]);
    assert!(!widget.column("name").unwrap().nullable);
    assert_eq!(widget.indexes.len(), 2);

    ws.cleanup().await.unwrap();
    assert!(!instance.has_schema("_skeema_tmp").await.unwrap());
    assert!(lock_is_free(&instance, "_skeema_tmp").await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reuse_with_rows_is_refused() {
    let (_container, instance, client) = setup_postgres().await;
    client
        .batch_execute(
            "CREATE SCHEMA _dibs_tmp;
             CREATE TABLE _dibs_tmp.empty_one (id BIGINT);
             CREATE TABLE _dibs_tmp.busy (id BIGINT);
             INSERT INTO _dibs_tmp.busy VALUES (1);",
        )
        .await
        .unwrap();

    let err = TempSchema::provision(options(&instance), Arc::new(PgAdvisoryLock))
        .await
        .err()
        .unwrap();
    assert!(matches!(&err, Error::NonEmptySchema { table, .. } if table == "busy"), "{err}");

    let remaining = client
        .query(
            "SELECT tablename::text FROM pg_tables WHERE schemaname = '_dibs_tmp' ORDER BY 1",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(lock_is_free(&instance, "_dibs_tmp").await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_keep_schema() {
    let (_container, instance, client) = setup_postgres().await;
    let locker = Arc::new(PgAdvisoryLock);

    for _ in 0..2 {
        let ws = TempSchema::provision(options(&instance).keep_schema(true), locker.clone())
            .await
            .unwrap();
        let pool = ws.connection_pool("").await.unwrap();
        pool.get()
            .await
            .unwrap()
            .batch_execute("CREATE TABLE scratch (id BIGINT)")
            .await
            .unwrap();
        ws.cleanup().await.unwrap();
        assert!(instance.has_schema("_dibs_tmp").await.unwrap());
    }

    let ws = TempSchema::provision(options(&instance).keep_schema(true), locker)
        .await
        .unwrap();
    client
        .batch_execute("CREATE TABLE _dibs_tmp.busy (id BIGINT); INSERT INTO _dibs_tmp.busy VALUES (1);")
        .await
        .unwrap();
    let err = ws.cleanup().await.unwrap_err();
    assert!(err.is_non_empty_schema(), "{err}");
    assert!(instance.has_schema("_dibs_tmp").await.unwrap());
    assert!(lock_is_free(&instance, "_dibs_tmp").await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lock_timeout() {
    let (_container, instance, _client) = setup_postgres().await;
    let locker = Arc::new(PgAdvisoryLock);

    let first = TempSchema::provision(options(&instance), locker.clone())
        .await
        .unwrap();
    let err = TempSchema::provision(options(&instance), locker.clone())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::LockTimeout { .. }), "{err}");

    first.cleanup().await.unwrap();
    let second = TempSchema::provision(options(&instance), locker)
        .await
        .unwrap();
    second.cleanup().await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_mismatched_charset_releases_lock() {
    let (_container, instance, _client) = setup_postgres().await;

    let err = TempSchema::provision(
        options(&instance).default_character_set("LATIN1"),
        Arc::new(PgAdvisoryLock),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, Error::SchemaCreation { .. }), "{err}");
    assert!(!instance.has_schema("_dibs_tmp").await.unwrap());
    assert!(lock_is_free(&instance, "_dibs_tmp").await);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_mixed_case_schema_is_the_search_path() {
    let (_container, instance, _client) = setup_postgres().await;

    let ws = TempSchema::provision(
        options(&instance).schema_name("Tmp_Mixed"),
        Arc::new(PgAdvisoryLock),
    )
    .await
    .unwrap();
    assert!(instance.has_schema("Tmp_Mixed").await.unwrap());

    let pool = ws.connection_pool("").await.unwrap();
    let conn = pool.get().await.unwrap();
    let row = conn.query_one("SELECT current_schema()::text", &[]).await.unwrap();
    assert_eq!(row.get::<_, Option<String>>(0).as_deref(), Some("Tmp_Mixed"));
    conn.batch_execute("CREATE TABLE widget (id BIGINT)").await.unwrap();
    drop(conn);

    let snapshot = ws.introspect_schema().await.unwrap();
    assert!(snapshot.table("widget").is_some());

    ws.cleanup().await.unwrap();
    assert!(!instance.has_schema("Tmp_Mixed").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_guarded_drop_schema() {
    let (_container, instance, client) = setup_postgres().await;
    client
        .batch_execute(
            "CREATE SCHEMA guarded;
             CREATE TABLE guarded.empty_one (id BIGINT);
             CREATE TABLE guarded.busy (id BIGINT);
             INSERT INTO guarded.busy VALUES (1);",
        )
        .await
        .unwrap();

    let err = instance.drop_schema("guarded", true).await.unwrap_err();
    assert!(
        matches!(&err, dibs_scratch::InstanceError::TableNotEmpty { table, .. } if table == "busy"),
        "{err}"
    );
    assert!(instance.has_schema("guarded").await.unwrap());
    let remaining = client
        .query("SELECT 1 FROM pg_tables WHERE schemaname = 'guarded'", &[])
        .await
        .unwrap();
    assert_eq!(remaining.len(), 2);

    client.batch_execute("DELETE FROM guarded.busy").await.unwrap();
    instance.drop_schema("guarded", true).await.unwrap();
    assert!(!instance.has_schema("guarded").await.unwrap());
}
