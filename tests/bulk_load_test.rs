mod common;

use common::{Counters, counting_session, settle};
use pretty_assertions::assert_eq;
use sqlstore::{CopyTarget, Credentials, Session, SqlStoreError, SqliteDriver, Value, params};
use tempfile::TempDir;

async fn sqlite_session(dir: &TempDir) -> Session<SqliteDriver> {
    let path = dir.path().join("bulk.db");
    let session = Session::new(
        SqliteDriver::new().with_copy_batch_size(100),
        Credentials::for_path(path.to_string_lossy().into_owned()),
    );
    session.connect().await.unwrap();
    session
        .exec(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL, payload BLOB)",
            &[],
        )
        .await
        .unwrap();
    session
}

async fn row_count(session: &Session<SqliteDriver>) -> i64 {
    let rows = session
        .query("SELECT COUNT(*) FROM events", &[])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    rows[0].get(0).unwrap()
}

fn events_target() -> CopyTarget {
    CopyTarget::new("events", ["id", "kind", "payload"])
}

#[tokio::test]
async fn test_bulk_load_commits_every_row() {
    let dir = TempDir::new().unwrap();
    let session = sqlite_session(&dir).await;

    let rows: Vec<Vec<Value>> = (0..1000)
        .map(|i| params![i, if i % 2 == 0 { "even" } else { "odd" }, vec![i as u8]])
        .collect();
    let loaded = session.bulk_load(events_target(), &rows).await.unwrap();

    assert_eq!(loaded, 1000);
    assert_eq!(row_count(&session).await, 1000);

    let odd = session
        .query("SELECT COUNT(*) FROM events WHERE kind = $1", &params!["odd"])
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(odd[0].get::<i64>(0).unwrap(), 500);
}

#[tokio::test]
async fn test_constraint_violation_leaves_table_empty() {
    let dir = TempDir::new().unwrap();
    let session = sqlite_session(&dir).await;

    // duplicate primary key in the middle of the batch
    let mut rows: Vec<Vec<Value>> = (0..250).map(|i| params![i, "a", None::<Vec<u8>>]).collect();
    rows.push(params![10, "dup", None::<Vec<u8>>]);

    let err = session.bulk_load(events_target(), &rows).await.unwrap_err();
    assert!(matches!(err, SqlStoreError::Transaction { .. }));
    assert!(err.rolled_back());
    assert_eq!(row_count(&session).await, 0);
}

#[tokio::test]
async fn test_not_null_violation_on_commit_flush() {
    let dir = TempDir::new().unwrap();
    let session = sqlite_session(&dir).await;

    // still buffered when commit runs, so the failure surfaces from the final flush
    let mut load = session.bulk_start(events_target()).await.unwrap();
    load.copy_row(&params![1, "ok", None::<Vec<u8>>]).await.unwrap();
    load.copy_row(&params![2, None::<String>, None::<Vec<u8>>]).await.unwrap();

    let err = load.commit().await.unwrap_err();
    assert!(err.rolled_back());
    assert_eq!(row_count(&session).await, 0);
}

#[tokio::test]
async fn test_explicit_rollback_discards_rows() {
    let dir = TempDir::new().unwrap();
    let session = sqlite_session(&dir).await;

    let mut load = session.bulk_start(events_target()).await.unwrap();
    for i in 0..10 {
        load.copy_row(&params![i, "x", None::<Vec<u8>>]).await.unwrap();
    }
    load.rollback().await.unwrap();

    assert_eq!(row_count(&session).await, 0);
    // the connection is usable for another load afterwards
    let loaded = session
        .bulk_load(events_target(), [params![1, "y", None::<Vec<u8>>]])
        .await
        .unwrap();
    assert_eq!(loaded, 1);
}

#[tokio::test]
async fn test_dropped_load_rolls_back() {
    let dir = TempDir::new().unwrap();
    let session = sqlite_session(&dir).await;

    {
        let mut load = session.bulk_start(events_target()).await.unwrap();
        load.copy_row(&params![1, "x", None::<Vec<u8>>]).await.unwrap();
    }

    // waits for the background rollback to release the connection
    assert_eq!(row_count(&session).await, 0);
}

#[tokio::test]
async fn test_schema_qualified_target() {
    let dir = TempDir::new().unwrap();
    let session = sqlite_session(&dir).await;

    let loaded = session
        .bulk_load(
            events_target().in_schema("main"),
            [params![7, "qualified", None::<Vec<u8>>]],
        )
        .await
        .unwrap();
    assert_eq!(loaded, 1);
    assert_eq!(row_count(&session).await, 1);
}

#[tokio::test]
async fn test_rejected_row_rolls_back_through_driver() {
    let (session, driver) = counting_session();
    session.connect().await.unwrap();

    let rows = vec![params![1, "fine"], params![2, "boom"], params![3, "never"]];
    let err = session
        .bulk_load(CopyTarget::new("t", ["id", "name"]), &rows)
        .await
        .unwrap_err();

    assert!(err.rolled_back());
    assert_eq!(Counters::get(&driver.counters.rollbacks), 1);
    assert_eq!(Counters::get(&driver.counters.commits), 0);
}

#[tokio::test]
async fn test_drop_rollback_with_counting_driver() {
    let (session, driver) = counting_session();
    session.connect().await.unwrap();

    let mut load = session
        .bulk_start(CopyTarget::new("t", ["id"]))
        .await
        .unwrap();
    load.copy_row(&params![1]).await.unwrap();
    drop(load);
    settle().await;

    assert_eq!(Counters::get(&driver.counters.rollbacks), 1);
    assert_eq!(Counters::get(&driver.counters.commits), 0);
    assert!(session.is_connected().await);
}

#[tokio::test]
async fn test_commit_reports_rows() {
    let (session, driver) = counting_session();
    session.connect().await.unwrap();

    let mut load = session
        .bulk_start(CopyTarget::new("t", ["id", "name"]))
        .await
        .unwrap();
    for i in 0..5 {
        load.copy_row(&params![i, "n"]).await.unwrap();
    }
    assert_eq!(load.commit().await.unwrap(), 5);
    assert_eq!(Counters::get(&driver.counters.commits), 1);
    assert_eq!(Counters::get(&driver.counters.rollbacks), 0);
}
