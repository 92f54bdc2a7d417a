//! Tests for state store initialization and storage-level ledger guards

use classics_common::db::init::{init_database, SCHEMA_VERSION};
use tempfile::TempDir;

async fn insert_book(pool: &sqlx::SqlitePool, id: &str) {
    sqlx::query(
        "INSERT INTO books (id, title, author, source_path, state, created_at)
         VALUES (?, 'The Time Machine', 'H. G. Wells', 'input/tm.pdf', 'INGESTED', '2026-01-01T00:00:00Z')",
    )
    .bind(id)
    .execute(pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nested").join("pipeline.db");

    let result = init_database(&db_path).await;

    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("pipeline.db");

    let pool1 = init_database(&db_path).await.unwrap();
    insert_book(&pool1, "time_machine").await;
    drop(pool1);

    let pool2 = init_database(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(count, 1, "Existing rows must survive re-initialization");

    let version: i64 = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(&pool2)
        .await
        .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
}

#[tokio::test]
async fn test_unknown_state_rejected() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("pipeline.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO books (id, title, author, source_path, state, created_at)
         VALUES ('x', 't', 'a', 's', 'SHELVED', '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_cost_cannot_decrease() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("pipeline.db")).await.unwrap();
    insert_book(&pool, "time_machine").await;

    sqlx::query("UPDATE books SET cost_usd = 10.0 WHERE id = 'time_machine'")
        .execute(&pool)
        .await
        .unwrap();

    let result = sqlx::query("UPDATE books SET cost_usd = 5.0 WHERE id = 'time_machine'")
        .execute(&pool)
        .await;
    assert!(result.is_err(), "cost decrease must be refused");

    let cost: f64 = sqlx::query_scalar("SELECT cost_usd FROM books WHERE id = 'time_machine'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(cost, 10.0);
}

#[tokio::test]
async fn test_books_cannot_be_deleted() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("pipeline.db")).await.unwrap();
    insert_book(&pool, "time_machine").await;

    let result = sqlx::query("DELETE FROM books WHERE id = 'time_machine'")
        .execute(&pool)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_resolved_issue_is_final() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("pipeline.db")).await.unwrap();
    insert_book(&pool, "time_machine").await;

    sqlx::query(
        "INSERT INTO issues (book_id, step, issue_type, description, severity, resolved, resolution_notes, created_at)
         VALUES ('time_machine', 'cleaning', 'ocr', 'rn for m', 'low', 1, 'fixed', '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let result = sqlx::query("UPDATE issues SET resolved = 0")
        .execute(&pool)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_issue_requires_existing_book() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("pipeline.db")).await.unwrap();

    let result = sqlx::query(
        "INSERT INTO issues (book_id, step, issue_type, description, severity, created_at)
         VALUES ('ghost', 'cleaning', 'ocr', 'x', 'low', '2026-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await;

    assert!(result.is_err(), "foreign keys must be enforced");
}
