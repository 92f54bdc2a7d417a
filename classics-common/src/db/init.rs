//! Database initialization
//!
//! Opens (or creates) the SQLite state store and brings its schema up to date.
//! Every statement is idempotent, so calling `init_database` on an existing
//! store is safe.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Pragmas are per-connection
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        // WAL lets status/issue readers proceed while a stage attempt commits
        .journal_mode(SqliteJournalMode::Wal)
        // Short busy timeout; longer contention is handled by retry_on_lock
        .busy_timeout(Duration::from_millis(250));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new state store: {}", db_path.display());
    } else {
        info!("Opened existing state store: {}", db_path.display());
    }

    create_schema_version_table(&pool).await?;
    create_books_table(&pool).await?;
    create_issues_table(&pool).await?;
    create_processing_log_table(&pool).await?;
    create_approvals_table(&pool).await?;
    create_ledger_guards(&pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&pool)
        .await?;

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the books table
///
/// One row per registered novel. `stage_in_progress` holds the run token of
/// the runner currently executing a stage for the book (NULL when idle).
pub async fn create_books_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            source_path TEXT NOT NULL,
            state TEXT NOT NULL CHECK (state IN (
                'INGESTED', 'EXTRACTED', 'CLEANED', 'ANALYZED', 'FLAGGED',
                'APPROVED', 'GENERATING', 'COMPLETED', 'DEPLOYED', 'FAILED'
            )),
            resume_state TEXT,
            current_step TEXT,
            progress_percentage REAL NOT NULL DEFAULT 0.0,
            cost_usd REAL NOT NULL DEFAULT 0.0 CHECK (cost_usd >= 0.0),
            notes TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            archived_at TEXT,
            stage_in_progress TEXT,
            in_progress_stage TEXT,
            in_progress_since TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the issues table
pub async fn create_issues_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id TEXT NOT NULL REFERENCES books(id),
            step TEXT NOT NULL,
            issue_type TEXT NOT NULL,
            description TEXT NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high')),
            resolved INTEGER NOT NULL DEFAULT 0,
            resolution_notes TEXT,
            created_at TEXT NOT NULL,
            resolved_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_issues_book_unresolved ON issues(book_id, resolved)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the processing log table (one row per stage attempt)
pub async fn create_processing_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id TEXT NOT NULL REFERENCES books(id),
            step TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('success', 'failure', 'warning')),
            message TEXT NOT NULL,
            duration_seconds REAL NOT NULL DEFAULT 0.0,
            timestamp TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_processing_log_book ON processing_log(book_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the approvals table (at most one immutable approval per book)
pub async fn create_approvals_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS approvals (
            book_id TEXT PRIMARY KEY REFERENCES books(id),
            approver_id TEXT NOT NULL CHECK (length(trim(approver_id)) > 0),
            approved_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Triggers backing the ledger invariants at the storage layer
///
/// - `cost_usd` never decreases
/// - a resolved issue is never reopened or re-resolved
/// - approvals and log entries are never updated or deleted
/// - books are never deleted
async fn create_ledger_guards(pool: &SqlitePool) -> Result<()> {
    let guards = [
        r#"
        CREATE TRIGGER IF NOT EXISTS books_cost_monotonic
        BEFORE UPDATE OF cost_usd ON books
        WHEN NEW.cost_usd < OLD.cost_usd
        BEGIN
            SELECT RAISE(ABORT, 'cost_usd must not decrease');
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS books_no_delete
        BEFORE DELETE ON books
        BEGIN
            SELECT RAISE(ABORT, 'books are archived, never deleted');
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS issues_resolution_final
        BEFORE UPDATE ON issues
        WHEN OLD.resolved = 1
        BEGIN
            SELECT RAISE(ABORT, 'issue already resolved');
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS approvals_immutable
        BEFORE UPDATE ON approvals
        BEGIN
            SELECT RAISE(ABORT, 'approvals are immutable');
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS approvals_no_delete
        BEFORE DELETE ON approvals
        BEGIN
            SELECT RAISE(ABORT, 'approvals are immutable');
        END
        "#,
        r#"
        CREATE TRIGGER IF NOT EXISTS processing_log_append_only
        BEFORE UPDATE ON processing_log
        BEGIN
            SELECT RAISE(ABORT, 'processing log is append-only');
        END
        "#,
    ];

    for guard in guards {
        sqlx::query(guard).execute(pool).await?;
    }

    Ok(())
}
