//! Book database initialization
//!
//! Each book owns one SQLite file. Opening it creates the tables if they are
//! missing and refuses to touch a database written by another schema version.

use crate::{Error, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{error, info};

/// Schema version written into every book database
///
/// Bumping this makes older books unreadable until they are reimported;
/// there is no automatic migration.
pub const BOOK_SCHEMA_VERSION: i64 = 3;

/// Open (creating if needed) the database for one book
pub async fn init_book_database(label: &str, db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!(label = %label, "Initialized new book database: {}", db_path.display());
    } else {
        info!(label = %label, "Opened existing book database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL lets readers proceed while one writer holds the lock
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 250").execute(&pool).await?;

    create_schema_version_table(&pool).await?;
    if let Err(e) = check_schema_version(label, &pool).await {
        pool.close().await;
        return Err(e);
    }

    create_artifact_versions_table(&pool).await?;
    create_current_versions_table(&pool).await?;
    create_image_hashes_table(&pool).await?;

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

/// Stamp a fresh database, or verify an existing stamp
async fn check_schema_version(label: &str, pool: &SqlitePool) -> Result<()> {
    let found: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;

    match found {
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(BOOK_SCHEMA_VERSION)
                .execute(pool)
                .await?;
            Ok(())
        }
        Some(version) if version == BOOK_SCHEMA_VERSION => Ok(()),
        Some(version) => {
            error!(
                label = %label,
                expected = BOOK_SCHEMA_VERSION,
                found = version,
                "Book database schema mismatch; reimport required"
            );
            Err(Error::SchemaMismatch {
                label: label.to_string(),
                expected: BOOK_SCHEMA_VERSION,
                found: version,
            })
        }
    }
}

/// Version rows; NULL `data` is a tombstone
async fn create_artifact_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artifact_versions (
            kind TEXT NOT NULL,
            item_id TEXT NOT NULL,
            version INTEGER NOT NULL CHECK (version >= 1),
            data TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (kind, item_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Current pointers for kinds that support switching
async fn create_current_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS current_versions (
            kind TEXT NOT NULL,
            item_id TEXT NOT NULL,
            version INTEGER NOT NULL CHECK (version >= 1),
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (kind, item_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_image_hashes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_hashes (
            hash TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            indexed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
