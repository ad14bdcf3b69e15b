//! Current-version pointers
//!
//! One row per (kind, item) in `current_versions`, shared by the database
//! chains and the file chain. No row means "no current set yet".

use super::{ArtifactKind, Version};
use bookmill_common::Result;
use sqlx::{Executor, Sqlite};

/// Read the current pointer
pub async fn get_pointer<'e, E>(executor: E, kind: ArtifactKind, item_id: &str) -> Result<Option<Version>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let version: Option<Version> = sqlx::query_scalar(
        "SELECT version FROM current_versions WHERE kind = ? AND item_id = ?",
    )
    .bind(kind.as_str())
    .bind(item_id)
    .fetch_optional(executor)
    .await?;

    Ok(version)
}

/// Point (kind, item) at `version`; the caller has checked the version exists
pub async fn set_pointer<'e, E>(
    executor: E,
    kind: ArtifactKind,
    item_id: &str,
    version: Version,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO current_versions (kind, item_id, version)
        VALUES (?, ?, ?)
        ON CONFLICT(kind, item_id) DO UPDATE SET
            version = excluded.version,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(kind.as_str())
    .bind(item_id)
    .bind(version)
    .execute(executor)
    .await?;

    Ok(())
}
