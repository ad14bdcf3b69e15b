//! Database-backed version chains
//!
//! Rows live in `artifact_versions`, keyed by (kind, item_id, version).
//! Allocating the next version and inserting it happens inside one
//! transaction and under the item's write lock, and the primary key rejects
//! any duplicate that slips through as [`Error::Concurrency`].

use super::edit::FieldEdit;
use super::pointers::{get_pointer, set_pointer};
use super::{
    ensure_open, normalize_payload, validate_version, ArtifactKind, EditOutcome, PageComposite, PageItem,
    Payload, Version, VersionedPayload, MAX_ALLOCATION_ATTEMPTS,
};
use crate::utils::{begin_monitored, retry_on_lock};
use bookmill_common::config::ValueDomains;
use bookmill_common::db::{BookHandle, KeyedLocks};
use bookmill_common::ids::{item_in_page, validate_item_id, validate_page_id};
use bookmill_common::{Error, Result};
use sqlx::{Executor, Sqlite, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version chains stored in one book's database
#[derive(Debug, Clone)]
pub struct VersionStore {
    label: String,
    pool: SqlitePool,
    write_locks: Arc<KeyedLocks>,
    lock_wait_ms: u64,
}

impl VersionStore {
    pub fn new(book: &BookHandle, lock_wait_ms: u64) -> Self {
        Self {
            label: book.label.clone(),
            pool: book.pool.clone(),
            write_locks: book.write_locks.clone(),
            lock_wait_ms,
        }
    }

    fn check_args(&self, kind: ArtifactKind, item_id: &str) -> Result<()> {
        ensure_open(&self.pool, &self.label)?;
        if kind.is_file_backed() {
            return Err(Error::InvalidInput(format!(
                "artifact kind '{}' is file-backed",
                kind
            )));
        }
        validate_item_id(item_id)
    }

    /// Insert version `version`; an existing row is a `Concurrency` error
    pub async fn put(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        version: Version,
        data: Payload,
    ) -> Result<()> {
        self.check_args(kind, item_id)?;
        validate_version(version)?;
        let text = encode(normalize_payload(data))?;

        retry_on_lock("put_version", self.lock_wait_ms, || {
            insert_version(&self.pool, kind, item_id, version, text.as_deref())
        })
        .await?;

        debug!(
            label = %self.label,
            kind = %kind,
            item_id,
            version,
            tombstone = text.is_none(),
            "Stored version"
        );
        Ok(())
    }

    /// All version numbers, ascending, tombstones included
    pub async fn list_versions(&self, kind: ArtifactKind, item_id: &str) -> Result<Vec<Version>> {
        self.check_args(kind, item_id)?;
        fetch_versions(&self.pool, kind, item_id).await
    }

    /// Payload of one version; `None` for a missing row or a tombstone
    pub async fn get_version(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        version: Version,
    ) -> Result<Payload> {
        self.check_args(kind, item_id)?;
        match fetch_row(&self.pool, kind, item_id, version).await? {
            Some(text) => decode(text),
            None => Ok(None),
        }
    }

    /// Highest version and its payload
    pub async fn get_latest(
        &self,
        kind: ArtifactKind,
        item_id: &str,
    ) -> Result<Option<(Version, Payload)>> {
        self.check_args(kind, item_id)?;
        let row: Option<(Version, Option<String>)> = sqlx::query_as(
            r#"
            SELECT version, data FROM artifact_versions
            WHERE kind = ? AND item_id = ?
            ORDER BY version DESC LIMIT 1
            "#,
        )
        .bind(kind.as_str())
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((version, text)) => Ok(Some((version, decode(text)?))),
            None => Ok(None),
        }
    }

    pub async fn get_current(&self, kind: ArtifactKind, item_id: &str) -> Result<Option<Version>> {
        self.check_args(kind, item_id)?;
        kind.require_current_pointer()?;
        get_pointer(&self.pool, kind, item_id).await
    }

    /// Move the current pointer; `version` must already exist
    pub async fn set_current(&self, kind: ArtifactKind, item_id: &str, version: Version) -> Result<()> {
        self.check_args(kind, item_id)?;
        kind.require_current_pointer()?;

        retry_on_lock("set_current", self.lock_wait_ms, || async {
            let mut tx = begin_monitored(&self.pool, "version_store::set_current").await?;
            if fetch_row(tx.conn()?, kind, item_id, version).await?.is_none() {
                return Err(Error::NotFound(format!(
                    "{} '{}' version {}",
                    kind, item_id, version
                )));
            }
            set_pointer(tx.conn()?, kind, item_id, version).await?;
            tx.commit().await
        })
        .await?;

        info!(label = %self.label, kind = %kind, item_id, version, "Current version set");
        Ok(())
    }

    /// Resolve a read: explicit version, else current, else latest
    ///
    /// `Ok(None)` means the item has no versions at all. An explicit version
    /// that does not exist is `NotFound`.
    pub async fn read(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        version: Option<Version>,
    ) -> Result<Option<VersionedPayload>> {
        self.check_args(kind, item_id)?;

        let mut tx = begin_monitored(&self.pool, "version_store::read").await?;
        let versions = fetch_versions(tx.conn()?, kind, item_id).await?;
        if versions.is_empty() {
            return Ok(None);
        }

        let current = if kind.has_current_pointer() {
            get_pointer(tx.conn()?, kind, item_id).await?
        } else {
            None
        };

        let target = match version {
            Some(v) if versions.contains(&v) => v,
            Some(v) => {
                return Err(Error::NotFound(format!("{} '{}' version {}", kind, item_id, v)))
            }
            None => match current {
                Some(v) => v,
                None => *versions.last().unwrap_or(&1),
            },
        };

        let text = fetch_row(tx.conn()?, kind, item_id, target)
            .await?
            .unwrap_or(None);
        tx.commit().await?;

        Ok(Some(VersionedPayload {
            version: target,
            is_current: current == Some(target),
            data: decode(text)?,
        }))
    }

    /// Allocate `max + 1` and insert `data` as one unit
    ///
    /// Retried a bounded number of times if another writer claims the
    /// number first.
    pub async fn append_version(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        data: Payload,
    ) -> Result<Version> {
        self.check_args(kind, item_id)?;
        let text = encode(normalize_payload(data))?;
        let _guard = self.write_locks.lock(&lock_key(kind, item_id)).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = retry_on_lock("append_version", self.lock_wait_ms, || {
                self.try_append(kind, item_id, text.as_deref())
            })
            .await;

            match result {
                Err(Error::Concurrency(msg)) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(label = %self.label, kind = %kind, item_id, attempt, "{}; retrying", msg);
                }
                Ok(version) => {
                    debug!(
                        label = %self.label,
                        kind = %kind,
                        item_id,
                        version,
                        tombstone = text.is_none(),
                        "Appended version"
                    );
                    return Ok(version);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_append(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        text: Option<&str>,
    ) -> Result<Version> {
        let mut tx = begin_monitored(&self.pool, "version_store::append").await?;
        let next = fetch_max(tx.conn()?, kind, item_id).await?.unwrap_or(0) + 1;
        insert_version(tx.conn()?, kind, item_id, next, text).await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Edit protocol: clone the base version, change one field, write it as
    /// `latest + 1`; kinds with a current pointer move it to the new version
    ///
    /// The base is `base_version` if given, else current, else latest.
    pub async fn edit(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        edit: &FieldEdit,
        base_version: Option<Version>,
        domains: &ValueDomains,
    ) -> Result<EditOutcome> {
        self.check_args(kind, item_id)?;
        edit.validate_value(domains)?;
        let _guard = self.write_locks.lock(&lock_key(kind, item_id)).await;

        let outcome = retry_on_lock("edit_version", self.lock_wait_ms, || {
            self.try_edit(kind, item_id, edit, base_version)
        })
        .await?;

        info!(
            label = %self.label,
            kind = %kind,
            item_id,
            base_version = outcome.base_version,
            version = outcome.version,
            path = %edit.path,
            "Edit stored as new version"
        );
        Ok(outcome)
    }

    async fn try_edit(
        &self,
        kind: ArtifactKind,
        item_id: &str,
        edit: &FieldEdit,
        base_version: Option<Version>,
    ) -> Result<EditOutcome> {
        let mut tx = begin_monitored(&self.pool, "version_store::edit").await?;

        let versions = fetch_versions(tx.conn()?, kind, item_id).await?;
        let latest = match versions.last() {
            Some(v) => *v,
            None => return Err(Error::NotFound(format!("{} '{}'", kind, item_id))),
        };

        let base = match base_version {
            Some(v) if versions.contains(&v) => v,
            Some(v) => {
                return Err(Error::NotFound(format!("{} '{}' version {}", kind, item_id, v)))
            }
            None if kind.has_current_pointer() => get_pointer(tx.conn()?, kind, item_id)
                .await?
                .unwrap_or(latest),
            None => latest,
        };

        let base_doc = match decode(fetch_row(tx.conn()?, kind, item_id, base).await?.unwrap_or(None))? {
            Some(doc) => doc,
            None => {
                return Err(Error::InvalidInput(format!(
                    "{} '{}' version {} is empty and cannot be edited",
                    kind, item_id, base
                )))
            }
        };

        let edited = edit.apply(&base_doc)?;
        let next = latest + 1;
        let text = serde_json::to_string(&edited)?;
        insert_version(tx.conn()?, kind, item_id, next, Some(&text)).await?;
        if kind.has_current_pointer() {
            set_pointer(tx.conn()?, kind, item_id, next).await?;
        }
        tx.commit().await?;

        Ok(EditOutcome {
            base_version: base,
            version: next,
        })
    }

    /// Item ids stored under a page, sorted
    pub async fn page_items(&self, kind: ArtifactKind, page_id: &str) -> Result<Vec<String>> {
        ensure_open(&self.pool, &self.label)?;
        kind.require_page_scoped()?;
        validate_page_id(page_id)?;
        fetch_page_items(&self.pool, kind, page_id).await
    }

    /// Assemble the page view from each item's current-or-latest payload
    ///
    /// `Ok(None)` when nothing was ever stored under the page; a present
    /// composite with no items when everything there is a tombstone.
    pub async fn read_page(&self, kind: ArtifactKind, page_id: &str) -> Result<Option<PageComposite>> {
        ensure_open(&self.pool, &self.label)?;
        kind.require_page_scoped()?;
        validate_page_id(page_id)?;
        if kind.is_file_backed() {
            return Err(Error::InvalidInput(format!(
                "artifact kind '{}' is file-backed",
                kind
            )));
        }

        let mut tx = begin_monitored(&self.pool, "version_store::read_page").await?;
        let item_ids = fetch_page_items(tx.conn()?, kind, page_id).await?;
        if item_ids.is_empty() {
            return Ok(None);
        }

        let mut items = Vec::new();
        for item_id in item_ids {
            let pointer = if kind.has_current_pointer() {
                get_pointer(tx.conn()?, kind, &item_id).await?
            } else {
                None
            };
            let version = match pointer {
                Some(v) => Some(v),
                None => fetch_max(tx.conn()?, kind, &item_id).await?,
            };
            let Some(version) = version else { continue };

            let text = fetch_row(tx.conn()?, kind, &item_id, version).await?.unwrap_or(None);
            if let Some(data) = decode(text)? {
                items.push(PageItem {
                    item_id,
                    version,
                    data,
                });
            }
        }
        tx.commit().await?;

        Ok(Some(PageComposite {
            kind,
            page_id: page_id.to_string(),
            items,
        }))
    }
}

fn lock_key(kind: ArtifactKind, item_id: &str) -> String {
    format!("{}:{}", kind, item_id)
}

fn encode(data: Payload) -> Result<Option<String>> {
    data.map(|v| serde_json::to_string(&v))
        .transpose()
        .map_err(Error::from)
}

fn decode(text: Option<String>) -> Result<Payload> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(Error::from)
}

async fn insert_version<'e, E>(
    executor: E,
    kind: ArtifactKind,
    item_id: &str,
    version: Version,
    data: Option<&str>,
) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "INSERT INTO artifact_versions (kind, item_id, version, data) VALUES (?, ?, ?, ?)",
    )
    .bind(kind.as_str())
    .bind(item_id)
    .bind(version)
    .bind(data)
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(Error::Concurrency(format!(
                "{} '{}' version {} already exists",
                kind, item_id, version
            )))
        }
        Err(e) => Err(Error::Database(e)),
    }
}

async fn fetch_versions<'e, E>(executor: E, kind: ArtifactKind, item_id: &str) -> Result<Vec<Version>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let versions: Vec<Version> = sqlx::query_scalar(
        "SELECT version FROM artifact_versions WHERE kind = ? AND item_id = ? ORDER BY version ASC",
    )
    .bind(kind.as_str())
    .bind(item_id)
    .fetch_all(executor)
    .await?;

    Ok(versions)
}

async fn fetch_max<'e, E>(executor: E, kind: ArtifactKind, item_id: &str) -> Result<Option<Version>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let max: Option<Version> = sqlx::query_scalar(
        "SELECT MAX(version) FROM artifact_versions WHERE kind = ? AND item_id = ?",
    )
    .bind(kind.as_str())
    .bind(item_id)
    .fetch_one(executor)
    .await?;

    Ok(max)
}

/// Outer `None`: no such row. Inner `None`: tombstone.
async fn fetch_row<'e, E>(
    executor: E,
    kind: ArtifactKind,
    item_id: &str,
    version: Version,
) -> Result<Option<Option<String>>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<Option<String>> = sqlx::query_scalar(
        "SELECT data FROM artifact_versions WHERE kind = ? AND item_id = ? AND version = ?",
    )
    .bind(kind.as_str())
    .bind(item_id)
    .bind(version)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

async fn fetch_page_items<'e, E>(executor: E, kind: ArtifactKind, page_id: &str) -> Result<Vec<String>>
where
    E: Executor<'e, Database = Sqlite>,
{
    // `_` is a LIKE wildcard, so escape the separator
    let pattern = format!("{}\\_%", page_id);
    let items: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT item_id FROM artifact_versions
        WHERE kind = ? AND (item_id = ? OR item_id LIKE ? ESCAPE '\')
        ORDER BY item_id
        "#,
    )
    .bind(kind.as_str())
    .bind(page_id)
    .bind(pattern)
    .fetch_all(executor)
    .await?;

    Ok(items
        .into_iter()
        .filter(|item| item_in_page(item, page_id))
        .collect())
}
