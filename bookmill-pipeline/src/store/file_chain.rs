//! File-backed version chain for renderings
//!
//! Each version is one JSON file, `<item>.v<NNNNNN>.json`, under the book's
//! `renderings/` folder. The six-digit suffix keeps lexical and numeric order
//! identical. Version lists come from the directory listing; the current
//! pointer lives in the book database so reads need no scan.
//!
//! A version file is published by hard-linking a fully written temp file to
//! its final name, so a reader never sees a partial file and a second writer
//! claiming the same number fails with [`Error::Concurrency`].

use super::edit::FieldEdit;
use super::pointers::{get_pointer, set_pointer};
use super::{
    ensure_open, normalize_payload, validate_version, ArtifactKind, EditOutcome, PageComposite, PageItem,
    Payload, Version, VersionedPayload, MAX_ALLOCATION_ATTEMPTS,
};
use crate::utils::retry_on_lock;
use bookmill_common::config::ValueDomains;
use bookmill_common::db::{BookHandle, KeyedLocks};
use bookmill_common::ids::{item_in_page, validate_item_id, validate_page_id};
use bookmill_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Folder for rendering files inside a book folder
pub const RENDERINGS_DIR: &str = "renderings";

const VERSION_WIDTH: usize = 6;

/// Largest version the fixed-width suffix can hold
pub const MAX_FILE_VERSION: Version = 999_999;

const KIND: ArtifactKind = ArtifactKind::Rendering;

/// File name of one version
pub fn version_file_name(item_id: &str, version: Version) -> String {
    format!("{}.v{:0width$}.json", item_id, version, width = VERSION_WIDTH)
}

/// Split a version file name into (item id, version)
pub fn parse_version_file_name(name: &str) -> Option<(&str, Version)> {
    let stem = name.strip_suffix(".json")?;
    let (item_id, digits) = stem.rsplit_once(".v")?;
    if item_id.is_empty() || item_id.starts_with('.') {
        return None;
    }
    if digits.len() != VERSION_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version: Version = digits.parse().ok()?;
    if version == 0 {
        return None;
    }
    Some((item_id, version))
}

/// Rendering versions of one book
#[derive(Debug, Clone)]
pub struct FileVersionChain {
    label: String,
    dir: PathBuf,
    pool: SqlitePool,
    write_locks: Arc<KeyedLocks>,
    lock_wait_ms: u64,
}

impl FileVersionChain {
    pub fn new(book: &BookHandle, lock_wait_ms: u64) -> Self {
        Self {
            label: book.label.clone(),
            dir: book.dir.join(RENDERINGS_DIR),
            pool: book.pool.clone(),
            write_locks: book.write_locks.clone(),
            lock_wait_ms,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn version_path(&self, item_id: &str, version: Version) -> PathBuf {
        self.dir.join(version_file_name(item_id, version))
    }

    /// Create `renderings/` inside the book folder, never the folder itself
    async fn ensure_dir(&self) -> Result<()> {
        match tokio::fs::create_dir(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::BookDeleted(self.label.clone())),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Every (item, version) file present, in name order
    async fn scan(&self) -> Result<Vec<(String, Version)>> {
        ensure_open(&self.pool, &self.label)?;
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(Error::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some((item_id, version)) = name.to_str().and_then(parse_version_file_name) {
                found.push((item_id.to_string(), version));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Versions present on disk for `item_id`, ascending
    pub async fn list_versions(&self, item_id: &str) -> Result<Vec<Version>> {
        validate_item_id(item_id)?;
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|(item, _)| item == item_id)
            .map(|(_, version)| version)
            .collect())
    }

    /// Write version `version`; an existing file is a `Concurrency` error
    pub async fn put(&self, item_id: &str, version: Version, data: Payload) -> Result<()> {
        validate_item_id(item_id)?;
        validate_version(version)?;
        if version > MAX_FILE_VERSION {
            return Err(Error::InvalidInput(format!(
                "rendering versions are limited to {}",
                MAX_FILE_VERSION
            )));
        }

        ensure_open(&self.pool, &self.label)?;

        let data = normalize_payload(data);
        let bytes = serde_json::to_vec_pretty(&data.unwrap_or(serde_json::Value::Null))?;
        self.ensure_dir().await?;

        let final_path = self.version_path(item_id, version);
        let tmp_path = self.dir.join(format!(
            ".{}.{}.tmp",
            version_file_name(item_id, version),
            uuid::Uuid::new_v4()
        ));

        tokio::fs::write(&tmp_path, &bytes).await?;
        let linked = tokio::fs::hard_link(&tmp_path, &final_path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
            warn!(path = %tmp_path.display(), error = %e, "Failed to remove temp rendering file");
        }

        match linked {
            // Deleted while writing: take the file back out
            Ok(()) if self.pool.is_closed() => {
                let _ = tokio::fs::remove_file(&final_path).await;
                Err(Error::BookDeleted(self.label.clone()))
            }
            Ok(()) => {
                debug!(label = %self.label, item_id, version, "Stored rendering version file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::Concurrency(format!(
                "{} '{}' version {} already exists",
                KIND, item_id, version
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Payload of one version; `None` for a tombstone
    ///
    /// A missing file is `NotFound`, even when other versions exist.
    pub async fn get_version(&self, item_id: &str, version: Version) -> Result<Payload> {
        validate_item_id(item_id)?;
        ensure_open(&self.pool, &self.label)?;
        let path = self.version_path(item_id, version);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "{} '{}' version {} (file {} missing)",
                    KIND,
                    item_id,
                    version,
                    path.display()
                )))
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        Ok(normalize_payload(Some(value)))
    }

    pub async fn get_latest(&self, item_id: &str) -> Result<Option<(Version, Payload)>> {
        match self.list_versions(item_id).await?.last() {
            Some(&version) => Ok(Some((version, self.get_version(item_id, version).await?))),
            None => Ok(None),
        }
    }

    pub async fn get_current(&self, item_id: &str) -> Result<Option<Version>> {
        validate_item_id(item_id)?;
        ensure_open(&self.pool, &self.label)?;
        get_pointer(&self.pool, KIND, item_id).await
    }

    /// Move the current pointer; the version file must exist
    pub async fn set_current(&self, item_id: &str, version: Version) -> Result<()> {
        if !self.list_versions(item_id).await?.contains(&version) {
            return Err(Error::NotFound(format!("{} '{}' version {}", KIND, item_id, version)));
        }
        retry_on_lock("set_current", self.lock_wait_ms, || {
            set_pointer(&self.pool, KIND, item_id, version)
        })
        .await?;

        info!(label = %self.label, kind = %KIND, item_id, version, "Current version set");
        Ok(())
    }

    /// Resolve a read: explicit version, else current, else latest
    ///
    /// `Ok(None)` only when the item has neither files nor a pointer.
    pub async fn read(&self, item_id: &str, version: Option<Version>) -> Result<Option<VersionedPayload>> {
        let versions = self.list_versions(item_id).await?;
        let current = get_pointer(&self.pool, KIND, item_id).await?;

        let target = match (version, current, versions.last()) {
            (Some(v), _, _) => v,
            (None, Some(v), _) => v,
            (None, None, Some(&v)) => v,
            (None, None, None) => return Ok(None),
        };

        let data = self.get_version(item_id, target).await?;
        Ok(Some(VersionedPayload {
            version: target,
            is_current: current == Some(target),
            data,
        }))
    }

    /// Allocate `max + 1` and write `data` as one unit
    pub async fn append_version(&self, item_id: &str, data: Payload) -> Result<Version> {
        validate_item_id(item_id)?;
        let _guard = self.write_locks.lock(&lock_key(item_id)).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let next = self.list_versions(item_id).await?.last().copied().unwrap_or(0) + 1;
            match self.put(item_id, next, data.clone()).await {
                Ok(()) => return Ok(next),
                Err(Error::Concurrency(msg)) if attempt < MAX_ALLOCATION_ATTEMPTS => {
                    warn!(label = %self.label, item_id, attempt, "{}; retrying", msg);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Edit protocol: clone the base, change one field, write `latest + 1`
    /// and make it current
    pub async fn edit(
        &self,
        item_id: &str,
        edit: &FieldEdit,
        base_version: Option<Version>,
        domains: &ValueDomains,
    ) -> Result<EditOutcome> {
        validate_item_id(item_id)?;
        edit.validate_value(domains)?;
        let _guard = self.write_locks.lock(&lock_key(item_id)).await;

        let versions = self.list_versions(item_id).await?;
        let latest = match versions.last() {
            Some(v) => *v,
            None => return Err(Error::NotFound(format!("{} '{}'", KIND, item_id))),
        };

        let base = match base_version {
            Some(v) if versions.contains(&v) => v,
            Some(v) => {
                return Err(Error::NotFound(format!("{} '{}' version {}", KIND, item_id, v)))
            }
            None => get_pointer(&self.pool, KIND, item_id).await?.unwrap_or(latest),
        };

        let base_doc = match self.get_version(item_id, base).await? {
            Some(doc) => doc,
            None => {
                return Err(Error::InvalidInput(format!(
                    "{} '{}' version {} is empty and cannot be edited",
                    KIND, item_id, base
                )))
            }
        };

        let edited = edit.apply(&base_doc)?;
        let next = latest + 1;
        self.put(item_id, next, Some(edited)).await?;
        retry_on_lock("set_current", self.lock_wait_ms, || {
            set_pointer(&self.pool, KIND, item_id, next)
        })
        .await?;

        info!(
            label = %self.label,
            kind = %KIND,
            item_id,
            base_version = base,
            version = next,
            path = %edit.path,
            "Edit stored as new version"
        );
        Ok(EditOutcome {
            base_version: base,
            version: next,
        })
    }

    /// Item ids with at least one file under the page, sorted
    pub async fn page_items(&self, page_id: &str) -> Result<Vec<String>> {
        validate_page_id(page_id)?;
        let items: BTreeSet<String> = self
            .scan()
            .await?
            .into_iter()
            .map(|(item, _)| item)
            .filter(|item| item_in_page(item, page_id))
            .collect();
        Ok(items.into_iter().collect())
    }

    /// Page view from each item's current-or-latest payload
    ///
    /// `Ok(None)` when no files exist under the page. An item whose current
    /// file is missing is shown at its latest version.
    pub async fn read_page(&self, page_id: &str) -> Result<Option<PageComposite>> {
        let item_ids = self.page_items(page_id).await?;
        if item_ids.is_empty() {
            return Ok(None);
        }

        let mut items = Vec::new();
        for item_id in item_ids {
            let resolved = match self.read(&item_id, None).await {
                Ok(resolved) => resolved,
                Err(Error::NotFound(msg)) => {
                    warn!(label = %self.label, item_id = %item_id, "{}; using latest", msg);
                    self.get_latest(&item_id)
                        .await?
                        .map(|(version, data)| VersionedPayload {
                            version,
                            is_current: false,
                            data,
                        })
                }
                Err(e) => return Err(e),
            };
            let Some(resolved) = resolved else {
                continue;
            };
            if let Some(data) = resolved.data {
                items.push(PageItem {
                    item_id,
                    version: resolved.version,
                    data,
                });
            }
        }

        Ok(Some(PageComposite {
            kind: KIND,
            page_id: page_id.to_string(),
            items,
        }))
    }
}

fn lock_key(item_id: &str) -> String {
    format!("{}:{}", KIND, item_id)
}
