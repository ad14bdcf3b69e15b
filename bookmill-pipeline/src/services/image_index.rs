//! Content-addressed image lookup
//!
//! Images live under the book's `images/` folder: page rasters `<page>.png`
//! and extracted sub-images `<page>_<name>.<ext>`. The `image_hashes` table
//! maps a SHA-256 hex digest to a file name. The index is best effort: on a
//! miss, or when the indexed file is gone, lookup scans a bounded candidate
//! set and re-indexes the match.
//!
//! Images arrive either as raw bytes or base64 text; both inputs hash to the
//! same digest so the two paths share one hash space.

use crate::store::ensure_open;
use crate::utils::retry_on_lock;
use base64::{engine::general_purpose, Engine as _};
use bookmill_common::db::BookHandle;
use bookmill_common::ids::{page_of, validate_page_id};
use bookmill_common::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Folder for page rasters and sub-images inside a book folder
pub const IMAGES_DIR: &str = "images";

/// Most files hashed by one fallback scan
pub const FALLBACK_SCAN_LIMIT: usize = 512;

const PAGE_RASTER_EXT: &str = "png";

/// SHA-256 of `bytes` as lowercase hex
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA-256 of the bytes a base64 string encodes
///
/// Accepts a bare base64 string or a `data:<mime>;base64,` URL.
pub fn hash_base64(encoded: &str) -> Result<String> {
    Ok(hash_bytes(&decode_base64(encoded)?))
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| Error::InvalidInput(format!("invalid base64 image data: {}", e)))
}

fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "'{}' is not a lowercase SHA-256 hex digest",
            hash
        )))
    }
}

/// Image file name rules: a page id prefix, no separators, no dotfiles
fn validate_file_name(file_name: &str) -> Result<()> {
    let valid = !file_name.starts_with('.')
        && !file_name.contains(['/', '\\'])
        && file_name.contains('.')
        && validate_page_id(page_of(file_stem(file_name))).is_ok();
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "image file name '{}' must look like pg001.png or pg001_fig1.jpg",
            file_name
        )))
    }
}

fn file_stem(file_name: &str) -> &str {
    file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem)
}

/// Name of the raster for `page_id`
pub fn page_raster_name(page_id: &str) -> String {
    format!("{}.{}", page_id, PAGE_RASTER_EXT)
}

/// Image store and hash index of one book
#[derive(Debug, Clone)]
pub struct ImageIndex {
    label: String,
    dir: PathBuf,
    pool: SqlitePool,
    lock_wait_ms: u64,
}

impl ImageIndex {
    pub fn new(book: &BookHandle, lock_wait_ms: u64) -> Self {
        Self {
            label: book.label.clone(),
            dir: book.dir.join(IMAGES_DIR),
            pool: book.pool.clone(),
            lock_wait_ms,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create `images/` inside the book folder, never the folder itself
    async fn ensure_dir(&self) -> Result<()> {
        ensure_open(&self.pool, &self.label)?;
        match tokio::fs::create_dir(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::BookDeleted(self.label.clone())),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write an image and index it; returns its hash
    pub async fn store_image(&self, file_name: &str, bytes: &[u8]) -> Result<String> {
        validate_file_name(file_name)?;
        self.ensure_dir().await?;
        tokio::fs::write(self.dir.join(file_name), bytes).await?;

        let hash = hash_bytes(bytes);
        self.index_image(&hash, file_name).await?;
        debug!(label = %self.label, file_name, hash = %hash, "Stored image");
        Ok(hash)
    }

    /// Write an image received as base64 text; returns its hash
    pub async fn store_image_base64(&self, file_name: &str, encoded: &str) -> Result<String> {
        let hash = hash_base64(encoded)?;
        let bytes = decode_base64(encoded)?;
        validate_file_name(file_name)?;
        self.ensure_dir().await?;
        tokio::fs::write(self.dir.join(file_name), &bytes).await?;

        self.index_image(&hash, file_name).await?;
        debug!(label = %self.label, file_name, hash = %hash, "Stored base64 image");
        Ok(hash)
    }

    /// Record `hash -> file_name`, replacing any earlier entry
    pub async fn index_image(&self, hash: &str, file_name: &str) -> Result<()> {
        validate_hash(hash)?;
        validate_file_name(file_name)?;

        retry_on_lock("index_image", self.lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO image_hashes (hash, path) VALUES (?, ?)
                ON CONFLICT(hash) DO UPDATE SET
                    path = excluded.path,
                    indexed_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(hash)
            .bind(file_name)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Path of the image with content hash `hash`
    ///
    /// Tries the index first. On a miss or a stale entry, hashes the
    /// candidates for `page` (its raster and sub-images) or, with no page,
    /// every page raster, stopping at the first match.
    pub async fn lookup(&self, hash: &str, page: Option<&str>) -> Result<Option<PathBuf>> {
        validate_hash(hash)?;
        ensure_open(&self.pool, &self.label)?;
        if let Some(page_id) = page {
            validate_page_id(page_id)?;
        }

        let indexed: Option<String> =
            sqlx::query_scalar("SELECT path FROM image_hashes WHERE hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(file_name) = indexed {
            let path = self.dir.join(&file_name);
            if tokio::fs::try_exists(&path).await? {
                return Ok(Some(path));
            }
            debug!(label = %self.label, hash, file_name = %file_name, "Indexed image missing on disk");
        }

        let candidates = self.candidates(page).await?;
        let scanned = candidates.len();
        for file_name in candidates {
            let path = self.dir.join(&file_name);
            let candidate_hash = hash_file(&path).await?;
            if candidate_hash == hash {
                self.index_image(hash, &file_name).await?;
                info!(label = %self.label, hash, file_name = %file_name, "Image found by fallback scan");
                return Ok(Some(path));
            }
        }

        debug!(label = %self.label, hash, scanned, "Image not found");
        Ok(None)
    }

    /// Page ids that have a raster, sorted
    pub async fn page_ids(&self) -> Result<Vec<String>> {
        let mut pages: Vec<String> = self
            .list_files()
            .await?
            .into_iter()
            .filter_map(|name| {
                let page = name.strip_suffix(&format!(".{}", PAGE_RASTER_EXT))?;
                validate_page_id(page).ok()?;
                Some(page.to_string())
            })
            .collect();
        pages.sort();
        Ok(pages)
    }

    async fn candidates(&self, page: Option<&str>) -> Result<Vec<String>> {
        let mut names: Vec<String> = match page {
            Some(page_id) => {
                let raster = page_raster_name(page_id);
                let prefix = format!("{}_", page_id);
                self.list_files()
                    .await?
                    .into_iter()
                    .filter(|name| *name == raster || name.starts_with(&prefix))
                    .collect()
            }
            None => self
                .page_ids()
                .await?
                .iter()
                .map(|p| page_raster_name(p))
                .collect(),
        };
        names.sort();
        names.truncate(FALLBACK_SCAN_LIMIT);
        Ok(names)
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        ensure_open(&self.pool, &self.label)?;
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(Error::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_file_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

async fn hash_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    tokio::task::spawn_blocking(move || hash_bytes(&bytes))
        .await
        .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))
}
