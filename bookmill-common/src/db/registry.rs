//! Book connection registry
//!
//! One pool per label, opened lazily and cached until the book is closed.
//! Closing marks the label deleted; every later access fails with
//! [`Error::BookDeleted`] until [`BookRegistry::reenable`] is called.

use crate::db::init::init_book_database;
use crate::db::locks::KeyedLocks;
use crate::ids::validate_label;
use crate::{Error, Result};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// File name of the per-book database inside the book folder
pub const BOOK_DB_FILE: &str = "book.db";

/// Open handle to one book's storage
#[derive(Debug, Clone)]
pub struct BookHandle {
    pub label: String,
    /// `<root>/books/<label>`
    pub dir: PathBuf,
    pub pool: SqlitePool,
    /// Per-item exclusion scopes shared by every writer of this book
    pub write_locks: Arc<KeyedLocks>,
}

/// Registry of per-book database pools, owned by the application root
#[derive(Debug)]
pub struct BookRegistry {
    books_dir: PathBuf,
    connections: Mutex<HashMap<String, BookHandle>>,
    deleted: RwLock<HashSet<String>>,
}

impl BookRegistry {
    /// Create a registry rooted at `<root>/books`
    pub fn new(root_folder: &Path) -> Self {
        Self {
            books_dir: root_folder.join("books"),
            connections: Mutex::new(HashMap::new()),
            deleted: RwLock::new(HashSet::new()),
        }
    }

    /// Folder holding every book
    pub fn books_dir(&self) -> &Path {
        &self.books_dir
    }

    /// Folder for one book (not checked for existence)
    pub fn book_dir(&self, label: &str) -> Result<PathBuf> {
        validate_label(label)?;
        Ok(self.books_dir.join(label))
    }

    /// True if the label was closed and not re-enabled
    pub fn is_deleted(&self, label: &str) -> bool {
        let deleted = self.deleted.read().unwrap_or_else(|e| e.into_inner());
        deleted.contains(label)
    }

    fn ensure_not_deleted(&self, label: &str) -> Result<()> {
        if self.is_deleted(label) {
            return Err(Error::BookDeleted(label.to_string()));
        }
        Ok(())
    }

    /// Open an existing book; unknown labels are `NotFound`
    pub async fn open(&self, label: &str) -> Result<BookHandle> {
        self.open_inner(label, false).await
    }

    /// Open a book, creating its folder and database if missing
    pub async fn create(&self, label: &str) -> Result<BookHandle> {
        self.open_inner(label, true).await
    }

    async fn open_inner(&self, label: &str, create: bool) -> Result<BookHandle> {
        let dir = self.book_dir(label)?;
        self.ensure_not_deleted(label)?;

        let mut connections = self.connections.lock().await;

        // A close may have landed while we waited for the lock
        self.ensure_not_deleted(label)?;

        if let Some(handle) = connections.get(label) {
            return Ok(handle.clone());
        }

        let db_path = dir.join(BOOK_DB_FILE);
        if !create && !db_path.exists() {
            return Err(Error::NotFound(format!("book '{}'", label)));
        }

        let pool = init_book_database(label, &db_path).await?;
        let handle = BookHandle {
            label: label.to_string(),
            dir,
            pool,
            write_locks: Arc::new(KeyedLocks::new()),
        };
        connections.insert(label.to_string(), handle.clone());
        debug!(label = %label, "Cached book connection");

        Ok(handle)
    }

    /// Close the book's pool and mark the label deleted
    ///
    /// Returns true if a cached connection was closed.
    pub async fn close(&self, label: &str) -> Result<bool> {
        validate_label(label)?;
        {
            let mut deleted = self.deleted.write().unwrap_or_else(|e| e.into_inner());
            deleted.insert(label.to_string());
        }

        let handle = self.connections.lock().await.remove(label);
        let was_open = handle.is_some();
        if let Some(handle) = handle {
            handle.pool.close().await;
        }

        info!(label = %label, was_open, "Book connection closed and marked deleted");
        Ok(was_open)
    }

    /// Close the book and remove its folder from disk
    pub async fn delete(&self, label: &str) -> Result<()> {
        self.close(label).await?;
        let dir = self.book_dir(label)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(label = %label, "Book folder removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Allow access to a previously closed label again
    pub fn reenable(&self, label: &str) -> bool {
        let mut deleted = self.deleted.write().unwrap_or_else(|e| e.into_inner());
        let was_deleted = deleted.remove(label);
        if was_deleted {
            info!(label = %label, "Book re-enabled");
        }
        was_deleted
    }

    /// Labels of all books present on disk, sorted
    pub async fn labels(&self) -> Result<Vec<String>> {
        let mut labels = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.books_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(labels),
            Err(e) => return Err(Error::Io(e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if entry.path().join(BOOK_DB_FILE).exists() && !self.is_deleted(name) {
                    labels.push(name.to_string());
                }
            }
        }
        labels.sort();
        Ok(labels)
    }

    /// Close every cached pool without marking anything deleted
    pub async fn shutdown(&self) {
        let handles: Vec<BookHandle> = self.connections.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_unknown_book_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let registry = BookRegistry::new(root.path());

        let result = registry.open("missing").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_then_open_returns_cached_pool() {
        let root = tempfile::tempdir().unwrap();
        let registry = BookRegistry::new(root.path());

        let created = registry.create("alpha").await.unwrap();
        let opened = registry.open("alpha").await.unwrap();
        assert_eq!(created.dir, opened.dir);
        assert_eq!(registry.labels().await.unwrap(), vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_book_fails_fast_until_reenabled() {
        let root = tempfile::tempdir().unwrap();
        let registry = BookRegistry::new(root.path());
        registry.create("alpha").await.unwrap();

        assert!(registry.close("alpha").await.unwrap());
        assert!(registry.is_deleted("alpha"));
        assert!(matches!(registry.open("alpha").await, Err(Error::BookDeleted(_))));
        assert!(matches!(registry.create("alpha").await, Err(Error::BookDeleted(_))));

        assert!(registry.reenable("alpha"));
        assert!(!registry.is_deleted("alpha"));
        assert!(registry.open("alpha").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_removes_folder() {
        let root = tempfile::tempdir().unwrap();
        let registry = BookRegistry::new(root.path());
        let handle = registry.create("alpha").await.unwrap();
        assert!(handle.dir.exists());

        registry.delete("alpha").await.unwrap();
        assert!(!handle.dir.exists());

        registry.reenable("alpha");
        assert!(matches!(registry.open("alpha").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_label_rejected() {
        let root = tempfile::tempdir().unwrap();
        let registry = BookRegistry::new(root.path());
        assert!(matches!(registry.create("../escape").await, Err(Error::InvalidInput(_))));
    }
}
