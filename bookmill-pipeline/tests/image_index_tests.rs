//! Content-addressed image lookup: index hits, stale entries and the
//! fallback scan

use bookmill_common::db::{BookHandle, BookRegistry};
use bookmill_common::Error;
use bookmill_pipeline::services::{hash_bytes, ImageIndex};
use std::sync::Arc;
use tempfile::TempDir;

async fn setup() -> (TempDir, Arc<BookRegistry>, BookHandle, ImageIndex) {
    let root = tempfile::tempdir().expect("Failed to create temp dir");
    let books = Arc::new(BookRegistry::new(root.path()));
    let book = books.create("atlas").await.expect("Failed to create book");
    let images = ImageIndex::new(&book, 2000);
    (root, books, book, images)
}

async fn index_rows(book: &BookHandle) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM image_hashes")
        .fetch_one(&book.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_lookup_through_index() {
    let (_root, _books, book, images) = setup().await;
    let hash = images.store_image("pg001.png", b"page one").await.unwrap();
    assert_eq!(index_rows(&book).await, 1);

    let path = images.lookup(&hash, None).await.unwrap().unwrap();
    assert_eq!(path, images.dir().join("pg001.png"));
}

#[tokio::test]
async fn test_missing_index_row_recovered_by_scan() {
    let (_root, _books, book, images) = setup().await;
    tokio::fs::create_dir_all(images.dir()).await.unwrap();
    tokio::fs::write(images.dir().join("pg002.png"), b"page two").await.unwrap();
    assert_eq!(index_rows(&book).await, 0);

    let hash = hash_bytes(b"page two");
    let path = images.lookup(&hash, None).await.unwrap().unwrap();
    assert_eq!(path, images.dir().join("pg002.png"));

    // The scan hit is written back to the index
    assert_eq!(index_rows(&book).await, 1);
}

#[tokio::test]
async fn test_stale_index_entry_falls_back() {
    let (_root, _books, _book, images) = setup().await;
    let hash = images.store_image("pg001.png", b"shared bytes").await.unwrap();

    // Same content renamed on disk behind the index's back
    tokio::fs::rename(images.dir().join("pg001.png"), images.dir().join("pg003.png"))
        .await
        .unwrap();

    let path = images.lookup(&hash, None).await.unwrap().unwrap();
    assert_eq!(path, images.dir().join("pg003.png"));
}

#[tokio::test]
async fn test_page_scoped_scan_covers_sub_images() {
    let (_root, _books, _book, images) = setup().await;
    tokio::fs::create_dir_all(images.dir()).await.unwrap();
    tokio::fs::write(images.dir().join("pg004.png"), b"raster").await.unwrap();
    tokio::fs::write(images.dir().join("pg004_fig1.png"), b"figure").await.unwrap();

    let figure = hash_bytes(b"figure");

    // Unscoped scans only hash page rasters
    assert!(images.lookup(&figure, None).await.unwrap().is_none());

    let path = images.lookup(&figure, Some("pg004")).await.unwrap().unwrap();
    assert_eq!(path, images.dir().join("pg004_fig1.png"));

    // Indexed now, so the scope no longer matters
    assert!(images.lookup(&figure, Some("pg005")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_hash_and_bad_input() {
    let (_root, _books, _book, images) = setup().await;
    images.store_image("pg001.png", b"one").await.unwrap();

    assert!(images.lookup(&hash_bytes(b"nope"), Some("pg001")).await.unwrap().is_none());
    assert!(images.lookup("not-a-hash", None).await.is_err());
    assert!(images.store_image("../escape.png", b"x").await.is_err());
}

#[tokio::test]
async fn test_page_ids_ignore_sub_images() {
    let (_root, _books, _book, images) = setup().await;
    images.store_image("pg010.png", b"a").await.unwrap();
    images.store_image("pg002.png", b"b").await.unwrap();
    images.store_image("pg002_fig1.png", b"c").await.unwrap();

    assert_eq!(images.page_ids().await.unwrap(), vec!["pg002", "pg010"]);
}

#[tokio::test]
async fn test_deleted_book_rejects_image_writes() {
    let (_root, books, book, images) = setup().await;
    let hash = images.store_image("pg001.png", b"page one").await.unwrap();

    books.delete("atlas").await.unwrap();

    let result = images.store_image("pg002.png", b"page two").await;
    assert!(matches!(result, Err(Error::BookDeleted(_))));
    assert!(!book.dir.exists());
    assert!(matches!(images.lookup(&hash, None).await, Err(Error::BookDeleted(_))));
}
