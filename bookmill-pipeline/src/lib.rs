//! Bookmill pipeline service
//!
//! Job queue, versioned artifact store, image index and the HTTP layer that
//! exposes them.

pub mod api;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod services;
pub mod store;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use bookmill_common::config::ValueDomains;
use bookmill_common::db::BookRegistry;
use bookmill_common::ids::validate_label;
use chrono::{DateTime, Utc};
use jobs::JobQueue;
use services::ImageIndex;
use std::sync::Arc;
use store::ArtifactStore;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub books: Arc<BookRegistry>,
    pub queue: JobQueue,
    /// Enumerations checked before an edit is written
    pub domains: Arc<ValueDomains>,
    pub lock_wait_ms: u64,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(books: Arc<BookRegistry>, queue: JobQueue, domains: ValueDomains, lock_wait_ms: u64) -> Self {
        Self {
            books,
            queue,
            domains: Arc::new(domains),
            lock_wait_ms,
            startup_time: Utc::now(),
        }
    }

    /// Artifact store of an existing, non-deleted book
    pub async fn store(&self, label: &str) -> ApiResult<ArtifactStore> {
        validate_label(label)?;
        let book = self.books.open(label).await?;
        Ok(ArtifactStore::new(&book, self.lock_wait_ms))
    }

    pub async fn images(&self, label: &str) -> ApiResult<ImageIndex> {
        validate_label(label)?;
        let book = self.books.open(label).await?;
        Ok(ImageIndex::new(&book, self.lock_wait_ms))
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::book_routes())
        .merge(api::job_routes())
        .merge(api::artifact_routes())
        .merge(api::image_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
