//! Book lifecycle endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bookmill_common::ids::validate_label;
use serde::Serialize;

use crate::{error::ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub label: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteBookResponse {
    pub label: String,
    /// Jobs failed by the deletion
    pub cancelled: usize,
}

#[derive(Debug, Serialize)]
pub struct ReenableResponse {
    pub label: String,
    /// False when the label was not marked deleted
    pub reenabled: bool,
}

/// GET /books
pub async fn list_books(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.books.labels().await?))
}

/// POST /books/:label
///
/// Creates the book folder and database if missing.
pub async fn create_book(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<(StatusCode, Json<BookResponse>)> {
    validate_label(&label)?;
    state.books.create(&label).await?;
    tracing::info!(label = %label, "Book created");
    Ok((StatusCode::CREATED, Json(BookResponse { label })))
}

/// DELETE /books/:label
///
/// Cancels the book's jobs, then closes and removes the book. Later access
/// fails until the label is re-enabled.
pub async fn delete_book(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<Json<DeleteBookResponse>> {
    validate_label(&label)?;
    let cancelled = state.queue.cancel_by_label(&label);
    state.books.delete(&label).await?;
    Ok(Json(DeleteBookResponse { label, cancelled }))
}

/// POST /books/:label/reenable
pub async fn reenable_book(
    State(state): State<AppState>,
    Path(label): Path<String>,
) -> ApiResult<Json<ReenableResponse>> {
    validate_label(&label)?;
    let reenabled = state.books.reenable(&label);
    Ok(Json(ReenableResponse { label, reenabled }))
}

/// Build book routes
pub fn book_routes() -> Router<AppState> {
    Router::new()
        .route("/books", get(list_books))
        .route("/books/:label", post(create_book).delete(delete_book))
        .route("/books/:label/reenable", post(reenable_book))
}
