//! Image endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    /// Narrows the fallback scan to one page's images
    pub page: Option<String>,
}

/// POST /books/:label/images request
#[derive(Debug, Deserialize)]
pub struct UploadImageRequest {
    pub file_name: String,
    /// Base64 bytes, optionally as a data URL
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct UploadImageResponse {
    pub file_name: String,
    pub hash: String,
}

fn content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// POST /books/:label/images
pub async fn upload_image(
    State(state): State<AppState>,
    Path(label): Path<String>,
    Json(request): Json<UploadImageRequest>,
) -> ApiResult<(StatusCode, Json<UploadImageResponse>)> {
    let images = state.images(&label).await?;
    let hash = images
        .store_image_base64(&request.file_name, &request.data)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadImageResponse {
            file_name: request.file_name,
            hash,
        }),
    ))
}

/// GET /books/:label/images/:hash?page=pg001
pub async fn get_image(
    State(state): State<AppState>,
    Path((label, hash)): Path<(String, String)>,
    Query(query): Query<ImageQuery>,
) -> ApiResult<impl IntoResponse> {
    let images = state.images(&label).await?;
    let path = images
        .lookup(&hash, query.page.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No image with hash {}", hash)))?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read {}: {}", path.display(), e)))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    Ok(([(header::CONTENT_TYPE, content_type(file_name))], bytes))
}

/// Build image routes
pub fn image_routes() -> Router<AppState> {
    Router::new()
        .route("/books/:label/images", post(upload_image))
        .route("/books/:label/images/:hash", get(get_image))
}
