//! Artifact version endpoints
//!
//! Kinds appear in paths in their kebab-case form (`text-classification`).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ApiError, ApiResult},
    store::{ArtifactKind, EditOutcome, FieldEdit, FieldPath, PageComposite, Version, VersionedPayload},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: Option<Version>,
}

/// GET .../versions response
#[derive(Debug, Serialize)]
pub struct VersionListResponse {
    pub kind: ArtifactKind,
    pub item_id: String,
    pub versions: Vec<Version>,
    /// Only reported for kinds with a current pointer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<Version>,
}

/// POST .../versions request
#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    /// `null` writes a tombstone
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct AppendResponse {
    pub version: Version,
}

/// PUT .../current request and response
#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentVersion {
    pub version: Version,
}

/// POST .../edits request
#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub path: FieldPath,
    pub value: Value,
    pub base_version: Option<Version>,
}

fn parse_kind(kind: &str) -> ApiResult<ArtifactKind> {
    Ok(kind.parse::<ArtifactKind>()?)
}

/// GET /books/:label/artifacts/:kind/:item/versions
pub async fn list_versions(
    State(state): State<AppState>,
    Path((label, kind, item_id)): Path<(String, String, String)>,
) -> ApiResult<Json<VersionListResponse>> {
    let kind = parse_kind(&kind)?;
    let store = state.store(&label).await?;

    let versions = store.list_versions(kind, &item_id).await?;
    let current = if kind.has_current_pointer() {
        store.get_current(kind, &item_id).await?
    } else {
        None
    };

    Ok(Json(VersionListResponse {
        kind,
        item_id,
        versions,
        current,
    }))
}

/// POST /books/:label/artifacts/:kind/:item/versions
///
/// Appends `latest + 1`; returns 201 with the new version.
pub async fn append_version(
    State(state): State<AppState>,
    Path((label, kind, item_id)): Path<(String, String, String)>,
    Json(request): Json<AppendRequest>,
) -> ApiResult<(StatusCode, Json<AppendResponse>)> {
    let kind = parse_kind(&kind)?;
    let store = state.store(&label).await?;
    let version = store
        .append_version(kind, &item_id, Some(request.data))
        .await?;
    Ok((StatusCode::CREATED, Json(AppendResponse { version })))
}

/// GET /books/:label/artifacts/:kind/:item?version=N
///
/// Without `version`, serves the current version if the kind has one, else
/// the latest.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path((label, kind, item_id)): Path<(String, String, String)>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Json<VersionedPayload>> {
    let kind = parse_kind(&kind)?;
    let store = state.store(&label).await?;

    store
        .read(kind, &item_id, query.version)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No {} versions for '{}'", kind, item_id)))
}

/// PUT /books/:label/artifacts/:kind/:item/current
pub async fn set_current(
    State(state): State<AppState>,
    Path((label, kind, item_id)): Path<(String, String, String)>,
    Json(request): Json<CurrentVersion>,
) -> ApiResult<Json<CurrentVersion>> {
    let kind = parse_kind(&kind)?;
    let store = state.store(&label).await?;
    store.set_current(kind, &item_id, request.version).await?;
    Ok(Json(request))
}

/// POST /books/:label/artifacts/:kind/:item/edits
///
/// Writes the edited copy as a new version; returns 201.
pub async fn edit_artifact(
    State(state): State<AppState>,
    Path((label, kind, item_id)): Path<(String, String, String)>,
    Json(request): Json<EditRequest>,
) -> ApiResult<(StatusCode, Json<EditOutcome>)> {
    let kind = parse_kind(&kind)?;
    let store = state.store(&label).await?;

    let edit = FieldEdit::new(request.path, request.value);
    let outcome = store
        .edit(kind, &item_id, &edit, request.base_version, &state.domains)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// GET /books/:label/pages/:page/:kind
pub async fn get_page(
    State(state): State<AppState>,
    Path((label, page_id, kind)): Path<(String, String, String)>,
) -> ApiResult<Json<PageComposite>> {
    let kind = parse_kind(&kind)?;
    let store = state.store(&label).await?;

    store
        .read_page(kind, &page_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No {} items under {}", kind, page_id)))
}

/// Build artifact routes
pub fn artifact_routes() -> Router<AppState> {
    Router::new()
        .route("/books/:label/artifacts/:kind/:item", get(get_artifact))
        .route(
            "/books/:label/artifacts/:kind/:item/versions",
            get(list_versions).post(append_version),
        )
        .route("/books/:label/artifacts/:kind/:item/current", put(set_current))
        .route("/books/:label/artifacts/:kind/:item/edits", post(edit_artifact))
        .route("/books/:label/pages/:page/:kind", get(get_page))
}
