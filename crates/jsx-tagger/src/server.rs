use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::source_map::{JsxLocation, SourceMapManager};

#[derive(Debug, Deserialize)]
pub struct LocateQuery {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ByFileQuery {
    pub file: String,
}

#[derive(Debug, Serialize)]
struct FileEntry {
    id: String,
    #[serde(flatten)]
    location: JsxLocation,
}

/// CORS-open query surface over the id -> location map, mounted on the
/// bundler's middleware chain.
pub fn router(map: Arc<SourceMapManager>) -> Router {
    Router::new()
        .route("/__jsx-source-map", get(source_map))
        .route("/__jsx-locate", get(locate))
        .route("/__jsx-by-file", get(by_file))
        .layer(CorsLayer::permissive())
        .with_state(map)
}

async fn source_map(
    State(map): State<Arc<SourceMapManager>>,
) -> Json<HashMap<String, JsxLocation>> {
    Json(map.snapshot())
}

async fn locate(
    State(map): State<Arc<SourceMapManager>>,
    Query(query): Query<LocateQuery>,
) -> impl IntoResponse {
    match map.get(&query.id) {
        Some(location) => Json(location).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown id", "id": query.id })),
        )
            .into_response(),
    }
}

async fn by_file(
    State(map): State<Arc<SourceMapManager>>,
    Query(query): Query<ByFileQuery>,
) -> Json<Vec<FileEntry>> {
    let entries = map
        .entries_for_file(&query.file)
        .into_iter()
        .map(|(id, location)| FileEntry { id, location })
        .collect();
    Json(entries)
}
