use axum::{
    extract::{Path, RawQuery, State},
    Json,
};

use crate::auth::extract::InitData;
use crate::error::PipelineError;
use crate::pipeline::{FeedResponse, PlayResponse};
use crate::state::AppState;

/// GET /api/feed: Published assets newest first, with signed thumbnail URLs.
/// Optional `tag` (exact match), `limit`, and the `cursorCreatedAt`/`cursorId` pair.
/// The query string is handed over raw and only parsed once the caller is admitted.
pub async fn get_feed(
    State(state): State<AppState>,
    InitData(token): InitData,
    RawQuery(query): RawQuery,
) -> Result<Json<FeedResponse>, PipelineError> {
    Ok(Json(state.pipeline.feed(&token, query.as_deref()).await?))
}

/// GET /api/assets/{id}/play: Signed video and thumbnail URLs for one asset.
pub async fn get_play(
    State(state): State<AppState>,
    InitData(token): InitData,
    Path(id): Path<String>,
) -> Result<Json<PlayResponse>, PipelineError> {
    Ok(Json(state.pipeline.play(&token, &id).await?))
}
