use axum::{extract::State, Json};
use serde::Deserialize;
use tracing::info;

use crate::api::routes::ApiState;
use crate::error::AppError;
use crate::store::gateway::Query;
use crate::types::TrackedSlugRow;
use crate::util::{ms_to_iso, now_ms};

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    pub slug: String,
}

/// `POST /track {slug}`: deactivate every currently-active tracked slug,
/// then activate the new one. At most one row stays active.
pub async fn track_handler(
    State(state): State<ApiState>,
    Json(req): Json<TrackRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let slug = req.slug.trim().to_string();
    if slug.is_empty() {
        return Err(AppError::BadRequest("slug is required".to_string()));
    }

    state
        .store
        .patch(
            "tracked_slugs",
            &Query::new().eq("active", "true"),
            &serde_json::json!({ "active": false }),
        )
        .await?;

    let row = TrackedSlugRow {
        slug: slug.clone(),
        active: true,
        tracked_at: ms_to_iso(now_ms()),
    };
    state
        .store
        .upsert("tracked_slugs", std::slice::from_ref(&row), "slug")
        .await?;

    info!(slug = %slug, "tracked slug switched");
    Ok(Json(serde_json::json!({ "slug": slug, "active": true })))
}
