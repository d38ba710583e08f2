use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::{
    auth::CurrentIdentity,
    errors::AppError,
    models::rating::{AggregateRecord, RatingRecord, Stars, SubmitRatingPayload},
    state::AppState,
};

/// Takes the raw body so a bad payload is reported after the caller is
/// identified, and so any non-integer `stars` is an invalid rating.
pub async fn submit_rating_handler(
    State(state): State<AppState>,
    identity: CurrentIdentity,
    Path(target_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<AggregateRecord>, (StatusCode, String)> {
    let reject = |e: AppError| {
        tracing::info!("Rating submission for {} rejected: {}", target_id, e);
        e.to_response()
    };

    state.engine.authorize(&identity, target_id).map_err(reject)?;

    let payload: SubmitRatingPayload = serde_json::from_slice(&body)
        .map_err(|e| reject(AppError::BadRequest(format!("Malformed rating body: {e}"))))?;
    let stars = Stars::try_from(&payload.stars).map_err(reject)?;

    let aggregate = state
        .engine
        .submit(&identity, target_id, stars.into(), payload.review)
        .await
        .map_err(reject)?;

    Ok(Json(aggregate))
}

pub async fn get_aggregate_handler(
    State(state): State<AppState>,
    Path(target_id): Path<Uuid>,
) -> Result<Json<AggregateRecord>, (StatusCode, String)> {
    let aggregate = state.engine.get_aggregate(target_id).await.map_err(|e| {
        tracing::error!("Error reading aggregate for {}: {}", target_id, e);
        e.to_response()
    })?;

    Ok(Json(aggregate))
}

pub async fn list_ratings_handler(
    State(state): State<AppState>,
    Path(target_id): Path<Uuid>,
) -> Result<Json<Vec<RatingRecord>>, (StatusCode, String)> {
    let ratings = state.engine.list_ratings(target_id).await.map_err(|e| {
        tracing::error!("Error listing ratings for {}: {}", target_id, e);
        e.to_response()
    })?;

    Ok(Json(ratings))
}

pub async fn get_rating_handler(
    State(state): State<AppState>,
    Path((target_id, rater_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RatingRecord>, (StatusCode, String)> {
    let rating = state
        .engine
        .get_rating(target_id, rater_id)
        .await
        .map_err(|e| {
            tracing::error!("Error reading rating {} on {}: {}", rater_id, target_id, e);
            e.to_response()
        })?
        .ok_or_else(|| AppError::NotFound("Rating not found".into()).to_response())?;

    Ok(Json(rating))
}
