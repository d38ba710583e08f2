use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    http::handlers::{
        get_aggregate_handler, get_rating_handler, list_ratings_handler, submit_rating_handler,
    },
    state::AppState,
};

pub fn create_http_routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/ratings/{target_id}",
            post(submit_rating_handler).get(get_aggregate_handler),
        )
        .route("/ratings/{target_id}/reviews", get(list_ratings_handler))
        .route(
            "/ratings/{target_id}/raters/{rater_id}",
            get(get_rating_handler),
        )
        .with_state(state)
}
