use axum::{Router, routing::get};

use crate::{state::AppState, ws::handler::aggregate_ws_handler};

pub fn create_ws_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws/ratings/{target_id}", get(aggregate_ws_handler))
        .with_state(state)
}
