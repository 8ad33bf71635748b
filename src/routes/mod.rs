pub mod events;
pub mod health;
pub mod push_keys;
pub mod similar_days;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(events::router())
                .merge(push_keys::router())
                .merge(similar_days::router()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
