use crate::config::ServiceConfig;
use crate::services::push::PushGateway;
use axum::extract::FromRef;
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: ServiceConfig,
    pub db: PgPool,
    pub http: Client,
    pub push: Arc<PushGateway>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
