use crate::config::ServiceConfig;
use crate::db;
use crate::services::push::PushGateway;
use crate::state::AppState;
use std::sync::Arc;

pub fn test_config() -> ServiceConfig {
    ServiceConfig::for_tests()
}

/// State with a lazy pool that never connects; suitable for handler tests
/// that fail before touching the database.
pub fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url).expect("lazy pool");
    let http = reqwest::Client::new();
    let push = Arc::new(PushGateway::from_config(http.clone(), &config).expect("push gateway"));
    AppState {
        config,
        db: pool,
        http,
        push,
    }
}
