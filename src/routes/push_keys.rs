use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub public_key: Option<String>,
    pub configured: bool,
}

/// VAPID public key browsers need to create a push subscription. `null` when
/// the deployment has no key configured.
pub(crate) async fn public_key_handler(
    State(state): State<AppState>,
) -> AppResult<Json<PublicKeyResponse>> {
    let public_key = state.push.public_key_b64().map_err(|err| {
        tracing::error!(error = %err, "failed to derive VAPID public key");
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Push configuration error",
        )
    })?;
    Ok(Json(PublicKeyResponse {
        configured: public_key.is_some(),
        public_key,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/push/public-key", get(public_key_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn unconfigured_gateway_reports_null_key() {
        let app = router().with_state(crate::test_support::test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/push/public-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["configured"], false);
        assert_eq!(json["public_key"], serde_json::Value::Null);
    }
}
