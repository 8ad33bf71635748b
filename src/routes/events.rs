use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::dispatch;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RecentEventsQuery {
    pub user_id: Uuid,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub id: i64,
    pub rule_id: i64,
    pub site_name: String,
    pub metric: String,
    pub forecast_date: NaiveDate,
    pub event_kind: String,
    pub payload: JsonValue,
    pub status: String,
    pub created_at: String,
}

pub(crate) async fn recent_events_handler(
    State(state): State<AppState>,
    Query(query): Query<RecentEventsQuery>,
) -> AppResult<Json<Vec<EventResponse>>> {
    let limit = query.limit.unwrap_or(50);
    if !(1..=500).contains(&limit) {
        return Err(AppError::bad_request("limit must be between 1 and 500"));
    }
    let since = query.since.unwrap_or_else(|| Utc::now() - Duration::days(7));

    let rows = dispatch::recent_events(&state.db, query.user_id, since, limit)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to load recent events");
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load events",
            )
        })?;

    let events = rows
        .into_iter()
        .map(|row| EventResponse {
            id: row.id,
            rule_id: row.rule_id,
            site_name: row.site_name,
            metric: row.metric,
            forecast_date: row.forecast_date,
            event_kind: row.event_kind,
            payload: row.payload,
            status: row.status,
            created_at: row.created_at.to_rfc3339(),
        })
        .collect();
    Ok(Json(events))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/events/recent", get(recent_events_handler))
}
