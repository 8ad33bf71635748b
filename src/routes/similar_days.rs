use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::features::DayAggregates;
use crate::services::similarity;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SimilarDaysQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Serialize)]
pub struct DisplayAggregates {
    pub wind_speed_mean_mps: f64,
    pub wind_gust_max_mps: f64,
    pub wind_direction_mean_deg: f64,
    pub temperature_max_c: f64,
    pub humidity_mean_pct: f64,
    pub precipitation_sum_mm: f64,
    pub cloud_cover_mean_pct: f64,
    pub pressure_mean_kpa: f64,
}

impl From<DayAggregates> for DisplayAggregates {
    fn from(a: DayAggregates) -> Self {
        Self {
            wind_speed_mean_mps: a.wind_speed_mean_mps,
            wind_gust_max_mps: a.wind_gust_max_mps,
            wind_direction_mean_deg: a.wind_direction_mean_deg,
            temperature_max_c: a.temperature_max_c,
            humidity_mean_pct: a.humidity_mean_pct,
            precipitation_sum_mm: a.precipitation_sum_mm,
            cloud_cover_mean_pct: a.cloud_cover_mean_pct,
            pressure_mean_kpa: a.pressure_mean_kpa,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SimilarDayResponse {
    pub past_date: NaiveDate,
    pub similarity: f64,
    /// `null` when the archived vector cannot be rendered (older extractor).
    pub conditions: Option<DisplayAggregates>,
}

pub(crate) async fn similar_days_handler(
    State(state): State<AppState>,
    Path(site_id): Path<i64>,
    Query(query): Query<SimilarDaysQuery>,
) -> AppResult<Json<Vec<SimilarDayResponse>>> {
    let internal = |err: anyhow::Error| {
        tracing::error!(error = %err, site_id, "failed to load similar days");
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to load similar days",
        )
    };

    let similar = similarity::load_similar_dates(&state.db, site_id, query.date)
        .await
        .map_err(internal)?;

    let mut response = Vec::with_capacity(similar.len());
    for day in similar {
        let conditions = similarity::reconstruct_display(&state.db, site_id, day.past_date)
            .await
            .map_err(internal)?
            .map(DisplayAggregates::from);
        response.push(SimilarDayResponse {
            past_date: day.past_date,
            similarity: day.similarity,
            conditions,
        });
    }
    Ok(Json(response))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/sites/{site_id}/similar-days", get(similar_days_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn rejects_a_missing_date() {
        let app = router().with_state(crate::test_support::test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/sites/3/similar-days")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_a_malformed_date() {
        let app = router().with_state(crate::test_support::test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/sites/3/similar-days?date=not-a-date")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
