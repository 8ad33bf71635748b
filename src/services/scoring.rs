//! Flyability scoring via the external model service, plus persistence of
//! per-metric predictions and the feature-vector archive.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Duration;

/// Probability that at least a short local flight is possible.
pub const METRIC_XC0: &str = "xc0";
/// Probability of a cross-country flight of at least 10 km.
pub const METRIC_XC10: &str = "xc10";
/// Probability of a cross-country flight of at least 50 km.
pub const METRIC_XC50: &str = "xc50";

pub const METRICS: [&str; 3] = [METRIC_XC0, METRIC_XC10, METRIC_XC50];

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    features: &'a [f64],
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    scores: BTreeMap<String, f64>,
}

#[derive(Clone)]
pub struct ScoreClient {
    http: Client,
    base_url: String,
}

impl ScoreClient {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Scores one feature vector. Returns metric name -> probability in [0, 1].
    pub async fn score(&self, features: &[f64]) -> Result<BTreeMap<String, f64>> {
        let url = format!("{}/score", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&ScoreRequest { features })
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .context("scoring request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("scoring HTTP {status}: {body}");
        }

        let payload: ScoreResponse = response
            .json()
            .await
            .context("failed to decode scoring response")?;

        validate_scores(&payload.scores)?;
        Ok(payload.scores)
    }
}

/// A usable scorer response covers every known metric with a probability in
/// [0, 1]. Extra metrics are stored as-is.
fn validate_scores(scores: &BTreeMap<String, f64>) -> Result<()> {
    for metric in METRICS {
        if !scores.contains_key(metric) {
            anyhow::bail!("scoring response is missing metric {metric}");
        }
    }
    for (metric, value) in scores {
        if !value.is_finite() || !(0.0..=1.0).contains(value) {
            anyhow::bail!("scoring returned {value} for metric {metric}");
        }
    }
    Ok(())
}

/// Replaces all predictions for one (site, date) in a single transaction.
pub async fn store_predictions(
    pool: &PgPool,
    site_id: i64,
    forecast_date: NaiveDate,
    scores: &BTreeMap<String, f64>,
    computed_at: DateTime<Utc>,
    source_run_at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin prediction tx")?;
    sqlx::query(
        r#"
        DELETE FROM predictions
        WHERE site_id = $1 AND forecast_date = $2
        "#,
    )
    .bind(site_id)
    .bind(forecast_date)
    .execute(&mut *tx)
    .await?;

    for (metric, probability) in scores {
        sqlx::query(
            r#"
            INSERT INTO predictions (site_id, forecast_date, metric, probability, computed_at, source_run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(site_id)
        .bind(forecast_date)
        .bind(metric)
        .bind(probability)
        .bind(computed_at)
        .bind(source_run_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await.context("failed to commit prediction tx")?;
    Ok(())
}

/// Archives the feature vector for similarity lookups. The first write for a
/// (site, date) wins so historical vectors stay stable across model runs.
pub async fn archive_feature_vector(
    pool: &PgPool,
    site_id: i64,
    forecast_date: NaiveDate,
    features: &[f64],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feature_vectors (site_id, forecast_date, features)
        VALUES ($1, $2, $3)
        ON CONFLICT (site_id, forecast_date) DO NOTHING
        "#,
    )
    .bind(site_id)
    .bind(forecast_date)
    .bind(features)
    .execute(pool)
    .await
    .context("failed to archive feature vector")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_scores() -> BTreeMap<String, f64> {
        METRICS
            .iter()
            .map(|metric| (metric.to_string(), 0.5))
            .collect()
    }

    #[test]
    fn accepts_a_complete_response() {
        assert!(validate_scores(&full_scores()).is_ok());
    }

    #[test]
    fn rejects_a_missing_metric() {
        let mut scores = full_scores();
        scores.remove(METRIC_XC50);
        assert!(validate_scores(&scores).is_err());
    }

    #[test]
    fn rejects_out_of_range_probabilities() {
        let mut scores = full_scores();
        scores.insert(METRIC_XC0.to_string(), 1.2);
        assert!(validate_scores(&scores).is_err());

        let mut scores = full_scores();
        scores.insert(METRIC_XC10.to_string(), f64::NAN);
        assert!(validate_scores(&scores).is_err());
    }

    #[test]
    fn extra_metrics_are_allowed() {
        let mut scores = full_scores();
        scores.insert("xc100".to_string(), 0.1);
        assert!(validate_scores(&scores).is_ok());
    }
}
