//! Background schedule: data poll, evaluation ticks, and retention sweeps.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::services::pipeline::{PipelineResult, PipelineService, PipelineTrigger};
use crate::state::AppState;

/// Watermark key for the last upstream model run the pipeline processed.
const WEATHER_RUN_WATERMARK: &str = "weather_run";

pub struct SchedulerService {
    state: AppState,
    pipeline: Arc<PipelineService>,
}

impl SchedulerService {
    pub fn new(state: AppState, pipeline: Arc<PipelineService>) -> Self {
        Self { state, pipeline }
    }

    pub fn start(self, cancel: CancellationToken) {
        let poll_interval = Duration::from_secs(self.state.config.data_poll_interval_seconds);
        let eval_interval = Duration::from_secs(self.state.config.evaluation_interval_seconds);
        let sweep_interval =
            Duration::from_secs(self.state.config.retention_sweep_interval_seconds);

        let pool = self.state.db.clone();
        let pipeline = self.pipeline.clone();
        let poll_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = poll_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = poll_for_new_run(&pool, &pipeline).await {
                            tracing::warn!("data poll failed: {err:#}");
                        }
                    }
                }
            }
        });

        let pipeline = self.pipeline.clone();
        let eval_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(eval_interval);
            // The first tick fires immediately; let the data poll go first.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = eval_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = pipeline.run_evaluation_only().await {
                            tracing::warn!("evaluation pass failed: {err:#}");
                        }
                    }
                }
            }
        });

        let pool = self.state.db.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_expired_state(&pool, Utc::now()).await {
                            tracing::warn!("retention sweep failed: {err:#}");
                        }
                    }
                }
            }
        });
    }
}

/// Checks the upstream model for a run newer than the stored watermark and
/// runs the full pipeline when one appears. The watermark only advances after
/// a successful run, so a failed run is retried on the next poll.
async fn poll_for_new_run(pool: &PgPool, pipeline: &PipelineService) -> Result<()> {
    let latest = pipeline.weather().latest_run_at().await?;
    let watermark = fetch_watermark(pool, WEATHER_RUN_WATERMARK).await?;

    if let Some(seen) = watermark {
        if latest <= seen {
            tracing::debug!(run_at = %latest, "no new upstream run");
            return Ok(());
        }
    }

    tracing::info!(run_at = %latest, "new upstream run detected");
    let outcome = pipeline.run_full(PipelineTrigger::DataPoll, latest).await;
    if watermark_should_advance(&outcome) {
        advance_watermark(pool, WEATHER_RUN_WATERMARK, latest).await?;
    }
    outcome.map(|_| ())
}

/// The watermark only moves past a run that completed. A failed run or a
/// dropped trigger leaves it behind so the next poll retries the same run.
fn watermark_should_advance(outcome: &Result<Option<PipelineResult>>) -> bool {
    matches!(outcome, Ok(Some(_)))
}

pub async fn fetch_watermark(pool: &PgPool, key: &str) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        SELECT run_at FROM pipeline_watermarks WHERE key = $1
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("failed to read pipeline watermark")?;
    Ok(row.map(|(run_at,)| run_at))
}

pub async fn advance_watermark(pool: &PgPool, key: &str, run_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pipeline_watermarks (key, run_at)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET run_at = EXCLUDED.run_at
        "#,
    )
    .bind(key)
    .bind(run_at)
    .execute(pool)
    .await
    .context("failed to advance pipeline watermark")?;
    Ok(())
}

/// Drops per-date rule state for dates that are already in the past. The
/// prediction and feature-vector history is kept for similarity lookups.
async fn sweep_expired_state(pool: &PgPool, now: DateTime<Utc>) -> Result<()> {
    let cutoff = retention_cutoff(now);
    let result = sqlx::query(
        r#"
        DELETE FROM rule_forecast_states WHERE forecast_date < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to sweep expired rule state")?;
    if result.rows_affected() > 0 {
        tracing::info!(rows = result.rows_affected(), %cutoff, "swept expired rule state");
    }
    Ok(())
}

/// State for dates before today can never fire again.
fn retention_cutoff(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn watermark_stays_put_when_the_run_fails() {
        let failed: Result<Option<PipelineResult>> = Err(anyhow::anyhow!("scorer unreachable"));
        assert!(!watermark_should_advance(&failed));

        let dropped: Result<Option<PipelineResult>> = Ok(None);
        assert!(!watermark_should_advance(&dropped));

        let completed: Result<Option<PipelineResult>> = Ok(Some(PipelineResult::default()));
        assert!(watermark_should_advance(&completed));
    }

    #[test]
    fn cutoff_keeps_today_and_the_future() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 23, 59, 0).unwrap();
        let cutoff = retention_cutoff(now);
        assert_eq!(cutoff, NaiveDate::from_ymd_opt(2026, 8, 30).unwrap());
        // Rows are deleted with forecast_date < cutoff, so today survives.
        assert!(NaiveDate::from_ymd_opt(2026, 8, 29).unwrap() < cutoff);
        assert!(NaiveDate::from_ymd_opt(2026, 8, 30).unwrap() >= cutoff);
    }
}
