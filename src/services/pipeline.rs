//! Full-pipeline orchestration: fetch, score, index, evaluate, deliver.
//!
//! Exactly one pipeline run is in flight at a time. Overlapping triggers are
//! dropped with a warning rather than queued, since the next scheduled tick
//! will pick up whatever the dropped run would have done.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::services::dispatch::{self, DispatchSummary};
use crate::services::features::to_feature_vector;
use crate::services::ingest::{
    load_sites, store_forecasts, validate_forecasts, RawForecastRecord, SiteRow, WeatherClient,
};
use crate::services::rule_engine;
use crate::services::scoring::{archive_feature_vector, store_predictions, ScoreClient};
use crate::services::similarity::{find_similar_days, rebuild_similar_dates};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineTrigger {
    /// A new upstream model run was detected by the data poll.
    DataPoll,
    /// Periodic re-evaluation without refetching weather data.
    Interval,
    /// Operator-requested run (`--run-once`).
    Manual,
}

impl fmt::Display for PipelineTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DataPoll => "data_poll",
            Self::Interval => "interval",
            Self::Manual => "manual",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineResult {
    pub predictions_written: usize,
    pub similar_sets_rebuilt: usize,
    pub events_emitted: usize,
    pub delivery: DispatchSummary,
}

pub struct PipelineService {
    state: AppState,
    weather: WeatherClient,
    scorer: ScoreClient,
    run_guard: Mutex<()>,
}

impl PipelineService {
    pub fn new(state: AppState) -> Arc<Self> {
        let weather = WeatherClient::new(
            state.http.clone(),
            state.config.weather_api_base_url.clone(),
        );
        let scorer = ScoreClient::new(state.http.clone(), state.config.scorer_api_base_url.clone());
        Arc::new(Self {
            state,
            weather,
            scorer,
            run_guard: Mutex::new(()),
        })
    }

    /// Runs the full pipeline. Returns `Ok(None)` when another run already
    /// holds the guard.
    pub async fn run_full(
        &self,
        trigger: PipelineTrigger,
        run_at: DateTime<Utc>,
    ) -> Result<Option<PipelineResult>> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            tracing::warn!(%trigger, "pipeline already running, dropping trigger");
            return Ok(None);
        };

        let span = tracing::info_span!("pipeline_run", %trigger);
        let result = self.run_full_locked(run_at).instrument(span).await?;
        Ok(Some(result))
    }

    async fn run_full_locked(&self, run_at: DateTime<Utc>) -> Result<PipelineResult> {
        let now = Utc::now();
        let pool = &self.state.db;

        let sites = load_sites(pool).await?;
        if sites.is_empty() {
            tracing::warn!("site catalog is empty, nothing to forecast");
            return Ok(PipelineResult::default());
        }

        let cells = unique_grid_cells(&sites);
        let records = self
            .weather
            .fetch_raw_forecast(run_at, &cells, self.state.config.forecast_horizon_days)
            .await?;
        validate_forecasts(&records).context("upstream forecast failed validation")?;

        let by_cell = index_by_cell(&records);
        let mut result = PipelineResult::default();
        let mut scored: Vec<(i64, NaiveDate, Vec<f64>)> = Vec::new();

        for site in &sites {
            let Some(site_records) = by_cell.get(site.grid_cell.as_str()) else {
                tracing::warn!(site_id = site.id, cell = %site.grid_cell, "no forecast for site cell");
                continue;
            };
            for record in site_records {
                // A scorer or storage failure fails the whole stage; only a
                // day with no usable hours is skipped.
                match self.score_one_day(site, record, now).await? {
                    Some(features) => {
                        result.predictions_written += 1;
                        scored.push((site.id, record.forecast_date, features));
                    }
                    None => {
                        tracing::warn!(
                            site_id = site.id,
                            date = %record.forecast_date,
                            "empty forecast day, nothing to score"
                        );
                    }
                }
            }
        }

        store_forecasts(pool, &records, now).await?;
        tracing::info!(records = records.len(), cells = cells.len(), "forecasts stored");

        for (site_id, forecast_date, features) in &scored {
            let outcome = async {
                let similar = find_similar_days(
                    pool,
                    *site_id,
                    features,
                    self.state.config.similar_days_k,
                    *forecast_date,
                )
                .await?;
                rebuild_similar_dates(pool, *site_id, *forecast_date, &similar).await
            }
            .await;
            match outcome {
                Ok(()) => result.similar_sets_rebuilt += 1,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        site_id,
                        date = %forecast_date,
                        "similar-day rebuild failed, skipping"
                    );
                }
            }
        }

        let (events_emitted, delivery) = self.evaluate_and_dispatch(now).await?;
        result.events_emitted = events_emitted;
        result.delivery = delivery;

        tracing::info!(
            predictions = result.predictions_written,
            similar_sets = result.similar_sets_rebuilt,
            events = result.events_emitted,
            sent = result.delivery.sent,
            "pipeline run complete"
        );
        Ok(result)
    }

    /// Scores one site/day. `Ok(None)` means the day had no usable hours and
    /// is skipped; any scorer or storage error propagates and fails the stage
    /// so the run can be retried from the top on the next trigger.
    async fn score_one_day(
        &self,
        site: &SiteRow,
        record: &RawForecastRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<f64>>> {
        let Some(features) = to_feature_vector(&record.hours) else {
            return Ok(None);
        };
        let scores = self.scorer.score(&features).await.with_context(|| {
            format!(
                "scoring failed for site {} on {}",
                site.id, record.forecast_date
            )
        })?;
        store_predictions(
            &self.state.db,
            site.id,
            record.forecast_date,
            &scores,
            now,
            record.source_run_at,
        )
        .await?;
        archive_feature_vector(&self.state.db, site.id, record.forecast_date, &features).await?;
        Ok(Some(features))
    }

    /// Re-evaluates rules against stored predictions without touching the
    /// upstream collaborators. Shares the run guard with the full pipeline.
    pub async fn run_evaluation_only(&self) -> Result<Option<PipelineResult>> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            tracing::warn!("pipeline already running, dropping evaluation tick");
            return Ok(None);
        };

        let span = tracing::info_span!("evaluation_pass");
        async {
            let now = Utc::now();
            let (events_emitted, delivery) = self.evaluate_and_dispatch(now).await?;
            Ok(Some(PipelineResult {
                events_emitted,
                delivery,
                ..PipelineResult::default()
            }))
        }
        .instrument(span)
        .await
    }

    async fn evaluate_and_dispatch(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(usize, DispatchSummary)> {
        let events = rule_engine::evaluate_rules_now(&self.state.db, now).await?;
        let mut summary = DispatchSummary::default();
        let mut config_missing_logged = false;

        for event in &events {
            match dispatch::dispatch_event(
                &self.state.db,
                &self.state.push,
                event,
                &mut config_missing_logged,
            )
            .await
            {
                Ok(event_summary) => summary.absorb(event_summary),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        rule_id = event.rule_id,
                        "event dispatch failed, continuing"
                    );
                }
            }
        }
        Ok((events.len(), summary))
    }

    pub fn weather(&self) -> &WeatherClient {
        &self.weather
    }
}

fn unique_grid_cells(sites: &[SiteRow]) -> Vec<String> {
    let mut cells: Vec<String> = sites.iter().map(|s| s.grid_cell.clone()).collect();
    cells.sort();
    cells.dedup();
    cells
}

fn index_by_cell(records: &[RawForecastRecord]) -> HashMap<&str, Vec<&RawForecastRecord>> {
    let mut by_cell: HashMap<&str, Vec<&RawForecastRecord>> = HashMap::new();
    for record in records {
        by_cell.entry(record.grid_cell.as_str()).or_default().push(record);
    }
    by_cell
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ingest::HourlyWeather;
    use chrono::TimeZone;

    fn site(id: i64, cell: &str) -> SiteRow {
        SiteRow {
            id,
            name: format!("site-{id}"),
            grid_cell: cell.to_string(),
        }
    }

    #[test]
    fn grid_cells_are_deduplicated_and_sorted() {
        let sites = vec![site(1, "b"), site(2, "a"), site(3, "b")];
        assert_eq!(unique_grid_cells(&sites), vec!["a", "b"]);
    }

    #[test]
    fn records_are_indexed_by_cell() {
        let run_at = Utc.with_ymd_and_hms(2026, 8, 30, 6, 0, 0).unwrap();
        let record = |cell: &str, day: u32| RawForecastRecord {
            grid_cell: cell.to_string(),
            forecast_date: NaiveDate::from_ymd_opt(2026, 8, day).unwrap(),
            hours: Vec::<HourlyWeather>::new(),
            source_run_at: run_at,
        };
        let records = vec![record("a", 30), record("a", 31), record("b", 30)];
        let index = index_by_cell(&records);
        assert_eq!(index["a"].len(), 2);
        assert_eq!(index["b"].len(), 1);
    }

    #[test]
    fn triggers_render_stable_names() {
        assert_eq!(PipelineTrigger::DataPoll.to_string(), "data_poll");
        assert_eq!(PipelineTrigger::Interval.to_string(), "interval");
        assert_eq!(PipelineTrigger::Manual.to_string(), "manual");
    }
}
