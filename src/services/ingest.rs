//! Upstream weather model client and forecast persistence.
//!
//! The numerical model is an external HTTP collaborator: we only learn which
//! run is newest and pull gridded hourly values for the cells our site catalog
//! maps to. Fetch failures are surfaced to the orchestrator as stage failures
//! and retried on the next scheduled trigger, never inline.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};
use std::collections::HashSet;
use std::time::Duration;

/// One hour of atmospheric values for a grid cell, as delivered upstream and
/// as persisted in the `forecasts.hours` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyWeather {
    pub hour: u8,
    pub wind_speed_mps: f64,
    pub wind_gust_mps: f64,
    pub wind_direction_deg: f64,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub precipitation_mm: f64,
    pub cloud_cover_pct: f64,
    pub pressure_msl_kpa: f64,
}

/// Raw forecast for one (grid cell, forecast date), tagged with the model run
/// that produced it.
#[derive(Debug, Clone)]
pub struct RawForecastRecord {
    pub grid_cell: String,
    pub forecast_date: NaiveDate,
    pub hours: Vec<HourlyWeather>,
    pub source_run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SiteRow {
    pub id: i64,
    pub name: String,
    pub grid_cell: String,
}

#[derive(Debug, Deserialize)]
struct LatestRunResponse {
    run_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GriddedForecastResponse {
    run_at: DateTime<Utc>,
    #[serde(default)]
    cells: Vec<GriddedCell>,
}

#[derive(Debug, Deserialize)]
struct GriddedCell {
    grid_cell: String,
    #[serde(default)]
    days: Vec<GriddedDay>,
}

#[derive(Debug, Deserialize)]
struct GriddedDay {
    date: NaiveDate,
    #[serde(default)]
    hours: Vec<HourlyWeather>,
}

#[derive(Clone)]
pub struct WeatherClient {
    http: Client,
    base_url: String,
}

impl WeatherClient {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Reference timestamp of the newest upstream model run.
    pub async fn latest_run_at(&self) -> Result<DateTime<Utc>> {
        let url = format!("{}/runs/latest", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(12))
            .send()
            .await
            .context("weather latest-run request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("weather latest-run HTTP {status}: {body}");
        }
        let payload: LatestRunResponse = response
            .json()
            .await
            .context("failed to decode weather latest-run response")?;
        Ok(payload.run_at)
    }

    /// Pulls hourly values for every requested grid cell over the horizon.
    pub async fn fetch_raw_forecast(
        &self,
        run_at: DateTime<Utc>,
        grid_cells: &[String],
        horizon_days: i64,
    ) -> Result<Vec<RawForecastRecord>> {
        let url = format!("{}/gridded-forecast", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[
                ("cells", grid_cells.join(",")),
                ("run", run_at.to_rfc3339()),
                ("days", horizon_days.to_string()),
            ])
            .timeout(Duration::from_secs(20))
            .send()
            .await
            .context("weather forecast request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("weather forecast HTTP {status}: {body}");
        }

        let payload: GriddedForecastResponse = response
            .json()
            .await
            .context("failed to decode weather forecast response")?;

        let mut records = Vec::new();
        for cell in payload.cells {
            for day in cell.days {
                records.push(RawForecastRecord {
                    grid_cell: cell.grid_cell.clone(),
                    forecast_date: day.date,
                    hours: day.hours,
                    source_run_at: payload.run_at,
                });
            }
        }
        Ok(records)
    }
}

/// Shape check applied before anything is persisted. A violation here is fatal
/// to the whole pipeline run, not skipped per record.
pub fn validate_forecasts(records: &[RawForecastRecord]) -> Result<()> {
    let mut seen: HashSet<(NaiveDate, &str)> = HashSet::new();
    for record in records {
        if record.grid_cell.trim().is_empty() {
            anyhow::bail!("forecast record with blank grid cell for {}", record.forecast_date);
        }
        if record.hours.is_empty() || record.hours.len() > 24 {
            anyhow::bail!(
                "forecast for cell {} on {} has {} hours",
                record.grid_cell,
                record.forecast_date,
                record.hours.len()
            );
        }
        for hour in &record.hours {
            if hour.hour > 23 {
                anyhow::bail!(
                    "forecast for cell {} on {} has hour index {}",
                    record.grid_cell,
                    record.forecast_date,
                    hour.hour
                );
            }
            let values = [
                hour.wind_speed_mps,
                hour.wind_gust_mps,
                hour.wind_direction_deg,
                hour.temperature_c,
                hour.humidity_pct,
                hour.precipitation_mm,
                hour.cloud_cover_pct,
                hour.pressure_msl_kpa,
            ];
            if values.iter().any(|v| !v.is_finite()) {
                anyhow::bail!(
                    "forecast for cell {} on {} contains non-finite values",
                    record.grid_cell,
                    record.forecast_date
                );
            }
        }
        if !seen.insert((record.forecast_date, record.grid_cell.as_str())) {
            anyhow::bail!(
                "duplicate forecast record for cell {} on {}",
                record.grid_cell,
                record.forecast_date
            );
        }
    }
    Ok(())
}

pub async fn load_sites(pool: &PgPool) -> Result<Vec<SiteRow>> {
    let rows: Vec<SiteRow> = sqlx::query_as(
        r#"
        SELECT id, name, grid_cell
        FROM sites
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .context("failed to load site catalog")?;
    Ok(rows)
}

/// Replaces the stored forecast for each (date, cell) wholesale. Re-running
/// the stage for the same run overwrites rather than duplicates.
pub async fn store_forecasts(
    pool: &PgPool,
    records: &[RawForecastRecord],
    computed_at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin forecast tx")?;
    for record in records {
        sqlx::query(
            r#"
            DELETE FROM forecasts
            WHERE forecast_date = $1 AND grid_cell = $2
            "#,
        )
        .bind(record.forecast_date)
        .bind(&record.grid_cell)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO forecasts (forecast_date, grid_cell, hours, computed_at, source_run_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.forecast_date)
        .bind(&record.grid_cell)
        .bind(SqlJson(serde_json::to_value(&record.hours)?))
        .bind(computed_at)
        .bind(record.source_run_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await.context("failed to commit forecast tx")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(cell: &str, date: NaiveDate) -> RawForecastRecord {
        RawForecastRecord {
            grid_cell: cell.to_string(),
            forecast_date: date,
            hours: vec![HourlyWeather {
                hour: 12,
                wind_speed_mps: 5.0,
                wind_gust_mps: 8.0,
                wind_direction_deg: 270.0,
                temperature_c: 18.0,
                humidity_pct: 55.0,
                precipitation_mm: 0.0,
                cloud_cover_pct: 20.0,
                pressure_msl_kpa: 101.0,
            }],
            source_run_at: Utc.with_ymd_and_hms(2026, 8, 30, 6, 0, 0).unwrap(),
        }
    }

    #[test]
    fn accepts_well_formed_records() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();
        assert!(validate_forecasts(&[record("12:34", date)]).is_ok());
    }

    #[test]
    fn rejects_empty_hours() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();
        let mut bad = record("12:34", date);
        bad.hours.clear();
        assert!(validate_forecasts(&[bad]).is_err());
    }

    #[test]
    fn rejects_non_finite_values() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();
        let mut bad = record("12:34", date);
        bad.hours[0].wind_speed_mps = f64::NAN;
        assert!(validate_forecasts(&[bad]).is_err());
    }

    #[test]
    fn rejects_duplicate_date_cell_pairs() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 31).unwrap();
        let records = vec![record("12:34", date), record("12:34", date)];
        assert!(validate_forecasts(&records).is_err());
    }
}
