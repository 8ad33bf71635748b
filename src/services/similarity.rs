//! Similar-day lookup over the feature-vector archive.
//!
//! For each scored (site, date) the pipeline ranks archived past days by
//! cosine similarity of their scaled feature vectors and stores the top-k so
//! the UI can show "days like this one" without recomputing anything.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use sqlx::{FromRow, PgPool};

use crate::services::features::{from_feature_vector, DayAggregates};

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SimilarDay {
    pub past_date: NaiveDate,
    pub similarity: f64,
}

/// Cosine similarity of two vectors. `None` on dimension mismatch or when
/// either vector has zero magnitude.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Ranks archived days against a query vector. Ties break toward the more
/// recent date; incomparable entries (wrong dimension, zero vector) are
/// skipped rather than failing the pass.
pub fn rank_similar(
    archive: &[(NaiveDate, Vec<f64>)],
    query: &[f64],
    k: usize,
) -> Vec<SimilarDay> {
    let mut ranked: Vec<SimilarDay> = archive
        .iter()
        .filter_map(|(date, features)| {
            cosine_similarity(features, query).map(|similarity| SimilarDay {
                past_date: *date,
                similarity,
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.past_date.cmp(&a.past_date))
    });
    ranked.truncate(k);
    ranked
}

#[derive(Debug, FromRow)]
struct ArchiveRow {
    forecast_date: NaiveDate,
    features: Vec<f64>,
}

/// Loads the archive for a site (strictly before `exclude_date`) and returns
/// the top-k most similar past days.
pub async fn find_similar_days(
    pool: &PgPool,
    site_id: i64,
    query: &[f64],
    k: usize,
    exclude_date: NaiveDate,
) -> Result<Vec<SimilarDay>> {
    let rows: Vec<ArchiveRow> = sqlx::query_as(
        r#"
        SELECT forecast_date, features
        FROM feature_vectors
        WHERE site_id = $1 AND forecast_date < $2
        "#,
    )
    .bind(site_id)
    .bind(exclude_date)
    .fetch_all(pool)
    .await
    .context("failed to load feature-vector archive")?;

    let archive: Vec<(NaiveDate, Vec<f64>)> = rows
        .into_iter()
        .map(|row| (row.forecast_date, row.features))
        .collect();
    Ok(rank_similar(&archive, query, k))
}

/// Replaces the similar-day set for one (site, date) wholesale.
pub async fn rebuild_similar_dates(
    pool: &PgPool,
    site_id: i64,
    forecast_date: NaiveDate,
    similar: &[SimilarDay],
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin similar-dates tx")?;
    sqlx::query(
        r#"
        DELETE FROM similar_dates
        WHERE site_id = $1 AND forecast_date = $2
        "#,
    )
    .bind(site_id)
    .bind(forecast_date)
    .execute(&mut *tx)
    .await?;

    for day in similar {
        sqlx::query(
            r#"
            INSERT INTO similar_dates (site_id, forecast_date, past_date, similarity)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(site_id)
        .bind(forecast_date)
        .bind(day.past_date)
        .bind(day.similarity)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await.context("failed to commit similar-dates tx")?;
    Ok(())
}

/// Stored similar-day set for one (site, date), best match first.
pub async fn load_similar_dates(
    pool: &PgPool,
    site_id: i64,
    forecast_date: NaiveDate,
) -> Result<Vec<SimilarDay>> {
    let rows: Vec<SimilarDay> = sqlx::query_as(
        r#"
        SELECT past_date, similarity
        FROM similar_dates
        WHERE site_id = $1 AND forecast_date = $2
        ORDER BY similarity DESC, past_date DESC
        "#,
    )
    .bind(site_id)
    .bind(forecast_date)
    .fetch_all(pool)
    .await
    .context("failed to load similar dates")?;
    Ok(rows)
}

/// Renders an archived vector back into display units for a similar-day row.
pub async fn reconstruct_display(
    pool: &PgPool,
    site_id: i64,
    past_date: NaiveDate,
) -> Result<Option<DayAggregates>> {
    let row: Option<ArchiveRow> = sqlx::query_as(
        r#"
        SELECT forecast_date, features
        FROM feature_vectors
        WHERE site_id = $1 AND forecast_date = $2
        "#,
    )
    .bind(site_id)
    .bind(past_date)
    .fetch_optional(pool)
    .await
    .context("failed to load archived feature vector")?;

    Ok(row.and_then(|r| from_feature_vector(&r.features)))
}
