//! Rule evaluation pass: walks active rules, compares fresh predictions with
//! the last notified value per forecast date, and emits events for delivery.

pub mod eval;
pub mod types;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;

use self::eval::{candidate_window, decide_transition};
use self::types::{EmittedEvent, RuleParams, RuleRow, StateSnapshot};

#[derive(Debug, FromRow)]
struct PredictionRow {
    forecast_date: NaiveDate,
    probability: f64,
}

#[derive(Debug, FromRow)]
struct StateRow {
    forecast_date: NaiveDate,
    last_value: f64,
}

/// Evaluates every active rule against current predictions. A failing rule is
/// logged and skipped; it never aborts the pass.
pub async fn evaluate_rules_now(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<EmittedEvent>> {
    let rules: Vec<RuleRow> = sqlx::query_as(
        r#"
        SELECT r.id, r.user_id, r.site_id, s.name AS site_name, r.metric,
               r.comparator, r.threshold, r.lead_time_hours,
               r.deterioration_threshold, r.improvement_threshold
        FROM notification_rules r
        JOIN sites s ON s.id = r.site_id
        WHERE r.active
        ORDER BY r.id ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .context("failed to load active rules")?;

    let mut emitted = Vec::new();
    for rule in rules {
        match evaluate_one_rule(pool, &rule, now).await {
            Ok(mut events) => emitted.append(&mut events),
            Err(err) => {
                tracing::warn!(error = %err, rule_id = rule.id, "rule evaluation failed, skipping");
            }
        }
    }
    Ok(emitted)
}

async fn evaluate_one_rule(
    pool: &PgPool,
    rule: &RuleRow,
    now: DateTime<Utc>,
) -> Result<Vec<EmittedEvent>> {
    let params = RuleParams::from_row(rule)?;
    let (first, last) = candidate_window(now, rule.lead_time_hours);

    let predictions: Vec<PredictionRow> = sqlx::query_as(
        r#"
        SELECT forecast_date, probability
        FROM predictions
        WHERE site_id = $1 AND metric = $2
          AND forecast_date BETWEEN $3 AND $4
        ORDER BY forecast_date ASC
        "#,
    )
    .bind(rule.site_id)
    .bind(&rule.metric)
    .bind(first)
    .bind(last)
    .fetch_all(pool)
    .await
    .context("failed to load predictions for rule")?;

    let state_rows: Vec<StateRow> = sqlx::query_as(
        r#"
        SELECT forecast_date, last_value
        FROM rule_forecast_states
        WHERE rule_id = $1 AND forecast_date BETWEEN $2 AND $3
        "#,
    )
    .bind(rule.id)
    .bind(first)
    .bind(last)
    .fetch_all(pool)
    .await
    .context("failed to load rule state")?;

    let states: HashMap<NaiveDate, StateSnapshot> = state_rows
        .into_iter()
        .map(|row| {
            (
                row.forecast_date,
                StateSnapshot {
                    last_value: row.last_value,
                },
            )
        })
        .collect();

    let mut events = Vec::new();
    for prediction in predictions {
        // Predictions are stored as probabilities; rules speak percent.
        let value_pct = prediction.probability * 100.0;
        let prev = states.get(&prediction.forecast_date);
        let Some(event) = decide_transition(&params, prev, value_pct) else {
            continue;
        };

        record_notified_state(pool, rule.id, prediction.forecast_date, &event, now).await?;
        events.push(EmittedEvent {
            rule_id: rule.id,
            user_id: rule.user_id,
            site_id: rule.site_id,
            site_name: rule.site_name.clone(),
            metric: rule.metric.clone(),
            forecast_date: prediction.forecast_date,
            threshold: rule.threshold,
            comparator: params.comparator,
            event,
            emitted_at: now,
        });
    }

    if !events.is_empty() {
        sqlx::query(
            r#"
            UPDATE notification_rules SET last_triggered_at = $2 WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(now)
        .execute(pool)
        .await
        .context("failed to stamp rule trigger time")?;
    }
    Ok(events)
}

/// Upserts the per-(rule, date) state to the value just notified about.
async fn record_notified_state(
    pool: &PgPool,
    rule_id: i64,
    forecast_date: NaiveDate,
    event: &types::RuleEvent,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rule_forecast_states (rule_id, forecast_date, last_value, last_event_kind, notified_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (rule_id, forecast_date)
        DO UPDATE SET last_value = EXCLUDED.last_value,
                      last_event_kind = EXCLUDED.last_event_kind,
                      notified_at = EXCLUDED.notified_at
        "#,
    )
    .bind(rule_id)
    .bind(forecast_date)
    .bind(event.value_pct())
    .bind(event.kind_str())
    .bind(now)
    .execute(pool)
    .await
    .context("failed to upsert rule state")?;
    Ok(())
}
