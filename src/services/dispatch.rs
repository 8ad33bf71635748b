//! Fan-out of emitted rule events to the owner's push subscriptions, with a
//! per-delivery audit row in `notification_events`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{json, Value as JsonValue};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::services::push::{PushGateway, PushOutcome};
use crate::services::rule_engine::types::{EmittedEvent, RuleEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
    Skipped,
    ConfigMissing,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::ConfigMissing => "config_missing",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub config_missing: usize,
}

impl DispatchSummary {
    pub fn absorb(&mut self, other: DispatchSummary) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.config_missing += other.config_missing;
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: i64,
    endpoint: String,
    p256dh: String,
    auth: String,
}

/// Notification body shown by the service worker. Kept flat so the client
/// does not need to know the event taxonomy.
pub fn build_payload(event: &EmittedEvent) -> JsonValue {
    let (headline, previous_pct) = match &event.event {
        RuleEvent::Initial { .. } => ("Flyable day ahead", None),
        RuleEvent::Deteriorated { previous_pct, .. } => {
            ("Forecast deteriorated", Some(*previous_pct))
        }
        RuleEvent::Improved { previous_pct, .. } => ("Forecast improved", Some(*previous_pct)),
    };
    json!({
        "headline": headline,
        "kind": event.event.kind_str(),
        "site": event.site_name,
        "site_id": event.site_id,
        "metric": event.metric,
        "forecast_date": event.forecast_date.to_string(),
        "value_pct": event.event.value_pct(),
        "previous_pct": previous_pct,
        "threshold_pct": event.threshold,
        "comparator": event.comparator.as_str(),
    })
}

/// Delivers one emitted event to every active subscription of its owner.
///
/// Every delivery attempt gets its own audit row. An unconfigured gateway is
/// recorded per row but logged only once per pass via `config_missing_logged`.
pub async fn dispatch_event(
    pool: &PgPool,
    push: &PushGateway,
    event: &EmittedEvent,
    config_missing_logged: &mut bool,
) -> Result<DispatchSummary> {
    let payload = build_payload(event);
    let mut summary = DispatchSummary::default();

    let subscriptions: Vec<SubscriptionRow> = sqlx::query_as(
        r#"
        SELECT id, endpoint, p256dh, auth
        FROM push_subscriptions
        WHERE user_id = $1 AND is_active
        ORDER BY id ASC
        "#,
    )
    .bind(event.user_id)
    .fetch_all(pool)
    .await
    .context("failed to load push subscriptions")?;

    if subscriptions.is_empty() {
        record_event(pool, event, None, &payload, DeliveryStatus::Skipped).await?;
        summary.skipped += 1;
        return Ok(summary);
    }

    if !push.configured() {
        if !*config_missing_logged {
            tracing::warn!("push delivery requested but no VAPID key is configured");
            *config_missing_logged = true;
        }
        for sub in &subscriptions {
            record_event(pool, event, Some(sub.id), &payload, DeliveryStatus::ConfigMissing)
                .await?;
            summary.config_missing += 1;
        }
        return Ok(summary);
    }

    let mut event_ids = Vec::with_capacity(subscriptions.len());
    for sub in &subscriptions {
        let id = record_event(pool, event, Some(sub.id), &payload, DeliveryStatus::Queued).await?;
        event_ids.push(id);
    }

    let body = serde_json::to_vec(&payload).context("failed to encode push payload")?;
    let sends = subscriptions
        .iter()
        .map(|sub| push.send(&sub.endpoint, &sub.p256dh, &sub.auth, &body));
    let outcomes = join_all(sends).await;

    for ((sub, event_id), outcome) in subscriptions.iter().zip(event_ids).zip(outcomes) {
        match outcome {
            Ok(PushOutcome::Delivered) => {
                set_event_status(pool, event_id, DeliveryStatus::Sent).await?;
                summary.sent += 1;
            }
            Ok(PushOutcome::Gone) => {
                tracing::info!(subscription_id = sub.id, "subscription gone, deactivating");
                deactivate_subscription(pool, sub.id).await?;
                set_event_status(pool, event_id, DeliveryStatus::Failed).await?;
                summary.failed += 1;
            }
            Ok(PushOutcome::Rejected(reason)) => {
                tracing::warn!(subscription_id = sub.id, reason, "push endpoint rejected delivery");
                set_event_status(pool, event_id, DeliveryStatus::Failed).await?;
                summary.failed += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, subscription_id = sub.id, "push delivery failed");
                set_event_status(pool, event_id, DeliveryStatus::Failed).await?;
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

async fn record_event(
    pool: &PgPool,
    event: &EmittedEvent,
    subscription_id: Option<i64>,
    payload: &JsonValue,
    status: DeliveryStatus,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO notification_events
            (rule_id, subscription_id, forecast_date, event_kind, payload, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
        RETURNING id
        "#,
    )
    .bind(event.rule_id)
    .bind(subscription_id)
    .bind(event.forecast_date)
    .bind(event.event.kind_str())
    .bind(payload)
    .bind(status.as_str())
    .bind(event.emitted_at)
    .fetch_one(pool)
    .await
    .context("failed to record notification event")?;
    Ok(id)
}

async fn set_event_status(pool: &PgPool, event_id: i64, status: DeliveryStatus) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE notification_events
        SET status = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(event_id)
    .bind(status.as_str())
    .execute(pool)
    .await
    .context("failed to update notification event status")?;
    Ok(())
}

async fn deactivate_subscription(pool: &PgPool, subscription_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE push_subscriptions SET is_active = FALSE WHERE id = $1
        "#,
    )
    .bind(subscription_id)
    .execute(pool)
    .await
    .context("failed to deactivate push subscription")?;
    Ok(())
}

#[derive(Debug, FromRow)]
pub struct RecentEventRow {
    pub id: i64,
    pub rule_id: i64,
    pub site_name: String,
    pub metric: String,
    pub forecast_date: chrono::NaiveDate,
    pub event_kind: String,
    pub payload: JsonValue,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Recent events for one user, collapsed to one row per rule firing even when
/// the delivery fanned out to several subscriptions.
pub async fn recent_events(
    pool: &PgPool,
    user_id: Uuid,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<RecentEventRow>> {
    let rows: Vec<RecentEventRow> = sqlx::query_as(
        r#"
        SELECT e.id, e.rule_id, s.name AS site_name, r.metric,
               e.forecast_date, e.event_kind, e.payload, e.status, e.created_at
        FROM notification_events e
        JOIN notification_rules r ON r.id = e.rule_id
        JOIN sites s ON s.id = r.site_id
        WHERE r.user_id = $1
          AND e.created_at >= $2
          AND e.id IN (
              SELECT MIN(id)
              FROM notification_events
              GROUP BY rule_id, forecast_date, event_kind, created_at
          )
        ORDER BY e.created_at DESC, e.id DESC
        LIMIT $3
        "#,
    )
    .bind(user_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to load recent events")?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rule_engine::types::Comparator;
    use chrono::{NaiveDate, TimeZone};

    fn emitted(event: RuleEvent) -> EmittedEvent {
        EmittedEvent {
            rule_id: 7,
            user_id: Uuid::nil(),
            site_id: 3,
            site_name: "Col de Bleyne".to_string(),
            metric: "xc10".to_string(),
            forecast_date: NaiveDate::from_ymd_opt(2026, 9, 2).unwrap(),
            threshold: 50.0,
            comparator: Comparator::Gte,
            event,
            emitted_at: Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn initial_payload_has_no_previous_value() {
        let payload = build_payload(&emitted(RuleEvent::Initial { value_pct: 63.0 }));
        assert_eq!(payload["kind"], "initial");
        assert_eq!(payload["value_pct"], 63.0);
        assert_eq!(payload["previous_pct"], JsonValue::Null);
        assert_eq!(payload["site"], "Col de Bleyne");
        assert_eq!(payload["forecast_date"], "2026-09-02");
    }

    #[test]
    fn deteriorated_payload_carries_both_values() {
        let payload = build_payload(&emitted(RuleEvent::Deteriorated {
            value_pct: 40.0,
            previous_pct: 60.0,
        }));
        assert_eq!(payload["kind"], "deteriorated");
        assert_eq!(payload["value_pct"], 40.0);
        assert_eq!(payload["previous_pct"], 60.0);
        assert_eq!(payload["comparator"], ">=");
    }

    #[test]
    fn status_strings_match_storage_values() {
        assert_eq!(DeliveryStatus::Queued.as_str(), "queued");
        assert_eq!(DeliveryStatus::Sent.as_str(), "sent");
        assert_eq!(DeliveryStatus::Failed.as_str(), "failed");
        assert_eq!(DeliveryStatus::Skipped.as_str(), "skipped");
        assert_eq!(DeliveryStatus::ConfigMissing.as_str(), "config_missing");
    }

    #[test]
    fn summaries_accumulate() {
        let mut total = DispatchSummary::default();
        total.absorb(DispatchSummary {
            sent: 2,
            failed: 1,
            skipped: 0,
            config_missing: 0,
        });
        total.absorb(DispatchSummary {
            sent: 0,
            failed: 0,
            skipped: 1,
            config_missing: 3,
        });
        assert_eq!(total.sent, 2);
        assert_eq!(total.failed, 1);
        assert_eq!(total.skipped, 1);
        assert_eq!(total.config_missing, 3);
    }
}
