use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Comparison applied between a prediction and the rule threshold. Both sides
/// are on the 0-100 display scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparator {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Gte),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Lte),
            "==" => Ok(Self::Eq),
            other => anyhow::bail!("unknown comparator: {other}"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Eq => "==",
        }
    }

    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => (value - threshold).abs() < 1e-9,
        }
    }
}

/// Notification rule as stored, joined with its site for display.
#[derive(Debug, Clone, FromRow)]
pub struct RuleRow {
    pub id: i64,
    pub user_id: Uuid,
    pub site_id: i64,
    pub site_name: String,
    pub metric: String,
    pub comparator: String,
    pub threshold: f64,
    pub lead_time_hours: i32,
    pub deterioration_threshold: f64,
    pub improvement_threshold: f64,
}

/// Evaluation parameters of one rule, decoupled from the storage row.
#[derive(Debug, Clone)]
pub struct RuleParams {
    pub comparator: Comparator,
    pub threshold: f64,
    pub deterioration_threshold: f64,
    pub improvement_threshold: f64,
}

impl RuleParams {
    pub fn from_row(row: &RuleRow) -> Result<Self> {
        let comparator = Comparator::parse(&row.comparator)?;
        if !(0.0..=100.0).contains(&row.threshold) {
            anyhow::bail!("rule {} threshold {} outside 0-100", row.id, row.threshold);
        }
        if row.deterioration_threshold < 0.0 || row.improvement_threshold < 0.0 {
            anyhow::bail!("rule {} has a negative change threshold", row.id);
        }
        Ok(Self {
            comparator,
            threshold: row.threshold,
            deterioration_threshold: row.deterioration_threshold,
            improvement_threshold: row.improvement_threshold,
        })
    }
}

/// What happened to a rule/date since the subscriber last heard about it.
/// Values are on the 0-100 display scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleEvent {
    Initial { value_pct: f64 },
    Deteriorated { value_pct: f64, previous_pct: f64 },
    Improved { value_pct: f64, previous_pct: f64 },
}

impl RuleEvent {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Initial { .. } => "initial",
            Self::Deteriorated { .. } => "deteriorated",
            Self::Improved { .. } => "improved",
        }
    }

    pub fn value_pct(&self) -> f64 {
        match self {
            Self::Initial { value_pct }
            | Self::Deteriorated { value_pct, .. }
            | Self::Improved { value_pct, .. } => *value_pct,
        }
    }
}

/// Last value the subscriber was actually notified about for a rule/date.
#[derive(Debug, Clone, Copy)]
pub struct StateSnapshot {
    pub last_value: f64,
}

/// A rule firing for one forecast date, ready for delivery.
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub rule_id: i64,
    pub user_id: Uuid,
    pub site_id: i64,
    pub site_name: String,
    pub metric: String,
    pub forecast_date: NaiveDate,
    pub threshold: f64,
    pub comparator: Comparator,
    pub event: RuleEvent,
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparator_round_trips_through_text() {
        for raw in [">", ">=", "<", "<=", "=="] {
            let parsed = Comparator::parse(raw).unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
        assert!(Comparator::parse("!=").is_err());
    }

    #[test]
    fn comparisons_match_their_symbols() {
        assert!(Comparator::Gt.compare(60.0, 50.0));
        assert!(!Comparator::Gt.compare(50.0, 50.0));
        assert!(Comparator::Gte.compare(50.0, 50.0));
        assert!(Comparator::Lt.compare(40.0, 50.0));
        assert!(Comparator::Lte.compare(50.0, 50.0));
        assert!(Comparator::Eq.compare(50.0, 50.0));
        assert!(!Comparator::Eq.compare(50.1, 50.0));
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let event = RuleEvent::Deteriorated {
            value_pct: 40.0,
            previous_pct: 60.0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "deteriorated");
        assert_eq!(json["value_pct"], 40.0);
        assert_eq!(json["previous_pct"], 60.0);
    }
}
