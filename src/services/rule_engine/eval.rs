//! Pure transition logic for rule evaluation.
//!
//! The state a decision is made against is the last value the subscriber was
//! NOTIFIED about, not the last value observed. Small changes below the change
//! thresholds therefore accumulate across passes until the gap to the notified
//! value is large enough.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use super::types::{RuleEvent, RuleParams, StateSnapshot};

/// Decides whether a pass over one (rule, forecast date) emits an event.
/// `value_pct` is the current prediction on the 0-100 display scale.
pub fn decide_transition(
    params: &RuleParams,
    prev: Option<&StateSnapshot>,
    value_pct: f64,
) -> Option<RuleEvent> {
    let now_satisfied = params.comparator.compare(value_pct, params.threshold);

    let Some(prev) = prev else {
        if now_satisfied {
            return Some(RuleEvent::Initial { value_pct });
        }
        return None;
    };

    let was_satisfied = params.comparator.compare(prev.last_value, params.threshold);

    if !now_satisfied {
        let dropped_out = was_satisfied;
        let fell_enough = prev.last_value - value_pct >= params.deterioration_threshold;
        if dropped_out || fell_enough {
            return Some(RuleEvent::Deteriorated {
                value_pct,
                previous_pct: prev.last_value,
            });
        }
        return None;
    }

    if value_pct - prev.last_value >= params.improvement_threshold {
        return Some(RuleEvent::Improved {
            value_pct,
            previous_pct: prev.last_value,
        });
    }
    None
}

/// Inclusive date range a rule can fire for: today out to the rule's lead
/// time, rounded up to whole days.
pub fn candidate_window(now: DateTime<Utc>, lead_time_hours: i32) -> (NaiveDate, NaiveDate) {
    let today = now.date_naive();
    let horizon_days = (i64::from(lead_time_hours.max(0)) + 23) / 24;
    (today, today + Duration::days(horizon_days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rule_engine::types::Comparator;
    use chrono::TimeZone;

    fn params() -> RuleParams {
        RuleParams {
            comparator: Comparator::Gte,
            threshold: 50.0,
            deterioration_threshold: 15.0,
            improvement_threshold: 15.0,
        }
    }

    fn state(value: f64) -> StateSnapshot {
        StateSnapshot { last_value: value }
    }

    #[test]
    fn first_satisfaction_emits_initial() {
        let event = decide_transition(&params(), None, 60.0).unwrap();
        assert_eq!(event, RuleEvent::Initial { value_pct: 60.0 });
    }

    #[test]
    fn unsatisfied_rule_with_no_state_stays_silent() {
        assert_eq!(decide_transition(&params(), None, 40.0), None);
    }

    #[test]
    fn initial_is_not_repeated_while_satisfied() {
        // 60 notified, still satisfied at 62: below the improvement threshold.
        assert_eq!(decide_transition(&params(), Some(&state(60.0)), 62.0), None);
    }

    #[test]
    fn dropping_below_threshold_emits_deteriorated() {
        // 60 -> 40: falls out of the satisfied band.
        let event = decide_transition(&params(), Some(&state(60.0)), 40.0).unwrap();
        assert_eq!(
            event,
            RuleEvent::Deteriorated {
                value_pct: 40.0,
                previous_pct: 60.0
            }
        );
    }

    #[test]
    fn repeat_pass_at_same_low_value_stays_silent() {
        // After notifying 40, seeing 40 again changes nothing.
        assert_eq!(decide_transition(&params(), Some(&state(40.0)), 40.0), None);
    }

    #[test]
    fn large_drop_while_already_unsatisfied_still_fires() {
        // Notified at 40 (below threshold), now 20: a 20-point drop.
        let event = decide_transition(&params(), Some(&state(40.0)), 20.0).unwrap();
        assert_eq!(event.kind_str(), "deteriorated");
    }

    #[test]
    fn small_changes_accumulate_against_the_notified_value() {
        // Notified at 55; 65 is only +10, silent. 72 is +17 against the still
        // unchanged notified value, so it fires.
        assert_eq!(decide_transition(&params(), Some(&state(55.0)), 65.0), None);
        let event = decide_transition(&params(), Some(&state(55.0)), 72.0).unwrap();
        assert_eq!(
            event,
            RuleEvent::Improved {
                value_pct: 72.0,
                previous_pct: 55.0
            }
        );
    }

    #[test]
    fn decision_is_idempotent_for_identical_inputs() {
        let prev = state(60.0);
        let first = decide_transition(&params(), Some(&prev), 40.0);
        let second = decide_transition(&params(), Some(&prev), 40.0);
        assert_eq!(first, second);
    }

    #[test]
    fn window_starts_today_and_spans_the_lead_time() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();
        let (first, last) = candidate_window(now, 72);
        assert_eq!(first, NaiveDate::from_ymd_opt(2026, 8, 30).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2026, 9, 2).unwrap());
    }

    #[test]
    fn partial_days_round_up_to_a_whole_day() {
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();
        let (first, last) = candidate_window(now, 12);
        assert_eq!(first, NaiveDate::from_ymd_opt(2026, 8, 30).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2026, 8, 31).unwrap());
    }
}
