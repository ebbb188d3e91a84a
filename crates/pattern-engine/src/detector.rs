//! Recurring-action detection
//!
//! Every learnable event is counted under two keys: a day-specific one
//! (its weekday, or the non-workday scope on holidays) and a daily one.
//! Counting goes through [`PatternStore::upsert_pattern`], which applies the
//! change to the stored row atomically.

use crate::error::EngineError;
use crate::model::{ContextualEvent, DayScope, LearnedPattern, PatternCandidate, PatternKey};
use crate::retry::RetryPolicy;
use crate::scorer::{EvidenceChange, EvidenceDelta, LearningRules};
use crate::store::{PatternStore, Upserted};
use std::sync::Arc;

/// Turns tagged events into pattern evidence
pub struct PatternDetector {
    store: Arc<dyn PatternStore>,
    rules: LearningRules,
    retry: RetryPolicy,
}

impl PatternDetector {
    pub fn new(store: Arc<dyn PatternStore>, rules: LearningRules, retry: RetryPolicy) -> Self {
        Self {
            store,
            rules,
            retry,
        }
    }

    pub fn rules(&self) -> LearningRules {
        self.rules
    }

    /// Day-specific and daily keys for an event
    pub fn keys(event: &ContextualEvent) -> (PatternKey, PatternKey) {
        let scope = if event.is_holiday {
            DayScope::NonWorkday
        } else {
            DayScope::Weekday(event.weekday)
        };
        let specific = PatternKey {
            entity_id: event.entity_id().to_string(),
            action: event.action.clone(),
            time_bucket: event.time_bucket,
            scope,
        };
        let daily = specific.daily();
        (specific, daily)
    }

    /// Record one event. Returns the candidate that should represent it,
    /// preferring the day-specific pattern once that one is confirmed, or
    /// `None` for echoes and replays.
    pub async fn observe(&self, event: &ContextualEvent) -> Result<Option<PatternCandidate>, EngineError> {
        if event.is_automation_echo {
            return Ok(None);
        }

        let (specific_key, daily_key) = Self::keys(event);
        let specific = self.upsert(&specific_key, event, false).await?;

        // A confirmed narrower pattern keeps the daily one as a fallback only
        let hold_daily = specific.record.status().is_confirmed();
        let daily = self.upsert(&daily_key, event, hold_daily).await?;

        if !specific.applied.changed && !daily.applied.changed {
            tracing::debug!("Replay of {} ignored by store", event.fingerprint());
            return Ok(None);
        }

        let specific_wins = specific.applied.promoted
            || (specific.record.status().is_confirmed() && !daily.applied.promoted);
        let chosen = if specific_wins { specific } else { daily };

        let mut candidate = PatternCandidate::from(&chosen.record);
        candidate.newly_suggested = chosen.applied.promoted;
        Ok(Some(candidate))
    }

    async fn upsert(
        &self,
        key: &PatternKey,
        event: &ContextualEvent,
        hold_promotion: bool,
    ) -> Result<Upserted<LearnedPattern>, EngineError> {
        let delta = EvidenceDelta {
            change: EvidenceChange::Observation {
                fingerprint: event.fingerprint(),
                at: event.occurred_at(),
                activity_date: event.activity_date,
                weight: event.evidence_weight,
                hold_promotion,
            },
            rules: self.rules.for_scope(key.scope),
        };
        let store = &self.store;
        let label = key.to_string();
        self.retry
            .run(&label, move || store.upsert_pattern(key, delta.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DayPhase, PatternStatus, StateEvent, TimeBucket};
    use crate::scorer::ConfidenceScorer;
    use crate::store::MemoryPatternStore;
    use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

    fn rules() -> LearningRules {
        LearningRules {
            scorer: ConfidenceScorer::default(),
            min_repetitions: 3,
            min_distinct_days: 3,
        }
    }

    fn event_at(at: DateTime<Utc>, holiday: bool) -> ContextualEvent {
        ContextualEvent {
            event: StateEvent::new("light.l1", "off", "on", at),
            action: "on".to_string(),
            time_bucket: TimeBucket::at(22, 0),
            day_phase: DayPhase::Night,
            weekday: at.weekday().num_days_from_sunday() as u8,
            activity_date: at.date_naive(),
            is_holiday: holiday,
            person_context: "alice".to_string(),
            evidence_weight: 1.0,
            is_automation_echo: false,
            room: None,
        }
    }

    fn detector() -> (PatternDetector, Arc<MemoryPatternStore>) {
        let store = Arc::new(MemoryPatternStore::new());
        (PatternDetector::new(store.clone(), rules(), RetryPolicy::once()), store)
    }

    // Monday 2024-03-04 22:00 UTC
    fn monday(week: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 22, 0, 0).unwrap() + Duration::weeks(week)
    }

    #[tokio::test]
    async fn test_counts_both_granularities() {
        let (detector, store) = detector();
        let event = event_at(monday(0), false);
        detector.observe(&event).await.unwrap();

        let (specific, daily) = PatternDetector::keys(&event);
        assert_eq!(specific.scope, DayScope::Weekday(1));
        assert_eq!(store.get_pattern(&specific).await.unwrap().unwrap().match_count(), 1);
        assert_eq!(store.get_pattern(&daily).await.unwrap().unwrap().match_count(), 1);
    }

    #[tokio::test]
    async fn test_holiday_uses_non_workday_scope() {
        let (detector, _) = detector();
        let (specific, _) = PatternDetector::keys(&event_at(monday(0), true));
        assert_eq!(specific.scope, DayScope::NonWorkday);
        assert!(detector.observe(&event_at(monday(0), true)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_weekday_pattern_takes_precedence() {
        let (detector, store) = detector();
        let mut last = None;
        for week in 0..3 {
            last = detector.observe(&event_at(monday(week), false)).await.unwrap();
        }
        let candidate = last.unwrap();
        assert_eq!(candidate.key.scope, DayScope::Weekday(1));
        assert!(candidate.newly_suggested);

        // Daily keeps counting as a fallback but is not surfaced
        let daily = store
            .get_pattern(&candidate.key.daily())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(daily.match_count(), 3);
        assert_eq!(daily.status(), PatternStatus::Observing);

        let next = detector
            .observe(&event_at(monday(3), false))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.key.scope, DayScope::Weekday(1));
        assert!(!next.newly_suggested);
        assert_eq!(next.status, PatternStatus::Suggested);
    }

    #[tokio::test]
    async fn test_replay_and_echo_yield_nothing() {
        let (detector, store) = detector();
        let event = event_at(monday(0), false);
        assert!(detector.observe(&event).await.unwrap().is_some());
        assert!(detector.observe(&event).await.unwrap().is_none());

        let mut echo = event_at(monday(1), false);
        echo.is_automation_echo = true;
        assert!(detector.observe(&echo).await.unwrap().is_none());

        let (_, daily) = PatternDetector::keys(&event);
        assert_eq!(store.get_pattern(&daily).await.unwrap().unwrap().match_count(), 1);
    }
}
