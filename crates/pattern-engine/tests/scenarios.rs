//! End-to-end learning scenarios

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pattern_engine::context::PresenceLog;
use pattern_engine::correlation::LinkDelta;
use pattern_engine::filter::ActuationLog;
use pattern_engine::scorer::EvidenceDelta;
use pattern_engine::store::Upserted;
use pattern_engine::{
    Collaborators, CorrelationLink, DayScope, EngineConfig, EngineError, EngineEvent,
    JsonPatternStore, LearnedPattern, LinkDirection, LinkKey, LinkKind, MemoryPatternStore,
    PatternEngine, PatternFilter, PatternKey, PatternStatus, PatternStore, RawStateEvent,
    RoomScope, SceneMember, ScenePattern, StateEvent, TimeBucket,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

// March 2024: the 4th is a Monday
fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, h, m, s).unwrap()
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.runtime.store_retry_base_ms = 1;
    config
}

fn collaborators(actuations: Arc<ActuationLog>) -> Collaborators {
    let presence = Arc::new(PresenceLog::new());
    presence.record(at(1, 0, 0, 0), "alice");
    Collaborators {
        presence,
        echoes: actuations,
        ..Default::default()
    }
}

fn engine_on(config: EngineConfig, store: Arc<dyn PatternStore>) -> PatternEngine {
    PatternEngine::new(config, store, collaborators(Arc::new(ActuationLog::new()))).unwrap()
}

fn engine() -> PatternEngine {
    engine_on(config(), Arc::new(MemoryPatternStore::new()))
}

fn change(entity: &str, from: &str, to: &str, when: DateTime<Utc>) -> StateEvent {
    StateEvent::new(entity, from, to, when)
}

fn daily_key(entity: &str, action: &str, h: u16, m: u16) -> PatternKey {
    PatternKey {
        entity_id: entity.to_string(),
        action: action.to_string(),
        time_bucket: TimeBucket::at(h, m),
        scope: DayScope::Daily,
    }
}

fn find_link<'a>(links: &'a [CorrelationLink], source: &str, target: &str) -> &'a CorrelationLink {
    links
        .iter()
        .find(|l| l.key.source_entity == source && l.key.target_entity == target)
        .unwrap()
}

#[tokio::test]
async fn weekday_routine_becomes_suggestion_after_threshold() {
    let engine = engine();
    let mut rx = engine.subscribe();

    let mut candidates = Vec::new();
    for day in 4..=8 {
        let candidate = engine
            .process(change("light.l1", "off", "on", at(day, 22, 0, 0)))
            .await
            .unwrap()
            .unwrap();
        candidates.push(candidate);
    }

    assert_eq!(candidates[0].status, PatternStatus::Observing);
    assert_eq!(candidates[1].status, PatternStatus::Observing);

    let third = &candidates[2];
    assert!(third.newly_suggested);
    assert_eq!(third.status, PatternStatus::Suggested);
    assert_eq!(third.key, daily_key("light.l1", "on", 22, 0));
    assert!(!candidates[3].newly_suggested);
    assert!(!candidates[4].newly_suggested);

    assert!(candidates[1].confidence < candidates[2].confidence);
    assert!(candidates[2].confidence < candidates[3].confidence);
    assert!(candidates[3].confidence < candidates[4].confidence);
    assert!(candidates[4].confidence < 1.0);

    let mut announced = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::NewSuggestion { key, .. } = event {
            announced.push(key);
        }
    }
    assert_eq!(announced, vec![daily_key("light.l1", "on", 22, 0)]);

    let suggestions = engine.suggestions_at(0.3, at(9, 0, 0, 0)).await.unwrap();
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].pattern.key.scope, DayScope::Daily);
    assert!(!suggestions[0].feedback_loop);
}

#[tokio::test]
async fn replayed_event_counts_once() {
    let store = Arc::new(MemoryPatternStore::new());
    let event = RawStateEvent {
        entity_id: Some("light.l1".to_string()),
        previous_state: Some("off".to_string()),
        new_state: Some("on".to_string()),
        occurred_at: Some(at(4, 22, 0, 0)),
        ..Default::default()
    };

    let engine = engine_on(config(), store.clone());
    engine.ingest(event.clone()).await;
    engine.ingest(event.clone()).await;
    assert_eq!(engine.stats().duplicates, 1);

    // A restarted engine has no replay memory; the stored row still does
    let restarted = engine_on(config(), store.clone());
    restarted.ingest(event).await;

    let key = daily_key("light.l1", "on", 22, 0);
    let pattern = store.get_pattern(&key).await.unwrap().unwrap();
    assert_eq!(pattern.match_count(), 1);
}

#[tokio::test]
async fn automation_side_effect_is_labelled_as_chain() {
    let actuations = Arc::new(ActuationLog::new());
    let store = Arc::new(MemoryPatternStore::new());
    let engine = PatternEngine::new(config(), store.clone(), collaborators(actuations.clone())).unwrap();
    let cancel = CancellationToken::new();

    for day in 4..=7 {
        actuations.record_actuation("light.l1", at(day, 22, 0, 0));
        engine
            .process(change("light.l1", "off", "on", at(day, 22, 0, 1)))
            .await
            .unwrap();
        engine
            .process(change("light.l2", "off", "on", at(day, 22, 0, 11)))
            .await
            .unwrap();
        engine
            .run_correlation_pass(at(day, 22, 5, 0), &cancel)
            .await
            .unwrap();
    }

    let links = store.list_links(None).await.unwrap();
    let chain = find_link(&links, "light.l1", "light.l2");
    assert_eq!(chain.occurrences, 4);
    assert_eq!(chain.kind, LinkKind::AutomationChain);
    assert!(!chain.promoted);

    // The automation's own effect is never learned as a habit
    assert!(store
        .get_pattern(&daily_key("light.l1", "on", 22, 0))
        .await
        .unwrap()
        .is_none());

    let suggestions = engine.suggestions_at(0.0, at(8, 0, 0, 0)).await.unwrap();
    let l2 = suggestions
        .iter()
        .find(|s| s.pattern.key.entity_id == "light.l2")
        .unwrap();
    assert!(l2.automation_chain);
}

#[tokio::test]
async fn cross_room_needs_more_evidence_than_same_room() {
    let mut config = config();
    for (entity, room) in [
        ("binary_sensor.kitchen_motion", "kitchen"),
        ("light.kitchen", "kitchen"),
        ("switch.kettle", "kitchen"),
        ("light.bedroom", "bedroom"),
    ] {
        config.context.rooms.insert(entity.to_string(), room.to_string());
    }
    let store = Arc::new(MemoryPatternStore::new());
    let engine = engine_on(config, store.clone());
    let cancel = CancellationToken::new();

    for day in 4..=5 {
        for event in [
            change("binary_sensor.kitchen_motion", "off", "on", at(day, 7, 0, 0)),
            change("light.bedroom", "off", "on", at(day, 7, 0, 20)),
            change("light.kitchen", "off", "on", at(day, 7, 10, 0)),
            change("switch.kettle", "off", "on", at(day, 7, 10, 15)),
        ] {
            engine.process(event).await.unwrap();
        }
        engine
            .run_correlation_pass(at(day, 7, 12, 0), &cancel)
            .await
            .unwrap();
    }

    let links = store.list_links(None).await.unwrap();
    let cross = find_link(&links, "binary_sensor.kitchen_motion", "light.bedroom");
    assert_eq!(cross.room_scope, RoomScope::CrossRoom);
    assert_eq!(cross.occurrences, 2);
    assert!(!cross.promoted);

    let same = find_link(&links, "light.kitchen", "switch.kettle");
    assert_eq!(same.room_scope, RoomScope::SameRoom);
    assert_eq!(same.occurrences, 2);
    assert!(same.promoted);
}

#[tokio::test]
async fn late_night_routine_stays_on_starting_day() {
    let store = Arc::new(MemoryPatternStore::new());
    let engine = engine_on(config(), store.clone());

    for event in [
        change("light.hall", "on", "off", at(4, 23, 50, 0)),
        change("light.bedroom", "on", "off", at(4, 23, 58, 0)),
        change("switch.fan", "on", "off", at(5, 0, 5, 0)),
    ] {
        engine.process(event).await.unwrap();
    }

    let patterns = store.list_patterns(&PatternFilter::default()).await.unwrap();
    let specific: Vec<&LearnedPattern> = patterns
        .iter()
        .filter(|p| p.key.scope.is_specific())
        .collect();
    assert_eq!(specific.len(), 3);
    // All keyed to Monday, including the event after midnight
    assert!(specific.iter().all(|p| p.key.scope == DayScope::Weekday(1)));

    let monday = at(4, 0, 0, 0).date_naive();
    assert!(patterns
        .iter()
        .all(|p| p.evidence.observed_days.iter().all(|d| *d == monday)));
}

#[tokio::test]
async fn fighting_devices_are_flagged_not_promoted() {
    let mut config = config();
    config.correlation.lookback_secs = 3 * 3600;
    for entity in ["climate.heater", "cover.window"] {
        config.context.rooms.insert(entity.to_string(), "office".to_string());
    }
    let store = Arc::new(MemoryPatternStore::new());
    let engine = engine_on(config, store.clone());
    let mut rx = engine.subscribe();

    for round in 0..3 {
        let t = at(4, 10, 0, 0) + Duration::minutes(30 * round);
        for event in [
            change("climate.heater", "off", "heat", t),
            change("cover.window", "closed", "open", t + Duration::seconds(40)),
            change("climate.heater", "heat", "off", t + Duration::seconds(600)),
            change("cover.window", "open", "closed", t + Duration::seconds(700)),
            change("climate.heater", "off", "heat", t + Duration::seconds(745)),
        ] {
            engine.process(event).await.unwrap();
        }
    }
    let report = engine
        .run_correlation_pass(at(4, 12, 0, 0), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.loops, 1);

    let links = store.list_links(None).await.unwrap();
    for (source, target) in [("heat", "open"), ("closed", "heat")] {
        let link = links
            .iter()
            .find(|l| l.key.source_action == source && l.key.target_action == target)
            .unwrap();
        assert!(link.feedback_loop);
        assert_eq!(link.direction, LinkDirection::Bidirectional);
        assert!(!link.promoted);
    }

    let mut loop_announced = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::LoopDetected { .. } => loop_announced = true,
            EngineEvent::LinkPromoted { key, .. } => {
                let looped = links.iter().any(|l| l.key == key && l.feedback_loop);
                assert!(!looped, "loop link {key} announced as promoted");
            }
            _ => {}
        }
    }
    assert!(loop_announced);
}

#[tokio::test]
async fn repeated_scene_is_promoted() {
    let store = Arc::new(MemoryPatternStore::new());
    let engine = engine_on(config(), store.clone());
    let mut rx = engine.subscribe();
    let cancel = CancellationToken::new();

    for day in 4..=6 {
        for event in [
            change("light.living", "on", "off", at(day, 19, 0, 0)),
            change("cover.living", "open", "closed", at(day, 19, 0, 20)),
            change("media_player.tv", "off", "on", at(day, 19, 0, 45)),
        ] {
            engine.process(event).await.unwrap();
        }
        engine.run_scene_pass(at(day, 20, 0, 0), &cancel).await.unwrap();
    }

    let scenes = store.list_scenes(Some(PatternStatus::Suggested)).await.unwrap();
    assert_eq!(scenes.len(), 1);
    assert_eq!(scenes[0].members.len(), 3);
    assert_eq!(scenes[0].evidence.match_count, 3);

    let promoted = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, EngineEvent::ScenePromoted { .. }))
        .count();
    assert_eq!(promoted, 1);

    let rejected = engine
        .reject_scene(&scenes[0].members, at(6, 21, 0, 0))
        .await
        .unwrap();
    assert_eq!(rejected.evidence.status, PatternStatus::Rejected);
    assert_eq!(rejected.evidence.scored_at, at(6, 21, 0, 0));
}

#[tokio::test]
async fn scene_pass_mid_group_waits_for_whole_scene() {
    let store = Arc::new(MemoryPatternStore::new());
    let engine = engine_on(config(), store.clone());
    let cancel = CancellationToken::new();

    for day in 4..=6 {
        engine.process(change("light.living", "on", "off", at(day, 19, 0, 0))).await.unwrap();
        engine.process(change("cover.living", "open", "closed", at(day, 19, 0, 20))).await.unwrap();
        engine.run_scene_pass(at(day, 19, 0, 30), &cancel).await.unwrap();
        engine.process(change("media_player.tv", "off", "on", at(day, 19, 0, 45))).await.unwrap();
        engine.run_scene_pass(at(day, 19, 5, 0), &cancel).await.unwrap();
    }

    let scenes = store.list_scenes(None).await.unwrap();
    assert_eq!(scenes.len(), 1, "{scenes:?}");
    assert_eq!(scenes[0].members.len(), 3);
    assert_eq!(scenes[0].evidence.match_count, 3);
    assert_eq!(scenes[0].evidence.status, PatternStatus::Suggested);
}

#[tokio::test]
async fn late_event_before_last_pass_joins_its_scene() {
    let store = Arc::new(MemoryPatternStore::new());
    let engine = engine_on(config(), store.clone());
    let cancel = CancellationToken::new();

    engine.process(change("light.living", "on", "off", at(4, 19, 0, 0))).await.unwrap();
    engine.process(change("cover.living", "open", "closed", at(4, 19, 0, 20))).await.unwrap();
    engine.run_scene_pass(at(4, 19, 0, 30), &cancel).await.unwrap();
    // Stamped before the pass, delivered after it
    engine.process(change("media_player.tv", "off", "on", at(4, 19, 0, 25))).await.unwrap();
    engine.run_scene_pass(at(4, 19, 5, 0), &cancel).await.unwrap();

    let scenes = store.list_scenes(None).await.unwrap();
    assert_eq!(scenes.len(), 1);
    assert_eq!(scenes[0].members.len(), 3);

    // Nothing is counted twice by later passes
    engine.run_scene_pass(at(4, 19, 10, 0), &cancel).await.unwrap();
    let scenes = store.list_scenes(None).await.unwrap();
    assert_eq!(scenes[0].evidence.match_count, 1);
}

#[tokio::test]
async fn weekly_habit_clears_suggestion_threshold() {
    let config = config();
    let threshold = config.confidence.suggestion_threshold;
    let engine = PatternEngine::new(
        config,
        Arc::new(MemoryPatternStore::new()),
        Collaborators::default(),
    )
    .unwrap();

    let first_monday = at(4, 7, 0, 0);
    let mut last = first_monday;
    for week in 0..8 {
        last = first_monday + Duration::weeks(week);
        engine.process(change("switch.coffee", "off", "on", last)).await.unwrap();
    }

    let suggestions = engine.suggestions_at(threshold, last + Duration::days(1)).await.unwrap();
    assert_eq!(suggestions.len(), 1, "{suggestions:?}");
    assert_eq!(suggestions[0].pattern.key.scope, DayScope::Weekday(1));
    assert!(suggestions[0].confidence >= threshold);
    assert_eq!(suggestions[0].pattern.match_count(), 8);
}

#[tokio::test]
async fn decay_checkpoint_skips_failing_key() {
    let store = Arc::new(FlakyStore::new(0, None));
    let engine = engine_on(config(), store.clone());
    for day in 4..=6 {
        for entity in ["light.a", "light.b"] {
            engine.process(change(entity, "off", "on", at(day, 22, 0, 0))).await.unwrap();
        }
    }

    // From here on every write for light.a fails
    store.break_entity("light.a");

    let changed = engine.decay_checkpoint(at(30, 22, 0, 0)).await.unwrap();
    assert!(changed >= 1);
    assert!(engine.stats().store_failures >= 1);

    let b = store.get_pattern(&daily_key("light.b", "on", 22, 0)).await.unwrap().unwrap();
    assert_eq!(b.evidence.scored_at, at(30, 22, 0, 0));
    let a = store.get_pattern(&daily_key("light.a", "on", 22, 0)).await.unwrap().unwrap();
    assert!(a.evidence.scored_at < at(30, 22, 0, 0));
}

#[tokio::test]
async fn learned_state_survives_restart() {
    let dir = std::env::temp_dir().join(format!("pattern-scenario-{}", uuid::Uuid::new_v4()));
    let path = dir.join("patterns.json");

    {
        let store = Arc::new(JsonPatternStore::open(&path).await.unwrap());
        let engine = engine_on(config(), store.clone());
        for day in 4..=6 {
            engine
                .process(change("light.l1", "off", "on", at(day, 22, 0, 0)))
                .await
                .unwrap();
        }
        store.flush().await.unwrap();
    }

    let reopened = JsonPatternStore::open(&path).await.unwrap();
    let pattern = reopened
        .get_pattern(&daily_key("light.l1", "on", 22, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pattern.match_count(), 3);
    assert_eq!(pattern.status(), PatternStatus::Suggested);
    let _ = std::fs::remove_dir_all(&dir);
}

/// Store that fails for one entity, or transiently for a number of calls
struct FlakyStore {
    inner: MemoryPatternStore,
    transient_failures: AtomicU32,
    broken_entity: Mutex<Option<String>>,
}

impl FlakyStore {
    fn new(transient_failures: u32, broken_entity: Option<&str>) -> Self {
        Self {
            inner: MemoryPatternStore::new(),
            transient_failures: AtomicU32::new(transient_failures),
            broken_entity: Mutex::new(broken_entity.map(str::to_string)),
        }
    }

    fn break_entity(&self, entity: &str) {
        *self.broken_entity.lock().unwrap() = Some(entity.to_string());
    }

    fn is_broken(&self, entity: &str) -> bool {
        self.broken_entity.lock().unwrap().as_deref() == Some(entity)
    }
}

#[async_trait]
impl PatternStore for FlakyStore {
    async fn upsert_pattern(
        &self,
        key: &PatternKey,
        delta: EvidenceDelta,
    ) -> Result<Upserted<LearnedPattern>, EngineError> {
        if self.is_broken(&key.entity_id) {
            return Err(EngineError::StoreUnavailable("partition offline".to_string()));
        }
        let blip = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blip {
            return Err(EngineError::StoreUnavailable("connection reset".to_string()));
        }
        self.inner.upsert_pattern(key, delta).await
    }

    async fn get_pattern(&self, key: &PatternKey) -> Result<Option<LearnedPattern>, EngineError> {
        self.inner.get_pattern(key).await
    }

    async fn list_patterns(&self, filter: &PatternFilter) -> Result<Vec<LearnedPattern>, EngineError> {
        self.inner.list_patterns(filter).await
    }

    async fn set_status(
        &self,
        key: &PatternKey,
        status: PatternStatus,
    ) -> Result<LearnedPattern, EngineError> {
        self.inner.set_status(key, status).await
    }

    async fn upsert_scene(
        &self,
        members: &[SceneMember],
        delta: EvidenceDelta,
    ) -> Result<Upserted<ScenePattern>, EngineError> {
        self.inner.upsert_scene(members, delta).await
    }

    async fn list_scenes(&self, status: Option<PatternStatus>) -> Result<Vec<ScenePattern>, EngineError> {
        self.inner.list_scenes(status).await
    }

    async fn set_scene_status(
        &self,
        members: &[SceneMember],
        status: PatternStatus,
    ) -> Result<ScenePattern, EngineError> {
        self.inner.set_scene_status(members, status).await
    }

    async fn upsert_link(
        &self,
        key: &LinkKey,
        delta: LinkDelta,
    ) -> Result<Upserted<CorrelationLink>, EngineError> {
        self.inner.upsert_link(key, delta).await
    }

    async fn list_links(&self, entity_id: Option<&str>) -> Result<Vec<CorrelationLink>, EngineError> {
        self.inner.list_links(entity_id).await
    }
}

#[tokio::test]
async fn transient_store_failure_is_retried() {
    let store = Arc::new(FlakyStore::new(2, None));
    let engine = engine_on(config(), store.clone());

    let candidate = engine
        .process(change("light.l1", "off", "on", at(4, 22, 0, 0)))
        .await
        .unwrap();
    assert!(candidate.is_some());
    assert_eq!(engine.stats().store_failures, 0);

    let pattern = store
        .get_pattern(&daily_key("light.l1", "on", 22, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pattern.match_count(), 1);
}

#[tokio::test]
async fn failing_key_does_not_block_others() {
    let store = Arc::new(FlakyStore::new(0, Some("light.broken")));
    let engine = engine_on(config(), store.clone());

    let broken = change("light.broken", "off", "on", at(4, 22, 0, 0));
    let result = engine.process(broken.clone()).await;
    assert!(matches!(result, Err(EngineError::StoreUnavailable(_))));
    assert_eq!(engine.stats().store_failures, 1);

    let ok = engine
        .process(change("light.ok", "off", "on", at(4, 22, 0, 5)))
        .await
        .unwrap();
    assert!(ok.is_some());

    // A failed event may be redelivered and is not treated as a replay
    let _ = engine.process(broken).await;
    assert_eq!(engine.stats().duplicates, 0);
    assert_eq!(engine.stats().store_failures, 2);
}
