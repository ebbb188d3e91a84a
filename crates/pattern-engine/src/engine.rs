//! Core pattern engine
//!
//! Wires the filter, tagger and detector into the per-event ingestion path
//! and runs correlation and scene detection as cancellable batch passes over
//! a buffer of recently tagged events.

use crate::config::EngineConfig;
use crate::context::{ContextTagger, HolidayCalendar, PresenceLog, PresenceSource, StaticCalendar};
use crate::correlation::{CorrelationAnalyzer, LinkChange, LinkDelta};
use crate::detector::PatternDetector;
use crate::error::EngineError;
use crate::filter::{
    ActuationLog, AttributeSignificance, DomainSignificance, EchoSuppression, StateEventFilter,
    Verdict,
};
use crate::model::{
    ContextualEvent, CorrelationLink, DayScope, LearnedPattern, LinkKey, LinkKind, PatternCandidate,
    PatternKey, PatternStatus, RawStateEvent, RoomScope, SceneMember, ScenePattern, StateEvent,
};
use crate::retry::RetryPolicy;
use crate::scene::SceneDetector;
use crate::scheduler::{BatchJob, BatchScheduler};
use crate::scorer::{ConfidenceScorer, CounterEvidence, EvidenceChange, EvidenceDelta, LearningRules};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::store::{PatternFilter, PatternStore};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use dashmap::DashSet;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Events emitted by the pattern engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A pattern crossed the suggestion threshold for the first time
    NewSuggestion { key: PatternKey, confidence: f64 },
    /// A scene crossed the suggestion threshold for the first time
    ScenePromoted {
        members: Vec<SceneMember>,
        confidence: f64,
    },
    /// A correlation link gathered enough independent occurrences
    LinkPromoted { key: LinkKey, room_scope: RoomScope },
    /// Two links were found fighting each other
    LoopDetected { forward: LinkKey, reverse: LinkKey },
    PatternStatusChanged { key: PatternKey, status: PatternStatus },
    SceneStatusChanged {
        members: Vec<SceneMember>,
        status: PatternStatus,
    },
    PassCompleted(PassReport),
    PassFailed { job: BatchJob, error: String },
}

/// Outcome of one batch pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Identifies the run in logs and broadcasts
    pub run_id: Uuid,
    pub job: BatchJob,
    /// Tagged events read from the buffer
    pub events: usize,
    /// Rows whose evidence changed
    pub updated: usize,
    pub promoted: usize,
    pub loops: usize,
    /// Keys given up after retries
    pub failures: usize,
}

impl PassReport {
    fn new(job: BatchJob, events: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job,
            events,
            updated: 0,
            promoted: 0,
            loops: 0,
            failures: 0,
        }
    }
}

/// A suggested pattern as handed to the automation layer
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub pattern: LearnedPattern,
    /// Confidence decayed to the query time
    pub confidence: f64,
    /// Links touching the pattern's entity
    pub links: Vec<CorrelationLink>,
    /// One of those links is part of a feedback loop
    pub feedback_loop: bool,
    /// One of those links is an automation side effect
    pub automation_chain: bool,
}

/// External collaborators the engine consults
#[derive(Clone)]
pub struct Collaborators {
    pub presence: Arc<dyn PresenceSource>,
    pub calendar: Arc<dyn HolidayCalendar>,
    pub echoes: Arc<dyn EchoSuppression>,
    pub significance: Arc<dyn AttributeSignificance>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            presence: Arc::new(PresenceLog::new()),
            calendar: Arc::new(StaticCalendar::default()),
            echoes: Arc::new(ActuationLog::new()),
            significance: Arc::new(DomainSignificance::default()),
        }
    }
}

enum ShardMessage {
    Event(StateEvent),
    Barrier(oneshot::Sender<()>),
}

/// The main pattern engine
pub struct PatternEngine {
    config: EngineConfig,
    store: Arc<dyn PatternStore>,
    filter: StateEventFilter,
    tagger: ContextTagger,
    detector: PatternDetector,
    analyzer: CorrelationAnalyzer,
    scenes: SceneDetector,
    retry: RetryPolicy,
    scheduler: BatchScheduler,
    event_tx: broadcast::Sender<EngineEvent>,
    stats: Arc<EngineStats>,
    /// Tagged events available to the batch passes, in arrival order
    recent: RwLock<VecDeque<ContextualEvent>>,
    correlation_cursor: Mutex<Option<DateTime<Utc>>>,
    scene_cursor: Mutex<Option<DateTime<Utc>>>,
    /// Activity days already reviewed for misses
    reviewed_days: DashSet<NaiveDate>,
    shards: OnceLock<Vec<mpsc::Sender<ShardMessage>>>,
    shutdown: CancellationToken,
}

impl PatternEngine {
    /// Create a new engine on top of a store
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PatternStore>,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(256);
        let stats = Arc::new(EngineStats::default());

        let filter = StateEventFilter::new(
            config.filter.clone(),
            collaborators.significance,
            collaborators.echoes,
            stats.clone(),
        );
        let tagger = ContextTagger::new(&config.context, collaborators.presence, collaborators.calendar)?;

        let scorer = ConfidenceScorer::from_config(&config.confidence);
        let retry = RetryPolicy::from_config(&config.runtime);
        let pattern_rules = LearningRules {
            scorer,
            min_repetitions: config.detection.min_repetitions,
            min_distinct_days: config.detection.min_distinct_days,
        };
        let scene_rules = LearningRules {
            scorer,
            min_repetitions: config.scenes.min_repetitions,
            min_distinct_days: config.scenes.min_distinct_days,
        }
        .for_scope(DayScope::Daily);

        Ok(Self {
            detector: PatternDetector::new(store.clone(), pattern_rules, retry),
            analyzer: CorrelationAnalyzer::new(&config.correlation),
            scenes: SceneDetector::new(config.scenes, scene_rules),
            scheduler: BatchScheduler::new(),
            recent: RwLock::new(VecDeque::new()),
            correlation_cursor: Mutex::new(None),
            scene_cursor: Mutex::new(None),
            reviewed_days: DashSet::new(),
            shards: OnceLock::new(),
            shutdown: CancellationToken::new(),
            config,
            store,
            filter,
            tagger,
            retry,
            event_tx,
            stats,
        })
    }

    /// Start shard workers and the batch timers
    pub fn start(self: &Arc<Self>) {
        let mut senders = Vec::with_capacity(self.config.runtime.shards);
        let mut receivers = Vec::with_capacity(self.config.runtime.shards);
        for _ in 0..self.config.runtime.shards.max(1) {
            let (tx, rx) = mpsc::channel(self.config.runtime.shard_queue_depth.max(1));
            senders.push(tx);
            receivers.push(rx);
        }
        if self.shards.set(senders).is_err() {
            tracing::warn!("Pattern engine already started");
            return;
        }

        for (index, rx) in receivers.into_iter().enumerate() {
            self.start_shard(index, rx);
        }

        let runtime = &self.config.runtime;
        self.scheduler.register(
            BatchJob::Correlation,
            std::time::Duration::from_secs(runtime.correlation_interval_secs),
        );
        self.scheduler.register(
            BatchJob::Scenes,
            std::time::Duration::from_secs(runtime.scene_interval_secs),
        );
        self.start_scheduler_listener();
        tracing::info!("Pattern engine started with {} shards", runtime.shards.max(1));
    }

    /// Stop workers and cancel any running pass. Events already queued on
    /// a shard are still processed before its worker exits.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.remove(BatchJob::Correlation);
        self.scheduler.remove(BatchJob::Scenes);
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PatternStore> {
        &self.store
    }

    /// Accept a raw event from the event source. Malformed events are
    /// counted and dropped. Once started, events are queued onto the shard
    /// owning their entity; before that they are processed inline.
    pub async fn ingest(&self, raw: RawStateEvent) {
        let Some(event) = self.filter.admit(raw) else {
            return;
        };

        match self.shards.get() {
            Some(shards) => {
                let shard = &shards[shard_index(&event.entity_id, shards.len())];
                if shard.send(ShardMessage::Event(event)).await.is_err() {
                    tracing::warn!("Shard queue closed, event dropped");
                }
            }
            None => {
                // Failures are already logged and counted
                let _ = self.process(event).await;
            }
        }
    }

    /// Wait until every event queued before this call has been processed
    pub async fn drain(&self) {
        let Some(shards) = self.shards.get() else {
            return;
        };
        for shard in shards {
            let (tx, rx) = oneshot::channel();
            if shard.send(ShardMessage::Barrier(tx)).await.is_ok() {
                let _ = rx.await;
            }
        }
    }

    /// Screen, tag and learn from one validated event
    pub async fn process(&self, event: StateEvent) -> Result<Option<PatternCandidate>, EngineError> {
        let (action, is_echo) = match self.filter.screen(&event) {
            Verdict::Accept { action } => (action, false),
            Verdict::Echo { action } => (action, true),
            Verdict::Reject(_) => return Ok(None),
        };

        let tagged = self.tagger.tag(event, action, is_echo);
        self.buffer(tagged.clone());
        if is_echo {
            return Ok(None);
        }

        match self.detector.observe(&tagged).await {
            Ok(Some(candidate)) => {
                if candidate.newly_suggested {
                    EngineStats::bump(&self.stats.suggestions);
                    tracing::info!(
                        "New suggestion: {} (confidence {:.2}, {} matches)",
                        candidate.key,
                        candidate.confidence,
                        candidate.match_count
                    );
                    let _ = self.event_tx.send(EngineEvent::NewSuggestion {
                        key: candidate.key.clone(),
                        confidence: candidate.confidence,
                    });
                }
                Ok(Some(candidate))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                EngineStats::bump(&self.stats.store_failures);
                self.filter.forget(&tagged.event);
                tracing::error!("Giving up on {}: {}", tagged.fingerprint(), e);
                Err(e)
            }
        }
    }

    fn buffer(&self, tagged: ContextualEvent) {
        let retention = Duration::seconds(self.config.runtime.recent_event_retention_secs as i64);
        if let Ok(mut recent) = self.recent.write() {
            let horizon = tagged.occurred_at() - retention;
            recent.push_back(tagged);
            while recent.front().is_some_and(|e| e.occurred_at() < horizon) {
                recent.pop_front();
            }
        }
    }

    /// Copy of buffered events with `since < occurred_at <= until`
    fn window(&self, since: Option<DateTime<Utc>>, until: DateTime<Utc>) -> Result<Vec<ContextualEvent>, EngineError> {
        let recent = self
            .recent
            .read()
            .map_err(|_| EngineError::InconsistentState("recent event buffer poisoned".to_string()))?;
        Ok(recent
            .iter()
            .filter(|e| since.map_or(true, |s| e.occurred_at() > s) && e.occurred_at() <= until)
            .cloned()
            .collect())
    }

    /// Number of tagged events available to the batch passes
    pub fn buffered_events(&self) -> usize {
        self.recent.read().map_or(0, |recent| recent.len())
    }

    /// Correlate buffered events up to `now`
    pub async fn run_correlation_pass(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PassReport, EngineError> {
        self.run_pass(BatchJob::Correlation, cancel, self.correlate(now, cancel))
            .await
    }

    /// Group buffered events since the last scene pass, up to `now`
    pub async fn run_scene_pass(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PassReport, EngineError> {
        self.run_pass(BatchJob::Scenes, cancel, self.detect_scenes(now, cancel))
            .await
    }

    async fn run_pass<F>(
        &self,
        job: BatchJob,
        cancel: &CancellationToken,
        pass: F,
    ) -> Result<PassReport, EngineError>
    where
        F: Future<Output = Result<PassReport, EngineError>>,
    {
        let budget = self.config.runtime.batch_timeout();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = tokio::time::timeout(budget, pass) => {
                outcome.unwrap_or(Err(EngineError::Timeout(budget)))
            }
        };

        match &result {
            Ok(report) => {
                tracing::info!(
                    "{} pass {}: {} events, {} updated, {} promoted, {} loops, {} failures",
                    job,
                    report.run_id,
                    report.events,
                    report.updated,
                    report.promoted,
                    report.loops,
                    report.failures
                );
                let _ = self.event_tx.send(EngineEvent::PassCompleted(report.clone()));
            }
            Err(e) => {
                tracing::warn!("{} pass did not complete: {}", job, e);
                let _ = self.event_tx.send(EngineEvent::PassFailed {
                    job,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn correlate(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PassReport, EngineError> {
        let cursor = lock_cursor(&self.correlation_cursor)?;
        // Re-read one lag span before the cursor so pairs straddling two
        // passes are found; occurrence ids make the overlap idempotent
        let since = match cursor {
            Some(cursor) => cursor - Duration::seconds(self.config.correlation.max_lag_secs as i64),
            None => now - Duration::seconds(self.config.correlation.lookback_secs as i64),
        };
        let window = self.window(Some(since), now)?;
        let mut report = PassReport::new(BatchJob::Correlation, window.len());
        let rules = self.analyzer.rules();

        // Promotions are announced after loop flags are settled
        let mut fresh: Vec<(LinkKey, RoomScope, u32)> = Vec::new();
        for pair in self.analyzer.occurrences(&window) {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let delta = pair.delta(rules);
            match self.upsert_link(&pair.key, delta).await {
                Ok(upserted) => {
                    if upserted.applied.changed {
                        report.updated += 1;
                    }
                    if upserted.applied.promoted {
                        fresh.push((pair.key.clone(), pair.room_scope, upserted.record.occurrences));
                    }
                    if upserted.applied.changed && upserted.record.kind == LinkKind::AutomationChain {
                        tracing::debug!("Link {} is an automation chain", pair.key);
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    EngineStats::bump(&self.stats.store_failures);
                    tracing::error!("Giving up on link {}: {}", pair.key, e);
                }
            }
            tokio::task::yield_now().await;
        }

        let links = self.store.list_links(None).await?;
        let mut looped: HashSet<LinkKey> = HashSet::new();
        for (forward, reverse) in self.analyzer.detect_loops(&links) {
            let mut flagged = false;
            for key in [&forward, &reverse] {
                let delta = LinkDelta {
                    change: LinkChange::MarkLoop { at: now },
                    room_scope: RoomScope::CrossRoom,
                    rules,
                };
                match self.upsert_link(key, delta).await {
                    Ok(upserted) => flagged |= upserted.applied.changed,
                    Err(e) => {
                        report.failures += 1;
                        tracing::error!("Could not flag loop on {}: {}", key, e);
                    }
                }
            }
            looped.insert(forward.clone());
            looped.insert(reverse.clone());
            if flagged {
                report.loops += 1;
                tracing::warn!("Feedback loop between {} and {}", forward, reverse);
                let _ = self.event_tx.send(EngineEvent::LoopDetected { forward, reverse });
            }
        }

        for (key, room_scope, occurrences) in fresh {
            if looped.contains(&key) {
                continue;
            }
            report.promoted += 1;
            tracing::info!(
                "Promoted link {} ({:?}, {} occurrences)",
                key,
                room_scope,
                occurrences
            );
            let _ = self.event_tx.send(EngineEvent::LinkPromoted { key, room_scope });
        }

        *self
            .correlation_cursor
            .lock()
            .map_err(|_| EngineError::InconsistentState("cursor poisoned".to_string()))? = Some(now);
        Ok(report)
    }

    async fn upsert_link(
        &self,
        key: &LinkKey,
        delta: LinkDelta,
    ) -> Result<crate::store::Upserted<CorrelationLink>, EngineError> {
        let store = &self.store;
        let label = key.to_string();
        self.retry
            .run(&label, move || store.upsert_link(key, delta.clone()))
            .await
    }

    async fn upsert_scene(
        &self,
        members: &[SceneMember],
        delta: EvidenceDelta,
    ) -> Result<crate::store::Upserted<ScenePattern>, EngineError> {
        let store = &self.store;
        self.retry
            .run("scene", move || store.upsert_scene(members, delta.clone()))
            .await
    }

    async fn upsert_pattern(
        &self,
        key: &PatternKey,
        delta: EvidenceDelta,
    ) -> Result<crate::store::Upserted<LearnedPattern>, EngineError> {
        let store = &self.store;
        let label = key.to_string();
        self.retry
            .run(&label, move || store.upsert_pattern(key, delta.clone()))
            .await
    }

    async fn detect_scenes(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PassReport, EngineError> {
        // Groups still open at `now` are left unread so the next pass sees
        // them whole, together with any late arrivals
        let cursor = lock_cursor(&self.scene_cursor)?;
        let events = self.window(cursor, now)?;
        let settled = self.scenes.settled(&events, now);
        let mut report = PassReport::new(BatchJob::Scenes, events.len());
        let rules = self.scenes.rules();

        let mut confirmed: Vec<ScenePattern> = self
            .store
            .list_scenes(None)
            .await?
            .into_iter()
            .filter(|scene| scene.evidence.status.is_confirmed())
            .collect();

        for observation in settled.observations {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let hold = SceneDetector::is_redundant(&observation.members, &confirmed);
            match self
                .upsert_scene(&observation.members, observation.delta(rules, hold))
                .await
            {
                Ok(upserted) => {
                    if upserted.applied.changed {
                        report.updated += 1;
                    }
                    if upserted.applied.promoted {
                        report.promoted += 1;
                        tracing::info!(
                            "New scene suggestion with {} members (confidence {:.2})",
                            upserted.record.members.len(),
                            upserted.record.evidence.confidence
                        );
                        let _ = self.event_tx.send(EngineEvent::ScenePromoted {
                            members: upserted.record.members.clone(),
                            confidence: upserted.record.evidence.confidence,
                        });
                        confirmed.push(upserted.record);
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    EngineStats::bump(&self.stats.store_failures);
                    tracing::error!("Giving up on scene group {}: {}", observation.fingerprint, e);
                }
            }
            tokio::task::yield_now().await;
        }

        if let Some(through) = settled.through {
            let mut cursor = self
                .scene_cursor
                .lock()
                .map_err(|_| EngineError::InconsistentState("cursor poisoned".to_string()))?;
            *cursor = Some(cursor.map_or(through, |c| c.max(through)));
        }
        Ok(report)
    }

    /// Apply a miss to every accepted pattern that should have fired on
    /// `date` but did not. Each day is reviewed once.
    pub async fn review_day(&self, date: NaiveDate) -> Result<usize, EngineError> {
        if !self.reviewed_days.insert(date) {
            tracing::debug!("Day {} already reviewed", date);
            return Ok(0);
        }

        let at = self.tagger.day_end(date);
        let weekday = date.weekday().num_days_from_sunday() as u8;
        let is_holiday = self.tagger.is_holiday(date);

        let accepted = match self
            .store
            .list_patterns(&PatternFilter::with_status(PatternStatus::Accepted))
            .await
        {
            Ok(accepted) => accepted,
            Err(e) => {
                self.reviewed_days.remove(&date);
                return Err(e);
            }
        };

        let mut missed = 0;
        for pattern in accepted {
            let due = pattern.key.scope.covers(weekday, is_holiday)
                && pattern.evidence.created_at < at
                && !pattern.evidence.observed_days.contains(&date);
            if !due {
                continue;
            }
            let delta = EvidenceDelta {
                change: EvidenceChange::CounterEvidence {
                    kind: CounterEvidence::Miss,
                    at,
                },
                rules: self.detector.rules().for_scope(pattern.key.scope),
            };
            match self.upsert_pattern(&pattern.key, delta).await {
                Ok(upserted) => {
                    missed += 1;
                    tracing::debug!(
                        "Missed {} on {} (confidence now {:.2})",
                        pattern.key,
                        date,
                        upserted.record.confidence()
                    );
                }
                Err(e) => {
                    EngineStats::bump(&self.stats.store_failures);
                    tracing::error!("Could not record miss for {}: {}", pattern.key, e);
                }
            }
        }

        if missed > 0 {
            tracing::info!("Reviewed {}: {} accepted patterns missed", date, missed);
        }
        Ok(missed)
    }

    /// Persist decayed confidence for every pattern and scene
    pub async fn decay_checkpoint(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let decay = |rules: LearningRules| EvidenceDelta {
            change: EvidenceChange::Decay { at: now },
            rules,
        };

        let mut changed = 0;
        let mut failures = 0;
        for pattern in self.store.list_patterns(&PatternFilter::default()).await? {
            let rules = self.detector.rules().for_scope(pattern.key.scope);
            match self.upsert_pattern(&pattern.key, decay(rules)).await {
                Ok(upserted) => changed += usize::from(upserted.applied.changed),
                Err(e) => {
                    failures += 1;
                    EngineStats::bump(&self.stats.store_failures);
                    tracing::error!("Could not checkpoint {}: {}", pattern.key, e);
                }
            }
        }
        for scene in self.store.list_scenes(None).await? {
            match self.upsert_scene(&scene.members, decay(self.scenes.rules())).await {
                Ok(upserted) => changed += usize::from(upserted.applied.changed),
                Err(e) => {
                    failures += 1;
                    EngineStats::bump(&self.stats.store_failures);
                    tracing::error!("Could not checkpoint {}-member scene: {}", scene.members.len(), e);
                }
            }
        }

        if failures > 0 {
            tracing::warn!("Decay checkpoint at {} skipped {} rows", now, failures);
        }
        tracing::debug!("Decay checkpoint at {}: {} rows changed", now, changed);
        Ok(changed)
    }

    /// Suggested patterns at or above the configured suggestion
    /// threshold, as of now
    pub async fn suggestions(&self) -> Result<Vec<Suggestion>, EngineError> {
        self.suggestions_at(self.config.confidence.suggestion_threshold, Utc::now())
            .await
    }

    /// Suggested patterns as of `now`. A daily pattern is left out when a
    /// day-specific pattern for the same entity, action and bucket is
    /// suggested or accepted.
    pub async fn suggestions_at(
        &self,
        min_confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Suggestion>, EngineError> {
        let patterns = self.store.list_patterns(&PatternFilter::default()).await?;
        let links = self.store.list_links(None).await?;

        let shadowed = |daily: &LearnedPattern| {
            patterns.iter().any(|p| {
                p.key.scope.is_specific()
                    && p.status().is_confirmed()
                    && p.key.entity_id == daily.key.entity_id
                    && p.key.action == daily.key.action
                    && p.key.time_bucket == daily.key.time_bucket
            })
        };

        let mut suggestions: Vec<Suggestion> = patterns
            .iter()
            .filter(|p| p.status() == PatternStatus::Suggested)
            .filter(|p| p.key.scope != DayScope::Daily || !shadowed(p))
            .filter_map(|p| {
                let scorer = self.detector.rules().for_scope(p.key.scope).scorer;
                let confidence = scorer.current(&p.evidence, now);
                if confidence < min_confidence {
                    return None;
                }
                let related: Vec<CorrelationLink> = links
                    .iter()
                    .filter(|l| l.source_entity() == p.key.entity_id || l.target_entity() == p.key.entity_id)
                    .cloned()
                    .collect();
                Some(Suggestion {
                    feedback_loop: related.iter().any(|l| l.feedback_loop),
                    automation_chain: related.iter().any(|l| l.kind == LinkKind::AutomationChain),
                    links: related,
                    pattern: p.clone(),
                    confidence,
                })
            })
            .collect();

        suggestions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pattern.key.cmp(&b.pattern.key))
        });
        Ok(suggestions)
    }

    /// Mark a pattern as accepted by the user
    pub async fn accept(&self, key: &PatternKey) -> Result<LearnedPattern, EngineError> {
        let pattern = self.store.set_status(key, PatternStatus::Accepted).await?;
        tracing::info!("Accepted pattern {}", key);
        let _ = self.event_tx.send(EngineEvent::PatternStatusChanged {
            key: key.clone(),
            status: PatternStatus::Accepted,
        });
        Ok(pattern)
    }

    /// Reject a pattern at `at`, applying the rejection penalty
    pub async fn reject(&self, key: &PatternKey, at: DateTime<Utc>) -> Result<LearnedPattern, EngineError> {
        let delta = EvidenceDelta {
            change: EvidenceChange::CounterEvidence {
                kind: CounterEvidence::Rejection,
                at,
            },
            rules: self.detector.rules().for_scope(key.scope),
        };
        if self.store.get_pattern(key).await?.is_none() {
            return Err(EngineError::NotFound(key.to_string()));
        }
        let upserted = self.upsert_pattern(key, delta).await?;
        tracing::info!("Rejected pattern {}", key);
        let _ = self.event_tx.send(EngineEvent::PatternStatusChanged {
            key: key.clone(),
            status: PatternStatus::Rejected,
        });
        Ok(upserted.record)
    }

    pub async fn accept_scene(&self, members: &[SceneMember]) -> Result<ScenePattern, EngineError> {
        let scene = self
            .store
            .set_scene_status(members, PatternStatus::Accepted)
            .await?;
        let _ = self.event_tx.send(EngineEvent::SceneStatusChanged {
            members: members.to_vec(),
            status: PatternStatus::Accepted,
        });
        Ok(scene)
    }

    pub async fn reject_scene(
        &self,
        members: &[SceneMember],
        at: DateTime<Utc>,
    ) -> Result<ScenePattern, EngineError> {
        let delta = EvidenceDelta {
            change: EvidenceChange::CounterEvidence {
                kind: CounterEvidence::Rejection,
                at,
            },
            rules: self.scenes.rules(),
        };
        let upserted = self.upsert_scene(members, delta).await?;
        let _ = self.event_tx.send(EngineEvent::SceneStatusChanged {
            members: members.to_vec(),
            status: PatternStatus::Rejected,
        });
        Ok(upserted.record)
    }

    /// Process one shard's queue until shutdown, then finish whatever was
    /// already queued
    fn start_shard(self: &Arc<Self>, index: usize, mut rx: mpsc::Receiver<ShardMessage>) {
        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = shutdown.cancelled() => break,
                    message = rx.recv() => message,
                };
                match message {
                    Some(message) => engine.handle(message).await,
                    None => break,
                }
            }

            rx.close();
            let mut drained = 0usize;
            while let Some(message) = rx.recv().await {
                engine.handle(message).await;
                drained += 1;
            }
            tracing::debug!("Shard {} stopped after draining {} messages", index, drained);
        });
    }

    async fn handle(&self, message: ShardMessage) {
        match message {
            ShardMessage::Event(event) => {
                // Failures are already logged and counted
                let _ = self.process(event).await;
            }
            ShardMessage::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Run batch passes when the scheduler says they are due
    fn start_scheduler_listener(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.scheduler.subscribe();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let tick = tokio::select! {
                    () = shutdown.cancelled() => break,
                    tick = rx.recv() => tick,
                };
                match tick {
                    Ok(tick) => {
                        let cancel = shutdown.child_token();
                        let now = Utc::now();
                        // Outcome is logged and broadcast by run_pass
                        let _ = match tick.job {
                            BatchJob::Correlation => engine.run_correlation_pass(now, &cancel).await,
                            BatchJob::Scenes => engine.run_scene_pass(now, &cancel).await,
                        };
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Batch listener lagged by {} ticks", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Batch scheduler channel closed");
                        break;
                    }
                }
            }
        });
    }
}

fn lock_cursor(cursor: &Mutex<Option<DateTime<Utc>>>) -> Result<Option<DateTime<Utc>>, EngineError> {
    cursor
        .lock()
        .map(|guard| *guard)
        .map_err(|_| EngineError::InconsistentState("cursor poisoned".to_string()))
}

/// Shard owning an entity; all of an entity's events go to the same shard
fn shard_index(entity_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    entity_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}
