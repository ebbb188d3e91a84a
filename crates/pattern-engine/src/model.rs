//! Data models for the pattern engine

use crate::error::EngineError;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Number of applied event fingerprints remembered per stored row
pub const FINGERPRINT_MEMORY: usize = 64;

/// Attribute map carried by state events
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// State change notification as delivered by the event source.
///
/// Every field is optional so that a bad payload can still be counted
/// instead of failing deserialization of a whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStateEvent {
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub new_state: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

/// A validated, immutable state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    /// Entity identifier (e.g., "light.kitchen")
    pub entity_id: String,
    /// State before the change (empty when unknown)
    pub previous_state: String,
    /// State after the change
    pub new_state: String,
    /// Attributes reported with the new state
    #[serde(default)]
    pub attributes: Attributes,
    /// When the change happened
    pub occurred_at: DateTime<Utc>,
}

impl StateEvent {
    /// Create an event with no attributes
    pub fn new(
        entity_id: impl Into<String>,
        previous_state: impl Into<String>,
        new_state: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            previous_state: previous_state.into(),
            new_state: new_state.into(),
            attributes: Attributes::new(),
            occurred_at,
        }
    }

    /// Attach an attribute
    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Entity domain (the part before the first '.')
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map_or(self.entity_id.as_str(), |(domain, _)| domain)
    }

    /// Identity used for replay detection
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.entity_id,
            self.previous_state,
            self.new_state,
            self.occurred_at.timestamp_millis()
        )
    }
}

impl TryFrom<RawStateEvent> for StateEvent {
    type Error = EngineError;

    fn try_from(raw: RawStateEvent) -> Result<Self, Self::Error> {
        let entity_id = raw
            .entity_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| EngineError::MalformedEvent("missing entity_id".to_string()))?;

        match entity_id.split_once('.') {
            Some((domain, object)) if !domain.is_empty() && !object.is_empty() => {}
            _ => {
                return Err(EngineError::MalformedEvent(format!(
                    "entity_id must be <domain>.<object>, got {entity_id}"
                )))
            }
        }

        let occurred_at = raw.occurred_at.ok_or_else(|| {
            EngineError::MalformedEvent(format!("missing occurred_at for {entity_id}"))
        })?;

        Ok(Self {
            entity_id,
            previous_state: raw.previous_state.unwrap_or_default(),
            new_state: raw.new_state.unwrap_or_default(),
            attributes: raw.attributes,
            occurred_at,
        })
    }
}

/// Coarse label derived from hour-of-day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayPhase {
    EarlyMorning,
    Morning,
    Afternoon,
    Evening,
    Night,
}

/// Fixed-width time-of-day interval, stored as minutes after local midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeBucket(pub u16);

impl TimeBucket {
    /// Bucket starting at the given local hour and minute
    #[must_use]
    pub fn at(hour: u16, minute: u16) -> Self {
        Self((hour * 60 + minute) % 1440)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// Which days a pattern applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayScope {
    /// Every day
    Daily,
    /// One weekday (0=Sunday, 1=Monday, ..., 6=Saturday)
    Weekday(u8),
    /// Holidays and vacation days flagged by the calendar
    NonWorkday,
}

impl DayScope {
    /// Numeric weekday, -1 for daily patterns and 7 for non-workdays
    pub fn weekday_index(self) -> i8 {
        match self {
            Self::Daily => -1,
            Self::Weekday(day) => day as i8,
            Self::NonWorkday => 7,
        }
    }

    /// Expected gap between two occurrences of a habit in this scope
    pub fn recurrence(self) -> Duration {
        match self {
            Self::Daily => Duration::days(1),
            Self::Weekday(_) | Self::NonWorkday => Duration::weeks(1),
        }
    }

    /// Whether this scope is narrower than a daily pattern
    pub fn is_specific(self) -> bool {
        !matches!(self, Self::Daily)
    }

    /// Whether a day with the given weekday/holiday flag falls under this scope
    pub fn covers(self, weekday: u8, is_holiday: bool) -> bool {
        match self {
            Self::Daily => true,
            Self::Weekday(day) => !is_holiday && day == weekday,
            Self::NonWorkday => is_holiday,
        }
    }
}

impl fmt::Display for DayScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Weekday(day) => write!(f, "{}", NAMES.get(*day as usize).unwrap_or(&"?")),
            Self::NonWorkday => write!(f, "non-workday"),
        }
    }
}

/// A state event enriched with situational context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextualEvent {
    pub event: StateEvent,
    /// The state or attribute delta being predicted (e.g. "on", "on[brightness]")
    pub action: String,
    pub time_bucket: TimeBucket,
    pub day_phase: DayPhase,
    /// Weekday of `activity_date` (0=Sunday)
    pub weekday: u8,
    /// Calendar day the activity belongs to; late-night events keep the
    /// date on which the night started
    pub activity_date: NaiveDate,
    pub is_holiday: bool,
    pub person_context: String,
    /// Weight this event contributes as evidence (reduced for unknown person)
    pub evidence_weight: f64,
    pub is_automation_echo: bool,
    #[serde(default)]
    pub room: Option<String>,
}

impl ContextualEvent {
    pub fn entity_id(&self) -> &str {
        &self.event.entity_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.event.occurred_at
    }

    pub fn fingerprint(&self) -> String {
        self.event.fingerprint()
    }

    /// Whether this day counts as a workday (not a weekend, not a holiday)
    pub fn is_workday(&self) -> bool {
        !self.is_holiday && (1..=5).contains(&self.weekday)
    }
}

/// Upsert key of a learned pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternKey {
    pub entity_id: String,
    pub action: String,
    pub time_bucket: TimeBucket,
    pub scope: DayScope,
}

impl PatternKey {
    /// The same key widened to every day
    #[must_use]
    pub fn daily(&self) -> Self {
        Self {
            scope: DayScope::Daily,
            ..self.clone()
        }
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} @ {} ({})",
            self.entity_id, self.action, self.time_bucket, self.scope
        )
    }
}

/// Review lifecycle shared by patterns and scenes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    #[default]
    Observing,
    Suggested,
    Accepted,
    Rejected,
}

impl PatternStatus {
    /// Whether the pattern has been surfaced to (or confirmed by) the user
    pub fn is_confirmed(self) -> bool {
        matches!(self, Self::Suggested | Self::Accepted)
    }

    /// Whether a review may move a row from `self` to `next`. Rejected
    /// rows stay rejected; only suggested rows can be accepted.
    pub fn can_become(self, next: Self) -> bool {
        match (self, next) {
            (from, to) if from == to => true,
            (Self::Rejected, _) => false,
            (Self::Observing, Self::Suggested) | (Self::Suggested, Self::Accepted) => true,
            (_, Self::Rejected) => true,
            _ => false,
        }
    }

    /// Precedence used when merging duplicate rows
    fn precedence(self) -> u8 {
        match self {
            Self::Observing => 0,
            Self::Suggested => 1,
            Self::Accepted => 2,
            Self::Rejected => 3,
        }
    }
}

/// Evidence and review lifecycle shared by patterns and scenes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Observations accumulated
    pub match_count: u32,
    /// Confidence as of `scored_at`
    pub confidence: f64,
    pub status: PatternStatus,
    pub last_matched_at: Option<DateTime<Utc>>,
    /// Point in time `confidence` was last brought up to date
    pub scored_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Misses and rejections applied so far
    #[serde(default)]
    pub negative_evidence: u32,
    /// Distinct activity dates with a match
    #[serde(default)]
    pub observed_days: BTreeSet<NaiveDate>,
    /// Fingerprints of the most recently applied events
    #[serde(default)]
    pub recent_events: VecDeque<String>,
}

impl Evidence {
    /// No observations yet
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            match_count: 0,
            confidence: 0.0,
            status: PatternStatus::Observing,
            last_matched_at: None,
            scored_at: at,
            created_at: at,
            negative_evidence: 0,
            observed_days: BTreeSet::new(),
            recent_events: VecDeque::new(),
        }
    }

    /// Whether an event fingerprint has already been applied
    pub fn has_applied(&self, fingerprint: &str) -> bool {
        self.recent_events.iter().any(|f| f == fingerprint)
    }

    pub fn distinct_days(&self) -> u32 {
        u32::try_from(self.observed_days.len()).unwrap_or(u32::MAX)
    }

    /// Merge the evidence of a duplicate row into this one.
    ///
    /// Counts are summed and the more recent `last_matched_at` wins, along
    /// with the confidence that belongs to it.
    pub fn merge(&mut self, other: Evidence) {
        self.match_count = self.match_count.saturating_add(other.match_count);
        self.negative_evidence = self.negative_evidence.saturating_add(other.negative_evidence);
        if other.last_matched_at > self.last_matched_at {
            self.last_matched_at = other.last_matched_at;
            self.confidence = other.confidence;
            self.scored_at = other.scored_at;
        }
        if other.status.precedence() > self.status.precedence() {
            self.status = other.status;
        }
        self.created_at = self.created_at.min(other.created_at);
        self.observed_days.extend(other.observed_days);
        for fingerprint in other.recent_events {
            remember(&mut self.recent_events, fingerprint);
        }
    }
}

/// Durable unit of knowledge about a recurring action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub key: PatternKey,
    #[serde(flatten)]
    pub evidence: Evidence,
}

impl LearnedPattern {
    pub fn new(key: PatternKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            evidence: Evidence::new(at),
        }
    }

    pub fn status(&self) -> PatternStatus {
        self.evidence.status
    }

    pub fn confidence(&self) -> f64 {
        self.evidence.confidence
    }

    pub fn match_count(&self) -> u32 {
        self.evidence.match_count
    }
}

/// Result of observing one event for one pattern granularity
#[derive(Debug, Clone, PartialEq)]
pub struct PatternCandidate {
    pub key: PatternKey,
    pub match_count: u32,
    pub confidence: f64,
    pub status: PatternStatus,
    /// True only on the observation that crossed the suggestion threshold
    pub newly_suggested: bool,
}

impl From<&LearnedPattern> for PatternCandidate {
    fn from(pattern: &LearnedPattern) -> Self {
        Self {
            key: pattern.key.clone(),
            match_count: pattern.evidence.match_count,
            confidence: pattern.evidence.confidence,
            status: pattern.evidence.status,
            newly_suggested: false,
        }
    }
}

/// Whether two linked entities share a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomScope {
    SameRoom,
    /// Different rooms, or at least one room unknown
    CrossRoom,
}

impl RoomScope {
    pub fn between(a: Option<&str>, b: Option<&str>) -> Self {
        match (a, b) {
            (Some(a), Some(b)) if a == b => Self::SameRoom,
            _ => Self::CrossRoom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    #[default]
    Forward,
    Bidirectional,
}

/// What produced the source transitions of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Human-initiated source transitions
    #[default]
    Habit,
    /// Source transitions were side effects of an accepted automation
    AutomationChain,
}

/// Upsert key of a correlation link
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkKey {
    pub source_entity: String,
    pub source_action: String,
    pub target_entity: String,
    pub target_action: String,
}

impl LinkKey {
    /// Whether `other` links the same two entities the other way around
    pub fn is_reverse_of(&self, other: &LinkKey) -> bool {
        self.source_entity == other.target_entity && self.target_entity == other.source_entity
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={} -> {}={}",
            self.source_entity, self.source_action, self.target_entity, self.target_action
        )
    }
}

/// Relation between two entities' transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationLink {
    pub key: LinkKey,
    /// Mean delay between source and target transitions
    pub lag_seconds: f64,
    pub direction: LinkDirection,
    pub strength: f64,
    pub room_scope: RoomScope,
    pub kind: LinkKind,
    /// Independent source->target occurrences
    pub occurrences: u32,
    /// Occurrences whose source transition was an automation echo
    pub echo_occurrences: u32,
    /// Set when a reverse link with comparable lag fights this one
    pub feedback_loop: bool,
    /// Evidence cleared the room-scope threshold and the link is neither a
    /// chain artifact nor part of a loop
    pub promoted: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub recent_occurrences: VecDeque<String>,
}

impl CorrelationLink {
    pub fn new(key: LinkKey, room_scope: RoomScope, at: DateTime<Utc>) -> Self {
        Self {
            key,
            lag_seconds: 0.0,
            direction: LinkDirection::Forward,
            strength: 0.0,
            room_scope,
            kind: LinkKind::Habit,
            occurrences: 0,
            echo_occurrences: 0,
            feedback_loop: false,
            promoted: false,
            first_seen_at: at,
            last_seen_at: at,
            recent_occurrences: VecDeque::new(),
        }
    }

    pub fn source_entity(&self) -> &str {
        &self.key.source_entity
    }

    pub fn target_entity(&self) -> &str {
        &self.key.target_entity
    }
}

/// One device and the state it takes in a scene
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneMember {
    pub entity_id: String,
    pub target_state: String,
}

/// A set of device states observed to change together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenePattern {
    /// Sorted, one entry per entity
    pub members: Vec<SceneMember>,
    #[serde(flatten)]
    pub evidence: Evidence,
}

impl ScenePattern {
    pub fn new(members: Vec<SceneMember>, at: DateTime<Utc>) -> Self {
        Self {
            members,
            evidence: Evidence::new(at),
        }
    }

    /// Whether every member of `members` is part of this scene
    pub fn contains_all(&self, members: &[SceneMember]) -> bool {
        members.iter().all(|m| self.members.contains(m))
    }
}

/// Record a fingerprint, forgetting the oldest beyond [`FINGERPRINT_MEMORY`]
pub(crate) fn remember(list: &mut VecDeque<String>, fingerprint: String) {
    if list.iter().any(|f| *f == fingerprint) {
        return;
    }
    list.push_back(fingerprint);
    while list.len() > FINGERPRINT_MEMORY {
        list.pop_front();
    }
}
