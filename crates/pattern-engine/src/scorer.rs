//! Confidence accumulation, decay and counter-evidence
//!
//! Confidence grows by a fraction of the remaining headroom below a ceiling
//! that is never reached, halves every `half_life` once the next expected
//! occurrence has passed without a match, and drops by an absolute step for
//! misses and rejections. Both steps are at
//! least as large as the largest possible gain from a single match.
//!
//! Mutations are expressed as [`EvidenceDelta`]s that a store applies to the
//! authoritative row inside its own critical section, so confidence is
//! always recomputed from the stored value rather than a cached copy.

use crate::config::ConfidenceConfig;
use crate::model::{remember, DayScope, Evidence, PatternStatus};
use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Kinds of negative evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEvidence {
    /// An accepted pattern did not fire on a day it should have
    Miss,
    /// The user declared the pattern wrong
    Rejection,
}

/// Bounded confidence model
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceScorer {
    learning_rate: f64,
    ceiling: f64,
    half_life_secs: f64,
    miss_penalty: f64,
    rejection_penalty: f64,
    /// Time after the last match before decay sets in
    grace: Duration,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::from_config(&ConfidenceConfig::default())
    }
}

impl ConfidenceScorer {
    pub fn from_config(config: &ConfidenceConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            ceiling: config.ceiling,
            half_life_secs: config.half_life_days * 86_400.0,
            miss_penalty: config.miss_penalty,
            rejection_penalty: config.rejection_penalty,
            grace: Duration::zero(),
        }
    }

    /// Same model, decaying only once `grace` has passed since the last match
    #[must_use]
    pub fn with_grace(self, grace: Duration) -> Self {
        Self {
            grace: grace.max(Duration::zero()),
            ..self
        }
    }

    /// Instant from which the stored confidence starts to decay
    pub fn decay_start(&self, evidence: &Evidence) -> DateTime<Utc> {
        match evidence.last_matched_at {
            Some(last) => evidence.scored_at.max(last + self.grace),
            None => evidence.scored_at,
        }
    }

    /// Confidence after decaying from `from` to `to`
    pub fn decayed(&self, confidence: f64, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let elapsed = (to - from).num_milliseconds();
        if elapsed <= 0 {
            return confidence;
        }
        let half_lives = elapsed as f64 / 1000.0 / self.half_life_secs;
        confidence * 0.5_f64.powf(half_lives)
    }

    /// Read-time confidence of a row, without mutating it
    pub fn current(&self, evidence: &Evidence, now: DateTime<Utc>) -> f64 {
        self.decayed(evidence.confidence, self.decay_start(evidence), now)
    }

    /// Largest increase a single full-weight match can produce
    pub fn max_gain(&self) -> f64 {
        self.learning_rate * self.ceiling
    }

    /// Apply one observation (`observed`) or one missed occurrence
    pub fn update(&self, evidence: &mut Evidence, observed: bool, at: DateTime<Utc>) -> f64 {
        if observed {
            self.reinforce(evidence, 1.0, at)
        } else {
            self.penalize(evidence, CounterEvidence::Miss, at)
        }
    }

    /// Decay to `at`, then move `weight` of the learning rate toward the ceiling
    pub fn reinforce(&self, evidence: &mut Evidence, weight: f64, at: DateTime<Utc>) -> f64 {
        let base = self.checkpoint(evidence, at);
        let headroom = (self.ceiling - base).max(0.0);
        evidence.confidence = (base + headroom * self.learning_rate * weight.clamp(0.0, 1.0))
            .min(self.ceiling);
        evidence.confidence
    }

    /// Decay to `at`, then subtract the penalty for `kind`
    pub fn penalize(&self, evidence: &mut Evidence, kind: CounterEvidence, at: DateTime<Utc>) -> f64 {
        let base = self.checkpoint(evidence, at);
        let penalty = match kind {
            CounterEvidence::Miss => self.miss_penalty,
            CounterEvidence::Rejection => self.rejection_penalty,
        };
        evidence.confidence = (base - penalty).max(0.0);
        evidence.negative_evidence = evidence.negative_evidence.saturating_add(1);
        evidence.confidence
    }

    /// Persist decay up to `at`
    pub fn checkpoint(&self, evidence: &mut Evidence, at: DateTime<Utc>) -> f64 {
        evidence.confidence = self.decayed(evidence.confidence, self.decay_start(evidence), at);
        if at > evidence.scored_at {
            evidence.scored_at = at;
        }
        evidence.confidence
    }
}

/// Scoring model and suggestion thresholds carried with every delta
#[derive(Debug, Clone, Copy)]
pub struct LearningRules {
    pub scorer: ConfidenceScorer,
    pub min_repetitions: u32,
    pub min_distinct_days: u32,
}

impl LearningRules {
    /// Rules for habits that recur at `scope`'s cadence
    #[must_use]
    pub fn for_scope(self, scope: DayScope) -> Self {
        Self {
            scorer: self.scorer.with_grace(scope.recurrence()),
            ..self
        }
    }

    /// Whether the evidence is strong enough to surface as a suggestion
    pub fn is_significant(&self, evidence: &Evidence) -> bool {
        evidence.match_count >= self.min_repetitions
            && evidence.distinct_days() >= self.min_distinct_days
    }
}

/// A single mutation of a pattern or scene row
#[derive(Debug, Clone, PartialEq)]
pub enum EvidenceChange {
    /// A matching event
    Observation {
        fingerprint: String,
        at: DateTime<Utc>,
        activity_date: NaiveDate,
        weight: f64,
        /// Keep the row observing even when it crosses the thresholds
        hold_promotion: bool,
    },
    CounterEvidence {
        kind: CounterEvidence,
        at: DateTime<Utc>,
    },
    /// Persist decay without new evidence
    Decay { at: DateTime<Utc> },
}

/// A change plus the rules to apply it with
#[derive(Debug, Clone)]
pub struct EvidenceDelta {
    pub change: EvidenceChange,
    pub rules: LearningRules,
}

/// What applying a delta did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// False when the delta was a replay of an already applied event
    pub changed: bool,
    /// The row moved from observing to suggested
    pub promoted: bool,
}

impl EvidenceDelta {
    /// Only observations may create a missing row
    pub fn creates_row(&self) -> bool {
        matches!(self.change, EvidenceChange::Observation { .. })
    }

    /// Timestamp of the change, used for new rows
    pub fn at(&self) -> DateTime<Utc> {
        match &self.change {
            EvidenceChange::Observation { at, .. }
            | EvidenceChange::CounterEvidence { at, .. }
            | EvidenceChange::Decay { at } => *at,
        }
    }

    /// Apply to the authoritative row
    pub fn apply(&self, evidence: &mut Evidence) -> Applied {
        let scorer = &self.rules.scorer;
        match &self.change {
            EvidenceChange::Observation {
                fingerprint,
                at,
                activity_date,
                weight,
                hold_promotion,
            } => {
                if evidence.has_applied(fingerprint) {
                    return Applied::default();
                }
                scorer.reinforce(evidence, *weight, *at);
                evidence.match_count = evidence.match_count.saturating_add(1);
                if evidence.last_matched_at.map_or(true, |last| *at > last) {
                    evidence.last_matched_at = Some(*at);
                }
                evidence.observed_days.insert(*activity_date);
                remember(&mut evidence.recent_events, fingerprint.clone());

                let promoted = !hold_promotion
                    && evidence.status == PatternStatus::Observing
                    && self.rules.is_significant(evidence);
                if promoted {
                    evidence.status = PatternStatus::Suggested;
                }
                Applied {
                    changed: true,
                    promoted,
                }
            }
            EvidenceChange::CounterEvidence { kind, at } => {
                scorer.penalize(evidence, *kind, *at);
                if *kind == CounterEvidence::Rejection {
                    evidence.status = PatternStatus::Rejected;
                }
                Applied {
                    changed: true,
                    promoted: false,
                }
            }
            EvidenceChange::Decay { at } => {
                let before = evidence.confidence;
                scorer.checkpoint(evidence, *at);
                Applied {
                    changed: (before - evidence.confidence).abs() > f64::EPSILON,
                    promoted: false,
                }
            }
        }
    }
}
