//! Cross-entity correlation over a trailing window of tagged events

use crate::config::CorrelationConfig;
use crate::model::{
    remember, ContextualEvent, CorrelationLink, LinkDirection, LinkKey, LinkKind, RoomScope,
};
use crate::scorer::Applied;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// Evidence thresholds for links
#[derive(Debug, Clone, Copy)]
pub struct LinkRules {
    pub max_lag_secs: f64,
    pub same_room_min_occurrences: u32,
    pub cross_room_min_occurrences: u32,
    pub cross_room_weight: f64,
    pub loop_lag_tolerance_secs: f64,
}

impl From<&CorrelationConfig> for LinkRules {
    fn from(config: &CorrelationConfig) -> Self {
        Self {
            max_lag_secs: config.max_lag_secs as f64,
            same_room_min_occurrences: config.same_room_min_occurrences,
            cross_room_min_occurrences: config.cross_room_min_occurrences,
            cross_room_weight: config.cross_room_weight,
            loop_lag_tolerance_secs: config.loop_lag_tolerance_secs,
        }
    }
}

impl LinkRules {
    /// Occurrences needed before a link in this scope is promoted
    pub fn threshold(&self, scope: RoomScope) -> u32 {
        match scope {
            RoomScope::SameRoom => self.same_room_min_occurrences,
            RoomScope::CrossRoom => self.cross_room_min_occurrences,
        }
    }

    /// Recompute derived fields after the counts changed
    pub fn refresh(&self, link: &mut CorrelationLink) {
        let occurrences = f64::from(link.occurrences);
        let mut strength =
            occurrences / (occurrences + f64::from(self.same_room_min_occurrences.max(1)));
        let threshold = self.threshold(link.room_scope);
        if link.room_scope == RoomScope::CrossRoom && link.occurrences < threshold {
            strength *= self.cross_room_weight;
        }
        link.strength = strength.clamp(0.0, 1.0);

        link.kind = if link.echo_occurrences * 2 > link.occurrences {
            LinkKind::AutomationChain
        } else {
            LinkKind::Habit
        };
        link.direction = if link.feedback_loop {
            LinkDirection::Bidirectional
        } else {
            LinkDirection::Forward
        };
        link.promoted = link.occurrences >= threshold
            && link.kind == LinkKind::Habit
            && !link.feedback_loop;
    }
}

/// A single mutation of a link row
#[derive(Debug, Clone, PartialEq)]
pub enum LinkChange {
    /// Target transition followed the source transition
    Occurrence {
        id: String,
        lag_secs: f64,
        at: DateTime<Utc>,
        source_echo: bool,
    },
    /// The reverse link fights this one
    MarkLoop { at: DateTime<Utc> },
}

/// A change plus the rules to apply it with
#[derive(Debug, Clone)]
pub struct LinkDelta {
    pub change: LinkChange,
    pub room_scope: RoomScope,
    pub rules: LinkRules,
}

impl LinkDelta {
    pub fn creates_row(&self) -> bool {
        matches!(self.change, LinkChange::Occurrence { .. })
    }

    pub fn at(&self) -> DateTime<Utc> {
        match &self.change {
            LinkChange::Occurrence { at, .. } | LinkChange::MarkLoop { at } => *at,
        }
    }

    /// Apply to the authoritative row; `promoted` reports a fresh promotion
    pub fn apply(&self, link: &mut CorrelationLink) -> Applied {
        let was_promoted = link.promoted;
        let changed = match &self.change {
            LinkChange::Occurrence {
                id,
                lag_secs,
                at,
                source_echo,
            } => {
                if link.recent_occurrences.iter().any(|seen| seen == id) {
                    return Applied::default();
                }
                let n = f64::from(link.occurrences);
                link.lag_seconds = (link.lag_seconds * n + lag_secs) / (n + 1.0);
                link.occurrences = link.occurrences.saturating_add(1);
                if *source_echo {
                    link.echo_occurrences = link.echo_occurrences.saturating_add(1);
                }
                link.first_seen_at = link.first_seen_at.min(*at);
                link.last_seen_at = link.last_seen_at.max(*at);
                remember(&mut link.recent_occurrences, id.clone());
                true
            }
            LinkChange::MarkLoop { at } => {
                let changed = !link.feedback_loop;
                link.feedback_loop = true;
                link.last_seen_at = link.last_seen_at.max(*at);
                changed
            }
        };
        self.rules.refresh(link);
        Applied {
            changed,
            promoted: !was_promoted && link.promoted,
        }
    }
}

/// One target transition following one source transition
#[derive(Debug, Clone, PartialEq)]
pub struct PairOccurrence {
    pub key: LinkKey,
    /// Stable identity, so overlapping windows do not double count
    pub id: String,
    pub lag_secs: f64,
    /// Time of the source transition
    pub at: DateTime<Utc>,
    pub source_echo: bool,
    pub room_scope: RoomScope,
}

impl PairOccurrence {
    pub fn delta(&self, rules: LinkRules) -> LinkDelta {
        LinkDelta {
            change: LinkChange::Occurrence {
                id: self.id.clone(),
                lag_secs: self.lag_secs,
                at: self.at,
                source_echo: self.source_echo,
            },
            room_scope: self.room_scope,
            rules,
        }
    }
}

/// Finds causal links, feedback loops and automation chains
#[derive(Debug, Clone)]
pub struct CorrelationAnalyzer {
    rules: LinkRules,
}

impl CorrelationAnalyzer {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            rules: LinkRules::from(config),
        }
    }

    pub fn rules(&self) -> LinkRules {
        self.rules
    }

    /// Every source->target pairing in the window.
    ///
    /// Each source transition pairs with the first later transition of every
    /// other entity within the lag bound. A repeat of the source entity ends
    /// its pairing span. Echo targets are skipped: they are the system's own
    /// doing, not a reaction.
    pub fn occurrences(&self, window: &[ContextualEvent]) -> Vec<PairOccurrence> {
        let mut events: Vec<&ContextualEvent> = window.iter().collect();
        events.sort_by_key(|e| e.occurred_at());

        let mut pairs = Vec::new();
        for (i, source) in events.iter().enumerate() {
            let mut targets = HashSet::new();
            for target in &events[i + 1..] {
                let lag = (target.occurred_at() - source.occurred_at()).num_milliseconds() as f64
                    / 1000.0;
                if lag > self.rules.max_lag_secs {
                    break;
                }
                if target.entity_id() == source.entity_id() {
                    break;
                }
                if lag <= 0.0 || target.is_automation_echo {
                    continue;
                }
                if !targets.insert(target.entity_id()) {
                    continue;
                }
                pairs.push(PairOccurrence {
                    key: LinkKey {
                        source_entity: source.entity_id().to_string(),
                        source_action: source.action.clone(),
                        target_entity: target.entity_id().to_string(),
                        target_action: target.action.clone(),
                    },
                    id: format!("{}>{}", source.fingerprint(), target.fingerprint()),
                    lag_secs: lag,
                    at: source.occurred_at(),
                    source_echo: source.is_automation_echo,
                    room_scope: RoomScope::between(source.room.as_deref(), target.room.as_deref()),
                });
            }
        }
        pairs
    }

    /// Pairs of reverse links that look like two devices fighting each other
    pub fn detect_loops(&self, links: &[CorrelationLink]) -> Vec<(LinkKey, LinkKey)> {
        let reliable: Vec<&CorrelationLink> = links
            .iter()
            .filter(|l| l.occurrences >= self.rules.same_room_min_occurrences)
            .collect();

        let mut loops = Vec::new();
        for (i, a) in reliable.iter().enumerate() {
            for b in &reliable[i + 1..] {
                if !a.key.is_reverse_of(&b.key) {
                    continue;
                }
                let comparable_lag = (a.lag_seconds - b.lag_seconds).abs()
                    <= self.rules.loop_lag_tolerance_secs
                    && a.lag_seconds <= self.rules.max_lag_secs
                    && b.lag_seconds <= self.rules.max_lag_secs;
                let overlapping =
                    a.first_seen_at <= b.last_seen_at && b.first_seen_at <= a.last_seen_at;
                if comparable_lag && overlapping {
                    loops.push((a.key.clone(), b.key.clone()));
                }
            }
        }
        loops
    }

    /// Links supported by the window alone, with loops flagged
    pub fn analyze(&self, window: &[ContextualEvent]) -> Vec<CorrelationLink> {
        let mut links: BTreeMap<LinkKey, CorrelationLink> = BTreeMap::new();
        for pair in self.occurrences(window) {
            let link = links
                .entry(pair.key.clone())
                .or_insert_with(|| CorrelationLink::new(pair.key.clone(), pair.room_scope, pair.at));
            pair.delta(self.rules).apply(link);
        }

        let snapshot: Vec<CorrelationLink> = links.values().cloned().collect();
        for (a, b) in self.detect_loops(&snapshot) {
            for key in [a, b] {
                if let Some(link) = links.get_mut(&key) {
                    let at = link.last_seen_at;
                    LinkDelta {
                        change: LinkChange::MarkLoop { at },
                        room_scope: link.room_scope,
                        rules: self.rules,
                    }
                    .apply(link);
                }
            }
        }
        links.into_values().collect()
    }
}
