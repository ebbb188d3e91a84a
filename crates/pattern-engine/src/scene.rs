//! Multi-device scene detection

use crate::config::SceneConfig;
use crate::model::{ContextualEvent, SceneMember, ScenePattern};
use crate::scorer::{EvidenceChange, EvidenceDelta, LearningRules};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};

/// One co-occurrence group seen in the event stream
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObservation {
    /// Sorted, one entry per entity
    pub members: Vec<SceneMember>,
    /// Identity of the group, built from its events
    pub fingerprint: String,
    pub at: DateTime<Utc>,
    pub activity_date: NaiveDate,
    /// Weakest evidence weight among the group's events
    pub weight: f64,
}

impl SceneObservation {
    pub fn delta(&self, rules: LearningRules, hold_promotion: bool) -> EvidenceDelta {
        EvidenceDelta {
            change: EvidenceChange::Observation {
                fingerprint: self.fingerprint.clone(),
                at: self.at,
                activity_date: self.activity_date,
                weight: self.weight,
                hold_promotion,
            },
            rules,
        }
    }
}

/// Closed groups found by one scene pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settled {
    pub observations: Vec<SceneObservation>,
    /// Latest event belonging to a closed group
    pub through: Option<DateTime<Utc>>,
}

/// Groups devices that reliably change together
#[derive(Debug, Clone)]
pub struct SceneDetector {
    config: SceneConfig,
    rules: LearningRules,
}

impl SceneDetector {
    pub fn new(config: SceneConfig, rules: LearningRules) -> Self {
        Self { config, rules }
    }

    pub fn rules(&self) -> LearningRules {
        self.rules
    }

    /// Split events into co-occurrence groups of at least `min_members`
    /// devices. A group spans `window_secs` from its first event. Echoes and
    /// attribute-only changes are left out.
    pub fn groups(&self, events: &[ContextualEvent]) -> Vec<SceneObservation> {
        self.partition(events)
            .into_iter()
            .filter_map(|group| self.observation(&group))
            .collect()
    }

    /// Groups that can no longer grow by `now`, plus the time of the last
    /// event they consumed. Groups still inside their window are left for a
    /// later pass.
    pub fn settled(&self, events: &[ContextualEvent], now: DateTime<Utc>) -> Settled {
        let window = self.window();
        let mut settled = Settled::default();
        for group in self.partition(events) {
            let Some(first) = group.first() else { continue };
            if first.occurred_at() + window > now {
                break;
            }
            if let Some(last) = group.last() {
                settled.through = Some(last.occurred_at());
            }
            settled.observations.extend(self.observation(&group));
        }
        settled
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.window_secs as i64)
    }

    /// Chronological groups; each starts at the first event more than a
    /// window after the previous group's start
    fn partition<'a>(&self, events: &'a [ContextualEvent]) -> Vec<Vec<&'a ContextualEvent>> {
        let mut sorted: Vec<&ContextualEvent> = events
            .iter()
            .filter(|e| !e.is_automation_echo && e.event.previous_state != e.event.new_state)
            .collect();
        sorted.sort_by_key(|e| e.occurred_at());

        let window = self.window();
        let mut groups: Vec<Vec<&ContextualEvent>> = Vec::new();
        for event in sorted {
            let starts_group = groups
                .last()
                .map_or(true, |group| event.occurred_at() - group[0].occurred_at() > window);
            if starts_group {
                groups.push(vec![event]);
            } else if let Some(group) = groups.last_mut() {
                group.push(event);
            }
        }
        groups
    }

    fn observation(&self, group: &[&ContextualEvent]) -> Option<SceneObservation> {
        let first = group.first()?;

        // The last state of each entity within the group wins
        let mut states: BTreeMap<&str, &str> = BTreeMap::new();
        for event in group {
            states.insert(event.entity_id(), event.event.new_state.as_str());
        }
        if states.len() < self.config.min_members {
            return None;
        }

        let members = states
            .into_iter()
            .map(|(entity_id, target_state)| SceneMember {
                entity_id: entity_id.to_string(),
                target_state: target_state.to_string(),
            })
            .collect();

        let mut fingerprints: Vec<String> = group.iter().map(|e| e.fingerprint()).collect();
        fingerprints.sort();

        let weight = group
            .iter()
            .map(|e| e.evidence_weight)
            .fold(1.0_f64, f64::min);

        Some(SceneObservation {
            members,
            fingerprint: fingerprints.join("+"),
            at: first.occurred_at(),
            activity_date: first.activity_date,
            weight,
        })
    }

    /// Whether `members` is a strict subset of an already confirmed scene
    pub fn is_redundant(members: &[SceneMember], confirmed: &[ScenePattern]) -> bool {
        confirmed.iter().any(|scene| {
            scene.evidence.status.is_confirmed()
                && scene.members.len() > members.len()
                && scene.contains_all(members)
        })
    }

    /// Fold a batch into scene candidates, on top of already known scenes
    pub fn detect(&self, events: &[ContextualEvent], known: &[ScenePattern]) -> Vec<ScenePattern> {
        let mut scenes: HashMap<Vec<SceneMember>, ScenePattern> = known
            .iter()
            .map(|scene| (scene.members.clone(), scene.clone()))
            .collect();

        for observation in self.groups(events) {
            let confirmed: Vec<ScenePattern> = scenes.values().cloned().collect();
            let hold = Self::is_redundant(&observation.members, &confirmed);
            let scene = scenes
                .entry(observation.members.clone())
                .or_insert_with(|| ScenePattern::new(observation.members.clone(), observation.at));
            observation.delta(self.rules, hold).apply(&mut scene.evidence);
        }

        let mut detected: Vec<ScenePattern> = scenes
            .into_values()
            .filter(|scene| scene.evidence.match_count > 0)
            .collect();
        detected.sort_by(|a, b| a.members.cmp(&b.members));
        detected
    }
}
