//! Admission filter for raw state changes

use crate::config::FilterConfig;
use crate::model::{Attributes, RawStateEvent, StateEvent};
use crate::stats::EngineStats;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// States that never describe a user-visible change
const INVALID_STATES: [&str; 3] = ["unavailable", "unknown", "none"];

/// How often (in admitted events) the replay memory is pruned
const PRUNE_EVERY: u64 = 512;

/// Decides whether an attribute-only change is worth learning from
pub trait AttributeSignificance: Send + Sync {
    /// Name of the first attribute whose change is significant, if any
    fn significant_change(
        &self,
        domain: &str,
        previous: &Attributes,
        current: &Attributes,
    ) -> Option<String>;
}

/// Knows which entities this system recently actuated itself
pub trait EchoSuppression: Send + Sync {
    fn was_recently_actuated(&self, entity_id: &str, at: DateTime<Utc>, within: Duration) -> bool;
}

/// Watched attribute and the minimum numeric delta that counts
#[derive(Debug, Clone)]
struct Watch {
    attribute: &'static str,
    min_delta: f64,
}

const fn watch(attribute: &'static str, min_delta: f64) -> Watch {
    Watch {
        attribute,
        min_delta,
    }
}

/// Per-domain attribute watch list
#[derive(Debug, Clone)]
pub struct DomainSignificance {
    watches: HashMap<&'static str, Vec<Watch>>,
}

impl Default for DomainSignificance {
    fn default() -> Self {
        let mut watches = HashMap::new();
        watches.insert(
            "light",
            vec![
                watch("brightness", 25.0),
                watch("color_temp", 20.0),
                watch("rgb_color", 0.0),
            ],
        );
        watches.insert(
            "climate",
            vec![
                watch("hvac_mode", 0.0),
                watch("temperature", 0.5),
                watch("preset_mode", 0.0),
            ],
        );
        watches.insert(
            "cover",
            vec![watch("current_position", 10.0), watch("position", 10.0)],
        );
        watches.insert(
            "fan",
            vec![watch("percentage", 10.0), watch("preset_mode", 0.0)],
        );
        watches.insert("media_player", vec![watch("source", 0.0)]);
        Self { watches }
    }
}

impl AttributeSignificance for DomainSignificance {
    fn significant_change(
        &self,
        domain: &str,
        previous: &Attributes,
        current: &Attributes,
    ) -> Option<String> {
        let watches = self.watches.get(domain)?;
        watches.iter().find_map(|w| {
            let (Some(before), Some(after)) = (previous.get(w.attribute), current.get(w.attribute))
            else {
                return None;
            };
            let changed = match (before.numeric(), after.numeric()) {
                (Some(a), Some(b)) => (a - b).abs() >= w.min_delta.max(f64::EPSILON),
                _ => before != after,
            };
            changed.then(|| w.attribute.to_string())
        })
    }
}

/// Short-lived record of entities actuated by the automation layer
#[derive(Debug, Default)]
pub struct ActuationLog {
    actuated: DashMap<String, DateTime<Utc>>,
}

impl ActuationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that this system changed `entity_id` at `at`
    pub fn record_actuation(&self, entity_id: &str, at: DateTime<Utc>) {
        tracing::debug!("Recorded actuation of {} at {}", entity_id, at);
        self.actuated.insert(entity_id.to_string(), at);
    }

    /// Forget actuations older than `before`
    pub fn prune(&self, before: DateTime<Utc>) {
        self.actuated.retain(|_, at| *at >= before);
    }

    pub fn len(&self) -> usize {
        self.actuated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actuated.is_empty()
    }
}

impl EchoSuppression for ActuationLog {
    fn was_recently_actuated(&self, entity_id: &str, at: DateTime<Utc>, within: Duration) -> bool {
        self.actuated
            .get(entity_id)
            .is_some_and(|actuated| *actuated <= at && at - *actuated <= within)
    }
}

/// Why an event was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// New state is unavailable/unknown/empty
    InvalidState,
    /// Domain is not monitored and the entity is not whitelisted
    Unmonitored,
    /// Neither the state nor a significant attribute changed
    NoChange,
    /// Exact replay of an event already admitted
    Duplicate,
}

/// Outcome of screening one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Learnable human action
    Accept { action: String },
    /// Caused by this system's own actuation; only usable for correlation
    Echo { action: String },
    Reject(Rejection),
}

/// Validates and filters incoming state changes
pub struct StateEventFilter {
    config: FilterConfig,
    significance: Arc<dyn AttributeSignificance>,
    echoes: Arc<dyn EchoSuppression>,
    /// Last attributes seen per entity, for attribute-only changes
    last_attributes: DashMap<String, Attributes>,
    /// Fingerprints of admitted events
    seen: DashMap<String, DateTime<Utc>>,
    admitted: AtomicU64,
    stats: Arc<EngineStats>,
}

impl StateEventFilter {
    pub fn new(
        config: FilterConfig,
        significance: Arc<dyn AttributeSignificance>,
        echoes: Arc<dyn EchoSuppression>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            config,
            significance,
            echoes,
            last_attributes: DashMap::new(),
            seen: DashMap::new(),
            admitted: AtomicU64::new(0),
            stats,
        }
    }

    /// Validate a raw event. Malformed events are counted and dropped.
    pub fn admit(&self, raw: RawStateEvent) -> Option<StateEvent> {
        EngineStats::bump(&self.stats.received);
        match StateEvent::try_from(raw) {
            Ok(event) => Some(event),
            Err(e) => {
                EngineStats::bump(&self.stats.malformed);
                tracing::debug!("Dropped event: {}", e);
                None
            }
        }
    }

    /// Whether the event should be learned from
    pub fn accept(&self, event: &StateEvent) -> bool {
        matches!(self.screen(event), Verdict::Accept { .. })
    }

    /// Classify an event and derive the action it represents
    pub fn screen(&self, event: &StateEvent) -> Verdict {
        let verdict = self.classify(event);
        match &verdict {
            Verdict::Accept { .. } => EngineStats::bump(&self.stats.accepted),
            Verdict::Echo { .. } => EngineStats::bump(&self.stats.echoes),
            Verdict::Reject(Rejection::Duplicate) => EngineStats::bump(&self.stats.duplicates),
            Verdict::Reject(reason) => {
                let counter = match reason {
                    Rejection::InvalidState => &self.stats.invalid_state,
                    Rejection::Unmonitored => &self.stats.unmonitored,
                    Rejection::NoChange | Rejection::Duplicate => &self.stats.unchanged,
                };
                EngineStats::bump(counter);
                tracing::trace!("Filtered {} ({:?})", event.entity_id, reason);
            }
        }
        verdict
    }

    fn classify(&self, event: &StateEvent) -> Verdict {
        let state = event.new_state.trim();
        if state.is_empty() || INVALID_STATES.contains(&state.to_ascii_lowercase().as_str()) {
            return Verdict::Reject(Rejection::InvalidState);
        }

        if !self.config.monitored_domains.contains(event.domain())
            && !self.config.extra_entities.contains(&event.entity_id)
        {
            return Verdict::Reject(Rejection::Unmonitored);
        }

        let fingerprint = event.fingerprint();
        if self.seen.contains_key(&fingerprint) {
            tracing::debug!("Duplicate delivery of {}", fingerprint);
            return Verdict::Reject(Rejection::Duplicate);
        }

        let previous_attributes = self
            .last_attributes
            .insert(event.entity_id.clone(), event.attributes.clone())
            .unwrap_or_default();

        let action = if event.new_state != event.previous_state {
            event.new_state.clone()
        } else {
            match self.significance.significant_change(
                event.domain(),
                &previous_attributes,
                &event.attributes,
            ) {
                Some(attribute) => format!("{}[{}]", event.new_state, attribute),
                None => return Verdict::Reject(Rejection::NoChange),
            }
        };

        self.remember(fingerprint, event.occurred_at);

        let window = Duration::seconds(self.config.echo_window_secs as i64);
        if self
            .echoes
            .was_recently_actuated(&event.entity_id, event.occurred_at, window)
        {
            tracing::debug!("Echo of own actuation: {} -> {}", event.entity_id, action);
            return Verdict::Echo { action };
        }

        Verdict::Accept { action }
    }

    /// Drop an admitted event from the replay memory so a redelivery is
    /// screened again
    pub fn forget(&self, event: &StateEvent) {
        self.seen.remove(&event.fingerprint());
    }

    fn remember(&self, fingerprint: String, at: DateTime<Utc>) {
        self.seen.insert(fingerprint, at);
        let admitted = self.admitted.fetch_add(1, Ordering::Relaxed) + 1;
        if admitted % PRUNE_EVERY == 0 {
            let horizon = at - Duration::seconds(self.config.duplicate_window_secs as i64);
            self.seen.retain(|_, seen_at| *seen_at >= horizon);
        }
    }
}

/// Numeric view of an attribute value, accepting numeric strings
trait AsNumber {
    fn numeric(&self) -> Option<f64>;
}

impl AsNumber for Value {
    fn numeric(&self) -> Option<f64> {
        self.as_f64()
            .or_else(|| self.as_str().and_then(|s| s.trim().parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap()
    }

    fn filter_with(log: Arc<ActuationLog>) -> StateEventFilter {
        StateEventFilter::new(
            FilterConfig::default(),
            Arc::new(DomainSignificance::default()),
            log,
            Arc::new(EngineStats::default()),
        )
    }

    fn filter() -> StateEventFilter {
        filter_with(Arc::new(ActuationLog::new()))
    }

    #[test]
    fn test_rejects_invalid_states() {
        let f = filter();
        for state in ["unavailable", "unknown", "", "  "] {
            let event = StateEvent::new("light.hall", "on", state, ts(10, 0, 0));
            assert_eq!(f.screen(&event), Verdict::Reject(Rejection::InvalidState));
        }
        assert_eq!(f.stats.snapshot().invalid_state, 4);
    }

    #[test]
    fn test_rejects_unmonitored_domain_unless_whitelisted() {
        let event = StateEvent::new("sensor.power", "10", "12", ts(10, 0, 0));
        assert!(!filter().accept(&event));

        let mut config = FilterConfig::default();
        config.extra_entities.insert("sensor.power".to_string());
        let f = StateEventFilter::new(
            config,
            Arc::new(DomainSignificance::default()),
            Arc::new(ActuationLog::new()),
            Arc::new(EngineStats::default()),
        );
        assert!(f.accept(&event));
    }

    #[test]
    fn test_unchanged_state_without_attribute_delta_is_rejected() {
        let f = filter();
        let cases = [
            StateEvent::new("light.hall", "on", "on", ts(10, 0, 0)),
            StateEvent::new("light.hall", "on", "on", ts(10, 1, 0)).with_attribute("brightness", 120),
            StateEvent::new("light.hall", "on", "on", ts(10, 2, 0)).with_attribute("brightness", 130),
            StateEvent::new("switch.fan", "off", "off", ts(10, 3, 0)).with_attribute("foo", 1),
            StateEvent::new("switch.fan", "off", "off", ts(10, 4, 0)).with_attribute("foo", 2),
        ];
        for event in &cases {
            assert!(!f.accept(event), "{event:?}");
        }
        assert_eq!(f.stats.snapshot().unchanged, 5);
    }

    #[test]
    fn test_significant_attribute_change_is_accepted() {
        let f = filter();
        let first = StateEvent::new("light.hall", "off", "on", ts(10, 0, 0)).with_attribute("brightness", 40);
        assert!(f.accept(&first));

        let dimmed = StateEvent::new("light.hall", "on", "on", ts(10, 5, 0)).with_attribute("brightness", 200);
        assert_eq!(
            f.screen(&dimmed),
            Verdict::Accept {
                action: "on[brightness]".to_string()
            }
        );
    }

    #[test]
    fn test_numeric_deltas_compare_as_numbers() {
        let significance = DomainSignificance::default();
        let attrs = |key: &str, value: Value| {
            let mut map = Attributes::new();
            map.insert(key.to_string(), value);
            map
        };

        // Numeric strings and integers compare by magnitude
        assert_eq!(
            significance.significant_change(
                "climate",
                &attrs("temperature", Value::from("20.5")),
                &attrs("temperature", Value::from(21.5)),
            ),
            Some("temperature".to_string())
        );
        assert_eq!(
            significance.significant_change(
                "climate",
                &attrs("temperature", Value::from(21)),
                &attrs("temperature", Value::from("21.2")),
            ),
            None
        );
        assert_eq!(
            significance.significant_change(
                "media_player",
                &attrs("source", Value::from("TV")),
                &attrs("source", Value::from("Radio")),
            ),
            Some("source".to_string())
        );
    }

    #[test]
    fn test_duplicate_delivery_is_rejected() {
        let f = filter();
        let event = StateEvent::new("light.hall", "off", "on", ts(22, 0, 0));
        assert!(f.accept(&event));
        assert_eq!(f.screen(&event.clone()), Verdict::Reject(Rejection::Duplicate));
    }

    #[test]
    fn test_echo_of_recent_actuation() {
        let log = Arc::new(ActuationLog::new());
        let f = filter_with(log.clone());
        log.record_actuation("light.hall", ts(22, 0, 0));

        let echo = StateEvent::new("light.hall", "off", "on", ts(22, 0, 2));
        assert_eq!(
            f.screen(&echo),
            Verdict::Echo {
                action: "on".to_string()
            }
        );
        assert!(!f.accept(&StateEvent::new("light.hall", "on", "off", ts(22, 0, 30))));

        let later = StateEvent::new("light.hall", "off", "on", ts(23, 0, 0));
        assert!(f.accept(&later));
    }

    #[test]
    fn test_malformed_events_are_counted() {
        let stats = Arc::new(EngineStats::default());
        let f = StateEventFilter::new(
            FilterConfig::default(),
            Arc::new(DomainSignificance::default()),
            Arc::new(ActuationLog::new()),
            stats.clone(),
        );
        assert!(f.admit(RawStateEvent::default()).is_none());
        assert_eq!(stats.snapshot().malformed, 1);
        assert_eq!(stats.snapshot().received, 1);
    }

    #[test]
    fn test_actuation_log_prune() {
        let log = ActuationLog::new();
        log.record_actuation("light.a", ts(8, 0, 0));
        log.record_actuation("light.b", ts(9, 0, 0));
        log.prune(ts(8, 30, 0));
        assert_eq!(log.len(), 1);
    }
}
