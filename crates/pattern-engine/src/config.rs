//! Engine configuration
//!
//! Every field has a default so a partial JSON file is enough. Values are
//! loaded from an optional file, overridden from the environment and then
//! validated once at startup.

use crate::error::EngineError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub filter: FilterConfig,
    pub context: ContextConfig,
    pub detection: DetectionConfig,
    pub confidence: ConfidenceConfig,
    pub correlation: CorrelationConfig,
    pub scenes: SceneConfig,
    pub runtime: RuntimeConfig,
}

/// Event admission rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Entity domains whose state changes are learned from
    pub monitored_domains: BTreeSet<String>,
    /// Entities admitted even when their domain is not monitored
    pub extra_entities: BTreeSet<String>,
    /// How long after an actuation a state change counts as its echo
    pub echo_window_secs: u64,
    /// How long exact replays of an event are remembered
    pub duplicate_window_secs: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let monitored_domains = [
            "light",
            "switch",
            "fan",
            "cover",
            "lock",
            "climate",
            "media_player",
            "input_boolean",
            "binary_sensor",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        Self {
            monitored_domains,
            extra_entities: BTreeSet::new(),
            echo_window_secs: 60,
            duplicate_window_secs: 24 * 3600,
        }
    }
}

/// Hour-of-day boundaries of each day phase (start hour, inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DayPhaseBoundaries {
    pub early_morning: u32,
    pub morning: u32,
    pub afternoon: u32,
    pub evening: u32,
    /// Night runs from this hour across midnight until `early_morning`
    pub night: u32,
}

impl Default for DayPhaseBoundaries {
    fn default() -> Self {
        Self {
            early_morning: 5,
            morning: 8,
            afternoon: 12,
            evening: 17,
            night: 22,
        }
    }
}

impl DayPhaseBoundaries {
    pub fn validate(&self) -> Result<(), EngineError> {
        let hours = [
            self.early_morning,
            self.morning,
            self.afternoon,
            self.evening,
            self.night,
        ];
        if hours.windows(2).any(|w| w[0] >= w[1]) || self.night > 23 {
            return Err(EngineError::InvalidConfig(format!(
                "day phase boundaries must be strictly increasing hours below 24: {hours:?}"
            )));
        }
        Ok(())
    }
}

/// Context tagging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// IANA timezone used for local time (e.g., "Europe/Madrid")
    pub timezone: String,
    /// Width of a time-of-day bucket in minutes
    pub bucket_minutes: u16,
    pub phase_boundaries: DayPhaseBoundaries,
    /// Evidence weight of events whose person context is unknown
    pub unknown_person_weight: f64,
    /// Room of each entity, used when the event carries no area attribute
    pub rooms: HashMap<String, String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            bucket_minutes: 15,
            phase_boundaries: DayPhaseBoundaries::default(),
            unknown_person_weight: 0.5,
            rooms: HashMap::new(),
        }
    }
}

impl ContextConfig {
    /// Parse the configured timezone
    pub fn tz(&self) -> Result<Tz, EngineError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| EngineError::InvalidConfig(format!("timezone {}: {e}", self.timezone)))
    }
}

/// Suggestion thresholds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_repetitions: u32,
    pub min_distinct_days: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_repetitions: 3,
            min_distinct_days: 3,
        }
    }
}

/// Confidence accumulation and decay
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Fraction of the remaining headroom gained per weighted match
    pub learning_rate: f64,
    /// Upper bound approached but never reached
    pub ceiling: f64,
    pub half_life_days: f64,
    /// Absolute drop for an expected occurrence that did not happen
    pub miss_penalty: f64,
    /// Absolute drop for an explicit user rejection
    pub rejection_penalty: f64,
    /// Minimum decayed confidence reported as a suggestion
    pub suggestion_threshold: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.2,
            ceiling: 0.99,
            half_life_days: 14.0,
            miss_penalty: 0.25,
            rejection_penalty: 0.5,
            suggestion_threshold: 0.3,
        }
    }
}

/// Cross-entity correlation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Longest delay between two transitions still considered causal
    pub max_lag_secs: u64,
    pub same_room_min_occurrences: u32,
    pub cross_room_min_occurrences: u32,
    /// Strength multiplier for cross-room links below their threshold
    pub cross_room_weight: f64,
    /// Largest lag difference between A->B and B->A still treated as a loop
    pub loop_lag_tolerance_secs: f64,
    /// Trailing window re-read on every correlation pass
    pub lookback_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            max_lag_secs: 120,
            same_room_min_occurrences: 2,
            cross_room_min_occurrences: 4,
            cross_room_weight: 0.5,
            loop_lag_tolerance_secs: 30.0,
            lookback_secs: 15 * 60,
        }
    }
}

/// Scene grouping
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Events within this span of the first one form one co-occurrence group
    pub window_secs: u64,
    pub min_members: usize,
    pub min_repetitions: u32,
    pub min_distinct_days: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            window_secs: 120,
            min_members: 2,
            min_repetitions: 3,
            min_distinct_days: 2,
        }
    }
}

/// Workers, cadences and retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    /// Ingestion shards; each is the single writer for its entities
    pub shards: usize,
    pub shard_queue_depth: usize,
    pub correlation_interval_secs: u64,
    pub scene_interval_secs: u64,
    pub batch_timeout_secs: u64,
    /// How long tagged events stay available to the batch passes
    pub recent_event_retention_secs: u64,
    pub store_retry_attempts: u32,
    pub store_retry_base_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            shards: 4,
            shard_queue_depth: 256,
            correlation_interval_secs: 300,
            scene_interval_secs: 3600,
            batch_timeout_secs: 30,
            recent_event_retention_secs: 2 * 3600,
            store_retry_attempts: 4,
            store_retry_base_ms: 50,
        }
    }
}

impl RuntimeConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

impl EngineConfig {
    /// Load configuration from an optional JSON file, apply environment
    /// overrides and validate the result
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let mut config = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(contents) => {
                    tracing::info!("Loaded engine configuration from {:?}", path);
                    serde_json::from_str(&contents)?
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!("No configuration file at {:?}, using defaults", path);
                    Self::default()
                }
                Err(e) => return Err(e.into()),
            },
            None => Self::default(),
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PATTERN_*` overrides from the given variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tz) = lookup("PATTERN_TIMEZONE") {
            self.context.timezone = tz;
        }
        if let Some(dir) = lookup("PATTERN_DATA_DIR") {
            self.runtime.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("PATTERN_MIN_REPETITIONS") {
            self.detection.min_repetitions = parse_env("PATTERN_MIN_REPETITIONS", &value)?;
        }
        if let Some(value) = lookup("PATTERN_MIN_DISTINCT_DAYS") {
            self.detection.min_distinct_days = parse_env("PATTERN_MIN_DISTINCT_DAYS", &value)?;
        }
        if let Some(value) = lookup("PATTERN_HALF_LIFE_DAYS") {
            self.confidence.half_life_days = parse_env("PATTERN_HALF_LIFE_DAYS", &value)?;
        }
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), EngineError> {
        self.context.tz()?;
        self.context.phase_boundaries.validate()?;

        let bucket = self.context.bucket_minutes;
        if bucket == 0 || 1440 % bucket != 0 {
            return Err(invalid(format!(
                "bucket_minutes must divide a day evenly, got {bucket}"
            )));
        }
        if !(0.0..=1.0).contains(&self.context.unknown_person_weight) {
            return Err(invalid("unknown_person_weight must be within [0, 1]"));
        }

        let c = &self.confidence;
        if !(c.learning_rate > 0.0 && c.learning_rate < 1.0) {
            return Err(invalid("learning_rate must be within (0, 1)"));
        }
        if !(c.ceiling > 0.0 && c.ceiling < 1.0) {
            return Err(invalid("confidence ceiling must be below 1.0"));
        }
        if c.half_life_days <= 0.0 {
            return Err(invalid("half_life_days must be positive"));
        }
        if c.miss_penalty < c.learning_rate {
            return Err(invalid("miss_penalty must be at least learning_rate"));
        }
        if c.rejection_penalty < c.miss_penalty {
            return Err(invalid("rejection_penalty must be at least miss_penalty"));
        }

        if self.detection.min_repetitions == 0 || self.detection.min_distinct_days == 0 {
            return Err(invalid("detection thresholds must be at least 1"));
        }

        let k = &self.correlation;
        if k.cross_room_min_occurrences < k.same_room_min_occurrences {
            return Err(invalid(
                "cross_room_min_occurrences must be at least same_room_min_occurrences",
            ));
        }
        if k.max_lag_secs == 0 {
            return Err(invalid("max_lag_secs must be positive"));
        }

        if self.scenes.min_members < 2 {
            return Err(invalid("a scene needs at least two members"));
        }
        if self.runtime.shards == 0 {
            return Err(invalid("at least one ingestion shard is required"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidConfig(msg.into())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, EngineError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{name}={value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"detection": {"min_repetitions": 5}}"#).unwrap();
        assert_eq!(config.detection.min_repetitions, 5);
        assert_eq!(config.detection.min_distinct_days, 3);
        assert_eq!(config.context.bucket_minutes, 15);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_env(|name| match name {
                "PATTERN_TIMEZONE" => Some("Europe/Madrid".to_string()),
                "PATTERN_MIN_REPETITIONS" => Some("4".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.context.timezone, "Europe/Madrid");
        assert_eq!(config.detection.min_repetitions, 4);
        config.validate().unwrap();

        let err = config.apply_env(|name| {
            (name == "PATTERN_HALF_LIFE_DAYS").then(|| "soon".to_string())
        });
        assert!(matches!(err, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let mut config = EngineConfig::default();
        config.context.bucket_minutes = 7;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.confidence.rejection_penalty = 0.1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.context.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.context.phase_boundaries.evening = 11;
        assert!(config.validate().is_err());
    }
}
