//! Situational context for filtered events

use crate::config::{ContextConfig, DayPhaseBoundaries};
use crate::error::EngineError;
use crate::model::{ContextualEvent, DayPhase, StateEvent, TimeBucket};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Person context used when no presence signal is available
pub const UNKNOWN_PERSON: &str = "unknown";

/// Source of "who was home" signals
pub trait PresenceSource: Send + Sync {
    /// Latest known person at or before `at`
    fn latest_presence(&self, at: DateTime<Utc>) -> Option<String>;
}

/// Holiday/vacation calendar
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;

    /// Calendar-specific phase boundaries, overriding the configured ones
    fn day_phase_boundaries(&self) -> Option<DayPhaseBoundaries> {
        None
    }
}

/// In-memory presence history
#[derive(Debug, Default)]
pub struct PresenceLog {
    history: RwLock<BTreeMap<DateTime<Utc>, String>>,
}

impl PresenceLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, at: DateTime<Utc>, person: impl Into<String>) {
        if let Ok(mut history) = self.history.write() {
            history.insert(at, person.into());
        }
    }

    /// Drop signals older than `before`, keeping the last one before it
    pub fn prune(&self, before: DateTime<Utc>) {
        if let Ok(mut history) = self.history.write() {
            let keep_from = history.range(..before).next_back().map(|(at, _)| *at);
            if let Some(keep_from) = keep_from {
                *history = history.split_off(&keep_from);
            }
        }
    }
}

impl PresenceSource for PresenceLog {
    fn latest_presence(&self, at: DateTime<Utc>) -> Option<String> {
        let history = self.history.read().ok()?;
        history.range(..=at).next_back().map(|(_, person)| person.clone())
    }
}

/// Fixed set of holiday dates
#[derive(Debug, Clone, Default)]
pub struct StaticCalendar {
    holidays: BTreeSet<NaiveDate>,
    boundaries: Option<DayPhaseBoundaries>,
}

impl StaticCalendar {
    #[must_use]
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
            boundaries: None,
        }
    }

    #[must_use]
    pub fn with_boundaries(mut self, boundaries: DayPhaseBoundaries) -> Self {
        self.boundaries = Some(boundaries);
        self
    }
}

impl HolidayCalendar for StaticCalendar {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    fn day_phase_boundaries(&self) -> Option<DayPhaseBoundaries> {
        self.boundaries
    }
}

/// Annotates events with time bucket, day phase, weekday, person and room
pub struct ContextTagger {
    tz: Tz,
    bucket_minutes: u16,
    boundaries: DayPhaseBoundaries,
    unknown_person_weight: f64,
    rooms: HashMap<String, String>,
    presence: Arc<dyn PresenceSource>,
    calendar: Arc<dyn HolidayCalendar>,
}

impl ContextTagger {
    pub fn new(
        config: &ContextConfig,
        presence: Arc<dyn PresenceSource>,
        calendar: Arc<dyn HolidayCalendar>,
    ) -> Result<Self, EngineError> {
        let boundaries = calendar
            .day_phase_boundaries()
            .unwrap_or(config.phase_boundaries);
        boundaries.validate()?;

        Ok(Self {
            tz: config.tz()?,
            bucket_minutes: config.bucket_minutes,
            boundaries,
            unknown_person_weight: config.unknown_person_weight,
            rooms: config.rooms.clone(),
            presence,
            calendar,
        })
    }

    /// Enrich an admitted event
    pub fn tag(&self, event: StateEvent, action: String, is_automation_echo: bool) -> ContextualEvent {
        let local = event.occurred_at.with_timezone(&self.tz);
        let hour = local.hour();
        let seconds_of_day = local.num_seconds_from_midnight();

        let day_phase = self.day_phase(hour);
        let activity_date = self.activity_date(local.date_naive(), hour);
        let weekday = activity_date.weekday().num_days_from_sunday() as u8;
        let is_holiday = self.calendar.is_holiday(activity_date);

        let (person_context, evidence_weight) = match self.presence.latest_presence(event.occurred_at) {
            Some(person) if !person.is_empty() && person != UNKNOWN_PERSON => (person, 1.0),
            _ => (UNKNOWN_PERSON.to_string(), self.unknown_person_weight),
        };

        let room = self.room_of(&event);

        ContextualEvent {
            time_bucket: self.bucket(seconds_of_day),
            day_phase,
            weekday,
            activity_date,
            is_holiday,
            person_context,
            evidence_weight,
            is_automation_echo,
            room,
            action,
            event,
        }
    }

    /// Round a local time of day to the nearest bucket start
    pub fn bucket(&self, seconds_of_day: u32) -> TimeBucket {
        let width = u32::from(self.bucket_minutes) * 60;
        let rounded = (seconds_of_day + width / 2) / width * width;
        TimeBucket(((rounded / 60) % 1440) as u16)
    }

    /// Day phase of a local hour; boundaries include their starting hour
    pub fn day_phase(&self, hour: u32) -> DayPhase {
        let b = &self.boundaries;
        if hour >= b.night || hour < b.early_morning {
            DayPhase::Night
        } else if hour >= b.evening {
            DayPhase::Evening
        } else if hour >= b.afternoon {
            DayPhase::Afternoon
        } else if hour >= b.morning {
            DayPhase::Morning
        } else {
            DayPhase::EarlyMorning
        }
    }

    /// Calendar day an activity belongs to. The part of the night after
    /// midnight is keyed to the day on which the night started.
    pub fn activity_date(&self, local_date: NaiveDate, hour: u32) -> NaiveDate {
        if hour < self.boundaries.early_morning {
            local_date.pred_opt().unwrap_or(local_date)
        } else {
            local_date
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.calendar.is_holiday(date)
    }

    /// Instant the activity day `date` ends: early morning of the next
    /// local day
    pub fn day_end(&self, date: NaiveDate) -> DateTime<Utc> {
        let next = date.succ_opt().unwrap_or(date);
        let naive = next
            .and_hms_opt(self.boundaries.early_morning, 0, 0)
            .unwrap_or_else(|| next.and_time(NaiveTime::MIN));
        match self.tz.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&naive),
        }
    }

    fn room_of(&self, event: &StateEvent) -> Option<String> {
        ["area_id", "room"]
            .iter()
            .find_map(|key| event.attributes.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .or_else(|| self.rooms.get(&event.entity_id).cloned())
    }
}
