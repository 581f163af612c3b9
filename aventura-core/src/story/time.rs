//! In-story clock.

use serde::{Deserialize, Serialize};
use std::fmt;

const MINUTES_PER_HOUR: u32 = 60;
const HOURS_PER_DAY: u32 = 24;
const DAYS_PER_YEAR: u32 = 365;

/// How much story time a passage of narration covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "unit", content = "amount", rename_all = "snake_case")]
pub enum TimeProgression {
    #[default]
    None,
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl TimeProgression {
    /// Total minutes covered.
    pub fn minutes(&self) -> u64 {
        match *self {
            TimeProgression::None => 0,
            TimeProgression::Minutes(m) => u64::from(m),
            TimeProgression::Hours(h) => u64::from(h) * u64::from(MINUTES_PER_HOUR),
            TimeProgression::Days(d) => {
                u64::from(d) * u64::from(HOURS_PER_DAY * MINUTES_PER_HOUR)
            }
        }
    }
}

/// The story's clock. Years and days start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTracker {
    pub year: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

impl Default for TimeTracker {
    fn default() -> Self {
        Self {
            year: 1,
            day: 1,
            hour: 8,
            minute: 0,
        }
    }
}

impl TimeTracker {
    pub fn new(year: u32, day: u32, hour: u32, minute: u32) -> Self {
        let mut time = Self {
            year: year.max(1),
            day: day.max(1),
            hour: 0,
            minute: 0,
        };
        time.add_minutes(u64::from(hour) * u64::from(MINUTES_PER_HOUR) + u64::from(minute));
        time
    }

    /// Move the clock forward, carrying into hours, days and years.
    pub fn advance(&mut self, progression: TimeProgression) {
        self.add_minutes(progression.minutes());
    }

    fn add_minutes(&mut self, minutes: u64) {
        let total = u64::from(self.minute) + minutes;
        self.minute = (total % u64::from(MINUTES_PER_HOUR)) as u32;

        let hours = u64::from(self.hour) + total / u64::from(MINUTES_PER_HOUR);
        self.hour = (hours % u64::from(HOURS_PER_DAY)) as u32;

        // Days are 1-based; carry on the zero-based offset.
        let days = u64::from(self.day - 1) + hours / u64::from(HOURS_PER_DAY);
        self.day = (days % u64::from(DAYS_PER_YEAR)) as u32 + 1;

        let years = u64::from(self.year) + days / u64::from(DAYS_PER_YEAR);
        self.year = u32::try_from(years).unwrap_or(u32::MAX);
    }

    /// Coarse time of day for prompts.
    pub fn time_of_day(&self) -> &'static str {
        match self.hour {
            5..=11 => "morning",
            12..=16 => "afternoon",
            17..=20 => "evening",
            _ => "night",
        }
    }
}

impl fmt::Display for TimeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Year {}, Day {}, {:02}:{:02} ({})",
            self.year,
            self.day,
            self.hour,
            self.minute,
            self.time_of_day()
        )
    }
}
