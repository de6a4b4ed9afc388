use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const TIMER_STATE_VERSION: u32 = 2;
pub const DEFAULT_DAILY_GOAL: u32 = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    #[default]
    Stopped,
    Running,
    Paused,
}

impl TimerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Work,
    Short,
    Long,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Short => "short",
            Self::Long => "long",
        }
    }

    pub fn is_break(self) -> bool {
        matches!(self, Self::Short | Self::Long)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "work" => Ok(Self::Work),
            "short" => Ok(Self::Short),
            "long" => Ok(Self::Long),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// Timer snapshot exchanged with the server and persisted locally.
///
/// Field names are the wire names. Fields missing from an inbound document take
/// the values of a fresh stopped work interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimerState {
    pub status: TimerStatus,
    pub phase: Phase,
    pub next_phase: Option<Phase>,
    pub start_time: f64,
    pub duration: f64,
    pub remaining: f64,
    pub completed: u32,
    pub goal: u32,
    pub date: Option<String>,
    pub last_action_time: i64,
    pub version: u32,
}

impl Default for TimerState {
    fn default() -> Self {
        Self {
            status: TimerStatus::Stopped,
            phase: Phase::Work,
            next_phase: None,
            start_time: 0.0,
            duration: 0.0,
            remaining: 0.0,
            completed: 0,
            goal: DEFAULT_DAILY_GOAL,
            date: None,
            last_action_time: 0,
            version: TIMER_STATE_VERSION,
        }
    }
}

impl TimerState {
    pub fn is_running(&self) -> bool {
        self.status == TimerStatus::Running
    }

    /// Resets every timer field for a new effective day.
    pub fn reset_for_new_day(&mut self, date: String, completed: u32, now_seconds: i64) {
        self.status = TimerStatus::Stopped;
        self.phase = Phase::Work;
        self.next_phase = Some(Phase::Work);
        self.start_time = 0.0;
        self.duration = 0.0;
        self.remaining = 0.0;
        self.completed = completed;
        self.date = Some(date);
        self.last_action_time = now_seconds;
    }
}

/// A finished interval. `start` is unix seconds, `duration` is seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    #[serde(rename = "type")]
    pub phase: Phase,
    pub start: i64,
    pub duration: u32,
    pub completed: bool,
}

impl Session {
    pub fn is_completed_work(&self) -> bool {
        self.phase == Phase::Work && self.completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseDurations {
    pub work: u32,
    pub short_break: u32,
    pub long_break: u32,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            work: 25,
            short_break: 5,
            long_break: 15,
        }
    }
}

/// Phone-side timer configuration. Serializes to the server's config payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerSettings {
    pub durations: PhaseDurations,
    pub long_break_after: u32,
    pub daily_goal: u32,
    pub day_start_hour: u32,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            durations: PhaseDurations::default(),
            long_break_after: 4,
            daily_goal: DEFAULT_DAILY_GOAL,
            day_start_hour: 0,
        }
    }
}

impl TimerSettings {
    /// Configured length of `phase` in minutes.
    pub fn minutes_for(&self, phase: Phase) -> u32 {
        match phase {
            Phase::Work => self.durations.work,
            Phase::Short => self.durations.short_break,
            Phase::Long => self.durations.long_break,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_positive(self.durations.work, "durations.work")?;
        validate_positive(self.durations.short_break, "durations.short_break")?;
        validate_positive(self.durations.long_break, "durations.long_break")?;
        validate_positive(self.long_break_after, "long_break_after")?;
        if self.day_start_hour > 23 {
            return Err("day_start_hour must be between 0 and 23".to_string());
        }
        Ok(())
    }
}

/// Daily aggregate kept in the history cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayStats {
    pub date: String,
    pub completed: u32,
    pub work_minutes: u32,
    pub break_minutes: u32,
    pub last_sync_time: DateTime<Utc>,
}

impl DayStats {
    /// Aggregates a day from its session rows; server-side totals are ignored.
    pub fn from_sessions(date: &str, sessions: &[Session], synced_at: DateTime<Utc>) -> Self {
        let completed = sessions.iter().filter(|session| session.is_completed_work()).count() as u32;
        let work_seconds: u64 = sessions
            .iter()
            .filter(|session| session.is_completed_work())
            .map(|session| u64::from(session.duration))
            .sum();
        let break_seconds: u64 = sessions
            .iter()
            .filter(|session| session.phase.is_break() && session.completed)
            .map(|session| u64::from(session.duration))
            .sum();

        Self {
            date: date.to_string(),
            completed,
            work_minutes: (work_seconds / 60) as u32,
            break_minutes: (break_seconds / 60) as u32,
            last_sync_time: synced_at,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_date(&self.date, "day_stats.date")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSession {
    pub date: String,
    pub session: Session,
}

fn validate_positive(value: u32, field_name: &str) -> Result<(), String> {
    if value == 0 {
        return Err(format!("{field_name} must be > 0"));
    }
    Ok(())
}

pub(crate) fn validate_date(value: &str, field_name: &str) -> Result<(), String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| format!("{field_name} must be YYYY-MM-DD"))
}
