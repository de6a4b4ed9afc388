use crate::domain::models::{Phase, TimerSettings, TimerState, TimerStatus};
use chrono::{DateTime, Days, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

const SECONDS_PER_MINUTE: f64 = 60.0;

/// Configured length of `phase` in seconds.
pub fn duration_for_phase(settings: &TimerSettings, phase: Phase) -> f64 {
    f64::from(settings.minutes_for(phase)) * SECONDS_PER_MINUTE
}

/// Phase entered after `finished` completes. `completed` is the work count
/// after the completion has been counted.
pub fn phase_after_completion(finished: Phase, completed: u32, long_break_after: u32) -> Phase {
    match finished {
        Phase::Work if long_break_after > 0 && completed > 0 && completed % long_break_after == 0 => {
            Phase::Long
        }
        Phase::Work => Phase::Short,
        Phase::Short | Phase::Long => Phase::Work,
    }
}

/// Phase the current interval will lead to once it completes.
pub fn predicted_next_phase(state: &TimerState, settings: &TimerSettings) -> Phase {
    match state.phase {
        Phase::Work => phase_after_completion(Phase::Work, state.completed + 1, settings.long_break_after),
        Phase::Short | Phase::Long => Phase::Work,
    }
}

/// Phase a manual skip moves to. Skips never reach a long break.
pub fn phase_after_skip(phase: Phase) -> Phase {
    match phase {
        Phase::Work => Phase::Short,
        Phase::Short | Phase::Long => Phase::Work,
    }
}

/// Repairs a state received from the server or read back from storage.
pub fn sanitize(state: &mut TimerState, settings: &TimerSettings) {
    if !(state.duration > 0.0) {
        state.duration = duration_for_phase(settings, state.phase);
    }
    if !state.remaining.is_finite() || state.remaining < 0.0 {
        state.remaining = 0.0;
    }
    if state.remaining > state.duration {
        state.remaining = state.duration;
    }
    if state.next_phase.is_none() {
        state.next_phase = Some(predicted_next_phase(state, settings));
    }
}

/// Whether `next` differs from the last persisted snapshot in a way worth a write.
/// A running countdown alone does not qualify.
pub fn should_save(last: Option<&TimerState>, next: &TimerState) -> bool {
    let Some(last) = last else {
        return true;
    };

    last.status != next.status
        || last.phase != next.phase
        || last.goal != next.goal
        || last.completed != next.completed
        || last.date != next.date
        || last.start_time != next.start_time
        || (next.status != TimerStatus::Running && last.remaining != next.remaining)
}

/// Recomputes `remaining` for a running state from its start time.
/// A state whose interval has already elapsed is stopped at zero.
pub fn project_remaining(state: &mut TimerState, now_seconds: f64) {
    if state.status != TimerStatus::Running {
        return;
    }
    let remaining = state.duration - (now_seconds - state.start_time);
    if remaining > 0.0 {
        state.remaining = remaining.min(state.duration);
    } else {
        state.remaining = 0.0;
        state.status = TimerStatus::Stopped;
    }
}

pub fn unix_seconds(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayZone {
    Local,
    Named(Tz),
}

impl DayZone {
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        match value.map(str::trim).filter(|value| !value.is_empty()) {
            None => Ok(Self::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(Self::Named)
                .map_err(|_| format!("unknown timezone '{name}'")),
        }
    }
}

/// Maps instants onto effective dates. A day begins at `day_start_hour`
/// local time, so early hours belong to the previous calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayClock {
    day_start_hour: u32,
    zone: DayZone,
}

impl DayClock {
    pub fn new(day_start_hour: u32, zone: DayZone) -> Self {
        Self {
            day_start_hour: day_start_hour.min(23),
            zone,
        }
    }

    pub fn effective_date(&self, now: DateTime<Utc>) -> NaiveDate {
        match self.zone {
            DayZone::Local => effective_date_in(now.with_timezone(&Local), self.day_start_hour),
            DayZone::Named(tz) => effective_date_in(now.with_timezone(&tz), self.day_start_hour),
        }
    }

    pub fn effective_date_string(&self, now: DateTime<Utc>) -> String {
        self.effective_date(now).format("%Y-%m-%d").to_string()
    }

    /// Unix seconds at which the effective day containing `now` began.
    pub fn day_start_timestamp(&self, now: DateTime<Utc>) -> i64 {
        let date = self.effective_date(now);
        match self.zone {
            DayZone::Local => day_start_in(&Local, date, self.day_start_hour),
            DayZone::Named(tz) => day_start_in(&tz, date, self.day_start_hour),
        }
    }
}

fn effective_date_in<Z: TimeZone>(now: DateTime<Z>, day_start_hour: u32) -> NaiveDate {
    let date = now.date_naive();
    if now.hour() < day_start_hour {
        date.checked_sub_days(Days::new(1)).unwrap_or(date)
    } else {
        date
    }
}

fn day_start_in<Z: TimeZone>(zone: &Z, date: NaiveDate, day_start_hour: u32) -> i64 {
    let start = date.and_time(NaiveTime::from_hms_opt(day_start_hour, 0, 0).unwrap_or(NaiveTime::MIN));
    // Nonexistent local times (spring-forward gaps) fall back to the UTC reading.
    zone.from_local_datetime(&start)
        .earliest()
        .map(|value| value.timestamp())
        .unwrap_or_else(|| start.and_utc().timestamp())
}
