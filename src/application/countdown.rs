use crate::domain::models::{Phase, Session, TimerSettings, TimerState, TimerStatus};
use crate::domain::policy::{
    duration_for_phase, phase_after_completion, phase_after_skip, predicted_next_phase, unix_seconds,
};
use crate::infrastructure::offline_history::OfflineHistoryStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Wake-up sent by the ticker task. Signals from a cancelled ticker carry an
/// old generation and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSignal {
    generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Tick(TimerState),
    Complete { state: TimerState, session: Session },
}

struct ActiveTicker {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// Offline stand-in for the server timer.
///
/// The engine owns a copy of the timer state and, while running, a ticker task
/// that posts [`TickSignal`]s to its owner. The owner feeds them back through
/// [`CountdownEngine::on_tick`], so every state change happens on the owner's task.
pub struct CountdownEngine {
    state: TimerState,
    settings: TimerSettings,
    history: Arc<dyn OfflineHistoryStore>,
    tick_tx: mpsc::UnboundedSender<TickSignal>,
    ticker: Option<ActiveTicker>,
    generation: u64,
    now_provider: NowProvider,
}

impl CountdownEngine {
    pub fn new(
        settings: TimerSettings,
        history: Arc<dyn OfflineHistoryStore>,
        tick_tx: mpsc::UnboundedSender<TickSignal>,
    ) -> Self {
        Self {
            state: TimerState::default(),
            settings,
            history,
            tick_tx,
            ticker: None,
            generation: 0,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn set_settings(&mut self, settings: TimerSettings) {
        self.settings = settings;
    }

    pub fn set_goal(&mut self, goal: u32) {
        self.state.goal = goal;
    }

    /// Installs `state` and ticks it down if it is running.
    pub fn update_state(&mut self, mut state: TimerState) {
        clamp_remaining(&mut state);
        self.state = state;
        if self.state.is_running() {
            self.start_ticking();
        } else {
            self.cancel_ticker();
        }
    }

    /// Installs `state` without ticking; the server drives it.
    pub fn mirror(&mut self, mut state: TimerState) {
        clamp_remaining(&mut state);
        self.cancel_ticker();
        self.state = state;
    }

    pub fn stop(&mut self) {
        self.cancel_ticker();
    }

    pub fn toggle(&mut self) -> TimerState {
        let now = (self.now_provider)();
        if self.state.is_running() {
            self.state.remaining = self.live_remaining();
            self.cancel_ticker();
            self.state.status = TimerStatus::Paused;
            self.state.last_action_time = now.timestamp();
            info!(remaining = self.state.remaining, "local timer paused");
        } else {
            if self.state.remaining <= 0.0 {
                self.state.duration = duration_for_phase(&self.settings, self.state.phase);
                self.state.remaining = self.state.duration;
            }
            self.state.status = TimerStatus::Running;
            self.state.start_time = unix_seconds(now) - (self.state.duration - self.state.remaining);
            self.state.last_action_time = now.timestamp();
            self.start_ticking();
            info!(phase = %self.state.phase, remaining = self.state.remaining, "local timer running");
        }
        self.state.clone()
    }

    pub fn skip(&mut self) -> TimerState {
        let now = (self.now_provider)();
        self.cancel_ticker();
        let next = phase_after_skip(self.state.phase);
        self.enter_phase(next);
        self.state.last_action_time = now.timestamp();
        info!(phase = %next, "local timer skipped");
        self.state.clone()
    }

    pub fn reset(&mut self) -> TimerState {
        let now = (self.now_provider)();
        self.cancel_ticker();
        let phase = self.state.phase;
        self.enter_phase(phase);
        self.state.last_action_time = now.timestamp();
        info!(phase = %phase, "local timer reset");
        self.state.clone()
    }

    pub fn on_tick(&mut self, signal: TickSignal) -> Option<EngineEvent> {
        let ticker = self.ticker.as_ref()?;
        if ticker.generation != signal.generation {
            debug!(stale = signal.generation, current = ticker.generation, "ignoring stale tick");
            return None;
        }

        let remaining = self.live_remaining();
        if remaining > 0.0 {
            self.state.remaining = remaining;
            return Some(EngineEvent::Tick(self.state.clone()));
        }
        Some(self.complete())
    }

    fn complete(&mut self) -> EngineEvent {
        self.cancel_ticker();
        let now = (self.now_provider)();
        let finished = self.state.phase;
        let session = Session {
            phase: finished,
            start: now.timestamp() - self.state.duration.round() as i64,
            duration: self.state.duration.round().max(0.0) as u32,
            completed: true,
        };
        // Only the in-memory view is updated here; the owner persists staged sessions.
        if let Err(error) = self.history.stage(&session) {
            error!(%error, "failed to record offline session");
        }

        if finished == Phase::Work {
            self.state.completed += 1;
        }
        let next = phase_after_completion(finished, self.state.completed, self.settings.long_break_after);
        self.enter_phase(next);
        info!(finished = %finished, next = %next, completed = self.state.completed, "local interval complete");

        EngineEvent::Complete {
            state: self.state.clone(),
            session,
        }
    }

    fn enter_phase(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.state.status = TimerStatus::Stopped;
        self.state.duration = duration_for_phase(&self.settings, phase);
        self.state.remaining = self.state.duration;
        self.state.next_phase = Some(predicted_next_phase(&self.state, &self.settings));
    }

    fn live_remaining(&self) -> f64 {
        match &self.ticker {
            Some(ticker) => ticker.deadline.saturating_duration_since(Instant::now()).as_secs_f64(),
            None => self.state.remaining,
        }
    }

    fn start_ticking(&mut self) {
        self.cancel_ticker();
        if self.state.remaining <= 0.0 {
            return;
        }
        let Ok(length) = Duration::try_from_secs_f64(self.state.remaining) else {
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let deadline = Instant::now() + length;
        let tick_tx = self.tick_tx.clone();
        let handle = tokio::spawn(async move {
            let mut next = Instant::now();
            loop {
                next = (next + TICK_INTERVAL).min(deadline);
                time::sleep_until(next).await;
                if tick_tx.send(TickSignal { generation }).is_err() || next >= deadline {
                    break;
                }
            }
        });

        self.ticker = Some(ActiveTicker {
            generation,
            deadline,
            handle,
        });
    }

    fn cancel_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.handle.abort();
        }
    }
}

impl Drop for CountdownEngine {
    fn drop(&mut self) {
        self.cancel_ticker();
    }
}

fn clamp_remaining(state: &mut TimerState) {
    if !(state.remaining > 0.0) {
        state.remaining = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::offline_history::InMemoryOfflineHistoryStore;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    struct Harness {
        engine: CountdownEngine,
        ticks: mpsc::UnboundedReceiver<TickSignal>,
        history: Arc<InMemoryOfflineHistoryStore>,
    }

    fn harness_at(now: DateTime<Utc>) -> Harness {
        let (tick_tx, ticks) = mpsc::unbounded_channel();
        let history = Arc::new(InMemoryOfflineHistoryStore::default());
        let engine = CountdownEngine::new(TimerSettings::default(), history.clone(), tick_tx)
            .with_now_provider(Arc::new(move || now));
        Harness { engine, ticks, history }
    }

    fn running_work(remaining: f64, completed: u32) -> TimerState {
        TimerState {
            status: TimerStatus::Running,
            phase: Phase::Work,
            next_phase: Some(Phase::Short),
            start_time: 1_704_186_000.0,
            duration: 1500.0,
            remaining,
            completed,
            date: Some("2024-01-02".to_string()),
            ..TimerState::default()
        }
    }

    async fn drive_until_complete(harness: &mut Harness) -> (Vec<f64>, TimerState, Session) {
        let mut remaining_seen = Vec::new();
        loop {
            let signal = harness.ticks.recv().await.expect("tick channel open");
            match harness.engine.on_tick(signal) {
                Some(EngineEvent::Tick(state)) => remaining_seen.push(state.remaining),
                Some(EngineEvent::Complete { state, session }) => return (remaining_seen, state, session),
                None => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_work_interval_records_session_and_starts_break() {
        let now = fixed_time("2024-01-02T09:25:00Z");
        let mut harness = harness_at(now);
        harness.engine.update_state(running_work(1500.0, 0));

        let (remaining_seen, state, session) = drive_until_complete(&mut harness).await;

        assert_eq!(remaining_seen.len(), 1499);
        assert!(remaining_seen.windows(2).all(|pair| pair[0] > pair[1]));
        assert_eq!(state.status, TimerStatus::Stopped);
        assert_eq!(state.phase, Phase::Short);
        assert_eq!(state.completed, 1);
        assert_eq!(state.duration, 300.0);
        assert_eq!(state.remaining, 300.0);
        assert_eq!(state.next_phase, Some(Phase::Work));
        assert_eq!(
            session,
            Session {
                phase: Phase::Work,
                start: now.timestamp() - 1500,
                duration: 1500,
                completed: true,
            }
        );
        assert_eq!(harness.history.load_all().expect("history"), vec![session]);
        assert!(!harness.engine.is_ticking());
    }

    #[tokio::test(start_paused = true)]
    async fn fourth_work_completion_enters_long_break() {
        let mut harness = harness_at(fixed_time("2024-01-02T12:00:00Z"));
        harness.engine.update_state(running_work(2.0, 3));

        let (_, state, _) = drive_until_complete(&mut harness).await;

        assert_eq!(state.completed, 4);
        assert_eq!(state.phase, Phase::Long);
        assert_eq!(state.remaining, 900.0);
    }

    #[tokio::test(start_paused = true)]
    async fn break_completion_returns_to_work_without_counting() {
        let mut harness = harness_at(fixed_time("2024-01-02T12:00:00Z"));
        harness.engine.update_state(TimerState {
            phase: Phase::Short,
            duration: 300.0,
            ..running_work(1.5, 3)
        });

        let (_, state, session) = drive_until_complete(&mut harness).await;

        assert_eq!(session.phase, Phase::Short);
        assert_eq!(session.duration, 300);
        assert_eq!(state.phase, Phase::Work);
        assert_eq!(state.completed, 3);
        assert_eq!(state.next_phase, Some(Phase::Long));
    }

    #[tokio::test(start_paused = true)]
    async fn update_state_is_idempotent_for_running_state() {
        let mut harness = harness_at(fixed_time("2024-01-02T12:00:00Z"));
        let state = running_work(10.0, 0);
        harness.engine.update_state(state.clone());
        let first = harness.ticks.recv().await.expect("first ticker signal");

        harness.engine.update_state(state.clone());
        assert!(harness.engine.on_tick(first).is_none(), "cancelled ticker signals are ignored");
        assert_eq!(harness.engine.state(), &state);
        assert!(harness.engine.is_ticking());

        let next = harness.ticks.recv().await.expect("replacement ticker signal");
        match harness.engine.on_tick(next) {
            Some(EngineEvent::Tick(ticked)) => assert_eq!(ticked.remaining, 9.0),
            other => panic!("expected tick, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_pauses_and_resumes_with_projected_start_time() {
        let now = fixed_time("2024-01-02T12:00:00Z");
        let mut harness = harness_at(now);
        harness.engine.update_state(TimerState {
            status: TimerStatus::Paused,
            ..running_work(600.0, 0)
        });
        assert!(!harness.engine.is_ticking());

        let running = harness.engine.toggle();
        assert_eq!(running.status, TimerStatus::Running);
        assert_eq!(running.start_time, unix_seconds(now) - 900.0);
        assert_eq!(running.last_action_time, now.timestamp());
        assert!(harness.engine.is_ticking());

        time::advance(Duration::from_millis(2_500)).await;
        let paused = harness.engine.toggle();
        assert_eq!(paused.status, TimerStatus::Paused);
        assert!((paused.remaining - 597.5).abs() < 1e-6);
        assert!(!harness.engine.is_ticking());
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_from_zero_remaining_restarts_full_interval() {
        let mut harness = harness_at(fixed_time("2024-01-02T12:00:00Z"));
        harness.engine.update_state(TimerState {
            phase: Phase::Long,
            duration: 0.0,
            remaining: 0.0,
            ..TimerState::default()
        });

        let running = harness.engine.toggle();
        assert_eq!(running.duration, 900.0);
        assert_eq!(running.remaining, 900.0);
        assert_eq!(running.status, TimerStatus::Running);
    }

    #[tokio::test]
    async fn skip_advances_phase_without_recording() {
        let mut harness = harness_at(fixed_time("2024-01-02T12:00:00Z"));
        harness.engine.update_state(running_work(100.0, 3));

        let after_work = harness.engine.skip();
        assert_eq!(after_work.phase, Phase::Short);
        assert_eq!(after_work.status, TimerStatus::Stopped);
        assert_eq!(after_work.remaining, 300.0);
        assert_eq!(after_work.completed, 3);

        let after_break = harness.engine.skip();
        assert_eq!(after_break.phase, Phase::Work);
        assert_eq!(after_break.remaining, 1500.0);
        assert_eq!(after_break.next_phase, Some(Phase::Long));
        assert!(harness.history.load_all().expect("history").is_empty());
    }

    #[tokio::test]
    async fn reset_restores_configured_duration_for_current_phase() {
        let mut harness = harness_at(fixed_time("2024-01-02T12:00:00Z"));
        harness.engine.update_state(TimerState {
            phase: Phase::Short,
            duration: 300.0,
            ..running_work(42.0, 1)
        });

        let reset = harness.engine.reset();
        assert_eq!(reset.phase, Phase::Short);
        assert_eq!(reset.status, TimerStatus::Stopped);
        assert_eq!(reset.remaining, 300.0);
        assert_eq!(reset.duration, 300.0);
        assert!(!harness.engine.is_ticking());
    }

    #[tokio::test]
    async fn mirror_never_ticks_and_negative_remaining_is_clamped() {
        let mut harness = harness_at(fixed_time("2024-01-02T12:00:00Z"));
        harness.engine.mirror(running_work(-5.0, 0));
        assert!(!harness.engine.is_ticking());
        assert_eq!(harness.engine.state().remaining, 0.0);

        harness.engine.update_state(running_work(-5.0, 0));
        assert!(!harness.engine.is_ticking());
    }
}
