use crate::application::countdown::{CountdownEngine, EngineEvent, NowProvider, TickSignal};
use crate::domain::models::{Phase, Session, TimerSettings, TimerState};
use crate::domain::policy::{
    duration_for_phase, project_remaining, sanitize, should_save, unix_seconds, DayClock, DayZone,
};
use crate::infrastructure::config::{ConfigAuthority, ServerEndpoint, SettingsStore};
use crate::infrastructure::connection::{ConnectionEvent, ConnectionHandle, ControlMessage};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::offline_history::OfflineHistoryStore;
use crate::infrastructure::remote_api::{TimerAction, TimerApi};
use crate::infrastructure::state_repository::TimerStateRepository;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const NOTIFICATION_CAPACITY: usize = 64;
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum Command {
    Toggle,
    Skip,
    Reset,
    Reconnect,
    UpdateSettings(TimerSettings),
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateNotification {
    Updated { state: TimerState, connected: bool },
    Completed { state: TimerState, session: Session },
}

/// Per-connection reconciliation state. Pushes are only trusted in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Offline,
    Unsynced { epoch: u64 },
    Ready { epoch: u64 },
    Closed,
}

impl SyncPhase {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Unsynced { .. } | Self::Ready { .. })
    }

    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    fn epoch(self) -> Option<u64> {
        match self {
            Self::Unsynced { epoch } | Self::Ready { epoch } => Some(epoch),
            Self::Offline | Self::Closed => None,
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => f.write_str("offline"),
            Self::Unsynced { epoch } => write!(f, "syncing (#{epoch})"),
            Self::Ready { epoch } => write!(f, "live (#{epoch})"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSnapshot {
    pub state: TimerState,
    pub phase: SyncPhase,
    pub offline_since: i64,
    pub settings: TimerSettings,
}

pub struct CoordinatorDeps {
    pub api: Arc<dyn TimerApi>,
    pub connection: Arc<dyn ConnectionHandle>,
    pub history: Arc<dyn OfflineHistoryStore>,
    pub state_repository: Arc<dyn TimerStateRepository>,
    pub settings_store: Arc<dyn SettingsStore>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub endpoint: ServerEndpoint,
    pub config_authority: ConfigAuthority,
    pub day_zone: DayZone,
    pub sync_timeout: Duration,
}

impl CoordinatorOptions {
    pub fn new(endpoint: ServerEndpoint) -> Self {
        Self {
            endpoint,
            config_authority: ConfigAuthority::default(),
            day_zone: DayZone::Local,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

#[derive(Debug)]
enum Internal {
    MergeFinished {
        epoch: u64,
        result: Result<TimerState, InfraError>,
    },
    ConfigFetched {
        epoch: u64,
        result: Result<TimerSettings, InfraError>,
    },
    SyncTimeout {
        epoch: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingsOrigin {
    Local,
    Server,
}

/// Disk work handed to the writer task, executed in order on the blocking pool.
enum DiskRequest {
    SaveState(TimerState),
    SaveSettings(TimerSettings),
    PersistSessions,
    LoadHistory(oneshot::Sender<Result<Vec<Session>, InfraError>>),
    AcknowledgeHistory {
        count: usize,
        done: oneshot::Sender<Result<(), InfraError>>,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct DiskStores {
    history: Arc<dyn OfflineHistoryStore>,
    state_repository: Arc<dyn TimerStateRepository>,
    settings_store: Arc<dyn SettingsStore>,
}

struct Mailboxes {
    ticks: mpsc::UnboundedReceiver<TickSignal>,
    internal: mpsc::UnboundedReceiver<Internal>,
}

/// Handle to a running coordinator task.
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    notifications: broadcast::Sender<StateNotification>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<StateNotification> {
        self.notifications.subscribe()
    }

    /// Returns `false` once the coordinator has stopped.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn toggle(&self) -> bool {
        self.send(Command::Toggle)
    }

    pub fn skip(&self) -> bool {
        self.send(Command::Skip)
    }

    pub fn reset(&self) -> bool {
        self.send(Command::Reset)
    }

    pub fn reconnect(&self) -> bool {
        self.send(Command::Reconnect)
    }

    pub fn update_settings(&self, settings: TimerSettings) -> bool {
        self.send(Command::UpdateSettings(settings))
    }

    pub async fn snapshot(&self) -> Option<CoordinatorSnapshot> {
        let (reply, response) = oneshot::channel();
        if !self.send(Command::Snapshot(reply)) {
            return None;
        }
        response.await.ok()
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(error) = self.task.await {
            error!(%error, "coordinator task ended abnormally");
        }
    }
}

/// Single owner of the timer state.
///
/// Decides whether the server or the local countdown engine is authoritative,
/// runs the reconnect handshake (history flush, state merge, config reconcile,
/// `ready`) and applies the day-boundary guard before user actions.
pub struct SyncCoordinator {
    deps: CoordinatorDeps,
    options: CoordinatorOptions,
    settings: TimerSettings,
    state: TimerState,
    last_saved: Option<TimerState>,
    engine: CountdownEngine,
    phase: SyncPhase,
    epoch: u64,
    offline_since: i64,
    sync_timeout: Option<JoinHandle<()>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    disk_tx: mpsc::UnboundedSender<DiskRequest>,
    notifications: broadcast::Sender<StateNotification>,
    mailboxes: Option<Mailboxes>,
    now_provider: NowProvider,
}

impl SyncCoordinator {
    /// Must be called inside a tokio runtime; the disk writer starts immediately.
    pub fn new(deps: CoordinatorDeps, options: CoordinatorOptions) -> Self {
        let settings = deps.settings_store.load().unwrap_or_else(|error| {
            warn!(%error, "failed to load timer settings; using defaults");
            TimerSettings::default()
        });
        let (tick_tx, ticks) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let engine = CountdownEngine::new(settings.clone(), Arc::clone(&deps.history), tick_tx);
        let stores = DiskStores {
            history: Arc::clone(&deps.history),
            state_repository: Arc::clone(&deps.state_repository),
            settings_store: Arc::clone(&deps.settings_store),
        };
        tokio::spawn(run_disk_writer(stores, disk_rx));

        Self {
            deps,
            options,
            settings,
            state: TimerState::default(),
            last_saved: None,
            engine,
            phase: SyncPhase::Offline,
            epoch: 0,
            offline_since: 0,
            sync_timeout: None,
            internal_tx,
            disk_tx,
            notifications,
            mailboxes: Some(Mailboxes { ticks, internal }),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.engine = self.engine.with_now_provider(Arc::clone(&now_provider));
        self.now_provider = now_provider;
        self
    }

    pub fn spawn(self, connection_events: mpsc::UnboundedReceiver<ConnectionEvent>) -> CoordinatorHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let notifications = self.notifications.clone();
        let task = tokio::spawn(self.run(command_rx, connection_events));
        CoordinatorHandle {
            commands,
            notifications,
            task,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let Some(mut mailboxes) = self.mailboxes.take() else {
            error!("coordinator started twice");
            return;
        };
        self.initialize();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = connection_events.recv() => self.handle_connection_event(event),
                Some(signal) = mailboxes.ticks.recv() => self.handle_tick(signal),
                Some(message) = mailboxes.internal.recv() => self.handle_internal(message),
            }
        }

        self.shutdown().await;
    }

    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)()
    }

    fn clock(&self) -> DayClock {
        DayClock::new(self.settings.day_start_hour, self.options.day_zone)
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            state: self.state.clone(),
            phase: self.phase,
            offline_since: self.offline_since,
            settings: self.settings.clone(),
        }
    }

    /// Restores the persisted state, seeds the engine and opens the connection.
    fn initialize(&mut self) {
        let now = self.now();
        let restored = self.deps.state_repository.load().unwrap_or_else(|error| {
            warn!(%error, "failed to load persisted timer state; starting fresh");
            None
        });

        let mut state = match restored {
            Some(mut saved) => {
                project_remaining(&mut saved, unix_seconds(now));
                info!(status = saved.status.as_str(), remaining = saved.remaining, "restored timer state");
                saved
            }
            None => {
                let full = duration_for_phase(&self.settings, Phase::Work);
                TimerState {
                    duration: full,
                    remaining: full,
                    date: Some(self.clock().effective_date_string(now)),
                    completed: self.count_completed_today(now),
                    goal: self.settings.daily_goal,
                    ..TimerState::default()
                }
            }
        };
        sanitize(&mut state, &self.settings);

        self.state = state;
        self.engine.update_state(self.state.clone());
        self.notify_updated();
        self.deps.connection.connect(&self.options.endpoint);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Toggle => self.dispatch(TimerAction::Toggle),
            Command::Skip => self.dispatch(TimerAction::Skip),
            Command::Reset => self.dispatch(TimerAction::Reset),
            Command::Reconnect => {
                info!(endpoint = %self.options.endpoint, "manual reconnect requested");
                self.deps.connection.connect(&self.options.endpoint);
            }
            Command::UpdateSettings(settings) => self.apply_settings(settings, SettingsOrigin::Local),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn dispatch(&mut self, action: TimerAction) {
        self.check_day_transition();

        if self.phase.is_ready() {
            debug!(action = action.as_str(), "forwarding action to server");
            let api = Arc::clone(&self.deps.api);
            tokio::spawn(async move {
                if let Err(error) = api.send_action(action).await {
                    warn!(action = action.as_str(), %error, "remote action failed");
                }
            });
            return;
        }

        self.state = match action {
            TimerAction::Toggle => self.engine.toggle(),
            TimerAction::Skip => self.engine.skip(),
            TimerAction::Reset => self.engine.reset(),
        };
        self.persist_if_changed();
        self.notify_updated();
    }

    fn check_day_transition(&mut self) {
        let now = self.now();
        let today = self.clock().effective_date_string(now);
        match self.state.date.as_deref() {
            Some(date) if date == today => return,
            None => {
                // Servers may omit the date; adopt today's without discarding progress.
                self.state.date = Some(today);
                self.engine.update_state(self.state.clone());
                self.persist();
                return;
            }
            Some(previous) => info!(from = previous, to = %today, "day boundary crossed; resetting timer"),
        }

        let completed = self.count_completed_today(now);
        self.state.reset_for_new_day(today, completed, now.timestamp());
        sanitize(&mut self.state, &self.settings);
        self.engine.update_state(self.state.clone());
        self.persist();
        self.notify_updated();
    }

    fn count_completed_today(&self, now: DateTime<Utc>) -> u32 {
        self.deps
            .history
            .count_completed_today(&self.clock(), now)
            .unwrap_or_else(|error| {
                warn!(%error, "failed to count today's sessions");
                0
            })
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected(),
            ConnectionEvent::Disconnected => self.on_disconnected(),
            ConnectionEvent::StateReceived(state) => match self.phase {
                SyncPhase::Ready { .. } => self.install_remote_state(state, false),
                phase => debug!(%phase, "ignoring state push before reconciliation finished"),
            },
        }
    }

    fn on_connected(&mut self) {
        if self.phase == SyncPhase::Closed {
            return;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        self.phase = SyncPhase::Unsynced { epoch };
        self.arm_sync_timeout(epoch);
        info!(epoch, offline_since = self.offline_since, "connected; reconciling before accepting pushes");

        let api = Arc::clone(&self.deps.api);
        let disk_tx = self.disk_tx.clone();
        let local_state = self.state.clone();
        let offline_since = self.offline_since;
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            flush_offline_history(api.as_ref(), &disk_tx, epoch).await;
            let result = api.sync_state(&local_state, offline_since).await;
            let _ = internal_tx.send(Internal::MergeFinished { epoch, result });
        });

        self.notify_updated();
    }

    fn on_disconnected(&mut self) {
        if self.phase == SyncPhase::Closed {
            return;
        }
        let was_connected = self.phase.is_connected();
        self.cancel_sync_timeout();
        self.phase = SyncPhase::Offline;
        if self.offline_since == 0 {
            self.offline_since = self.now().timestamp();
        }
        if !was_connected {
            debug!("connection attempt failed; staying offline");
            return;
        }

        warn!(offline_since = self.offline_since, "connection lost; local timer takes over");
        if self.state.is_running() {
            self.engine.update_state(self.state.clone());
        }
        self.notify_updated();
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::MergeFinished { epoch, result } => self.on_merge_finished(epoch, result),
            Internal::ConfigFetched { epoch, result } => self.on_config_fetched(epoch, result),
            Internal::SyncTimeout { epoch } => {
                if self.phase == (SyncPhase::Unsynced { epoch }) {
                    warn!(epoch, "state merge did not finish in time; accepting pushes anyway");
                    self.mark_ready(epoch);
                }
            }
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.phase.epoch() == Some(epoch)
    }

    fn on_merge_finished(&mut self, epoch: u64, result: Result<TimerState, InfraError>) {
        if !self.is_current(epoch) {
            debug!(epoch, current = self.epoch, "discarding merge result from a previous connection");
            return;
        }
        match result {
            Ok(merged) => {
                info!(
                    epoch,
                    status = merged.status.as_str(),
                    completed = merged.completed,
                    "merged timer state with server"
                );
                self.offline_since = 0;
                self.install_remote_state(merged, true);
                self.reconcile_config(epoch);
                self.mark_ready(epoch);
            }
            Err(error) => warn!(epoch, %error, "state merge failed; waiting for sync timeout"),
        }
    }

    fn on_config_fetched(&mut self, epoch: u64, result: Result<TimerSettings, InfraError>) {
        if !self.is_current(epoch) {
            return;
        }
        match result {
            Ok(settings) => self.apply_settings(settings, SettingsOrigin::Server),
            Err(error) => warn!(epoch, %error, "failed to fetch server config"),
        }
    }

    fn mark_ready(&mut self, epoch: u64) {
        if self.phase.is_ready() {
            return;
        }
        self.cancel_sync_timeout();
        if !self.deps.connection.send(&ControlMessage::Ready) {
            debug!(epoch, "ready signal dropped; connection not open");
        }
        self.phase = SyncPhase::Ready { epoch };
        info!(epoch, "reconciliation complete; server is authoritative");
    }

    fn reconcile_config(&self, epoch: u64) {
        let api = Arc::clone(&self.deps.api);
        match self.options.config_authority {
            ConfigAuthority::Phone => self.push_config(),
            ConfigAuthority::Server => {
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = api.fetch_config().await;
                    let _ = internal_tx.send(Internal::ConfigFetched { epoch, result });
                });
            }
        }
    }

    fn push_config(&self) {
        let api = Arc::clone(&self.deps.api);
        let settings = self.settings.clone();
        tokio::spawn(async move {
            if let Err(error) = api.push_config(&settings).await {
                debug!(%error, "config push failed");
            }
        });
    }

    fn install_remote_state(&mut self, mut state: TimerState, always_persist: bool) {
        sanitize(&mut state, &self.settings);
        self.state = state;
        if always_persist {
            self.persist();
        } else {
            self.persist_if_changed();
        }
        self.adopt_goal(self.state.goal);
        self.engine.mirror(self.state.clone());
        self.notify_updated();
    }

    fn adopt_goal(&mut self, goal: u32) {
        if self.settings.daily_goal == goal {
            return;
        }
        self.settings.daily_goal = goal;
        self.engine.set_settings(self.settings.clone());
        self.queue_disk(DiskRequest::SaveSettings(self.settings.clone()));
    }

    fn apply_settings(&mut self, settings: TimerSettings, origin: SettingsOrigin) {
        if let Err(message) = settings.validate() {
            warn!(%message, ?origin, "rejecting invalid timer settings");
            return;
        }

        self.settings = settings;
        self.engine.set_settings(self.settings.clone());
        self.queue_disk(DiskRequest::SaveSettings(self.settings.clone()));
        info!(?origin, goal = self.settings.daily_goal, "timer settings updated");

        if self.state.goal != self.settings.daily_goal {
            self.state.goal = self.settings.daily_goal;
            self.engine.set_goal(self.settings.daily_goal);
            self.persist_if_changed();
            self.notify_updated();
        }

        if origin == SettingsOrigin::Local
            && self.phase.is_ready()
            && self.options.config_authority == ConfigAuthority::Phone
        {
            self.push_config();
        }
    }

    fn handle_tick(&mut self, signal: TickSignal) {
        let Some(event) = self.engine.on_tick(signal) else {
            return;
        };
        match event {
            EngineEvent::Tick(state) => {
                self.state = state;
                self.persist_if_changed();
                self.notify_updated();
            }
            EngineEvent::Complete { state, session } => {
                self.state = state;
                self.queue_disk(DiskRequest::PersistSessions);
                self.persist();
                let _ = self.notifications.send(StateNotification::Completed {
                    state: self.state.clone(),
                    session,
                });
            }
        }
    }

    fn arm_sync_timeout(&mut self, epoch: u64) {
        self.cancel_sync_timeout();
        let internal_tx = self.internal_tx.clone();
        let timeout = self.options.sync_timeout;
        self.sync_timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal_tx.send(Internal::SyncTimeout { epoch });
        }));
    }

    fn cancel_sync_timeout(&mut self) {
        if let Some(handle) = self.sync_timeout.take() {
            handle.abort();
        }
    }

    fn queue_disk(&self, request: DiskRequest) -> bool {
        if self.disk_tx.send(request).is_err() {
            error!("disk writer stopped; write dropped");
            return false;
        }
        true
    }

    fn persist(&mut self) {
        if self.queue_disk(DiskRequest::SaveState(self.state.clone())) {
            self.last_saved = Some(self.state.clone());
        }
    }

    fn persist_if_changed(&mut self) {
        if should_save(self.last_saved.as_ref(), &self.state) {
            self.persist();
        }
    }

    /// Resolves once every disk write queued so far has finished.
    async fn flush_writes(&self) {
        let (done, written) = oneshot::channel();
        if self.disk_tx.send(DiskRequest::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }

    fn notify_updated(&self) {
        let _ = self.notifications.send(StateNotification::Updated {
            state: self.state.clone(),
            connected: self.phase.is_connected(),
        });
    }

    async fn shutdown(mut self) {
        info!("coordinator shutting down");
        self.engine.stop();
        self.cancel_sync_timeout();
        self.phase = SyncPhase::Closed;
        self.deps.connection.close();
        self.persist_if_changed();
        self.flush_writes().await;
    }
}

async fn flush_offline_history(api: &dyn TimerApi, disk: &mpsc::UnboundedSender<DiskRequest>, epoch: u64) {
    let (reply, loaded) = oneshot::channel();
    if disk.send(DiskRequest::LoadHistory(reply)).is_err() {
        warn!(epoch, "disk writer stopped; skipping history upload");
        return;
    }
    let sessions = match loaded.await {
        Ok(Ok(sessions)) => sessions,
        Ok(Err(error)) => {
            warn!(epoch, %error, "failed to read offline history");
            return;
        }
        Err(_) => return,
    };
    if sessions.is_empty() {
        return;
    }

    let count = sessions.len();
    if let Err(error) = api.sync_history(&sessions).await {
        warn!(epoch, count, %error, "offline history upload failed; keeping sessions queued");
        return;
    }
    let (done, acknowledged) = oneshot::channel();
    if disk.send(DiskRequest::AcknowledgeHistory { count, done }).is_err() {
        error!(epoch, count, "disk writer stopped; uploaded sessions stay queued");
        return;
    }
    match acknowledged.await {
        Ok(Ok(())) => info!(epoch, count, "offline sessions uploaded"),
        Ok(Err(error)) => error!(epoch, count, %error, "uploaded sessions could not be removed locally"),
        Err(_) => error!(epoch, count, "uploaded sessions could not be removed locally"),
    }
}

async fn run_disk_writer(stores: DiskStores, mut requests: mpsc::UnboundedReceiver<DiskRequest>) {
    while let Some(request) = requests.recv().await {
        match request {
            DiskRequest::Flush(done) => {
                let _ = done.send(());
            }
            request => {
                let stores = stores.clone();
                if let Err(error) = tokio::task::spawn_blocking(move || stores.apply(request)).await {
                    error!(%error, "disk writer panicked");
                }
            }
        }
    }
}

impl DiskStores {
    fn apply(&self, request: DiskRequest) {
        match request {
            DiskRequest::SaveState(state) => {
                if let Err(error) = self.state_repository.save(&state) {
                    warn!(%error, "failed to persist timer state");
                }
            }
            DiskRequest::SaveSettings(settings) => {
                if let Err(error) = self.settings_store.save(&settings) {
                    warn!(%error, "failed to persist timer settings");
                }
            }
            DiskRequest::PersistSessions => match self.history.persist_staged() {
                Ok(0) => {}
                Ok(count) => debug!(count, "offline sessions written"),
                Err(error) => error!(%error, "failed to write offline sessions"),
            },
            DiskRequest::LoadHistory(reply) => {
                let _ = reply.send(self.history.load_all());
            }
            DiskRequest::AcknowledgeHistory { count, done } => {
                let _ = done.send(self.history.acknowledge(count));
            }
            DiskRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
