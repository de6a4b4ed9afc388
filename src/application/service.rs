use crate::application::bootstrap::bootstrap_workspace;
use crate::application::coordinator::{CoordinatorDeps, CoordinatorHandle, CoordinatorOptions, SyncCoordinator};
use crate::application::history_cache::{HistoryCacheService, HistorySyncOutcome};
use crate::domain::policy::DayZone;
use crate::infrastructure::config::{load_app_config_from_env, JsonSettingsStore};
use crate::infrastructure::connection::{ConnectionSettings, WebSocketClient};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::history_cache_repository::SqliteHistoryCacheRepository;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::offline_history::SqliteOfflineHistoryStore;
use crate::infrastructure::remote_api::{ReqwestTimerApi, TimerApi};
use crate::infrastructure::state_repository::SqliteTimerStateRepository;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub type HistoryCache = HistoryCacheService<dyn TimerApi, SqliteHistoryCacheRepository>;

/// Everything the binary needs, wired against the workspace on disk.
pub struct RemoteService {
    coordinator: CoordinatorHandle,
    history: HistoryCache,
}

impl RemoteService {
    /// Bootstraps `workspace_root`, installs logging and starts the coordinator.
    /// Must run inside a tokio runtime.
    pub fn start(workspace_root: &Path) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(workspace_root)?;
        let log_path = init_logging(&bootstrap.logs_dir)?;
        let config = load_app_config_from_env(&bootstrap.config_dir)?;
        let day_zone = DayZone::parse(config.timezone.as_deref()).map_err(InfraError::InvalidConfig)?;

        let api: Arc<dyn TimerApi> = Arc::new(ReqwestTimerApi::for_endpoint(&config.endpoint)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(WebSocketClient::spawn(ConnectionSettings::default(), events_tx));

        let deps = CoordinatorDeps {
            api: Arc::clone(&api),
            connection,
            history: Arc::new(SqliteOfflineHistoryStore::new(&bootstrap.database_path)),
            state_repository: Arc::new(SqliteTimerStateRepository::new(&bootstrap.database_path)),
            settings_store: Arc::new(JsonSettingsStore::new(&bootstrap.config_dir)),
        };
        let options = CoordinatorOptions {
            config_authority: config.config_authority,
            day_zone,
            ..CoordinatorOptions::new(config.endpoint.clone())
        };
        let coordinator = SyncCoordinator::new(deps, options).spawn(events_rx);
        let history = HistoryCacheService::new(
            api,
            Arc::new(SqliteHistoryCacheRepository::new(&bootstrap.database_path)),
        );

        info!(
            workspace = %bootstrap.workspace_root.display(),
            server = %config.endpoint,
            authority = ?config.config_authority,
            log = %log_path.display(),
            "pomoremote started"
        );

        Ok(Self { coordinator, history })
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn history(&self) -> &HistoryCache {
        &self.history
    }

    /// Pulls server history unless the cache is still fresh. `None` means no sync was needed.
    pub async fn refresh_history(&self, force: bool) -> Option<HistorySyncOutcome> {
        if !force && !self.history.needs_sync() {
            return None;
        }
        Some(self.history.sync_from_server().await)
    }

    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        info!("pomoremote stopped");
    }
}
