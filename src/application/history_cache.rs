use crate::application::countdown::NowProvider;
use crate::domain::models::{CachedSession, DayStats};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::history_cache_repository::HistoryCacheRepository;
use crate::infrastructure::remote_api::{HistoryDayPayload, TimerApi};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration as TokioDuration};
use tracing::{info, warn};

const SYNC_INTERVAL_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistorySyncOutcome {
    Success { days_updated: usize },
    NetworkError(String),
    Error(String),
}

/// Keeps a read-only local copy of the server's session history.
pub struct HistoryCacheService<A, R>
where
    A: TimerApi + ?Sized,
    R: HistoryCacheRepository + ?Sized,
{
    api: Arc<A>,
    repository: Arc<R>,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<A, R> HistoryCacheService<A, R>
where
    A: TimerApi + ?Sized,
    R: HistoryCacheRepository + ?Sized,
{
    pub fn new(api: Arc<A>, repository: Arc<R>) -> Self {
        Self {
            api,
            repository,
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// True when the cache was never filled or is older than five minutes.
    pub fn needs_sync(&self) -> bool {
        match self.repository.last_sync_time() {
            Ok(Some(last)) => (self.now_provider)() - last > Duration::minutes(SYNC_INTERVAL_MINUTES),
            Ok(None) => true,
            Err(error) => {
                warn!(%error, "failed to read history cache age");
                true
            }
        }
    }

    pub async fn sync_from_server(&self) -> HistorySyncOutcome {
        let history = match self.fetch_with_retry().await {
            Ok(history) => history,
            Err(error) if error.is_network() => {
                warn!(%error, "history sync failed: server unreachable");
                return HistorySyncOutcome::NetworkError(error.to_string());
            }
            Err(error) => {
                warn!(%error, "history sync failed");
                return HistorySyncOutcome::Error(error.to_string());
            }
        };

        let (days, sessions) = rebuild(history, (self.now_provider)());
        if let Err(error) = self.repository.replace_all(&days, &sessions) {
            warn!(%error, "failed to store history cache");
            return HistorySyncOutcome::Error(error.to_string());
        }

        info!(days = days.len(), sessions = sessions.len(), "history cache refreshed");
        HistorySyncOutcome::Success {
            days_updated: days.len(),
        }
    }

    pub fn day_stats(&self) -> Result<Vec<DayStats>, InfraError> {
        self.repository.list_day_stats()
    }

    pub fn sessions_for_date(&self, date: &str) -> Result<Vec<CachedSession>, InfraError> {
        self.repository.sessions_for_date(date)
    }

    pub fn total_work_minutes(&self) -> Result<u64, InfraError> {
        self.repository.total_work_minutes()
    }

    pub fn total_sessions(&self) -> Result<u64, InfraError> {
        self.repository.total_sessions()
    }

    pub fn days_with_activity(&self) -> Result<usize, InfraError> {
        self.repository.days_with_activity()
    }

    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>, InfraError> {
        self.repository.last_sync_time()
    }

    async fn fetch_with_retry(&self) -> Result<BTreeMap<String, HistoryDayPayload>, InfraError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.api.fetch_history().await {
                Ok(history) => return Ok(history),
                Err(error) if error.is_network() && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(attempt as u32));
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Aggregates are recomputed from the sessions; rows with a malformed date are dropped.
fn rebuild(
    history: BTreeMap<String, HistoryDayPayload>,
    synced_at: DateTime<Utc>,
) -> (Vec<DayStats>, Vec<CachedSession>) {
    let mut days = Vec::with_capacity(history.len());
    let mut cached = Vec::new();

    for (date, payload) in history {
        let stats = DayStats::from_sessions(&date, &payload.sessions, synced_at);
        if let Err(message) = stats.validate() {
            warn!(%date, %message, "skipping history day");
            continue;
        }
        days.push(stats);
        cached.extend(payload.sessions.into_iter().map(|session| CachedSession {
            date: date.clone(),
            session,
        }));
    }

    (days, cached)
}
