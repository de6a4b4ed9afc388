use crate::domain::models::{Session, TimerSettings, TimerState};
use crate::infrastructure::config::ServerEndpoint;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Toggle,
    Skip,
    Reset,
}

impl TimerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Toggle => "toggle",
            Self::Skip => "skip",
            Self::Reset => "reset",
        }
    }
}

/// One day of server history as returned by `GET /api/history`.
/// The aggregate fields are informational; callers recompute them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryDayPayload {
    pub completed: u32,
    pub work_minutes: u32,
    pub break_minutes: u32,
    pub sessions: Vec<Session>,
}

#[async_trait]
pub trait TimerApi: Send + Sync {
    async fn send_action(&self, action: TimerAction) -> Result<(), InfraError>;

    /// Merges the phone's state with the server's and returns the result.
    async fn sync_state(&self, state: &TimerState, offline_since: i64) -> Result<TimerState, InfraError>;

    async fn push_config(&self, settings: &TimerSettings) -> Result<(), InfraError>;

    async fn fetch_config(&self) -> Result<TimerSettings, InfraError>;

    async fn sync_history(&self, sessions: &[Session]) -> Result<(), InfraError>;

    async fn fetch_history(&self) -> Result<BTreeMap<String, HistoryDayPayload>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTimerApi {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    state: &'a TimerState,
    offline_since: i64,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    state: Option<TimerState>,
}

impl ReqwestTimerApi {
    pub fn new(base_url: Url) -> Result<Self, InfraError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| InfraError::Network(format!("failed to build http client: {error}")))?;
        Ok(Self { client, base_url })
    }

    pub fn for_endpoint(endpoint: &ServerEndpoint) -> Result<Self, InfraError> {
        Self::new(endpoint.http_base_url()?)
    }

    fn endpoint(&self, path: &str) -> Result<Url, InfraError> {
        self.base_url
            .join(path)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid api path '{path}': {error}")))
    }

    fn http_error(status: reqwest::StatusCode, body: String) -> InfraError {
        InfraError::Http {
            status: status.as_u16(),
            body,
        }
    }

    async fn execute(request: RequestBuilder, context: &str) -> Result<String, InfraError> {
        let response = request
            .send()
            .await
            .map_err(|error| InfraError::Network(format!("network error while {context}: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Network(format!("failed reading response while {context}: {error}")))?;

        if !status.is_success() {
            return Err(Self::http_error(status, body));
        }
        Ok(body)
    }

    fn parse<T: for<'de> Deserialize<'de>>(body: &str, context: &str) -> Result<T, InfraError> {
        if body.trim().is_empty() {
            return Err(InfraError::Protocol(format!("empty response while {context}")));
        }
        serde_json::from_str(body)
            .map_err(|error| InfraError::Protocol(format!("invalid payload while {context}: {error}; body={body}")))
    }
}

#[async_trait]
impl TimerApi for ReqwestTimerApi {
    async fn send_action(&self, action: TimerAction) -> Result<(), InfraError> {
        let url = self.endpoint(&format!("api/{}", action.as_str()))?;
        Self::execute(self.client.post(url), "sending timer action").await?;
        Ok(())
    }

    async fn sync_state(&self, state: &TimerState, offline_since: i64) -> Result<TimerState, InfraError> {
        let url = self.endpoint("api/sync")?;
        let request = SyncRequest { state, offline_since };
        let body = Self::execute(self.client.post(url).json(&request), "syncing timer state").await?;
        let parsed: SyncResponse = Self::parse(&body, "syncing timer state")?;
        parsed
            .state
            .ok_or_else(|| InfraError::Protocol("sync response did not include state".to_string()))
    }

    async fn push_config(&self, settings: &TimerSettings) -> Result<(), InfraError> {
        let url = self.endpoint("api/config")?;
        Self::execute(self.client.post(url).json(settings), "pushing config").await?;
        Ok(())
    }

    async fn fetch_config(&self) -> Result<TimerSettings, InfraError> {
        let url = self.endpoint("api/config")?;
        let body = Self::execute(self.client.get(url), "fetching config").await?;
        let settings: TimerSettings = Self::parse(&body, "fetching config")?;
        settings.validate().map_err(InfraError::Protocol)?;
        Ok(settings)
    }

    async fn sync_history(&self, sessions: &[Session]) -> Result<(), InfraError> {
        let url = self.endpoint("api/history/sync")?;
        Self::execute(self.client.post(url).json(sessions), "uploading offline history").await?;
        Ok(())
    }

    async fn fetch_history(&self) -> Result<BTreeMap<String, HistoryDayPayload>, InfraError> {
        let url = self.endpoint("api/history")?;
        let body = Self::execute(self.client.get(url), "fetching history").await?;
        Self::parse(&body, "fetching history")
    }
}
