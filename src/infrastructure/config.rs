use crate::domain::models::TimerSettings;
use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use url::Url;

const APP_JSON: &str = "app.json";
const TIMER_JSON: &str = "timer.json";
const CONFIG_SCHEMA: u8 = 1;
pub const DEFAULT_SERVER_HOST: &str = "192.168.1.100";
pub const DEFAULT_SERVER_PORT: u16 = 9876;
const HOST_KEYS: &[&str] = &["POMOREMOTE_SERVER_HOST"];
const PORT_KEYS: &[&str] = &["POMOREMOTE_SERVER_PORT"];
const HOME_KEYS: &[&str] = &["POMOREMOTE_HOME"];

/// Which side owns the timer configuration after a reconnect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConfigAuthority {
    #[default]
    Phone,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn http_base_url(&self) -> Result<Url, InfraError> {
        self.url_with_scheme("http", "/")
    }

    pub fn websocket_url(&self) -> Result<Url, InfraError> {
        self.url_with_scheme("ws", "/ws")
    }

    fn url_with_scheme(&self, scheme: &str, path: &str) -> Result<Url, InfraError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(InfraError::InvalidConfig("server host must not be empty".to_string()));
        }
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        Url::parse(&format!("{scheme}://{host}:{}{path}", self.port)).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid server address '{host}:{}': {error}", self.port))
        })
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub endpoint: ServerEndpoint,
    pub timezone: Option<String>,
    pub config_authority: ConfigAuthority,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppConfigFile {
    schema: u8,
    #[serde(default = "default_host")]
    server_host: String,
    #[serde(default = "default_port")]
    server_port: u16,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    config_authority: ConfigAuthority,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimerConfigFile {
    schema: u8,
    #[serde(flatten)]
    settings: TimerSettings,
}

fn default_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "serverHost": DEFAULT_SERVER_HOST,
                "serverPort": DEFAULT_SERVER_PORT,
                "timezone": null,
                "configAuthority": "phone"
            }),
        ),
        (
            TIMER_JSON,
            serde_json::json!({
                "schema": 1,
                "durations": {"work": 25, "short_break": 5, "long_break": 15},
                "long_break_after": 4,
                "daily_goal": 8,
                "day_start_hour": 0
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            write_json(&path, &value)?;
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), InfraError> {
    let formatted = serde_json::to_string_pretty(value)?;
    fs::write(path, format!("{formatted}\n"))?;
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != u64::from(CONFIG_SCHEMA) {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_app_config(config_dir: &Path) -> Result<AppConfig, InfraError> {
    let file: AppConfigFile = serde_json::from_value(read_config(&config_dir.join(APP_JSON))?)?;
    Ok(AppConfig {
        endpoint: ServerEndpoint::new(file.server_host.trim(), file.server_port),
        timezone: file
            .timezone
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        config_authority: file.config_authority,
    })
}

pub fn load_app_config_from_env(config_dir: &Path) -> Result<AppConfig, InfraError> {
    load_app_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

/// Reads `app.json` and applies server address overrides from `lookup`.
pub fn load_app_config_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<AppConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = load_app_config(config_dir)?;
    if let Some(host) = optional_lookup_value(&lookup, HOST_KEYS) {
        config.endpoint.host = host;
    }
    if let Some(raw_port) = optional_lookup_value(&lookup, PORT_KEYS) {
        config.endpoint.port = parse_port(&raw_port)?;
    }
    config.endpoint.http_base_url()?;
    Ok(config)
}

pub fn workspace_root_from_lookup<F>(lookup: F, fallback: &Path) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(&lookup, HOME_KEYS)
        .map(PathBuf::from)
        .unwrap_or_else(|| fallback.to_path_buf())
}

fn parse_port(raw: &str) -> Result<u16, InfraError> {
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(InfraError::InvalidConfig(format!(
            "invalid server port '{raw}' (set {} to 1-65535)",
            PORT_KEYS.join(", ")
        ))),
    }
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<TimerSettings, InfraError>;
    fn save(&self, settings: &TimerSettings) -> Result<(), InfraError>;
}

/// Timer settings kept in `config/timer.json`.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    config_dir: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
        }
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<TimerSettings, InfraError> {
        let file: TimerConfigFile = serde_json::from_value(read_config(&self.config_dir.join(TIMER_JSON))?)?;
        file.settings.validate().map_err(InfraError::InvalidConfig)?;
        Ok(file.settings)
    }

    fn save(&self, settings: &TimerSettings) -> Result<(), InfraError> {
        settings.validate().map_err(InfraError::InvalidConfig)?;
        write_json(
            &self.config_dir.join(TIMER_JSON),
            &TimerConfigFile {
                schema: CONFIG_SCHEMA,
                settings: settings.clone(),
            },
        )
    }
}

#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    settings: Mutex<TimerSettings>,
}

impl InMemorySettingsStore {
    pub fn new(settings: TimerSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn load(&self) -> Result<TimerSettings, InfraError> {
        let settings = self
            .settings
            .lock()
            .map_err(|error| InfraError::Storage(format!("settings lock poisoned: {error}")))?;
        Ok(settings.clone())
    }

    fn save(&self, settings: &TimerSettings) -> Result<(), InfraError> {
        let mut stored = self
            .settings
            .lock()
            .map_err(|error| InfraError::Storage(format!("settings lock poisoned: {error}")))?;
        *stored = settings.clone();
        Ok(())
    }
}
