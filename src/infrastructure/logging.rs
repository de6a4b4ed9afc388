use crate::infrastructure::error::InfraError;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_NAME: &str = "engine.log";

/// Installs the global subscriber: human-readable lines on stderr and JSON
/// lines in `logs/engine.log`. Returns the log file path.
///
/// A second call leaves the first subscriber in place.
pub fn init_logging(logs_dir: &Path) -> Result<PathBuf, InfraError> {
    let path = logs_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().json().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init();

    Ok(path)
}
