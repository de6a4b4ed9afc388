use crate::domain::models::TimerState;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Single-slot store for the last significant timer snapshot.
pub trait TimerStateRepository: Send + Sync {
    /// Returns `None` when nothing was saved or the stored payload is unreadable.
    fn load(&self) -> Result<Option<TimerState>, InfraError>;
    fn save(&self, state: &TimerState) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteTimerStateRepository {
    db_path: PathBuf,
}

impl SqliteTimerStateRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl TimerStateRepository for SqliteTimerStateRepository {
    fn load(&self) -> Result<Option<TimerState>, InfraError> {
        let connection = self.connect()?;
        let payload: Option<String> = connection
            .query_row("SELECT payload FROM timer_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<TimerState>(&payload) {
            Ok(state) => Ok(Some(state)),
            Err(error) => {
                warn!(%error, "discarding unreadable persisted timer state");
                Ok(None)
            }
        }
    }

    fn save(&self, state: &TimerState) -> Result<(), InfraError> {
        let payload = serde_json::to_string(state)?;
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO timer_state (id, payload, saved_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
               payload = excluded.payload,
               saved_at = excluded.saved_at",
            params![payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTimerStateRepository {
    state: Mutex<Option<TimerState>>,
    saves: AtomicUsize,
}

impl InMemoryTimerStateRepository {
    pub fn with_state(state: TimerState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl TimerStateRepository for InMemoryTimerStateRepository {
    fn load(&self) -> Result<Option<TimerState>, InfraError> {
        let state = self
            .state
            .lock()
            .map_err(|error| InfraError::Storage(format!("timer state lock poisoned: {error}")))?;
        Ok(state.clone())
    }

    fn save(&self, state: &TimerState) -> Result<(), InfraError> {
        let mut stored = self
            .state
            .lock()
            .map_err(|error| InfraError::Storage(format!("timer state lock poisoned: {error}")))?;
        *stored = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
