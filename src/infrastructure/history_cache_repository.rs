use crate::domain::models::{CachedSession, DayStats, Phase, Session};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Local copy of the server's history, replaced wholesale on every sync.
pub trait HistoryCacheRepository: Send + Sync {
    fn replace_all(&self, days: &[DayStats], sessions: &[CachedSession]) -> Result<(), InfraError>;
    /// Newest date first.
    fn list_day_stats(&self) -> Result<Vec<DayStats>, InfraError>;
    /// Ordered by start time.
    fn sessions_for_date(&self, date: &str) -> Result<Vec<CachedSession>, InfraError>;

    fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>, InfraError> {
        Ok(self
            .list_day_stats()?
            .iter()
            .map(|day| day.last_sync_time)
            .max())
    }

    fn total_work_minutes(&self) -> Result<u64, InfraError> {
        Ok(self
            .list_day_stats()?
            .iter()
            .map(|day| u64::from(day.work_minutes))
            .sum())
    }

    fn total_sessions(&self) -> Result<u64, InfraError> {
        Ok(self
            .list_day_stats()?
            .iter()
            .map(|day| u64::from(day.completed))
            .sum())
    }

    fn days_with_activity(&self) -> Result<usize, InfraError> {
        Ok(self
            .list_day_stats()?
            .iter()
            .filter(|day| day.completed > 0)
            .count())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteHistoryCacheRepository {
    db_path: PathBuf,
}

impl SqliteHistoryCacheRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

impl HistoryCacheRepository for SqliteHistoryCacheRepository {
    fn replace_all(&self, days: &[DayStats], sessions: &[CachedSession]) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        transaction.execute("DELETE FROM cached_sessions", [])?;
        transaction.execute("DELETE FROM day_stats", [])?;
        for day in days {
            transaction.execute(
                "INSERT INTO day_stats (date, completed, work_minutes, break_minutes, last_sync_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    day.date,
                    day.completed,
                    day.work_minutes,
                    day.break_minutes,
                    day.last_sync_time.to_rfc3339()
                ],
            )?;
        }
        for cached in sessions {
            transaction.execute(
                "INSERT INTO cached_sessions (date, phase, start, duration, completed)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cached.date,
                    cached.session.phase.as_str(),
                    cached.session.start,
                    cached.session.duration,
                    cached.session.completed
                ],
            )?;
        }
        transaction.commit()?;
        Ok(())
    }

    fn list_day_stats(&self) -> Result<Vec<DayStats>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT date, completed, work_minutes, break_minutes, last_sync_time
             FROM day_stats ORDER BY date DESC",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut days = Vec::new();
        for row in rows {
            let (date, completed, work_minutes, break_minutes, last_sync_raw) = row?;
            let last_sync_time = DateTime::parse_from_rfc3339(&last_sync_raw)
                .map_err(|error| {
                    InfraError::Storage(format!(
                        "invalid day_stats.last_sync_time '{last_sync_raw}': {error}"
                    ))
                })?
                .with_timezone(&Utc);
            days.push(DayStats {
                date,
                completed,
                work_minutes,
                break_minutes,
                last_sync_time,
            });
        }
        Ok(days)
    }

    fn sessions_for_date(&self, date: &str) -> Result<Vec<CachedSession>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT phase, start, duration, completed FROM cached_sessions
             WHERE date = ?1 ORDER BY start ASC, id ASC",
        )?;
        let rows = statement.query_map(params![date], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (phase, start, duration, completed) = row?;
            let phase = phase.parse::<Phase>().map_err(InfraError::Storage)?;
            sessions.push(CachedSession {
                date: date.to_string(),
                session: Session {
                    phase,
                    start,
                    duration,
                    completed,
                },
            });
        }
        Ok(sessions)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryCacheRepository {
    entries: Mutex<(Vec<DayStats>, Vec<CachedSession>)>,
}

impl HistoryCacheRepository for InMemoryHistoryCacheRepository {
    fn replace_all(&self, days: &[DayStats], sessions: &[CachedSession]) -> Result<(), InfraError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|error| InfraError::Storage(format!("history cache lock poisoned: {error}")))?;
        *entries = (days.to_vec(), sessions.to_vec());
        Ok(())
    }

    fn list_day_stats(&self) -> Result<Vec<DayStats>, InfraError> {
        let entries = self
            .entries
            .lock()
            .map_err(|error| InfraError::Storage(format!("history cache lock poisoned: {error}")))?;
        let mut days = entries.0.clone();
        days.sort_by(|left, right| right.date.cmp(&left.date));
        Ok(days)
    }

    fn sessions_for_date(&self, date: &str) -> Result<Vec<CachedSession>, InfraError> {
        let entries = self
            .entries
            .lock()
            .map_err(|error| InfraError::Storage(format!("history cache lock poisoned: {error}")))?;
        let mut sessions: Vec<CachedSession> = entries
            .1
            .iter()
            .filter(|cached| cached.date == date)
            .cloned()
            .collect();
        sessions.sort_by_key(|cached| cached.session.start);
        Ok(sessions)
    }
}
