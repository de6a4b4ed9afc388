use crate::domain::models::{Phase, Session};
use crate::domain::policy::DayClock;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Append-only queue of sessions completed while the server was unreachable.
///
/// Writes are split in two: [`stage`](Self::stage) makes a session visible to
/// readers at once, [`persist_staged`](Self::persist_staged) does the disk work
/// and can run off the caller's task.
pub trait OfflineHistoryStore: Send + Sync {
    fn stage(&self, session: &Session) -> Result<(), InfraError>;
    /// Writes every staged session and returns how many were written.
    fn persist_staged(&self) -> Result<usize, InfraError>;
    /// Every queued session in insertion order, staged ones included.
    fn load_all(&self) -> Result<Vec<Session>, InfraError>;
    /// Drops the oldest `count` sessions once the server has accepted them.
    fn acknowledge(&self, count: usize) -> Result<(), InfraError>;
    fn clear(&self) -> Result<(), InfraError>;

    fn append(&self, session: &Session) -> Result<(), InfraError> {
        self.stage(session)?;
        self.persist_staged().map(|_| ())
    }

    fn count_completed_today(&self, clock: &DayClock, now: DateTime<Utc>) -> Result<u32, InfraError> {
        let day_start = clock.day_start_timestamp(now);
        let count = self
            .load_all()?
            .iter()
            .filter(|session| session.is_completed_work() && session.start >= day_start)
            .count();
        Ok(count as u32)
    }
}

#[derive(Debug, Clone)]
struct CachedRow {
    // `None` while the session is staged but not yet written.
    id: Option<i64>,
    session: Session,
}

#[derive(Debug)]
pub struct SqliteOfflineHistoryStore {
    db_path: PathBuf,
    // Loaded from disk on first access.
    cache: Mutex<Option<Vec<CachedRow>>>,
}

impl SqliteOfflineHistoryStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            cache: Mutex::new(None),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Vec<CachedRow>>>, InfraError> {
        self.cache
            .lock()
            .map_err(|error| InfraError::Storage(format!("offline history lock poisoned: {error}")))
    }

    fn read_rows(&self) -> Result<Vec<CachedRow>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare("SELECT id, phase, start, duration, completed FROM offline_sessions ORDER BY id ASC")?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, phase, start, duration, completed) = row?;
            match phase.parse::<Phase>() {
                Ok(phase) => sessions.push(CachedRow {
                    id: Some(id),
                    session: Session {
                        phase,
                        start,
                        duration,
                        completed,
                    },
                }),
                Err(error) => warn!(id, %error, "skipping unreadable offline session row"),
            }
        }
        Ok(sessions)
    }

    fn warm<'a>(&self, cache: &'a mut Option<Vec<CachedRow>>) -> Result<&'a mut Vec<CachedRow>, InfraError> {
        if cache.is_none() {
            *cache = Some(self.read_rows()?);
        }
        cache
            .as_mut()
            .ok_or_else(|| InfraError::Storage("offline history cache unavailable".to_string()))
    }
}

impl OfflineHistoryStore for SqliteOfflineHistoryStore {
    fn stage(&self, session: &Session) -> Result<(), InfraError> {
        let mut guard = self.lock()?;
        let cache = self.warm(&mut guard)?;
        cache.push(CachedRow {
            id: None,
            session: session.clone(),
        });
        Ok(())
    }

    fn persist_staged(&self) -> Result<usize, InfraError> {
        // The lock is not held during the inserts. Rows only leave the front of
        // the cache through `acknowledge`, which the caller runs on the same
        // writer, so the collected indices stay valid.
        let staged: Vec<(usize, Session)> = {
            let mut guard = self.lock()?;
            let cache = self.warm(&mut guard)?;
            cache
                .iter()
                .enumerate()
                .filter(|(_, row)| row.id.is_none())
                .map(|(index, row)| (index, row.session.clone()))
                .collect()
        };
        if staged.is_empty() {
            return Ok(0);
        }

        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let mut ids = Vec::with_capacity(staged.len());
        for (_, session) in &staged {
            transaction.execute(
                "INSERT INTO offline_sessions (phase, start, duration, completed) VALUES (?1, ?2, ?3, ?4)",
                params![session.phase.as_str(), session.start, session.duration, session.completed],
            )?;
            ids.push(transaction.last_insert_rowid());
        }
        transaction.commit()?;

        let mut guard = self.lock()?;
        let cache = self.warm(&mut guard)?;
        for ((index, _), id) in staged.iter().zip(ids) {
            if let Some(row) = cache.get_mut(*index) {
                row.id = Some(id);
            }
        }
        Ok(staged.len())
    }

    fn load_all(&self) -> Result<Vec<Session>, InfraError> {
        let mut guard = self.lock()?;
        match self.warm(&mut guard) {
            Ok(cache) => Ok(cache.iter().map(|row| row.session.clone()).collect()),
            Err(error) => {
                warn!(%error, "offline history unreadable; treating as empty");
                Ok(Vec::new())
            }
        }
    }

    fn acknowledge(&self, count: usize) -> Result<(), InfraError> {
        if count == 0 {
            return Ok(());
        }
        let mut guard = self.lock()?;
        let cache = self.warm(&mut guard)?;
        let count = count.min(cache.len());
        if let Some(last_id) = cache.iter().take(count).filter_map(|row| row.id).last() {
            let connection = self.connect()?;
            connection.execute("DELETE FROM offline_sessions WHERE id <= ?1", params![last_id])?;
        }
        cache.drain(..count);
        Ok(())
    }

    fn clear(&self) -> Result<(), InfraError> {
        let mut guard = self.lock()?;
        let connection = self.connect()?;
        connection.execute("DELETE FROM offline_sessions", [])?;
        *guard = Some(Vec::new());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOfflineHistoryStore {
    sessions: Mutex<Vec<Session>>,
}

impl InMemoryOfflineHistoryStore {
    fn lock(&self) -> Result<MutexGuard<'_, Vec<Session>>, InfraError> {
        self.sessions
            .lock()
            .map_err(|error| InfraError::Storage(format!("offline history lock poisoned: {error}")))
    }
}

impl OfflineHistoryStore for InMemoryOfflineHistoryStore {
    fn stage(&self, session: &Session) -> Result<(), InfraError> {
        self.lock()?.push(session.clone());
        Ok(())
    }

    fn persist_staged(&self) -> Result<usize, InfraError> {
        Ok(0)
    }

    fn load_all(&self) -> Result<Vec<Session>, InfraError> {
        Ok(self.lock()?.clone())
    }

    fn acknowledge(&self, count: usize) -> Result<(), InfraError> {
        let mut sessions = self.lock()?;
        let count = count.min(sessions.len());
        sessions.drain(..count);
        Ok(())
    }

    fn clear(&self) -> Result<(), InfraError> {
        self.lock()?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::DayZone;
    use crate::infrastructure::storage::initialize_database;
    use chrono_tz::Tz;
    use std::fs;

    struct TempDatabase {
        dir: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "pomoremote-offline-history-tests-{}-{}",
                std::process::id(),
                name
            ));
            fs::create_dir_all(&dir).expect("create temp dir");
            let path = dir.join("history.sqlite");
            initialize_database(&path).expect("initialize database");
            Self { dir, path }
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn work_session(start: DateTime<Utc>, completed: bool) -> Session {
        Session {
            phase: Phase::Work,
            start: start.timestamp(),
            duration: 1500,
            completed,
        }
    }

    #[test]
    fn sessions_survive_reopen_in_insertion_order() {
        let database = TempDatabase::new("reopen");
        let store = SqliteOfflineHistoryStore::new(&database.path);
        let first = work_session(fixed_time("2024-01-02T09:00:00Z"), true);
        let second = Session {
            phase: Phase::Short,
            start: first.start + 1500,
            duration: 300,
            completed: true,
        };
        store.append(&first).expect("append first");
        store.append(&second).expect("append second");

        let reopened = SqliteOfflineHistoryStore::new(&database.path);
        assert_eq!(reopened.load_all().expect("load"), vec![first, second]);
    }

    #[test]
    fn acknowledge_keeps_sessions_appended_after_snapshot() {
        let database = TempDatabase::new("acknowledge");
        let store = SqliteOfflineHistoryStore::new(&database.path);
        let flushed = work_session(fixed_time("2024-01-02T09:00:00Z"), true);
        store.append(&flushed).expect("append flushed");

        let snapshot = store.load_all().expect("snapshot");
        let late = work_session(fixed_time("2024-01-02T10:00:00Z"), true);
        store.append(&late).expect("append during upload");
        store.acknowledge(snapshot.len()).expect("acknowledge");

        assert_eq!(store.load_all().expect("load"), vec![late.clone()]);
        let reopened = SqliteOfflineHistoryStore::new(&database.path);
        assert_eq!(reopened.load_all().expect("reload"), vec![late]);
    }

    #[test]
    fn staged_sessions_are_readable_before_they_reach_disk() {
        let database = TempDatabase::new("staged");
        let store = SqliteOfflineHistoryStore::new(&database.path);
        let clock = DayClock::new(4, DayZone::Named(Tz::UTC));
        let now = fixed_time("2024-01-02T10:00:00Z");
        let session = work_session(fixed_time("2024-01-02T09:00:00Z"), true);

        store.stage(&session).expect("stage");
        assert_eq!(store.load_all().expect("load"), vec![session.clone()]);
        assert_eq!(store.count_completed_today(&clock, now).expect("count"), 1);
        assert!(SqliteOfflineHistoryStore::new(&database.path).load_all().expect("reload").is_empty());

        assert_eq!(store.persist_staged().expect("persist"), 1);
        assert_eq!(store.persist_staged().expect("nothing left"), 0);
        assert_eq!(
            SqliteOfflineHistoryStore::new(&database.path).load_all().expect("reload"),
            vec![session]
        );
    }

    #[test]
    fn acknowledge_after_persist_removes_rows_from_disk() {
        let database = TempDatabase::new("acknowledge-staged");
        let store = SqliteOfflineHistoryStore::new(&database.path);
        let first = work_session(fixed_time("2024-01-02T09:00:00Z"), true);
        let second = work_session(fixed_time("2024-01-02T09:30:00Z"), true);
        store.stage(&first).expect("stage first");
        store.stage(&second).expect("stage second");
        store.persist_staged().expect("persist");

        store.acknowledge(1).expect("acknowledge");

        assert_eq!(store.load_all().expect("load"), vec![second.clone()]);
        assert_eq!(
            SqliteOfflineHistoryStore::new(&database.path).load_all().expect("reload"),
            vec![second]
        );
    }

    #[test]
    fn poisoned_lock_is_a_storage_error() {
        let store = std::sync::Arc::new(InMemoryOfflineHistoryStore::default());
        let poisoner = std::sync::Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.sessions.lock().expect("first lock");
            panic!("poison the history lock");
        })
        .join();

        let error = store
            .stage(&work_session(fixed_time("2024-01-02T09:00:00Z"), true))
            .expect_err("poisoned lock");
        assert!(matches!(error, InfraError::Storage(_)), "unexpected error {error:?}");
        assert!(!error.is_network());
    }

    #[test]
    fn clear_removes_everything() {
        let database = TempDatabase::new("clear");
        let store = SqliteOfflineHistoryStore::new(&database.path);
        store
            .append(&work_session(fixed_time("2024-01-02T09:00:00Z"), true))
            .expect("append");
        store.clear().expect("clear");

        assert!(store.load_all().expect("load").is_empty());
        assert!(SqliteOfflineHistoryStore::new(&database.path).load_all().expect("reload").is_empty());
    }

    #[test]
    fn missing_database_reads_as_empty_history() {
        let store = SqliteOfflineHistoryStore::new(
            std::env::temp_dir().join("pomoremote-missing-dir-for-tests/nope/history.sqlite"),
        );
        assert!(store.load_all().expect("load falls back").is_empty());
    }

    #[test]
    fn count_completed_today_respects_day_start_hour() {
        let store = InMemoryOfflineHistoryStore::default();
        let clock = DayClock::new(4, DayZone::Named(Tz::UTC));
        let now = fixed_time("2024-01-02T10:00:00Z");

        store
            .append(&work_session(fixed_time("2024-01-02T03:00:00Z"), true))
            .expect("before day start");
        store
            .append(&work_session(fixed_time("2024-01-02T05:00:00Z"), true))
            .expect("after day start");
        store
            .append(&work_session(fixed_time("2024-01-02T06:00:00Z"), false))
            .expect("abandoned");
        store
            .append(&Session {
                phase: Phase::Short,
                start: fixed_time("2024-01-02T07:00:00Z").timestamp(),
                duration: 300,
                completed: true,
            })
            .expect("break");

        assert_eq!(store.count_completed_today(&clock, now).expect("count"), 1);
    }

    #[test]
    fn in_memory_acknowledge_saturates() {
        let store = InMemoryOfflineHistoryStore::default();
        store
            .append(&work_session(fixed_time("2024-01-02T09:00:00Z"), true))
            .expect("append");
        store.acknowledge(5).expect("acknowledge more than queued");
        assert!(store.load_all().expect("load").is_empty());
    }
}
