use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::StoreError;
use crate::model::{Answer, ExamId, QuestionId, SessionId};
use crate::util::lock;

pub type Result<T> = std::result::Result<T, StoreError>;

/// The four values kept per exam between page loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreKey {
    StartedAt,
    Answers,
    Flags,
    SessionId,
}

impl StoreKey {
    pub const ALL: [StoreKey; 4] = [
        StoreKey::StartedAt,
        StoreKey::Answers,
        StoreKey::Flags,
        StoreKey::SessionId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreKey::StartedAt => "start",
            StoreKey::Answers => "answers",
            StoreKey::Flags => "flagged",
            StoreKey::SessionId => "session",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        StoreKey::ALL.into_iter().find(|k| k.as_str() == raw)
    }
}

/// Raw string storage scoped by exam id.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, exam: &ExamId, key: StoreKey) -> Result<Option<String>>;
    fn put(&self, exam: &ExamId, key: StoreKey, value: &str) -> Result<()>;
    fn remove_all(&self, exam: &ExamId) -> Result<()>;
    fn keys(&self, exam: &ExamId) -> Result<Vec<StoreKey>>;
}

/// In-process store, for tests and hosts without a disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(ExamId, StoreKey), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, exam: &ExamId, key: StoreKey) -> Result<Option<String>> {
        Ok(lock(&self.entries).get(&(exam.clone(), key)).cloned())
    }

    fn put(&self, exam: &ExamId, key: StoreKey, value: &str) -> Result<()> {
        lock(&self.entries).insert((exam.clone(), key), value.to_string());
        Ok(())
    }

    fn remove_all(&self, exam: &ExamId) -> Result<()> {
        lock(&self.entries).retain(|(e, _), _| e != exam);
        Ok(())
    }

    fn keys(&self, exam: &ExamId) -> Result<Vec<StoreKey>> {
        let mut keys: Vec<StoreKey> = lock(&self.entries)
            .keys()
            .filter(|(e, _)| e == exam)
            .map(|(_, k)| *k)
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// SQLite-backed store that survives process restarts.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and its table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS attempt_state (
                exam_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (exam_id, key)
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, exam: &ExamId, key: StoreKey) -> Result<Option<String>> {
        let conn = lock(&self.conn);
        let value = conn
            .query_row(
                "SELECT value FROM attempt_state WHERE exam_id = ?1 AND key = ?2",
                params![exam.as_str(), key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, exam: &ExamId, key: StoreKey, value: &str) -> Result<()> {
        lock(&self.conn).execute(
            r#"
            INSERT INTO attempt_state (exam_id, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(exam_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![exam.as_str(), key.as_str(), value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove_all(&self, exam: &ExamId) -> Result<()> {
        lock(&self.conn).execute(
            "DELETE FROM attempt_state WHERE exam_id = ?1",
            params![exam.as_str()],
        )?;
        Ok(())
    }

    fn keys(&self, exam: &ExamId) -> Result<Vec<StoreKey>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare("SELECT key FROM attempt_state WHERE exam_id = ?1")?;
        let rows = stmt.query_map(params![exam.as_str()], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for row in rows {
            if let Some(key) = StoreKey::parse(&row?) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Everything persisted for one exam, as read back at `begin()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedAttempt {
    pub started_at_ms: Option<i64>,
    pub answers: BTreeMap<QuestionId, Answer>,
    pub flags: BTreeMap<QuestionId, bool>,
    pub session_id: Option<SessionId>,
}

impl PersistedAttempt {
    pub fn is_empty(&self) -> bool {
        self.started_at_ms.is_none()
            && self.answers.is_empty()
            && self.flags.is_empty()
            && self.session_id.is_none()
    }
}

/// Typed view over a [`KeyValueStore`]; values are JSON encoded.
#[derive(Clone)]
pub struct AttemptStore {
    backend: Arc<dyn KeyValueStore>,
}

impl AttemptStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Read the attempt. Values that no longer decode (a crashed tab, an
    /// older format) are dropped with a warning rather than failing the load.
    pub fn load(&self, exam: &ExamId) -> Result<PersistedAttempt> {
        Ok(PersistedAttempt {
            started_at_ms: self.read(exam, StoreKey::StartedAt)?,
            answers: self.read(exam, StoreKey::Answers)?.unwrap_or_default(),
            flags: self.read(exam, StoreKey::Flags)?.unwrap_or_default(),
            session_id: self.read(exam, StoreKey::SessionId)?,
        })
    }

    fn read<T: DeserializeOwned>(&self, exam: &ExamId, key: StoreKey) -> Result<Option<T>> {
        let Some(raw) = self.backend.get(exam, key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(exam_id = %exam, key = key.as_str(), "discarding unreadable stored value: {e}");
                Ok(None)
            }
        }
    }

    pub fn save_started_at(&self, exam: &ExamId, started_at_ms: i64) -> Result<()> {
        self.backend
            .put(exam, StoreKey::StartedAt, &serde_json::to_string(&started_at_ms)?)
    }

    pub fn save_answers(&self, exam: &ExamId, answers: &BTreeMap<QuestionId, Answer>) -> Result<()> {
        self.backend
            .put(exam, StoreKey::Answers, &serde_json::to_string(answers)?)
    }

    pub fn save_flags(&self, exam: &ExamId, flags: &BTreeMap<QuestionId, bool>) -> Result<()> {
        self.backend
            .put(exam, StoreKey::Flags, &serde_json::to_string(flags)?)
    }

    pub fn save_session_id(&self, exam: &ExamId, session_id: &SessionId) -> Result<()> {
        self.backend
            .put(exam, StoreKey::SessionId, &serde_json::to_string(session_id)?)
    }

    pub fn erase(&self, exam: &ExamId) -> Result<()> {
        self.backend.remove_all(exam)
    }

    pub fn present_keys(&self, exam: &ExamId) -> Result<Vec<StoreKey>> {
        self.backend.keys(exam)
    }
}
