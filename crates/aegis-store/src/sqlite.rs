//! SQLite-backed persistence and evidence store.
//!
//! # Storage layout
//!
//! | table | columns |
//! |---|---|
//! | `profile` | `user_id` (PK), `safety_status`, `updated_at` |
//! | `keyword_enrollments` | `id`, `keyword`, `sample_hash`, `sample_url`, `created_at` |
//! | `evidence` | `id`, `session_id`, `category`, `recorded_at` |
//! | `session_summaries` | `session_id` (PK), `duration_seconds`, `evidence_counts` (JSON), `trigger_method`, `emergency_triggered`, `created_at` |
//!
//! Timestamps are RFC-3339 UTC strings.
//!
//! The inherent methods are synchronous.  The [`PersistenceBackend`] and
//! [`EvidenceStore`] impls run them on Tokio's blocking pool, so a slow disk
//! never stalls the runtime threads the controller and poller share.
//!
//! # Example
//!
//! ```rust
//! use aegis_store::SqliteStore;
//! use aegis_types::EvidenceCategory;
//!
//! let store = SqliteStore::open_in_memory("user-1").unwrap();
//! store.record_evidence("session_1", EvidenceCategory::Photo).unwrap();
//! let counts = store.evidence_counts("session_1").unwrap();
//! assert_eq!(counts[&EvidenceCategory::Photo], 1);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use aegis_middleware::{EvidenceStore, PersistenceBackend};
use aegis_types::{
    EvidenceCategory, EvidenceCounts, KeywordEnrollment, MonitoringSession, Profile, SafetyError,
    SafetyState, SessionSummary,
};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown safety status {0:?} in profile table")]
    UnknownStatus(String),
    #[error("Unknown evidence category {0:?}")]
    UnknownCategory(String),
}

impl From<StoreError> for SafetyError {
    fn from(e: StoreError) -> Self {
        SafetyError::Persistence(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteStore
// ─────────────────────────────────────────────────────────────────────────────

/// One database file holding everything the safety core persists for a
/// single user.  Clones share the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    user_id: String,
    profile: Arc<watch::Sender<Profile>>,
}

impl SqliteStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: &str, user_id: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?, user_id)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory(user_id: &str) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, user_id)
    }

    fn with_connection(conn: Connection, user_id: &str) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        conn.execute(
            "INSERT OR IGNORE INTO profile (user_id, safety_status, updated_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, SafetyState::Disabled.as_str(), Utc::now().to_rfc3339()],
        )?;
        let profile = read_profile(&conn, user_id)?;
        info!(user_id, status = %profile.safety_status, "profile store opened");

        let (profile, _) = watch::channel(profile);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            user_id: user_id.to_string(),
            profile: Arc::new(profile),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` against a clone of this store on the blocking pool.
    async fn off_thread<T, F>(&self, op: F) -> Result<T, SafetyError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| SafetyError::Persistence(format!("store task failed: {e}")))?
            .map_err(SafetyError::from)
    }

    pub fn load_profile(&self) -> Result<Profile, StoreError> {
        read_profile(&self.conn(), &self.user_id)
    }

    pub fn set_safety_status(&self, status: SafetyState) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE profile SET safety_status = ?1, updated_at = ?2 WHERE user_id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), self.user_id],
        )?;
        self.profile.send_modify(|p| p.safety_status = status);
        Ok(())
    }

    /// Append one item of evidence for `session_id`.
    pub fn record_evidence(
        &self,
        session_id: &str,
        category: EvidenceCategory,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO evidence (session_id, category, recorded_at) VALUES (?1, ?2, ?3)",
            params![session_id, category.as_str(), Utc::now().to_rfc3339()],
        )?;
        debug!(session_id, category = category.as_str(), "evidence recorded");
        Ok(())
    }

    /// Evidence counts for `session_id`; categories without rows are absent.
    pub fn evidence_counts(&self, session_id: &str) -> Result<EvidenceCounts, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM evidence
             WHERE session_id = ?1
             GROUP BY category",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut counts = EvidenceCounts::new();
        for row in rows {
            let (category, count) = row?;
            let category = EvidenceCategory::parse(&category)
                .ok_or(StoreError::UnknownCategory(category))?;
            counts.insert(category, count);
        }
        Ok(counts)
    }

    pub fn insert_enrollment(&self, record: &KeywordEnrollment) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO keyword_enrollments (keyword, sample_hash, sample_url, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.keyword,
                record.sample_hash,
                record.sample_url,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// The most recently saved enrollment, which is the one that arms the
    /// voice trigger.
    pub fn latest_enrollment(&self) -> Result<Option<KeywordEnrollment>, StoreError> {
        let record = self
            .conn()
            .query_row(
                "SELECT keyword, sample_hash, sample_url FROM keyword_enrollments
                 ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(KeywordEnrollment {
                        keyword: row.get(0)?,
                        sample_hash: row.get(1)?,
                        sample_url: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn insert_summary(&self, summary: &SessionSummary) -> Result<(), StoreError> {
        let counts = serde_json::to_string(&summary.evidence_counts)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO session_summaries
                 (session_id, duration_seconds, evidence_counts, trigger_method,
                  emergency_triggered, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                summary.session_id,
                summary.duration_seconds,
                counts,
                summary.trigger_method,
                summary.emergency_triggered,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All stored summaries, oldest first.
    pub fn summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT session_id, duration_seconds, evidence_counts, trigger_method,
                    emergency_triggered
             FROM session_summaries
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (session_id, duration_seconds, counts, trigger_method, emergency_triggered) = row?;
            summaries.push(SessionSummary {
                session_id,
                duration_seconds,
                evidence_counts: serde_json::from_str(&counts)?,
                trigger_method,
                emergency_triggered,
            });
        }
        Ok(summaries)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS profile (
            user_id       TEXT NOT NULL PRIMARY KEY,
            safety_status TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS keyword_enrollments (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            keyword     TEXT NOT NULL,
            sample_hash TEXT NOT NULL,
            sample_url  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS evidence (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL,
            category    TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS evidence_by_session ON evidence (session_id);
        CREATE TABLE IF NOT EXISTS session_summaries (
            session_id          TEXT NOT NULL PRIMARY KEY,
            duration_seconds    REAL NOT NULL,
            evidence_counts     TEXT NOT NULL,
            trigger_method      TEXT NOT NULL,
            emergency_triggered INTEGER NOT NULL,
            created_at          TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn read_profile(conn: &Connection, user_id: &str) -> Result<Profile, StoreError> {
    let status: String = conn.query_row(
        "SELECT safety_status FROM profile WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    let safety_status =
        SafetyState::parse(&status).ok_or(StoreError::UnknownStatus(status))?;
    Ok(Profile {
        user_id: user_id.to_string(),
        safety_status,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator impls
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl PersistenceBackend for SqliteStore {
    async fn update_safety_status(&self, status: SafetyState) -> Result<(), SafetyError> {
        self.off_thread(move |store| store.set_safety_status(status))
            .await
    }

    fn observe_user_profile(&self) -> BoxStream<'static, Profile> {
        let rx = self.profile.subscribe();
        stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let profile = rx.borrow_and_update().clone();
            Some((profile, (rx, false)))
        })
        .boxed()
    }

    async fn save_keyword_enrollment(&self, record: &KeywordEnrollment) -> Result<(), SafetyError> {
        let record = record.clone();
        self.off_thread(move |store| store.insert_enrollment(&record))
            .await
    }
}

#[async_trait]
impl EvidenceStore for SqliteStore {
    async fn counts_for_session(&self, session_id: &str) -> Result<EvidenceCounts, SafetyError> {
        let session_id = session_id.to_string();
        self.off_thread(move |store| store.evidence_counts(&session_id))
            .await
    }

    async fn create_session_summary(
        &self,
        session: &MonitoringSession,
    ) -> Result<SessionSummary, SafetyError> {
        let session = session.clone();
        let summary = self
            .off_thread(move |store| {
                let counts = store.evidence_counts(&session.session_id)?;
                let summary = session.with_evidence_counts(counts).summary(Utc::now());
                store.insert_summary(&summary)?;
                Ok(summary)
            })
            .await?;
        info!(
            session_id = %summary.session_id,
            duration_secs = summary.duration_seconds,
            "session summary stored"
        );
        Ok(summary)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(id: &str) -> MonitoringSession {
        MonitoringSession {
            session_id: id.to_string(),
            start_time: Utc::now() - Duration::seconds(30),
            evidence_counts: EvidenceCounts::new(),
            trigger_method: "manual".to_string(),
            emergency_triggered: true,
            emergency_time: Some(Utc::now()),
            active_capabilities: vec!["Voice Evidence".to_string()],
            missing_capabilities: vec![],
        }
    }

    #[test]
    fn new_profile_starts_disabled() {
        let store = SqliteStore::open_in_memory("user-1").unwrap();
        let profile = store.load_profile().unwrap();
        assert_eq!(profile.user_id, "user-1");
        assert_eq!(profile.safety_status, SafetyState::Disabled);
    }

    #[test]
    fn status_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aegis.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteStore::open(path, "user-1").unwrap();
            store.set_safety_status(SafetyState::Emergency).unwrap();
        }
        let reopened = SqliteStore::open(path, "user-1").unwrap();
        assert_eq!(
            reopened.load_profile().unwrap().safety_status,
            SafetyState::Emergency
        );
    }

    #[test]
    fn evidence_counts_group_by_category_and_session() {
        let store = SqliteStore::open_in_memory("user-1").unwrap();
        store.record_evidence("s1", EvidenceCategory::Location).unwrap();
        store.record_evidence("s1", EvidenceCategory::Location).unwrap();
        store.record_evidence("s1", EvidenceCategory::Audio).unwrap();
        store.record_evidence("s2", EvidenceCategory::Photo).unwrap();

        let counts = store.evidence_counts("s1").unwrap();
        assert_eq!(counts.get(&EvidenceCategory::Location), Some(&2));
        assert_eq!(counts.get(&EvidenceCategory::Audio), Some(&1));
        assert_eq!(counts.get(&EvidenceCategory::Photo), None);
        assert!(store.evidence_counts("missing").unwrap().is_empty());
    }

    #[test]
    fn latest_enrollment_wins() {
        let store = SqliteStore::open_in_memory("user-1").unwrap();
        assert_eq!(store.latest_enrollment().unwrap(), None);

        for keyword in ["Phoenix", "Guardian"] {
            store
                .insert_enrollment(&KeywordEnrollment {
                    keyword: keyword.into(),
                    sample_hash: "h".into(),
                    sample_url: "u".into(),
                })
                .unwrap();
        }
        assert_eq!(store.latest_enrollment().unwrap().unwrap().keyword, "Guardian");
    }

    #[tokio::test]
    async fn summary_uses_stored_evidence() {
        let store = SqliteStore::open_in_memory("user-1").unwrap();
        store.record_evidence("s1", EvidenceCategory::Photo).unwrap();

        let summary = store.create_session_summary(&session("s1")).await.unwrap();
        assert_eq!(summary.evidence_counts.get(&EvidenceCategory::Photo), Some(&1));
        assert!(summary.emergency_triggered);
        assert!(summary.duration_seconds >= 30.0);

        let stored = store.summaries().unwrap();
        assert_eq!(stored, vec![summary]);
    }

    #[tokio::test]
    async fn profile_stream_follows_status_writes() {
        let store = SqliteStore::open_in_memory("user-1").unwrap();
        let mut profiles = store.observe_user_profile();
        assert_eq!(
            profiles.next().await.unwrap().safety_status,
            SafetyState::Disabled
        );

        store.update_safety_status(SafetyState::Active).await.unwrap();
        assert_eq!(
            profiles.next().await.unwrap().safety_status,
            SafetyState::Active
        );
    }

    #[tokio::test]
    async fn queries_leave_the_runtime_thread_free() {
        let store = SqliteStore::open_in_memory("user-1").unwrap();
        store.record_evidence("s1", EvidenceCategory::Audio).unwrap();

        // With the connection held here, a query running on the single
        // runtime thread would never let this test resume.
        let held = store.conn();
        let query = tokio::spawn({
            let store = store.clone();
            async move { store.counts_for_session("s1").await }
        });
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert!(!query.is_finished());

        drop(held);
        let counts = query.await.unwrap().unwrap();
        assert_eq!(counts.get(&EvidenceCategory::Audio), Some(&1));
    }

    #[test]
    fn store_error_maps_to_persistence() {
        let err: SafetyError = StoreError::UnknownStatus("armed".into()).into();
        assert!(matches!(err, SafetyError::Persistence(msg) if msg.contains("armed")));
    }
}
