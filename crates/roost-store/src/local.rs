//! Local authoritative vault.
//!
//! One row per credential record, keyed by `(session_id, category, key_id)`.
//! Payloads arrive already sealed; this layer only moves opaque blobs in and
//! out of SQLite. Reads here are the hot path for session bring-up, which is
//! why the local vault is authoritative and the remote vault is only a
//! mirror.

use chrono::Utc;
use tracing::instrument;

use roost_core::{RecordKey, SessionId};

use crate::database::Database;
use crate::error::VaultError;
use crate::row_helpers;

#[derive(Clone)]
pub struct LocalVault {
    db: Database,
}

impl LocalVault {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or overwrite one sealed payload.
    #[instrument(skip(self, payload), fields(session_id = %session_id, key = %key))]
    pub fn put(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
        payload: &str,
    ) -> Result<(), VaultError> {
        let (category, key_id) = key.parts();
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO credentials (session_id, category, key_id, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id, category, key_id)
                 DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                rusqlite::params![session_id.as_str(), category, key_id, payload, now],
            )?;
            Ok(())
        })
    }

    /// Fetch one sealed payload, `None` when absent.
    #[instrument(skip(self), fields(session_id = %session_id, key = %key))]
    pub fn get(
        &self,
        session_id: &SessionId,
        key: &RecordKey,
    ) -> Result<Option<String>, VaultError> {
        let (category, key_id) = key.parts();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM credentials
                 WHERE session_id = ?1 AND category = ?2 AND key_id = ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), category, key_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_helpers::get(row, 0, "credentials", "payload")?)),
                None => Ok(None),
            }
        })
    }

    /// Delete one record. Returns whether a row existed.
    #[instrument(skip(self), fields(session_id = %session_id, key = %key))]
    pub fn delete(&self, session_id: &SessionId, key: &RecordKey) -> Result<bool, VaultError> {
        let (category, key_id) = key.parts();
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM credentials
                 WHERE session_id = ?1 AND category = ?2 AND key_id = ?3",
                rusqlite::params![session_id.as_str(), category, key_id],
            )?;
            Ok(deleted > 0)
        })
    }

    /// Key ids present in one category, ordered for stable iteration.
    #[instrument(skip(self), fields(session_id = %session_id, category = category))]
    pub fn list_ids(
        &self,
        session_id: &SessionId,
        category: &str,
    ) -> Result<Vec<String>, VaultError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key_id FROM credentials
                 WHERE session_id = ?1 AND category = ?2 ORDER BY key_id",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), category])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row_helpers::get(row, 0, "credentials", "key_id")?);
            }
            Ok(ids)
        })
    }

    /// Every record key stored for one session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_keys(&self, session_id: &SessionId) -> Result<Vec<RecordKey>, VaultError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT category, key_id FROM credentials
                 WHERE session_id = ?1 ORDER BY category, key_id",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut keys = Vec::new();
            while let Some(row) = rows.next()? {
                let category: String = row_helpers::get(row, 0, "credentials", "category")?;
                let key_id: String = row_helpers::get(row, 1, "credentials", "key_id")?;
                keys.push(RecordKey::from_parts(&category, &key_id));
            }
            Ok(keys)
        })
    }

    /// Delete everything one session stored. Returns the row count removed.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn wipe_session(&self, session_id: &SessionId) -> Result<u64, VaultError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM credentials WHERE session_id = ?1",
                [session_id.as_str()],
            )?;
            Ok(deleted as u64)
        })
    }

    /// Sessions with at least one stored record.
    #[instrument(skip(self))]
    pub fn known_sessions(&self) -> Result<Vec<SessionId>, VaultError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT session_id FROM credentials ORDER BY session_id",
            )?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "credentials", "session_id")?;
                sessions.push(SessionId::from_raw(raw));
            }
            Ok(sessions)
        })
    }

    /// Whether the vault holds no records at all. Drives the pull-if-empty
    /// decision at startup.
    pub fn is_empty(&self) -> Result<bool, VaultError> {
        self.db.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
            Ok(count == 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::TenantId;

    fn setup() -> LocalVault {
        LocalVault::new(Database::in_memory().unwrap())
    }

    fn session(tenant: &str) -> SessionId {
        SessionId::for_tenant(&TenantId::from_raw(tenant))
    }

    #[test]
    fn put_get_roundtrip() {
        let vault = setup();
        let sid = session("t1");
        vault.put(&sid, &RecordKey::Primary, "sealed-blob").unwrap();
        assert_eq!(
            vault.get(&sid, &RecordKey::Primary).unwrap().as_deref(),
            Some("sealed-blob")
        );
    }

    #[test]
    fn get_missing_returns_none() {
        let vault = setup();
        let sid = session("t1");
        assert!(vault.get(&sid, &RecordKey::Primary).unwrap().is_none());
    }

    #[test]
    fn put_overwrites_existing() {
        let vault = setup();
        let sid = session("t1");
        let key = RecordKey::keyed("pre_key", "25");
        vault.put(&sid, &key, "v1").unwrap();
        vault.put(&sid, &key, "v2").unwrap();
        assert_eq!(vault.get(&sid, &key).unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn delete_reports_existence() {
        let vault = setup();
        let sid = session("t1");
        let key = RecordKey::keyed("pre_key", "1");
        assert!(!vault.delete(&sid, &key).unwrap());
        vault.put(&sid, &key, "v").unwrap();
        assert!(vault.delete(&sid, &key).unwrap());
        assert!(vault.get(&sid, &key).unwrap().is_none());
    }

    #[test]
    fn list_ids_filters_by_category() {
        let vault = setup();
        let sid = session("t1");
        vault.put(&sid, &RecordKey::keyed("pre_key", "2"), "a").unwrap();
        vault.put(&sid, &RecordKey::keyed("pre_key", "1"), "b").unwrap();
        vault.put(&sid, &RecordKey::keyed("session", "peer"), "c").unwrap();

        let ids = vault.list_ids(&sid, "pre_key").unwrap();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn list_keys_covers_all_categories() {
        let vault = setup();
        let sid = session("t1");
        vault.put(&sid, &RecordKey::Primary, "p").unwrap();
        vault.put(&sid, &RecordKey::keyed("pre_key", "1"), "a").unwrap();

        let keys = vault.list_keys(&sid).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&RecordKey::Primary));
        assert!(keys.contains(&RecordKey::keyed("pre_key", "1")));
    }

    #[test]
    fn sessions_are_isolated() {
        let vault = setup();
        let a = session("alpha");
        let b = session("beta");
        vault.put(&a, &RecordKey::Primary, "a").unwrap();
        vault.put(&b, &RecordKey::Primary, "b").unwrap();

        assert_eq!(vault.get(&a, &RecordKey::Primary).unwrap().as_deref(), Some("a"));
        assert_eq!(vault.get(&b, &RecordKey::Primary).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn wipe_session_removes_only_that_session() {
        let vault = setup();
        let a = session("alpha");
        let b = session("beta");
        vault.put(&a, &RecordKey::Primary, "a").unwrap();
        vault.put(&a, &RecordKey::keyed("pre_key", "1"), "a1").unwrap();
        vault.put(&b, &RecordKey::Primary, "b").unwrap();

        let removed = vault.wipe_session(&a).unwrap();
        assert_eq!(removed, 2);
        assert!(vault.get(&a, &RecordKey::Primary).unwrap().is_none());
        assert!(vault.get(&b, &RecordKey::Primary).unwrap().is_some());
    }

    #[test]
    fn known_sessions_deduplicates() {
        let vault = setup();
        let sid = session("t1");
        vault.put(&sid, &RecordKey::Primary, "p").unwrap();
        vault.put(&sid, &RecordKey::keyed("pre_key", "1"), "a").unwrap();

        let sessions = vault.known_sessions().unwrap();
        assert_eq!(sessions, vec![sid]);
    }

    #[test]
    fn is_empty_reflects_contents() {
        let vault = setup();
        assert!(vault.is_empty().unwrap());
        vault
            .put(&session("t1"), &RecordKey::Primary, "p")
            .unwrap();
        assert!(!vault.is_empty().unwrap());
    }
}
