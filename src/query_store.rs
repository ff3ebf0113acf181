// Query store
//
// Thread-safe TTL map of query records. The in-memory map is the default;
// the persistence hook lets a subclass-equivalent mirror state to durable
// storage without changing callers.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{ColumnDto, QueryResultDto, QueryStatus, RowDto};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredQuery {
    pub query_id: String,
    pub project_id: String,
    pub status: QueryStatus,
    pub sql: Option<String>,
    pub columns: Option<Vec<ColumnDto>>,
    pub rows: Option<Vec<RowDto>>,
    pub warnings: Option<Vec<String>>,
    pub total_pages: Option<u32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Echo of the normalized request inputs.
    pub request_payload: Option<serde_json::Value>,
}

impl StoredQuery {
    pub fn new(query_id: impl Into<String>, project_id: impl Into<String>, status: QueryStatus) -> Self {
        Self {
            query_id: query_id.into(),
            project_id: project_id.into(),
            status,
            sql: None,
            columns: None,
            rows: None,
            warnings: None,
            total_pages: None,
            error: None,
            created_at: Utc::now(),
            request_payload: None,
        }
    }

    pub fn to_result(&self) -> QueryResultDto {
        QueryResultDto {
            status: self.status,
            sql: self.sql.clone(),
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            warnings: self.warnings.clone(),
            total_pages: self.total_pages,
            error: self.error.clone(),
        }
    }
}

/// Mirror hook for durable backends. The default in-memory store installs
/// the no-op implementation.
pub trait QueryPersistence: Send + Sync {
    fn persist(&self, stored: &StoredQuery);
    fn remove(&self, query_id: &str);
}

pub struct NoopQueryPersistence;

impl QueryPersistence for NoopQueryPersistence {
    fn persist(&self, _stored: &StoredQuery) {}
    fn remove(&self, _query_id: &str) {}
}

pub struct QueryStore {
    ttl: Duration,
    items: Mutex<HashMap<String, StoredQuery>>,
    persistence: Box<dyn QueryPersistence>,
}

impl QueryStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_persistence(ttl, Box::new(NoopQueryPersistence))
    }

    pub fn with_persistence(ttl: Duration, persistence: Box<dyn QueryPersistence>) -> Self {
        Self {
            ttl,
            items: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    fn is_expired(&self, stored: &StoredQuery) -> bool {
        let age = Utc::now().signed_duration_since(stored.created_at);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age > ttl,
            Err(_) => false,
        }
    }

    /// Fetch a record. `(None, true)` means the record expired on this read
    /// and was evicted; the next read reports a plain miss.
    pub fn get(&self, query_id: &str) -> (Option<StoredQuery>, bool) {
        let mut items = self.items.lock();
        let Some(stored) = items.get(query_id) else {
            return (None, false);
        };
        if self.is_expired(stored) {
            items.remove(query_id);
            self.persistence.remove(query_id);
            return (None, true);
        }
        (Some(stored.clone()), false)
    }

    pub fn set(&self, stored: StoredQuery) {
        let mut items = self.items.lock();
        self.persistence.persist(&stored);
        items.insert(stored.query_id.clone(), stored);
    }

    /// Apply arbitrary field changes atomically.
    pub fn update(
        &self,
        query_id: &str,
        apply: impl FnOnce(&mut StoredQuery),
    ) -> Option<StoredQuery> {
        let mut items = self.items.lock();
        let stored = items.get_mut(query_id)?;
        apply(stored);
        self.persistence.persist(stored);
        Some(stored.clone())
    }

    pub fn delete(&self, query_id: &str) {
        let mut items = self.items.lock();
        items.remove(query_id);
        self.persistence.remove(query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_with_ttl(seconds: u64) -> QueryStore {
        QueryStore::new(Duration::from_secs(seconds))
    }

    #[test]
    fn set_get_round_trip() {
        let store = store_with_ttl(60);
        store.set(StoredQuery::new("q1", "p1", QueryStatus::Pending));
        let (stored, expired) = store.get("q1");
        assert!(!expired);
        assert_eq!(stored.unwrap().status, QueryStatus::Pending);
    }

    #[test]
    fn missing_record_is_a_plain_miss() {
        let store = store_with_ttl(60);
        assert_eq!(store.get("ghost"), (None, false));
    }

    #[test]
    fn update_applies_changes_atomically() {
        let store = store_with_ttl(60);
        store.set(StoredQuery::new("q1", "p1", QueryStatus::Running));
        let updated = store
            .update("q1", |stored| {
                stored.status = QueryStatus::Successful;
                stored.sql = Some("SELECT 1".to_string());
                stored.total_pages = Some(1);
            })
            .unwrap();
        assert_eq!(updated.status, QueryStatus::Successful);
        assert_eq!(updated.sql.as_deref(), Some("SELECT 1"));
        assert!(store.update("ghost", |_| {}).is_none());
    }

    #[test]
    fn expired_read_evicts_then_misses() {
        let store = store_with_ttl(0);
        let mut stored = StoredQuery::new("q1", "p1", QueryStatus::Successful);
        stored.created_at = Utc::now() - chrono::Duration::seconds(2);
        store.set(stored);

        assert_eq!(store.get("q1"), (None, true));
        assert_eq!(store.get("q1"), (None, false));
    }

    #[test]
    fn record_exactly_at_ttl_boundary_is_not_expired() {
        let store = store_with_ttl(3_600);
        let mut stored = StoredQuery::new("q1", "p1", QueryStatus::Successful);
        // created_at == now - ttl: not yet expired, strict inequality
        stored.created_at = Utc::now() - chrono::Duration::seconds(3_600);
        assert!(!store.is_expired(&stored));
        stored.created_at = Utc::now() - chrono::Duration::seconds(3_602);
        assert!(store.is_expired(&stored));
    }

    #[test]
    fn delete_removes_record() {
        let store = store_with_ttl(60);
        store.set(StoredQuery::new("q1", "p1", QueryStatus::Pending));
        store.delete("q1");
        assert_eq!(store.get("q1"), (None, false));
    }

    #[test]
    fn persistence_hook_observes_writes() {
        use parking_lot::Mutex as PMutex;
        use std::sync::Arc;

        #[derive(Default)]
        struct Recording {
            persisted: PMutex<Vec<String>>,
            removed: PMutex<Vec<String>>,
        }
        impl QueryPersistence for Arc<Recording> {
            fn persist(&self, stored: &StoredQuery) {
                self.persisted.lock().push(stored.query_id.clone());
            }
            fn remove(&self, query_id: &str) {
                self.removed.lock().push(query_id.to_string());
            }
        }

        let recording = Arc::new(Recording::default());
        let store =
            QueryStore::with_persistence(Duration::from_secs(60), Box::new(recording.clone()));
        store.set(StoredQuery::new("q1", "p1", QueryStatus::Pending));
        store.update("q1", |stored| stored.status = QueryStatus::Running);
        store.delete("q1");
        assert_eq!(recording.persisted.lock().len(), 2);
        assert_eq!(recording.removed.lock().as_slice(), &["q1".to_string()]);
    }
}
