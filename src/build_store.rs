// Build store
//
// Thread-safe map of build records with the same persistence-hook shape as
// the query store. Build records are never expired; they live for the
// process unless explicitly deleted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::BuildStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub build_id: String,
    pub project_id: String,
    pub status: BuildStatus,
    pub git_ref: Option<String>,
    pub commit: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Tail of the compile stdout/stderr, bounded by the manager.
    pub log_tail: Option<String>,
}

impl BuildRecord {
    pub fn pending(build_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            project_id: project_id.into(),
            status: BuildStatus::Pending,
            git_ref: None,
            commit: None,
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            log_tail: None,
        }
    }
}

pub trait BuildPersistence: Send + Sync {
    fn persist(&self, record: &BuildRecord);
    fn remove(&self, build_id: &str);
}

pub struct NoopBuildPersistence;

impl BuildPersistence for NoopBuildPersistence {
    fn persist(&self, _record: &BuildRecord) {}
    fn remove(&self, _build_id: &str) {}
}

pub struct BuildStore {
    items: Mutex<HashMap<String, BuildRecord>>,
    persistence: Box<dyn BuildPersistence>,
}

impl Default for BuildStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildStore {
    pub fn new() -> Self {
        Self::with_persistence(Box::new(NoopBuildPersistence))
    }

    pub fn with_persistence(persistence: Box<dyn BuildPersistence>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    pub fn set(&self, record: BuildRecord) {
        let mut items = self.items.lock();
        self.persistence.persist(&record);
        items.insert(record.build_id.clone(), record);
    }

    pub fn update(
        &self,
        build_id: &str,
        apply: impl FnOnce(&mut BuildRecord),
    ) -> Option<BuildRecord> {
        let mut items = self.items.lock();
        let record = items.get_mut(build_id)?;
        apply(record);
        self.persistence.persist(record);
        Some(record.clone())
    }

    pub fn get(&self, build_id: &str) -> Option<BuildRecord> {
        self.items.lock().get(build_id).cloned()
    }

    pub fn delete(&self, build_id: &str) {
        let mut items = self.items.lock();
        items.remove(build_id);
        self.persistence.remove(build_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pending_record_starts_clean() {
        let record = BuildRecord::pending("b1", "p1");
        assert_eq!(record.status, BuildStatus::Pending);
        assert!(record.started_at.is_none());
        assert!(record.errors.is_empty());
    }

    #[test]
    fn set_update_get_round_trip() {
        let store = BuildStore::new();
        store.set(BuildRecord::pending("b1", "p1"));
        store.update("b1", |record| {
            record.status = BuildStatus::Running;
            record.started_at = Some(Utc::now());
        });
        let record = store.get("b1").unwrap();
        assert_eq!(record.status, BuildStatus::Running);
        assert!(record.started_at.is_some());
        assert!(store.get("ghost").is_none());
    }

    #[test]
    fn delete_removes_record() {
        let store = BuildStore::new();
        store.set(BuildRecord::pending("b1", "p1"));
        store.delete("b1");
        assert!(store.get("b1").is_none());
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = BuildRecord::pending("b1", "p1");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["buildId"], "b1");
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["logTail"], serde_json::Value::Null);
    }
}
