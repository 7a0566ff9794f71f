//! In-process session store.

use crate::core::SessionRecord;
use crate::store::{FieldMap, MeasurementDocument, SessionStore, StoreError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Keeps every document in memory. Used by tests, demos, and the
/// `replay` command when nothing should hit the disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Vec<SessionRecord>>>,
    measurements: RwLock<HashMap<String, MeasurementDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored sessions for a user, in insertion order.
    pub fn sessions_for(&self, user_id: &str) -> Vec<SessionRecord> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl SessionStore for MemoryStore {
    fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let list = sessions.entry(record.user_id.clone()).or_default();
        match list.iter_mut().find(|r| r.session_id == record.session_id) {
            Some(existing) => *existing = record.clone(),
            None => list.push(record.clone()),
        }
        Ok(())
    }

    fn get_latest_session(&self, user_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        Ok(sessions
            .get(user_id)
            .and_then(|list| list.iter().max_by_key(|r| r.started_at))
            .cloned())
    }

    fn upsert_measurement_fields(
        &self,
        user_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let mut docs = self.measurements.write().unwrap_or_else(|e| e.into_inner());
        let mut doc = docs
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| MeasurementDocument::new(user_id));
        doc.apply_automatic(fields)?;
        docs.insert(user_id.to_string(), doc);
        Ok(())
    }

    fn set_manual_field(&self, user_id: &str, field: &str, value: Value) -> Result<(), StoreError> {
        let mut docs = self.measurements.write().unwrap_or_else(|e| e.into_inner());
        let mut doc = docs
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| MeasurementDocument::new(user_id));
        doc.apply_manual(field, value)?;
        docs.insert(user_id.to_string(), doc);
        Ok(())
    }

    fn get_measurements(&self, user_id: &str) -> Result<Option<MeasurementDocument>, StoreError> {
        let docs = self.measurements.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(user_id).cloned())
    }
}
