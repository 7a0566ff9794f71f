//! File-backed session store: one JSON document per session and per user.
//!
//! Layout under the root directory:
//!
//! ```text
//! sessions/<user_id>/<session_id>.json
//! measurements/<user_id>.json
//! ```
//!
//! Each write goes to a temporary file that is renamed over the target,
//! so readers never observe a half-written document.

use crate::core::SessionRecord;
use crate::store::{FieldMap, MeasurementDocument, SessionStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Document store on the local filesystem.
#[derive(Debug)]
pub struct JsonFileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on measurement documents
    measurements_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("sessions"))?;
        std::fs::create_dir_all(root.join("measurements"))?;
        Ok(Self {
            root,
            measurements_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_sessions_dir(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join("sessions").join(path_component(user_id)?))
    }

    fn measurements_path(&self, user_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join("measurements")
            .join(format!("{}.json", path_component(user_id)?)))
    }

    fn read_measurements(&self, path: &Path) -> Result<Option<MeasurementDocument>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn update_measurements<F>(&self, user_id: &str, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut MeasurementDocument) -> Result<(), StoreError>,
    {
        let _lock = self
            .measurements_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let path = self.measurements_path(user_id)?;
        let mut doc = self
            .read_measurements(&path)?
            .unwrap_or_else(|| MeasurementDocument::new(user_id));
        update(&mut doc)?;
        write_atomic(&path, &doc)
    }
}

impl SessionStore for JsonFileStore {
    fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let dir = self.user_sessions_dir(&record.user_id)?;
        std::fs::create_dir_all(&dir)?;
        write_atomic(&dir.join(format!("{}.json", record.session_id)), record)
    }

    fn get_latest_session(&self, user_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let dir = self.user_sessions_dir(user_id)?;
        if !dir.exists() {
            return Ok(None);
        }

        let mut latest: Option<SessionRecord> = None;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let record: SessionRecord = match serde_json::from_str(&content) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session document");
                    continue;
                }
            };
            if latest
                .as_ref()
                .map(|l| record.started_at > l.started_at)
                .unwrap_or(true)
            {
                latest = Some(record);
            }
        }
        Ok(latest)
    }

    fn upsert_measurement_fields(
        &self,
        user_id: &str,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        self.update_measurements(user_id, |doc| doc.apply_automatic(fields))
    }

    fn set_manual_field(&self, user_id: &str, field: &str, value: Value) -> Result<(), StoreError> {
        self.update_measurements(user_id, |doc| doc.apply_manual(field, value))
    }

    fn get_measurements(&self, user_id: &str) -> Result<Option<MeasurementDocument>, StoreError> {
        self.read_measurements(&self.measurements_path(user_id)?)
    }
}

/// User ids become directory names; refuse anything that could escape the root.
fn path_component(user_id: &str) -> Result<String, StoreError> {
    let valid = !user_id.is_empty()
        && user_id != "."
        && user_id != ".."
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if !valid {
        return Err(StoreError::InvalidUser(user_id.to_string()));
    }
    Ok(user_id.to_string())
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
