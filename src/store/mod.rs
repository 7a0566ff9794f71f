//! Session persistence boundary.
//!
//! The real deployment talks to a document database. The agent only needs
//! three calls: save a session, fetch a user's latest session, and merge
//! automatic fields into the user's measurement document.
//!
//! Measurement documents mix two kinds of keys. `co2_<n>` and `hum_<n>`
//! (n ≥ 1) belong to the agent; everything else was typed in by a person
//! and is never touched by a session.

pub mod json;
pub mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use crate::core::{Plateau, SessionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field map written into a measurement document.
pub type FieldMap = BTreeMap<String, Value>;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("field {0:?} is outside the automatic namespace")]
    ReservedField(String),

    #[error("field {0:?} is reserved for automatic values")]
    ManualFieldReserved(String),

    #[error("invalid user id {0:?}")]
    InvalidUser(String),
}

/// A user's latest profile-measurement document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementDocument {
    pub user_id: String,
    #[serde(default)]
    pub values: FieldMap,
    /// Last time a session wrote automatic fields
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub co2_updated_at: Option<DateTime<Utc>>,
}

impl MeasurementDocument {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Merge automatic fields, last write wins per key.
    pub fn apply_automatic(&mut self, fields: &FieldMap) -> Result<(), StoreError> {
        if let Some(bad) = fields.keys().find(|k| !is_automatic_field(k)) {
            return Err(StoreError::ReservedField(bad.clone()));
        }
        for (key, value) in fields {
            self.values.insert(key.clone(), value.clone());
        }
        self.co2_updated_at = Some(Utc::now());
        Ok(())
    }

    /// Set a manually entered field.
    pub fn apply_manual(&mut self, field: &str, value: Value) -> Result<(), StoreError> {
        if is_automatic_field(field) {
            return Err(StoreError::ManualFieldReserved(field.to_string()));
        }
        self.values.insert(field.to_string(), value);
        Ok(())
    }
}

/// Whether a key belongs to the automatic namespace (`co2_<n>`, `hum_<n>`).
pub fn is_automatic_field(key: &str) -> bool {
    let Some(suffix) = key
        .strip_prefix("co2_")
        .or_else(|| key.strip_prefix("hum_"))
    else {
        return false;
    };
    !suffix.is_empty()
        && suffix.bytes().all(|b| b.is_ascii_digit())
        && suffix.parse::<u32>().map(|n| n >= 1).unwrap_or(false)
}

/// Project plateaus onto `co2_1..`, `hum_1..`.
pub fn plateau_fields(plateaus: &[Plateau]) -> FieldMap {
    let mut fields = FieldMap::new();
    for (i, plateau) in plateaus.iter().enumerate() {
        let n = i + 1;
        fields.insert(format!("co2_{n}"), Value::from(plateau.co2_value));
        fields.insert(format!("hum_{n}"), Value::from(plateau.humidity_value));
    }
    fields
}

/// Durable storage for session records and measurement documents.
///
/// Implementations provide atomic writes per document; nothing spans
/// documents.
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session record, keyed by its session id.
    fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Most recently started session for a user.
    fn get_latest_session(&self, user_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Merge automatic fields into the user's measurement document,
    /// creating it if needed. Keys outside the automatic namespace are
    /// rejected before anything is written.
    fn upsert_measurement_fields(&self, user_id: &str, fields: &FieldMap)
        -> Result<(), StoreError>;

    /// Set a manually entered field. Automatic keys are rejected.
    fn set_manual_field(&self, user_id: &str, field: &str, value: Value) -> Result<(), StoreError>;

    fn get_measurements(&self, user_id: &str) -> Result<Option<MeasurementDocument>, StoreError>;
}
