//! Process-wide ingestion counters.

use crate::core::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Running totals since the agent started (or since the persisted file
/// was last reset).
#[derive(Debug)]
pub struct IngestionLog {
    /// Parsed readings appended to a raw curve
    samples_received: AtomicU64,
    /// Lines that failed to parse
    malformed_lines: AtomicU64,
    /// Ticks where the sensor delivered nothing
    read_timeouts: AtomicU64,
    /// Readings kept in the curve but skipped by detection
    out_of_range: AtomicU64,
    plateaus_detected: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_timed_out: AtomicU64,
    started_at: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl IngestionLog {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            read_timeouts: AtomicU64::new(0),
            out_of_range: AtomicU64::new(0),
            plateaus_detected: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            sessions_timed_out: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that resumes from, and saves to, `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous ingestion stats");
        }

        log
    }

    pub fn record_sample(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_line(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_timeout(&self) {
        self.read_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_range(&self) {
        self.out_of_range.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plateau(&self) {
        self.plateaus_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished session under its terminal status.
    pub fn record_session_end(&self, status: SessionStatus) {
        let counter = match status {
            SessionStatus::Completed => &self.sessions_completed,
            SessionStatus::Failed => &self.sessions_failed,
            SessionStatus::TimedOut => &self.sessions_timed_out,
            SessionStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> IngestionStats {
        IngestionStats {
            samples_received: self.samples_received.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            read_timeouts: self.read_timeouts.load(Ordering::Relaxed),
            out_of_range: self.out_of_range.load(Ordering::Relaxed),
            plateaus_detected: self.plateaus_detected.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_timed_out: self.sessions_timed_out.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the `status` command.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Ingestion Statistics:\n\
             - Samples received: {}\n\
             - Malformed lines: {}\n\
             - Read timeouts: {}\n\
             - Out-of-range readings: {}\n\
             - Plateaus detected: {}\n\
             \n\
             Sessions:\n\
             - Completed: {}\n\
             - Failed: {}\n\
             - Timed out: {}",
            stats.samples_received,
            stats.malformed_lines,
            stats.read_timeouts,
            stats.out_of_range,
            stats.plateaus_detected,
            stats.sessions_completed,
            stats.sessions_failed,
            stats.sessions_timed_out,
        )
    }

    /// Write the counters to disk. No-op without a persistence path.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let stats = self.stats();
        let persisted = PersistedStats {
            samples_received: stats.samples_received,
            malformed_lines: stats.malformed_lines,
            read_timeouts: stats.read_timeouts,
            out_of_range: stats.out_of_range,
            plateaus_detected: stats.plateaus_detected,
            sessions_completed: stats.sessions_completed,
            sessions_failed: stats.sessions_failed,
            sessions_timed_out: stats.sessions_timed_out,
            last_updated: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedStats =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;

        self.samples_received
            .store(persisted.samples_received, Ordering::Relaxed);
        self.malformed_lines
            .store(persisted.malformed_lines, Ordering::Relaxed);
        self.read_timeouts
            .store(persisted.read_timeouts, Ordering::Relaxed);
        self.out_of_range
            .store(persisted.out_of_range, Ordering::Relaxed);
        self.plateaus_detected
            .store(persisted.plateaus_detected, Ordering::Relaxed);
        self.sessions_completed
            .store(persisted.sessions_completed, Ordering::Relaxed);
        self.sessions_failed
            .store(persisted.sessions_failed, Ordering::Relaxed);
        self.sessions_timed_out
            .store(persisted.sessions_timed_out, Ordering::Relaxed);
        Ok(())
    }

    pub fn reset(&self) {
        for counter in [
            &self.samples_received,
            &self.malformed_lines,
            &self.read_timeouts,
            &self.out_of_range,
            &self.plateaus_detected,
            &self.sessions_completed,
            &self.sessions_failed,
            &self.sessions_timed_out,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for IngestionLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the ingestion counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionStats {
    pub samples_received: u64,
    pub malformed_lines: u64,
    pub read_timeouts: u64,
    pub out_of_range: u64,
    pub plateaus_detected: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_timed_out: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    samples_received: u64,
    malformed_lines: u64,
    read_timeouts: u64,
    #[serde(default)]
    out_of_range: u64,
    plateaus_detected: u64,
    sessions_completed: u64,
    sessions_failed: u64,
    sessions_timed_out: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared ingestion log.
pub type SharedIngestionLog = Arc<IngestionLog>;

pub fn create_shared_log() -> SharedIngestionLog {
    Arc::new(IngestionLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedIngestionLog {
    Arc::new(IngestionLog::with_persistence(path))
}
