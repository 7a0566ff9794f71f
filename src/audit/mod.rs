//! Ingestion audit for the session agent.
//!
//! Counts what crossed the serial boundary and how sessions ended, so an
//! operator can tell a flaky sensor from a misconfigured detector.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, IngestionLog, IngestionStats,
    SharedIngestionLog,
};
