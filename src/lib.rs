//! Breath Session Agent - CO2/humidity breathing-session ingestion.
//!
//! A user breathes into a closed bag with a CO2/humidity sensor attached
//! over a serial line. The agent reads one sample per sensor tick, finds
//! the baseline and three further CO2 plateaus, and persists the session
//! so a dashboard can poll it while it runs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Breath Session Agent                       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐             │
//! │  │   Sample    │──▶│  Detector   │──▶│   Session   │             │
//! │  │   Source    │   │ (plateaus)  │   │   Machine   │             │
//! │  └─────────────┘   └─────────────┘   └─────────────┘             │
//! │         ▲                                   │                    │
//! │         │                                   ▼                    │
//! │  ┌─────────────┐                     ┌─────────────┐             │
//! │  │ Supervisor  │────────────────────▶│   Runner    │──▶ Store    │
//! │  │  (logins)   │                     │ (one/user)  │             │
//! │  └─────────────┘                     └─────────────┘             │
//! │                                             │                    │
//! │                                             ▼                    │
//! │                                      ┌─────────────┐             │
//! │                                      │ Ingestion   │             │
//! │                                      │    Log      │             │
//! │                                      └─────────────┘             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use breath_session_agent::{CancelFlag, Config, MemoryStore, SessionRunner};
//!
//! let config = Config::load().unwrap_or_default();
//! let serial = config.serial.clone();
//! let runner = SessionRunner::new(config, Arc::new(MemoryStore::new()));
//!
//! // Blocks until the session completes, fails, or times out
//! let record = runner.run("user-42", &serial, &CancelFlag::new());
//! println!("{} with {} plateaus", record.status, record.plateaus.len());
//! ```

pub mod audit;
pub mod config;
pub mod core;
pub mod runner;
pub mod source;
pub mod store;
pub mod supervisor;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use audit::{IngestionLog, IngestionStats, SharedIngestionLog};
pub use config::{Config, ConfigError};
pub use core::{
    DetectorConfig, DetectorEvent, Plateau, SessionError, SessionRecord, SessionStateMachine,
    SessionStatus, StabilizationDetector,
};
pub use runner::{CancelFlag, SessionRunner};
pub use source::{
    MockFactory, MockProfile, MockSource, PortRegistry, ReplaySource, Sample, SampleSource,
    SerialConfig, SerialFactory, SerialSource, SourceError, SourceFactory,
};
pub use store::{JsonFileStore, MemoryStore, MeasurementDocument, SessionStore, StoreError};
pub use supervisor::{SessionSupervisor, SessionTicket};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
