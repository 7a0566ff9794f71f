//! Core session logic.
//!
//! This module contains:
//! - The rolling block window used for stability statistics
//! - The streaming plateau detector
//! - The session state machine and the record it produces

pub mod detector;
pub mod session;
pub mod window;

// Re-export commonly used types
pub use detector::{
    DetectorConfig, DetectorEvent, Phase, Plateau, StabilizationDetector, PLATEAUS_PER_SESSION,
};
pub use session::{
    MachineState, RejectedLine, SessionError, SessionRecord, SessionStateMachine, SessionStatus,
};
pub use window::{BlockMeans, BlockWindow, Reading};
