//! Session state machine and the record it produces.

use crate::core::detector::{
    DetectorConfig, DetectorEvent, Plateau, StabilizationDetector, PLATEAUS_PER_SESSION,
};
use crate::source::{Sample, SourceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal or in-progress status of a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// A line that could not be parsed, kept for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedLine {
    pub seq: u64,
    pub line: String,
    pub reason: String,
    /// Raw-curve length when the line arrived
    pub raw_position: usize,
}

/// Full result of one session: the unit of durability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: String,
    /// Every parsed CO2 reading in arrival order, including out-of-range ones
    pub raw_co2: Vec<f64>,
    /// Humidity paired with `raw_co2`
    pub raw_humidity: Vec<f64>,
    /// Baseline first, then up to three plateaus
    pub plateaus: Vec<Plateau>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub rejected_lines: Vec<RejectedLine>,
    /// Acquisition rig tag
    pub origin: String,
    /// Nominal sample rate in Hz
    pub sample_rate_hz: f64,
}

impl SessionRecord {
    pub fn new(session_id: Uuid, user_id: impl Into<String>) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            raw_co2: Vec::new(),
            raw_humidity: Vec::new(),
            plateaus: Vec::with_capacity(PLATEAUS_PER_SESSION),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            failure_reason: None,
            rejected_lines: Vec::new(),
            origin: String::new(),
            sample_rate_hz: 0.0,
        }
    }

    /// Number of raw samples recorded.
    pub fn sample_count(&self) -> usize {
        self.raw_co2.len()
    }

    /// Baseline plateau, if captured.
    pub fn baseline(&self) -> Option<&Plateau> {
        self.plateaus.first()
    }

    /// Session duration, for finished sessions.
    pub fn duration_secs(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Lifecycle of the state machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl MachineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MachineState::Completed | MachineState::Failed | MachineState::TimedOut
        )
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Session-level errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid state: cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: MachineState,
    },

    #[error("a session is already running for user {0}")]
    SessionAlreadyActive(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Orchestrates the baseline → plateau×3 protocol for one user.
///
/// The machine owns the detector and the record. Every sample goes into
/// the raw curve before the detector sees it, so the curve order equals
/// arrival order.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: MachineState,
    detector: StabilizationDetector,
    record: SessionRecord,
}

impl SessionStateMachine {
    pub fn new(session_id: Uuid, user_id: impl Into<String>, config: DetectorConfig) -> Self {
        Self {
            state: MachineState::Idle,
            detector: StabilizationDetector::new(config),
            record: SessionRecord::new(session_id, user_id),
        }
    }

    /// Tag the record with the acquisition rig and nominal rate.
    pub fn with_metadata(mut self, origin: impl Into<String>, sample_rate_hz: f64) -> Self {
        self.record.origin = origin.into();
        self.record.sample_rate_hz = sample_rate_hz;
        self
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn detector(&self) -> &StabilizationDetector {
        &self.detector
    }

    /// `Idle → Running`.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.expect_state(MachineState::Idle, "start")?;
        self.state = MachineState::Running;
        self.record.started_at = Utc::now();
        self.record.status = SessionStatus::Running;
        Ok(())
    }

    /// Record a sample and run detection on it.
    pub fn on_sample(&mut self, sample: &Sample) -> Result<Vec<DetectorEvent>, SessionError> {
        self.expect_state(MachineState::Running, "record a sample")?;

        self.record.raw_co2.push(sample.co2_ppm);
        self.record.raw_humidity.push(sample.humidity_pct);
        let index = self.record.raw_co2.len() - 1;

        let events = self
            .detector
            .push(sample.co2_ppm, sample.humidity_pct, index);
        self.apply(&events);
        Ok(events)
    }

    /// Keep a malformed line in the audit trail. It never reaches the detector.
    pub fn on_malformed(
        &mut self,
        seq: u64,
        line: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.expect_state(MachineState::Running, "record a malformed line")?;
        self.record.rejected_lines.push(RejectedLine {
            seq,
            line: line.into(),
            reason: reason.into(),
            raw_position: self.record.raw_co2.len(),
        });
        Ok(())
    }

    /// The sensor missed a tick.
    pub fn on_read_timeout(&mut self) -> Result<Vec<DetectorEvent>, SessionError> {
        self.expect_state(MachineState::Running, "record a read timeout")?;
        let events = self.detector.record_missed_tick();
        self.apply(&events);
        Ok(events)
    }

    /// `Running → Failed`.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), SessionError> {
        self.expect_state(MachineState::Running, "fail")?;
        self.finalize(MachineState::Failed, SessionStatus::Failed, Some(reason.into()));
        Ok(())
    }

    /// `Running → TimedOut`, for ceilings enforced outside the detector.
    pub fn time_out(&mut self, reason: impl Into<String>) -> Result<(), SessionError> {
        self.expect_state(MachineState::Running, "time out")?;
        self.finalize(
            MachineState::TimedOut,
            SessionStatus::TimedOut,
            Some(reason.into()),
        );
        Ok(())
    }

    /// Hand back the record. Only valid once the machine is terminal.
    pub fn into_record(self) -> Result<SessionRecord, (Self, SessionError)> {
        if !self.state.is_terminal() {
            let err = SessionError::InvalidState {
                action: "take the record",
                state: self.state,
            };
            return Err((self, err));
        }
        Ok(self.record)
    }

    fn apply(&mut self, events: &[DetectorEvent]) {
        for event in events {
            match event {
                DetectorEvent::BaselineCaptured(p) | DetectorEvent::PlateauFound(p) => {
                    self.record.plateaus.push(*p);
                }
                DetectorEvent::SessionComplete => {
                    self.finalize(MachineState::Completed, SessionStatus::Completed, None);
                }
                DetectorEvent::Timeout => {
                    let reason = format!(
                        "no plateau within {} samples",
                        self.detector.config().max_samples_without_plateau
                    );
                    self.finalize(MachineState::TimedOut, SessionStatus::TimedOut, Some(reason));
                }
            }
        }
    }

    fn finalize(&mut self, state: MachineState, status: SessionStatus, reason: Option<String>) {
        self.state = state;
        self.record.status = status;
        self.record.ended_at = Some(Utc::now());
        self.record.failure_reason = reason;
    }

    fn expect_state(&self, expected: MachineState, action: &'static str) -> Result<(), SessionError> {
        if self.state != expected {
            return Err(SessionError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }
}
