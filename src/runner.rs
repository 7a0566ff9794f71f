//! Drives one session from an open source to a persisted record.
//!
//! The runner owns the source for the length of the session and is the
//! only writer of the user's in-progress record. Whatever happens, it
//! ends with a terminal record that has been handed to the store.

use crate::audit::{create_shared_log, SharedIngestionLog};
use crate::config::Config;
use crate::core::{
    DetectorEvent, SessionError, SessionRecord, SessionStateMachine, SessionStatus,
};
use crate::source::{
    PortRegistry, SampleSource, SerialConfig, SerialFactory, SourceError, SourceFactory,
};
use crate::store::{plateau_fields, SessionStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Reason stored on sessions stopped from outside.
pub const CANCELLED_REASON: &str = "cancelled";

/// Shared stop request, checked once per tick.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-login session driver.
pub struct SessionRunner {
    config: Config,
    store: Arc<dyn SessionStore>,
    ports: PortRegistry,
    log: SharedIngestionLog,
}

impl SessionRunner {
    pub fn new(config: Config, store: Arc<dyn SessionStore>) -> Self {
        Self {
            config,
            store,
            ports: PortRegistry::global().clone(),
            log: create_shared_log(),
        }
    }

    /// Use a specific port registry instead of the process-wide one.
    pub fn with_ports(mut self, ports: PortRegistry) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_log(mut self, log: SharedIngestionLog) -> Self {
        self.log = log;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn log(&self) -> &SharedIngestionLog {
        &self.log
    }

    /// Open the serial port and run a full session on it.
    pub fn run(&self, user_id: &str, serial: &SerialConfig, cancel: &CancelFlag) -> SessionRecord {
        let factory = SerialFactory::new(serial.clone(), self.ports.clone());
        self.run_from(user_id, &factory, cancel)
    }

    /// Open a source from `factory` and run a full session on it.
    ///
    /// A connection failure still produces a persisted `Failed` record.
    /// A busy port is returned as `Failed` but not stored, since the
    /// holder may be this user's own running session.
    pub fn run_from(
        &self,
        user_id: &str,
        factory: &dyn SourceFactory,
        cancel: &CancelFlag,
    ) -> SessionRecord {
        let session_id = Uuid::new_v4();
        match factory.open() {
            Ok(mut source) => self.run_session(session_id, user_id, &mut source, cancel),
            Err(e @ SourceError::PortBusy(_)) => self.reject_busy(session_id, user_id, &e),
            Err(e) => self.record_open_failure(session_id, user_id, &e),
        }
    }

    /// Run a session over a source that is already open.
    pub fn run_with_source<S>(
        &self,
        user_id: &str,
        source: &mut S,
        cancel: &CancelFlag,
    ) -> SessionRecord
    where
        S: SampleSource + ?Sized,
    {
        self.run_session(Uuid::new_v4(), user_id, source, cancel)
    }

    /// Run a session with a caller-chosen id. The source is closed before
    /// this returns.
    pub fn run_session<S>(
        &self,
        session_id: Uuid,
        user_id: &str,
        source: &mut S,
        cancel: &CancelFlag,
    ) -> SessionRecord
    where
        S: SampleSource + ?Sized,
    {
        let mut machine = self.new_machine(session_id, user_id);
        check(machine.start());

        tracing::info!(
            session_id = %session_id,
            user_id,
            source = %source.describe(),
            "session started"
        );
        self.checkpoint(machine.record());

        let deadline = Instant::now() + self.config.max_session_duration;
        let checkpoint_every = self.config.checkpoint_every_samples;
        let mut since_checkpoint = 0usize;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(session_id = %session_id, "session cancelled");
                check(machine.fail(CANCELLED_REASON));
                break;
            }
            if Instant::now() >= deadline {
                let limit = self.config.max_session_duration.as_secs_f64();
                check(machine.time_out(format!("session exceeded {limit:.0}s")));
                break;
            }

            let mut sampled = false;
            let outcome = match source.next_sample() {
                Ok(sample) => {
                    sampled = true;
                    self.log.record_sample();
                    if !self
                        .config
                        .detector
                        .in_range(sample.co2_ppm, sample.humidity_pct)
                    {
                        self.log.record_out_of_range();
                    }
                    machine.on_sample(&sample)
                }
                Err(SourceError::MalformedLine { seq, line, reason }) => {
                    tracing::warn!(session_id = %session_id, seq, line = %line, reason = %reason, "malformed line");
                    self.log.record_malformed_line();
                    machine.on_malformed(seq, line, reason).map(|()| Vec::new())
                }
                Err(SourceError::ReadTimeout(waited)) => {
                    tracing::warn!(session_id = %session_id, ?waited, "no reading from sensor");
                    self.log.record_read_timeout();
                    machine.on_read_timeout()
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "sample source failed");
                    check(machine.fail(e.to_string()));
                    break;
                }
            };

            let events = match outcome {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "session rejected input");
                    break;
                }
            };

            let plateau_found = self.note_events(&events);
            if machine.is_terminal() {
                break;
            }

            if sampled {
                since_checkpoint += 1;
            }
            let due = checkpoint_every > 0 && since_checkpoint >= checkpoint_every;
            if plateau_found || due {
                self.checkpoint(machine.record());
                since_checkpoint = 0;
            }
        }

        source.close();
        let record = take_record(machine);
        self.finish(&record);
        record
    }

    fn new_machine(&self, session_id: Uuid, user_id: &str) -> SessionStateMachine {
        SessionStateMachine::new(session_id, user_id, self.config.detector.clone())
            .with_metadata(self.config.origin.clone(), self.config.sample_rate_hz)
    }

    fn failed_before_start(
        &self,
        session_id: Uuid,
        user_id: &str,
        error: &SourceError,
    ) -> SessionRecord {
        let mut machine = self.new_machine(session_id, user_id);
        check(machine.start());
        check(machine.fail(error.to_string()));
        take_record(machine)
    }

    fn reject_busy(&self, session_id: Uuid, user_id: &str, error: &SourceError) -> SessionRecord {
        tracing::warn!(session_id = %session_id, user_id, error = %error, "sample source busy, session not started");
        self.failed_before_start(session_id, user_id, error)
    }

    fn record_open_failure(
        &self,
        session_id: Uuid,
        user_id: &str,
        error: &SourceError,
    ) -> SessionRecord {
        tracing::error!(session_id = %session_id, user_id, error = %error, "could not open sample source");
        let record = self.failed_before_start(session_id, user_id, error);
        self.finish(&record);
        record
    }

    /// Count accepted plateaus. Returns true if there was one.
    fn note_events(&self, events: &[DetectorEvent]) -> bool {
        let accepted = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    DetectorEvent::BaselineCaptured(_) | DetectorEvent::PlateauFound(_)
                )
            })
            .count();
        for _ in 0..accepted {
            self.log.record_plateau();
        }
        accepted > 0
    }

    fn checkpoint(&self, record: &SessionRecord) {
        if let Err(e) = self.store.save_session(record) {
            tracing::error!(session_id = %record.session_id, error = %e, "checkpoint write failed");
        }
    }

    /// Final write, measurement projection, and counters.
    fn finish(&self, record: &SessionRecord) {
        if let Err(e) = self.store.save_session(record) {
            tracing::error!(session_id = %record.session_id, error = %e, "final session write failed");
        }

        if record.status == SessionStatus::Completed {
            let fields = plateau_fields(&record.plateaus);
            if let Err(e) = self.store.upsert_measurement_fields(&record.user_id, &fields) {
                tracing::error!(
                    session_id = %record.session_id,
                    user_id = %record.user_id,
                    error = %e,
                    "measurement update failed"
                );
            }
        }

        self.log.record_session_end(record.status);
        if let Err(e) = self.log.save() {
            tracing::warn!(error = %e, "could not save ingestion stats");
        }

        tracing::info!(
            session_id = %record.session_id,
            user_id = %record.user_id,
            status = %record.status,
            samples = record.sample_count(),
            plateaus = record.plateaus.len(),
            reason = record.failure_reason.as_deref().unwrap_or(""),
            "session finished"
        );
    }
}

/// Transitions issued by the runner follow its own loop; a rejection here
/// means the loop and the machine disagree.
fn check(result: Result<(), SessionError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "session transition rejected");
    }
}

fn take_record(machine: SessionStateMachine) -> SessionRecord {
    match machine.into_record() {
        Ok(record) => record,
        Err((machine, e)) => {
            tracing::error!(error = %e, "session ended without a terminal state");
            machine.record().clone()
        }
    }
}
