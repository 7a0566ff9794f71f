//! Sample sources for the CO2/humidity sensor feed.
//!
//! A source yields one [`Sample`] per sensor tick until the session ends or
//! the source fails. The physical serial port is the real implementation;
//! mock and replay sources exist for dry runs and offline analysis.

pub mod mock;
pub mod port;
pub mod replay;
pub mod serial;
pub mod types;

// Re-export commonly used types
pub use mock::{MockProfile, MockSource};
pub use port::{GuardedSource, PortGuard, PortRegistry};
pub use replay::ReplaySource;
pub use serial::{SerialConfig, SerialSource};
pub use types::{parse_line, LineDecoder, Sample, SourceError};

/// A per-session stream of sensor readings.
pub trait SampleSource: Send {
    /// Block until the next reading arrives.
    ///
    /// `ReadTimeout` and `MalformedLine` are soft errors; the caller
    /// decides whether to continue.
    fn next_sample(&mut self) -> Result<Sample, SourceError>;

    /// Release the underlying resource. Safe to call more than once.
    fn close(&mut self);

    /// Short label for logs.
    fn describe(&self) -> String;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn next_sample(&mut self) -> Result<Sample, SourceError> {
        (**self).next_sample()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Opens a fresh source for each session.
pub trait SourceFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn SampleSource>, SourceError>;
}

impl<F> SourceFactory for F
where
    F: Fn() -> Result<Box<dyn SampleSource>, SourceError> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn SampleSource>, SourceError> {
        self()
    }
}

/// Opens the configured serial port.
pub struct SerialFactory {
    config: SerialConfig,
    ports: PortRegistry,
}

impl SerialFactory {
    pub fn new(config: SerialConfig, ports: PortRegistry) -> Self {
        Self { config, ports }
    }
}

impl SourceFactory for SerialFactory {
    fn open(&self) -> Result<Box<dyn SampleSource>, SourceError> {
        Ok(Box::new(SerialSource::open(&self.config, &self.ports)?))
    }
}

/// Opens a mock source that still occupies a named port, so it obeys the
/// same exclusivity rules as real hardware.
pub struct MockFactory {
    port: String,
    profile: MockProfile,
    interval: std::time::Duration,
    ports: PortRegistry,
}

impl MockFactory {
    pub fn new(port: impl Into<String>, profile: MockProfile, ports: PortRegistry) -> Self {
        Self {
            port: port.into(),
            profile,
            interval: std::time::Duration::ZERO,
            ports,
        }
    }

    pub fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl SourceFactory for MockFactory {
    fn open(&self) -> Result<Box<dyn SampleSource>, SourceError> {
        let guard = self.ports.acquire(&self.port)?;
        let source = MockSource::new(self.profile.clone()).with_interval(self.interval);
        Ok(Box::new(GuardedSource::new(source, guard)))
    }
}
