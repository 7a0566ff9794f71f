//! Replays a recorded sensor capture.

use crate::source::types::{LineDecoder, Sample, SourceError};
use crate::source::SampleSource;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

/// Sample source reading newline-delimited records from any buffered reader.
///
/// End of input is reported as [`SourceError::Closed`].
pub struct ReplaySource<R> {
    reader: Option<R>,
    decoder: LineDecoder,
    label: String,
    interval: Duration,
    line: Vec<u8>,
}

impl ReplaySource<BufReader<File>> {
    /// Replay a capture file from disk.
    pub fn from_path(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|e| SourceError::Connection {
            port: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(BufReader::new(file), format!("replay:{}", path.display())))
    }
}

impl<R: BufRead + Send> ReplaySource<R> {
    pub fn new(reader: R, label: impl Into<String>) -> Self {
        Self {
            reader: Some(reader),
            decoder: LineDecoder::new(),
            label: label.into(),
            interval: Duration::ZERO,
            line: Vec::with_capacity(64),
        }
    }

    /// Pace the replay at the recorded tick rate.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl<R: BufRead + Send> SampleSource for ReplaySource<R> {
    fn next_sample(&mut self) -> Result<Sample, SourceError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(SourceError::Closed);
        };

        loop {
            self.line.clear();
            let read = reader
                .read_until(b'\n', &mut self.line)
                .map_err(|e| SourceError::Io(e.to_string()))?;
            if read == 0 {
                return Err(SourceError::Closed);
            }
            if let Some(result) = self.decoder.decode(&self.line) {
                if !self.interval.is_zero() {
                    std::thread::sleep(self.interval);
                }
                return result;
            }
        }
    }

    fn close(&mut self) {
        self.reader.take();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
