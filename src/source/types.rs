//! Sample types and wire-format parsing for the CO2 sensor feed.
//!
//! The sensor firmware prints one `"<co2_ppm>,<humidity_pct>"` record per
//! line, no header row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One reading from the sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// CO2 concentration in ppm
    pub co2_ppm: f64,
    /// Relative humidity in percent
    pub humidity_pct: f64,
    /// Line counter assigned by the source (malformed lines consume a number too)
    pub seq: u64,
    /// When the line was decoded
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(co2_ppm: f64, humidity_pct: f64, seq: u64) -> Self {
        Self {
            co2_ppm,
            humidity_pct,
            seq,
            timestamp: Utc::now(),
        }
    }
}

/// Errors produced by a sample source.
///
/// `ReadTimeout` and `MalformedLine` are soft: the session loop decides
/// whether to keep going. Everything else ends the session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("cannot open {port}: {reason}")]
    Connection { port: String, reason: String },

    #[error("port {0} is already held by another session")]
    PortBusy(String),

    #[error("no reading within {0:?}")]
    ReadTimeout(Duration),

    #[error("malformed line #{seq} {line:?}: {reason}")]
    MalformedLine {
        seq: u64,
        line: String,
        reason: String,
    },

    #[error("sample source closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Parse a `"<co2>,<humidity>"` record into its two values.
pub fn parse_line(line: &str) -> Result<(f64, f64), String> {
    let mut parts = line.trim().split(',');
    let (Some(co2), Some(hum), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("expected exactly two comma-separated fields".to_string());
    };

    let co2: f64 = co2
        .trim()
        .parse()
        .map_err(|_| format!("co2 field {:?} is not numeric", co2.trim()))?;
    let hum: f64 = hum
        .trim()
        .parse()
        .map_err(|_| format!("humidity field {:?} is not numeric", hum.trim()))?;

    if !co2.is_finite() || !hum.is_finite() {
        return Err("non-finite value".to_string());
    }

    Ok((co2, hum))
}

/// Turns raw line bytes into samples, numbering every non-blank line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    next_seq: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line (without its terminator).
    ///
    /// Blank lines yield `None`; the firmware emits them between readings.
    pub fn decode(&mut self, raw: &[u8]) -> Option<Result<Sample, SourceError>> {
        let text = match std::str::from_utf8(raw) {
            Ok(text) => text.trim(),
            Err(_) => {
                let seq = self.bump();
                return Some(Err(SourceError::MalformedLine {
                    seq,
                    line: String::from_utf8_lossy(raw).trim().to_string(),
                    reason: "invalid UTF-8".to_string(),
                }));
            }
        };

        if text.is_empty() {
            return None;
        }

        let seq = self.bump();
        Some(match parse_line(text) {
            Ok((co2, hum)) => Ok(Sample::new(co2, hum, seq)),
            Err(reason) => Err(SourceError::MalformedLine {
                seq,
                line: text.to_string(),
                reason,
            }),
        })
    }

    /// Number of lines decoded so far.
    pub fn lines_seen(&self) -> u64 {
        self.next_seq
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
