//! Synthetic CO2 feed for demos and dry runs without hardware.

use crate::source::types::{Sample, SourceError};
use crate::source::SampleSource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Shape of the generated signal.
#[derive(Debug, Clone)]
pub enum MockProfile {
    /// Ramp between target levels, holding each one steady.
    Session {
        levels: Vec<f64>,
        ramp_samples: usize,
        hold_samples: usize,
        noise_ppm: f64,
    },
    /// Independent uniform readings, never stable.
    Random,
}

impl Default for MockProfile {
    fn default() -> Self {
        // Rebreathing in a bag: CO2 climbs in steps well apart from each other.
        MockProfile::Session {
            levels: vec![450.0, 800.0, 1150.0, 1500.0],
            ramp_samples: 8,
            hold_samples: 20,
            noise_ppm: 2.0,
        }
    }
}

/// Sample source that fabricates readings.
pub struct MockSource {
    profile: MockProfile,
    rng: StdRng,
    interval: Duration,
    seq: u64,
    closed: bool,
}

impl MockSource {
    pub fn new(profile: MockProfile) -> Self {
        Self {
            profile,
            rng: StdRng::from_entropy(),
            interval: Duration::ZERO,
            seq: 0,
            closed: false,
        }
    }

    /// Use a fixed seed so the stream is reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Sleep this long before each reading, like a real sensor tick.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Noise-free target value for the given sample number.
    fn target(&self, n: usize) -> f64 {
        match &self.profile {
            MockProfile::Session {
                levels,
                ramp_samples,
                hold_samples,
                ..
            } => session_target(levels, *ramp_samples, *hold_samples, n),
            MockProfile::Random => 0.0,
        }
    }
}

fn session_target(levels: &[f64], ramp: usize, hold: usize, n: usize) -> f64 {
    let Some(&first) = levels.first() else {
        return 0.0;
    };
    if n < hold {
        return first;
    }

    let segment = ramp + hold;
    let mut offset = n - hold;
    for pair in levels.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        if offset < ramp {
            let t = (offset + 1) as f64 / ramp as f64;
            return from + (to - from) * t;
        }
        if offset < segment {
            return to;
        }
        offset -= segment;
    }

    *levels.last().unwrap_or(&first)
}

impl SampleSource for MockSource {
    fn next_sample(&mut self) -> Result<Sample, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }

        let n = self.seq as usize;
        let (co2, hum) = match &self.profile {
            MockProfile::Session { noise_ppm, .. } => {
                let noise = if *noise_ppm > 0.0 {
                    self.rng.gen_range(-*noise_ppm..=*noise_ppm)
                } else {
                    0.0
                };
                let hum = 45.0 + self.rng.gen_range(-0.5..=0.5);
                (self.target(n) + noise, hum)
            }
            MockProfile::Random => (
                self.rng.gen_range(400.0..=1200.0),
                self.rng.gen_range(30.0..=60.0),
            ),
        };

        let sample = Sample::new(round2(co2), round2(hum), self.seq);
        self.seq += 1;
        Ok(sample)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn describe(&self) -> String {
        match self.profile {
            MockProfile::Session { .. } => "mock:session".to_string(),
            MockProfile::Random => "mock:random".to_string(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
