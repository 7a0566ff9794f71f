//! Streaming plateau detection.
//!
//! The detector consumes one reading at a time and decides, without ever
//! looking back, when CO2 has settled. The first settled stretch is the
//! baseline; three further settled stretches, each far enough from the
//! previous one, complete the session.
//!
//! A stretch is settled when the mean of the newest three valid readings
//! differs from the mean of the three before them by no more than
//! `stability_threshold_ppm`.

use crate::core::window::{BlockMeans, BlockWindow, Reading};
use serde::{Deserialize, Serialize};

/// Baseline plus three plateaus.
pub const PLATEAUS_PER_SESSION: usize = 4;

/// Physiological humidity bounds; readings outside are sensor faults.
const HUMIDITY_RANGE_PCT: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// Tuning parameters for plateau detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Max difference between consecutive block means for a stretch to count as stable
    pub stability_threshold_ppm: f64,
    /// Min distance from the previous plateau for a new one to be accepted
    pub min_plateau_delta_ppm: f64,
    /// Valid samples required between two plateaus
    pub min_samples_between_plateaus: usize,
    /// Valid samples required between the baseline and the first plateau
    pub min_samples_after_baseline: usize,
    /// Ticks without an accepted plateau before the session times out
    pub max_samples_without_plateau: usize,
    /// Lowest CO2 reading accepted into the window
    pub co2_min_ppm: f64,
    /// Highest CO2 reading accepted into the window
    pub co2_max_ppm: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            stability_threshold_ppm: 40.0,
            min_plateau_delta_ppm: 150.0,
            min_samples_between_plateaus: 6,
            // Gives the subject time to start breathing into the bag
            min_samples_after_baseline: 12,
            max_samples_without_plateau: 150,
            co2_min_ppm: 0.0,
            co2_max_ppm: 40_000.0, // SCD30 measurement range
        }
    }
}

impl DetectorConfig {
    /// Whether a reading is plausible enough to enter the window.
    pub fn in_range(&self, co2_ppm: f64, humidity_pct: f64) -> bool {
        co2_ppm.is_finite()
            && humidity_pct.is_finite()
            && (self.co2_min_ppm..=self.co2_max_ppm).contains(&co2_ppm)
            && HUMIDITY_RANGE_PCT.contains(&humidity_pct)
    }
}

/// Representative reading of one settled stretch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plateau {
    /// Mean CO2 of the settled block
    pub co2_value: f64,
    /// Mean humidity of the same block
    pub humidity_value: f64,
    /// Raw-curve index of the sample that completed the block
    pub sample_index: usize,
}

/// Where the detector is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    AwaitingBaseline,
    /// Waiting for plateau `n` (1..=3)
    AwaitingPlateau(u8),
    Complete,
    TimedOut,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::TimedOut)
    }
}

/// Decisions emitted by the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    BaselineCaptured(Plateau),
    PlateauFound(Plateau),
    SessionComplete,
    Timeout,
}

/// Stateful plateau detector. Pure: no I/O, no clock.
#[derive(Debug, Clone)]
pub struct StabilizationDetector {
    config: DetectorConfig,
    phase: Phase,
    window: BlockWindow,
    plateaus: Vec<Plateau>,
    /// Valid readings since the last accepted plateau
    samples_since_plateau: usize,
    /// Ticks (valid, out-of-range, or missed readings) since the last accepted plateau
    ticks_without_plateau: usize,
}

impl StabilizationDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            phase: Phase::AwaitingBaseline,
            window: BlockWindow::new(),
            plateaus: Vec::with_capacity(PLATEAUS_PER_SESSION),
            samples_since_plateau: 0,
            ticks_without_plateau: 0,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Plateaus accepted so far, baseline first.
    pub fn plateaus(&self) -> &[Plateau] {
        &self.plateaus
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Feed one reading that sits at `sample_index` in the raw curve.
    ///
    /// Out-of-range readings never enter the window but still count
    /// towards the no-progress ceiling.
    pub fn push(&mut self, co2_ppm: f64, humidity_pct: f64, sample_index: usize) -> Vec<DetectorEvent> {
        if self.is_finished() {
            return Vec::new();
        }

        self.ticks_without_plateau += 1;

        if !self.config.in_range(co2_ppm, humidity_pct) {
            tracing::debug!(co2_ppm, humidity_pct, sample_index, "reading out of range, skipped");
            return self.check_progress();
        }

        self.window.push(Reading {
            co2_ppm,
            humidity_pct,
        });
        self.samples_since_plateau += 1;

        if let Some(means) = self.window.block_means() {
            if means.delta() <= self.config.stability_threshold_ppm {
                if let Some(events) = self.try_accept(means, sample_index) {
                    return events;
                }
            }
        }

        self.check_progress()
    }

    /// Account for a tick where the sensor delivered nothing.
    pub fn record_missed_tick(&mut self) -> Vec<DetectorEvent> {
        if self.is_finished() {
            return Vec::new();
        }
        self.ticks_without_plateau += 1;
        self.check_progress()
    }

    fn try_accept(&mut self, means: BlockMeans, sample_index: usize) -> Option<Vec<DetectorEvent>> {
        let awaiting = match self.phase {
            Phase::AwaitingBaseline => 0,
            Phase::AwaitingPlateau(n) => n,
            Phase::Complete | Phase::TimedOut => return None,
        };

        if let Some(last) = self.plateaus.last() {
            let required_gap = if self.plateaus.len() == 1 {
                self.config.min_samples_after_baseline
            } else {
                self.config.min_samples_between_plateaus
            };
            if self.samples_since_plateau < required_gap {
                return None;
            }

            // Still sitting on the previous plateau
            let distance = (means.recent_co2 - last.co2_value).abs();
            if distance < self.config.min_plateau_delta_ppm {
                tracing::debug!(
                    candidate = means.recent_co2,
                    last = last.co2_value,
                    distance,
                    "ignoring plateau candidate too close to the previous one"
                );
                return None;
            }

            debug_assert!(sample_index > last.sample_index);
        }

        let plateau = Plateau {
            co2_value: means.recent_co2,
            humidity_value: means.recent_humidity,
            sample_index,
        };
        self.plateaus.push(plateau);
        self.samples_since_plateau = 0;
        self.ticks_without_plateau = 0;

        let mut events = Vec::with_capacity(2);
        match awaiting {
            0 => {
                tracing::info!(
                    sample_index,
                    co2 = plateau.co2_value,
                    humidity = plateau.humidity_value,
                    "baseline captured"
                );
                events.push(DetectorEvent::BaselineCaptured(plateau));
                self.phase = Phase::AwaitingPlateau(1);
            }
            n => {
                tracing::info!(
                    plateau = n,
                    sample_index,
                    co2 = plateau.co2_value,
                    humidity = plateau.humidity_value,
                    "plateau detected"
                );
                events.push(DetectorEvent::PlateauFound(plateau));
                if self.plateaus.len() >= PLATEAUS_PER_SESSION {
                    self.phase = Phase::Complete;
                    events.push(DetectorEvent::SessionComplete);
                } else {
                    self.phase = Phase::AwaitingPlateau(n + 1);
                }
            }
        }

        Some(events)
    }

    fn check_progress(&mut self) -> Vec<DetectorEvent> {
        if self.ticks_without_plateau >= self.config.max_samples_without_plateau {
            tracing::warn!(
                ticks = self.ticks_without_plateau,
                phase = ?self.phase,
                "no plateau within the allowed number of samples"
            );
            self.phase = Phase::TimedOut;
            return vec![DetectorEvent::Timeout];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig {
            stability_threshold_ppm: 2.0,
            min_plateau_delta_ppm: 20.0,
            min_samples_between_plateaus: 3,
            min_samples_after_baseline: 3,
            max_samples_without_plateau: 100,
            ..DetectorConfig::default()
        }
    }

    fn feed(detector: &mut StabilizationDetector, values: &[f64]) -> Vec<(usize, DetectorEvent)> {
        let mut out = Vec::new();
        for (i, &v) in values.iter().enumerate() {
            for event in detector.push(v, 45.0, i) {
                out.push((i, event));
            }
        }
        out
    }

    #[test]
    fn test_no_decision_before_window_full() {
        let mut detector = StabilizationDetector::new(config());
        let events = feed(&mut detector, &[900.0; 5]);
        assert!(events.is_empty());
        assert_eq!(detector.phase(), Phase::AwaitingBaseline);
    }

    #[test]
    fn test_baseline_on_first_stable_block() {
        let mut detector = StabilizationDetector::new(config());
        let events = feed(&mut detector, &[900.0, 901.0, 899.0, 900.0, 901.0, 899.0]);

        assert_eq!(events.len(), 1);
        let (index, event) = &events[0];
        assert_eq!(*index, 5);
        match event {
            DetectorEvent::BaselineCaptured(p) => {
                assert!((p.co2_value - 900.0).abs() < 1e-9);
                assert!((p.humidity_value - 45.0).abs() < 1e-9);
                assert_eq!(p.sample_index, 5);
            }
            other => panic!("expected baseline, got {other:?}"),
        }
        assert_eq!(detector.phase(), Phase::AwaitingPlateau(1));
    }

    #[test]
    fn test_unstable_rise_is_not_a_baseline() {
        let mut detector = StabilizationDetector::new(config());
        let rising: Vec<f64> = (0..20).map(|i| 400.0 + i as f64 * 10.0).collect();
        assert!(feed(&mut detector, &rising).is_empty());
    }

    #[test]
    fn test_duplicate_plateau_rejected() {
        let mut detector = StabilizationDetector::new(config());
        // Flat for a long time: one baseline, then nothing
        let events = feed(&mut detector, &[900.0; 40]);
        assert_eq!(events.len(), 1);
        assert_eq!(detector.plateaus().len(), 1);
    }

    #[test]
    fn test_small_step_rejected_large_step_accepted() {
        let mut detector = StabilizationDetector::new(config());
        let mut values = vec![900.0; 6];
        values.extend([890.0; 10]); // 10 ppm away: below the 20 ppm delta
        values.extend([850.0; 10]);
        let events = feed(&mut detector, &values);

        let plateaus: Vec<f64> = events
            .iter()
            .filter_map(|(_, e)| match e {
                DetectorEvent::BaselineCaptured(p) | DetectorEvent::PlateauFound(p) => {
                    Some(p.co2_value)
                }
                _ => None,
            })
            .collect();
        assert_eq!(plateaus.len(), 2);
        assert!((plateaus[1] - 850.0).abs() < 1e-9);
    }

    #[test]
    fn test_gap_after_baseline_enforced() {
        let mut cfg = config();
        cfg.min_samples_after_baseline = 10;
        let mut detector = StabilizationDetector::new(cfg);

        let mut values = vec![900.0; 6]; // baseline at index 5
        values.extend([800.0; 12]);
        let events = feed(&mut detector, &values);

        // Stable at 800 from index 11, but the gap is only met at index 15
        let found: Vec<usize> = events
            .iter()
            .filter(|(_, e)| matches!(e, DetectorEvent::PlateauFound(_)))
            .map(|(i, _)| *i)
            .collect();
        assert_eq!(found, vec![15]);
    }

    #[test]
    fn test_completes_after_fourth_plateau() {
        let mut detector = StabilizationDetector::new(config());
        let mut values = Vec::new();
        for level in [900.0, 850.0, 800.0, 750.0, 700.0] {
            values.extend(std::iter::repeat(level).take(8));
        }
        let events = feed(&mut detector, &values);

        let kinds: Vec<&DetectorEvent> = events.iter().map(|(_, e)| e).collect();
        assert!(matches!(kinds[0], DetectorEvent::BaselineCaptured(_)));
        assert!(matches!(kinds[1], DetectorEvent::PlateauFound(_)));
        assert!(matches!(kinds[2], DetectorEvent::PlateauFound(_)));
        assert!(matches!(kinds[3], DetectorEvent::PlateauFound(_)));
        assert_eq!(kinds[4], &DetectorEvent::SessionComplete);
        assert_eq!(kinds.len(), 5);
        assert_eq!(detector.phase(), Phase::Complete);

        // Indices strictly increase
        let indices: Vec<usize> = detector.plateaus().iter().map(|p| p.sample_index).collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]));

        // Terminal: further input ignored
        assert!(detector.push(600.0, 45.0, 1000).is_empty());
        assert_eq!(detector.plateaus().len(), PLATEAUS_PER_SESSION);
    }

    #[test]
    fn test_terminal_phase_accepts_nothing() {
        let mut detector = StabilizationDetector::new(config());
        let mut values = Vec::new();
        for level in [900.0, 850.0, 800.0, 750.0] {
            values.extend(std::iter::repeat(level).take(8));
        }
        feed(&mut detector, &values);
        assert_eq!(detector.phase(), Phase::Complete);

        let means = BlockMeans {
            recent_co2: 500.0,
            prior_co2: 500.0,
            recent_humidity: 45.0,
        };
        assert!(detector.try_accept(means, 1000).is_none());
        assert_eq!(detector.plateaus().len(), PLATEAUS_PER_SESSION);
        assert_eq!(detector.phase(), Phase::Complete);
    }

    #[test]
    fn test_timeout_without_progress() {
        let mut cfg = config();
        cfg.max_samples_without_plateau = 10;
        let mut detector = StabilizationDetector::new(cfg);

        let mut timeout_at = None;
        for i in 0..30 {
            // Steady climb never settles
            let events = detector.push(400.0 + i as f64 * 10.0, 45.0, i);
            if events.contains(&DetectorEvent::Timeout) {
                timeout_at = Some(i);
                break;
            }
        }
        assert_eq!(timeout_at, Some(9));
        assert_eq!(detector.phase(), Phase::TimedOut);
        assert!(detector.push(900.0, 45.0, 30).is_empty());
    }

    #[test]
    fn test_missed_ticks_count_towards_timeout() {
        let mut cfg = config();
        cfg.max_samples_without_plateau = 3;
        let mut detector = StabilizationDetector::new(cfg);

        assert!(detector.record_missed_tick().is_empty());
        assert!(detector.record_missed_tick().is_empty());
        assert_eq!(detector.record_missed_tick(), vec![DetectorEvent::Timeout]);
    }

    #[test]
    fn test_out_of_range_does_not_reset_window() {
        let mut detector = StabilizationDetector::new(config());
        let mut events = Vec::new();
        let mut index = 0;
        for value in [900.0, 900.0, 900.0, -5.0, 900.0, 900.0, 900.0] {
            events.extend(detector.push(value, 45.0, index));
            index += 1;
        }
        // Six valid readings despite the fault in the middle
        assert_eq!(events.len(), 1);
        assert_eq!(detector.plateaus()[0].sample_index, 6);
    }

    #[test]
    fn test_in_range() {
        let cfg = DetectorConfig::default();
        assert!(cfg.in_range(900.0, 45.0));
        assert!(!cfg.in_range(-1.0, 45.0));
        assert!(!cfg.in_range(900.0, 120.0));
        assert!(!cfg.in_range(f64::NAN, 45.0));
        assert!(!cfg.in_range(50_000.0, 45.0));
    }
}
