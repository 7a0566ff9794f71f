//! Rolling window of recent valid readings.
//!
//! The detector compares two adjacent, non-overlapping blocks of
//! [`BLOCK_LEN`] readings: the newest block against the one before it.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Readings per comparison block.
pub const BLOCK_LEN: usize = 3;

/// Total readings held: the prior block plus the recent block.
pub const WINDOW_CAPACITY: usize = BLOCK_LEN * 2;

/// One valid reading kept in the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub co2_ppm: f64,
    pub humidity_pct: f64,
}

/// Means of the two blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMeans {
    /// Mean CO2 of the newest block
    pub recent_co2: f64,
    /// Mean CO2 of the block before it
    pub prior_co2: f64,
    /// Mean humidity of the newest block, paired with `recent_co2`
    pub recent_humidity: f64,
}

impl BlockMeans {
    /// Absolute change between the two block means.
    pub fn delta(&self) -> f64 {
        (self.recent_co2 - self.prior_co2).abs()
    }
}

/// Fixed-capacity ring; the oldest reading is evicted on overflow.
#[derive(Debug, Clone, Default)]
pub struct BlockWindow {
    readings: VecDeque<Reading>,
}

impl BlockWindow {
    pub fn new() -> Self {
        Self {
            readings: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// Add a reading, evicting the oldest when full.
    pub fn push(&mut self, reading: Reading) {
        if self.readings.len() == WINDOW_CAPACITY {
            self.readings.pop_front();
        }
        self.readings.push_back(reading);
    }

    /// Check if both blocks are populated.
    pub fn is_full(&self) -> bool {
        self.readings.len() == WINDOW_CAPACITY
    }

    /// Means of the prior and recent blocks, once the window is full.
    pub fn block_means(&self) -> Option<BlockMeans> {
        if !self.is_full() {
            return None;
        }

        let prior = self.readings.iter().take(BLOCK_LEN);
        let recent = self.readings.iter().skip(BLOCK_LEN);

        Some(BlockMeans {
            prior_co2: prior.map(|r| r.co2_ppm).mean(),
            recent_co2: recent.clone().map(|r| r.co2_ppm).mean(),
            recent_humidity: recent.map(|r| r.humidity_pct).mean(),
        })
    }
}
