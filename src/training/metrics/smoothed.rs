//! Windowed scalar statistics

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default number of recent values kept for windowed statistics
pub const DEFAULT_WINDOW: usize = 20;

/// A series of values with windowed and global statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmoothedValue {
    window_size: usize,
    values: VecDeque<f64>,
    total: f64,
    count: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SmoothedValue {
    /// Create a series keeping the last `window_size` values
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            values: VecDeque::with_capacity(window_size),
            total: 0.0,
            count: 0,
        }
    }

    /// Record `value` observed `n` times
    pub fn update(&mut self, value: f64, n: usize) {
        self.values.push_back(value);
        if self.values.len() > self.window_size {
            self.values.pop_front();
        }
        self.count += n;
        self.total += value * n as f64;
    }

    /// No-op in a single process
    pub fn synchronize_between_processes(&mut self) {}

    /// Number of observations
    pub fn count(&self) -> usize {
        self.count
    }

    /// Median of the window
    pub fn median(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        // Lower median for even windows
        sorted[(sorted.len() - 1) / 2]
    }

    /// Mean of the window
    pub fn avg(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Mean over every observation
    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    /// Maximum of the window
    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Most recent value
    pub fn value(&self) -> f64 {
        self.values.back().copied().unwrap_or(0.0)
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({:.4})", self.median(), self.global_avg())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_and_global_statistics() {
        let mut value = SmoothedValue::new(3);
        for v in [1.0, 2.0, 3.0, 10.0] {
            value.update(v, 1);
        }
        assert_eq!(value.count(), 4);
        assert_eq!(value.median(), 3.0);
        assert_eq!(value.avg(), 5.0);
        assert_eq!(value.max(), 10.0);
        assert_eq!(value.value(), 10.0);
        assert_eq!(value.global_avg(), 4.0);
    }

    #[test]
    fn test_weighted_update() {
        let mut value = SmoothedValue::default();
        value.update(2.0, 3);
        value.update(6.0, 1);
        assert_eq!(value.global_avg(), 3.0);
        assert_eq!(format!("{value}"), "2.0000 (3.0000)");
    }
}
