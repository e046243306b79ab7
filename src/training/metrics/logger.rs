//! Named meters and periodic progress logging

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::info;

use super::SmoothedValue;

/// A set of named [`SmoothedValue`] meters
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
    window_size: usize,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new(super::DEFAULT_WINDOW)
    }
}

impl MetricLogger {
    /// Create a logger whose meters keep `window_size` values
    pub fn new(window_size: usize) -> Self {
        Self {
            meters: BTreeMap::new(),
            window_size,
            delimiter: "  ".to_string(),
        }
    }

    /// Record one value
    pub fn update(&mut self, name: &str, value: f64) {
        let window_size = self.window_size;
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| SmoothedValue::new(window_size))
            .update(value, 1);
    }

    /// Register `meter` under `name`, replacing any existing one
    pub fn add_meter(&mut self, name: &str, meter: SmoothedValue) {
        self.meters.insert(name.to_string(), meter);
    }

    /// Record every value of `record`
    pub fn update_many(&mut self, record: &BTreeMap<String, f64>) {
        for (name, value) in record {
            self.update(name, *value);
        }
    }

    /// Meter by name
    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// Names of every meter
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.meters.keys().map(String::as_str)
    }

    /// Barrier between training processes; single-process runs do nothing
    pub fn synchronize_between_processes(&mut self) {
        for meter in self.meters.values_mut() {
            meter.synchronize_between_processes();
        }
    }

    /// Global average of every meter
    pub fn averaged_stats(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }

    /// `name: median (global_avg)` for every meter
    pub fn summary(&self) -> String {
        self.meters
            .iter()
            .map(|(name, meter)| format!("{name}: {meter}"))
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }

    /// Start a progress log over `total` iterations
    pub fn log_every(&self, total: usize, print_freq: usize, header: impl Into<String>) -> ProgressLog {
        ProgressLog::new(total, print_freq, header.into())
    }
}

/// Progress over a known number of iterations, logged every `print_freq`
/// iterations and on the last one
#[derive(Debug)]
pub struct ProgressLog {
    header: String,
    total: usize,
    print_freq: usize,
    index: usize,
    start: Instant,
    last: Instant,
    iter_time: SmoothedValue,
}

impl ProgressLog {
    fn new(total: usize, print_freq: usize, header: String) -> Self {
        let now = Instant::now();
        Self {
            header,
            total,
            print_freq: print_freq.max(1),
            index: 0,
            start: now,
            last: now,
            iter_time: SmoothedValue::default(),
        }
    }

    /// Iterations ticked so far
    pub fn index(&self) -> usize {
        self.index
    }

    /// Record one finished iteration, logging the meters when due
    pub fn tick(&mut self, logger: &MetricLogger) {
        let now = Instant::now();
        self.iter_time.update(now.duration_since(self.last).as_secs_f64(), 1);
        self.last = now;

        let i = self.index;
        self.index += 1;
        if i % self.print_freq == 0 || i + 1 == self.total {
            let remaining = self.total.saturating_sub(self.index) as f64;
            let eta = Duration::from_secs_f64(self.iter_time.global_avg() * remaining);
            info!(
                "{} [{}/{}] eta: {:?}  {}  time: {}",
                self.header,
                i,
                self.total,
                eta,
                logger.summary(),
                self.iter_time
            );
        }
    }

    /// Log the total time spent
    pub fn finish(&self) {
        let elapsed = self.start.elapsed();
        info!(
            "{} Total time: {:?} ({:.4} s / it)",
            self.header,
            elapsed,
            elapsed.as_secs_f64() / self.index.max(1) as f64
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_averages() {
        let mut logger = MetricLogger::default();
        logger.update("loss", 1.0);
        logger.update("loss", 3.0);
        logger.update_many(&[("lr".to_string(), 0.1)].into_iter().collect());

        assert_eq!(logger.meter("loss").unwrap().global_avg(), 2.0);
        assert_eq!(logger.names().collect::<Vec<_>>(), vec!["loss", "lr"]);
        assert_eq!(logger.averaged_stats().get("lr"), Some(&0.1));
        assert!(logger.summary().contains("loss: "));
    }

    #[test]
    fn test_registered_meter_keeps_its_window() {
        let mut logger = MetricLogger::default();
        logger.add_meter("lr", SmoothedValue::new(1));
        for lr in [0.01, 0.02, 0.03] {
            logger.update("lr", lr);
        }
        let meter = logger.meter("lr").unwrap();
        assert_eq!(meter.median(), 0.03);
        assert_eq!(meter.count(), 3);
    }

    #[test]
    fn test_synchronize_is_idempotent() {
        let mut logger = MetricLogger::default();
        logger.update("loss", 1.5);
        let before = logger.averaged_stats();
        logger.synchronize_between_processes();
        logger.synchronize_between_processes();
        assert_eq!(logger.averaged_stats(), before);
    }

    #[test]
    fn test_progress_counts_ticks() {
        let logger = MetricLogger::default();
        let mut progress = logger.log_every(3, 10, "Epoch: [0]");
        for _ in 0..3 {
            progress.tick(&logger);
        }
        progress.finish();
        assert_eq!(progress.index(), 3);
    }
}
