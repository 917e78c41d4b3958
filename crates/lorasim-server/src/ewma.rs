//! Exponentially weighted inter-arrival statistics.
//!
//! Mean and mean deviation are smoothed the way TCP smooths round-trip
//! times. An interval further than `k` deviations from the mean is an
//! anomaly, once enough samples have been seen.

use lorasim_common::SimTime;
use serde::{Deserialize, Serialize};

/// Smoothing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EwmaConfig {
    /// Gain of the mean.
    pub alpha: f64,
    /// Gain of the deviation.
    pub beta: f64,
    /// Deviations from the mean tolerated.
    pub k: f64,
    /// Intervals observed before anomalies are reported.
    pub warmup: u32,
}

impl Default for EwmaConfig {
    fn default() -> Self {
        EwmaConfig {
            alpha: 0.125,
            beta: 0.25,
            k: 4.0,
            warmup: 5,
        }
    }
}

/// An interval outside the tolerated band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anomaly {
    /// Observed interval, seconds.
    pub interval_s: f64,
    /// Smoothed mean before this sample.
    pub expected_s: f64,
    /// Smoothed deviation before this sample.
    pub deviation_s: f64,
}

/// Per-device tracker.
#[derive(Debug, Clone)]
pub struct EwmaTracker {
    config: EwmaConfig,
    last_arrival: Option<SimTime>,
    mean_s: f64,
    deviation_s: f64,
    samples: u32,
}

impl EwmaTracker {
    /// Create an empty tracker.
    pub fn new(config: EwmaConfig) -> Self {
        EwmaTracker {
            config,
            last_arrival: None,
            mean_s: 0.0,
            deviation_s: 0.0,
            samples: 0,
        }
    }

    /// Record an arrival. Returns the interval since the previous one and
    /// an anomaly if the interval is out of band.
    pub fn observe(&mut self, now: SimTime) -> (Option<f64>, Option<Anomaly>) {
        let Some(last) = self.last_arrival.replace(now) else {
            return (None, None);
        };
        let interval = (now - last).as_secs_f64();
        self.samples += 1;
        if self.samples == 1 {
            self.mean_s = interval;
            self.deviation_s = interval / 2.0;
            return (Some(interval), None);
        }

        let error = (interval - self.mean_s).abs();
        let anomaly = (self.samples > self.config.warmup && error > self.config.k * self.deviation_s).then_some(
            Anomaly {
                interval_s: interval,
                expected_s: self.mean_s,
                deviation_s: self.deviation_s,
            },
        );
        self.deviation_s = (1.0 - self.config.beta) * self.deviation_s + self.config.beta * error;
        self.mean_s = (1.0 - self.config.alpha) * self.mean_s + self.config.alpha * interval;
        (Some(interval), anomaly)
    }

    /// Smoothed mean interval.
    pub fn mean_s(&self) -> f64 {
        self.mean_s
    }

    /// Smoothed mean deviation.
    pub fn deviation_s(&self) -> f64 {
        self.deviation_s
    }

    /// Intervals observed.
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(tracker: &mut EwmaTracker, times_s: &[f64]) -> Vec<Option<Anomaly>> {
        times_s
            .iter()
            .map(|&t| tracker.observe(SimTime::from_secs(t)).1)
            .collect()
    }

    #[test]
    fn test_first_interval_seeds_mean() {
        let mut tracker = EwmaTracker::new(EwmaConfig::default());
        assert_eq!(tracker.observe(SimTime::from_secs(10.0)), (None, None));
        assert_eq!(tracker.observe(SimTime::from_secs(70.0)), (Some(60.0), None));
        assert_eq!(tracker.mean_s(), 60.0);
        assert_eq!(tracker.deviation_s(), 30.0);
    }

    #[test]
    fn test_regular_traffic_then_burst() {
        let mut tracker = EwmaTracker::new(EwmaConfig::default());
        let regular: Vec<f64> = (0..20).map(|i| i as f64 * 60.0).collect();
        assert!(feed(&mut tracker, &regular).iter().all(Option::is_none));
        assert!((tracker.mean_s() - 60.0).abs() < 1e-9);

        // A packet 1 s after the previous one is far outside the band.
        let anomaly = tracker.observe(SimTime::from_secs(19.0 * 60.0 + 1.0)).1.unwrap();
        assert_eq!(anomaly.interval_s, 1.0);
        assert!((anomaly.expected_s - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_anomaly_during_warmup() {
        let mut tracker = EwmaTracker::new(EwmaConfig::default());
        // Intervals 60, 60, 1, 60, 1: only 5 samples, warm-up not over.
        let out = feed(&mut tracker, &[0.0, 60.0, 120.0, 121.0, 181.0, 182.0]);
        assert!(out.iter().all(Option::is_none));
        assert_eq!(tracker.samples(), 5);
    }
}
