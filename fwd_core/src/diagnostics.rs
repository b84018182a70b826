//! Fit diagnostics: named numeric events delivered to an observer.
//!
//! The fitter never depends on a histogram backend. It reports events to a
//! [`FitObserver`]; [`HistogramObserver`] accumulates simple per-name
//! statistics behind a mutex so candidates can be fitted in parallel.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Event names.
pub mod events {
    pub const SEED_CURVATURE: &str = "seed.curvature";
    pub const SEED_PT: &str = "seed.pt";
    pub const SEED_ETA: &str = "seed.eta";
    pub const FIT_TOTAL: &str = "fit.total";
    pub const FIT_PASS: &str = "fit.pass";
    pub const FIT_FAIL: &str = "fit.fail";
    pub const FIT_EXCEPTION: &str = "fit.exception";
    pub const FIT_GOOD_CARDINAL: &str = "fit.good_cardinal";
    pub const FIT_DURATION_MS: &str = "fit.duration_ms";
    pub const FIT_FAILED_DURATION_MS: &str = "fit.failed_duration_ms";
    pub const DELTA_SEED_PT: &str = "fit.delta_seed_pt";
    pub const DELTA_SEED_ETA: &str = "fit.delta_seed_eta";
    pub const DELTA_SEED_PHI: &str = "fit.delta_seed_phi";
    pub const GLOBAL_REFIT_FAILED: &str = "refine.global_refit_failed";
}

pub trait FitObserver: Send + Sync {
    fn record(&self, name: &'static str, value: f64);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl FitObserver for NoopObserver {
    fn record(&self, _name: &'static str, _value: f64) {}
}

/// Accumulated statistics of one event name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn fill(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Standard deviation of the filled values.
    pub fn rms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

#[derive(Debug, Default)]
pub struct HistogramObserver {
    entries: Mutex<BTreeMap<&'static str, HistogramSummary>>,
}

impl HistogramObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, HistogramSummary> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    pub fn get(&self, name: &str) -> Option<HistogramSummary> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(name).cloned()
    }
}

impl FitObserver for HistogramObserver {
    fn record(&self, name: &'static str, value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(name).or_default().fill(value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
