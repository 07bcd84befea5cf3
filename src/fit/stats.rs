//! Per-step statistics and the sinks that consume them.

use std::collections::BTreeMap;

use tracing::info;

/// Metric name to scalar value, in deterministic key order.
pub type Stats = BTreeMap<String, f64>;

/// Receives the statistics of every accepted training step.
pub trait StatsSink {
    fn record(&mut self, step: u64, stats: &Stats);
}

impl<K: StatsSink + ?Sized> StatsSink for &mut K {
    fn record(&mut self, step: u64, stats: &Stats) {
        (**self).record(step, stats)
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn record(&mut self, _step: u64, _stats: &Stats) {}
}

/// Emits one `tracing` event per step.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl StatsSink for TracingSink {
    fn record(&mut self, step: u64, stats: &Stats) {
        let e_mean = stats.get("E_loc/mean").copied().unwrap_or(f64::NAN);
        let e_std = stats.get("E_loc/std").copied().unwrap_or(f64::NAN);
        let rest = stats
            .iter()
            .filter(|(k, _)| !k.starts_with("E_loc/"))
            .map(|(k, v)| format!("{}={:.5}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        info!(step, e_mean, e_std, "{}", rest);
    }
}

/// Keeps the full trajectory in memory.
#[derive(Clone, Debug, Default)]
pub struct HistorySink {
    pub records: Vec<(u64, Stats)>,
}

impl HistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of one metric across all recorded steps (NaN where missing).
    pub fn series(&self, key: &str) -> Vec<f64> {
        self.records
            .iter()
            .map(|(_, stats)| stats.get(key).copied().unwrap_or(f64::NAN))
            .collect()
    }
}

impl StatsSink for HistorySink {
    fn record(&mut self, step: u64, stats: &Stats) {
        self.records.push((step, stats.clone()));
    }
}
