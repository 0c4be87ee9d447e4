//! Per-symbol confidence samples for the collapse check.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// One observation of a symbol's signals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceSample {
    pub at: DateTime<Utc>,
    pub confidence: Option<f64>,
    pub win_probability: Option<f64>,
}

/// Rolling sample history, one queue per symbol, oldest first.
#[derive(Debug, Default)]
pub struct ConfidenceHistory {
    samples: HashMap<String, VecDeque<ConfidenceSample>>,
}

impl ConfidenceHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, symbol: &str, sample: ConfidenceSample) {
        let queue = self.samples.entry(symbol.to_string()).or_default();
        // Samples arrive in clock order; a clock stepped backwards restarts the queue.
        if queue.back().is_some_and(|last| last.at > sample.at) {
            queue.clear();
        }
        queue.push_back(sample);
    }

    /// Most recent sample taken at or before `cutoff`.
    #[must_use]
    pub fn baseline(&self, symbol: &str, cutoff: DateTime<Utc>) -> Option<ConfidenceSample> {
        self.samples
            .get(symbol)?
            .iter()
            .rev()
            .find(|s| s.at <= cutoff)
            .copied()
    }

    /// Drop samples that can no longer be a baseline for any `cutoff`
    /// at or after the given one.
    pub fn prune(&mut self, symbol: &str, cutoff: DateTime<Utc>) {
        if let Some(queue) = self.samples.get_mut(symbol) {
            while queue.len() >= 2 && queue[1].at <= cutoff {
                queue.pop_front();
            }
        }
    }

    pub fn remove(&mut self, symbol: &str) {
        self.samples.remove(symbol);
    }

    /// Keep only the given symbols.
    pub fn retain_symbols(&mut self, open: &[&str]) {
        self.samples.retain(|symbol, _| open.contains(&symbol.as_str()));
    }

    #[must_use]
    pub fn len(&self, symbol: &str) -> usize {
        self.samples.get(symbol).map_or(0, VecDeque::len)
    }
}
