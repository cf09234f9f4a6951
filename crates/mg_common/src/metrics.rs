//! Operation timings and counters for operational visibility.

use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::pool::PoolStats;
use crate::prelude::*;

/// Timing of a full chunk synthesis unit, from validation to the last packet sent.
pub const OP_SYNTHESIZE_CHUNK: &str = "synthesize_chunk";
/// Timing of reading a terrain column from the host.
pub const OP_TERRAIN_FETCH: &str = "terrain_fetch";
/// Timing of scheduling a dispatch to one viewer.
pub const OP_DISPATCH: &str = "dispatch";
/// Timing of a positional block change batch.
pub const OP_MULTI_BLOCK_CHANGE: &str = "multi_block_change";
/// Timing of a periodic overlay cache sweep.
pub const OP_SWEEP: &str = "cache_sweep";

/// Synthesis units that completed and sent their packets.
pub const COUNTER_UNITS_COMPLETED: &str = "units_completed";
/// Synthesis units abandoned because of a classified processing error.
pub const COUNTER_PROCESSING_ERRORS: &str = "processing_errors";
/// Synthesis units abandoned because of a panic.
pub const COUNTER_UNEXPECTED_ERRORS: &str = "unexpected_errors";
/// Columns sent with empty light because the snapshot's light could not be extracted.
pub const COUNTER_LIGHT_FALLBACKS: &str = "light_extraction_fallbacks";
/// Overlay slice lookups served by the recency cache.
pub const COUNTER_RECENT_HITS: &str = "recent_chunk_hits";
/// Overlay slice lookups that missed the recency cache.
pub const COUNTER_RECENT_MISSES: &str = "recent_chunk_misses";
/// Drip tasks replaced by a newer dispatch to the same viewer.
pub const COUNTER_DRIPS_REPLACED: &str = "drips_replaced";

/// Aggregated timing of a named operation.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct OperationTiming {
    /// Number of recorded runs
    pub count: u64,
    /// Sum of all recorded durations
    pub total: Duration,
    /// Longest recorded duration
    pub max: Duration,
}

impl OperationTiming {
    /// Mean duration, zero if nothing was recorded.
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / (self.count.min(u64::from(u32::MAX)) as u32)
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }
}

/// Collects timings and counters from every engine component.
#[derive(Default)]
pub struct PerformanceMonitor {
    timings: DashMap<&'static str, OperationTiming>,
    counters: DashMap<&'static str, u64>,
}

impl PerformanceMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single run of an operation.
    pub fn record(&self, operation: &'static str, elapsed: Duration) {
        self.timings.entry(operation).or_default().record(elapsed);
    }

    /// Runs `f` and records how long it took.
    pub fn time<R>(&self, operation: &'static str, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record(operation, start.elapsed());
        result
    }

    /// Increments a counter by one.
    pub fn increment(&self, counter: &'static str) {
        self.add(counter, 1);
    }

    /// Increments a counter.
    pub fn add(&self, counter: &'static str, amount: u64) {
        *self.counters.entry(counter).or_default() += amount;
    }

    /// Current value of a counter.
    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).map_or(0, |c| *c)
    }

    /// Current aggregate of an operation.
    pub fn timing(&self, operation: &str) -> Option<OperationTiming> {
        self.timings.get(operation).map(|t| *t)
    }

    /// A sorted snapshot of everything recorded so far.
    pub fn report(&self) -> PerformanceReport {
        PerformanceReport {
            timings: self
                .timings
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .sorted_by_key(|(name, _)| *name)
                .collect(),
            counters: self
                .counters
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .sorted_by_key(|(name, _)| *name)
                .collect(),
            pools: Vec::new(),
        }
    }

    /// Forgets all timings and counters.
    pub fn reset(&self) {
        self.timings.clear();
        self.counters.clear();
    }
}

/// A point-in-time copy of a [`PerformanceMonitor`].
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PerformanceReport {
    /// Operation timings sorted by name
    pub timings: Vec<(&'static str, OperationTiming)>,
    /// Counters sorted by name
    pub counters: Vec<(&'static str, u64)>,
    /// Buffer pool statistics, filled in by the engine
    pub pools: Vec<(&'static str, PoolStats)>,
}

impl PerformanceReport {
    /// Looks up a counter, zero if it was never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.iter().find(|(n, _)| *n == name).map_or(0, |(_, v)| *v)
    }

    /// Looks up an operation timing.
    pub fn timing(&self, name: &str) -> Option<OperationTiming> {
        self.timings.iter().find(|(n, _)| *n == name).map(|(_, t)| *t)
    }
}

impl Display for PerformanceReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Overlay engine performance:")?;
        for (name, t) in &self.timings {
            writeln!(
                f,
                "  {name}: count={} avg={:?} max={:?}",
                t.count,
                t.average(),
                t.max
            )?;
        }
        for (name, value) in &self.counters {
            writeln!(f, "  {name}: {value}")?;
        }
        for (name, p) in &self.pools {
            writeln!(
                f,
                "  pool {name}: idle={} hits={} misses={} dropped={}",
                p.idle, p.hits, p.misses, p.dropped
            )?;
        }
        Ok(())
    }
}
