use std::{
    fmt, result,
    sync::atomic::{AtomicUsize, Ordering::SeqCst},
};

#[allow(unused_imports)]
use crate::relaxed::Index;
use crate::util::spinlock;

/// Running counters, updated by foreground operations and the balancer.
#[derive(Default)]
pub(crate) struct Counters {
    pub submitted: AtomicUsize,
    pub processed: AtomicUsize,
    pub retried: AtomicUsize,
    pub dropped: AtomicUsize,
    pub rotations: AtomicUsize,
    pub recolors: AtomicUsize,
    pub restarts: AtomicUsize,
    pub deferrals: AtomicUsize,
    pub reuses: AtomicUsize,
}

#[inline]
pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, SeqCst);
}

/// Statistic type, for [Index] type.
pub struct Stats {
    pub name: String,
    pub n_count: usize,
    /// Number of slots handed out by the arena, including free slots.
    pub n_slots: usize,
    pub n_free: usize,
    /// Requests submitted to the balancer, by writers and by the balancer.
    pub n_submitted: usize,
    /// Requests handled by the balancer, including stale ones.
    pub n_processed: usize,
    /// Requests re-queued after a latch timeout or a concurrent change.
    pub n_retried: usize,
    /// Requests dropped because the balancer was shut down.
    pub n_dropped: usize,
    pub n_rotations: usize,
    pub n_recolors: usize,
    /// Number of times remove() restarted from root.
    pub n_restarts: usize,
    /// Number of times remove() gave up on the parent latch and
    /// deferred the unlink to the balancer.
    pub n_deferrals: usize,
    /// Number of inserts that reused a leaf pending removal.
    pub n_reuses: usize,
    pub latch_stats: spinlock::Stats,
    /// Number of black nodes from root to leaf, available only when
    /// the tree validates.
    pub blacks: Option<usize>,
    pub depths: Option<Depth>,
}

impl Stats {
    pub(crate) fn new(name: &str, counters: &Counters) -> Stats {
        Stats {
            name: name.to_string(),
            n_count: Default::default(),
            n_slots: Default::default(),
            n_free: Default::default(),
            n_submitted: counters.submitted.load(SeqCst),
            n_processed: counters.processed.load(SeqCst),
            n_retried: counters.retried.load(SeqCst),
            n_dropped: counters.dropped.load(SeqCst),
            n_rotations: counters.rotations.load(SeqCst),
            n_recolors: counters.recolors.load(SeqCst),
            n_restarts: counters.restarts.load(SeqCst),
            n_deferrals: counters.deferrals.load(SeqCst),
            n_reuses: counters.reuses.load(SeqCst),
            latch_stats: Default::default(),
            blacks: None,
            depths: None,
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let none = "none".to_string();
        let b = self.blacks.as_ref().map_or(none.clone(), |x| x.to_string());
        let d = self.depths.as_ref().map_or(none, |x| x.to_string());
        writeln!(f, "rrbt.name = {}", self.name)?;
        writeln!(
            f,
            "rrbt = {{ n_count={}, n_slots={}, n_free={}, blacks={} }}",
            self.n_count, self.n_slots, self.n_free, b,
        )?;
        writeln!(
            f,
            concat!(
                "rrbt.balancer = {{ submitted={}, processed={}, retried={}, ",
                "dropped={}, rotations={}, recolors={} }}"
            ),
            self.n_submitted,
            self.n_processed,
            self.n_retried,
            self.n_dropped,
            self.n_rotations,
            self.n_recolors,
        )?;
        writeln!(
            f,
            "rrbt.writers = {{ restarts={}, deferrals={}, reuses={} }}",
            self.n_restarts, self.n_deferrals, self.n_reuses,
        )?;
        writeln!(f, "rrbt.latch_stats = {}", self.latch_stats)?;
        writeln!(f, "rrbt.depths = {}", d)
    }
}

/// Statistic type, that captures minimum, maximum, average and percentile of
/// leaf-node depth in the tree.
#[derive(Clone)]
pub struct Depth {
    pub samples: usize,
    pub min: usize,
    pub max: usize,
    pub total: usize,
    pub depths: [u64; 256],
}

impl Default for Depth {
    fn default() -> Self {
        Depth {
            samples: 0,
            min: usize::MAX,
            max: usize::MIN,
            total: 0,
            depths: [0; 256],
        }
    }
}

impl Depth {
    /// Record a sample, each sample specify the depth of single branch from root to
    /// leaf-node.
    pub fn sample(&mut self, depth: usize) {
        self.samples += 1;
        self.total += depth;
        self.min = usize::min(self.min, depth);
        self.max = usize::max(self.max, depth);
        self.depths[usize::min(depth, 255)] += 1;
    }

    /// Return number of sample recorded
    pub fn to_samples(&self) -> usize {
        self.samples
    }

    /// Return minimum depth of leaf-node in the tree.
    pub fn to_min(&self) -> usize {
        self.min
    }

    /// Return maximum depth of leaf-node in the tree.
    pub fn to_max(&self) -> usize {
        self.max
    }

    /// Return the average depth of leaf-nodes in the tree.
    pub fn to_mean(&self) -> usize {
        if self.samples == 0 {
            0
        } else {
            self.total / self.samples
        }
    }

    /// Return depth as tuple of percentiles, each tuple provides
    /// (percentile, depth). Returned percentiles from 91 .. 99
    pub fn to_percentiles(&self) -> Vec<(u8, usize)> {
        let mut percentiles: Vec<(u8, usize)> = vec![];
        let (mut acc, mut prev_perc) = (0_u64, 90_u8);
        let iter = self.depths.iter().enumerate().filter(|(_, &item)| item > 0);
        for (depth, samples) in iter {
            acc += *samples;
            let perc = ((acc as f64 / (self.samples as f64)) * 100_f64) as u8;
            if perc > prev_perc {
                percentiles.push((perc, depth));
                prev_perc = perc;
            }
        }
        percentiles
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let (n, min, mean, max) = (self.samples, self.min, self.to_mean(), self.max);
        let props: Vec<String> = self
            .to_percentiles()
            .into_iter()
            .map(|(perc, depth)| format!(r#""{}" = {}"#, perc, depth))
            .collect();
        let depth = props.join(", ");

        writeln!(f, "{{ samples={}, min={}, mean={}, max={},", n, min, mean, max)?;
        writeln!(f, "  percentiles={{ {} }} }}", depth)
    }
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod stats_test;
