//! Fixed-size rolling windows.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::sample::HistogramStats;

/// Upper bounds of the fixed histogram buckets. Durations are recorded in
/// milliseconds, so the bounds cover sub-millisecond to one minute.
pub(crate) const BUCKET_BOUNDS: [f64; 16] = [
    0.5,
    1.0,
    2.5,
    5.0,
    10.0,
    25.0,
    50.0,
    100.0,
    250.0,
    500.0,
    1_000.0,
    2_500.0,
    5_000.0,
    10_000.0,
    60_000.0,
    f64::INFINITY,
];

/// Maps wall time to window slots.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotClock {
    started: Instant,
    window_ms: u64,
}

impl SlotClock {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            started: Instant::now(),
            window_ms: (window.as_millis() as u64).max(1),
        }
    }

    pub(crate) fn slot(&self) -> u64 {
        self.started.elapsed().as_millis() as u64 / self.window_ms
    }
}

/// Ring of per-slot accumulators; slots older than `window_count` fall off.
#[derive(Debug)]
pub(crate) struct Rolling<T> {
    slots: VecDeque<(u64, T)>,
    window_count: u64,
}

impl<T: Default> Rolling<T> {
    pub(crate) fn new(window_count: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(window_count),
            window_count: window_count.max(1) as u64,
        }
    }

    fn oldest_live(&self, slot: u64) -> u64 {
        slot.saturating_sub(self.window_count - 1)
    }

    fn expire(&mut self, slot: u64) {
        let oldest = self.oldest_live(slot);
        while self.slots.front().is_some_and(|(s, _)| *s < oldest) {
            self.slots.pop_front();
        }
    }

    /// Accumulator for `slot`, created on first use.
    pub(crate) fn current(&mut self, slot: u64) -> &mut T {
        self.expire(slot);
        if self.slots.back().is_none_or(|(s, _)| *s != slot) {
            self.slots.push_back((slot, T::default()));
        }
        let last = self.slots.len() - 1;
        &mut self.slots[last].1
    }

    /// Accumulators still inside the window ending at `slot`.
    pub(crate) fn live(&self, slot: u64) -> impl Iterator<Item = &T> {
        let oldest = self.oldest_live(slot);
        self.slots
            .iter()
            .filter(move |(s, _)| *s >= oldest && *s <= slot)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct HistogramBucket {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    buckets: [u64; BUCKET_BOUNDS.len()],
}

impl HistogramBucket {
    pub(crate) fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        let idx = BUCKET_BOUNDS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(BUCKET_BOUNDS.len() - 1);
        self.buckets[idx] += 1;
    }

    pub(crate) fn merge(&mut self, other: &HistogramBucket) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.min = other.min;
            self.max = other.max;
        } else {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
        self.count += other.count;
        self.sum += other.sum;
        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
    }

    fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = ((q * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (idx, n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= target {
                let bound = BUCKET_BOUNDS[idx];
                return if bound.is_finite() {
                    bound.clamp(self.min, self.max)
                } else {
                    self.max
                };
            }
        }
        self.max
    }

    pub(crate) fn stats(&self) -> HistogramStats {
        if self.count == 0 {
            return HistogramStats::default();
        }
        HistogramStats {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.sum / self.count as f64,
            p50: self.quantile(0.50),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_drops_old_slots() {
        let mut rolling: Rolling<u64> = Rolling::new(3);
        *rolling.current(0) += 1;
        *rolling.current(1) += 2;
        *rolling.current(2) += 3;
        assert_eq!(rolling.live(2).sum::<u64>(), 6);

        *rolling.current(3) += 4;
        assert_eq!(rolling.live(3).sum::<u64>(), 9);
        assert_eq!(rolling.live(10).sum::<u64>(), 0);
    }

    #[test]
    fn test_same_slot_accumulates() {
        let mut rolling: Rolling<u64> = Rolling::new(2);
        *rolling.current(5) += 1;
        *rolling.current(5) += 1;
        assert_eq!(rolling.live(5).sum::<u64>(), 2);
    }

    #[test]
    fn test_histogram_stats() {
        let mut h = HistogramBucket::default();
        for v in 1..=100 {
            h.observe(v as f64);
        }
        let stats = h.stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!((stats.mean - 50.5).abs() < f64::EPSILON);
        assert_eq!(stats.p50, 50.0);
        assert_eq!(stats.p99, 100.0);
    }

    #[test]
    fn test_histogram_merge() {
        let mut a = HistogramBucket::default();
        a.observe(3.0);
        let mut b = HistogramBucket::default();
        b.observe(7000.0);
        a.merge(&b);
        let stats = a.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max, 7000.0);
        assert_eq!(stats.min, 3.0);
    }
}
