//! Rolling numeric samples with half-life decay.
//!
//! Both the per-host latency estimator and the manager-level speed stats are
//! backed by the same structure: a fixed-capacity ring of recent samples.
//! Decayed trackers age their samples toward zero so that an old penalty
//! stops dominating the estimate once fresh samples arrive.

use std::time::Duration;
use tokio::time::Instant;

const RING_CAPACITY: usize = 1000;

/// Fixed-capacity rolling buffer of `f64` samples.
pub(crate) struct DataPoints {
    samples: Vec<f64>,
    cnt: usize,
    half_life: Duration,
    last_decay: Instant,
}

impl DataPoints {
    /// A zero `half_life` disables decay entirely.
    pub fn new(half_life: Duration) -> Self {
        Self {
            samples: Vec::new(),
            cnt: 0,
            half_life,
            last_decay: Instant::now(),
        }
    }

    /// Append a sample, evicting the oldest once the ring is full.
    pub fn track(&mut self, sample: f64) {
        if self.samples.len() < RING_CAPACITY {
            self.samples.push(sample);
        } else {
            self.samples[self.cnt % RING_CAPACITY] = sample;
        }
        self.cnt += 1;
    }

    /// Arithmetic mean over the current samples; 0 when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// The 90th-percentile sample (nearest rank, no interpolation); 0 when
    /// empty.
    pub fn p90(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);
        let rank = (0.9 * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1)]
    }

    /// Advance the decay using the wall clock. No-op without a half-life.
    pub fn recompute(&mut self) {
        if self.half_life.is_zero() {
            return;
        }
        let elapsed = self.last_decay.elapsed();
        self.last_decay = Instant::now();
        let factor = 0.5f64.powf(elapsed.as_secs_f64() / self.half_life.as_secs_f64());
        for s in &mut self.samples {
            *s *= factor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats_are_zero() {
        let dp = DataPoints::new(Duration::ZERO);
        assert_eq!(dp.average(), 0.0);
        assert_eq!(dp.p90(), 0.0);
    }

    #[test]
    fn test_average_and_p90() {
        let mut dp = DataPoints::new(Duration::ZERO);
        for i in 1..=10 {
            dp.track(i as f64);
        }
        assert_eq!(dp.average(), 5.5);
        assert_eq!(dp.p90(), 9.0);
    }

    #[test]
    fn test_p90_single_sample() {
        let mut dp = DataPoints::new(Duration::ZERO);
        dp.track(42.0);
        assert_eq!(dp.p90(), 42.0);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut dp = DataPoints::new(Duration::ZERO);
        for _ in 0..RING_CAPACITY {
            dp.track(1000.0);
        }
        // the next sample overwrites the oldest slot
        dp.track(0.0);
        assert!(dp.average() < 1000.0);
        for _ in 0..RING_CAPACITY {
            dp.track(2.0);
        }
        assert_eq!(dp.average(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_halves_after_half_life() {
        let mut dp = DataPoints::new(Duration::from_secs(60));
        dp.track(100.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        dp.recompute();
        assert!((dp.average() - 50.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_half_life_never_decays() {
        let mut dp = DataPoints::new(Duration::ZERO);
        dp.track(100.0);
        tokio::time::advance(Duration::from_secs(3600)).await;
        dp.recompute();
        assert_eq!(dp.average(), 100.0);
    }
}
