use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::crd::ScalingAlgorithm;

/// Statistics are only meaningful from this many samples.
pub const MIN_SAMPLES: usize = 3;

/* ============================= SAMPLES ============================= */

/// One usage observation for a container, stamped with the provider's time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    pub at: DateTime<Utc>,
    pub cpu_milli: i64,
    pub memory_bytes: i64,
}

/// Identity of a sampled container: `namespace/pod/container`.
pub fn usage_key(namespace: &str, pod: &str, container: &str) -> String {
    format!("{namespace}/{pod}/{container}")
}

/* ============================= STATS ============================= */

/// Summary of one resource over the retained window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceStats {
    pub mean: i64,
    pub max: i64,
    pub percentile: i64,
    pub ewma: i64,
}

impl ResourceStats {
    /// Pick the value the configured algorithm calls for.
    pub fn select(&self, algorithm: ScalingAlgorithm) -> i64 {
        match algorithm {
            ScalingAlgorithm::Mean => self.mean,
            ScalingAlgorithm::Percentile => self.percentile,
            ScalingAlgorithm::Max => self.max,
            ScalingAlgorithm::Ewma => self.ewma,
        }
    }
}

/// Derived statistics for one container window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageStats {
    pub n: usize,
    pub cpu: ResourceStats,
    pub memory: ResourceStats,
}

/// Percentile over the window: index `floor(p/100 · (n−1))` of the
/// ascending sort. Biases low on small windows, which keeps borderline
/// pods from flapping.
pub fn percentile_of(values: &[i64], percentile: u8) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = (percentile as usize * (sorted.len() - 1)) / 100;
    sorted[idx]
}

/// Exponentially-weighted moving average with `α = 2/(N+1)`, oldest first.
pub fn ewma_of(values: &[i64]) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let alpha = 2.0 / (values.len() as f64 + 1.0);
    let mut acc = values[0] as f64;
    for v in &values[1..] {
        acc = alpha * *v as f64 + (1.0 - alpha) * acc;
    }
    acc.round() as i64
}

fn summarize(values: &[i64], percentile: u8) -> ResourceStats {
    let n = values.len().max(1) as i64;
    ResourceStats {
        mean: values.iter().sum::<i64>() / n,
        max: values.iter().copied().max().unwrap_or(0),
        percentile: percentile_of(values, percentile),
        ewma: ewma_of(values),
    }
}

/* ============================= WINDOW ============================= */

/// Bounded, append-only ring of samples for one container.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    samples: VecDeque<UsageSample>,
    capacity: usize,
}

impl UsageWindow {
    pub fn new(capacity: usize) -> Self {
        UsageWindow {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: UsageSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.at)
    }

    /// Compute stats, or `None` below the sample minimum.
    pub fn stats(&self, cpu_percentile: u8, memory_percentile: u8) -> Option<UsageStats> {
        if self.samples.len() < MIN_SAMPLES {
            return None;
        }
        let cpu: Vec<i64> = self.samples.iter().map(|s| s.cpu_milli).collect();
        let memory: Vec<i64> = self.samples.iter().map(|s| s.memory_bytes).collect();
        Some(UsageStats {
            n: self.samples.len(),
            cpu: summarize(&cpu, cpu_percentile),
            memory: summarize(&memory, memory_percentile),
        })
    }
}

/* ============================= STORE ============================= */

/// Shared in-memory history for all observed containers.
///
/// The sampler task writes, the reconciler reads. History does not survive
/// restarts: until the window refills, reconciles defer on insufficient
/// data.
#[derive(Debug, Default)]
pub struct UsageStore {
    inner: RwLock<HashMap<String, UsageWindow>>,
}

impl UsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample, resizing the ring if the window config changed.
    pub async fn record(&self, key: &str, sample: UsageSample, capacity: usize) {
        let mut map = self.inner.write().await;
        let window = map
            .entry(key.to_string())
            .or_insert_with(|| UsageWindow::new(capacity));
        if window.capacity != capacity.max(1) {
            window.capacity = capacity.max(1);
            while window.samples.len() > window.capacity {
                window.samples.pop_front();
            }
        }
        window.push(sample);
    }

    pub async fn stats(
        &self,
        key: &str,
        cpu_percentile: u8,
        memory_percentile: u8,
    ) -> Option<UsageStats> {
        let map = self.inner.read().await;
        map.get(key)?.stats(cpu_percentile, memory_percentile)
    }

    pub async fn sample_count(&self, key: &str) -> usize {
        let map = self.inner.read().await;
        map.get(key).map(UsageWindow::len).unwrap_or(0)
    }

    /// Drop windows whose newest sample is older than `max_age`.
    ///
    /// Called from the sampler so histories for deleted pods do not
    /// accumulate. Returns the number of evicted windows.
    pub async fn evict_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, window| {
            window
                .last_seen()
                .is_some_and(|seen| now.signed_duration_since(seen) <= max_age)
        });
        before - map.len()
    }

    pub async fn tracked_containers(&self) -> usize {
        self.inner.read().await.len()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: i64, mem: i64) -> UsageSample {
        UsageSample {
            at: Utc::now(),
            cpu_milli: cpu,
            memory_bytes: mem,
        }
    }

    #[test]
    fn test_percentile_p95_of_five_samples() {
        // p95 over five samples picks the second-highest value.
        let values = vec![120, 110, 130, 115, 125];
        assert_eq!(percentile_of(&values, 95), 125);
    }

    #[test]
    fn test_percentile_median() {
        assert_eq!(percentile_of(&[1, 2, 3, 4, 5], 50), 3);
    }

    #[test]
    fn test_percentile_single_value() {
        assert_eq!(percentile_of(&[42], 95), 42);
        assert_eq!(percentile_of(&[42], 1), 42);
    }

    #[test]
    fn test_percentile_empty() {
        assert_eq!(percentile_of(&[], 95), 0);
    }

    #[test]
    fn test_percentile_unsorted_input() {
        assert_eq!(percentile_of(&[500, 100, 300], 1), 100);
    }

    #[test]
    fn test_ewma_constant_series() {
        assert_eq!(ewma_of(&[100, 100, 100, 100]), 100);
    }

    #[test]
    fn test_ewma_weighs_recent_samples() {
        let rising = ewma_of(&[100, 100, 100, 400]);
        assert!(rising > 100 && rising < 400);
        let falling = ewma_of(&[400, 100, 100, 100]);
        assert!(falling < rising);
    }

    #[test]
    fn test_ewma_empty() {
        assert_eq!(ewma_of(&[]), 0);
    }

    #[test]
    fn test_window_bounded() {
        let mut window = UsageWindow::new(3);
        for cpu in [1, 2, 3, 4, 5] {
            window.push(sample(cpu, cpu * 100));
        }
        assert_eq!(window.len(), 3);
        // Oldest samples were evicted.
        let stats = window.stats(95, 95).unwrap();
        assert_eq!(stats.cpu.max, 5);
        assert_eq!(stats.cpu.mean, 4);
    }

    #[test]
    fn test_window_below_minimum_yields_none() {
        let mut window = UsageWindow::new(10);
        window.push(sample(100, 1000));
        window.push(sample(110, 1100));
        assert_eq!(window.stats(95, 95), None);
    }

    #[test]
    fn test_window_at_minimum_yields_stats() {
        let mut window = UsageWindow::new(10);
        for cpu in [100, 110, 120] {
            window.push(sample(cpu, cpu * 1000));
        }
        let stats = window.stats(95, 95).unwrap();
        assert_eq!(stats.n, 3);
        assert_eq!(stats.cpu.mean, 110);
        assert_eq!(stats.memory.max, 120_000);
    }

    #[test]
    fn test_stats_select_per_algorithm() {
        let stats = ResourceStats {
            mean: 1,
            max: 2,
            percentile: 3,
            ewma: 4,
        };
        assert_eq!(stats.select(ScalingAlgorithm::Mean), 1);
        assert_eq!(stats.select(ScalingAlgorithm::Max), 2);
        assert_eq!(stats.select(ScalingAlgorithm::Percentile), 3);
        assert_eq!(stats.select(ScalingAlgorithm::Ewma), 4);
    }

    #[tokio::test]
    async fn test_store_record_and_stats() {
        let store = UsageStore::new();
        let key = usage_key("prod", "web-1", "app");
        for cpu in [100, 120, 140] {
            store.record(&key, sample(cpu, cpu * 1000), 12).await;
        }
        let stats = store.stats(&key, 95, 95).await.unwrap();
        assert_eq!(stats.n, 3);
        assert_eq!(stats.cpu.max, 140);
        assert_eq!(store.sample_count(&key).await, 3);
    }

    #[tokio::test]
    async fn test_store_unknown_key() {
        let store = UsageStore::new();
        assert_eq!(store.stats("prod/ghost/app", 95, 95).await, None);
        assert_eq!(store.sample_count("prod/ghost/app").await, 0);
    }

    #[tokio::test]
    async fn test_store_shrinks_window_when_config_shrinks() {
        let store = UsageStore::new();
        let key = usage_key("prod", "web-1", "app");
        for cpu in 0..10 {
            store.record(&key, sample(cpu, 1000), 10).await;
        }
        store.record(&key, sample(99, 1000), 4).await;
        assert_eq!(store.sample_count(&key).await, 4);
    }

    #[tokio::test]
    async fn test_store_evicts_stale_windows() {
        let store = UsageStore::new();
        let old = UsageSample {
            at: Utc::now() - Duration::minutes(30),
            cpu_milli: 100,
            memory_bytes: 1000,
        };
        store.record("prod/old/app", old, 12).await;
        store.record("prod/new/app", sample(100, 1000), 12).await;

        let evicted = store.evict_stale(Utc::now(), Duration::minutes(10)).await;
        assert_eq!(evicted, 1);
        assert_eq!(store.tracked_containers().await, 1);
        assert_eq!(store.sample_count("prod/old/app").await, 0);
    }

    #[test]
    fn test_usage_key_format() {
        assert_eq!(usage_key("ns", "pod", "c"), "ns/pod/c");
    }
}
