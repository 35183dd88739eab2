//! Device capability estimate: platform signals plus a short canvas
//! benchmark, combined into a batch size and quality tier.

use crate::config::CapabilitySettings;
use crate::models::{DeviceCapabilities, NetworkClass};
use capture_imaging::{benchmark, QualityTier};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Values used when a platform signal is missing
pub const DEFAULT_MEMORY_GB: f64 = 4.0;
pub const DEFAULT_CPU_CORES: u32 = 4;
pub const DEFAULT_NETWORK: NetworkClass = NetworkClass::Medium;
/// Score used when the benchmark fails or times out
pub const FALLBACK_PERFORMANCE_SCORE: u8 = 50;

pub const MAX_BATCH_SIZE: usize = 6;

/// Connection hints as reported by the platform; every field optional
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkHint {
    /// "slow-2g", "2g", "3g" or "4g"
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u32>,
}

impl NetworkHint {
    /// Slowest class any present field points to; `None` without any field
    pub fn classify(&self) -> Option<NetworkClass> {
        let by_type = self.effective_type.as_deref().map(|t| match t {
            "slow-2g" | "2g" => NetworkClass::Slow,
            "3g" => NetworkClass::Medium,
            _ => NetworkClass::Fast,
        });
        let by_downlink = self.downlink_mbps.map(|mbps| {
            if mbps < 1.0 {
                NetworkClass::Slow
            } else if mbps < 5.0 {
                NetworkClass::Medium
            } else {
                NetworkClass::Fast
            }
        });
        let by_rtt = self.rtt_ms.map(|rtt| {
            if rtt > 500 {
                NetworkClass::Slow
            } else if rtt > 150 {
                NetworkClass::Medium
            } else {
                NetworkClass::Fast
            }
        });
        [by_type, by_downlink, by_rtt].into_iter().flatten().min()
    }
}

/// Platform signal source. Each method returns `None` when the platform
/// cannot tell.
pub trait CapabilityProbe: Send + Sync {
    fn memory_gb(&self) -> Option<f64>;
    fn cpu_cores(&self) -> Option<u32>;
    fn network(&self) -> Option<NetworkHint>;
}

/// Reads `/proc/meminfo` and the available parallelism
#[derive(Debug, Clone, Default)]
pub struct SystemProbe {
    network: Option<NetworkHint>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network hint supplied by the embedding application
    pub fn with_network(mut self, hint: NetworkHint) -> Self {
        self.network = Some(hint);
        self
    }
}

impl CapabilityProbe for SystemProbe {
    fn memory_gb(&self) -> Option<f64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
        let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb / (1024.0 * 1024.0))
    }

    fn cpu_cores(&self) -> Option<u32> {
        std::thread::available_parallelism()
            .ok()
            .map(|n| n.get() as u32)
    }

    fn network(&self) -> Option<NetworkHint> {
        self.network.clone()
    }
}

/// Fixed signals, for tests and for callers that already know them
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub memory_gb: Option<f64>,
    pub cpu_cores: Option<u32>,
    pub network: Option<NetworkHint>,
}

impl CapabilityProbe for StaticProbe {
    fn memory_gb(&self) -> Option<f64> {
        self.memory_gb
    }

    fn cpu_cores(&self) -> Option<u32> {
        self.cpu_cores
    }

    fn network(&self) -> Option<NetworkHint> {
        self.network.clone()
    }
}

/// Blocking micro-benchmark returning a 0-100 score.
/// Implementations stop working once `deadline` has passed.
pub trait PerformanceBenchmark: Send + Sync {
    fn run(&self, deadline: Instant) -> Result<u8, String>;
}

/// Draws shapes on an offscreen canvas and encodes it
#[derive(Debug, Clone)]
pub struct CanvasBenchmark {
    pub shapes: usize,
}

impl Default for CanvasBenchmark {
    fn default() -> Self {
        Self { shapes: 500 }
    }
}

impl PerformanceBenchmark for CanvasBenchmark {
    fn run(&self, deadline: Instant) -> Result<u8, String> {
        let elapsed = benchmark::measure_until(self.shapes, Some(deadline))?;
        Ok(benchmark::score_from_elapsed(elapsed))
    }
}

/// Resolved signals, defaults already applied
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilitySignals {
    pub memory_gb: f64,
    pub cpu_cores: u32,
    pub network: NetworkClass,
    pub performance_score: u8,
}

fn batch_cap_for_memory(gb: f64) -> usize {
    if gb < 2.0 {
        2
    } else if gb < 4.0 {
        3
    } else if gb < 8.0 {
        4
    } else {
        MAX_BATCH_SIZE
    }
}

fn batch_cap_for_cores(cores: u32) -> usize {
    match cores {
        0..=2 => 2,
        3..=4 => 4,
        _ => MAX_BATCH_SIZE,
    }
}

fn batch_cap_for_network(network: NetworkClass) -> usize {
    match network {
        NetworkClass::Slow => 2,
        NetworkClass::Medium => 4,
        NetworkClass::Fast => MAX_BATCH_SIZE,
    }
}

fn batch_cap_for_score(score: u8) -> usize {
    match score {
        0..=29 => 2,
        30..=59 => 4,
        _ => MAX_BATCH_SIZE,
    }
}

fn quality_cap_for_memory(gb: f64) -> QualityTier {
    if gb < 2.0 {
        QualityTier::Mobile
    } else if gb < 4.0 {
        QualityTier::Protocol
    } else {
        QualityTier::HighQuality
    }
}

fn quality_cap_for_cores(cores: u32) -> QualityTier {
    match cores {
        0..=2 => QualityTier::Mobile,
        3..=4 => QualityTier::Protocol,
        _ => QualityTier::HighQuality,
    }
}

fn quality_cap_for_network(network: NetworkClass) -> QualityTier {
    match network {
        NetworkClass::Slow => QualityTier::Mobile,
        NetworkClass::Medium => QualityTier::Protocol,
        NetworkClass::Fast => QualityTier::HighQuality,
    }
}

fn quality_cap_for_score(score: u8) -> QualityTier {
    match score {
        0..=29 => QualityTier::Mobile,
        30..=59 => QualityTier::Protocol,
        _ => QualityTier::HighQuality,
    }
}

/// Each signal caps batch size and tier; the result is the minimum of the
/// caps, so a weaker signal can only lower the recommendation.
pub fn recommend(signals: &CapabilitySignals) -> DeviceCapabilities {
    let batch = [
        batch_cap_for_memory(signals.memory_gb),
        batch_cap_for_cores(signals.cpu_cores),
        batch_cap_for_network(signals.network),
        batch_cap_for_score(signals.performance_score),
    ]
    .into_iter()
    .min()
    .unwrap_or(1)
    .clamp(1, MAX_BATCH_SIZE);

    let quality = [
        quality_cap_for_memory(signals.memory_gb),
        quality_cap_for_cores(signals.cpu_cores),
        quality_cap_for_network(signals.network),
        quality_cap_for_score(signals.performance_score),
    ]
    .into_iter()
    .min()
    .unwrap_or(QualityTier::Mobile);

    DeviceCapabilities {
        memory_gb: signals.memory_gb,
        cpu_cores: signals.cpu_cores,
        network: signals.network,
        performance_score: signals.performance_score,
        recommended_batch_size: batch,
        recommended_quality: quality,
        memory_constrained: signals.memory_gb < DEFAULT_MEMORY_GB,
    }
}

/// Cached capability estimate for the lifetime of the service
pub struct CapabilityEstimator {
    probe: Arc<dyn CapabilityProbe>,
    benchmark: Arc<dyn PerformanceBenchmark>,
    benchmark_timeout: Duration,
    cached: Mutex<Option<DeviceCapabilities>>,
}

impl CapabilityEstimator {
    pub fn new(
        probe: Arc<dyn CapabilityProbe>,
        benchmark: Arc<dyn PerformanceBenchmark>,
        benchmark_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            benchmark,
            benchmark_timeout,
            cached: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &CapabilitySettings) -> Self {
        Self::new(
            Arc::new(SystemProbe::new()),
            Arc::new(CanvasBenchmark {
                shapes: settings.benchmark_shapes,
            }),
            Duration::from_secs(settings.benchmark_timeout_secs.max(1)),
        )
    }

    /// Returns the cached estimate, or computes it when absent or `force`
    pub async fn detect(&self, force: bool) -> DeviceCapabilities {
        let mut cached = self.cached.lock().await;
        if !force {
            if let Some(capabilities) = cached.as_ref() {
                return capabilities.clone();
            }
        }

        let signals = CapabilitySignals {
            memory_gb: self.probe.memory_gb().unwrap_or(DEFAULT_MEMORY_GB),
            cpu_cores: self.probe.cpu_cores().unwrap_or(DEFAULT_CPU_CORES).max(1),
            network: self
                .probe
                .network()
                .and_then(|hint| hint.classify())
                .unwrap_or(DEFAULT_NETWORK),
            performance_score: self.run_benchmark().await,
        };
        let capabilities = recommend(&signals);
        log::info!(
            "Device capabilities: {:.1} GB, {} cores, {} network, score {} -> batch {}, quality {}",
            capabilities.memory_gb,
            capabilities.cpu_cores,
            capabilities.network.as_str(),
            capabilities.performance_score,
            capabilities.recommended_batch_size,
            capabilities.recommended_quality
        );

        *cached = Some(capabilities.clone());
        capabilities
    }

    /// Drops the cached estimate, e.g. after a network change
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }

    async fn run_benchmark(&self) -> u8 {
        let benchmark = self.benchmark.clone();
        let deadline = Instant::now() + self.benchmark_timeout;
        let task = tokio::task::spawn_blocking(move || benchmark.run(deadline));

        match tokio::time::timeout(self.benchmark_timeout, task).await {
            Ok(Ok(Ok(score))) => score.min(100),
            Ok(Ok(Err(e))) => {
                log::warn!("Benchmark failed: {}", e);
                FALLBACK_PERFORMANCE_SCORE
            }
            Ok(Err(e)) => {
                log::warn!("Benchmark task failed: {}", e);
                FALLBACK_PERFORMANCE_SCORE
            }
            Err(_) => {
                log::warn!("Benchmark timed out after {:?}", self.benchmark_timeout);
                FALLBACK_PERFORMANCE_SCORE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixedBenchmark {
        score: u8,
        delay: Duration,
        runs: AtomicUsize,
    }

    impl FixedBenchmark {
        fn new(score: u8, delay: Duration) -> Self {
            Self {
                score,
                delay,
                runs: AtomicUsize::new(0),
            }
        }
    }

    impl PerformanceBenchmark for FixedBenchmark {
        fn run(&self, _deadline: Instant) -> Result<u8, String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(self.score)
        }
    }

    fn signals(memory_gb: f64, cpu_cores: u32, network: NetworkClass, performance_score: u8) -> CapabilitySignals {
        CapabilitySignals {
            memory_gb,
            cpu_cores,
            network,
            performance_score,
        }
    }

    #[test]
    fn test_weak_device_gets_small_batches_and_mobile_quality() {
        let caps = recommend(&signals(1.0, 1, NetworkClass::Slow, 20));
        assert!(caps.recommended_batch_size <= 2);
        assert!(caps.recommended_batch_size >= 1);
        assert_eq!(caps.recommended_quality, QualityTier::Mobile);
        assert!(caps.memory_constrained);
    }

    #[test]
    fn test_strong_device_gets_maximum() {
        let caps = recommend(&signals(16.0, 8, NetworkClass::Fast, 95));
        assert_eq!(caps.recommended_batch_size, MAX_BATCH_SIZE);
        assert_eq!(caps.recommended_quality, QualityTier::HighQuality);
        assert!(!caps.memory_constrained);
    }

    #[test]
    fn test_lowering_any_signal_never_raises_recommendation() {
        let base = signals(16.0, 8, NetworkClass::Fast, 95);
        let reference = recommend(&base);
        let weaker = [
            CapabilitySignals { memory_gb: 3.0, ..base.clone() },
            CapabilitySignals { cpu_cores: 2, ..base.clone() },
            CapabilitySignals { network: NetworkClass::Medium, ..base.clone() },
            CapabilitySignals { performance_score: 40, ..base.clone() },
        ];
        for signals in weaker {
            let caps = recommend(&signals);
            assert!(caps.recommended_batch_size <= reference.recommended_batch_size);
            assert!(caps.recommended_quality <= reference.recommended_quality);
        }
    }

    #[test]
    fn test_network_hint_takes_slowest_signal() {
        let hint = NetworkHint {
            effective_type: Some("4g".into()),
            downlink_mbps: Some(0.5),
            rtt_ms: Some(50),
        };
        assert_eq!(hint.classify(), Some(NetworkClass::Slow));
        assert_eq!(NetworkHint::default().classify(), None);
    }

    #[tokio::test]
    async fn test_missing_signals_use_default_table_and_cache() {
        let benchmark = Arc::new(FixedBenchmark::new(70, Duration::ZERO));
        let estimator = CapabilityEstimator::new(
            Arc::new(StaticProbe::default()),
            benchmark.clone(),
            Duration::from_secs(5),
        );

        let caps = estimator.detect(false).await;
        assert_eq!(caps.memory_gb, DEFAULT_MEMORY_GB);
        assert_eq!(caps.cpu_cores, DEFAULT_CPU_CORES);
        assert_eq!(caps.network, NetworkClass::Medium);
        assert_eq!(caps.performance_score, 70);

        estimator.detect(false).await;
        assert_eq!(benchmark.runs.load(Ordering::SeqCst), 1);
        estimator.detect(true).await;
        assert_eq!(benchmark.runs.load(Ordering::SeqCst), 2);
        estimator.invalidate().await;
        estimator.detect(false).await;
        assert_eq!(benchmark.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_benchmark_timeout_falls_back() {
        let estimator = CapabilityEstimator::new(
            Arc::new(StaticProbe::default()),
            Arc::new(FixedBenchmark::new(99, Duration::from_millis(300))),
            Duration::from_millis(20),
        );
        let caps = estimator.detect(false).await;
        assert_eq!(caps.performance_score, FALLBACK_PERFORMANCE_SCORE);
    }

    /// Canvas benchmark that reports when its blocking run returns
    struct EndlessCanvas {
        finished: AtomicBool,
    }

    impl PerformanceBenchmark for EndlessCanvas {
        fn run(&self, deadline: Instant) -> Result<u8, String> {
            let result = CanvasBenchmark { shapes: usize::MAX }.run(deadline);
            self.finished.store(true, Ordering::SeqCst);
            result
        }
    }

    #[tokio::test]
    async fn test_timed_out_benchmark_stops_its_thread() {
        let benchmark = Arc::new(EndlessCanvas {
            finished: AtomicBool::new(false),
        });
        let estimator = CapabilityEstimator::new(
            Arc::new(StaticProbe::default()),
            benchmark.clone(),
            Duration::from_millis(100),
        );

        let caps = estimator.detect(false).await;
        assert_eq!(caps.performance_score, FALLBACK_PERFORMANCE_SCORE);

        let waited = Instant::now();
        while !benchmark.finished.load(Ordering::SeqCst) {
            assert!(waited.elapsed() < Duration::from_secs(5), "benchmark kept running");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_canvas_benchmark_scores() {
        let deadline = Instant::now() + Duration::from_secs(30);
        let score = CanvasBenchmark { shapes: 20 }.run(deadline).unwrap();
        assert!(score <= 100);
    }
}
