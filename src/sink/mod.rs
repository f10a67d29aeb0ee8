// Event sink and statistics collector module

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One recorded protocol operation (connect, publish, reconnect, ...).
#[derive(Debug, Clone)]
pub struct OpEvent {
    /// Protocol label, e.g. "MQTT" or "HTTP".
    pub protocol: &'static str,
    /// Operation name, e.g. "connect", "publish", "reconnect_fail".
    pub name: &'static str,
    pub latency: Duration,
    pub bytes: usize,
    pub error: Option<String>,
}

impl OpEvent {
    pub fn ok(protocol: &'static str, name: &'static str, latency: Duration, bytes: usize) -> Self {
        Self {
            protocol,
            name,
            latency,
            bytes,
            error: None,
        }
    }

    pub fn failed(protocol: &'static str, name: &'static str, error: String) -> Self {
        Self {
            protocol,
            name,
            latency: Duration::ZERO,
            bytes: 0,
            error: Some(error),
        }
    }
}

/// Sink for per-operation events. The scenario engine only ever talks to this
/// trait so it can run against a real collector or a test recorder.
pub trait EventSink: Send + Sync {
    fn record(&self, event: OpEvent);
}

/// Thread-safe statistics collector using atomic operations.
/// Latency recording uses sharded buffers to reduce lock contention
/// under high concurrency.
pub struct StatsCollector {
    total_ops: AtomicU64,
    successful_ops: AtomicU64,
    failed_ops: AtomicU64,
    bytes_sent: AtomicU64,
    op_counts: DashMap<&'static str, AtomicU64>,
    failure_counts: DashMap<&'static str, AtomicU64>,
    latency_shards: Vec<Mutex<Vec<Duration>>>,
    shard_count: usize,
    start_time: Instant,
}

/// A point-in-time snapshot of collected statistics.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub timestamp: Instant,
    pub total_ops: u64,
    pub successful_ops: u64,
    pub failed_ops: u64,
    pub bytes_sent: u64,
    pub ops_per_sec: f64,
    pub latency_p50: Duration,
    pub latency_p90: Duration,
    pub latency_p95: Duration,
    pub latency_p99: Duration,
    pub op_counts: HashMap<String, u64>,
    pub failure_counts: HashMap<String, u64>,
}

impl StatsCollector {
    /// Create a new StatsCollector.
    pub fn new() -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let latency_shards = (0..shard_count)
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Self {
            total_ops: AtomicU64::new(0),
            successful_ops: AtomicU64::new(0),
            failed_ops: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            op_counts: DashMap::new(),
            failure_counts: DashMap::new(),
            latency_shards,
            shard_count,
            start_time: Instant::now(),
        }
    }

    /// Select a shard based on the current thread ID.
    fn shard_index(&self) -> usize {
        let thread_id = std::thread::current().id();
        let hash = format!("{:?}", thread_id);
        let mut h: usize = 0;
        for b in hash.bytes() {
            h = h.wrapping_mul(31).wrapping_add(b as usize);
        }
        h % self.shard_count
    }

    /// Take a snapshot of the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let total = self.total_ops.load(Ordering::Relaxed);
        let elapsed = now.duration_since(self.start_time).as_secs_f64();
        let ops_per_sec = if elapsed > 0.0 {
            total as f64 / elapsed
        } else {
            0.0
        };

        // Merge all shards into a single Vec for percentile calculation
        let mut all_latencies = Vec::new();
        for shard in &self.latency_shards {
            let guard = shard.lock().unwrap();
            all_latencies.extend_from_slice(&guard);
        }
        let (p50, p90, p95, p99) = calculate_percentiles(&all_latencies);

        let mut op_map = HashMap::new();
        for entry in self.op_counts.iter() {
            op_map.insert(entry.key().to_string(), entry.value().load(Ordering::Relaxed));
        }
        let mut failure_map = HashMap::new();
        for entry in self.failure_counts.iter() {
            failure_map.insert(entry.key().to_string(), entry.value().load(Ordering::Relaxed));
        }

        StatsSnapshot {
            timestamp: now,
            total_ops: total,
            successful_ops: self.successful_ops.load(Ordering::Relaxed),
            failed_ops: self.failed_ops.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            ops_per_sec,
            latency_p50: p50,
            latency_p90: p90,
            latency_p95: p95,
            latency_p99: p99,
            op_counts: op_map,
            failure_counts: failure_map,
        }
    }

    /// Display a final result summary.
    pub fn display_final_summary(snapshot: &StatsSnapshot) {
        println!("=== Final Result Summary ===");
        println!("Total Operations:  {}", snapshot.total_ops);
        println!("Successful:        {}", snapshot.successful_ops);
        println!("Failed:            {}", snapshot.failed_ops);
        println!("Bytes Sent:        {}", snapshot.bytes_sent);
        println!("Ops/sec:           {:.1}", snapshot.ops_per_sec);
        println!(
            "Latency p50: {:.1}ms | p90: {:.1}ms | p95: {:.1}ms | p99: {:.1}ms",
            snapshot.latency_p50.as_secs_f64() * 1000.0,
            snapshot.latency_p90.as_secs_f64() * 1000.0,
            snapshot.latency_p95.as_secs_f64() * 1000.0,
            snapshot.latency_p99.as_secs_f64() * 1000.0,
        );
        if !snapshot.op_counts.is_empty() {
            println!("Operation Counts:");
            let mut ops: Vec<_> = snapshot.op_counts.iter().collect();
            ops.sort_by_key(|(k, _)| k.clone());
            for (name, count) in &ops {
                println!("  {}: {}", name, count);
            }
        }
        if !snapshot.failure_counts.is_empty() {
            println!("Failure Counts:");
            let mut failures: Vec<_> = snapshot.failure_counts.iter().collect();
            failures.sort_by_key(|(k, _)| k.clone());
            for (name, count) in &failures {
                println!("  {}: {}", name, count);
            }
        }
        println!("============================");
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for StatsCollector {
    fn record(&self, event: OpEvent) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        match &event.error {
            None => {
                self.successful_ops.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(event.bytes as u64, Ordering::Relaxed);
                self.op_counts
                    .entry(event.name)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
                let idx = self.shard_index();
                self.latency_shards[idx].lock().unwrap().push(event.latency);
            }
            Some(_) => {
                self.failed_ops.fetch_add(1, Ordering::Relaxed);
                self.failure_counts
                    .entry(event.name)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Calculate percentiles from a slice of durations.
/// Returns (p50, p90, p95, p99). Returns Duration::ZERO for empty input.
pub fn calculate_percentiles(latencies: &[Duration]) -> (Duration, Duration, Duration, Duration) {
    if latencies.is_empty() {
        return (
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
            Duration::ZERO,
        );
    }

    let mut sorted = latencies.to_vec();
    sorted.sort();

    let len = sorted.len();
    let p50 = percentile_at(&sorted, len, 50.0);
    let p90 = percentile_at(&sorted, len, 90.0);
    let p95 = percentile_at(&sorted, len, 95.0);
    let p99 = percentile_at(&sorted, len, 99.0);

    (p50, p90, p95, p99)
}

/// Get the value at a given percentile from a sorted slice using nearest-rank method.
fn percentile_at(sorted: &[Duration], len: usize, pct: f64) -> Duration {
    if len == 1 {
        return sorted[0];
    }
    // Nearest-rank: index = ceil(pct/100 * len) - 1
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(len - 1);
    sorted[idx]
}
