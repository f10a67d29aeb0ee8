// Worker process: the device population for one load-test run.
//
// The worker reads its config from LOADTEST_* environment variables (set by
// the job manager), ramps device tasks up at the configured connect rate,
// runs them until the runtime elapses or a signal arrives, and prints a
// final stats summary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::TestConfig;
use crate::error::LoadTestError;
use crate::scenario::DeviceSession;
use crate::sink::{EventSink, OpEvent, StatsCollector};

/// How long device tasks get to wind down after the shutdown flag is set.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Entry point for the hidden `worker` subcommand.
pub async fn run_from_env() -> Result<Arc<StatsCollector>, LoadTestError> {
    let config = TestConfig::from_env()?;
    if let Err(problems) = config.validate() {
        return Err(LoadTestError::ConfigError(problems.join("; ")));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| LoadTestError::ConfigError(format!("Failed to set signal handler: {}", e)))?;

    run_population(Arc::new(config), shutdown).await
}

/// Run the full device population to completion and return its stats.
/// The shutdown flag ends the run early when set externally.
pub async fn run_population(
    config: Arc<TestConfig>,
    shutdown: Arc<AtomicBool>,
) -> Result<Arc<StatsCollector>, LoadTestError> {
    let stats = Arc::new(StatsCollector::new());
    let deadline = Instant::now() + Duration::from_secs(config.runtime_seconds);

    let spawn_gap = if config.connect_rate > 0 {
        Duration::from_secs_f64(1.0 / config.connect_rate as f64)
    } else {
        Duration::ZERO
    };

    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(config.devices as usize);
    for index in 0..config.devices as usize {
        if shutdown.load(Ordering::Relaxed) || Instant::now() >= deadline {
            break;
        }
        handles.push(spawn_device(
            Arc::clone(&config),
            index,
            Arc::clone(&stats),
            Arc::clone(&shutdown),
        ));
        if spawn_gap > Duration::ZERO && index + 1 < config.devices as usize {
            tokio::time::sleep(spawn_gap).await;
        }
    }

    // Hold until the runtime elapses or an external shutdown arrives.
    while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown.store(true, Ordering::Relaxed);

    let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
    for mut handle in handles {
        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, &mut handle).await.is_err() {
            handle.abort();
        }
    }

    Ok(stats)
}

fn spawn_device(
    config: Arc<TestConfig>,
    index: usize,
    stats: Arc<StatsCollector>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sink: Arc<dyn EventSink> = stats.clone();
        let mut session = match DeviceSession::new(Arc::clone(&config), index, sink) {
            Ok(session) => session,
            Err(e) => {
                stats.record(OpEvent::failed(
                    config.protocol.label(),
                    "connect",
                    e.to_string(),
                ));
                return;
            }
        };
        session.run(shutdown.as_ref()).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, ScenarioType};

    fn local_config(devices: u32, runtime_seconds: u64) -> TestConfig {
        TestConfig {
            protocol: Protocol::Amqp,
            broker_url: "amqp://127.0.0.1:1".to_string(),
            scenario: ScenarioType::Telemetry,
            devices,
            connect_rate: 100,
            runtime_seconds,
            publish_rate_per_device: 50.0,
            ..TestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_population_records_connect_failures_and_finishes() {
        // Port 1 refuses connections, so every device records failed
        // connects but the run still terminates at the deadline.
        let config = Arc::new(local_config(3, 1));
        let shutdown = Arc::new(AtomicBool::new(false));

        let started = Instant::now();
        let stats = run_population(config, shutdown).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));

        let snapshot = stats.snapshot();
        assert!(snapshot.failed_ops > 0);
        assert_eq!(snapshot.successful_ops, 0);
    }

    #[tokio::test]
    async fn test_population_with_live_listener_publishes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Keep accepting so connects and churn reconnects succeed.
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut config = local_config(2, 1);
        config.broker_url = format!("amqp://127.0.0.1:{}", port);
        let stats = run_population(Arc::new(config), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        let snapshot = stats.snapshot();
        assert!(snapshot.successful_ops > 0, "no operations succeeded");
        assert!(snapshot.bytes_sent > 0);
    }

    #[tokio::test]
    async fn test_external_shutdown_ends_the_run_early() {
        let config = Arc::new(local_config(2, 30));
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::Relaxed);
        });

        let started = Instant::now();
        let mut cfg = (*config).clone();
        cfg.broker_url = "amqp://127.0.0.1:1".to_string();
        run_population(Arc::new(cfg), shutdown).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
