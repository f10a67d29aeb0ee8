// Scenario engine module
//
// One DeviceSession per simulated device. The session owns its protocol
// client, paces publishes to the configured rate, and dispatches each tick to
// the handler for the configured scenario. Tick failures are recorded as
// events and never terminate the device task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::{ScenarioType, TestConfig};
use crate::device::{build_client, DeviceClient, PublishOpts};
use crate::error::LoadTestError;
use crate::payload::PayloadGenerator;
use crate::sink::{EventSink, OpEvent};

/// Handshake budget for initial connects and reconnects.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed reconnect before the next tick tries again.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// Back-to-back publishes per burst tick when no burst config is present.
const DEFAULT_BURST_COUNT: u32 = 10;

/// Ephemeral per-device state scoped to one run.
pub struct DeviceSession {
    device_id: String,
    config: Arc<TestConfig>,
    client: Box<dyn DeviceClient>,
    sink: Arc<dyn EventSink>,
    generator: PayloadGenerator,
    started: Instant,
    last_publish: Option<Instant>,
}

/// Device identifier derived from the ordinal index plus a short random
/// suffix so repeated runs do not collide on broker session state.
pub fn make_device_id(index: usize) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| rng.gen_range(b'a'..=b'z') as char)
        .collect();
    format!("device-{:05}-{}", index, suffix)
}

impl DeviceSession {
    /// Build a session with the protocol client selected by the config.
    pub fn new(
        config: Arc<TestConfig>,
        index: usize,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, LoadTestError> {
        let device_id = make_device_id(index);
        let client = build_client(&config, &device_id)?;
        Ok(Self::with_client(config, device_id, client, sink))
    }

    /// Build a session around an existing client. Used by tests to inject
    /// mock devices.
    pub fn with_client(
        config: Arc<TestConfig>,
        device_id: String,
        client: Box<dyn DeviceClient>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let generator = PayloadGenerator::new(&device_id, config.message_size_bytes);
        Self {
            device_id,
            config,
            client,
            sink,
            generator,
            started: Instant::now(),
            last_publish: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run the device until the shutdown flag is raised.
    pub async fn run(&mut self, shutdown: &AtomicBool) {
        self.started = Instant::now();

        let start = Instant::now();
        match self.client.connect(CONNECT_TIMEOUT).await {
            Ok(()) => self.record_ok("connect", start.elapsed(), 0),
            Err(e) => self.record_failed("connect", e),
        }

        while !shutdown.load(Ordering::Relaxed) {
            self.tick(shutdown).await;
        }

        let _ = self.client.disconnect().await;
    }

    /// One scheduling tick: reconnect if needed, enforce the publish rate,
    /// then dispatch to the scenario handler.
    pub async fn tick(&mut self, shutdown: &AtomicBool) {
        if !self.client.is_connected() {
            let start = Instant::now();
            match self.client.connect(CONNECT_TIMEOUT).await {
                Ok(()) => self.record_ok("reconnect_success", start.elapsed(), 0),
                Err(e) => {
                    self.record_failed("reconnect_fail", e);
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
            return;
        }

        if let Some(last) = self.last_publish {
            let next_allowed = last + self.config.publish_interval();
            if Instant::now() < next_allowed {
                tokio::time::sleep_until(next_allowed).await;
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        let result = match self.config.scenario {
            ScenarioType::Telemetry => self.telemetry_tick().await,
            ScenarioType::Burst => self.burst_tick().await,
            ScenarioType::Churn => self.churn_tick().await,
            ScenarioType::Retained => self.retained_tick().await,
            ScenarioType::Command => self.command_tick().await,
            ScenarioType::Offline => self.offline_tick().await,
            // LWT correctness is observed broker-side when the device later
            // disconnects uncleanly; the traffic itself is plain telemetry.
            ScenarioType::Lwt => self.telemetry_tick().await,
        };

        if let Err(e) = result {
            self.record_failed(self.config.scenario.as_str(), e);
        }
    }

    fn publish_opts(&self) -> PublishOpts {
        PublishOpts {
            qos: self.config.qos,
            retain: self.config.retain,
            expiry_seconds: self.config.message_expiry_seconds,
        }
    }

    /// Periodic telemetry publishing.
    async fn telemetry_tick(&mut self) -> Result<(), LoadTestError> {
        let address = self.config.resolve_address(&self.device_id);
        let payload = self.generator.generate(self.started.elapsed());

        let start = Instant::now();
        self.client
            .publish(&address, &payload, self.publish_opts())
            .await?;
        self.record_ok("publish", start.elapsed(), payload.len());
        self.last_publish = Some(Instant::now());
        Ok(())
    }

    /// How many messages one burst tick publishes back-to-back. The
    /// configured multiplier scales the burst while its window
    /// (durationSeconds from run start) is open; afterwards the device
    /// falls back to single publishes.
    fn burst_count(&self) -> u32 {
        match &self.config.burst {
            None => DEFAULT_BURST_COUNT,
            Some(burst) => {
                if self.started.elapsed() < Duration::from_secs(burst.duration_seconds) {
                    burst.multiplier
                } else {
                    1
                }
            }
        }
    }

    /// Burst traffic: a batch of publishes, each recorded separately.
    async fn burst_tick(&mut self) -> Result<(), LoadTestError> {
        let address = self.config.resolve_address(&self.device_id);
        let opts = PublishOpts {
            retain: false,
            ..self.publish_opts()
        };

        for _ in 0..self.burst_count() {
            let payload = self.generator.generate(self.started.elapsed());
            let start = Instant::now();
            self.client.publish(&address, &payload, opts).await?;
            self.record_ok("publish_burst", start.elapsed(), payload.len());
        }
        self.last_publish = Some(Instant::now());
        Ok(())
    }

    /// Connection churn: disconnect, short random pause, reconnect.
    async fn churn_tick(&mut self) -> Result<(), LoadTestError> {
        self.client.disconnect().await?;

        let pause = Duration::from_secs_f64(rand::thread_rng().gen_range(0.5..2.0));
        tokio::time::sleep(pause).await;

        let start = Instant::now();
        self.client.connect(CONNECT_TIMEOUT).await?;
        self.record_ok("reconnect", start.elapsed(), 0);
        self.last_publish = Some(Instant::now());
        Ok(())
    }

    /// Retained status publish at QoS 1 to the device's status sub-address.
    async fn retained_tick(&mut self) -> Result<(), LoadTestError> {
        let address = format!("devices/{}/status", self.device_id);
        let payload = serde_json::to_vec(&serde_json::json!({
            "online": true,
            "timestamp": unix_millis(),
        }))
        .unwrap_or_default();

        let opts = PublishOpts {
            qos: 1,
            retain: true,
            expiry_seconds: self.config.message_expiry_seconds,
        };
        let start = Instant::now();
        self.client.publish(&address, &payload, opts).await?;
        self.record_ok("publish_retained", start.elapsed(), payload.len());
        self.last_publish = Some(Instant::now());
        Ok(())
    }

    /// Command & control: subscribe to the commands sub-address, then
    /// announce readiness on the responses sub-address.
    async fn command_tick(&mut self) -> Result<(), LoadTestError> {
        let command_address = format!("devices/{}/commands", self.device_id);
        let response_address = format!("devices/{}/responses", self.device_id);

        self.client.subscribe(&command_address, 1).await?;

        let payload = serde_json::to_vec(&serde_json::json!({
            "status": "ready",
            "timestamp": unix_millis(),
        }))
        .unwrap_or_default();
        let opts = PublishOpts {
            qos: 1,
            retain: false,
            expiry_seconds: self.config.message_expiry_seconds,
        };
        let start = Instant::now();
        self.client.publish(&response_address, &payload, opts).await?;
        self.record_ok("command_response", start.elapsed(), payload.len());
        self.last_publish = Some(Instant::now());
        Ok(())
    }

    /// Offline device: publish, drop the connection, stay away, reconnect.
    /// With clean_session=false this exercises broker-side session replay.
    async fn offline_tick(&mut self) -> Result<(), LoadTestError> {
        let address = self.config.resolve_address(&self.device_id);
        let payload = self.generator.generate(self.started.elapsed());
        let opts = PublishOpts {
            qos: 1,
            retain: false,
            expiry_seconds: self.config.message_expiry_seconds,
        };
        self.client.publish(&address, &payload, opts).await?;

        self.client.disconnect().await?;
        let away = Duration::from_secs_f64(rand::thread_rng().gen_range(1.0..5.0));
        tokio::time::sleep(away).await;

        let start = Instant::now();
        self.client.connect(CONNECT_TIMEOUT).await?;
        self.record_ok("offline_reconnect", start.elapsed(), 0);
        self.last_publish = Some(Instant::now());
        Ok(())
    }

    fn record_ok(&self, name: &'static str, latency: Duration, bytes: usize) {
        self.sink.record(OpEvent::ok(
            self.config.protocol.label(),
            name,
            latency,
            bytes,
        ));
    }

    fn record_failed(&self, name: &'static str, error: LoadTestError) {
        self.sink.record(OpEvent::failed(
            self.config.protocol.label(),
            name,
            error.to_string(),
        ));
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockDevice, Op, RecordingSink};

    fn session_with(
        config: TestConfig,
        device: MockDevice,
    ) -> (DeviceSession, Arc<RecordingSink>, Arc<MockDevice>) {
        let sink = Arc::new(RecordingSink::new());
        let device = Arc::new(device);
        let session = DeviceSession::with_client(
            Arc::new(config),
            "device-00001-test".to_string(),
            Box::new(Arc::clone(&device)),
            sink.clone(),
        );
        (session, sink, device)
    }

    fn fast_config(scenario: ScenarioType) -> TestConfig {
        TestConfig {
            scenario,
            publish_rate_per_device: 100.0,
            ..TestConfig::default()
        }
    }

    #[test]
    fn test_make_device_id_format() {
        let id = make_device_id(42);
        assert!(id.starts_with("device-00042-"), "bad id: {}", id);
        assert_eq!(id.len(), "device-00042-".len() + 4);
        let suffix = &id[id.len() - 4..];
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn test_run_records_connect_then_publishes() {
        let (mut session, sink, device) = session_with(
            fast_config(ScenarioType::Telemetry),
            MockDevice::new(),
        );
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await; // first tick reconnects (mock starts disconnected)
        for _ in 0..5 {
            session.tick(&shutdown).await;
        }

        let events = sink.events();
        assert_eq!(events[0].name, "reconnect_success");
        let publishes = events.iter().filter(|e| e.name == "publish").count();
        assert_eq!(publishes, 5);
        assert_eq!(device.ops_of(Op::Publish), 5);
    }

    #[tokio::test]
    async fn test_publish_failure_is_recorded_and_does_not_stop_the_device() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        mock.set_fail_publish(true);
        let (mut session, sink, _device) =
            session_with(fast_config(ScenarioType::Telemetry), mock);
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await;
        session.tick(&shutdown).await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event.name, "telemetry");
            assert_eq!(event.error.as_deref(), Some("Not connected"));
        }
    }

    #[tokio::test]
    async fn test_reconnect_failure_backs_off_and_records() {
        let mock = MockDevice::new();
        mock.set_fail_connect(true);
        let (mut session, sink, _device) =
            session_with(fast_config(ScenarioType::Telemetry), mock);
        let shutdown = AtomicBool::new(false);

        let start = Instant::now();
        session.tick(&shutdown).await;
        assert!(start.elapsed() >= Duration::from_millis(900), "no backoff applied");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "reconnect_fail");
        assert!(events[0].error.is_some());
    }

    #[tokio::test]
    async fn test_burst_tick_publishes_default_count() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let (mut session, sink, device) = session_with(fast_config(ScenarioType::Burst), mock);
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await;

        assert_eq!(device.ops_of(Op::Publish), 10);
        let events = sink.events();
        assert_eq!(events.iter().filter(|e| e.name == "publish_burst").count(), 10);
    }

    #[tokio::test]
    async fn test_burst_multiplier_scales_inside_window() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let mut config = fast_config(ScenarioType::Burst);
        config.burst = Some(crate::config::BurstConfig {
            multiplier: 3,
            duration_seconds: 300,
        });
        let (mut session, _sink, device) = session_with(config, mock);
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await;
        assert_eq!(device.ops_of(Op::Publish), 3);
    }

    #[tokio::test]
    async fn test_burst_window_expiry_degrades_to_single_publish() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let mut config = fast_config(ScenarioType::Burst);
        config.burst = Some(crate::config::BurstConfig {
            multiplier: 50,
            duration_seconds: 1,
        });
        let (mut session, _sink, device) = session_with(config, mock);

        // Backdate the session start past the burst window
        session.started = Instant::now() - Duration::from_secs(5);
        assert_eq!(session.burst_count(), 1);

        let shutdown = AtomicBool::new(false);
        session.tick(&shutdown).await;
        assert_eq!(device.ops_of(Op::Publish), 1);
    }

    #[tokio::test]
    async fn test_retained_tick_uses_status_address() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let (mut session, sink, device) =
            session_with(fast_config(ScenarioType::Retained), mock);
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await;

        let publishes = device.published();
        assert_eq!(publishes.len(), 1);
        let (address, payload, opts) = &publishes[0];
        assert_eq!(address, "devices/device-00001-test/status");
        assert_eq!(opts.qos, 1);
        assert!(opts.retain);
        let parsed: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(parsed["online"], true);
        assert_eq!(sink.events()[0].name, "publish_retained");
    }

    #[tokio::test]
    async fn test_command_tick_subscribes_then_responds() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let (mut session, sink, device) =
            session_with(fast_config(ScenarioType::Command), mock);
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await;

        assert_eq!(
            device.subscribed(),
            vec!["devices/device-00001-test/commands".to_string()]
        );
        let publishes = device.published();
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].0, "devices/device-00001-test/responses");
        let parsed: serde_json::Value = serde_json::from_slice(&publishes[0].1).unwrap();
        assert_eq!(parsed["status"], "ready");
        assert_eq!(sink.events()[0].name, "command_response");
    }

    #[tokio::test]
    async fn test_churn_tick_cycles_the_connection() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let (mut session, sink, device) = session_with(fast_config(ScenarioType::Churn), mock);
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await;

        assert_eq!(device.ops_of(Op::Disconnect), 1);
        assert_eq!(device.ops_of(Op::Connect), 1);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "reconnect");
        assert!(events[0].error.is_none());
    }

    #[tokio::test]
    async fn test_lwt_scenario_behaves_like_telemetry() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let (mut session, sink, _device) = session_with(fast_config(ScenarioType::Lwt), mock);
        let shutdown = AtomicBool::new(false);

        session.tick(&shutdown).await;
        assert_eq!(sink.events()[0].name, "publish");
    }

    #[tokio::test]
    async fn test_rate_limiting_spaces_publishes() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let mut config = fast_config(ScenarioType::Telemetry);
        config.publish_rate_per_device = 20.0; // 50ms interval
        let (mut session, _sink, device) = session_with(config, mock);
        let shutdown = AtomicBool::new(false);

        let start = Instant::now();
        for _ in 0..4 {
            session.tick(&shutdown).await;
        }
        // 4 publishes need at least 3 full intervals between them
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert_eq!(device.ops_of(Op::Publish), 4);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_flag() {
        let mock = MockDevice::new();
        mock.set_connected(true);
        let (mut session, sink, device) =
            session_with(fast_config(ScenarioType::Telemetry), mock);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move {
            session.run(flag.as_ref()).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("device task did not stop")
            .unwrap();

        assert!(sink.events().iter().any(|e| e.name == "connect"));
        assert!(device.ops_of(Op::Publish) >= 1);
        // run() disconnects on the way out
        assert!(device.ops_of(Op::Disconnect) >= 1);
    }
}
