// Test configuration module
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::LoadTestError;

/// 対象プロトコル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Mqtt,
    MqttWs,
    Amqp,
    Http,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Mqtt
    }
}

impl Protocol {
    /// Wire name used in configs and environment settings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::MqttWs => "mqtt-ws",
            Protocol::Amqp => "amqp",
            Protocol::Http => "http",
        }
    }

    /// Upper-case label attached to recorded events.
    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "MQTT",
            Protocol::MqttWs => "MQTT-WS",
            Protocol::Amqp => "AMQP",
            Protocol::Http => "HTTP",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LoadTestError> {
        match s {
            "mqtt" => Ok(Protocol::Mqtt),
            "mqtt-ws" => Ok(Protocol::MqttWs),
            "amqp" => Ok(Protocol::Amqp),
            "http" => Ok(Protocol::Http),
            other => Err(LoadTestError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// シナリオ種別（デバイスのtick動作を選択する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioType {
    Telemetry,
    Burst,
    Churn,
    Retained,
    Command,
    Offline,
    Lwt,
}

impl Default for ScenarioType {
    fn default() -> Self {
        ScenarioType::Telemetry
    }
}

impl ScenarioType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioType::Telemetry => "telemetry",
            ScenarioType::Burst => "burst",
            ScenarioType::Churn => "churn",
            ScenarioType::Retained => "retained",
            ScenarioType::Command => "command",
            ScenarioType::Offline => "offline",
            ScenarioType::Lwt => "lwt",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LoadTestError> {
        match s {
            "telemetry" => Ok(ScenarioType::Telemetry),
            "burst" => Ok(ScenarioType::Burst),
            "churn" => Ok(ScenarioType::Churn),
            "retained" => Ok(ScenarioType::Retained),
            "command" => Ok(ScenarioType::Command),
            "offline" => Ok(ScenarioType::Offline),
            "lwt" => Ok(ScenarioType::Lwt),
            other => Err(LoadTestError::ConfigError(format!(
                "unknown scenario type: {}",
                other
            ))),
        }
    }
}

/// バースト設定（burstシナリオでのみ意味を持つ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BurstConfig {
    pub multiplier: u32,
    pub duration_seconds: u64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            multiplier: 10,
            duration_seconds: 30,
        }
    }
}

/// メイン設定構造体
///
/// Field names on the wire are camelCase so that configs written for the
/// original REST API load directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    pub protocol: Protocol,
    pub broker_url: String,
    pub use_web_sockets: bool,
    #[serde(rename = "testType")]
    pub scenario: ScenarioType,
    pub devices: u32,
    pub connect_rate: u32,
    pub topic_pattern: String,
    pub qos: u8,
    pub retain: bool,
    pub clean_session: bool,
    pub message_size_bytes: usize,
    pub publish_rate_per_device: f64,
    pub message_expiry_seconds: Option<u32>,
    pub burst: Option<BurstConfig>,
    pub runtime_seconds: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            broker_url: "mqtt://localhost:1883".to_string(),
            use_web_sockets: false,
            scenario: ScenarioType::default(),
            devices: 10,
            connect_rate: 100,
            topic_pattern: "devices/{deviceId}/telemetry".to_string(),
            qos: 1,
            retain: false,
            clean_session: true,
            message_size_bytes: 256,
            publish_rate_per_device: 1.0,
            message_expiry_seconds: None,
            burst: None,
            runtime_seconds: 60,
        }
    }
}

const RECOGNIZED_SCHEMES: &[&str] = &[
    "mqtt://", "mqtts://", "ws://", "wss://", "amqp://", "amqps://", "http://", "https://",
];

impl TestConfig {
    /// 設定値のバリデーション
    ///
    /// Collects every violation instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !RECOGNIZED_SCHEMES.iter().any(|p| self.broker_url.starts_with(p)) {
            errors.push(format!("invalid broker URL scheme: {}", self.broker_url));
        }
        if self.devices == 0 || self.devices > 100_000 {
            errors.push("devices must be between 1 and 100000".to_string());
        }
        if self.connect_rate == 0 || self.connect_rate > 2_000 {
            errors.push("connectRate must be between 1 and 2000".to_string());
        }
        if self.qos > 2 {
            errors.push("qos must be between 0 and 2".to_string());
        }
        if self.message_size_bytes == 0 || self.message_size_bytes > 1_048_576 {
            errors.push("messageSizeBytes must be between 1 and 1048576".to_string());
        }
        if !(0.1..=100.0).contains(&self.publish_rate_per_device) {
            errors.push("publishRatePerDevice must be between 0.1 and 100".to_string());
        }
        if let Some(expiry) = self.message_expiry_seconds {
            if expiry == 0 || expiry > 86_400 {
                errors.push("messageExpirySeconds must be between 1 and 86400".to_string());
            }
        }
        if let Some(burst) = &self.burst {
            if burst.multiplier == 0 || burst.multiplier > 100 {
                errors.push("burst.multiplier must be between 1 and 100".to_string());
            }
            if burst.duration_seconds == 0 || burst.duration_seconds > 300 {
                errors.push("burst.durationSeconds must be between 1 and 300".to_string());
            }
        }
        if self.runtime_seconds < 10 || self.runtime_seconds > 3_600 {
            errors.push("runtimeSeconds must be between 10 and 3600".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Minimum interval between publishes for one device.
    pub fn publish_interval(&self) -> Duration {
        if self.publish_rate_per_device > 0.0 {
            Duration::from_secs_f64(1.0 / self.publish_rate_per_device)
        } else {
            Duration::from_secs(1)
        }
    }

    /// Resolve the topic/address pattern for a concrete device.
    pub fn resolve_address(&self, device_id: &str) -> String {
        self.topic_pattern.replace("{deviceId}", device_id)
    }

    /// Flatten the config into `LOADTEST_*` environment settings for the
    /// worker process. Inverse of [`TestConfig::from_env_vars`].
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("LOADTEST_PROTOCOL".to_string(), self.protocol.as_str().to_string()),
            ("LOADTEST_BROKER_URL".to_string(), self.broker_url.clone()),
            ("LOADTEST_TEST_TYPE".to_string(), self.scenario.as_str().to_string()),
            ("LOADTEST_TOPIC_PATTERN".to_string(), self.topic_pattern.clone()),
            ("LOADTEST_QOS".to_string(), self.qos.to_string()),
            ("LOADTEST_RETAIN".to_string(), self.retain.to_string()),
            ("LOADTEST_CLEAN_SESSION".to_string(), self.clean_session.to_string()),
            ("LOADTEST_MESSAGE_SIZE".to_string(), self.message_size_bytes.to_string()),
            ("LOADTEST_PUBLISH_RATE".to_string(), self.publish_rate_per_device.to_string()),
            ("LOADTEST_USE_WEBSOCKETS".to_string(), self.use_web_sockets.to_string()),
            ("LOADTEST_DEVICES".to_string(), self.devices.to_string()),
            ("LOADTEST_CONNECT_RATE".to_string(), self.connect_rate.to_string()),
            ("LOADTEST_RUNTIME".to_string(), self.runtime_seconds.to_string()),
        ];
        if let Some(expiry) = self.message_expiry_seconds {
            env.push(("LOADTEST_MESSAGE_EXPIRY".to_string(), expiry.to_string()));
        }
        if let Some(burst) = &self.burst {
            env.push(("LOADTEST_BURST_MULTIPLIER".to_string(), burst.multiplier.to_string()));
            env.push(("LOADTEST_BURST_DURATION".to_string(), burst.duration_seconds.to_string()));
        }
        env
    }

    /// Rebuild a config from environment settings via an arbitrary lookup.
    /// Missing settings fall back to the same defaults as [`Default`].
    pub fn from_env_vars<F>(get: F) -> Result<Self, LoadTestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = TestConfig::default();

        let protocol = match get("LOADTEST_PROTOCOL") {
            Some(v) => Protocol::parse(&v)?,
            None => defaults.protocol,
        };
        let scenario = match get("LOADTEST_TEST_TYPE") {
            Some(v) => ScenarioType::parse(&v)?,
            None => defaults.scenario,
        };

        let burst = match (
            parse_opt::<u32>(&get, "LOADTEST_BURST_MULTIPLIER")?,
            parse_opt::<u64>(&get, "LOADTEST_BURST_DURATION")?,
        ) {
            (None, None) => None,
            (multiplier, duration) => {
                let d = BurstConfig::default();
                Some(BurstConfig {
                    multiplier: multiplier.unwrap_or(d.multiplier),
                    duration_seconds: duration.unwrap_or(d.duration_seconds),
                })
            }
        };

        Ok(Self {
            protocol,
            broker_url: get("LOADTEST_BROKER_URL").unwrap_or(defaults.broker_url),
            use_web_sockets: parse_opt(&get, "LOADTEST_USE_WEBSOCKETS")?
                .unwrap_or(defaults.use_web_sockets),
            scenario,
            devices: parse_opt(&get, "LOADTEST_DEVICES")?.unwrap_or(defaults.devices),
            connect_rate: parse_opt(&get, "LOADTEST_CONNECT_RATE")?.unwrap_or(defaults.connect_rate),
            topic_pattern: get("LOADTEST_TOPIC_PATTERN").unwrap_or(defaults.topic_pattern),
            qos: parse_opt(&get, "LOADTEST_QOS")?.unwrap_or(defaults.qos),
            retain: parse_opt(&get, "LOADTEST_RETAIN")?.unwrap_or(defaults.retain),
            clean_session: parse_opt(&get, "LOADTEST_CLEAN_SESSION")?
                .unwrap_or(defaults.clean_session),
            message_size_bytes: parse_opt(&get, "LOADTEST_MESSAGE_SIZE")?
                .unwrap_or(defaults.message_size_bytes),
            publish_rate_per_device: parse_opt(&get, "LOADTEST_PUBLISH_RATE")?
                .unwrap_or(defaults.publish_rate_per_device),
            message_expiry_seconds: parse_opt(&get, "LOADTEST_MESSAGE_EXPIRY")?,
            burst,
            runtime_seconds: parse_opt(&get, "LOADTEST_RUNTIME")?.unwrap_or(defaults.runtime_seconds),
        })
    }

    /// Rebuild a config from the process environment.
    pub fn from_env() -> Result<Self, LoadTestError> {
        Self::from_env_vars(|key| std::env::var(key).ok())
    }
}

fn parse_opt<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, LoadTestError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| LoadTestError::ConfigError(format!("invalid {}: {}", key, e))),
    }
}

/// JSON設定ファイルを読み込む
pub fn load_from_file(path: &Path) -> Result<TestConfig, LoadTestError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        LoadTestError::ConfigError(format!("Failed to read config file '{}': {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        LoadTestError::ConfigError(format!("Failed to parse config file '{}': {}", path.display(), e))
    })
}
