// Synthetic telemetry payload generator
//
// Pure leaf component. Per-device trends are derived from a stable digest of
// the device id so two calls with the same (device id, elapsed second) pair
// produce identical readings, while different devices diverge.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, SystemTime};

/// Serialized JSON overhead reserved before padding is added.
const PAYLOAD_OVERHEAD: usize = 200;

/// Derive the per-device integer seed from an md5 digest of the device id.
pub fn device_seed(device_id: &str) -> u64 {
    let digest = md5::compute(device_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(prefix) % 10_000
}

/// Environmental readings for one device at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReadings {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
}

pub struct PayloadGenerator {
    device_id: String,
    seed: u64,
    message_size: usize,
}

impl PayloadGenerator {
    pub fn new(device_id: &str, message_size: usize) -> Self {
        Self {
            device_id: device_id.to_string(),
            seed: device_seed(device_id),
            message_size,
        }
    }

    /// Compute the three sensor series at the given elapsed run time.
    ///
    /// Temperature: 10-30°C per-device baseline, +5°C/hour drift, ±0.5 noise.
    /// Humidity: 35-65% baseline, 5-minute oscillation, ±2 noise, clamped to [0,100].
    /// Pressure: 1003-1023 hPa baseline, ±0.5 noise.
    pub fn readings_at(&self, elapsed: Duration) -> SensorReadings {
        let elapsed_secs = elapsed.as_secs();
        // Seeded per call so identical inputs reproduce identical noise; the
        // process-wide RNG is never touched.
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(elapsed_secs));

        let temp_baseline = 20.0 + (self.seed % 20) as f64 - 10.0;
        let temp_trend = 5.0 * (elapsed_secs as f64 / 3600.0);
        let temperature = round2(temp_baseline + temp_trend + rng.gen_range(-0.5..0.5));

        let humidity_baseline = 50.0 + (self.seed % 30) as f64 - 15.0;
        let humidity_cycle = 10.0 * (1.0 + (elapsed_secs % 300) as f64 / 300.0);
        let humidity = round2(
            (humidity_baseline + humidity_cycle + rng.gen_range(-2.0..2.0)).clamp(0.0, 100.0),
        );

        let pressure_baseline = 1013.0 + (self.seed % 20) as f64 - 10.0;
        let pressure = round2(pressure_baseline + rng.gen_range(-0.5..0.5));

        SensorReadings {
            temperature,
            humidity,
            pressure,
        }
    }

    /// Generate one serialized payload, padded to the configured message size.
    pub fn generate(&self, elapsed: Duration) -> Vec<u8> {
        let readings = self.readings_at(elapsed);
        let timestamp_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let padding = "x".repeat(self.message_size.saturating_sub(PAYLOAD_OVERHEAD));
        let body = serde_json::json!({
            "deviceId": self.device_id,
            "timestamp": timestamp_ms,
            "temperature": readings.temperature,
            "humidity": readings.humidity,
            "pressure": readings.pressure,
            "padding": padding,
        });
        serde_json::to_vec(&body).unwrap_or_default()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
