// AMQP 1.0 device driver.
//
// Connect performs a real TCP reachability check against the broker's AMQP
// listener, so connect latency and refusal/timeout errors are genuine. The
// send/receive path is a throughput-simulation stub that still honors the
// shared driver contract and error semantics.
// TODO: wire a real AMQP 1.0 client (fe2o3-amqp) so publish/subscribe move
// actual bytes through the broker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use url::Url;

use super::{DeviceClient, DeviceFuture, PublishOpts};
use crate::error::LoadTestError;

const DEFAULT_AMQP_PORT: u16 = 5672;
const DEFAULT_AMQPS_PORT: u16 = 5671;

#[derive(Debug)]
pub struct AmqpDevice {
    host: String,
    port: u16,
    #[allow(dead_code)]
    device_id: String,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
}

impl AmqpDevice {
    pub fn new(broker_url: &str, device_id: &str) -> Result<Self, LoadTestError> {
        let url = Url::parse(broker_url)
            .map_err(|e| LoadTestError::ConfigError(format!("invalid broker URL: {}", e)))?;
        let use_tls = url.scheme() == "amqps";
        let host = url
            .host_str()
            .ok_or_else(|| LoadTestError::ConfigError("broker URL has no host".to_string()))?
            .to_string();
        let port = url.port().unwrap_or(if use_tls {
            DEFAULT_AMQPS_PORT
        } else {
            DEFAULT_AMQP_PORT
        });

        Ok(Self {
            host,
            port,
            device_id: device_id.to_string(),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            sent_messages: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
        })
    }

    /// Messages accepted by the stub send path since construction.
    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }
}

impl DeviceClient for AmqpDevice {
    fn connect<'a>(&'a self, timeout: Duration) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            let addr = (self.host.as_str(), self.port);
            let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(LoadTestError::ConnectionFailed(e.to_string())),
                Err(_) => return Err(LoadTestError::ConnectTimeout(timeout)),
            };
            *self.stream.lock().await = Some(stream);
            self.connected.store(true, Ordering::Relaxed);
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.stream.lock().await.take();
            self.connected.store(false, Ordering::Relaxed);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        _address: &'a str,
        payload: &'a [u8],
        _opts: PublishOpts,
    ) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            self.sent_messages.fetch_add(1, Ordering::Relaxed);
            self.sent_bytes
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, _address: &'a str, _qos: u8) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, _address: &'a str) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_url_parsing_defaults() {
        let device = AmqpDevice::new("amqp://broker.edge", "device-1").unwrap();
        assert_eq!(device.host, "broker.edge");
        assert_eq!(device.port, 5672);

        let secure = AmqpDevice::new("amqps://broker.edge", "device-1").unwrap();
        assert_eq!(secure.port, 5671);

        let explicit = AmqpDevice::new("amqp://broker.edge:6000", "device-1").unwrap();
        assert_eq!(explicit.port, 6000);
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = AmqpDevice::new("::::", "device-1").unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_connect_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = AmqpDevice::new(&format!("amqp://127.0.0.1:{}", port), "device-1").unwrap();
        device.connect(Duration::from_secs(1)).await.unwrap();
        assert!(device.is_connected());

        device.publish("telemetry", b"payload", PublishOpts::default()).await.unwrap();
        device.subscribe("commands", 1).await.unwrap();
        assert_eq!(device.sent_messages(), 1);
        assert_eq!(device.sent_bytes(), 7);

        device.disconnect().await.unwrap();
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failed() {
        // Bind then drop a listener to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let device = AmqpDevice::new(&format!("amqp://127.0.0.1:{}", port), "device-1").unwrap();
        let err = device.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LoadTestError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let device = AmqpDevice::new("amqp://127.0.0.1:1", "device-1").unwrap();
        let err = device
            .publish("telemetry", b"x", PublishOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadTestError::NotConnected));
        let err = device.subscribe("commands", 0).await.unwrap_err();
        assert!(matches!(err, LoadTestError::NotConnected));
        let err = device.unsubscribe("commands").await.unwrap_err();
        assert!(matches!(err, LoadTestError::NotConnected));
    }
}
