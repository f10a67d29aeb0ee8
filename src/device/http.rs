// HTTP device driver.
//
// Connect is a reachability probe (`/health`, falling back to `/`); publish
// maps to an HTTP request carrying the payload as its body. HTTP has no push
// channel in this design, so subscribe/unsubscribe succeed without doing
// anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use url::Url;

use super::{DeviceClient, DeviceFuture, PublishOpts};
use crate::error::LoadTestError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEVICE_ID_HEADER: &str = "X-Device-Id";

#[derive(Debug)]
pub struct HttpDevice {
    base: Url,
    device_id: String,
    method: Method,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl HttpDevice {
    pub fn new(base_url: &str, device_id: &str) -> Result<Self, LoadTestError> {
        let base = Url::parse(base_url)
            .map_err(|e| LoadTestError::ConfigError(format!("invalid broker URL: {}", e)))?;
        // Self-signed certificates are fine for a load-test target.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LoadTestError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            base,
            device_id: device_id.to_string(),
            method: Method::POST,
            client,
            connected: AtomicBool::new(false),
        })
    }

    /// Override the request method used by publish (default POST).
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    fn join(&self, path: &str) -> Result<Url, LoadTestError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| LoadTestError::ConfigError(format!("invalid request path: {}", e)))
    }

    async fn probe(&self, url: Url, timeout: Duration) -> Result<StatusCode, reqwest::Error> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        Ok(response.status())
    }
}

impl DeviceClient for HttpDevice {
    fn connect<'a>(&'a self, timeout: Duration) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            let health = self.join("health")?;
            if let Ok(status) = self.probe(health, timeout).await {
                if status.is_success() {
                    self.connected.store(true, Ordering::Relaxed);
                    return Ok(());
                }
            }
            // /health may not exist; any response from the root still proves
            // the endpoint is reachable.
            let root = self.join("")?;
            match self.probe(root, timeout).await {
                Ok(_) => {
                    self.connected.store(true, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) if e.is_timeout() => Err(LoadTestError::ConnectTimeout(timeout)),
                Err(e) => Err(LoadTestError::ConnectionFailed(format!(
                    "Cannot connect to {}: {}",
                    self.base, e
                ))),
            }
        })
    }

    fn disconnect<'a>(&'a self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Relaxed);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        address: &'a str,
        payload: &'a [u8],
        _opts: PublishOpts,
    ) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            let url = self.join(address)?;
            let response = self
                .client
                .request(self.method.clone(), url)
                .header(CONTENT_TYPE, "application/json")
                .header(DEVICE_ID_HEADER, &self.device_id)
                .body(payload.to_vec())
                .send()
                .await
                .map_err(|e| LoadTestError::ProtocolError(e.to_string()))?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(LoadTestError::ProtocolError(format!(
                    "HTTP status {}",
                    response.status()
                )))
            }
        })
    }

    fn subscribe<'a>(&'a self, _address: &'a str, _qos: u8) -> DeviceFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn unsubscribe<'a>(&'a self, _address: &'a str) -> DeviceFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal one-shot HTTP server answering every request with the given
    /// status line, recording request heads.
    async fn serve_once(listener: TcpListener, status_line: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = socket.read(&mut buf).await.unwrap();
        let head = String::from_utf8_lossy(&buf[..n]).to_string();
        let body = format!(
            "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status_line
        );
        socket.write_all(body.as_bytes()).await.unwrap();
        head
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let err = HttpDevice::new("not a url", "device-1").unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigError(_)));
    }

    #[test]
    fn test_join_handles_leading_slash() {
        let device = HttpDevice::new("http://host:8080", "device-1").unwrap();
        assert_eq!(
            device.join("/devices/d1/telemetry").unwrap().as_str(),
            "http://host:8080/devices/d1/telemetry"
        );
        assert_eq!(
            device.join("devices/d1/telemetry").unwrap().as_str(),
            "http://host:8080/devices/d1/telemetry"
        );
    }

    #[tokio::test]
    async fn test_connect_uses_health_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, "200 OK"));

        let device = HttpDevice::new(&format!("http://127.0.0.1:{}", port), "device-1").unwrap();
        device.connect(Duration::from_secs(2)).await.unwrap();
        assert!(device.is_connected());

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /health"), "unexpected request: {}", head);
    }

    #[tokio::test]
    async fn test_connect_refused_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let device = HttpDevice::new(&format!("http://127.0.0.1:{}", port), "device-1").unwrap();
        let err = device.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            LoadTestError::ConnectionFailed(_) | LoadTestError::ConnectTimeout(_)
        ));
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_publish_sends_payload_with_device_header() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = HttpDevice::new(&format!("http://127.0.0.1:{}", port), "device-7").unwrap();
        device.connected.store(true, Ordering::Relaxed);

        let server = tokio::spawn(serve_once(listener, "200 OK"));
        device
            .publish("devices/device-7/telemetry", b"{\"t\":1}", PublishOpts::default())
            .await
            .unwrap();

        let head = server.await.unwrap();
        assert!(head.starts_with("POST /devices/device-7/telemetry"));
        assert!(head.contains("content-type: application/json") || head.contains("Content-Type: application/json"));
        assert!(head.to_lowercase().contains("x-device-id: device-7"));
    }

    #[tokio::test]
    async fn test_publish_server_error_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = HttpDevice::new(&format!("http://127.0.0.1:{}", port), "device-7").unwrap();
        device.connected.store(true, Ordering::Relaxed);

        let server = tokio::spawn(serve_once(listener, "503 Service Unavailable"));
        let err = device
            .publish("devices/device-7/telemetry", b"{}", PublishOpts::default())
            .await
            .unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, LoadTestError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let device = HttpDevice::new("http://127.0.0.1:1", "device-1").unwrap();
        let err = device
            .publish("devices/x", b"{}", PublishOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadTestError::NotConnected));
    }

    #[tokio::test]
    async fn test_subscribe_is_a_no_op_that_never_fails() {
        let device = HttpDevice::new("http://127.0.0.1:1", "device-1").unwrap();
        device.subscribe("devices/x/commands", 1).await.unwrap();
        device.unsubscribe("devices/x/commands").await.unwrap();
    }
}
