// MQTT 5 device driver built on rumqttc's v5 client.
//
// The rumqttc event loop runs in a background task owned by the device; it
// keeps the connection flag current, forwards connection/ack outcomes over a
// channel, and transparently retries the broker connection, which is what
// makes the churn and offline scenarios' reconnects work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, LastWill, LastWillProperties, Packet, PublishProperties,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::sync::{mpsc, Mutex};
use url::Url;

use super::{DeviceClient, DeviceFuture, PublishOpts};
use crate::error::LoadTestError;

/// Bound on the wait for a broker acknowledgment at QoS > 0.
const ACK_GRACE: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_PAUSE: Duration = Duration::from_millis(200);

/// Where and how to reach the broker, derived from the configured URL.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttEndpoint {
    /// Hostname for TCP transports, full URL for WebSocket transports.
    pub broker_addr: String,
    pub port: u16,
    pub use_tls: bool,
    pub use_websockets: bool,
}

impl MqttEndpoint {
    /// Parse a broker URL (`mqtt://`, `mqtts://`, `ws://`, `wss://`).
    /// `ws`/`wss` schemes force WebSocket transport regardless of the flag.
    pub fn parse(broker_url: &str, use_websockets: bool) -> Result<Self, LoadTestError> {
        let url = Url::parse(broker_url)
            .map_err(|e| LoadTestError::ConfigError(format!("invalid broker URL: {}", e)))?;
        let scheme = url.scheme();
        let use_tls = matches!(scheme, "mqtts" | "wss");
        let use_websockets = use_websockets || matches!(scheme, "ws" | "wss");
        let host = url
            .host_str()
            .ok_or_else(|| LoadTestError::ConfigError("broker URL has no host".to_string()))?
            .to_string();
        let port = url
            .port()
            .unwrap_or(if use_tls { 8883 } else { 1883 });

        let broker_addr = if use_websockets {
            let ws_scheme = if use_tls { "wss" } else { "ws" };
            let path = match url.path() {
                "" | "/" => "/mqtt",
                p => p,
            };
            format!("{}://{}:{}{}", ws_scheme, host, port, path)
        } else {
            host
        };

        Ok(Self {
            broker_addr,
            port,
            use_tls,
            use_websockets,
        })
    }
}

#[derive(Debug)]
enum LoopNotice {
    Connected,
    ConnectRejected(String),
    ConnectionLost(String),
    PublishAcked,
}

pub struct MqttDevice {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    notices: Mutex<mpsc::UnboundedReceiver<LoopNotice>>,
    loop_task: tokio::task::JoinHandle<()>,
    message_expiry_seconds: Option<u32>,
}

impl MqttDevice {
    pub fn new(
        broker_url: &str,
        device_id: &str,
        use_websockets: bool,
        clean_session: bool,
        message_expiry_seconds: Option<u32>,
    ) -> Result<Self, LoadTestError> {
        let endpoint = MqttEndpoint::parse(broker_url, use_websockets)?;

        let mut options = MqttOptions::new(device_id, endpoint.broker_addr.clone(), endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(clean_session);

        let will_properties = LastWillProperties {
            delay_interval: None,
            payload_format_indicator: None,
            message_expiry_interval: message_expiry_seconds,
            content_type: None,
            response_topic: None,
            correlation_data: None,
            user_properties: Vec::new(),
        };
        options.set_last_will(LastWill {
            topic: Bytes::from(format!("devices/{}/status", device_id)),
            message: Bytes::from_static(b"{\"online\": false}"),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: Some(will_properties),
        });

        match (endpoint.use_websockets, endpoint.use_tls) {
            (false, false) => {}
            (false, true) => {
                options.set_transport(Transport::Tls(permissive_tls()));
            }
            (true, false) => {
                options.set_transport(Transport::Ws);
            }
            (true, true) => {
                options.set_transport(Transport::Wss(permissive_tls()));
            }
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let flag = Arc::clone(&connected);
        let loop_task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            flag.store(true, Ordering::Relaxed);
                            if notice_tx.send(LoopNotice::Connected).is_err() {
                                break;
                            }
                        } else {
                            flag.store(false, Ordering::Relaxed);
                            let reason = format!("broker rejected connect: {:?}", ack.code);
                            if notice_tx.send(LoopNotice::ConnectRejected(reason)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::PubAck(_)))
                    | Ok(Event::Incoming(Packet::PubComp(_))) => {
                        if notice_tx.send(LoopNotice::PublishAcked).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        flag.store(false, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        flag.store(false, Ordering::Relaxed);
                        if notice_tx
                            .send(LoopNotice::ConnectionLost(e.to_string()))
                            .is_err()
                        {
                            break;
                        }
                        // The event loop reconnects on the next poll; pause so
                        // a dead broker does not spin this task.
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            connected,
            notices: Mutex::new(notice_rx),
            loop_task,
            message_expiry_seconds,
        })
    }

    async fn await_connected(&self, timeout: Duration) -> Result<(), LoadTestError> {
        if self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut notices = self.notices.lock().await;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return Err(LoadTestError::ConnectTimeout(timeout)),
            };
            match tokio::time::timeout(remaining, notices.recv()).await {
                Ok(Some(LoopNotice::Connected)) => return Ok(()),
                Ok(Some(LoopNotice::ConnectRejected(reason))) => {
                    return Err(LoadTestError::ConnectionFailed(reason))
                }
                Ok(Some(LoopNotice::ConnectionLost(reason))) => {
                    return Err(LoadTestError::ConnectionFailed(reason))
                }
                Ok(Some(LoopNotice::PublishAcked)) => continue,
                Ok(None) => {
                    return Err(LoadTestError::ConnectionFailed(
                        "event loop terminated".to_string(),
                    ))
                }
                Err(_) => return Err(LoadTestError::ConnectTimeout(timeout)),
            }
        }
    }

    /// Wait for the next broker acknowledgment, bounded by [`ACK_GRACE`].
    /// A missing ack within the grace period is not an error, matching the
    /// bounded-wait semantics of the publish contract.
    async fn await_publish_ack(&self) {
        let deadline = Instant::now() + ACK_GRACE;
        let mut notices = self.notices.lock().await;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return,
            };
            match tokio::time::timeout(remaining, notices.recv()).await {
                Ok(Some(LoopNotice::PublishAcked)) => return,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return,
            }
        }
    }
}

impl DeviceClient for MqttDevice {
    fn connect<'a>(&'a self, timeout: Duration) -> DeviceFuture<'a, ()> {
        Box::pin(self.await_connected(timeout))
    }

    fn disconnect<'a>(&'a self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.client
                .disconnect()
                .await
                .map_err(|e| LoadTestError::ProtocolError(e.to_string()))?;
            self.connected.store(false, Ordering::Relaxed);
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        address: &'a str,
        payload: &'a [u8],
        opts: PublishOpts,
    ) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            let qos = qos_level(opts.qos)?;
            let mut properties = PublishProperties::default();
            properties.message_expiry_interval =
                opts.expiry_seconds.or(self.message_expiry_seconds);

            self.client
                .publish_with_properties(address, qos, opts.retain, payload.to_vec(), properties)
                .await
                .map_err(|e| LoadTestError::ProtocolError(e.to_string()))?;

            // At QoS > 0 the reported latency covers round-trip delivery
            // confirmation, not just the local enqueue.
            if opts.qos > 0 {
                self.await_publish_ack().await;
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, address: &'a str, qos: u8) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            self.client
                .subscribe(address, qos_level(qos)?)
                .await
                .map_err(|e| LoadTestError::ProtocolError(e.to_string()))
        })
    }

    fn unsubscribe<'a>(&'a self, address: &'a str) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            self.client
                .unsubscribe(address)
                .await
                .map_err(|e| LoadTestError::ProtocolError(e.to_string()))
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for MqttDevice {
    fn drop(&mut self) {
        self.loop_task.abort();
    }
}

/// Load-test identities do not carry production trust; certificate
/// validation stays permissive for mqtts/wss brokers.
fn permissive_tls() -> TlsConfiguration {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    TlsConfiguration::Rustls(Arc::new(config))
}

/// Certificate verifier that accepts every server certificate.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

fn qos_level(qos: u8) -> Result<QoS, LoadTestError> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(LoadTestError::ConfigError(format!("invalid QoS: {}", other))),
    }
}
