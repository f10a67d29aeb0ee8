// Device protocol abstraction
//
// Uniform capability interface over the three wire protocols. Scenario code
// only ever sees `dyn DeviceClient`, so scenarios stay protocol-agnostic.

pub mod amqp;
pub mod http;
pub mod mqtt;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::config::{Protocol, TestConfig};
use crate::error::LoadTestError;

pub use amqp::AmqpDevice;
pub use http::HttpDevice;
pub use mqtt::MqttDevice;

pub type DeviceFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, LoadTestError>> + Send + 'a>>;

/// Per-publish options. Protocols without a matching concept ignore fields
/// (HTTP ignores qos/retain, AMQP ignores retain).
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOpts {
    pub qos: u8,
    pub retain: bool,
    pub expiry_seconds: Option<u32>,
}

/// Capability set shared by every protocol driver.
///
/// Error contract: operations invoked while not connected fail with
/// [`LoadTestError::NotConnected`]; a connect that does not complete within
/// its timeout fails with [`LoadTestError::ConnectTimeout`], distinct from a
/// protocol-level rejection ([`LoadTestError::ConnectionFailed`]).
pub trait DeviceClient: Send + Sync {
    fn connect<'a>(&'a self, timeout: Duration) -> DeviceFuture<'a, ()>;

    fn disconnect<'a>(&'a self) -> DeviceFuture<'a, ()>;

    fn publish<'a>(
        &'a self,
        address: &'a str,
        payload: &'a [u8],
        opts: PublishOpts,
    ) -> DeviceFuture<'a, ()>;

    fn subscribe<'a>(&'a self, address: &'a str, qos: u8) -> DeviceFuture<'a, ()>;

    fn unsubscribe<'a>(&'a self, address: &'a str) -> DeviceFuture<'a, ()>;

    fn is_connected(&self) -> bool;
}

impl<T: DeviceClient + ?Sized> DeviceClient for std::sync::Arc<T> {
    fn connect<'a>(&'a self, timeout: Duration) -> DeviceFuture<'a, ()> {
        (**self).connect(timeout)
    }

    fn disconnect<'a>(&'a self) -> DeviceFuture<'a, ()> {
        (**self).disconnect()
    }

    fn publish<'a>(
        &'a self,
        address: &'a str,
        payload: &'a [u8],
        opts: PublishOpts,
    ) -> DeviceFuture<'a, ()> {
        (**self).publish(address, payload, opts)
    }

    fn subscribe<'a>(&'a self, address: &'a str, qos: u8) -> DeviceFuture<'a, ()> {
        (**self).subscribe(address, qos)
    }

    fn unsubscribe<'a>(&'a self, address: &'a str) -> DeviceFuture<'a, ()> {
        (**self).unsubscribe(address)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Build the driver matching the configured protocol.
/// Must run inside a tokio runtime (the MQTT driver spawns its event loop).
pub fn build_client(
    config: &TestConfig,
    device_id: &str,
) -> Result<Box<dyn DeviceClient>, LoadTestError> {
    match config.protocol {
        Protocol::Mqtt | Protocol::MqttWs => {
            let use_websockets = config.use_web_sockets || config.protocol == Protocol::MqttWs;
            Ok(Box::new(MqttDevice::new(
                &config.broker_url,
                device_id,
                use_websockets,
                config.clean_session,
                config.message_expiry_seconds,
            )?))
        }
        Protocol::Amqp => Ok(Box::new(AmqpDevice::new(&config.broker_url, device_id)?)),
        Protocol::Http => Ok(Box::new(HttpDevice::new(&config.broker_url, device_id)?)),
    }
}
