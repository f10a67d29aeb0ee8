use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::device::{DeviceClient, DeviceFuture, PublishOpts};
use crate::error::LoadTestError;
use crate::sink::{EventSink, OpEvent};

/// ドライバ操作の種別（呼び出し回数の集計キー）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    Disconnect,
    Publish,
    Subscribe,
    Unsubscribe,
}

/// テスト用の共通モックデバイス
/// - publish 内容と subscribe 先の記録
/// - 操作回数のカウント
/// - オプションの失敗注入
pub struct MockDevice {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    ops: Mutex<Vec<Op>>,
    published: Mutex<Vec<(String, Vec<u8>, PublishOpts)>>,
    subscribed: Mutex<Vec<String>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            ops: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
        }
    }

    /// 接続状態を直接設定する
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// connect を失敗させる
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// publish を失敗させる
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Relaxed);
    }

    /// 指定した操作の呼び出し回数を返す
    pub fn ops_of(&self, op: Op) -> usize {
        self.ops.lock().unwrap().iter().filter(|o| **o == op).count()
    }

    /// publish された (アドレス, ペイロード, オプション) を返す
    pub fn published(&self) -> Vec<(String, Vec<u8>, PublishOpts)> {
        self.published.lock().unwrap().clone()
    }

    /// subscribe されたアドレスを返す
    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    fn record_op(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceClient for MockDevice {
    fn connect<'a>(&'a self, _timeout: Duration) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.record_op(Op::Connect);
            if self.fail_connect.load(Ordering::Relaxed) {
                return Err(LoadTestError::ConnectionFailed(
                    "mock connect refused".to_string(),
                ));
            }
            self.connected.store(true, Ordering::Relaxed);
            Ok(())
        })
    }

    fn disconnect<'a>(&'a self) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.record_op(Op::Disconnect);
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
            if self.fail_publish.load(Ordering::Relaxed) {
                return Err(LoadTestError::NotConnected);
            }
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            self.record_op(Op::Publish);
            self.published
                .lock()
                .unwrap()
                .push((address.to_string(), payload.to_vec(), opts));
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, address: &'a str, _qos: u8) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(LoadTestError::NotConnected);
            }
            self.record_op(Op::Subscribe);
            self.subscribed.lock().unwrap().push(address.to_string());
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, _address: &'a str) -> DeviceFuture<'a, ()> {
        Box::pin(async move {
            self.record_op(Op::Unsubscribe);
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// 発生したイベントをそのまま記録するシンク
pub struct RecordingSink {
    events: Mutex<Vec<OpEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// 記録済みイベントのコピーを返す
    pub fn events(&self) -> Vec<OpEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: OpEvent) {
        self.events.lock().unwrap().push(event);
    }
}
