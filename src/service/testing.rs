//! In-memory stand-ins for the backend and the realtime feed

use crate::backend_api::{DeviceBackend, TableRef};
use crate::realtime::{channel_topic, ChangeEvent, ChangeFeed, ChangeKind, Subscription};
use crate::service::device::{Device, DeviceState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot, Notify};

#[derive(Default)]
pub struct FakeBackend {
    devices: Mutex<Vec<Device>>,
    updates: Mutex<Vec<(String, DeviceState)>>,
    fail_updates: AtomicBool,
    fail_lists: AtomicBool,
    list_calls: AtomicUsize,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    update_started: Notify,
    listed: Notify,
}

impl FakeBackend {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            ..Self::default()
        }
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock() = devices;
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(String, DeviceState)> {
        self.updates.lock().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Make the next update wait until the returned sender fires
    pub fn hold_updates(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    pub async fn wait_for_update(&self) {
        self.update_started.notified().await
    }

    pub async fn wait_for_list(&self) {
        self.listed.notified().await
    }
}

#[async_trait]
impl DeviceBackend for FakeBackend {
    async fn list_devices(&self) -> anyhow::Result<Vec<Device>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_lists.load(Ordering::SeqCst) {
            Err(anyhow::anyhow!("relation \"devices\" does not exist"))
        } else {
            let mut devices = self.devices.lock().clone();
            devices.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(devices)
        };
        self.listed.notify_one();
        result
    }

    async fn update_device_state(&self, id: &str, state: DeviceState) -> anyhow::Result<()> {
        self.updates.lock().push((id.to_string(), state));
        self.update_started.notify_one();

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.await.ok();
        }

        if self.fail_updates.load(Ordering::SeqCst) {
            anyhow::bail!("new row violates row-level security policy");
        }
        for device in self.devices.lock().iter_mut() {
            if device.id == id {
                device.state = state;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFeed {
    subscribers: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
    fail: AtomicBool,
}

impl FakeFeed {
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Returns how many subscriptions are still open
    pub fn open_subscriptions(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Ends every open subscription, as a dropped connection would
    pub fn disconnect(&self) {
        self.subscribers.lock().clear();
    }

    pub async fn emit(&self, kind: ChangeKind) {
        let subscribers = self.subscribers.lock().clone();
        for tx in subscribers {
            tx.send(ChangeEvent {
                kind,
                table: "devices".to_string(),
            })
            .await
            .ok();
        }
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self, table: &TableRef) -> anyhow::Result<Subscription> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("realtime is not enabled for {table}");
        }
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().push(tx);
        Ok(Subscription::from_receiver(channel_topic(table), rx))
    }
}
