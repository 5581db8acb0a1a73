use crate::service::device::{Device, DeviceState};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// What the dashboard currently knows about the device list
#[derive(Debug, Clone, Default)]
pub struct DeviceListState {
    /// The most recently fetched (or optimistically updated) list.
    /// None until the first fetch succeeds.
    pub devices: Option<Arc<Vec<Device>>>,
    /// The error from the most recent fetch, if it failed
    pub error: Option<String>,
    /// Set when the list has been invalidated and a re-fetch is due
    pub stale: bool,
}

impl DeviceListState {
    pub fn is_loading(&self) -> bool {
        self.devices.is_none() && self.error.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The client-side copy of the device list.
/// There is one of these per mounted dashboard; readers get
/// shared immutable snapshots and all mutation goes through
/// the methods here.
pub struct DeviceCache {
    state: watch::Sender<DeviceListState>,
    invalidated: Notify,
}

impl Default for DeviceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCache {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DeviceListState::default());
        Self {
            state,
            invalidated: Notify::new(),
        }
    }

    pub fn state(&self) -> DeviceListState {
        self.state.borrow().clone()
    }

    /// Returns a receiver that observes every change to the list
    pub fn subscribe(&self) -> watch::Receiver<DeviceListState> {
        self.state.subscribe()
    }

    pub fn devices(&self) -> Option<Arc<Vec<Device>>> {
        self.state.borrow().devices.clone()
    }

    /// Returns an immutable copy of the device with the given id
    pub fn device_by_id(&self, id: &str) -> Option<Device> {
        self.state
            .borrow()
            .devices
            .as_ref()
            .and_then(|devices| devices.iter().find(|d| d.id == id).cloned())
    }

    /// Resolve a device by either its id or its name
    pub fn resolve_device(&self, label: &str) -> Option<Device> {
        if let Some(device) = self.device_by_id(label) {
            return Some(device);
        }
        self.state
            .borrow()
            .devices
            .as_ref()
            .and_then(|devices| devices.iter().find(|d| d.matches_label(label)).cloned())
    }

    /// Record the outcome of a successful fetch
    pub fn set_devices(&self, devices: Vec<Device>) {
        self.state.send_modify(|state| {
            state.devices = Some(Arc::new(devices));
            state.error = None;
            state.stale = false;
        });
    }

    /// Record a failed fetch. Any previously loaded list is kept
    /// so that it can continue to be shown alongside the error.
    pub fn set_error(&self, err: &anyhow::Error) {
        let message = format!("{err:#}");
        self.state.send_modify(|state| {
            state.error = Some(message);
            state.stale = false;
        });
    }

    /// Capture the current list so that it can later be put back
    /// verbatim with `restore`. An unloaded cache yields an empty list.
    pub fn snapshot(&self) -> Arc<Vec<Device>> {
        self.devices().unwrap_or_default()
    }

    /// Replace the list wholesale with a previously captured snapshot
    pub fn restore(&self, snapshot: Arc<Vec<Device>>) {
        self.state.send_modify(|state| {
            state.devices = Some(snapshot);
        });
    }

    /// Speculatively set the state of the device with the given id,
    /// leaving every other device untouched.
    /// Returns false if no such device is present.
    pub fn apply_device_state(&self, id: &str, device_state: DeviceState) -> bool {
        let mut found = false;
        self.state.send_modify(|state| {
            let updated: Vec<Device> = state
                .devices
                .as_deref()
                .map(|devices| devices.as_slice())
                .unwrap_or_default()
                .iter()
                .map(|d| {
                    if d.id == id {
                        found = true;
                        Device {
                            state: device_state,
                            ..d.clone()
                        }
                    } else {
                        d.clone()
                    }
                })
                .collect();
            state.devices = Some(Arc::new(updated));
        });
        found
    }

    /// Mark the list as stale and wake up whoever is responsible
    /// for re-fetching it
    pub fn invalidate(&self) {
        self.state.send_modify(|state| state.stale = true);
        self.invalidated.notify_one();
    }

    /// Wait until `invalidate` is called.
    /// Invalidations that happen while nobody is waiting are
    /// coalesced into a single wakeup.
    pub async fn invalidated(&self) {
        self.invalidated.notified().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Vec<Device> {
        vec![
            Device::new("2", "Fan", "plug", DeviceState::On),
            Device::new("1", "Lamp", "light", DeviceState::Off)
                .with_ip_address("http://lamp.local/api"),
        ]
    }

    #[test]
    fn starts_loading() {
        let cache = DeviceCache::new();
        assert!(cache.state().is_loading());
        assert!(cache.devices().is_none());
        k9::assert_equal!(cache.snapshot().len(), 0);
    }

    #[test]
    fn optimistic_write_touches_only_target() {
        let cache = DeviceCache::new();
        cache.set_devices(sample());

        assert!(cache.apply_device_state("1", DeviceState::On));

        let devices = cache.devices().unwrap();
        k9::assert_equal!(&devices[0], &sample()[0]);
        k9::assert_equal!(devices[1].state, DeviceState::On);
        k9::assert_equal!(devices[1].name.as_str(), "Lamp");
    }

    #[test]
    fn optimistic_write_unknown_device() {
        let cache = DeviceCache::new();
        cache.set_devices(sample());
        assert!(!cache.apply_device_state("nope", DeviceState::On));
        k9::assert_equal!(cache.devices().unwrap().as_ref(), &sample());
    }

    #[test]
    fn restore_is_a_full_replace() {
        let cache = DeviceCache::new();
        cache.set_devices(sample());
        let snapshot = cache.snapshot();
        let before = serde_json::to_vec(&*snapshot).unwrap();

        cache.apply_device_state("1", DeviceState::On);
        cache.apply_device_state("2", DeviceState::Off);
        cache.restore(snapshot);

        let after = serde_json::to_vec(&*cache.devices().unwrap()).unwrap();
        k9::assert_equal!(before, after);
    }

    #[test]
    fn error_keeps_previous_list() {
        let cache = DeviceCache::new();
        cache.set_devices(sample());
        cache.set_error(&anyhow::anyhow!("boom"));

        let state = cache.state();
        assert!(state.is_error());
        assert!(!state.is_loading());
        k9::assert_equal!(state.devices.unwrap().len(), 2);
        k9::assert_equal!(state.error.as_deref(), Some("boom"));
    }

    #[test]
    fn resolve_by_name_or_id() {
        let cache = DeviceCache::new();
        cache.set_devices(sample());
        k9::assert_equal!(cache.resolve_device("1").unwrap().name, "Lamp");
        k9::assert_equal!(cache.resolve_device("fan").unwrap().id, "2");
        assert!(cache.resolve_device("toaster").is_none());
    }

    #[tokio::test]
    async fn invalidation_wakes_waiter() {
        let cache = Arc::new(DeviceCache::new());
        cache.set_devices(sample());

        // An invalidation that happens before anyone waits is remembered
        cache.invalidate();
        assert!(cache.state().stale);
        tokio::time::timeout(std::time::Duration::from_secs(5), cache.invalidated())
            .await
            .unwrap();

        cache.set_devices(sample());
        assert!(!cache.state().stale);
    }
}
