use crate::backend_api::{DeviceBackend, TableRef};
use crate::cache::{DeviceCache, DeviceListState};
use crate::realtime::{ChangeFeed, Subscription};
use crate::service::card::{DeviceCard, ToggleRequest};
use crate::service::device::DeviceState;
use crate::service::notify::Notifier;
use crate::service::toggle::{ToggleOrchestrator, ToggleOutcome};
use crate::webhook::WebhookClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// A mounted dashboard.
/// Mounting loads the device list and opens the change subscription;
/// both are released again by `unmount`, or by dropping the dashboard.
pub struct Dashboard {
    cache: Arc<DeviceCache>,
    notifier: Arc<Notifier>,
    orchestrator: ToggleOrchestrator,
    refresher: JoinHandle<()>,
    live: Arc<AtomicBool>,
    listener: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

pub type DashboardHandle = Arc<Dashboard>;

/// Fetch the list and record the outcome in the cache.
/// Failures are not retried; the next invalidation will try again.
pub async fn load_devices(cache: &DeviceCache, backend: &dyn DeviceBackend) {
    match backend.list_devices().await {
        Ok(devices) => {
            log::trace!("fetched {} devices", devices.len());
            cache.set_devices(devices);
        }
        Err(err) => {
            log::error!("Failed to load devices: {err:#}");
            cache.set_error(&err);
        }
    }
}

async fn refresh_loop(cache: Arc<DeviceCache>, backend: Arc<dyn DeviceBackend>) {
    loop {
        load_devices(&cache, &*backend).await;
        cache.invalidated().await;
    }
}

/// Delay before the first attempt to resubscribe; doubled after
/// each failed attempt up to `MAX_RESUBSCRIBE_DELAY`
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

async fn resubscribe(feed: &dyn ChangeFeed, table: &TableRef) -> Subscription {
    let mut delay = RESUBSCRIBE_DELAY;
    loop {
        tokio::time::sleep(delay).await;
        match feed.subscribe(table).await {
            Ok(subscription) => {
                log::info!("resubscribed to changes on {table}");
                return subscription;
            }
            Err(err) => {
                log::warn!("Unable to resubscribe to changes on {table}: {err:#}");
                delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
            }
        }
    }
}

/// Invalidates the cache on every change event for as long as the
/// dashboard is mounted. A subscription that ends is replaced,
/// and the list re-fetched to pick up anything that was missed.
async fn listen_for_changes(
    feed: Arc<dyn ChangeFeed>,
    table: TableRef,
    mut subscription: Option<Subscription>,
    cache: Arc<DeviceCache>,
    live: Arc<AtomicBool>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let Some(current) = subscription.as_mut() else {
            live.store(false, Ordering::SeqCst);
            tokio::select! {
                _ = &mut shutdown => return,
                resumed = resubscribe(&*feed, &table) => {
                    subscription = Some(resumed);
                    live.store(true, Ordering::SeqCst);
                    cache.invalidate();
                }
            }
            continue;
        };

        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = current.next() => event,
        };
        match event {
            Some(event) => {
                log::debug!("{} on {}; refreshing device list", event.kind, event.table);
                cache.invalidate();
            }
            None => {
                log::warn!("subscription {} ended; resubscribing", current.topic());
                subscription = None;
            }
        }
    }

    if let Some(subscription) = subscription {
        subscription.close().await;
    }
}

impl Dashboard {
    pub async fn mount(
        backend: Arc<dyn DeviceBackend>,
        feed: Arc<dyn ChangeFeed>,
        table: &TableRef,
        webhook: WebhookClient,
        notifier: Arc<Notifier>,
    ) -> Self {
        let cache = Arc::new(DeviceCache::new());

        let subscription = match feed.subscribe(table).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                log::error!("Unable to subscribe to changes on {table}: {err:#}");
                log::warn!("The device list will not update live until a retry succeeds");
                None
            }
        };
        let live = Arc::new(AtomicBool::new(subscription.is_some()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(listen_for_changes(
            feed,
            table.clone(),
            subscription,
            cache.clone(),
            live.clone(),
            shutdown_rx,
        ));

        let refresher = tokio::spawn(refresh_loop(cache.clone(), backend.clone()));
        let orchestrator =
            ToggleOrchestrator::new(cache.clone(), backend, webhook, notifier.clone());

        Self {
            cache,
            notifier,
            orchestrator,
            refresher,
            live,
            listener: Some((shutdown_tx, task)),
        }
    }

    /// Close the change subscription and stop refreshing
    pub async fn unmount(mut self) {
        if let Some((shutdown, task)) = self.listener.take() {
            shutdown.send(()).ok();
            task.await.ok();
        }
        self.refresher.abort();
    }

    /// Returns true while a change subscription is open
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> DeviceListState {
        self.cache.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceListState> {
        self.cache.subscribe()
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Wait until the list has either loaded or failed to load
    pub async fn wait_loaded(&self) -> DeviceListState {
        let mut rx = self.cache.subscribe();
        let result = match rx.wait_for(|state| !state.is_loading()).await {
            Ok(state) => state.clone(),
            Err(_) => self.cache.state(),
        };
        result
    }

    pub async fn handle_toggle(&self, request: ToggleRequest) -> ToggleOutcome {
        self.orchestrator
            .toggle(&request.device, request.next_state)
            .await
    }

    /// Toggle the device identified by `label` (id or name) into
    /// `state`, or into the opposite of its current state
    pub async fn toggle_device(
        &self,
        label: &str,
        state: Option<DeviceState>,
    ) -> anyhow::Result<ToggleOutcome> {
        let device = self
            .cache
            .resolve_device(label)
            .ok_or_else(|| anyhow::anyhow!("device '{label}' not found"))?;
        let request = match state {
            Some(state) => DeviceCard::on_checked_change(&device, state.is_on()),
            None => DeviceCard::on_click(&device),
        };
        Ok(self.handle_toggle(request).await)
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.refresher.abort();
        if let Some((_, task)) = self.listener.take() {
            // Dropping the task's Subscription releases it
            task.abort();
        }
    }
}
