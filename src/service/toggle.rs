use crate::backend_api::DeviceBackend;
use crate::cache::DeviceCache;
use crate::service::device::{Device, DeviceState};
use crate::service::notify::{Notification, Notifier};
use crate::webhook::{WebhookClient, WebhookOutcome};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The backend rejected the change and the cache was put back
    /// the way it was before the toggle
    RolledBack,
    /// The change was persisted; the webhook outcome says whether
    /// the device itself was told about it
    Persisted(WebhookOutcome),
}

/// Carries out a toggle: optimistic cache write, persistence,
/// rollback on failure and finally a best-effort webhook to
/// the device.
#[derive(Clone)]
pub struct ToggleOrchestrator {
    cache: Arc<DeviceCache>,
    backend: Arc<dyn DeviceBackend>,
    webhook: WebhookClient,
    notifier: Arc<Notifier>,
}

impl ToggleOrchestrator {
    pub fn new(
        cache: Arc<DeviceCache>,
        backend: Arc<dyn DeviceBackend>,
        webhook: WebhookClient,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            cache,
            backend,
            webhook,
            notifier,
        }
    }

    pub async fn toggle(&self, device: &Device, next_state: DeviceState) -> ToggleOutcome {
        // The snapshot and the speculative write happen together,
        // before we yield to the runtime
        let snapshot = self.cache.snapshot();
        if !self.cache.apply_device_state(&device.id, next_state) {
            log::debug!("{device} is not in the cache; persisting anyway");
        }

        if let Err(err) = self
            .backend
            .update_device_state(&device.id, next_state)
            .await
        {
            log::error!("while setting {device} to {next_state}: {err:#}");
            self.cache.restore(snapshot);
            self.notifier
                .publish(Notification::toggle_failed(&device.name));
            return ToggleOutcome::RolledBack;
        }

        let outcome = self.webhook.notify_device(device, next_state).await;
        if outcome.ok {
            self.notifier
                .publish(Notification::toggled(&device.name, next_state));
        } else {
            self.notifier
                .publish(Notification::webhook_pending(&device.name, next_state));
        }

        ToggleOutcome::Persisted(outcome)
    }
}
