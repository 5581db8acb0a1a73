use crate::backend_api::DeviceBackend;
use crate::cache::DeviceCache;
use crate::service::card::DeviceCard;
use crate::service::device::DeviceState;
use crate::service::notify::Notifier;
use crate::service::toggle::{ToggleOrchestrator, ToggleOutcome};
use std::sync::Arc;

#[derive(clap::Parser, Debug)]
pub struct ToggleCommand {
    /// The id or name of the device
    device: String,

    /// The state to set. If omitted, the device is switched
    /// to the opposite of its current state.
    state: Option<DeviceState>,
}

impl ToggleCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let client = Arc::new(args.supabase_args.api_client()?);
        let cache = Arc::new(DeviceCache::new());
        cache.set_devices(client.list_devices().await?);

        let device = cache
            .resolve_device(&self.device)
            .ok_or_else(|| anyhow::anyhow!("device '{}' not found", self.device))?;
        let request = match self.state {
            Some(state) => DeviceCard::on_checked_change(&device, state.is_on()),
            None => DeviceCard::on_click(&device),
        };

        let notifier = Arc::new(Notifier::new());
        let orchestrator = ToggleOrchestrator::new(
            cache.clone(),
            client,
            args.webhook_args.client()?,
            notifier.clone(),
        );

        let mut notifications = notifier.subscribe();
        let outcome = orchestrator
            .toggle(&request.device, request.next_state)
            .await;
        while let Ok(n) = notifications.try_recv() {
            println!("{n}");
        }

        match outcome {
            ToggleOutcome::RolledBack => anyhow::bail!("{} was not changed", device.name),
            ToggleOutcome::Persisted(_) => Ok(()),
        }
    }
}
