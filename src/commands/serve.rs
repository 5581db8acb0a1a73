use crate::realtime::SupabaseRealtime;
use crate::service::dashboard::Dashboard;
use crate::service::http::run_http_server;
use crate::service::notify::Notifier;
use crate::version_info::casa_version;
use std::sync::Arc;

#[derive(clap::Parser, Debug)]
pub struct ServeCommand {
    /// The port on which the HTTP dashboard will listen
    #[arg(long, default_value_t = 8057)]
    http_port: u16,
}

impl ServeCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        log::info!("Starting service. version {}", casa_version());

        let client = args.supabase_args.api_client()?;
        let table = client.table().clone();
        log::info!("Using devices from {table} at {}", client.base_url());
        let feed = Arc::new(SupabaseRealtime::for_client(&client));
        let webhook = args.webhook_args.client()?;

        let dashboard = Arc::new(
            Dashboard::mount(
                Arc::new(client),
                feed,
                &table,
                webhook,
                Arc::new(Notifier::new()),
            )
            .await,
        );

        let state = dashboard.wait_loaded().await;
        match (&state.devices, &state.error) {
            (_, Some(err)) => log::error!("Initial device load failed: {err}"),
            (Some(devices), None) => {
                log::info!("Loaded {} devices", devices.len());
                for device in devices.iter() {
                    log::info!("  {device}: {}", device.state);
                    if crate::webhook::webhook_url(device.ip_address.as_deref()).is_none() {
                        log::info!("    no webhook configured");
                    }
                }
            }
            (None, None) => {}
        }

        run_http_server(dashboard, self.http_port).await
    }
}
