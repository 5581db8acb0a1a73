use crate::cache::DeviceListState;
use crate::realtime::SupabaseRealtime;
use crate::service::card::DeviceCard;
use crate::service::dashboard::Dashboard;
use crate::service::notify::Notifier;
use std::sync::Arc;

#[derive(clap::Parser, Debug)]
pub struct WatchCommand {}

fn print_state(state: &DeviceListState) {
    if state.is_loading() {
        println!("Loading devices...");
        return;
    }
    if state.is_error() {
        println!("Failed to load devices.");
    }
    match &state.devices {
        Some(devices) if devices.is_empty() => {
            println!("No devices found. Add devices in Supabase to get started.");
        }
        Some(devices) => {
            for d in devices.iter() {
                println!("{}", DeviceCard::for_device(d));
            }
        }
        None => {}
    }
    println!();
}

impl WatchCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let client = args.supabase_args.api_client()?;
        let table = client.table().clone();
        let feed = Arc::new(SupabaseRealtime::for_client(&client));
        let dashboard = Dashboard::mount(
            Arc::new(client),
            feed,
            &table,
            args.webhook_args.client()?,
            Arc::new(Notifier::new()),
        )
        .await;

        eprintln!("Watching {table} for changes; press CTRL-C to stop");
        let mut rx = dashboard.subscribe();
        let initial = rx.borrow_and_update().clone();
        print_state(&initial);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = rx.borrow_and_update().clone();
                    if !state.stale {
                        print_state(&state);
                    }
                }
            }
        }

        dashboard.unmount().await;
        Ok(())
    }
}
