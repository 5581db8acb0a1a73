use crate::backend_api::DeviceBackend;
use crate::service::card::DeviceCard;

#[derive(clap::Parser, Debug)]
pub struct ListCommand {
    /// Also show the id, location and webhook address of each device
    #[arg(long)]
    verbose: bool,
}

impl ListCommand {
    pub async fn run(&self, args: &crate::Args) -> anyhow::Result<()> {
        let client = args.supabase_args.api_client()?;
        let devices = match client.list_devices().await {
            Ok(devices) => devices,
            Err(err) => {
                eprintln!("Failed to load devices.");
                return Err(err);
            }
        };

        if devices.is_empty() {
            println!("No devices found. Add devices in Supabase to get started.");
            return Ok(());
        }

        for d in devices {
            println!("{}", DeviceCard::for_device(&d));
            if self.verbose {
                println!(
                    "    id={id} location={location} webhook={webhook}",
                    id = d.id,
                    location = d.location_id.as_deref().unwrap_or("-"),
                    webhook = d.ip_address.as_deref().unwrap_or("-"),
                );
            }
        }

        Ok(())
    }
}
