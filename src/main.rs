use crate::backend_api::SupabaseArguments;
use crate::webhook::WebhookArguments;
use clap::Parser;
use std::str::FromStr;

mod backend_api;
mod cache;
mod realtime;
mod version_info;
mod webhook;

mod commands {
    pub mod list;
    pub mod serve;
    pub mod toggle;
    pub mod watch;
}

mod service {
    pub mod card;
    pub mod dashboard;
    pub mod device;
    pub mod http;
    pub mod notify;
    #[cfg(test)]
    pub mod testing;
    pub mod toggle;
}

#[derive(clap::Parser, Debug)]
#[command(version = version_info::casa_version())]
pub struct Args {
    #[command(flatten)]
    supabase_args: SupabaseArguments,
    #[command(flatten)]
    webhook_args: WebhookArguments,
    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the dashboard web service
    Serve(commands::serve::ServeCommand),
    /// Print the device list
    List(commands::list::ListCommand),
    /// Switch a device on or off
    Toggle(commands::toggle::ToggleCommand),
    /// Print the device list every time it changes
    Watch(commands::watch::WatchCommand),
}

/// Returns the parsed value of the environment variable `name`,
/// or None if it isn't set.
pub fn opt_env_var<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(p) => Ok(Some(
            p.trim()
                .parse()
                .map_err(|err| anyhow::anyhow!("parsing ${name}: {err:#}"))?,
        )),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => anyhow::bail!("${name} is invalid: {err:#}"),
    }
}

#[tokio::main(worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    color_backtrace::install();
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("casa_sync=info"),
    )
    .init();

    let args = Args::parse();
    match &args.cmd {
        SubCommand::Serve(cmd) => cmd.run(&args).await,
        SubCommand::List(cmd) => cmd.run(&args).await,
        SubCommand::Toggle(cmd) => cmd.run(&args).await,
        SubCommand::Watch(cmd) => cmd.run(&args).await,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_var_parsing() {
        std::env::set_var("CASA_TEST_TIMEOUT", " 12 ");
        k9::assert_equal!(opt_env_var::<u64>("CASA_TEST_TIMEOUT").unwrap(), Some(12));

        std::env::set_var("CASA_TEST_TIMEOUT", "soon");
        assert!(opt_env_var::<u64>("CASA_TEST_TIMEOUT").is_err());

        k9::assert_equal!(
            opt_env_var::<String>("CASA_TEST_UNSET_VARIABLE").unwrap(),
            None
        );
    }

    #[test]
    fn parse_args() {
        let args = Args::try_parse_from([
            "casa-sync",
            "--supabase-url",
            "https://abc.supabase.co",
            "toggle",
            "Lamp",
            "on",
        ])
        .unwrap();
        k9::assert_equal!(
            args.supabase_args.supabase_url.as_deref(),
            Some("https://abc.supabase.co")
        );
        assert!(matches!(args.cmd, SubCommand::Toggle(_)));
    }
}
