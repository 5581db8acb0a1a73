use crate::opt_env_var;
use crate::service::device::{Device, DeviceState};
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

#[derive(clap::Parser, Debug, Clone)]
pub struct WebhookArguments {
    /// How many seconds to wait for a device webhook to respond.
    /// You may also set this via the CASA_WEBHOOK_TIMEOUT environment
    /// variable. If unspecified, uses 30 seconds.
    #[arg(long, global = true)]
    pub webhook_timeout: Option<u64>,
}

impl WebhookArguments {
    pub fn timeout(&self) -> anyhow::Result<Duration> {
        let secs = match self.webhook_timeout {
            Some(secs) => secs,
            None => opt_env_var("CASA_WEBHOOK_TIMEOUT")?.unwrap_or(30),
        };
        Ok(Duration::from_secs(secs))
    }

    pub fn client(&self) -> anyhow::Result<WebhookClient> {
        WebhookClient::with_timeout(self.timeout()?)
    }
}

/// The result of attempting to notify a device endpoint.
/// `skipped` means that no request was made because there is
/// no usable URL; `ok` means that the endpoint returned a
/// success status.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookOutcome {
    pub ok: bool,
    pub skipped: bool,
}

impl WebhookOutcome {
    pub const DELIVERED: Self = Self {
        ok: true,
        skipped: false,
    };
    pub const FAILED: Self = Self {
        ok: false,
        skipped: false,
    };
    pub const SKIPPED: Self = Self {
        ok: false,
        skipped: true,
    };
}

#[derive(Serialize, Debug)]
struct WebhookPayload<'a> {
    state: DeviceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<&'a str>,
}

/// Returns the parsed URL if `addr` is an http or https URL.
/// Everything else, including an empty string, is not something
/// that we will send a request to.
pub fn webhook_url(addr: Option<&str>) -> Option<Url> {
    let addr = addr?;
    let has_scheme = ["http://", "https://"].iter().any(|scheme| {
        addr.get(..scheme.len())
            .map(|prefix| uncased::UncasedStr::new(prefix) == *scheme)
            .unwrap_or(false)
    });
    if !has_scheme {
        return None;
    }
    Url::parse(addr).ok()
}

#[derive(Clone, Default)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// POST `{"state": ..., "device": <name>}` to the device's
    /// configured address
    pub async fn notify_device(&self, device: &Device, state: DeviceState) -> WebhookOutcome {
        self.trigger_device_webhook(device.ip_address.as_deref(), state, Some(&device.name))
            .await
    }

    /// POST `{"state": ...}` to `url`, naming `device` in the body
    /// when one is given. No request is made unless `url` passes
    /// `webhook_url`.
    pub async fn trigger_device_webhook(
        &self,
        url: Option<&str>,
        state: DeviceState,
        device: Option<&str>,
    ) -> WebhookOutcome {
        let Some(url) = webhook_url(url) else {
            log::debug!("no usable webhook url {url:?}; skipping");
            return WebhookOutcome::SKIPPED;
        };

        let payload = WebhookPayload { state, device };
        match self.http.post(url.clone()).json(&payload).send().await {
            Ok(response) if response.status().is_success() => WebhookOutcome::DELIVERED,
            Ok(response) => {
                let status = response.status();
                log::warn!(
                    "webhook {url} status {}: {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                );
                WebhookOutcome::FAILED
            }
            Err(err) => {
                log::warn!("webhook {url}: {err:#}");
                WebhookOutcome::FAILED
            }
        }
    }
}
