use crate::service::device::DeviceState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// How many notifications we keep around for display
const RECENT_CAPACITY: usize = 20;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
}

/// A user-visible message about the outcome of an action
/// on a specific device
#[derive(Serialize, Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub device: String,
    pub title: String,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    fn new(kind: NotificationKind, device: &str, title: String) -> Self {
        Self {
            kind,
            device: device.to_string(),
            title,
            description: None,
            timestamp: Utc::now(),
        }
    }

    /// The state change was persisted and the device acknowledged it
    pub fn toggled(device: &str, state: DeviceState) -> Self {
        Self::new(
            NotificationKind::Success,
            device,
            format!("{device} turned {state}"),
        )
    }

    /// The backend refused to persist the state change
    pub fn toggle_failed(device: &str) -> Self {
        Self::new(
            NotificationKind::Error,
            device,
            format!("Failed to toggle {device}"),
        )
    }

    /// The state change was persisted, but the device webhook
    /// was not configured or could not be delivered
    pub fn webhook_pending(device: &str, state: DeviceState) -> Self {
        Self {
            description: Some("Webhook not configured or failed.".to_string()),
            ..Self::new(
                NotificationKind::Info,
                device,
                format!("{device} set to {state}"),
            )
        }
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "[{}] {}", self.kind, self.title)?;
        if let Some(desc) = &self.description {
            write!(fmt, ": {desc}")?;
        }
        Ok(())
    }
}

/// Fans out notifications to anyone watching, and keeps a short
/// history for clients that arrive later
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
    recent: Mutex<VecDeque<Notification>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(RECENT_CAPACITY);
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
        }
    }

    pub fn publish(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Success => log::info!("{notification}"),
            NotificationKind::Info => log::warn!("{notification}"),
            NotificationKind::Error => log::error!("{notification}"),
        }

        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(notification.clone());
        }

        // Nobody listening is fine; the history still has it
        self.tx.send(notification).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Returns the retained notifications, oldest first
    pub fn recent(&self) -> Vec<Notification> {
        self.recent.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn texts() {
        k9::assert_equal!(
            Notification::toggled("Lamp", DeviceState::On).to_string(),
            "[success] Lamp turned on"
        );
        k9::assert_equal!(
            Notification::toggle_failed("Lamp").to_string(),
            "[error] Failed to toggle Lamp"
        );
        k9::assert_equal!(
            Notification::webhook_pending("Lamp", DeviceState::Off).to_string(),
            "[info] Lamp set to off: Webhook not configured or failed."
        );
    }

    #[tokio::test]
    async fn publish_and_retain() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        for i in 0..RECENT_CAPACITY + 5 {
            notifier.publish(Notification::toggle_failed(&format!("dev{i}")));
        }

        let recent = notifier.recent();
        k9::assert_equal!(recent.len(), RECENT_CAPACITY);
        k9::assert_equal!(recent[0].device.as_str(), "dev5");

        // The receiver lagged behind, but still sees the newest entries
        let mut last = None;
        loop {
            match rx.try_recv() {
                Ok(n) => last = Some(n),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        k9::assert_equal!(last.unwrap().device, "dev24");
    }
}
