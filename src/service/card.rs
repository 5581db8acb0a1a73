use crate::cache::DeviceListState;
use crate::service::device::{Device, DeviceState};
use serde::Serialize;

/// The view of a single device on the dashboard.
/// A card does no work of its own: it shows the device and turns
/// switch changes into toggle requests.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceCard {
    pub id: String,
    pub name: String,
    pub badge: String,
    pub state_label: String,
    /// Whether the switch is in the "on" position
    pub checked: bool,
    pub toggle_label: String,
}

/// Returns a card for each device in the list, or none while
/// nothing has loaded
pub fn cards_for(state: &DeviceListState) -> Vec<DeviceCard> {
    state
        .devices
        .as_ref()
        .map(|devices| devices.iter().map(DeviceCard::for_device).collect())
        .unwrap_or_default()
}

/// A request to move a device into a new state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleRequest {
    pub device: Device,
    pub next_state: DeviceState,
}

impl DeviceCard {
    pub fn for_device(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            badge: device.kind.to_uppercase(),
            state_label: device.state.to_string(),
            checked: device.is_on(),
            toggle_label: format!("Toggle {}", device.name),
        }
    }

    /// Translate the switch moving to `checked` into a request
    pub fn on_checked_change(device: &Device, checked: bool) -> ToggleRequest {
        ToggleRequest {
            device: device.clone(),
            next_state: DeviceState::from_on(checked),
        }
    }

    /// The request produced by clicking the switch: the opposite
    /// of the device's current state
    pub fn on_click(device: &Device) -> ToggleRequest {
        Self::on_checked_change(device, !device.is_on())
    }

    pub fn render_html(&self) -> String {
        format!(
            r#"<div class="card">
  <div class="card-header">
    <h3>{name}</h3>
    <span class="badge">{badge}</span>
  </div>
  <div class="card-content">
    <div class="state">State: <span>{state}</span></div>
    <form method="post" action="/device/{id}/toggle">
      <button type="submit" role="switch" aria-checked="{checked}" aria-label="{label}" class="switch{on}"></button>
    </form>
  </div>
</div>"#,
            name = escape_html(&self.name),
            badge = escape_html(&self.badge),
            state = escape_html(&self.state_label),
            id = escape_html(&url_path_segment(&self.id)),
            checked = self.checked,
            label = escape_html(&self.toggle_label),
            on = if self.checked { " on" } else { "" },
        )
    }
}

impl std::fmt::Display for DeviceCard {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "[{switch}] {name:<24} {badge:<10} State: {state}",
            switch = if self.checked { "x" } else { " " },
            name = self.name,
            badge = self.badge,
            state = self.state_label,
        )
    }
}

pub fn escape_html(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#39;"),
            c => result.push(c),
        }
    }
    result
}

/// Percent-encode everything other than unreserved characters
fn url_path_segment(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    for b in text.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            result.push(b as char);
        } else {
            result.push_str(&format!("%{b:02X}"));
        }
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    fn lamp() -> Device {
        Device::new("1", "Lamp", "light", DeviceState::Off)
    }

    #[test]
    fn card_fields() {
        k9::snapshot!(
            DeviceCard::for_device(&lamp()),
            r#"
DeviceCard {
    id: "1",
    name: "Lamp",
    badge: "LIGHT",
    state_label: "off",
    checked: false,
    toggle_label: "Toggle Lamp",
}
"#
        );
    }

    #[test]
    fn switch_requests() {
        let lamp = lamp();
        k9::assert_equal!(DeviceCard::on_click(&lamp).next_state, DeviceState::On);
        k9::assert_equal!(
            DeviceCard::on_checked_change(&lamp, false).next_state,
            DeviceState::Off
        );

        let on = Device {
            state: DeviceState::On,
            ..lamp
        };
        k9::assert_equal!(DeviceCard::on_click(&on).next_state, DeviceState::Off);
    }

    #[test]
    fn terminal_rendering() {
        let card = DeviceCard::for_device(&Device::new("2", "Fan", "plug", DeviceState::On));
        k9::assert_equal!(
            card.to_string(),
            "[x] Fan                      PLUG       State: on"
        );
    }

    #[test]
    fn html_is_escaped() {
        let card = DeviceCard::for_device(&Device::new(
            "a b",
            "<Lamp & co>",
            "light",
            DeviceState::On,
        ));
        let html = card.render_html();
        assert!(html.contains("&lt;Lamp &amp; co&gt;"), "{html}");
        assert!(html.contains(r#"action="/device/a%20b/toggle""#), "{html}");
        assert!(html.contains(r#"aria-checked="true""#), "{html}");
        assert!(html.contains(r#"aria-label="Toggle &lt;Lamp &amp; co&gt;""#), "{html}");
    }
}
