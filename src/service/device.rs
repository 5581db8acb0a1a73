use serde::{Deserialize, Serialize};

/// The columns that we select from the devices table
pub const DEVICE_COLUMNS: &str = "id,name,type,state,ip_address,location_id";

/// The binary power state of a device.
/// The backend stores this as the text "on" or "off"; anything
/// else fails to decode rather than producing a third state.
#[derive(
    Deserialize,
    Serialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DeviceState {
    On,
    Off,
}

impl DeviceState {
    pub fn from_on(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    /// Returns the opposite state
    pub fn toggled(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }
}

/// A row from the devices table
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Category label, eg: "light" or "plug"
    #[serde(rename = "type")]
    pub kind: String,
    pub state: DeviceState,
    /// Where to deliver state change webhooks for this device.
    /// Despite the column name, this is expected to hold a URL.
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
}

impl Device {
    pub fn is_on(&self) -> bool {
        self.state.is_on()
    }

    /// Returns true if `label` refers to this device, either by
    /// its id or by a case-insensitive match on its name
    pub fn matches_label(&self, label: &str) -> bool {
        self.id == label || uncased::UncasedStr::new(&self.name) == label
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{} ({} {})", self.name, self.kind, self.id)
    }
}

#[cfg(test)]
impl Device {
    pub fn new<I: Into<String>, N: Into<String>, K: Into<String>>(
        id: I,
        name: N,
        kind: K,
        state: DeviceState,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            state,
            ip_address: None,
            location_id: None,
        }
    }

    pub fn with_ip_address<S: Into<String>>(mut self, addr: S) -> Self {
        self.ip_address = Some(addr.into());
        self
    }
}
