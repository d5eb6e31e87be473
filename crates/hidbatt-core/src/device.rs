//! Device types for tracking battery-powered peripherals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::message::{InitMessage, UpdateMessage};

/// Sentinel for "no value": battery never seen, or voltage not reported
pub const UNKNOWN: i32 = -1;

/// Display name carried by stub records until a live device confirms them
pub const STUB_NAME: &str = "Not Initialised";

/// Which backend reported a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataSource {
    /// Local HID++ protocol over USB
    Native,
    /// Logitech G HUB WebSocket service
    GHub,
}

impl DataSource {
    /// Prefix G HUB puts in front of every device identifier
    pub const GHUB_ID_PREFIX: &'static str = "dev";

    /// Infer the source of a bare identifier.
    ///
    /// Only used where the source is not carried alongside the id, such as
    /// remembered selections written by older configurations.
    pub fn infer(raw: &str) -> Self {
        if raw.starts_with(Self::GHUB_ID_PREFIX) {
            Self::GHub
        } else {
            Self::Native
        }
    }

    /// Whether `raw` has the identifier shape this source hands out
    pub fn matches_id_shape(self, raw: &str) -> bool {
        match self {
            Self::GHub => raw.starts_with(Self::GHUB_ID_PREFIX),
            Self::Native => !raw.is_empty() && !raw.starts_with(Self::GHUB_ID_PREFIX),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "Native",
            Self::GHub => "GHub",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        if tag.eq_ignore_ascii_case("native") {
            Some(Self::Native)
        } else if tag.eq_ignore_ascii_case("ghub") {
            Some(Self::GHub)
        } else {
            None
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeviceIdError {
    #[error("Device id is empty")]
    Empty,
    #[error("Unknown device source: {0}")]
    UnknownSource(String),
}

/// Canonical device identity: the (source, identifier) pair.
///
/// Rendered as `native:<raw>` or `ghub:<raw>` so that identical raw strings
/// from different sources never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId {
    pub source: DataSource,
    pub raw: String,
}

impl DeviceId {
    pub fn new(source: DataSource, raw: impl Into<String>) -> Self {
        Self {
            source,
            raw: raw.into(),
        }
    }

    pub fn native(raw: impl Into<String>) -> Self {
        Self::new(DataSource::Native, raw)
    }

    pub fn ghub(raw: impl Into<String>) -> Self {
        Self::new(DataSource::GHub, raw)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the raw identifier has the shape its source hands out
    pub fn has_source_shape(&self) -> bool {
        self.source.matches_id_shape(&self.raw)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.as_str().to_lowercase(), self.raw)
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    /// Parse `source:raw`, or a bare raw id whose source is inferred
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DeviceIdError::Empty);
        }

        match s.split_once(':') {
            Some((tag, raw)) => {
                let source = DataSource::from_tag(tag)
                    .ok_or_else(|| DeviceIdError::UnknownSource(tag.to_string()))?;
                if raw.is_empty() {
                    return Err(DeviceIdError::Empty);
                }
                Ok(Self::new(source, raw))
            }
            None => Ok(Self::new(DataSource::infer(s), s)),
        }
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.to_string()
    }
}

/// Kind of peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Keyboard,
    Mouse,
    Headset,
    Numpad,
    Trackpad,
    Trackball,
    Presenter,
    Receiver,
    Webcam,
    Other,
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::Other
    }
}

impl DeviceType {
    /// Map the HID++ device-name feature `getType` code
    pub fn from_hidpp(code: u8) -> Self {
        match code {
            0 => Self::Keyboard,
            2 => Self::Numpad,
            3 => Self::Mouse,
            4 => Self::Trackpad,
            5 => Self::Trackball,
            6 => Self::Presenter,
            7 => Self::Receiver,
            8 => Self::Headset,
            9 => Self::Webcam,
            _ => Self::Other,
        }
    }

    /// Parse a type name case-insensitively ("mouse", "MOUSE", "Headset")
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "keyboard" => Self::Keyboard,
            "mouse" => Self::Mouse,
            "headset" | "headphones" => Self::Headset,
            "numpad" => Self::Numpad,
            "trackpad" | "touchpad" => Self::Trackpad,
            "trackball" => Self::Trackball,
            "presenter" => Self::Presenter,
            "receiver" => Self::Receiver,
            "webcam" | "camera" => Self::Webcam,
            _ => Self::Other,
        }
    }
}

/// Charging state reported alongside a battery reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSupplyStatus {
    Charging,
    Discharging,
    NotCharging,
    Full,
    Unknown,
}

impl Default for PowerSupplyStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Placeholder state for a remembered selection awaiting live discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StubInfo {
    /// Display name remembered with the selection, used to match a live device
    pub remembered_name: Option<String>,
    /// When the stub was created
    pub created_at: DateTime<Utc>,
}

/// A battery-powered peripheral in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Canonical, source-qualified identity
    pub id: DeviceId,
    /// Display name
    pub name: String,
    pub device_type: DeviceType,
    pub has_battery: bool,
    /// 0-100, or [`UNKNOWN`] if never reported
    pub battery_percent: i32,
    pub power_status: PowerSupplyStatus,
    /// Millivolts, or [`UNKNOWN`] when the battery feature does not report voltage
    pub voltage_millivolts: i32,
    /// Remaining runtime in hours (G HUB only)
    pub mileage_hours: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    /// Derived from the last applied message, not from the battery value
    pub is_online: bool,
    /// Last update came from a wired connection without battery telemetry
    pub is_wired: bool,
    /// User-facing selection flag (persisted through the selection store)
    pub selected: bool,
    /// Present while this record is a placeholder
    pub stub: Option<StubInfo>,
}

impl Device {
    /// Create a live device from an Init message
    pub fn from_init(init: &InitMessage) -> Self {
        Self {
            id: init.device_id.clone(),
            name: init.device_name.clone(),
            device_type: init.device_type,
            has_battery: init.has_battery,
            battery_percent: UNKNOWN,
            power_status: PowerSupplyStatus::Unknown,
            voltage_millivolts: UNKNOWN,
            mileage_hours: None,
            last_update: None,
            is_online: true,
            is_wired: false,
            selected: false,
            stub: None,
        }
    }

    /// Create a placeholder for a remembered selection
    pub fn stub(id: DeviceId, remembered_name: Option<String>) -> Self {
        Self {
            id,
            name: STUB_NAME.to_string(),
            device_type: DeviceType::Other,
            has_battery: false,
            battery_percent: UNKNOWN,
            power_status: PowerSupplyStatus::Unknown,
            voltage_millivolts: UNKNOWN,
            mileage_hours: None,
            last_update: None,
            is_online: false,
            is_wired: false,
            selected: true,
            stub: Some(StubInfo {
                remembered_name,
                created_at: Utc::now(),
            }),
        }
    }

    pub fn is_stub(&self) -> bool {
        self.stub.is_some()
    }

    /// Name a stub was remembered under, if any
    pub fn remembered_name(&self) -> Option<&str> {
        self.stub.as_ref().and_then(|s| s.remembered_name.as_deref())
    }

    /// Refresh static fields from an Init message; confirms a stub in place
    pub fn apply_init(&mut self, init: &InitMessage) {
        self.name = init.device_name.clone();
        self.device_type = init.device_type;
        self.has_battery = init.has_battery;
        self.is_online = true;
        self.stub = None;
    }

    /// Apply a battery update, retaining the last known value.
    ///
    /// An unknown percentage only flips `is_online`, unless the update is
    /// flagged as wired mode without battery telemetry, which reports the
    /// unknown sentinel while staying online.
    pub fn apply_update(&mut self, update: &UpdateMessage) {
        if update.battery_percentage >= 0 {
            self.battery_percent = update.battery_percentage;
            self.voltage_millivolts = update.battery_millivolts;
            if update.mileage.is_some() {
                self.mileage_hours = update.mileage;
            }
            self.power_status = update.power_supply_status;
            self.last_update = Some(update.update_time);
            self.is_wired = update.is_wired_mode;
            self.is_online = true;
        } else if update.is_wired_mode {
            self.battery_percent = UNKNOWN;
            self.power_status = update.power_supply_status;
            self.last_update = Some(update.update_time);
            self.is_wired = true;
            self.is_online = true;
        } else {
            self.is_online = false;
        }
    }

    /// Whether a valid battery percentage has ever been reported
    pub fn has_reading(&self) -> bool {
        self.battery_percent >= 0
    }
}
