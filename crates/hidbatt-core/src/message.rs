//! Change messages produced by the device managers and consumed by the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::device::{DataSource, DeviceId, DeviceIdError, DeviceType, PowerSupplyStatus};

/// A device has been (re)announced by its source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    pub device_id: DeviceId,
    pub device_name: String,
    pub has_battery: bool,
    pub device_type: DeviceType,
}

/// A battery reading for a known device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub device_id: DeviceId,
    /// 0-100, or -1 when the source has no reading
    pub battery_percentage: i32,
    pub power_supply_status: PowerSupplyStatus,
    /// Millivolts, or -1 when not reported
    pub battery_millivolts: i32,
    pub update_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<f64>,
    #[serde(default)]
    pub is_wired_mode: bool,
}

impl UpdateMessage {
    /// Create an update stamped with the current time
    pub fn new(
        device_id: DeviceId,
        battery_percentage: i32,
        power_supply_status: PowerSupplyStatus,
        battery_millivolts: i32,
    ) -> Self {
        Self {
            device_id,
            battery_percentage,
            power_supply_status,
            battery_millivolts,
            update_time: Utc::now(),
            mileage: None,
            is_wired_mode: false,
        }
    }

    pub fn with_mileage(mut self, mileage: f64) -> Self {
        self.mileage = Some(mileage);
        self
    }

    /// Mark the update as coming from a wired connection
    pub fn wired(mut self) -> Self {
        self.is_wired_mode = true;
        self
    }
}

/// Which registry entries a Remove applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RemovePattern {
    /// Exactly one canonical identity
    Device(DeviceId),
    /// Every entry belonging to one source, rendered as `*GHub*`
    Source(DataSource),
}

impl RemovePattern {
    pub fn matches(&self, id: &DeviceId) -> bool {
        match self {
            Self::Device(target) => target == id,
            Self::Source(source) => id.source == *source,
        }
    }
}

impl fmt::Display for RemovePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => write!(f, "{}", id),
            Self::Source(source) => write!(f, "*{}*", source),
        }
    }
}

impl FromStr for RemovePattern {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(tag) = s.strip_prefix('*').and_then(|t| t.strip_suffix('*')) {
            return if tag.eq_ignore_ascii_case("ghub") {
                Ok(Self::Source(DataSource::GHub))
            } else if tag.eq_ignore_ascii_case("native") {
                Ok(Self::Source(DataSource::Native))
            } else {
                Err(DeviceIdError::UnknownSource(tag.to_string()))
            };
        }
        s.parse().map(Self::Device)
    }
}

impl TryFrom<String> for RemovePattern {
    type Error = DeviceIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RemovePattern> for String {
    fn from(pattern: RemovePattern) -> Self {
        pattern.to_string()
    }
}

/// Remove one device, or every device of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveMessage {
    pub pattern: RemovePattern,
    pub reason: String,
}

impl RemoveMessage {
    pub fn device(id: DeviceId, reason: impl Into<String>) -> Self {
        Self {
            pattern: RemovePattern::Device(id),
            reason: reason.into(),
        }
    }

    pub fn source(source: DataSource, reason: impl Into<String>) -> Self {
        Self {
            pattern: RemovePattern::Source(source),
            reason: reason.into(),
        }
    }
}

/// Any message a device manager can send to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeviceMessage {
    Init(InitMessage),
    Update(UpdateMessage),
    Remove(RemoveMessage),
}

impl DeviceMessage {
    /// Source of the device(s) this message concerns
    pub fn source(&self) -> DataSource {
        match self {
            Self::Init(m) => m.device_id.source,
            Self::Update(m) => m.device_id.source,
            Self::Remove(m) => match &m.pattern {
                RemovePattern::Device(id) => id.source,
                RemovePattern::Source(source) => *source,
            },
        }
    }
}

impl From<InitMessage> for DeviceMessage {
    fn from(m: InitMessage) -> Self {
        Self::Init(m)
    }
}

impl From<UpdateMessage> for DeviceMessage {
    fn from(m: UpdateMessage) -> Self {
        Self::Update(m)
    }
}

impl From<RemoveMessage> for DeviceMessage {
    fn from(m: RemoveMessage) -> Self {
        Self::Remove(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wildcard_pattern() {
        assert_eq!(
            "*GHub*".parse::<RemovePattern>().unwrap(),
            RemovePattern::Source(DataSource::GHub)
        );
        assert_eq!(
            "*GHUB*".parse::<RemovePattern>().unwrap(),
            RemovePattern::Source(DataSource::GHub)
        );
        assert_eq!(
            "*native*".parse::<RemovePattern>().unwrap(),
            RemovePattern::Source(DataSource::Native)
        );
        assert!("*usb*".parse::<RemovePattern>().is_err());
    }

    #[test]
    fn test_parse_exact_pattern() {
        assert_eq!(
            "dev00000001".parse::<RemovePattern>().unwrap(),
            RemovePattern::Device(DeviceId::ghub("dev00000001"))
        );
    }

    #[test]
    fn test_wildcard_never_crosses_sources() {
        let pattern = RemovePattern::Source(DataSource::GHub);
        assert!(pattern.matches(&DeviceId::ghub("dev001")));
        assert!(!pattern.matches(&DeviceId::native("dev001")));
        assert!(!pattern.matches(&DeviceId::native("ABC123")));
    }

    #[test]
    fn test_message_serialization_is_tagged() {
        let msg = DeviceMessage::Remove(RemoveMessage::source(DataSource::GHub, "rediscover"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "remove");
        assert_eq!(json["data"]["pattern"], "*GHub*");
        assert_eq!(json["data"]["reason"], "rediscover");
    }
}
