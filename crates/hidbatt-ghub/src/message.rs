//! G HUB wire format
//!
//! Every frame is an [`Envelope`] `{msgId, verb, path, payload}`. Inbound
//! envelopes are decoded into a [`GHubEvent`] keyed by `path`; paths this
//! crate does not care about decode to `None`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const PATH_DEVICE_LIST: &str = "/devices/list";
pub const PATH_DEVICE_STATE_CHANGED: &str = "/devices/state/changed";
pub const PATH_BATTERY_STATE_CHANGED: &str = "/battery/state/changed";

pub const VERB_GET: &str = "GET";
pub const VERB_SUBSCRIBE: &str = "SUBSCRIBE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub verb: String,
    pub path: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Outgoing request with a fresh message id
    pub fn request(verb: &str, path: impl Into<String>) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            verb: verb.to_string(),
            path: path.into(),
            payload: Value::Null,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::request(VERB_GET, path)
    }

    pub fn subscribe(path: impl Into<String>) -> Self {
        Self::request(VERB_SUBSCRIBE, path)
    }

    /// Per-device battery query
    pub fn battery_state(device_id: &str) -> Self {
        Self::get(format!("/battery/{}/state", device_id))
    }
}

/// `true`, `"true"`, `"True"` and `"1"` all mean yes
fn bool_or_string<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default, deserialize_with = "bool_or_string")]
    pub has_battery_status: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    #[serde(default)]
    pub extended_display_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl DeviceInfo {
    /// Name shown to the user; the extended name when present
    pub fn name(&self) -> &str {
        if self.extended_display_name.is_empty() {
            &self.display_name
        } else {
            &self.extended_display_name
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceList {
    #[serde(default)]
    pub device_infos: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateChange {
    pub id: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryState {
    pub device_id: String,
    /// Absent while the device runs wired without battery telemetry
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub charging: bool,
    #[serde(default)]
    pub mileage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GHubEvent {
    DeviceList(DeviceList),
    DeviceStateChanged(DeviceStateChange),
    BatteryState(BatteryState),
}

/// `/battery/<id>/state`
fn is_battery_state_path(path: &str) -> bool {
    path.strip_prefix("/battery/")
        .and_then(|rest| rest.strip_suffix("/state"))
        .is_some_and(|id| !id.is_empty() && !id.contains('/'))
}

impl GHubEvent {
    /// Decode an inbound text frame.
    ///
    /// Unknown paths and payload-less acknowledgements yield `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, serde_json::Error> {
        let empty = match &envelope.payload {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            return Ok(None);
        }

        let path = envelope.path.as_str();
        let event = if path == PATH_DEVICE_LIST {
            Self::DeviceList(serde_json::from_value(envelope.payload)?)
        } else if path == PATH_DEVICE_STATE_CHANGED {
            Self::DeviceStateChanged(serde_json::from_value(envelope.payload)?)
        } else if path == PATH_BATTERY_STATE_CHANGED || is_battery_state_path(path) {
            Self::BatteryState(serde_json::from_value(envelope.payload)?)
        } else {
            return Ok(None);
        };
        Ok(Some(event))
    }
}
