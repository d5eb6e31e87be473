//! A HID++ 2.0 device behind a channel

use std::sync::Arc;

use hidbatt_core::{DeviceId, DeviceType, InitMessage, UpdateMessage};
use tracing::{debug, info};

use crate::battery::{select_battery_feature, BatteryFeature};
use crate::channel::{HidppChannel, ProtocolVersion};
use crate::features::{discover_features, feature_id, query, FeatureMap};
use crate::frame::Hidpp20;

const NAME_FUNCTION_LENGTH: u8 = 0x0;
const NAME_FUNCTION_CHUNK: u8 = 0x1;
const NAME_FUNCTION_TYPE: u8 = 0x2;
const INFO_FUNCTION_GET_INFO: u8 = 0x0;

pub struct HidppDevice {
    channel: Arc<HidppChannel>,
    device_index: u8,
    protocol: ProtocolVersion,
    features: FeatureMap,
    id: DeviceId,
    name: String,
    device_type: DeviceType,
    battery: Option<(Arc<dyn BatteryFeature>, u8)>,
}

impl std::fmt::Debug for HidppDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidppDevice")
            .field("channel", &self.channel.name())
            .field("device_index", &self.device_index)
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl HidppDevice {
    /// Ping, enumerate features and read the identity of `device_index`.
    ///
    /// `None` when the index is empty, speaks only HID++ 1.0, or any
    /// discovery step fails.
    pub async fn connect(channel: Arc<HidppChannel>, device_index: u8) -> Option<Self> {
        let protocol = {
            let channel = &channel;
            channel
                .config()
                .init_backoff
                .retry("ping", move |attempt| async move {
                    channel.ping20(device_index, attempt.timeout).await
                })
                .await?
        };
        debug!(
            channel = %channel.name(),
            device_index,
            major = protocol.major,
            minor = protocol.minor,
            "Device answered ping"
        );

        let features = discover_features(&channel, device_index).await?;

        let (name, device_type) = match features.index_of(feature_id::DEVICE_NAME) {
            Some(index) => read_name(&channel, device_index, index).await?,
            None => (format!("HID++ device {}", device_index), DeviceType::Other),
        };

        let unit_id = match features.index_of(feature_id::DEVICE_INFORMATION) {
            Some(index) => read_unit_id(&channel, device_index, index).await,
            None => None,
        };
        let raw_id = unit_id.unwrap_or_else(|| format!("{}-{}", channel.name(), device_index));

        let battery = select_battery_feature(&features);

        info!(
            channel = %channel.name(),
            device_index,
            id = %raw_id,
            name = %name,
            battery = battery.as_ref().map(|(f, _)| f.name()).unwrap_or("none"),
            "HID++ device initialised"
        );

        Some(Self {
            channel,
            device_index,
            protocol,
            features,
            id: DeviceId::native(raw_id),
            name,
            device_type,
            battery,
        })
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_index(&self) -> u8 {
        self.device_index
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn features(&self) -> &FeatureMap {
        &self.features
    }

    pub fn has_battery(&self) -> bool {
        self.battery.is_some()
    }

    pub fn init_message(&self) -> InitMessage {
        InitMessage {
            device_id: self.id.clone(),
            device_name: self.name.clone(),
            has_battery: self.has_battery(),
            device_type: self.device_type,
        }
    }

    /// Query the battery; `None` when unsupported or every attempt failed
    pub async fn read_battery(&self) -> Option<UpdateMessage> {
        let (feature, index) = self.battery.as_ref()?;
        let reading = feature
            .get_battery(&self.channel, self.device_index, *index)
            .await?;
        Some(reading.to_update(self.id.clone()))
    }

    /// Decode a broadcast addressed to this device's battery feature
    pub fn handle_event(&self, frame: &Hidpp20) -> Option<UpdateMessage> {
        let (feature, index) = self.battery.as_ref()?;
        if frame.device_index() != self.device_index || frame.feature_index() != *index {
            return None;
        }
        let reading = feature.parse_event(frame)?;
        Some(reading.to_update(self.id.clone()))
    }
}

async fn read_name(
    channel: &HidppChannel,
    device_index: u8,
    feature_index: u8,
) -> Option<(String, DeviceType)> {
    let request = channel
        .command(device_index, feature_index, NAME_FUNCTION_LENGTH)
        .build();
    let length = query(channel, "name length", &request).await?.param(0) as usize;

    let mut bytes = Vec::with_capacity(length);
    while bytes.len() < length {
        let request = channel
            .command(device_index, feature_index, NAME_FUNCTION_CHUNK)
            .param(bytes.len() as u8)
            .build();
        let response = query(channel, "name chunk", &request).await?;
        let wanted = length - bytes.len();
        let chunk: Vec<u8> = response
            .params()
            .iter()
            .take(wanted)
            .copied()
            .take_while(|&b| b != 0)
            .collect();
        if chunk.is_empty() {
            break;
        }
        bytes.extend_from_slice(&chunk);
    }
    let name = String::from_utf8_lossy(&bytes).trim().to_string();

    let request = channel
        .command(device_index, feature_index, NAME_FUNCTION_TYPE)
        .build();
    let device_type = query(channel, "device type", &request)
        .await
        .map(|r| DeviceType::from_hidpp(r.param(0)))
        .unwrap_or_default();

    Some((name, device_type))
}

/// Unit id as lowercase hex, `None` when unreported
async fn read_unit_id(
    channel: &HidppChannel,
    device_index: u8,
    feature_index: u8,
) -> Option<String> {
    let request = channel
        .command(device_index, feature_index, INFO_FUNCTION_GET_INFO)
        .build();
    let response = query(channel, "device info", &request).await?;
    let unit_id = response.params().get(1..5)?;
    if unit_id.iter().all(|&b| b == 0) {
        return None;
    }
    Some(unit_id.iter().map(|b| format!("{:02x}", b)).collect())
}
