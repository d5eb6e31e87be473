//! Battery features
//!
//! Each supported battery feature implements [`BatteryFeature`]. The device
//! picks its variant by looking the feature ids up in its [`FeatureMap`]
//! (see [`select_battery_feature`]).
//!
//! Unified layouts (0x1000 status and 0x1004 capability responses, and their
//! broadcasts): `param0` = percentage, `param1` = level flags, `param2` =
//! charging status. Readings whose level flags are not exactly one valid bit
//! are rejected as corrupt.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hidbatt_core::{DeviceId, PowerSupplyStatus, UpdateMessage, UNKNOWN};
use tracing::{debug, warn};

use crate::channel::HidppChannel;
use crate::features::{feature_id, FeatureMap};
use crate::frame::Hidpp20;

/// Function carrying battery status broadcasts
pub const EVENT_FUNCTION: u8 = 0x0;

/// Valid level flag bits: critical, low, good, full
const LEVEL_FLAGS_MASK: u8 = 0x0F;

/// A decoded battery reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryReading {
    /// 0-100
    pub percent: u8,
    pub status: PowerSupplyStatus,
    /// Millivolts when the feature reports a voltage
    pub millivolts: Option<u16>,
}

impl BatteryReading {
    pub fn to_update(&self, device_id: DeviceId) -> UpdateMessage {
        UpdateMessage::new(
            device_id,
            self.percent as i32,
            self.status,
            self.millivolts.map(i32::from).unwrap_or(UNKNOWN),
        )
    }
}

/// Level flags must carry exactly one of the defined bits
pub fn is_valid_level_flags(flags: u8) -> bool {
    flags & !LEVEL_FLAGS_MASK == 0 && flags.count_ones() == 1
}

/// Charging status table shared by the unified features
pub fn parse_unified_status(code: u8) -> PowerSupplyStatus {
    match code {
        0 => PowerSupplyStatus::Discharging,
        1 | 2 => PowerSupplyStatus::Charging,
        3 => PowerSupplyStatus::Full,
        _ => PowerSupplyStatus::NotCharging,
    }
}

/// Decode the shared unified layout
fn decode_unified(feature: &str, params: &[u8]) -> Option<BatteryReading> {
    let percent = params.first().copied()?;
    let flags = params.get(1).copied()?;
    let status = params.get(2).copied()?;

    if !is_valid_level_flags(flags) {
        debug!(
            feature,
            flags = %format!("0x{:02X}", flags),
            "Invalid battery level flags, rejecting reading"
        );
        return None;
    }
    if percent > 100 {
        debug!(feature, percent, "Battery percentage out of range, rejecting reading");
        return None;
    }

    Some(BatteryReading {
        percent,
        status: parse_unified_status(status),
        millivolts: None,
    })
}

#[async_trait]
pub trait BatteryFeature: Send + Sync + fmt::Debug {
    fn feature_id(&self) -> u16;

    fn name(&self) -> &'static str;

    /// Function queried for the current status
    fn query_function(&self) -> u8;

    /// Decode the parameters of a status response or broadcast
    fn decode(&self, params: &[u8]) -> Option<BatteryReading>;

    /// Query the current battery state under the channel's battery backoff.
    ///
    /// Corrupt responses count as a failed attempt.
    async fn get_battery(
        &self,
        channel: &HidppChannel,
        device_index: u8,
        feature_index: u8,
    ) -> Option<BatteryReading> {
        let command = channel
            .command(device_index, feature_index, self.query_function())
            .build();
        let command = &command;
        channel
            .config()
            .battery_backoff
            .retry(self.name(), move |attempt| async move {
                let response = channel.write_read20(command, attempt.timeout).await?;
                self.decode(response.params())
            })
            .await
    }

    /// Decode a broadcast; `None` for other functions of this feature
    fn parse_event(&self, frame: &Hidpp20) -> Option<BatteryReading> {
        if frame.function_id() != EVENT_FUNCTION {
            return None;
        }
        self.decode(frame.params())
    }
}

/// Battery Unified Level Status (0x1000)
#[derive(Debug, Default)]
pub struct BatteryUnifiedLevel;

impl BatteryFeature for BatteryUnifiedLevel {
    fn feature_id(&self) -> u16 {
        feature_id::BATTERY_UNIFIED_LEVEL
    }

    fn name(&self) -> &'static str {
        "Battery Unified Level"
    }

    fn query_function(&self) -> u8 {
        0x0
    }

    fn decode(&self, params: &[u8]) -> Option<BatteryReading> {
        decode_unified(self.name(), params)
    }
}

/// Unified Battery (0x1004), queried through its capability function
#[derive(Debug, Default)]
pub struct BatteryUnified;

impl BatteryFeature for BatteryUnified {
    fn feature_id(&self) -> u16 {
        feature_id::UNIFIED_BATTERY
    }

    fn name(&self) -> &'static str {
        "Unified Battery"
    }

    fn query_function(&self) -> u8 {
        0x1
    }

    fn decode(&self, params: &[u8]) -> Option<BatteryReading> {
        decode_unified(self.name(), params)
    }
}

/// Battery Voltage (0x1001)
///
/// `param0..2` = millivolts (big endian), `param2` = flags. Bit 7 of the
/// flags means external power; bits 0-2 then carry the charge state.
#[derive(Debug, Default)]
pub struct BatteryVoltage;

/// Li-ion discharge curve, (millivolts, percent), descending
const DISCHARGE_CURVE: [(u16, u8); 12] = [
    (4186, 100),
    (4067, 90),
    (3989, 80),
    (3922, 70),
    (3859, 60),
    (3811, 50),
    (3778, 40),
    (3751, 30),
    (3717, 20),
    (3671, 10),
    (3646, 5),
    (3500, 0),
];

/// Estimate remaining charge from a cell voltage
pub fn percent_from_millivolts(millivolts: u16) -> u8 {
    let (top_mv, top_pct) = DISCHARGE_CURVE[0];
    if millivolts >= top_mv {
        return top_pct;
    }
    for pair in DISCHARGE_CURVE.windows(2) {
        let (hi_mv, hi_pct) = pair[0];
        let (lo_mv, lo_pct) = pair[1];
        if millivolts >= lo_mv {
            let span = (hi_mv - lo_mv) as u32;
            let offset = (millivolts - lo_mv) as u32;
            let pct = lo_pct as u32 + (hi_pct - lo_pct) as u32 * offset / span;
            return pct as u8;
        }
    }
    0
}

impl BatteryFeature for BatteryVoltage {
    fn feature_id(&self) -> u16 {
        feature_id::BATTERY_VOLTAGE
    }

    fn name(&self) -> &'static str {
        "Battery Voltage"
    }

    fn query_function(&self) -> u8 {
        0x0
    }

    fn decode(&self, params: &[u8]) -> Option<BatteryReading> {
        let millivolts = u16::from_be_bytes([*params.first()?, *params.get(1)?]);
        let flags = params.get(2).copied()?;
        if millivolts == 0 || millivolts > 5000 {
            debug!(millivolts, "Implausible battery voltage, rejecting reading");
            return None;
        }

        let status = if flags & 0x80 == 0 {
            PowerSupplyStatus::Discharging
        } else {
            match flags & 0x07 {
                0 => PowerSupplyStatus::Charging,
                1 => PowerSupplyStatus::Full,
                2 => PowerSupplyStatus::NotCharging,
                _ => PowerSupplyStatus::Unknown,
            }
        };

        Some(BatteryReading {
            percent: percent_from_millivolts(millivolts),
            status,
            millivolts: Some(millivolts),
        })
    }
}

/// Pick the preferred battery feature present in `map`
pub fn select_battery_feature(map: &FeatureMap) -> Option<(Arc<dyn BatteryFeature>, u8)> {
    let candidates: [Arc<dyn BatteryFeature>; 3] = [
        Arc::new(BatteryUnifiedLevel),
        Arc::new(BatteryUnified),
        Arc::new(BatteryVoltage),
    ];
    let selected = candidates
        .into_iter()
        .find_map(|feature| map.index_of(feature.feature_id()).map(|index| (feature, index)));
    if selected.is_none() && map.len() > 1 {
        warn!(features = map.len(), "No supported battery feature");
    }
    selected
}
