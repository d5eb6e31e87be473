//! HID++ 2.0 feature discovery
//!
//! Features are addressed by a per-device index. The root feature (always at
//! index 0) maps a feature id to its index; the FeatureSet feature enumerates
//! every id the device supports. The resulting [`FeatureMap`] stays valid
//! until the device reconnects.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::channel::HidppChannel;
use crate::frame::Hidpp20;

/// Well-known feature ids
pub mod feature_id {
    pub const ROOT: u16 = 0x0000;
    pub const FEATURE_SET: u16 = 0x0001;
    pub const DEVICE_INFORMATION: u16 = 0x0003;
    pub const DEVICE_NAME: u16 = 0x0005;
    pub const BATTERY_UNIFIED_LEVEL: u16 = 0x1000;
    pub const BATTERY_VOLTAGE: u16 = 0x1001;
    pub const UNIFIED_BATTERY: u16 = 0x1004;
}

const ROOT_FUNCTION_GET_FEATURE: u8 = 0x0;
const FEATURE_SET_FUNCTION_COUNT: u8 = 0x0;
const FEATURE_SET_FUNCTION_GET_ID: u8 = 0x1;

/// Feature id to index table of one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureMap {
    indices: HashMap<u16, u8>,
}

impl FeatureMap {
    pub fn new() -> Self {
        let mut map = Self::default();
        map.insert(feature_id::ROOT, 0);
        map
    }

    pub fn insert(&mut self, feature_id: u16, index: u8) {
        self.indices.insert(feature_id, index);
    }

    pub fn index_of(&self, feature_id: u16) -> Option<u8> {
        self.indices.get(&feature_id).copied()
    }

    pub fn contains(&self, feature_id: u16) -> bool {
        self.indices.contains_key(&feature_id)
    }

    /// Feature id living at `index`
    pub fn feature_at(&self, index: u8) -> Option<u16> {
        self.indices
            .iter()
            .find_map(|(&id, &i)| (i == index).then_some(id))
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// One discovery request under the channel's enumeration backoff
pub(crate) async fn query(
    channel: &HidppChannel,
    what: &str,
    command: &Hidpp20,
) -> Option<Hidpp20> {
    channel
        .config()
        .feature_backoff
        .retry(what, move |attempt| async move {
            channel.write_read20(command, attempt.timeout).await
        })
        .await
}

/// Enumerate every feature of `device_index`.
///
/// Returns `None` when any step fails after its retries; a partially
/// enumerated table is never returned.
pub async fn discover_features(channel: &HidppChannel, device_index: u8) -> Option<FeatureMap> {
    let lookup = channel
        .command(device_index, 0x00, ROOT_FUNCTION_GET_FEATURE)
        .params(&feature_id::FEATURE_SET.to_be_bytes())
        .build();
    let feature_set_index = query(channel, "feature set lookup", &lookup).await?.param(0);
    if feature_set_index == 0 {
        debug!(device_index, "Device has no FeatureSet feature");
        return None;
    }

    let count_request = channel
        .command(device_index, feature_set_index, FEATURE_SET_FUNCTION_COUNT)
        .build();
    let count = query(channel, "feature count", &count_request).await?.param(0);

    let mut map = FeatureMap::new();
    map.insert(feature_id::FEATURE_SET, feature_set_index);
    for index in 1..=count {
        let request = channel
            .command(device_index, feature_set_index, FEATURE_SET_FUNCTION_GET_ID)
            .param(index)
            .build();
        let response = query(channel, "feature id", &request).await?;
        let id = u16::from_be_bytes([response.param(0), response.param(1)]);
        trace!(device_index, index, feature_id = %format!("0x{:04X}", id), "Feature");
        map.insert(id, index);
    }

    debug!(device_index, features = map.len(), "Feature discovery complete");
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::mock::MockTransport;
    use crate::test_support::SimulatedDevice;
    use std::sync::Arc;

    #[test]
    fn test_feature_map_lookup() {
        let mut map = FeatureMap::new();
        map.insert(feature_id::UNIFIED_BATTERY, 0x06);
        assert_eq!(map.index_of(feature_id::ROOT), Some(0));
        assert_eq!(map.index_of(feature_id::UNIFIED_BATTERY), Some(0x06));
        assert_eq!(map.feature_at(0x06), Some(feature_id::UNIFIED_BATTERY));
        assert_eq!(map.feature_at(0x07), None);
    }

    #[tokio::test]
    async fn test_discover_features() {
        let device = SimulatedDevice::mouse(0x01);
        let transport = Arc::new(MockTransport::new(move |request: &[u8]| {
            device.respond(request)
        }));
        let channel = HidppChannel::open(transport, ChannelConfig::default()).unwrap();

        let map = discover_features(&channel, 0x01).await.unwrap();
        assert_eq!(map.index_of(feature_id::FEATURE_SET), Some(1));
        assert_eq!(map.index_of(feature_id::DEVICE_INFORMATION), Some(2));
        assert_eq!(map.index_of(feature_id::DEVICE_NAME), Some(3));
        assert_eq!(map.index_of(feature_id::UNIFIED_BATTERY), Some(4));
        assert!(!map.contains(feature_id::BATTERY_UNIFIED_LEVEL));
    }

    #[tokio::test]
    async fn test_discovery_fails_without_answers() {
        let mut config = ChannelConfig::default();
        config.feature_backoff.max_attempts = 1;
        config.feature_backoff.timeout_ms = 50;
        let channel = HidppChannel::open(Arc::new(MockTransport::silent()), config).unwrap();

        assert!(discover_features(&channel, 0x01).await.is_none());
    }
}
