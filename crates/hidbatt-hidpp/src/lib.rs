//! hidbatt HID++ - Native battery monitoring over the HID++ protocol
//!
//! This crate talks to Logitech receivers and devices directly:
//! - A blocking byte transport abstraction (with an optional hidapi backend)
//! - HID++ 1.0 / 2.0 frame codecs
//! - A correlator enforcing one outstanding request per channel
//! - Feature discovery and polymorphic battery features
//! - The native device manager producing Init / Update messages

pub mod battery;
pub mod channel;
pub mod correlator;
pub mod device;
pub mod error;
pub mod features;
pub mod frame;
#[cfg(feature = "hidapi")]
pub mod hidapi_transport;
pub mod manager;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(test)]
mod test_support;
pub mod transport;

pub use battery::{
    select_battery_feature, BatteryFeature, BatteryReading, BatteryUnified, BatteryUnifiedLevel,
    BatteryVoltage,
};
pub use channel::{ChannelConfig, HidppChannel, InboundEvent, ProtocolVersion};
pub use correlator::Correlator;
pub use device::HidppDevice;
pub use error::HidppError;
pub use features::{discover_features, feature_id, FeatureMap};
pub use frame::{Hidpp10, Hidpp20, Hidpp20Builder};
pub use manager::{NativeConfig, NativeDeviceManager};
#[cfg(any(test, feature = "mock"))]
pub use mock::MockTransport;
pub use transport::{HidTransport, ReportSupport};
