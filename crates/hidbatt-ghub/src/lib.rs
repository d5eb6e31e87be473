//! hidbatt G HUB - Battery state from the vendor device manager
//!
//! The vendor service pushes JSON envelopes over a local WebSocket. This
//! crate decodes them, reconciles device state across reconnects (device
//! identifiers are not stable) and feeds Init / Update / Remove messages to
//! the registry.

pub mod error;
pub mod message;
pub mod reconciler;
pub mod session;

pub use error::GHubError;
pub use message::{BatteryState, DeviceInfo, DeviceList, DeviceStateChange, Envelope, GHubEvent};
pub use reconciler::{Action, Reconciler};
pub use session::{GHubConfig, GHubHandle, GHubSession, SessionCommand};
