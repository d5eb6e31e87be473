//! hidbatt Core - Device model, change messages, and device registry
//!
//! This crate provides the foundational types shared by both battery sources:
//! - Canonical, source-scoped device identities and device records
//! - Init / Update / Remove change messages produced by the device managers
//! - The shared retry/backoff schedule used by every device query
//! - The device registry that merges both sources, reconciles stubs and
//!   retains last-known battery values

pub mod backoff;
pub mod device;
pub mod message;
pub mod registry;
pub mod selection;

pub use backoff::{Attempt, BackoffError, BackoffPolicy};
pub use device::{
    DataSource, Device, DeviceId, DeviceIdError, DeviceType, PowerSupplyStatus, StubInfo,
    STUB_NAME, UNKNOWN,
};
pub use message::{DeviceMessage, InitMessage, RemoveMessage, RemovePattern, UpdateMessage};
pub use registry::{DeviceRegistry, RegistryConfig, RegistryEvent};
pub use selection::{MemorySelectionStore, SelectedDevice, SelectionStore};
