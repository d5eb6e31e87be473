//! Error types for the native HID++ stack

use hidbatt_core::BackoffError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HidppError {
    #[error("Invalid software id {0}: must be between 1 and 15")]
    InvalidSoftwareId(u8),
    #[error("Invalid {name} backoff: {source}")]
    InvalidBackoff {
        name: &'static str,
        #[source]
        source: BackoffError,
    },
    #[error("Poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[cfg(feature = "hidapi")]
    #[error("hidapi error: {0}")]
    HidApi(#[from] hidapi::HidError),
}
