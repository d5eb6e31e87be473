//! Blocking byte transport underneath a HID++ channel

use std::io;

use crate::frame::{REPORT_LONG, REPORT_SHORT, REPORT_VERY_LONG};

/// Vendor usage page carrying HID++ reports
pub const HIDPP_USAGE_PAGE: u16 = 0xFF00;
/// Usage of the short (7 byte) report collection
pub const USAGE_SHORT: u16 = 0x0001;
/// Usage of the long (20 byte) report collection
pub const USAGE_LONG: u16 = 0x0002;
pub const LOGITECH_VENDOR_ID: u16 = 0x046D;

/// Report sizes an interface can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSupport {
    pub short: bool,
    pub long: bool,
}

impl ReportSupport {
    pub const BOTH: Self = Self {
        short: true,
        long: true,
    };
    pub const SHORT_ONLY: Self = Self {
        short: true,
        long: false,
    };
    pub const LONG_ONLY: Self = Self {
        short: false,
        long: true,
    };

    /// Reports carried by a single HID++ collection
    pub fn for_usage(usage: u16) -> Self {
        match usage {
            USAGE_SHORT => Self::SHORT_ONLY,
            USAGE_LONG => Self::LONG_ONLY,
            _ => Self {
                short: false,
                long: false,
            },
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self {
            short: self.short || other.short,
            long: self.long || other.long,
        }
    }

    /// Whether a report with this id can be written
    pub fn accepts(&self, report_id: u8) -> bool {
        match report_id {
            REPORT_SHORT => self.short,
            REPORT_LONG | REPORT_VERY_LONG => self.long,
            _ => false,
        }
    }
}

/// A HID interface that can exchange raw reports.
///
/// Implementations are blocking; the channel calls them from a dedicated
/// reader thread and from `spawn_blocking`.
pub trait HidTransport: Send + Sync {
    /// Write one report, returning the number of bytes written
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Read one report, waiting at most `timeout_ms`. Returns 0 on timeout.
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> io::Result<usize>;

    /// Reports this interface accepts on write
    fn reports(&self) -> ReportSupport {
        ReportSupport::BOTH
    }

    /// Human-readable identity for logs
    fn name(&self) -> String {
        "hid".to_string()
    }
}

/// Whether a HID collection carries HID++ reports
pub fn is_hidpp_collection(vendor_id: u16, usage_page: u16, usage: u16) -> bool {
    vendor_id == LOGITECH_VENDOR_ID
        && usage_page == HIDPP_USAGE_PAGE
        && (usage == USAGE_SHORT || usage == USAGE_LONG)
}
