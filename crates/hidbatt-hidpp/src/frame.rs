//! HID++ frame codecs
//!
//! Layouts (byte offsets):
//! - HID++ 2.0: `[report, device_index, feature_index, function<<4 | sw_id, params...]`
//! - HID++ 1.0: `[report, device_index, sub_id, address, params...]`
//!
//! Short reports are 7 bytes, long reports 20 bytes. Responses may arrive on
//! either report regardless of how the request was sent.

use crate::error::HidppError;
use crate::transport::ReportSupport;

pub const REPORT_SHORT: u8 = 0x10;
pub const REPORT_LONG: u8 = 0x11;
pub const REPORT_VERY_LONG: u8 = 0x12;

pub const SHORT_LEN: usize = 7;
pub const LONG_LEN: usize = 20;

/// Receiver-level device index
pub const RECEIVER_INDEX: u8 = 0xFF;

/// HID++ 1.0 error sub-id
pub const ERROR_SUB_ID_10: u8 = 0x8F;
/// HID++ 2.0 error feature index
pub const ERROR_FEATURE_INDEX_20: u8 = 0xFF;

/// HID++ 1.0 register access
pub const SUB_ID_GET_REGISTER: u8 = 0x81;
/// HID++ 1.0 device connection notification
pub const SUB_ID_DEVICE_CONNECTION: u8 = 0x41;

fn check_header(bytes: &[u8]) -> Result<(), HidppError> {
    if bytes.len() < 4 {
        return Err(HidppError::MalformedFrame(format!(
            "frame too short ({} bytes)",
            bytes.len()
        )));
    }
    match bytes[0] {
        REPORT_SHORT | REPORT_LONG | REPORT_VERY_LONG => Ok(()),
        other => Err(HidppError::MalformedFrame(format!(
            "unknown report id 0x{:02X}",
            other
        ))),
    }
}

/// HID++ 2.0 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hidpp20 {
    bytes: Vec<u8>,
}

impl Hidpp20 {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HidppError> {
        check_header(bytes)?;
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn report_id(&self) -> u8 {
        self.bytes[0]
    }

    pub fn device_index(&self) -> u8 {
        self.bytes[1]
    }

    pub fn feature_index(&self) -> u8 {
        self.bytes[2]
    }

    pub fn function_id(&self) -> u8 {
        self.bytes[3] >> 4
    }

    pub fn software_id(&self) -> u8 {
        self.bytes[3] & 0x0F
    }

    /// Parameter byte, 0 when the frame is shorter than the offset
    pub fn param(&self, index: usize) -> u8 {
        self.bytes.get(4 + index).copied().unwrap_or(0)
    }

    pub fn params(&self) -> &[u8] {
        &self.bytes[4..]
    }

    /// Error responses carry the failing request's feature index and
    /// function byte in the first two parameter slots.
    pub fn is_error(&self) -> bool {
        self.feature_index() == ERROR_FEATURE_INDEX_20
    }

    /// True when `self` is an error answer to `request`
    pub fn is_error_for(&self, request: &Hidpp20) -> bool {
        self.is_error()
            && self.device_index() == request.device_index()
            && self.bytes[3] == request.feature_index()
            && self.param(0) == request.bytes[3]
    }

    /// True when `self` answers `request` (same device, feature, function and software id)
    pub fn answers(&self, request: &Hidpp20) -> bool {
        !self.is_error()
            && self.device_index() == request.device_index()
            && self.feature_index() == request.feature_index()
            && self.bytes[3] == request.bytes[3]
    }

    /// Error code of a 2.0 error frame
    pub fn error_code(&self) -> Option<u8> {
        self.is_error().then(|| self.param(1))
    }
}

/// Builder for outgoing HID++ 2.0 requests
#[derive(Debug, Clone)]
pub struct Hidpp20Builder {
    device_index: u8,
    feature_index: u8,
    function: u8,
    software_id: u8,
    params: Vec<u8>,
    reports: ReportSupport,
}

impl Hidpp20Builder {
    pub fn new(device_index: u8, feature_index: u8, function: u8, software_id: u8) -> Self {
        Self {
            device_index,
            feature_index,
            function,
            software_id,
            params: Vec::new(),
            reports: ReportSupport::BOTH,
        }
    }

    pub fn param(mut self, byte: u8) -> Self {
        self.params.push(byte);
        self
    }

    pub fn params(mut self, bytes: &[u8]) -> Self {
        self.params.extend_from_slice(bytes);
        self
    }

    /// Restrict the output to the reports the interface accepts
    pub fn reports(mut self, reports: ReportSupport) -> Self {
        self.reports = reports;
        self
    }

    /// Build a short report when the parameters fit and the interface takes
    /// short reports, a zero-padded long one otherwise
    pub fn build(self) -> Hidpp20 {
        let fits_short = self.params.len() <= SHORT_LEN - 4;
        let (report, len) = if fits_short && (self.reports.short || !self.reports.long) {
            (REPORT_SHORT, SHORT_LEN)
        } else {
            (REPORT_LONG, LONG_LEN)
        };
        let mut bytes = vec![0u8; len];
        bytes[0] = report;
        bytes[1] = self.device_index;
        bytes[2] = self.feature_index;
        bytes[3] = (self.function << 4) | (self.software_id & 0x0F);
        let n = self.params.len().min(len - 4);
        bytes[4..4 + n].copy_from_slice(&self.params[..n]);
        Hidpp20 { bytes }
    }
}

/// HID++ 1.0 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hidpp10 {
    bytes: Vec<u8>,
}

impl Hidpp10 {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HidppError> {
        check_header(bytes)?;
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Short register request
    pub fn request(device_index: u8, sub_id: u8, address: u8, params: [u8; 3]) -> Self {
        Self {
            bytes: vec![
                REPORT_SHORT,
                device_index,
                sub_id,
                address,
                params[0],
                params[1],
                params[2],
            ],
        }
    }

    /// Re-encode a short request as a padded long report when the
    /// interface has no short collection
    pub fn for_reports(mut self, reports: ReportSupport) -> Self {
        if self.bytes[0] == REPORT_SHORT && !reports.short && reports.long {
            self.bytes[0] = REPORT_LONG;
            self.bytes.resize(LONG_LEN, 0);
        }
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn device_index(&self) -> u8 {
        self.bytes[1]
    }

    pub fn sub_id(&self) -> u8 {
        self.bytes[2]
    }

    pub fn address(&self) -> u8 {
        self.bytes[3]
    }

    pub fn param(&self, index: usize) -> u8 {
        self.bytes.get(4 + index).copied().unwrap_or(0)
    }

    pub fn is_error(&self) -> bool {
        self.sub_id() == ERROR_SUB_ID_10
    }

    /// 1.0 errors echo the request's sub-id and address
    pub fn is_error_for(&self, request: &Hidpp10) -> bool {
        self.is_error()
            && self.device_index() == request.device_index()
            && self.address() == request.sub_id()
            && self.param(0) == request.address()
    }

    pub fn answers(&self, request: &Hidpp10) -> bool {
        self.device_index() == request.device_index()
            && self.sub_id() == request.sub_id()
            && self.address() == request.address()
    }
}
