//! hidapi backend for [`HidTransport`]

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hidapi::{HidApi, HidDevice};
use tracing::{debug, info};

use crate::error::HidppError;
use crate::transport::{is_hidpp_collection, HidTransport, ReportSupport};

/// Product ids of Unifying / Bolt / Lightspeed receivers
const RECEIVER_PRODUCT_IDS: &[u16] = &[
    0xC52B, 0xC52F, 0xC531, 0xC532, 0xC534, 0xC539, 0xC53A, 0xC53D, 0xC53F, 0xC541, 0xC545,
    0xC547, 0xC548,
];

/// Read slice per handle when several collections are polled in turn
const POLL_SLICE_MS: u64 = 10;

/// One opened HID collection and the reports it carries
struct Handle {
    device: Mutex<HidDevice>,
    reports: ReportSupport,
}

impl Handle {
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> io::Result<usize> {
        let device = self
            .device
            .lock()
            .map_err(|_| io::Error::other("HID device lock poisoned"))?;
        device.read_timeout(buf, timeout_ms).map_err(to_io)
    }
}

/// A physical HID++ interface, backed by its short and long collections
/// when the platform exposes them separately
pub struct HidApiTransport {
    handles: Vec<Handle>,
    name: String,
}

fn to_io(e: hidapi::HidError) -> io::Error {
    io::Error::other(e.to_string())
}

impl HidTransport for HidApiTransport {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let report_id = data.first().copied().unwrap_or_default();
        let handle = self
            .handles
            .iter()
            .find(|h| h.reports.accepts(report_id))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no collection accepts report 0x{:02X}", report_id),
                )
            })?;
        let device = handle
            .device
            .lock()
            .map_err(|_| io::Error::other("HID device lock poisoned"))?;
        device.write(data).map_err(to_io)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> io::Result<usize> {
        if let [handle] = self.handles.as_slice() {
            return handle.read_timeout(buf, timeout_ms);
        }

        let deadline = (timeout_ms >= 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        loop {
            for handle in &self.handles {
                let slice = match deadline {
                    Some(deadline) => deadline
                        .saturating_duration_since(Instant::now())
                        .min(Duration::from_millis(POLL_SLICE_MS)),
                    None => Duration::from_millis(POLL_SLICE_MS),
                };
                let n = handle.read_timeout(buf, slice.as_millis() as i32)?;
                if n > 0 {
                    return Ok(n);
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(0);
            }
        }
    }

    fn reports(&self) -> ReportSupport {
        self.handles
            .iter()
            .fold(ReportSupport::for_usage(0), |acc, h| acc.union(h.reports))
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// An opened HID++ interface
pub struct HidppInterface {
    pub transport: HidApiTransport,
    /// Receivers multiplex paired devices on indices 1..=6
    pub is_receiver: bool,
}

/// Key identifying one physical interface across its collections
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InterfaceKey {
    vendor_id: u16,
    product_id: u16,
    serial: String,
    interface: i32,
}

/// Merge collections sharing a path (hidraw lists one node per usage) and
/// keep the distinct paths of each interface in enumeration order
fn group_collections<P: Clone + PartialEq>(
    collections: impl IntoIterator<Item = (InterfaceKey, P, ReportSupport)>,
) -> Vec<(InterfaceKey, Vec<(P, ReportSupport)>)> {
    let mut order: Vec<InterfaceKey> = Vec::new();
    let mut groups: HashMap<InterfaceKey, Vec<(P, ReportSupport)>> = HashMap::new();
    for (key, path, reports) in collections {
        let paths = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        match paths.iter_mut().find(|(p, _)| *p == path) {
            Some((_, existing)) => *existing = existing.union(reports),
            None => paths.push((path, reports)),
        }
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key).map(|paths| (key, paths)))
        .collect()
}

/// Open one HID++ interface per physical Logitech device.
///
/// Some platforms expose the short and long report collections as separate
/// handles; both are opened so short requests have somewhere to go and
/// responses on either report are read.
pub fn open_hidpp_interfaces() -> Result<Vec<HidppInterface>, HidppError> {
    let api = HidApi::new()?;

    let mut products = HashMap::new();
    let collections: Vec<_> = api
        .device_list()
        .filter(|info| is_hidpp_collection(info.vendor_id(), info.usage_page(), info.usage()))
        .map(|info| {
            let key = InterfaceKey {
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
                serial: info.serial_number().unwrap_or_default().to_string(),
                interface: info.interface_number(),
            };
            products
                .entry(key.clone())
                .or_insert_with(|| info.product_string().unwrap_or("unknown").to_string());
            (
                key,
                CString::from(info.path()),
                ReportSupport::for_usage(info.usage()),
            )
        })
        .collect();

    let mut interfaces = Vec::new();
    for (key, paths) in group_collections(collections) {
        let mut handles = Vec::new();
        for (path, reports) in paths {
            match api.open_path(&path) {
                Ok(device) => handles.push(Handle {
                    device: Mutex::new(device),
                    reports,
                }),
                Err(e) => {
                    debug!(path = ?path, error = %e, "Could not open HID++ collection");
                }
            }
        }
        if handles.is_empty() {
            continue;
        }

        let name = format!(
            "{:04x}-{:04x}-{}",
            key.vendor_id, key.product_id, key.interface
        );
        let is_receiver = RECEIVER_PRODUCT_IDS.contains(&key.product_id);
        let transport = HidApiTransport { handles, name };
        let reports = transport.reports();
        info!(
            interface = %transport.name,
            product = products.get(&key).map(String::as_str).unwrap_or("unknown"),
            is_receiver,
            collections = transport.handles.len(),
            short_reports = reports.short,
            long_reports = reports.long,
            "Opened HID++ interface"
        );

        interfaces.push(HidppInterface {
            transport,
            is_receiver,
        });
    }

    Ok(interfaces)
}
