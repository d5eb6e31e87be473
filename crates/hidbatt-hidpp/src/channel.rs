//! A HID++ channel: one transport, one reader thread, one correlator
//!
//! The reader thread routes every inbound report:
//! - HID++ 1.0 device connection notifications become [`InboundEvent::Connection`]
//! - feature reports with software id 0 are device broadcasts ([`InboundEvent::Broadcast`])
//! - everything else is offered to the correlator as a potential response

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hidbatt_core::BackoffPolicy;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::correlator::Correlator;
use crate::error::HidppError;
use crate::frame::{
    Hidpp10, Hidpp20, Hidpp20Builder, SUB_ID_DEVICE_CONNECTION, SUB_ID_GET_REGISTER,
};
use crate::transport::{HidTransport, ReportSupport};

/// Reader poll granularity; also bounds how long shutdown takes
const READ_TIMEOUT_MS: i32 = 50;
const QUEUE_CAPACITY: usize = 64;
const MAX_REPORT_LEN: usize = 64;

/// Root feature ping function
const ROOT_FUNCTION_PING: u8 = 0x1;
/// HID++ 1.0 register holding the receiver's connection state
const REGISTER_CONNECTION_STATE: u8 = 0x02;

/// Unsolicited traffic from the devices behind a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A device paired to a receiver connected or dropped its link
    Connection {
        device_index: u8,
        link_established: bool,
    },
    /// A feature broadcast such as a battery status change
    Broadcast(Hidpp20),
}

/// HID++ protocol version reported by the root feature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

/// Per-channel protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub software_id: u8,
    pub lock_timeout_ms: u64,
    pub init_backoff: BackoffPolicy,
    pub feature_backoff: BackoffPolicy,
    pub battery_backoff: BackoffPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            software_id: 0x0A,
            lock_timeout_ms: 100,
            init_backoff: BackoffPolicy::init(),
            feature_backoff: BackoffPolicy::feature_enumeration(),
            battery_backoff: BackoffPolicy::battery(),
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), HidppError> {
        if !(1..=15).contains(&self.software_id) {
            return Err(HidppError::InvalidSoftwareId(self.software_id));
        }
        for (name, policy) in [
            ("init", &self.init_backoff),
            ("feature", &self.feature_backoff),
            ("battery", &self.battery_backoff),
        ] {
            policy
                .validate()
                .map_err(|source| HidppError::InvalidBackoff { name, source })?;
        }
        Ok(())
    }
}

pub struct HidppChannel {
    name: String,
    correlator: Correlator,
    config: ChannelConfig,
    reports: ReportSupport,
    events: Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    ping_counter: AtomicU8,
    stop: Arc<AtomicBool>,
}

impl HidppChannel {
    /// Validate `config`, start the reader thread and return the channel.
    pub fn open(
        transport: Arc<dyn HidTransport>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>, HidppError> {
        config.validate()?;

        let name = transport.name();
        let reports = transport.reports();
        let (response_tx, response_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(QUEUE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));

        {
            let transport = transport.clone();
            let stop = stop.clone();
            let name = name.clone();
            std::thread::Builder::new()
                .name(format!("hidpp-reader-{}", name))
                .spawn(move || reader_loop(transport, response_tx, event_tx, stop, &name))?;
        }

        info!(
            channel = %name,
            software_id = config.software_id,
            short_reports = reports.short,
            long_reports = reports.long,
            "Opened HID++ channel"
        );

        Ok(Arc::new(Self {
            name,
            correlator: Correlator::new(
                transport,
                response_rx,
                Duration::from_millis(config.lock_timeout_ms),
            ),
            config,
            reports,
            events: Mutex::new(Some(event_rx)),
            ping_counter: AtomicU8::new(0),
            stop,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn software_id(&self) -> u8 {
        self.config.software_id
    }

    /// Take the unsolicited event stream. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Start a 2.0 request carrying this channel's software id, sized for
    /// the reports the transport accepts
    pub fn command(&self, device_index: u8, feature_index: u8, function: u8) -> Hidpp20Builder {
        Hidpp20Builder::new(device_index, feature_index, function, self.config.software_id)
            .reports(self.reports)
    }

    /// Send a HID++ 2.0 request and wait for its response.
    ///
    /// A 2.0 error frame for this request ends the wait early with `None`.
    pub async fn write_read20(&self, command: &Hidpp20, timeout: Duration) -> Option<Hidpp20> {
        let matcher = |bytes: &[u8]| {
            Hidpp20::from_bytes(bytes).is_ok_and(|frame| frame.answers(command))
        };
        let early_exit = |bytes: &[u8]| {
            Hidpp20::from_bytes(bytes).is_ok_and(|frame| {
                let failed = frame.is_error_for(command);
                if failed {
                    debug!(
                        channel = %self.name,
                        device_index = command.device_index(),
                        feature_index = command.feature_index(),
                        error = ?frame.error_code(),
                        "HID++ 2.0 error response"
                    );
                }
                failed
            })
        };
        let bytes = self
            .correlator
            .send_and_wait(command.as_bytes(), &matcher, timeout, Some(&early_exit))
            .await?;
        Hidpp20::from_bytes(&bytes).ok()
    }

    /// Send a HID++ 1.0 request and wait for its response
    pub async fn write_read10(&self, command: &Hidpp10, timeout: Duration) -> Option<Hidpp10> {
        let matcher = |bytes: &[u8]| {
            Hidpp10::from_bytes(bytes).is_ok_and(|frame| frame.answers(command))
        };
        let early_exit = |bytes: &[u8]| {
            Hidpp10::from_bytes(bytes).is_ok_and(|frame| frame.is_error_for(command))
        };
        let bytes = self
            .correlator
            .send_and_wait(command.as_bytes(), &matcher, timeout, Some(&early_exit))
            .await?;
        Hidpp10::from_bytes(&bytes).ok()
    }

    /// Ping the root feature of `device_index`.
    ///
    /// `None` when nothing answers or the device only speaks HID++ 1.0.
    pub async fn ping20(&self, device_index: u8, timeout: Duration) -> Option<ProtocolVersion> {
        let marker = self.ping_counter.fetch_add(1, Ordering::Relaxed);
        let command = self
            .command(device_index, 0x00, ROOT_FUNCTION_PING)
            .params(&[0x00, 0x00, marker])
            .build();

        let matcher = |bytes: &[u8]| {
            Hidpp20::from_bytes(bytes)
                .is_ok_and(|frame| frame.answers(&command) && frame.param(2) == marker)
        };
        // 1.0-only devices reject the ping with a 1.0 error
        let early_exit = |bytes: &[u8]| {
            Hidpp10::from_bytes(bytes).is_ok_and(|frame| {
                frame.is_error() && frame.device_index() == device_index && frame.address() == 0x00
            })
        };

        let bytes = self
            .correlator
            .send_and_wait(command.as_bytes(), &matcher, timeout, Some(&early_exit))
            .await?;
        let frame = Hidpp20::from_bytes(&bytes).ok()?;
        Some(ProtocolVersion {
            major: frame.param(0),
            minor: frame.param(1),
        })
    }

    /// Number of devices currently connected to a receiver
    pub async fn connected_device_count(
        &self,
        receiver_index: u8,
        timeout: Duration,
    ) -> Option<u8> {
        let command = Hidpp10::request(
            receiver_index,
            SUB_ID_GET_REGISTER,
            REGISTER_CONNECTION_STATE,
            [0; 3],
        )
        .for_reports(self.reports);
        let response = self.write_read10(&command, timeout).await?;
        Some(response.param(1))
    }
}

impl Drop for HidppChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Classify one inbound report
fn route(bytes: &[u8]) -> Option<Result<InboundEvent, Vec<u8>>> {
    let frame = Hidpp20::from_bytes(bytes).ok()?;
    if frame.feature_index() == SUB_ID_DEVICE_CONNECTION {
        return Some(Ok(InboundEvent::Connection {
            device_index: frame.device_index(),
            link_established: frame.param(0) & 0x40 == 0,
        }));
    }
    if frame.feature_index() < 0x40 && frame.software_id() == 0 {
        return Some(Ok(InboundEvent::Broadcast(frame)));
    }
    Some(Err(bytes.to_vec()))
}

fn reader_loop(
    transport: Arc<dyn HidTransport>,
    responses: mpsc::Sender<Vec<u8>>,
    events: mpsc::Sender<InboundEvent>,
    stop: Arc<AtomicBool>,
    name: &str,
) {
    let mut buf = [0u8; MAX_REPORT_LEN];
    while !stop.load(Ordering::Relaxed) {
        let n = match transport.read_timeout(&mut buf, READ_TIMEOUT_MS) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                warn!(channel = %name, error = %e, "HID read failed, closing channel");
                break;
            }
        };

        match route(&buf[..n]) {
            Some(Ok(event)) => {
                trace!(channel = %name, event = ?event, "Inbound event");
                if events.try_send(event).is_err() {
                    trace!(channel = %name, "Event queue full or closed, dropping");
                }
            }
            Some(Err(frame)) => {
                if responses.try_send(frame).is_err() {
                    trace!(channel = %name, "Response queue full or closed, dropping");
                }
            }
            None => trace!(channel = %name, len = n, "Ignoring non HID++ report"),
        }

        if responses.is_closed() {
            break;
        }
    }
    debug!(channel = %name, "Reader thread stopped");
}
