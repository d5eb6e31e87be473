//! Native device manager
//!
//! Drives every HID++ device behind a transport: queries the configured
//! device indices one at a time, announces each device with an Init message,
//! polls its battery on a fixed interval and turns battery broadcasts and
//! link notifications into Update messages for the registry.

use std::collections::HashMap;
use std::sync::Arc;

use hidbatt_core::{
    BackoffPolicy, DeviceMessage, PowerSupplyStatus, RemoveMessage, UpdateMessage, UNKNOWN,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, HidppChannel, InboundEvent};
use crate::device::HidppDevice;
use crate::error::HidppError;
use crate::transport::HidTransport;

/// `[native]` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Software id stamped on every request, 1..=15
    #[serde(default = "default_software_id")]
    pub software_id: u8,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// How long a request waits for a busy channel
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Device indices queried behind a receiver
    #[serde(default = "default_receiver_indices")]
    pub receiver_indices: Vec<u8>,
    #[serde(default = "BackoffPolicy::init")]
    pub init_backoff: BackoffPolicy,
    #[serde(default = "BackoffPolicy::feature_enumeration")]
    pub feature_backoff: BackoffPolicy,
    #[serde(default = "BackoffPolicy::battery")]
    pub battery_backoff: BackoffPolicy,
}

fn default_enabled() -> bool {
    true
}

fn default_software_id() -> u8 {
    0x0A
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_lock_timeout_ms() -> u64 {
    100
}

fn default_receiver_indices() -> Vec<u8> {
    (1..=6).collect()
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            software_id: default_software_id(),
            poll_interval_secs: default_poll_interval_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            receiver_indices: default_receiver_indices(),
            init_backoff: BackoffPolicy::init(),
            feature_backoff: BackoffPolicy::feature_enumeration(),
            battery_backoff: BackoffPolicy::battery(),
        }
    }
}

impl NativeConfig {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            software_id: self.software_id,
            lock_timeout_ms: self.lock_timeout_ms,
            init_backoff: self.init_backoff.clone(),
            feature_backoff: self.feature_backoff.clone(),
            battery_backoff: self.battery_backoff.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Reject configurations that must never reach the device
    pub fn validate(&self) -> Result<(), HidppError> {
        self.channel_config().validate()?;
        if self.poll_interval_secs == 0 {
            return Err(HidppError::ZeroPollInterval);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NativeDeviceManager {
    config: NativeConfig,
    messages: mpsc::Sender<DeviceMessage>,
}

/// Shared state of the tasks driving one channel
#[derive(Clone)]
struct ChannelContext {
    channel: Arc<HidppChannel>,
    devices: Arc<RwLock<HashMap<u8, Arc<HidppDevice>>>>,
    /// Serialises probing so slow, silent indices don't starve each other
    init_lock: Arc<Mutex<()>>,
    messages: mpsc::Sender<DeviceMessage>,
    poll_interval: Duration,
}

impl ChannelContext {
    async fn emit(&self, message: impl Into<DeviceMessage>) -> bool {
        self.messages.send(message.into()).await.is_ok()
    }

    async fn initialise(&self, device_index: u8) -> Option<Arc<HidppDevice>> {
        let device = {
            let _init = self.init_lock.lock().await;
            HidppDevice::connect(self.channel.clone(), device_index).await
        };
        let Some(device) = device.map(Arc::new) else {
            debug!(
                channel = %self.channel.name(),
                device_index,
                "No HID++ 2.0 device at index"
            );
            return None;
        };

        self.devices
            .write()
            .await
            .insert(device_index, device.clone());
        if !self.emit(device.init_message()).await {
            return None;
        }
        Some(device)
    }

    async fn drive(self, device_index: u8) {
        let Some(device) = self.initialise(device_index).await else {
            return;
        };
        if !device.has_battery() {
            return;
        }

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match device.read_battery().await {
                Some(update) => {
                    if !self.emit(update).await {
                        return;
                    }
                }
                None => debug!(device = %device.id(), "No battery reading this cycle"),
            }
        }
    }
}

impl NativeDeviceManager {
    /// Validate `config`; an invalid software id stops startup here.
    pub fn new(
        config: NativeConfig,
        messages: mpsc::Sender<DeviceMessage>,
    ) -> Result<Self, HidppError> {
        config.validate()?;
        Ok(Self { config, messages })
    }

    pub fn config(&self) -> &NativeConfig {
        &self.config
    }

    /// Drive every device behind `transport` until the transport closes.
    ///
    /// Devices announced on this transport are removed from the registry
    /// when it goes away.
    pub async fn run_transport(
        &self,
        transport: Arc<dyn HidTransport>,
        device_indices: Vec<u8>,
    ) -> Result<(), HidppError> {
        let channel = HidppChannel::open(transport, self.config.channel_config())?;
        let Some(mut events) = channel.take_events() else {
            return Ok(());
        };
        let name = channel.name().to_string();

        let ctx = ChannelContext {
            channel,
            devices: Arc::new(RwLock::new(HashMap::new())),
            init_lock: Arc::new(Mutex::new(())),
            messages: self.messages.clone(),
            poll_interval: self.config.poll_interval(),
        };

        let mut tasks = JoinSet::new();
        let mut drivers: HashMap<u8, AbortHandle> = HashMap::new();
        for &index in &device_indices {
            drivers.insert(index, tasks.spawn(ctx.clone().drive(index)));
        }

        while let Some(event) = events.recv().await {
            while tasks.try_join_next().is_some() {}

            match event {
                InboundEvent::Connection {
                    device_index,
                    link_established: true,
                } => {
                    info!(channel = %name, device_index, "Device connected, reinitialising");
                    if let Some(handle) = drivers.remove(&device_index) {
                        handle.abort();
                    }
                    ctx.devices.write().await.remove(&device_index);
                    drivers.insert(device_index, tasks.spawn(ctx.clone().drive(device_index)));
                }
                InboundEvent::Connection {
                    device_index,
                    link_established: false,
                } => {
                    info!(channel = %name, device_index, "Device link lost");
                    if let Some(handle) = drivers.remove(&device_index) {
                        handle.abort();
                    }
                    let device = ctx.devices.write().await.remove(&device_index);
                    if let Some(device) = device {
                        let offline = UpdateMessage::new(
                            device.id().clone(),
                            UNKNOWN,
                            PowerSupplyStatus::Unknown,
                            UNKNOWN,
                        );
                        if !ctx.emit(offline).await {
                            break;
                        }
                    }
                }
                InboundEvent::Broadcast(frame) => {
                    let device = ctx.devices.read().await.get(&frame.device_index()).cloned();
                    if let Some(update) = device.and_then(|d| d.handle_event(&frame)) {
                        debug!(
                            device = %update.device_id,
                            percent = update.battery_percentage,
                            "Battery event"
                        );
                        if !ctx.emit(update).await {
                            break;
                        }
                    }
                }
            }
        }

        tasks.abort_all();
        warn!(channel = %name, "HID++ channel closed");
        let devices: Vec<_> = ctx.devices.write().await.drain().map(|(_, d)| d).collect();
        for device in devices {
            ctx.emit(RemoveMessage::device(device.id().clone(), "transport closed"))
                .await;
        }
        Ok(())
    }

    /// Enumerate Logitech HID++ interfaces and drive each until it closes
    #[cfg(feature = "hidapi")]
    pub async fn run(&self) -> Result<(), HidppError> {
        let interfaces = crate::hidapi_transport::open_hidpp_interfaces()?;
        if interfaces.is_empty() {
            info!("No Logitech HID++ interfaces found");
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for interface in interfaces {
            let indices = if interface.is_receiver {
                self.config.receiver_indices.clone()
            } else {
                vec![crate::frame::RECEIVER_INDEX]
            };
            let manager = self.clone();
            tasks.spawn(async move {
                manager
                    .run_transport(Arc::new(interface.transport), indices)
                    .await
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "HID++ interface failed"),
                Err(e) => warn!(error = %e, "HID++ interface task failed"),
            }
        }
        Ok(())
    }

    #[cfg(not(feature = "hidapi"))]
    pub async fn run(&self) -> Result<(), HidppError> {
        warn!("Built without the hidapi feature, native device enumeration unavailable");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::test_support::SimulatedDevice;
    use hidbatt_core::DeviceId;

    fn fast_config() -> NativeConfig {
        let mut config = NativeConfig::default();
        for policy in [
            &mut config.init_backoff,
            &mut config.feature_backoff,
            &mut config.battery_backoff,
        ] {
            policy.max_attempts = 2;
            policy.timeout_ms = 100;
            policy.initial_delay_ms = 10;
            policy.max_delay_ms = 10;
        }
        config
    }

    async fn next(rx: &mut mpsc::Receiver<DeviceMessage>) -> DeviceMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed")
    }

    #[test]
    fn test_invalid_software_id_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let config = NativeConfig {
            software_id: 0,
            ..NativeConfig::default()
        };
        assert!(matches!(
            NativeDeviceManager::new(config, tx.clone()),
            Err(HidppError::InvalidSoftwareId(0))
        ));

        let config = NativeConfig {
            software_id: 16,
            ..NativeConfig::default()
        };
        assert!(NativeDeviceManager::new(config, tx).is_err());
    }

    #[test]
    fn test_config_defaults_from_toml_shape() {
        let config: NativeConfig = serde_json::from_str(r#"{"software_id": 3}"#).unwrap();
        assert_eq!(config.software_id, 3);
        assert_eq!(config.receiver_indices, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(config.battery_backoff, BackoffPolicy::battery());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_run_transport_lifecycle() {
        let device = SimulatedDevice::mouse(0x01);
        let battery_index = device.feature_index(crate::features::feature_id::UNIFIED_BATTERY);
        let transport = Arc::new(MockTransport::new(move |request: &[u8]| {
            device.respond(request)
        }));

        let (tx, mut rx) = mpsc::channel(16);
        let manager = NativeDeviceManager::new(fast_config(), tx).unwrap();
        let runner = {
            let transport = transport.clone();
            tokio::spawn(async move { manager.run_transport(transport, vec![0x01, 0x02]).await })
        };

        let id = DeviceId::native("4a1b2c3d");
        match next(&mut rx).await {
            DeviceMessage::Init(init) => {
                assert_eq!(init.device_id, id);
                assert_eq!(init.device_name, "MX Master 3");
            }
            other => panic!("expected init, got {:?}", other),
        }
        match next(&mut rx).await {
            DeviceMessage::Update(update) => assert_eq!(update.battery_percentage, 75),
            other => panic!("expected update, got {:?}", other),
        }

        transport.inject(vec![0x11, 0x01, battery_index, 0x00, 20, 0x02, 0x00]);
        match next(&mut rx).await {
            DeviceMessage::Update(update) => {
                assert_eq!(update.device_id, id);
                assert_eq!(update.battery_percentage, 20);
            }
            other => panic!("expected event update, got {:?}", other),
        }

        transport.inject(vec![0x10, 0x01, 0x41, 0x04, 0x40, 0x00, 0x00]);
        match next(&mut rx).await {
            DeviceMessage::Update(update) => {
                assert_eq!(update.device_id, id);
                assert_eq!(update.battery_percentage, UNKNOWN);
            }
            other => panic!("expected offline update, got {:?}", other),
        }

        runner.abort();
    }
}
