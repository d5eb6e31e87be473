//! Application state management

use anyhow::Result;
use hidbatt_core::{DeviceMessage, DeviceRegistry, MemorySelectionStore};
use hidbatt_ghub::{GHubHandle, GHubSession};
use hidbatt_hidpp::NativeDeviceManager;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::Config;
use crate::mqtt::MqttSink;

/// Capacity of the inbox both sources feed
const MESSAGE_CAPACITY: usize = 256;

/// Shared application state
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    /// Inbox of the registry; both sources hold a clone
    pub messages: mpsc::Sender<DeviceMessage>,
    /// Present while the G HUB source is enabled
    pub ghub: Option<GHubHandle>,
    pub config: Config,
}

impl AppState {
    /// Build the registry, restore remembered selections and start every
    /// enabled source.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store = Arc::new(MemorySelectionStore::new(
            config.registry.selected_devices(),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            config.registry.registry_config(),
            store,
        ));

        // Stubs must exist before any source can announce a device
        registry.load_selection().await;
        tokio::spawn(registry.clone().run_stub_expiry());

        let (messages, inbox) = mpsc::channel(MESSAGE_CAPACITY);
        tokio::spawn(registry.clone().run(inbox));

        if config.native.enabled {
            let manager = NativeDeviceManager::new(config.native.clone(), messages.clone())?;
            tokio::spawn(async move {
                if let Err(e) = manager.run().await {
                    error!(error = %e, "Native device manager failed");
                }
            });
        } else {
            info!("Native HID++ source disabled");
        }

        let ghub = if config.ghub.enabled {
            let (session, handle) = GHubSession::new(config.ghub.clone(), messages.clone());
            tokio::spawn(async move {
                if let Err(e) = session.run().await {
                    error!(error = %e, "G HUB session failed");
                }
            });
            Some(handle)
        } else {
            info!("G HUB source disabled");
            None
        };

        if config.mqtt.enabled {
            let sink = MqttSink::start(config.mqtt.clone());
            tokio::spawn(sink.run(registry.clone()));
        }

        Ok(Arc::new(Self {
            registry,
            messages,
            ghub,
            config,
        }))
    }
}
