//! Canonical device registry
//!
//! Merges Init / Update / Remove messages from both sources into one map keyed
//! by canonical [`DeviceId`]. All mutation happens under a single registry
//! lock, so readers always observe a fully applied message.
//!
//! Stubs are placeholders for remembered selections. They are created by
//! [`DeviceRegistry::load_selection`], replaced by a live device through stub
//! reconciliation, or deleted by [`DeviceRegistry::expire_stubs`] once the
//! wait window passes. Remove messages never touch stubs.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceId};
use crate::message::{DeviceMessage, InitMessage, RemoveMessage, UpdateMessage};
use crate::selection::{SelectedDevice, SelectionStore};

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// How long a stub waits for a live device before it is dropped
    #[serde(default = "default_stub_expiry_secs")]
    pub stub_expiry_secs: u64,
    /// Capacity of the change feed
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_stub_expiry_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    100
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stub_expiry_secs: default_stub_expiry_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl RegistryConfig {
    pub fn stub_expiry(&self) -> Duration {
        Duration::from_secs(self.stub_expiry_secs)
    }
}

/// Change feed entry
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// New record (live device or stub)
    DeviceAdded(Device),
    /// Static fields, battery state or selection changed
    DeviceUpdated(Device),
    DeviceRemoved { id: DeviceId, reason: String },
    /// A live device took over a stub under a new identifier
    StubReplaced { stub_id: DeviceId, device: Device },
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<DeviceId, Device>,
    stub_deadlines: HashMap<DeviceId, Instant>,
}

impl RegistryState {
    /// Find a stub that a live Init under a different id should replace.
    ///
    /// Requires: the stub's remembered name equals the incoming name, both ids
    /// belong to the same source and have that source's id shape, and the
    /// existing record is a stub (the incoming one never is).
    fn reconcilable_stub(&self, init: &InitMessage) -> Option<DeviceId> {
        let incoming = &init.device_id;
        let mut candidates: Vec<&DeviceId> = self
            .devices
            .values()
            .filter(|d| d.is_stub())
            .filter(|d| &d.id != incoming)
            .filter(|d| d.remembered_name() == Some(init.device_name.as_str()))
            .filter(|d| d.id.source == incoming.source)
            .filter(|d| d.id.has_source_shape() && incoming.has_source_shape())
            .map(|d| &d.id)
            .collect();
        candidates.sort();
        candidates.first().map(|id| (*id).clone())
    }
}

/// Canonical store of devices from every source
pub struct DeviceRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    selection: Arc<dyn SelectionStore>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig, selection: Arc<dyn SelectionStore>) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
            selection,
            event_tx,
        }
    }

    /// Subscribe to registry changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Consistent snapshot of all records, ordered by source then name
    pub async fn devices(&self) -> Vec<Device> {
        let state = self.state.read().await;
        let mut devices: Vec<Device> = state.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            (a.id.source, &a.name, &a.id).cmp(&(b.id.source, &b.name, &b.id))
        });
        devices
    }

    pub async fn get(&self, id: &DeviceId) -> Option<Device> {
        self.state.read().await.devices.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply any device message
    pub async fn apply(&self, message: DeviceMessage) {
        match message {
            DeviceMessage::Init(init) => self.apply_init(init).await,
            DeviceMessage::Update(update) => self.apply_update(update).await,
            DeviceMessage::Remove(remove) => {
                self.apply_remove(remove).await;
            }
        }
    }

    /// Apply messages from a channel until every sender is dropped
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<DeviceMessage>) {
        while let Some(message) = rx.recv().await {
            self.apply(message).await;
        }
        debug!("Device message channel closed");
    }

    /// Insert a device, refresh an existing one, or reconcile it with a stub
    pub async fn apply_init(&self, init: InitMessage) {
        let mut state = self.state.write().await;
        let id = init.device_id.clone();

        if let Some(existing) = state.devices.get_mut(&id) {
            let was_stub = existing.is_stub();
            existing.apply_init(&init);
            let device = existing.clone();
            if was_stub {
                state.stub_deadlines.remove(&id);
                info!(device = %id, name = %device.name, "Stub confirmed by live device");
            } else {
                debug!(device = %id, "Refreshed device static fields");
            }
            let _ = self.event_tx.send(RegistryEvent::DeviceUpdated(device));
            return;
        }

        if let Some(stub_id) = state.reconcilable_stub(&init) {
            let stub = state.devices.remove(&stub_id);
            state.stub_deadlines.remove(&stub_id);

            let mut device = Device::from_init(&init);
            device.selected = stub.map(|s| s.selected).unwrap_or(false);

            if device.selected {
                self.selection.remove(&stub_id);
                self.selection.add(SelectedDevice::new(
                    id.clone(),
                    Some(device.name.clone()),
                ));
            }

            info!(
                stub = %stub_id,
                device = %id,
                name = %device.name,
                "Replaced stub with live device under new identifier"
            );

            state.devices.insert(id, device.clone());
            let _ = self.event_tx.send(RegistryEvent::StubReplaced { stub_id, device });
            return;
        }

        let mut device = Device::from_init(&init);
        device.selected = self.selection.contains(&id);

        info!(
            device = %id,
            name = %device.name,
            device_type = ?device.device_type,
            "Device added"
        );
        state.devices.insert(id, device.clone());
        let _ = self.event_tx.send(RegistryEvent::DeviceAdded(device));
    }

    /// Update battery fields of a known live device; never creates entries
    pub async fn apply_update(&self, update: UpdateMessage) {
        let mut state = self.state.write().await;

        let Some(device) = state.devices.get_mut(&update.device_id) else {
            debug!(device = %update.device_id, "Update for unknown device ignored");
            return;
        };

        if device.is_stub() {
            debug!(device = %update.device_id, "Update for stub ignored");
            return;
        }

        device.apply_update(&update);
        debug!(
            device = %update.device_id,
            percent = device.battery_percent,
            status = ?device.power_status,
            online = device.is_online,
            "Battery updated"
        );
        let _ = self.event_tx.send(RegistryEvent::DeviceUpdated(device.clone()));
    }

    /// Remove live records matching the pattern; returns how many went away
    pub async fn apply_remove(&self, remove: RemoveMessage) -> usize {
        let mut state = self.state.write().await;

        let targets: Vec<DeviceId> = state
            .devices
            .values()
            .filter(|d| !d.is_stub() && remove.pattern.matches(&d.id))
            .map(|d| d.id.clone())
            .collect();

        for id in &targets {
            state.devices.remove(id);
            info!(device = %id, reason = %remove.reason, "Device removed");
            let _ = self.event_tx.send(RegistryEvent::DeviceRemoved {
                id: id.clone(),
                reason: remove.reason.clone(),
            });
        }

        if targets.is_empty() {
            debug!(pattern = %remove.pattern, "Remove matched no devices");
        }
        targets.len()
    }

    /// Create stubs for remembered selections not already present.
    ///
    /// Duplicate ids in the store are collapsed (first entry wins) and the
    /// store is rewritten. Returns the number of stubs created.
    pub async fn load_selection(&self) -> usize {
        let mut seen = HashSet::new();
        let entries: Vec<SelectedDevice> = self
            .selection
            .selected()
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();
        self.selection.replace_all(entries.clone());

        let deadline = Instant::now() + self.config.stub_expiry();
        let mut state = self.state.write().await;
        let mut created = 0;

        for entry in entries {
            if state.devices.contains_key(&entry.id) {
                continue;
            }
            let stub = Device::stub(entry.id.clone(), entry.name);
            state.stub_deadlines.insert(entry.id.clone(), deadline);
            state.devices.insert(entry.id.clone(), stub.clone());
            debug!(device = %entry.id, "Created stub for remembered selection");
            let _ = self.event_tx.send(RegistryEvent::DeviceAdded(stub));
            created += 1;
        }

        if created > 0 {
            info!(
                stubs = created,
                expiry_secs = self.config.stub_expiry_secs,
                "Waiting for remembered devices"
            );
        }
        created
    }

    /// Delete stubs whose wait window has passed and forget their selection
    pub async fn expire_stubs(&self) -> Vec<DeviceId> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let expired: Vec<DeviceId> = state
            .stub_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            state.stub_deadlines.remove(id);
            state.devices.remove(id);
            self.selection.remove(id);
            warn!(device = %id, "Remembered device never appeared, dropping stub");
            let _ = self.event_tx.send(RegistryEvent::DeviceRemoved {
                id: id.clone(),
                reason: "stub expired".to_string(),
            });
        }

        expired
    }

    /// Expire stubs as their windows pass; returns once no stubs remain
    pub async fn run_stub_expiry(self: Arc<Self>) {
        loop {
            let next = self
                .state
                .read()
                .await
                .stub_deadlines
                .values()
                .min()
                .copied();

            let Some(deadline) = next else {
                debug!("No pending stubs");
                return;
            };

            tokio::time::sleep_until(deadline).await;
            self.expire_stubs().await;
        }
    }

    /// Set the user-facing selection flag and persist it; false if unknown
    pub async fn set_selected(&self, id: &DeviceId, selected: bool) -> bool {
        let mut state = self.state.write().await;
        let Some(device) = state.devices.get_mut(id) else {
            return false;
        };

        device.selected = selected;
        if selected {
            let name = device
                .remembered_name()
                .map(str::to_string)
                .or_else(|| (!device.is_stub()).then(|| device.name.clone()));
            self.selection.add(SelectedDevice::new(id.clone(), name));
        } else {
            self.selection.remove(id);
        }

        info!(device = %id, selected, "Selection changed");
        let _ = self.event_tx.send(RegistryEvent::DeviceUpdated(device.clone()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DataSource, DeviceType, PowerSupplyStatus, UNKNOWN};
    use crate::message::RemovePattern;
    use crate::selection::MemorySelectionStore;

    fn init(id: DeviceId, name: &str) -> InitMessage {
        InitMessage {
            device_id: id,
            device_name: name.to_string(),
            has_battery: true,
            device_type: DeviceType::Mouse,
        }
    }

    fn registry_with(entries: Vec<SelectedDevice>) -> (Arc<DeviceRegistry>, Arc<MemorySelectionStore>) {
        let store = Arc::new(MemorySelectionStore::new(entries));
        let registry = Arc::new(DeviceRegistry::new(RegistryConfig::default(), store.clone()));
        (registry, store)
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (registry, _) = registry_with(vec![]);
        registry.apply_init(init(DeviceId::ghub("dev001"), "G305")).await;
        registry.apply_init(init(DeviceId::ghub("dev001"), "G305 Lightspeed")).await;

        let devices = registry.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "G305 Lightspeed");
    }

    #[tokio::test]
    async fn test_same_raw_id_from_two_sources_are_distinct() {
        let (registry, _) = registry_with(vec![]);
        registry.apply_init(init(DeviceId::ghub("dev001"), "A")).await;
        registry.apply_init(init(DeviceId::native("dev001"), "A")).await;
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_update_never_creates_entries() {
        let (registry, _) = registry_with(vec![]);
        registry
            .apply_update(UpdateMessage::new(
                DeviceId::ghub("dev404"),
                80,
                PowerSupplyStatus::Discharging,
                UNKNOWN,
            ))
            .await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_wildcard_remove_only_touches_one_source() {
        let (registry, _) = registry_with(vec![]);
        registry.apply_init(init(DeviceId::ghub("dev001"), "A")).await;
        registry.apply_init(init(DeviceId::ghub("dev002"), "B")).await;
        registry.apply_init(init(DeviceId::native("ABC123"), "C")).await;

        let pattern: RemovePattern = "*GHub*".parse().unwrap();
        let removed = registry
            .apply_remove(RemoveMessage {
                pattern,
                reason: "rediscover".to_string(),
            })
            .await;

        assert_eq!(removed, 2);
        let devices = registry.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, DeviceId::native("ABC123"));
    }

    #[tokio::test]
    async fn test_exact_remove() {
        let (registry, _) = registry_with(vec![]);
        registry.apply_init(init(DeviceId::ghub("dev001"), "A")).await;
        registry.apply_init(init(DeviceId::ghub("dev002"), "B")).await;

        let removed = registry
            .apply_remove(RemoveMessage::device(DeviceId::ghub("dev001"), "disconnected"))
            .await;

        assert_eq!(removed, 1);
        assert!(registry.get(&DeviceId::ghub("dev001")).await.is_none());
        assert!(registry.get(&DeviceId::ghub("dev002")).await.is_some());
    }

    #[tokio::test]
    async fn test_offline_update_keeps_last_known_value() {
        let (registry, _) = registry_with(vec![]);
        let id = DeviceId::native("test003");
        registry.apply_init(init(id.clone(), "Test Headset")).await;
        registry
            .apply_update(UpdateMessage::new(id.clone(), 50, PowerSupplyStatus::Discharging, 3700))
            .await;
        registry
            .apply_update(UpdateMessage::new(id.clone(), UNKNOWN, PowerSupplyStatus::Unknown, 0))
            .await;

        let device = registry.get(&id).await.unwrap();
        assert_eq!(device.battery_percent, 50);
        assert!(!device.is_online);
    }

    #[tokio::test]
    async fn test_stub_replaced_by_churned_identifier() {
        let (registry, store) = registry_with(vec![SelectedDevice::new(
            DeviceId::ghub("devAAAA0001"),
            Some("G305".to_string()),
        )]);
        assert_eq!(registry.load_selection().await, 1);

        let mut events = registry.subscribe();
        registry.apply_init(init(DeviceId::ghub("devAAAA0002"), "G305")).await;

        let devices = registry.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, DeviceId::ghub("devAAAA0002"));
        assert!(devices[0].selected);
        assert!(!devices[0].is_stub());

        assert!(!store.contains(&DeviceId::ghub("devAAAA0001")));
        assert!(store.contains(&DeviceId::ghub("devAAAA0002")));

        match events.recv().await.unwrap() {
            RegistryEvent::StubReplaced { stub_id, device } => {
                assert_eq!(stub_id, DeviceId::ghub("devAAAA0001"));
                assert_eq!(device.id, DeviceId::ghub("devAAAA0002"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stub_not_replaced_on_name_mismatch() {
        let (registry, _) = registry_with(vec![SelectedDevice::new(
            DeviceId::ghub("dev00000001"),
            Some("G305".to_string()),
        )]);
        registry.load_selection().await;
        registry.apply_init(init(DeviceId::ghub("dev00000002"), "G502")).await;

        assert_eq!(registry.len().await, 2);
        assert!(registry.get(&DeviceId::ghub("dev00000001")).await.unwrap().is_stub());
    }

    #[tokio::test]
    async fn test_stub_not_replaced_across_sources() {
        let (registry, _) = registry_with(vec![SelectedDevice::new(
            DeviceId::ghub("dev00000001"),
            Some("G305".to_string()),
        )]);
        registry.load_selection().await;
        registry.apply_init(init(DeviceId::native("4a1b2c3d"), "G305")).await;

        assert_eq!(registry.len().await, 2);
        let native = registry.get(&DeviceId::native("4a1b2c3d")).await.unwrap();
        assert!(!native.selected);
    }

    #[tokio::test]
    async fn test_stub_not_replaced_by_wrong_shape_id() {
        let (registry, store) = registry_with(vec![SelectedDevice::new(
            DeviceId::ghub("dev00000001"),
            Some("G305".to_string()),
        )]);
        registry.load_selection().await;
        registry.apply_init(init(DeviceId::ghub("abc123"), "G305")).await;

        assert_eq!(registry.len().await, 2);
        assert!(registry.get(&DeviceId::ghub("dev00000001")).await.unwrap().is_stub());
        let incoming = registry.get(&DeviceId::ghub("abc123")).await.unwrap();
        assert!(!incoming.is_stub());
        assert!(!incoming.selected);
        assert!(store.contains(&DeviceId::ghub("dev00000001")));
    }

    #[tokio::test]
    async fn test_stub_confirmed_by_same_id() {
        let (registry, _) = registry_with(vec![SelectedDevice::new(
            DeviceId::native("ABC123"),
            None,
        )]);
        registry.load_selection().await;
        registry.apply_init(init(DeviceId::native("ABC123"), "MX Keys")).await;

        let device = registry.get(&DeviceId::native("ABC123")).await.unwrap();
        assert!(!device.is_stub());
        assert!(device.selected);
        assert!(registry.expire_stubs().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_leaves_stubs_alone() {
        let (registry, _) = registry_with(vec![SelectedDevice::new(
            DeviceId::ghub("dev00000001"),
            Some("G305".to_string()),
        )]);
        registry.load_selection().await;

        let removed = registry
            .apply_remove(RemoveMessage::source(DataSource::GHub, "rediscover"))
            .await;
        assert_eq!(removed, 0);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_load_selection_deduplicates() {
        let (registry, store) = registry_with(vec![
            SelectedDevice::new(DeviceId::ghub("dev001"), None),
            SelectedDevice::new(DeviceId::ghub("dev001"), None),
            SelectedDevice::new(DeviceId::native("ABC123"), None),
        ]);

        assert_eq!(registry.load_selection().await, 2);
        assert_eq!(store.selected().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stub_expires_after_window() {
        let (registry, store) = registry_with(vec![SelectedDevice::new(
            DeviceId::native("OLD_ID_123"),
            Some("Old Mouse".to_string()),
        )]);
        registry.load_selection().await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(registry.expire_stubs().await.is_empty());
        assert_eq!(registry.len().await, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = registry.expire_stubs().await;
        assert_eq!(expired, vec![DeviceId::native("OLD_ID_123")]);
        assert!(registry.is_empty().await);
        assert!(!store.contains(&DeviceId::native("OLD_ID_123")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stub_expiry_drains_stubs() {
        let (registry, store) = registry_with(vec![SelectedDevice::new(
            DeviceId::ghub("dev00000009"),
            None,
        )]);
        registry.load_selection().await;

        registry.clone().run_stub_expiry().await;

        assert!(registry.is_empty().await);
        assert!(store.selected().is_empty());
    }

    #[tokio::test]
    async fn test_set_selected_persists() {
        let (registry, store) = registry_with(vec![]);
        let id = DeviceId::ghub("dev001");
        registry.apply_init(init(id.clone(), "G305")).await;

        assert!(registry.set_selected(&id, true).await);
        assert_eq!(
            store.selected(),
            vec![SelectedDevice::new(id.clone(), Some("G305".to_string()))]
        );

        assert!(registry.set_selected(&id, false).await);
        assert!(store.selected().is_empty());
        assert!(!registry.set_selected(&DeviceId::ghub("missing"), true).await);
    }

    #[tokio::test]
    async fn test_run_applies_channel_messages() {
        let (registry, _) = registry_with(vec![]);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(registry.clone().run(rx));

        tx.send(init(DeviceId::ghub("dev001"), "G305").into()).await.unwrap();
        tx.send(RemoveMessage::device(DeviceId::ghub("dev001"), "disconnected").into())
            .await
            .unwrap();
        tx.send(init(DeviceId::ghub("dev002"), "G305").into()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let devices = registry.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, DeviceId::ghub("dev002"));
    }
}
