//! Persisted device selection
//!
//! The on-disk settings format lives outside this crate; the registry only
//! talks to a [`SelectionStore`].

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::device::DeviceId;

/// A remembered selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedDevice {
    pub id: DeviceId,
    /// Display name at the time of selection, used for stub reconciliation
    #[serde(default)]
    pub name: Option<String>,
}

impl SelectedDevice {
    pub fn new(id: DeviceId, name: Option<String>) -> Self {
        Self { id, name }
    }
}

/// Storage for the user's selected devices
pub trait SelectionStore: Send + Sync {
    /// All remembered selections, in insertion order
    fn selected(&self) -> Vec<SelectedDevice>;

    /// Remember a selection; an existing entry for the same id is replaced
    fn add(&self, entry: SelectedDevice);

    fn remove(&self, id: &DeviceId);

    fn contains(&self, id: &DeviceId) -> bool {
        self.selected().iter().any(|e| &e.id == id)
    }

    /// Replace the whole selection list
    fn replace_all(&self, entries: Vec<SelectedDevice>);
}

/// In-memory selection store
#[derive(Debug, Default)]
pub struct MemorySelectionStore {
    entries: Mutex<Vec<SelectedDevice>>,
}

impl MemorySelectionStore {
    pub fn new(entries: Vec<SelectedDevice>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut Vec<SelectedDevice>) -> R) -> R {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut entries)
    }
}

impl SelectionStore for MemorySelectionStore {
    fn selected(&self) -> Vec<SelectedDevice> {
        self.with_entries(|entries| entries.clone())
    }

    fn add(&self, entry: SelectedDevice) {
        self.with_entries(|entries| {
            match entries.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        })
    }

    fn remove(&self, id: &DeviceId) {
        self.with_entries(|entries| entries.retain(|e| &e.id != id))
    }

    fn replace_all(&self, new_entries: Vec<SelectedDevice>) {
        self.with_entries(|entries| *entries = new_entries)
    }
}
