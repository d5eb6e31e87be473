//! G HUB session reconciler
//!
//! A pure state machine: every input (connection, decoded event, rescan)
//! produces a list of [`Action`]s for the session to carry out. Device
//! identifiers handed out by G HUB may change across a reconnect, so nothing
//! here caches an identifier beyond the current connection.

use std::collections::HashMap;

use hidbatt_core::{
    DataSource, DeviceId, DeviceMessage, DeviceType, InitMessage, PowerSupplyStatus,
    RemoveMessage, UpdateMessage, UNKNOWN,
};
use tracing::{debug, info};

use crate::message::{
    BatteryState, DeviceList, DeviceStateChange, Envelope, GHubEvent, PATH_BATTERY_STATE_CHANGED,
    PATH_DEVICE_LIST, PATH_DEVICE_STATE_CHANGED,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Forward a message to the registry
    Emit(DeviceMessage),
    /// Write a request to the socket
    Send(Envelope),
}

#[derive(Debug, Default)]
pub struct Reconciler {
    /// Devices listed during this connection, id -> display name
    listed: HashMap<String, String>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh connection: rediscover, then subscribe to pushes
    pub fn on_connected(&mut self) -> Vec<Action> {
        let mut actions = self.rediscover();
        actions.push(Action::Send(Envelope::subscribe(PATH_DEVICE_STATE_CHANGED)));
        actions.push(Action::Send(Envelope::subscribe(PATH_BATTERY_STATE_CHANGED)));
        actions
    }

    /// Drop every G HUB device and ask for the list again
    pub fn rediscover(&mut self) -> Vec<Action> {
        self.listed.clear();
        vec![
            Action::Emit(RemoveMessage::source(DataSource::GHub, "rediscover").into()),
            Action::Send(Envelope::get(PATH_DEVICE_LIST)),
        ]
    }

    /// The connection dropped; its identifiers are no longer trustworthy
    pub fn on_disconnected(&mut self) -> Vec<Action> {
        self.listed.clear();
        vec![Action::Emit(
            RemoveMessage::source(DataSource::GHub, "session closed").into(),
        )]
    }

    pub fn handle(&mut self, event: GHubEvent) -> Vec<Action> {
        match event {
            GHubEvent::DeviceList(list) => self.on_device_list(list),
            GHubEvent::DeviceStateChanged(change) => self.on_state_changed(change),
            GHubEvent::BatteryState(state) => vec![Action::Emit(battery_update(state).into())],
        }
    }

    fn on_device_list(&mut self, list: DeviceList) -> Vec<Action> {
        let mut actions = Vec::new();
        for info in list.device_infos {
            if info.id.is_empty() {
                continue;
            }
            let name = info.name().to_string();

            if !self.listed.contains_key(&info.id) {
                if let Some((previous, _)) = self
                    .listed
                    .iter()
                    .find(|(id, listed_name)| **listed_name == name && **id != info.id)
                {
                    info!(
                        name = %name,
                        previous = %previous,
                        current = %info.id,
                        "G HUB device identifier changed"
                    );
                }
            }
            self.listed.insert(info.id.clone(), name.clone());

            let has_battery = info.capabilities.has_battery_status;
            actions.push(Action::Emit(
                InitMessage {
                    device_id: DeviceId::ghub(info.id.clone()),
                    device_name: name,
                    has_battery,
                    device_type: DeviceType::from_name(&info.device_type),
                }
                .into(),
            ));
            if has_battery {
                actions.push(Action::Send(Envelope::battery_state(&info.id)));
            }
        }
        actions
    }

    fn on_state_changed(&mut self, change: DeviceStateChange) -> Vec<Action> {
        match change.state.to_ascii_lowercase().as_str() {
            "disconnected" => {
                self.listed.remove(&change.id);
                vec![Action::Emit(
                    RemoveMessage::device(DeviceId::ghub(change.id), "disconnected").into(),
                )]
            }
            // Never trust a cached identity; the list answer re-announces it
            "connected" => vec![Action::Send(Envelope::get(PATH_DEVICE_LIST))],
            other => {
                debug!(device = %change.id, state = other, "Ignoring device state");
                Vec::new()
            }
        }
    }
}

fn battery_update(state: BatteryState) -> UpdateMessage {
    let id = DeviceId::ghub(state.device_id);
    let Some(percentage) = state.percentage else {
        return UpdateMessage::new(id, UNKNOWN, PowerSupplyStatus::Unknown, UNKNOWN).wired();
    };

    let status = if state.charging {
        PowerSupplyStatus::Charging
    } else {
        PowerSupplyStatus::Discharging
    };
    // G HUB reports a negative level when it has no reading
    let percent = if percentage.is_nan() || percentage < 0.0 {
        UNKNOWN
    } else {
        percentage.round().min(100.0) as i32
    };
    let update = UpdateMessage::new(id, percent, status, UNKNOWN);
    match state.mileage {
        Some(mileage) if mileage >= 0.0 => update.with_mileage(mileage),
        _ => update,
    }
}
