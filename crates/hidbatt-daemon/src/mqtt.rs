//! Optional MQTT sink publishing each device's battery state
//!
//! Every live device gets one retained topic,
//! `{topic_prefix}/{source}/{raw id}/state`, holding a JSON [`BatteryPayload`].
//! Removing a device publishes an empty retained message so brokers drop the
//! last state. Stubs are never published.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use hidbatt_core::{
    Device, DeviceId, DeviceRegistry, DeviceType, PowerSupplyStatus, RegistryEvent,
};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Outgoing requests buffered between the publisher and the event loop
const REQUEST_CAPACITY: usize = 64;

/// `[mqtt]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_retain")]
    pub retain: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            retain: default_retain(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hidbatt".to_string()
}

fn default_topic_prefix() -> String {
    "hidbatt".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_retain() -> bool {
    true
}

impl MqttConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.client_id.trim().is_empty() {
            bail!("client_id must not be empty");
        }
        if self.topic_prefix.contains(['+', '#']) {
            bail!("topic_prefix must not contain MQTT wildcards");
        }
        if self.keep_alive_secs < 5 {
            bail!("keep_alive_secs must be at least 5");
        }
        if self.password.is_some() && self.username.is_none() {
            bail!("password requires a username");
        }
        Ok(())
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

/// State published for one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryPayload {
    /// 0-100, or -1 when no reading exists
    pub percentage: i32,
    /// Volts, absent when the battery does not report voltage
    pub voltage: Option<f64>,
    pub charging: bool,
    /// Reachable with a usable reading or a wired link
    pub online: bool,
    pub wired: bool,
    /// Remaining runtime in hours
    pub mileage: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    pub data_source: &'static str,
    pub device_name: String,
    pub device_type: DeviceType,
}

impl BatteryPayload {
    pub fn from_device(device: &Device) -> Self {
        let charging = device.is_wired
            || matches!(
                device.power_status,
                PowerSupplyStatus::Charging | PowerSupplyStatus::Full
            );
        Self {
            percentage: device.battery_percent,
            voltage: (device.voltage_millivolts > 0)
                .then(|| f64::from(device.voltage_millivolts) / 1000.0),
            charging,
            online: device.is_online && (device.has_reading() || device.is_wired),
            wired: device.is_wired,
            mileage: device.mileage_hours,
            last_update: device.last_update,
            data_source: device.id.source.as_str(),
            device_name: device.name.clone(),
            device_type: device.device_type,
        }
    }
}

/// One retained message; `None` clears the topic
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Option<BatteryPayload>,
}

/// State topic of a device. Topic separators and wildcards in the raw id
/// are replaced so each device maps to exactly one level.
pub fn state_topic(prefix: &str, id: &DeviceId) -> String {
    let raw: String = id
        .raw
        .chars()
        .map(|c| if matches!(c, '/' | '+' | '#') { '_' } else { c })
        .collect();
    format!(
        "{}/{}/{}/state",
        prefix.trim_end_matches('/'),
        id.source.as_str().to_lowercase(),
        raw
    )
}

fn publish_device(prefix: &str, device: &Device) -> Option<Publication> {
    (!device.is_stub()).then(|| Publication {
        topic: state_topic(prefix, &device.id),
        payload: Some(BatteryPayload::from_device(device)),
    })
}

/// Messages to publish for a registry change
pub fn publications(prefix: &str, event: &RegistryEvent) -> Vec<Publication> {
    match event {
        RegistryEvent::DeviceAdded(device) | RegistryEvent::DeviceUpdated(device) => {
            publish_device(prefix, device).into_iter().collect()
        }
        RegistryEvent::StubReplaced { device, .. } => {
            publish_device(prefix, device).into_iter().collect()
        }
        RegistryEvent::DeviceRemoved { id, .. } => vec![Publication {
            topic: state_topic(prefix, id),
            payload: None,
        }],
    }
}

/// Publishes registry state to an MQTT broker
pub struct MqttSink {
    config: MqttConfig,
    client: AsyncClient,
}

impl MqttSink {
    /// Create the client and start its connection loop
    pub fn start(config: MqttConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(config.options(), REQUEST_CAPACITY);
        tokio::spawn(drive_connection(
            eventloop,
            Duration::from_secs(config.reconnect_delay_secs),
        ));
        info!(
            host = %config.host,
            port = config.port,
            prefix = %config.topic_prefix,
            "MQTT sink enabled"
        );
        Self { config, client }
    }

    /// Publish the current snapshot, then every registry change
    pub async fn run(self, registry: Arc<DeviceRegistry>) {
        let mut events = registry.subscribe();

        for device in registry.devices().await {
            if let Some(publication) = publish_device(&self.config.topic_prefix, &device) {
                self.publish(publication).await;
            }
        }

        loop {
            match events.recv().await {
                Ok(event) => {
                    for publication in publications(&self.config.topic_prefix, &event) {
                        self.publish(publication).await;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    // Missed changes are superseded by a fresh snapshot
                    warn!(skipped = n, "MQTT sink lagged, republishing snapshot");
                    for device in registry.devices().await {
                        if let Some(publication) =
                            publish_device(&self.config.topic_prefix, &device)
                        {
                            self.publish(publication).await;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }

        debug!("MQTT sink stopped");
    }

    async fn publish(&self, publication: Publication) {
        let payload = match &publication.payload {
            Some(payload) => match serde_json::to_vec(payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(topic = %publication.topic, error = %e, "Failed to encode MQTT payload");
                    return;
                }
            },
            None => Vec::new(),
        };

        if let Err(e) = self
            .client
            .publish(
                publication.topic.as_str(),
                QoS::AtLeastOnce,
                self.config.retain,
                payload,
            )
            .await
        {
            warn!(topic = %publication.topic, error = %e, "MQTT publish failed");
        }
    }
}

/// Poll the event loop forever; rumqttc reconnects on the next poll
async fn drive_connection(mut eventloop: EventLoop, reconnect_delay: Duration) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Connected to MQTT broker"),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hidbatt_core::{DataSource, InitMessage, UpdateMessage, UNKNOWN};
    use serde_json::{json, Value};

    fn device(id: DeviceId, name: &str) -> Device {
        Device::from_init(&InitMessage {
            device_id: id,
            device_name: name.to_string(),
            has_battery: true,
            device_type: DeviceType::Mouse,
        })
    }

    fn payload_json(device: &Device) -> Value {
        serde_json::to_value(BatteryPayload::from_device(device)).unwrap()
    }

    #[test]
    fn test_uninitialised_device_payload() {
        let json = payload_json(&device(DeviceId::native("4a1b2c3d"), "MX Master 3"));
        assert_eq!(json["percentage"], -1);
        assert_eq!(json["online"], false);
        assert_eq!(json["voltage"], Value::Null);
        assert_eq!(json["charging"], false);
        assert_eq!(json["last_update"], Value::Null);
        assert_eq!(json["data_source"], "Native");
        assert_eq!(json["device_name"], "MX Master 3");
        assert_eq!(json["device_type"], "mouse");
    }

    #[test]
    fn test_valid_reading_payload() {
        let mut mouse = device(DeviceId::native("4a1b2c3d"), "MX Master 3");
        let mut update =
            UpdateMessage::new(mouse.id.clone(), 75, PowerSupplyStatus::Charging, 3950);
        update.update_time = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        mouse.apply_update(&update);

        assert_eq!(
            payload_json(&mouse),
            json!({
                "percentage": 75,
                "voltage": 3.95,
                "charging": true,
                "online": true,
                "wired": false,
                "mileage": null,
                "last_update": "2026-03-01T12:30:00Z",
                "data_source": "Native",
                "device_name": "MX Master 3",
                "device_type": "mouse",
            })
        );
    }

    #[test]
    fn test_offline_keeps_last_value() {
        let mut mouse = device(DeviceId::native("4a1b2c3d"), "MX Master 3");
        mouse.apply_update(&UpdateMessage::new(
            mouse.id.clone(),
            50,
            PowerSupplyStatus::Discharging,
            UNKNOWN,
        ));
        mouse.apply_update(&UpdateMessage::new(
            mouse.id.clone(),
            UNKNOWN,
            PowerSupplyStatus::Unknown,
            UNKNOWN,
        ));

        let json = payload_json(&mouse);
        assert_eq!(json["percentage"], 50);
        assert_eq!(json["online"], false);
        assert_eq!(json["charging"], false);
    }

    #[test]
    fn test_wired_device_is_charging() {
        let mut headset = device(DeviceId::ghub("dev00000003"), "G733");
        headset.apply_update(
            &UpdateMessage::new(
                headset.id.clone(),
                UNKNOWN,
                PowerSupplyStatus::Unknown,
                UNKNOWN,
            )
            .wired(),
        );

        let json = payload_json(&headset);
        assert_eq!(json["percentage"], -1);
        assert_eq!(json["online"], true);
        assert_eq!(json["charging"], true);
        assert_eq!(json["wired"], true);
        assert_eq!(json["data_source"], "GHub");
    }

    #[test]
    fn test_ghub_mileage() {
        let mut mouse = device(DeviceId::ghub("dev00000001"), "G502 X");
        mouse.apply_update(
            &UpdateMessage::new(
                mouse.id.clone(),
                58,
                PowerSupplyStatus::Discharging,
                UNKNOWN,
            )
            .with_mileage(20.5),
        );

        let json = payload_json(&mouse);
        assert_eq!(json["mileage"], 20.5);
        assert_eq!(json["voltage"], Value::Null);
    }

    #[test]
    fn test_state_topic() {
        assert_eq!(
            state_topic("hidbatt", &DeviceId::native("4a1b2c3d")),
            "hidbatt/native/4a1b2c3d/state"
        );
        assert_eq!(
            state_topic("home/batteries/", &DeviceId::new(DataSource::GHub, "dev/0+1#")),
            "home/batteries/ghub/dev_0_1_/state"
        );
    }

    #[test]
    fn test_event_publications() {
        let mouse = device(DeviceId::native("4a1b2c3d"), "MX Master 3");
        let added = publications("hidbatt", &RegistryEvent::DeviceAdded(mouse.clone()));
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].topic, "hidbatt/native/4a1b2c3d/state");
        assert!(added[0].payload.is_some());

        let removed = publications(
            "hidbatt",
            &RegistryEvent::DeviceRemoved {
                id: mouse.id.clone(),
                reason: "transport closed".to_string(),
            },
        );
        assert_eq!(
            removed,
            vec![Publication {
                topic: "hidbatt/native/4a1b2c3d/state".to_string(),
                payload: None,
            }]
        );

        let replaced = publications(
            "hidbatt",
            &RegistryEvent::StubReplaced {
                stub_id: DeviceId::ghub("dev00000001"),
                device: device(DeviceId::ghub("dev00000002"), "G305"),
            },
        );
        assert_eq!(replaced[0].topic, "hidbatt/ghub/dev00000002/state");
    }

    #[test]
    fn test_stubs_are_not_published() {
        let mut stub = device(DeviceId::ghub("dev00000001"), "G305");
        stub.stub = Some(hidbatt_core::StubInfo {
            remembered_name: Some("G305".to_string()),
            created_at: Utc::now(),
        });
        assert!(stub.is_stub());
        assert!(publications("hidbatt", &RegistryEvent::DeviceAdded(stub)).is_empty());
    }

    #[test]
    fn test_config_validation() {
        let config = MqttConfig::default();
        assert!(!config.enabled);
        config.validate().unwrap();

        let short_keep_alive = MqttConfig {
            keep_alive_secs: 2,
            ..MqttConfig::default()
        };
        assert!(short_keep_alive.validate().is_err());

        let wildcard = MqttConfig {
            topic_prefix: "hidbatt/#".to_string(),
            ..MqttConfig::default()
        };
        assert!(wildcard.validate().is_err());

        let orphan_password = MqttConfig {
            password: Some("secret".to_string()),
            ..MqttConfig::default()
        };
        assert!(orphan_password.validate().is_err());
    }
}
