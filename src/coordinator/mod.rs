use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;

use crate::config::GatewayConfig;
use crate::gateways::{Gateway, SmgwError};
use crate::models::{Information, ObisCode, Vendor};
use crate::mqtt::ha_interface::{component_key, HaComponent, HaDiscover};
use crate::mqtt::{availability_topic, command_topic, MeteringData, PublishData, SubscribeData, Transmission, LAST_UPDATE_KEY, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::obis_utils::{get_known_sensor_descriptions, sensor_description};

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("Unknown gateway {0}")]
    UnknownGateway(String),
    #[error("Gateway {0} does not take commands anymore")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GatewayCommand {
    Reboot,
}

impl GatewayCommand {
    /// Parses the payload of the command topic
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "restart" | "reboot" => Some(GatewayCommand::Reboot),
            _ => None,
        }
    }
}

/// Latest known state of one gateway
#[derive(Debug, Clone, Serialize)]
pub struct GatewayState {
    pub name: String,
    pub vendor: Vendor,
    pub available: bool,
    pub last_error: Option<String>,
    /// Snapshot of the last successful poll, kept while the gateway is unavailable
    pub information: Option<Information>,
}

/// Shared view on all gateways, used by the API and the managers
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    states: Arc<RwLock<BTreeMap<String, GatewayState>>>,
    commands: Arc<RwLock<HashMap<String, Sender<GatewayCommand>>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str, vendor: Vendor, commands: Sender<GatewayCommand>) {
        self.states.write().await.insert(name.to_string(), GatewayState {
            name: name.to_string(),
            vendor,
            available: false,
            last_error: None,
            information: None,
        });
        self.commands.write().await.insert(name.to_string(), commands);
    }

    pub async fn list(&self) -> Vec<GatewayState> {
        self.states.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<GatewayState> {
        self.states.read().await.get(name).cloned()
    }

    pub async fn update_success(&self, name: &str, information: Information) {
        if let Some(state) = self.states.write().await.get_mut(name) {
            state.available = true;
            state.last_error = None;
            state.information = Some(information);
        }
    }

    pub async fn update_failure(&self, name: &str, error: String) {
        if let Some(state) = self.states.write().await.get_mut(name) {
            state.available = false;
            state.last_error = Some(error);
        }
    }

    pub async fn send_command(&self, name: &str, command: GatewayCommand) -> Result<(), CommandError> {
        let sender = self.commands.read().await
            .get(name)
            .cloned()
            .ok_or_else(|| CommandError::UnknownGateway(name.to_string()))?;

        sender.send(command).await.map_err(|_| CommandError::Closed(name.to_string()))
    }
}

/// Discovery with every known sensor, every seen OBIS code, the poll time and a restart button
pub fn build_discovery(gateway: &str, information: &Information, codes: &BTreeSet<ObisCode>) -> HaDiscover {
    let mut disc = HaDiscover::new(
        gateway.to_string(),
        information.manufacturer.clone(),
        information.model.clone(),
        information.firmware_version.clone(),
    );

    for desc in get_known_sensor_descriptions() {
        disc.add_component(component_key(&desc.key), HaComponent::new_sensor(gateway, &desc));
    }

    for code in codes.iter() {
        let key = component_key(code);
        if !disc.cmps.contains_key(&key) {
            disc.add_component(key, HaComponent::new_sensor(gateway, &sensor_description(code)));
        }
    }

    disc.add_component(
        LAST_UPDATE_KEY.to_string(),
        HaComponent::new_timestamp(gateway, "Last update".to_string(), LAST_UPDATE_KEY.to_string()),
    );
    disc.add_component("restart".to_string(), HaComponent::new_restart(gateway, command_topic(gateway)));

    disc
}

/// Polls one gateway and publishes its readings
pub struct GatewayManager {
    gateway: Gateway,
    interval: Duration,
    ha_enabled: bool,
    sender: Sender<Transmission>,
    registry: GatewayRegistry,
    commands: Receiver<GatewayCommand>,
    discovered: BTreeSet<ObisCode>,
    discovery_sent: bool,
}

impl GatewayManager {
    pub async fn new(config: &GatewayConfig, ha_enabled: bool, sender: Sender<Transmission>, registry: GatewayRegistry) -> Result<Self, SmgwError> {
        let gateway = Gateway::new(config)?;
        let (ctx, crx) = tokio::sync::mpsc::channel(10);
        registry.register(&config.name, config.vendor, ctx).await;

        info!("[{}] Polling {} gateway every {} minutes", config.name, config.vendor.to_string(), config.scan_interval);
        Ok(GatewayManager {
            gateway,
            interval: config.scan_interval(),
            ha_enabled,
            sender,
            registry,
            commands: crx,
            discovered: BTreeSet::new(),
            discovery_sent: false,
        })
    }

    pub async fn start_thread(&mut self) {
        let name = self.gateway.name().to_string();

        let (mqtt_tx, mut mqtt_rx) = tokio::sync::mpsc::channel(10);
        let register = Transmission::Subscribe(SubscribeData {
            topic: command_topic(&name),
            sender: mqtt_tx,
        });
        if self.sender.send(register).await.is_err() {
            error!("[{name}] MQTT is gone, not listening for commands");
        }

        /* The first tick fires immediately */
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.poll().await,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(payload) = mqtt_rx.recv() => {
                    match GatewayCommand::from_str(&payload) {
                        Some(command) => self.handle_command(command).await,
                        None => warn!("[{name}] Ignoring unknown command {payload:?}"),
                    }
                },
            }
        }
    }

    async fn send(&self, transmission: Transmission) {
        if self.sender.send(transmission).await.is_err() {
            error!("[{}] Unable to hand data to MQTT", self.gateway.name());
        }
    }

    async fn publish_availability(&self, online: bool) {
        self.send(Transmission::Publish(PublishData {
            topic: availability_topic(self.gateway.name()),
            payload: if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE }.to_string(),
            qos: 1,
            retain: true,
        })).await;
    }

    pub async fn poll(&mut self) {
        let name = self.gateway.name().to_string();

        match self.gateway.get_data().await {
            Ok(information) => {
                info!("[{name}] Got {} readings", information.readings.len());

                /* Discovery has to be there before the first state arrives */
                let new_codes: Vec<ObisCode> = information.obis_codes()
                    .into_iter()
                    .filter(|c| !self.discovered.contains(c))
                    .collect();
                if self.ha_enabled && (!self.discovery_sent || !new_codes.is_empty()) {
                    self.discovered.extend(new_codes);
                    let disc = build_discovery(&name, &information, &self.discovered);
                    self.send(Transmission::AutoDiscovery(disc)).await;
                    self.discovery_sent = true;
                }

                let data = MeteringData::from_information(&name, self.gateway.vendor(), &information);
                self.send(Transmission::Metering(data)).await;
                self.publish_availability(true).await;
                self.registry.update_success(&name, information).await;
            },
            Err(e) => {
                error!("[{name}] Polling failed: {e}");
                self.publish_availability(false).await;
                self.registry.update_failure(&name, e.to_string()).await;
            }
        }
    }

    pub async fn handle_command(&mut self, command: GatewayCommand) {
        let name = self.gateway.name().to_string();
        debug!("[{name}] Handling command {command:?}");

        match command {
            GatewayCommand::Reboot => match self.gateway.reboot().await {
                Ok(_) => info!("[{name}] Reboot triggered"),
                Err(e) => error!("[{name}] Reboot failed: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fake_information;
    use mockito::Server;

    const EXTENDED: &str = r#"{"values": [
        {"logical_name": "0100010800FF", "value": 7249204, "scaler": -1, "unit": 30},
        {"logical_name": "0100100700FF", "value": 412, "scaler": 0, "unit": 27}
    ]}"#;

    async fn manager(url: &str, ha_enabled: bool) -> (GatewayManager, Receiver<Transmission>, GatewayRegistry) {
        let (tx, rx) = tokio::sync::mpsc::channel(10);
        let registry = GatewayRegistry::new();
        let config = GatewayConfig::new("casa", Vendor::EMH, url, "user", "pass");
        let m = GatewayManager::new(&config, ha_enabled, tx, registry.clone()).await.unwrap();
        (m, rx, registry)
    }

    fn assert_availability(t: Transmission, expected: &str) {
        match t {
            Transmission::Publish(p) => {
                assert_eq!(p.topic, "smgw2mqtt/gateways/casa/availability");
                assert_eq!(p.payload, expected);
                assert!(p.retain);
            },
            _ => panic!("expected availability"),
        }
    }

    #[test]
    fn test_command_from_str() {
        assert_eq!(GatewayCommand::from_str("restart"), Some(GatewayCommand::Reboot));
        assert_eq!(GatewayCommand::from_str(" Reboot\n"), Some(GatewayCommand::Reboot));
        assert_eq!(GatewayCommand::from_str("explode"), None);
    }

    #[test]
    fn test_build_discovery() {
        let info = fake_information();
        let codes: BTreeSet<ObisCode> = ["1-0:1.8.0".to_string(), "1-0:16.7.0".to_string()].into_iter().collect();
        let disc = build_discovery("home", &info, &codes);

        /* four known sensors, one extra code, last update and restart */
        assert_eq!(disc.cmps.len(), 7);
        assert!(disc.cmps.contains_key("1_0_16_7_0"));
        assert_eq!(disc.cmps["last_update"]["device_class"], "timestamp");
        assert_eq!(disc.cmps["restart"]["command_topic"], "smgw2mqtt/gateways/home/command");
        assert_eq!(disc.discover_topic, "homeassistant/device/smgw2mqtt_home/config");
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = GatewayRegistry::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        registry.register("home", Vendor::PPC, tx).await;

        registry.update_success("home", fake_information()).await;
        registry.update_failure("home", "timeout".to_string()).await;

        let state = registry.get("home").await.unwrap();
        assert!(!state.available);
        assert_eq!(state.last_error.as_deref(), Some("timeout"));
        assert_eq!(state.information, Some(fake_information()));
        assert_eq!(registry.list().await.len(), 1);

        registry.send_command("home", GatewayCommand::Reboot).await.unwrap();
        assert_eq!(rx.recv().await, Some(GatewayCommand::Reboot));
        assert_eq!(
            registry.send_command("garage", GatewayCommand::Reboot).await,
            Err(CommandError::UnknownGateway("garage".to_string()))
        );
    }

    #[tokio::test]
    async fn test_poll_success() {
        let mut server = Server::new_async().await;
        let _derived = server.mock("GET", "/json/metering/derived").with_body(r#"["c1"]"#).create_async().await;
        let _c1 = server.mock("GET", "/json/metering/derived/c1").with_body(r#"{"sensor_domains": ["m1"]}"#).create_async().await;
        let _values = server.mock("GET", "/json/metering/origin/m1/extended").with_body(EXTENDED).create_async().await;

        let (mut m, mut rx, registry) = manager(&server.url(), true).await;
        m.poll().await;

        match rx.recv().await.unwrap() {
            Transmission::AutoDiscovery(d) => assert!(d.cmps.contains_key("1_0_16_7_0")),
            _ => panic!("expected discovery"),
        }
        match rx.recv().await.unwrap() {
            Transmission::Metering(data) => {
                assert_eq!(data.gateway, "casa");
                assert_eq!(data.metered_values["1-0:1.8.0"], serde_json::json!(724.9204));
            },
            _ => panic!("expected metering"),
        }
        assert_availability(rx.recv().await.unwrap(), "online");

        let state = registry.get("casa").await.unwrap();
        assert!(state.available);
        assert_eq!(state.information.unwrap().readings.len(), 2);

        /* Same codes again, no new discovery */
        m.poll().await;
        assert!(matches!(rx.recv().await.unwrap(), Transmission::Metering(_)));
    }

    #[tokio::test]
    async fn test_poll_failure() {
        let mut server = Server::new_async().await;
        let _derived = server.mock("GET", "/json/metering/derived").with_status(500).create_async().await;

        let (mut m, mut rx, registry) = manager(&server.url(), true).await;
        m.poll().await;

        assert_availability(rx.recv().await.unwrap(), "offline");
        let state = registry.get("casa").await.unwrap();
        assert!(!state.available);
        assert!(state.last_error.unwrap().contains("500"));
        assert!(state.information.is_none());
    }

    #[tokio::test]
    async fn test_poll_without_discovery() {
        let mut server = Server::new_async().await;
        let _derived = server.mock("GET", "/json/metering/derived").with_body(r#"["c1"]"#).create_async().await;
        let _c1 = server.mock("GET", "/json/metering/derived/c1").with_body(r#"{"sensor_domains": ["m1"]}"#).create_async().await;
        let _values = server.mock("GET", "/json/metering/origin/m1/extended").with_body(EXTENDED).create_async().await;

        let (mut m, mut rx, _registry) = manager(&server.url(), false).await;
        m.poll().await;

        assert!(matches!(rx.recv().await.unwrap(), Transmission::Metering(_)));
    }
}
