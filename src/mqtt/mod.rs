pub mod ha_interface;

use std::collections::HashMap;
use lazy_static::lazy_static;
use tokio::sync::RwLock;
use crate::config::MqttConfig;
use crate::models::{Information, Vendor};
use crate::mqtt::ha_interface::HaDiscover;
use crate::obis_utils::{round_value, sensor_description};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{error::TrySendError, Receiver, Sender};
use serde::{Serialize, Deserialize};
use serde_json;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::{Duration, Instant};

pub const BASE_TOPIC: &str = "smgw2mqtt";
pub const RAW_TOPIC: &str = "smgw2mqtt/raw";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
/// Key of the poll time inside the state JSON
pub const LAST_UPDATE_KEY: &str = "last_update";

pub fn state_topic(gateway: &str) -> String {
    format!("{BASE_TOPIC}/gateways/{gateway}/state")
}

pub fn availability_topic(gateway: &str) -> String {
    format!("{BASE_TOPIC}/gateways/{gateway}/availability")
}

pub fn command_topic(gateway: &str) -> String {
    format!("{BASE_TOPIC}/gateways/{gateway}/command")
}

pub fn discovery_topic(gateway: &str) -> String {
    format!("homeassistant/device/smgw2mqtt_{gateway}/config")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MqttConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Error(String),
}

#[derive(Clone)]
pub struct MqttHealthStatus {
    pub status: MqttConnectionStatus,
    pub last_connected: Option<Instant>,
    pub last_message_sent: Option<Instant>,
    pub last_message_received: Option<Instant>,
    pub connection_attempts: u64,
}

#[derive(Clone)]
pub struct AppStatus {
    pub start_time: Instant,
    pub mqtt_health: MqttHealthStatus,
}

impl MqttHealthStatus {
    pub fn new() -> Self {
        Self {
            status: MqttConnectionStatus::Disconnected,
            last_connected: None,
            last_message_sent: None,
            last_message_received: None,
            connection_attempts: 0,
        }
    }
}

impl AppStatus {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_health: MqttHealthStatus::new(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringData {
    pub gateway: String,
    pub vendor: Vendor,
    pub transmission_time: u64,
    pub metered_time: u64,
    pub metered_values: serde_json::Map<String, serde_json::Value>
}

impl MeteringData {
    /// Values are keyed by OBIS code and rounded to the precision of their sensor
    pub fn from_information(gateway: &str, vendor: Vendor, information: &Information) -> Self {
        let mut metered_values = serde_json::Map::new();
        for (obis, reading) in information.readings.iter() {
            let precision = sensor_description(obis).display_precision;
            metered_values.insert(obis.clone(), round_value(&reading.value, precision));
        }
        metered_values.insert(LAST_UPDATE_KEY.to_string(), serde_json::Value::from(information.last_update.to_rfc3339()));

        return MeteringData {
            gateway: gateway.to_string(),
            vendor: vendor,
            transmission_time: chrono::Utc::now().timestamp() as u64,
            metered_time: information.last_update.timestamp() as u64,
            metered_values: metered_values,
        };
    }
}

pub struct PublishData {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

pub struct SubscribeData {
    pub topic: String,
    pub sender: tokio::sync::mpsc::Sender<String>
}

pub enum Transmission {
    Metering(MeteringData),
    AutoDiscovery(HaDiscover),
    Subscribe(SubscribeData),
    Publish(PublishData)
}

pub struct MqttManager {
    rx: Receiver<Transmission>,
    exit_thread: bool,
    client: AsyncClient,
}

pub struct Callbacks {
    calls: HashMap<String, Vec<tokio::sync::mpsc::Sender<String>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        return Callbacks { calls: HashMap::new() };
    }

    pub fn insert(&mut self, topic: String, callback: tokio::sync::mpsc::Sender<String>) {
        debug!("Adding callback to topic {topic}");
        self.calls.entry(topic).or_default().push(callback);
    }

    /// Never waits on a full callback channel, the eventloop must keep polling
    pub fn send(&self, topic: String, payload: String) {
        let v = match self.calls.get(&topic) {
            Some(v) => v,
            None => {
                debug!("Send for unknown topic {topic}");
                return;
            }
        };

        for call in v {
            debug!("Sending to callback: {payload}");
            match call.try_send(payload.clone()) {
                Ok(_) => {}
                Err(TrySendError::Full(p)) => warn!("Callback for {topic} is busy, dropping {p:?}"),
                Err(TrySendError::Closed(_)) => warn!("Callback for {topic} is gone"),
            }
        }
    }

    pub fn get_topics(&self) -> Vec<String> {
        return self.calls.keys().cloned().collect();
    }
}

lazy_static! {
    pub static ref CALLBACKS: RwLock<Callbacks> = RwLock::new(Callbacks::new());
    pub static ref APP_STATUS: RwLock<AppStatus> = RwLock::new(AppStatus::new());
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

impl MqttManager {
    pub fn new(config: &MqttConfig) -> (Self, Sender<Transmission>) {
        let (mtx,mrx) = tokio::sync::mpsc::channel(100);

        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions   = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

        // Spawn a new task to handle the incoming commands
        let reconnect_c = client.clone();
        tokio::spawn( async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let topic = p.topic;
                        let payload = String::from_utf8_lossy(&p.payload).to_string();
                        debug!("Received MQTT message on {topic}: {payload:?}");
                        APP_STATUS.write().await.mqtt_health.last_message_received = Some(Instant::now());

                        let callback = CALLBACKS.read().await;
                        callback.send(topic, payload);
                    },
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected, resubscribing everything");
                        {
                            let mut app_status = APP_STATUS.write().await;
                            app_status.mqtt_health.status = MqttConnectionStatus::Connected;
                            app_status.mqtt_health.last_connected = Some(Instant::now());
                        }

                        /* We are connected, resubscribe to everything */
                        let topics = CALLBACKS.read().await.get_topics();
                        for topic in topics {
                            /* The eventloop must keep running while we subscribe */
                            let client_clone = reconnect_c.clone();
                            tokio::spawn(async move {
                                if let Err(e) = client_clone.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                                    error!("Unable to resubscribe {topic}: {e}");
                                }
                            });
                        }
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("Error in MQTT {:?}, reconnecting ", e);
                        {
                            let mut app_status = APP_STATUS.write().await;
                            app_status.mqtt_health.status = MqttConnectionStatus::Error(e.to_string());
                            app_status.mqtt_health.connection_attempts += 1;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        APP_STATUS.write().await.mqtt_health.status = MqttConnectionStatus::Reconnecting;
                    }
                }
            }
        });

        return (MqttManager {
            client: client,
            rx: mrx,
            exit_thread: false,
        }, mtx);
    }

    async fn publish(&self, topic: String, qos: QoS, retain: bool, payload: String) {
        match self.client.publish(topic.clone(), qos, retain, payload).await {
            Err(e) => { error!("Error publishing to {topic}: {}", e); },
            Ok(_) => {
                debug!("Published {topic} successfully");
                APP_STATUS.write().await.mqtt_health.last_message_sent = Some(Instant::now());
            }
        }
    }

    pub async fn start_thread(&mut self) {

        // Handle all the incoming data
        while !self.exit_thread {
            let option = self.rx.recv().await;

            let transmission = match option {
                Some(t) => t,
                None => {
                    debug!("Reading returned none, we exit now");
                    self.exit_thread = true;
                    continue;
                }
            };

            match transmission {
                Transmission::Metering(data) => {
                    info!("Metering data received from {}", data.gateway);
                    match serde_json::to_string(&data) {
                        Ok(raw) => self.publish(RAW_TOPIC.to_string(), QoS::AtLeastOnce, false, raw).await,
                        Err(e) => error!("Unable to serialize metering data: {e}"),
                    }

                    match serde_json::to_string(&data.metered_values) {
                        Ok(state) => self.publish(state_topic(&data.gateway), QoS::AtLeastOnce, false, state).await,
                        Err(e) => error!("Unable to serialize state: {e}"),
                    }
                },
                Transmission::AutoDiscovery(disc) => {
                    info!("Publishing discovery for {}", disc.get_dev_id());
                    match serde_json::to_string(&disc) {
                        Ok(payload) => self.publish(disc.discover_topic.clone(), QoS::AtLeastOnce, true, payload).await,
                        Err(e) => error!("Unable to serialize discovery: {e}"),
                    }
                },
                Transmission::Subscribe(subscribe_data) => {
                    let topic = subscribe_data.topic;
                    /* Register first, a ConnAck in between resubscribes it anyway */
                    CALLBACKS.write().await.insert(topic.clone(), subscribe_data.sender);
                    match self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
                        Ok(_) => info!("Registered Callback {topic}"),
                        Err(e) => error!("Unable to subscribe {topic}: {e}"),
                    }
                },
                Transmission::Publish(publish_data) => {
                    self.publish(publish_data.topic, to_qos(publish_data.qos), publish_data.retain, publish_data.payload).await;
                },
            };
        }

        info!("MQTT thread exits");
    }
}

pub async fn get_app_status() -> AppStatus {
    APP_STATUS.read().await.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fake_information;

    #[test]
    fn test_topics() {
        assert_eq!(state_topic("home"), "smgw2mqtt/gateways/home/state");
        assert_eq!(availability_topic("home"), "smgw2mqtt/gateways/home/availability");
        assert_eq!(command_topic("home"), "smgw2mqtt/gateways/home/command");
        assert_eq!(discovery_topic("home"), "homeassistant/device/smgw2mqtt_home/config");
    }

    #[test]
    fn test_metering_data_from_information() {
        let info = fake_information();
        let data = MeteringData::from_information("home", Vendor::PPC, &info);

        assert_eq!(data.gateway, "home");
        assert_eq!(data.metered_time, info.last_update.timestamp() as u64);
        assert_eq!(data.metered_values["1-0:1.8.0"], serde_json::json!(724.9204));
        assert_eq!(data.metered_values["1-0:2.8.0"], serde_json::json!(3.0557));
        assert_eq!(data.metered_values[LAST_UPDATE_KEY], "2024-12-20T16:00:01+00:00");
    }

    #[test]
    fn test_qos() {
        assert_eq!(to_qos(1), QoS::AtLeastOnce);
        assert_eq!(to_qos(7), QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn test_callbacks() {
        let mut callbacks = Callbacks::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        callbacks.insert("a/b".to_string(), tx);

        callbacks.send("a/b".to_string(), "restart".to_string());
        callbacks.send("a/c".to_string(), "ignored".to_string());

        assert_eq!(rx.recv().await.unwrap(), "restart");
        assert!(rx.try_recv().is_err());
        assert_eq!(callbacks.get_topics(), vec!["a/b".to_string()]);
    }

    #[tokio::test]
    async fn test_callbacks_drop_when_full() {
        let mut callbacks = Callbacks::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        callbacks.insert("a/b".to_string(), tx);

        /* Nobody reads yet, the second one must not block */
        callbacks.send("a/b".to_string(), "first".to_string());
        callbacks.send("a/b".to_string(), "second".to_string());

        assert_eq!(rx.recv().await.unwrap(), "first");
        assert!(rx.try_recv().is_err());

        drop(rx);
        callbacks.send("a/b".to_string(), "closed".to_string());
    }
}
