//! Smart meter gateway bridge
//!
//! Polls PPC, Theben Conexa and EMH CASA smart meter gateways and publishes
//! their readings to MQTT, including Home Assistant discovery.

pub mod models;
#[cfg(feature = "api")]
pub mod api;
pub mod mqtt;
pub mod config;
pub mod gateways;
pub mod coordinator;
pub mod obis_utils;

// Re-export common types for easier access
pub use models::{Information, Reading, Vendor};
pub use gateways::{Gateway, SmgwError};
pub use coordinator::{GatewayManager, GatewayRegistry};
pub use mqtt::{CALLBACKS, MeteringData, MqttManager};
#[cfg(feature = "api")]
pub use api::ApiManager;
pub use config::{Config, ConfigError};
