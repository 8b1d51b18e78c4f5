use serde::{Deserialize, Serialize};

use crate::obis_utils::SensorDescription;

#[derive(Serialize)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
    sw_version: String,
}

#[derive(Serialize)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub support_url: String,
}

fn is_none_str(value: &String) -> bool {
    if value.is_empty() || value == "NONE" {
        return true;
    }
    return false;
}

#[derive(Serialize, PartialEq, Deserialize, Clone, Default)]
pub enum HAPlatform {
    #[default]
    Sensor,
    Button,
}

impl HAPlatform {
    pub fn to_string(&self) -> String {
        match self {
            HAPlatform::Sensor => "sensor".to_string(),
            HAPlatform::Button => "button".to_string(),
        }
    }
}

/// Component keys must not contain the separators of OBIS codes
pub fn component_key(obis: &str) -> String {
    obis.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[derive(Serialize)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub value_template: String,
    pub unique_id: String,
    pub object_id: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub state_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_display_precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_press: Option<String>,
}

impl HaComponent {
    /// Sensor reading the value of `desc.key` from the state JSON
    pub fn new_sensor(gateway: &str, desc: &SensorDescription) -> Self {
        let safe_name = component_key(&desc.key);
        return HaComponent {
            p: HAPlatform::Sensor.to_string(),
            name: desc.name.clone(),
            device_class: desc.device_class.clone(),
            unit_of_measurement: desc.unit_of_measurement.clone(),
            value_template: format!("{{{{ value_json['{}'] }}}}", desc.key),
            unique_id: format!("smgw2mqtt_{gateway}_{safe_name}").to_lowercase(),
            object_id: format!("{gateway}_{safe_name}").to_lowercase(),
            state_class: desc.state_class.clone(),
            icon: desc.icon.clone(),
            suggested_display_precision: Some(desc.display_precision),
            command_topic: None,
            payload_press: None,
        }
    }

    pub fn new_timestamp(gateway: &str, name: String, json_key: String) -> Self {
        let safe_name = component_key(&json_key);
        return HaComponent {
            p: HAPlatform::Sensor.to_string(),
            name: name,
            device_class: "timestamp".to_string(),
            unit_of_measurement: "".to_string(),
            value_template: format!("{{{{ value_json.{json_key} }}}}"),
            unique_id: format!("smgw2mqtt_{gateway}_{safe_name}").to_lowercase(),
            object_id: format!("{gateway}_{safe_name}").to_lowercase(),
            state_class: "".to_string(),
            icon: "mdi:clock-outline".to_string(),
            suggested_display_precision: None,
            command_topic: None,
            payload_press: None,
        }
    }

    pub fn new_restart(gateway: &str, command_topic: String) -> Self {
        return HaComponent {
            p: HAPlatform::Button.to_string(),
            name: "Restart".to_string(),
            device_class: "restart".to_string(),
            unit_of_measurement: "".to_string(),
            value_template: "".to_string(),
            unique_id: format!("smgw2mqtt_{gateway}_restart").to_lowercase(),
            object_id: format!("{gateway}_restart").to_lowercase(),
            state_class: "".to_string(),
            icon: "".to_string(),
            suggested_display_precision: None,
            command_topic: Some(command_topic),
            payload_press: Some("restart".to_string()),
        }
    }
}

#[derive(Serialize)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub state_topic: String,
    pub availability_topic: String,
    pub qos: u32,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscover {
    pub fn new(name: String, manu: String, model: String, sw_version: String) -> Self {
        return HaDiscover {
            discover_topic: super::discovery_topic(&name),
            dev: HaDevice {
                ids: format!("smgw2mqtt_{}", name),
                name: name.clone(),
                manufacturer: manu,
                model: model,
                sw_version: sw_version,
            },
            o: HaOrigin {
                name: "smgw2mqtt".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
                support_url: env!("CARGO_PKG_HOMEPAGE").to_string()
            },
            cmps: serde_json::Map::new(),
            state_topic: super::state_topic(&name),
            availability_topic: super::availability_topic(&name),
            qos: 1
        }
    }

    pub fn add_component(&mut self, key: String, component: HaComponent) {
        match serde_json::to_value(component) {
            Ok(v) => { self.cmps.insert(key, v); },
            Err(e) => log::error!("Unable to serialize component {key}: {e}"),
        }
    }

    pub fn get_dev_id(&self) -> String {
        return self.dev.ids.clone();
    }
}
