use serde::Deserialize;
use serde_json::Value;

/// Unit code of Wh in the extended meter values
pub const UNIT_WH: u32 = 30;

#[derive(Debug, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub sensor_domains: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendedValues {
    #[serde(default)]
    pub values: Vec<MeterValue>,
}

#[derive(Debug, Deserialize)]
pub struct MeterValue {
    #[serde(default)]
    pub logical_name: String,
    pub value: Value,
    #[serde(default)]
    pub scaler: i32,
    #[serde(default)]
    pub unit: u32,
    #[serde(default)]
    pub capture_time: Option<String>,
}
