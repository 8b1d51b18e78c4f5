use std::collections::HashMap;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ObisError {
    #[error("Logical name {0:?} is not 12 hex digits")]
    InvalidLength(String),
    #[error("Logical name {0:?} is not valid hex")]
    InvalidHex(String),
}

lazy_static! {
    // A-B:C.D.E with an optional *F storage group
    static ref OBIS_RE: Regex = Regex::new(r"^(\d{1,3})-(\d{1,3}):(\d{1,3})\.(\d{1,3})\.(\d{1,3})(?:\*(\d{1,3}))?$").unwrap();
}

pub fn validate_obis_code(code: &str) -> bool {
    // A: Medium (0=abstract, 1=electricity, 6=heat, 7=gas, 8=water)
    // B: Channel
    // C: Physical value
    // D: Processing method
    // E: Tariff/Time
    // F: Storage (optional)
    let caps = match OBIS_RE.captures(code.trim()) {
        Some(c) => c,
        None => return false,
    };

    caps.iter()
        .skip(1)
        .flatten()
        .all(|m| m.as_str().parse::<u8>().is_ok())
}

pub fn normalize_obis_code(code: &str) -> String {
    code.trim().to_string()
}

/// Drops the storage group, `1-0:1.8.0*255` becomes `1-0:1.8.0`
pub fn strip_storage(code: &str) -> String {
    let code = normalize_obis_code(code);
    match code.split_once('*') {
        Some((base, _)) => base.to_string(),
        None => code,
    }
}

/// Converts a DLMS logical name like `0100010800FF` into `1-0:1.8.0`
pub fn obis_from_hex(logical_name: &str) -> Result<String, ObisError> {
    let logical_name = logical_name.trim();
    if logical_name.len() != 12 {
        return Err(ObisError::InvalidLength(logical_name.to_string()));
    }

    let bytes = hex::decode(logical_name)
        .map_err(|_| ObisError::InvalidHex(logical_name.to_string()))?;

    Ok(format!("{}-{}:{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]))
}

pub fn get_obis_description(obis_code: &str) -> Option<&'static str> {
    let descriptions = get_standard_obis_descriptions();
    descriptions.get(strip_storage(obis_code).as_str()).copied()
}

pub fn get_standard_obis_descriptions() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    // Energy values
    map.insert("1-0:1.8.0", "Active energy + (total)");
    map.insert("1-0:1.8.1", "Active energy + (tariff 1)");
    map.insert("1-0:1.8.2", "Active energy + (tariff 2)");
    map.insert("1-0:2.8.0", "Active energy - (total)");
    map.insert("1-0:2.8.1", "Active energy - (tariff 1)");
    map.insert("1-0:2.8.2", "Active energy - (tariff 2)");

    // Power values, SMGWs report them on channel 1
    map.insert("1-0:1.7.0", "Active power + (total)");
    map.insert("1-0:2.7.0", "Active power - (total)");
    map.insert("1-1:1.7.0", "Active power + (total)");
    map.insert("1-1:2.7.0", "Active power - (total)");
    map.insert("1-0:10.7.0", "Active power - (total)");
    map.insert("1-0:16.7.0", "Sum active instantaneous power");

    // Voltage and current
    map.insert("1-0:32.7.0", "Voltage (L1)");
    map.insert("1-0:52.7.0", "Voltage (L2)");
    map.insert("1-0:72.7.0", "Voltage (L3)");
    map.insert("1-0:31.7.0", "Current (L1)");
    map.insert("1-0:51.7.0", "Current (L2)");
    map.insert("1-0:71.7.0", "Current (L3)");

    map.insert("1-0:14.7.0", "Supply frequency");

    map
}

/// How a reading is exposed as a Home Assistant sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDescription {
    pub key: String,
    pub name: String,
    pub unit_of_measurement: String,
    pub device_class: String,
    pub state_class: String,
    pub icon: String,
    pub display_precision: u32,
}

const DEFAULT_DISPLAY_PRECISION: u32 = 2;

pub fn get_known_sensor_descriptions() -> Vec<SensorDescription> {
    let entry = |key: &str, name: &str, unit: &str, class: &str, state: &str, icon: &str| SensorDescription {
        key: key.to_string(),
        name: name.to_string(),
        unit_of_measurement: unit.to_string(),
        device_class: class.to_string(),
        state_class: state.to_string(),
        icon: icon.to_string(),
        display_precision: 5,
    };

    vec![
        entry("1-0:1.8.0", "Import total", "kWh", "energy", "total_increasing", "mdi:home-import-outline"),
        entry("1-0:2.8.0", "Export total", "kWh", "energy", "total_increasing", "mdi:home-export-outline"),
        entry("1-1:1.7.0", "Current power import", "kW", "power", "measurement", "mdi:power-from-grid"),
        // some models report this as 1-0:10.7.0 instead
        entry("1-1:2.7.0", "Current power export", "kW", "power", "measurement", "mdi:power-to-grid"),
    ]
}

/// Description for a reading, falls back to a plain sensor for codes we do not know
pub fn sensor_description(obis_code: &str) -> SensorDescription {
    let code = strip_storage(obis_code);
    if let Some(known) = get_known_sensor_descriptions().into_iter().find(|d| d.key == code) {
        return known;
    }

    SensorDescription {
        key: code.clone(),
        name: get_obis_description(&code).map(|d| d.to_string()).unwrap_or_else(|| code.clone()),
        unit_of_measurement: "".to_string(),
        device_class: "".to_string(),
        state_class: "".to_string(),
        icon: "mdi:counter".to_string(),
        display_precision: DEFAULT_DISPLAY_PRECISION,
    }
}

/// Applies a power of ten and formats without trailing zeros
pub fn apply_scaler(value: f64, scaler: i32) -> String {
    format_value(value * 10_f64.powi(scaler))
}

pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{:.6}", value).trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Rounds numeric values for display, anything else is passed through
pub fn round_value(value: &str, precision: u32) -> serde_json::Value {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => {
            let factor = 10_f64.powi(precision as i32);
            serde_json::Value::from((v * factor).round() / factor)
        }
        _ => serde_json::Value::from(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_obis_code() {
        assert!(validate_obis_code("1-0:1.8.1"));
        assert!(validate_obis_code("0-0:1.0.0"));
        assert!(validate_obis_code("1-0:15.7.0"));
        assert!(validate_obis_code("1-0:1.8.0*255"));
        assert!(!validate_obis_code("invalid"));
        assert!(!validate_obis_code("1:2.3.4"));
        assert!(!validate_obis_code("1-0:1.8"));
        assert!(!validate_obis_code("1-0:1.8.0*256"));
    }

    #[test]
    fn test_get_obis_description() {
        assert_eq!(get_obis_description("1-0:1.8.1"), Some("Active energy + (tariff 1)"));
        assert_eq!(get_obis_description("1-0:2.8.0*255"), Some("Active energy - (total)"));
        assert_eq!(get_obis_description("nonexistent"), None);
    }

    #[test]
    fn test_strip_storage() {
        assert_eq!(strip_storage("1-0:1.8.0*255"), "1-0:1.8.0");
        assert_eq!(strip_storage(" 1-0:2.8.0 "), "1-0:2.8.0");
    }

    #[test]
    fn test_obis_from_hex() {
        assert_eq!(obis_from_hex("0100010800ff"), Ok("1-0:1.8.0".to_string()));
        assert_eq!(obis_from_hex("0100020800FF"), Ok("1-0:2.8.0".to_string()));
        assert_eq!(obis_from_hex("0101010700FF"), Ok("1-1:1.7.0".to_string()));
        assert_eq!(obis_from_hex("010001"), Err(ObisError::InvalidLength("010001".to_string())));
        assert_eq!(obis_from_hex("0100010800XY"), Err(ObisError::InvalidHex("0100010800XY".to_string())));
    }

    #[test]
    fn test_sensor_description() {
        let import = sensor_description("1-0:1.8.0*255");
        assert_eq!(import.name, "Import total");
        assert_eq!(import.unit_of_measurement, "kWh");
        assert_eq!(import.state_class, "total_increasing");
        assert_eq!(import.display_precision, 5);

        let voltage = sensor_description("1-0:32.7.0");
        assert_eq!(voltage.name, "Voltage (L1)");
        assert_eq!(voltage.device_class, "");
        assert_eq!(voltage.display_precision, 2);

        let unknown = sensor_description("1-0:99.99.99");
        assert_eq!(unknown.name, "1-0:99.99.99");
    }

    #[test]
    fn test_apply_scaler() {
        assert_eq!(apply_scaler(12345.0, -2), "123.45");
        assert_eq!(apply_scaler(7249204.0, -1), "724920.4");
        assert_eq!(apply_scaler(5.0, 3), "5000");
    }

    #[test]
    fn test_round_value() {
        assert_eq!(round_value("724.920412", 5), serde_json::json!(724.92041));
        assert_eq!(round_value("3", 2), serde_json::json!(3.0));
        assert_eq!(round_value("n/a", 2), serde_json::json!("n/a"));
    }
}
