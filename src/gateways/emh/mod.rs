use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::http::HttpClient;
use super::SmgwError;
use crate::models::{Information, ObisCode, Reading, Vendor, UNKNOWN_FIRMWARE};
use crate::obis_utils::{format_value, obis_from_hex};

pub mod structs;
use structs::*;

/// Client for the JSON REST interface of EMH CASA gateways
pub struct EmhClient {
    base_url: String,
    http: HttpClient,
    meter_id: Option<String>,
}

impl EmhClient {
    pub fn new(base_url: String, http: HttpClient) -> Self {
        EmhClient { base_url, http, meter_id: None }
    }

    pub async fn get_data(&mut self) -> Result<Information, SmgwError> {
        let meter_id = match self.meter_id.clone() {
            Some(id) => id,
            None => {
                let id = self.discover_meter_id().await?;
                self.meter_id = Some(id.clone());
                id
            }
        };

        let readings = self.get_readings(&meter_id).await?;
        let information = Information::new(&Vendor::EMH, UNKNOWN_FIRMWARE.to_string(), Utc::now(), readings);
        debug!("Returning information: {information:?}");
        Ok(information)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SmgwError> {
        let url = format!("{}{}", self.base_url, path);
        let text = self.http.get(&url, None).await?.text().await?;
        debug!("Got response for {path}: {text}");
        Ok(serde_json::from_str(&text)?)
    }

    async fn discover_meter_id(&self) -> Result<String, SmgwError> {
        debug!("Discovering meter id from {}", self.base_url);
        let contracts: Vec<Value> = self.get_json("/json/metering/derived").await?;

        for contract in contracts {
            let contract_id = match contract {
                Value::String(s) => s,
                other => other.to_string(),
            };

            match self.get_json::<Contract>(&format!("/json/metering/derived/{contract_id}")).await {
                Ok(c) => {
                    if let Some(id) = c.sensor_domains.into_iter().next() {
                        info!("Found meter id {id} in contract {contract_id}");
                        return Ok(id);
                    }
                }
                Err(e) => error!("Failed to fetch contract {contract_id}: {e}"),
            }
        }

        Err(SmgwError::NoMeterId)
    }

    async fn get_readings(&self, meter_id: &str) -> Result<BTreeMap<ObisCode, Reading>, SmgwError> {
        let values: ExtendedValues = self.get_json(&format!("/json/metering/origin/{meter_id}/extended")).await?;
        let readings = parse_values(&values, Utc::now());
        info!("Parsed {} readings", readings.len());
        Ok(readings)
    }
}

fn scaled_value(value: &MeterValue) -> Option<f64> {
    let raw = match &value.value {
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };

    let scaled = raw * 10_f64.powi(value.scaler);
    if value.unit == UNIT_WH {
        Some(scaled / 1000.0)
    } else {
        Some(scaled)
    }
}

/// Readings without capture time are stamped with `now`
pub fn parse_values(values: &ExtendedValues, now: DateTime<Utc>) -> BTreeMap<ObisCode, Reading> {
    let mut readings = BTreeMap::new();

    for value in values.values.iter() {
        let obis = match obis_from_hex(&value.logical_name) {
            Ok(o) => o,
            Err(_) => {
                debug!("Skipping logical name {:?}", value.logical_name);
                continue;
            }
        };

        let scaled = match scaled_value(value) {
            Some(v) => format_value(v),
            None => {
                error!("Value of {obis} is not numeric: {}", value.value);
                continue;
            }
        };

        let timestamp = match value.capture_time.as_deref() {
            Some(t) => match DateTime::parse_from_rfc3339(t) {
                Ok(t) => t.with_timezone(&Utc),
                Err(_) => {
                    warn!("Invalid capture time {t:?} for {obis}, using now");
                    now
                }
            },
            None => now,
        };

        readings.insert(obis.clone(), Reading::new(&obis, scaled, timestamp));
    }

    readings
}
