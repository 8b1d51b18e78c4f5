use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{json, Value};

use super::http::HttpClient;
use super::SmgwError;
use crate::models::{Information, ObisCode, Reading, Vendor, UNKNOWN_FIRMWARE};
use crate::obis_utils::{apply_scaler, obis_from_hex};

pub mod structs;
use structs::*;

/// TAF 7 delivers the meter readings we are interested in
const PREFERRED_TAF: u64 = 7;
/// Readings are delivered in 1/10 Wh, we report kWh
const VALUE_SCALER: i32 = -4;

/// Client for the JSON interface of Theben Conexa gateways
pub struct ThebenClient {
    url: String,
    http: HttpClient,
}

impl ThebenClient {
    pub fn new(url: String, http: HttpClient) -> Self {
        ThebenClient { url, http }
    }

    pub async fn get_data(&mut self) -> Result<Information, SmgwError> {
        let firmware_version = self.get_firmware_version().await;
        let readings = self.get_readings().await?;

        let information = Information::new(&Vendor::Theben, firmware_version, Utc::now(), readings);
        debug!("Returning information: {information:?}");
        Ok(information)
    }

    async fn call(&self, body: Value) -> Result<Value, SmgwError> {
        let response = self.http.post_json(&self.url, &body).await?;
        let text = response.text().await?;
        debug!("Got response for {}: {text}", body["method"]);
        Ok(serde_json::from_str(&text)?)
    }

    async fn get_firmware_version(&self) -> String {
        debug!("Getting firmware version from {}", self.url);

        let result = match self.call(json!({"method": "smgw-info"})).await {
            Ok(v) => parse_firmware_version(v),
            Err(e) => Err(e),
        };

        match result {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to fetch firmware version: {e}");
                UNKNOWN_FIRMWARE.to_string()
            }
        }
    }

    async fn get_usage_point_ids(&self) -> Result<Vec<String>, SmgwError> {
        debug!("Getting user info from {}", self.url);
        let response: UserInfoResponse = serde_json::from_value(self.call(json!({"method": "user-info"})).await?)?;
        debug!("Received {} usage points", response.user_info.usage_points.len());

        let ids = select_usage_points(&response.user_info.usage_points);
        if ids.is_empty() {
            return Err(SmgwError::NoUsagePoint);
        }

        debug!("Using {} usage point ids: {:?}", ids.len(), ids);
        Ok(ids)
    }

    async fn get_readings(&self) -> Result<BTreeMap<ObisCode, Reading>, SmgwError> {
        let mut readings = BTreeMap::new();
        let mut fetched = 0;
        let mut last_error = None;

        for id in self.get_usage_point_ids().await? {
            let body = json!({
                "method": "readings",
                "database": "origin",
                "usage-point-id": id,
                "last-reading": "true",
            });

            let response = match self.call(body).await.and_then(|v| Ok(serde_json::from_value::<ReadingsResponse>(v)?)) {
                Ok(r) => r,
                Err(e) => {
                    error!("Failed to fetch readings of usage point {id}: {e}");
                    last_error = Some(e);
                    continue;
                }
            };

            fetched += 1;
            readings.extend(parse_channels(&response));
        }

        /* One broken usage point is tolerated, all of them is a failed poll */
        if fetched == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        info!("Parsed {} readings", readings.len());
        Ok(readings)
    }
}

/// `<version>-<first 8 characters of the hash>`, the full hash is 64 characters long
pub fn parse_firmware_version(value: Value) -> Result<String, SmgwError> {
    let info: SmgwInfoResponse = serde_json::from_value(value)?;
    let fw = info.smgw_info.firmware_info;
    let short_hash: String = fw.hash.chars().take(8).collect();
    Ok(format!("{}-{}", fw.version, short_hash))
}

/// Running TAF 7 usage points if there are any, otherwise every running one
pub fn select_usage_points(points: &[UsagePoint]) -> Vec<String> {
    let preferred: Vec<String> = points.iter()
        .filter(|p| p.is_running() && p.is_taf(PREFERRED_TAF))
        .map(|p| p.usage_point_id.clone())
        .collect();

    if !preferred.is_empty() {
        return preferred;
    }

    points.iter()
        .filter(|p| p.is_running())
        .map(|p| p.usage_point_id.clone())
        .collect()
}

fn raw_value(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

pub fn parse_channels(response: &ReadingsResponse) -> BTreeMap<ObisCode, Reading> {
    let mut readings = BTreeMap::new();

    for channel in response.readings.channels.iter() {
        let obis = match obis_from_hex(&channel.obis) {
            Ok(o) => o,
            Err(e) => {
                error!("Skipping channel: {e}");
                continue;
            }
        };

        let reading = match channel.readings.as_slice() {
            [] => {
                error!("No reading found for {obis}");
                continue;
            }
            [first] => first,
            [first, ..] => {
                warn!("{} readings found for {obis}, only the first one is used", channel.readings.len());
                first
            }
        };

        let value = match raw_value(&reading.value) {
            Some(v) => apply_scaler(v, VALUE_SCALER),
            None => {
                error!("Reading of {obis} has no numeric value: {}", reading.value);
                continue;
            }
        };

        let timestamp = match DateTime::parse_from_rfc3339(&reading.capture_time) {
            Ok(t) => t.with_timezone(&Utc),
            Err(_) => {
                error!("Reading of {obis} has an invalid capture time {:?}", reading.capture_time);
                continue;
            }
        };

        readings.insert(obis.clone(), Reading::new(&obis, value, timestamp));
    }

    readings
}
