use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct SmgwInfoResponse {
    #[serde(rename = "smgw-info")]
    pub smgw_info: SmgwInfo,
}

#[derive(Debug, Deserialize)]
pub struct SmgwInfo {
    #[serde(rename = "firmware-info")]
    pub firmware_info: FirmwareInfo,
}

#[derive(Debug, Deserialize)]
pub struct FirmwareInfo {
    pub version: String,
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct UserInfoResponse {
    #[serde(rename = "user-info")]
    pub user_info: UserInfo,
}

#[derive(Debug, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "usage-points", default)]
    pub usage_points: Vec<UsagePoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsagePoint {
    #[serde(rename = "usage-point-id")]
    pub usage_point_id: String,
    #[serde(rename = "taf-state", default)]
    pub taf_state: String,
    /// Seen as string and as number
    #[serde(rename = "taf-number", default)]
    pub taf_number: Value,
}

impl UsagePoint {
    pub fn is_running(&self) -> bool {
        self.taf_state == "running"
    }

    pub fn is_taf(&self, number: u64) -> bool {
        match &self.taf_number {
            Value::String(s) => s.trim().parse::<u64>().ok() == Some(number),
            Value::Number(n) => n.as_u64() == Some(number),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadingsResponse {
    pub readings: ReadingsBody,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsBody {
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
pub struct Channel {
    /// Logical name as 12 hex digits
    pub obis: String,
    #[serde(default)]
    pub readings: Vec<ChannelReading>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelReading {
    pub value: Value,
    #[serde(rename = "capture-time")]
    pub capture_time: String,
}
