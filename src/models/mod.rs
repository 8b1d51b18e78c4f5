use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use chrono::{DateTime, TimeZone, Utc};


pub type ObisCode = String;

/// A single meter value as delivered by the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    /// OBIS code of the value, e.g. `1-0:1.8.0`
    pub obis: ObisCode,
    /// Value as string, either verbatim from the gateway or already scaled
    pub value: String,
    /// Capture time of the value
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(obis: &str, value: String, timestamp: DateTime<Utc>) -> Self {
        Reading {
            obis: obis.to_string(),
            value,
            timestamp,
        }
    }
}

/// Everything we know about a gateway after one successful poll
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Information {
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub firmware_version: String,
    pub last_update: DateTime<Utc>,
    pub readings: BTreeMap<ObisCode, Reading>,
}

impl Information {
    pub fn new(vendor: &Vendor, firmware_version: String, last_update: DateTime<Utc>, readings: BTreeMap<ObisCode, Reading>) -> Self {
        Information {
            name: vendor.default_name().to_string(),
            model: vendor.default_model().to_string(),
            manufacturer: vendor.manufacturer().to_string(),
            firmware_version,
            last_update,
            readings,
        }
    }

    pub fn get_reading(&self, obis: &str) -> Option<&Reading> {
        self.readings.get(obis)
    }

    pub fn obis_codes(&self) -> Vec<ObisCode> {
        self.readings.keys().cloned().collect()
    }
}

pub const UNKNOWN_FIRMWARE: &str = "Unknown";

/// Sample data used in debug mode, so the rest of the bridge can be tested without a gateway
pub fn fake_information() -> Information {
    let ts = Utc.with_ymd_and_hms(2024, 12, 20, 16, 0, 1).single().unwrap_or_default();
    let mut readings = BTreeMap::new();
    readings.insert("1-0:1.8.0".to_string(), Reading::new("1-0:1.8.0", "724.9204".to_string(), ts));
    readings.insert("1-0:2.8.0".to_string(), Reading::new("1-0:2.8.0", "3.0557".to_string(), ts));

    Information {
        name: "TestName".to_string(),
        model: "TestModel".to_string(),
        manufacturer: "TestManufacturer".to_string(),
        firmware_version: "1337-version".to_string(),
        last_update: ts,
        readings,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Vendor {
    #[serde(rename = "ppc", alias = "PPC")]
    PPC,
    #[serde(rename = "theben", alias = "Theben")]
    Theben,
    #[serde(rename = "emh", alias = "EMH")]
    EMH,
}

impl Vendor {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ppc" => Some(Vendor::PPC),
            "theben" => Some(Vendor::Theben),
            "emh" => Some(Vendor::EMH),
            _ => None,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            Vendor::PPC => "ppc".to_string(),
            Vendor::Theben => "theben".to_string(),
            Vendor::EMH => "emh".to_string(),
        }
    }

    pub fn default_name(&self) -> &'static str {
        match self {
            Vendor::PPC => "PPC SMGW",
            Vendor::Theben => "Theben Conexa",
            Vendor::EMH => "EMH CASA",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Vendor::PPC => "SMGW",
            Vendor::Theben => "Conexa",
            Vendor::EMH => "CASA",
        }
    }

    pub fn manufacturer(&self) -> &'static str {
        match self {
            Vendor::PPC => "Power Plus Communications AG",
            Vendor::Theben => "Theben AG",
            Vendor::EMH => "EMH metering GmbH & Co. KG",
        }
    }

    pub fn default_host(&self) -> &'static str {
        match self {
            Vendor::PPC => "https://192.168.1.200/cgi-bin/hanservice.cgi",
            Vendor::Theben => "https://192.168.1.100/smgw/m2m/test.sm/json",
            Vendor::EMH => "https://192.168.1.150",
        }
    }
}
