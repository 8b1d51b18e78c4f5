use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::Vendor;

const CONFIG_ENV: &str = "SMGW2MQTT_CONFIG";
const CONFIG_PATHS: [&str; 2] = ["config/smgw2mqtt.yaml", "smgw2mqtt.yaml"];
const MASKED: &str = "<MASKED>";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to find a config file, tried {0:?}")]
    NotFound(Vec<String>),
    #[error("Unable to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn httpd_enabled_default() -> bool { return true }
fn httpd_port_default() -> u16 { return 8241 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HttpdConfig {
    #[serde(default="httpd_enabled_default")]
    pub enabled: bool,
    #[serde(default="httpd_port_default")]
    pub port: u16
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_ha_enabled_default() -> bool { return true }
fn mqtt_client_name_default() -> String { return "smgw2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_ha_enabled_default")]
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &MASKED)
            .field("pass", &MASKED)
            .field("ha_enabled", &self.ha_enabled)
            .field("client_name", &self.client_name)
            .finish()
    }
}

fn gateway_scan_interval_default() -> u64 { return 5 }
fn gateway_timeout_default() -> u64 { return 10 }
fn gateway_verify_tls_default() -> bool { return false }
fn gateway_debug_default() -> bool { return false }

#[derive(Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    pub name: String,
    pub vendor: Vendor,
    /// Falls back to the vendor's factory address if not set
    #[serde(default)]
    pub host: Option<String>,
    pub username: String,
    pub password: String,
    /// Minutes between two polls
    #[serde(default="gateway_scan_interval_default")]
    pub scan_interval: u64,
    /// Seconds per HTTP request
    #[serde(default="gateway_timeout_default")]
    pub timeout: u64,
    #[serde(default="gateway_verify_tls_default")]
    pub verify_tls: bool,
    #[serde(default="gateway_debug_default")]
    pub debug: bool,
}

impl GatewayConfig {
    pub fn new(name: &str, vendor: Vendor, host: &str, username: &str, password: &str) -> Self {
        GatewayConfig {
            name: name.to_string(),
            vendor,
            host: Some(host.to_string()),
            username: username.to_string(),
            password: password.to_string(),
            scan_interval: gateway_scan_interval_default(),
            timeout: gateway_timeout_default(),
            verify_tls: gateway_verify_tls_default(),
            debug: gateway_debug_default(),
        }
    }

    pub fn host(&self) -> String {
        match &self.host {
            Some(h) if !h.trim().is_empty() => h.trim().trim_end_matches('/').to_string(),
            _ => self.vendor.default_host().to_string(),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval * 60)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn masked(&self) -> Self {
        let mut c = self.clone();
        c.username = MASKED.to_string();
        c.password = MASKED.to_string();
        c
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("name", &self.name)
            .field("vendor", &self.vendor)
            .field("host", &self.host())
            .field("username", &MASKED)
            .field("password", &MASKED)
            .field("scan_interval", &self.scan_interval)
            .field("timeout", &self.timeout)
            .field("verify_tls", &self.verify_tls)
            .field("debug", &self.debug)
            .finish()
    }
}

fn httpd_default() -> HttpdConfig { return HttpdConfig{ enabled: httpd_enabled_default(), port: httpd_port_default() }}
fn gateways_default() -> Vec<GatewayConfig> { return Vec::new(); }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default="httpd_default")]
    pub httpd: HttpdConfig,
    pub mqtt: MqttConfig,
    #[serde(default="gateways_default")]
    pub gateways: Vec<GatewayConfig>,
}

impl Config {
    /// Loads the config from `SMGW2MQTT_CONFIG` or the first default path that exists
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }

        let path = CONFIG_PATHS.iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or_else(|| ConfigError::NotFound(CONFIG_PATHS.iter().map(|p| p.to_string()).collect()))?;

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading config from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let c = Self::from_yaml(&contents)?;
        info!("Loaded config from {} with {} gateways", path.display(), c.gateways.len());
        Ok(c)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut logins = HashSet::new();

        for gw in self.gateways.iter() {
            if gw.name.trim().is_empty() {
                return Err(ConfigError::Invalid("gateway name must not be empty".to_string()));
            }
            if !names.insert(gw.name.clone()) {
                return Err(ConfigError::Invalid(format!("gateway name {:?} is used twice", gw.name)));
            }
            /* The gateways only allow one session per user, polling them twice breaks both */
            if !logins.insert((gw.host(), gw.username.clone())) {
                return Err(ConfigError::Invalid(format!("gateway {:?} uses a host and username which is already configured", gw.name)));
            }
            if gw.scan_interval == 0 {
                return Err(ConfigError::Invalid(format!("gateway {:?} needs a scan_interval of at least one minute", gw.name)));
            }
            if gw.timeout == 0 {
                return Err(ConfigError::Invalid(format!("gateway {:?} needs a timeout of at least one second", gw.name)));
            }
        }

        Ok(())
    }

    /// Copy which is safe to hand out over the API
    pub fn masked(&self) -> Self {
        let mut c = self.clone();
        c.mqtt.user = MASKED.to_string();
        c.mqtt.pass = MASKED.to_string();
        c.gateways = self.gateways.iter().map(|g| g.masked()).collect();
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
mqtt:
  host: broker.local
  user: bridge
  pass: secret
gateways:
  - name: home
    vendor: ppc
    username: user
    password: pass
  - name: garage
    vendor: emh
    host: https://10.0.0.5/
    username: other
    password: pass
    scan_interval: 1
    verify_tls: true
"#;

    #[test]
    fn test_parse_with_defaults() {
        let c = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(c.mqtt.port, 1883);
        assert_eq!(c.mqtt.client_name, "smgw2mqtt");
        assert!(c.httpd.enabled);
        assert_eq!(c.httpd.port, 8241);
        assert_eq!(c.gateways.len(), 2);

        let home = &c.gateways[0];
        assert_eq!(home.name, "home");
        assert_eq!(home.vendor, Vendor::PPC);
        assert_eq!(home.host(), "https://192.168.1.200/cgi-bin/hanservice.cgi");
        assert_eq!(home.scan_interval(), Duration::from_secs(300));
        assert_eq!(home.timeout(), Duration::from_secs(10));
        assert!(!home.verify_tls);
        assert!(!home.debug);

        let garage = &c.gateways[1];
        assert_eq!(garage.name, "garage");
        assert_eq!(garage.host(), "https://10.0.0.5");
        assert_eq!(garage.scan_interval(), Duration::from_secs(60));
        assert!(garage.verify_tls);
    }

    #[test]
    fn test_duplicate_host_and_username_rejected() {
        let yaml = r#"
mqtt:
  host: broker.local
gateways:
  - name: a
    vendor: ppc
    username: user
    password: pass
  - name: b
    vendor: ppc
    host: https://192.168.1.200/cgi-bin/hanservice.cgi
    username: user
    password: pass
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let yaml = r#"
mqtt:
  host: broker.local
gateways:
  - name: a
    vendor: ppc
    username: user
    password: pass
  - name: a
    vendor: theben
    username: user
    password: pass
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_scan_interval_rejected() {
        let yaml = r#"
mqtt:
  host: broker.local
gateways:
  - name: a
    vendor: theben
    username: user
    password: pass
    scan_interval: 0
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_vendor_is_parse_error() {
        let yaml = r#"
mqtt:
  host: broker.local
gateways:
  - name: a
    vendor: landis
    username: user
    password: pass
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_credentials_are_masked() {
        let c = Config::from_yaml(SAMPLE).unwrap();
        let debug = format!("{:?}", c);
        assert!(!debug.contains("secret"));
        assert!(debug.contains(MASKED));

        let masked = c.masked();
        assert_eq!(masked.mqtt.pass, MASKED);
        assert_eq!(masked.gateways[0].password, MASKED);
        assert_eq!(masked.gateways[0].name, "home");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let c = Config::load_from(file.path()).unwrap();
        assert_eq!(c.gateways.len(), 2);

        let missing = Config::load_from(Path::new("/nonexistent/smgw2mqtt.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
