use std::time::Duration;
use log::info;
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::models::{fake_information, Information, Vendor};
use crate::obis_utils::ObisError;

pub mod http;
#[cfg(feature = "ppc")]
pub mod ppc;
#[cfg(feature = "theben")]
pub mod theben;
#[cfg(feature = "emh")]
pub mod emh;

/// Time a real gateway needs to answer all calls, emulated in debug mode
const FAKE_RESPONSE_DELAY: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum SmgwError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Gateway answered with HTTP status {0}")]
    Status(u16),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Invalid URL {0}")]
    InvalidUrl(String),
    #[error("Gateway did not set a session cookie")]
    MissingCookie,
    #[error("Element {0} not found in response")]
    MissingElement(&'static str),
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unexpected JSON: {0}")]
    UnexpectedJson(String),
    #[error("Invalid timestamp {0:?}")]
    Timestamp(String),
    #[error(transparent)]
    InvalidObis(#[from] ObisError),
    #[error("No running usage point found")]
    NoUsagePoint,
    #[error("No meter id found in any contract")]
    NoMeterId,
    #[error("{0} is not supported by this gateway")]
    Unsupported(&'static str),
    #[error("Support for {0} gateways was not compiled in")]
    VendorDisabled(String),
}

enum Client {
    #[cfg(feature = "ppc")]
    Ppc(ppc::PpcClient),
    #[cfg(feature = "theben")]
    Theben(theben::ThebenClient),
    #[cfg(feature = "emh")]
    Emh(emh::EmhClient),
}

/// One configured smart meter gateway
pub struct Gateway {
    name: String,
    vendor: Vendor,
    debug: bool,
    client: Client,
}

impl Gateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, SmgwError> {
        let http = http::HttpClient::new(config)?;
        let host = config.host();

        let client = match config.vendor {
            #[cfg(feature = "ppc")]
            Vendor::PPC => Client::Ppc(ppc::PpcClient::new(host, http)),
            #[cfg(feature = "theben")]
            Vendor::Theben => Client::Theben(theben::ThebenClient::new(host, http)),
            #[cfg(feature = "emh")]
            Vendor::EMH => Client::Emh(emh::EmhClient::new(host, http)),
            #[allow(unreachable_patterns)]
            other => return Err(SmgwError::VendorDisabled(other.to_string())),
        };

        Ok(Gateway {
            name: config.name.clone(),
            vendor: config.vendor,
            debug: config.debug,
            client,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub async fn get_data(&mut self) -> Result<Information, SmgwError> {
        info!("[{}] Fetching data from gateway", self.name);

        if self.debug {
            info!("[{}] Debugging enabled, returning fake data", self.name);
            tokio::time::sleep(FAKE_RESPONSE_DELAY).await;
            return Ok(fake_information());
        }

        match &mut self.client {
            #[cfg(feature = "ppc")]
            Client::Ppc(c) => c.get_data().await,
            #[cfg(feature = "theben")]
            Client::Theben(c) => c.get_data().await,
            #[cfg(feature = "emh")]
            Client::Emh(c) => c.get_data().await,
        }
    }

    pub async fn reboot(&mut self) -> Result<(), SmgwError> {
        info!("[{}] Rebooting gateway", self.name);

        if self.debug {
            info!("[{}] Debugging enabled, not rebooting", self.name);
            return Ok(());
        }

        match &mut self.client {
            #[cfg(feature = "ppc")]
            Client::Ppc(c) => c.reboot().await,
            #[cfg(feature = "theben")]
            Client::Theben(_) => Err(SmgwError::Unsupported("reboot")),
            #[cfg(feature = "emh")]
            Client::Emh(_) => Err(SmgwError::Unsupported("reboot")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reboot_unsupported() {
        let config = GatewayConfig::new("casa", Vendor::EMH, "https://127.0.0.1:1", "user", "pass");
        let mut gw = Gateway::new(&config).unwrap();
        assert_eq!(gw.name(), "casa");
        assert!(matches!(gw.reboot().await, Err(SmgwError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_debug_reboot_is_noop() {
        let mut config = GatewayConfig::new("ppc", Vendor::PPC, "https://127.0.0.1:1", "user", "pass");
        config.debug = true;
        let mut gw = Gateway::new(&config).unwrap();
        assert!(gw.reboot().await.is_ok());
    }
}
