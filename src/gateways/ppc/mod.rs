use chrono::{Local, Utc};
use log::{debug, error, info};
use reqwest::header::SET_COOKIE;
use reqwest::{Response, Url};

use super::http::HttpClient;
use super::SmgwError;
use crate::models::{Information, Vendor};

pub mod parser;

const SESSION_COOKIE: &str = "session";

/// Client for the HANservice web interface of PPC gateways
pub struct PpcClient {
    host: String,
    http: HttpClient,
}

struct Session {
    cookie: String,
    token: String,
}

impl PpcClient {
    pub fn new(host: String, http: HttpClient) -> Self {
        PpcClient { host, http }
    }

    pub async fn get_data(&mut self) -> Result<Information, SmgwError> {
        let session = self.login().await?;
        let result = self.read_meter(&session).await;

        /* Only one session may be active, so always log out or the next poll gets locked out */
        self.logout(&session).await;

        let information = result?;
        info!("Found {} readings", information.readings.len());
        debug!("Readings: {:?}", information.readings);
        Ok(information)
    }

    /// The gateway reboots when its self-test is triggered
    pub async fn reboot(&mut self) -> Result<(), SmgwError> {
        info!("Running self-test");
        let session = self.login().await?;

        let response = self.post_action(&session, "selftest", &[]).await?;
        debug!("Self-test response: {response}");
        Ok(())
    }

    async fn login(&self) -> Result<Session, SmgwError> {
        info!("Logging in to {}", self.host);

        /* Every login starts a fresh session, cookies of old sessions are never sent again */
        let response = self.http.get(&self.host, None).await?;
        let cookie = session_cookie(&response).ok_or(SmgwError::MissingCookie)?;
        let body = response.text().await?;
        let token = parser::parse_token(&body)?;

        info!("Got cookie response, assuming we are logged in");
        Ok(Session {
            cookie: format!("{SESSION_COOKIE}={cookie}"),
            token,
        })
    }

    async fn read_meter(&self, session: &Session) -> Result<Information, SmgwError> {
        info!("Requesting meter readings");
        let page = self.post_action(session, "meterform", &[]).await?;
        let form = parser::parse_meter_form(&page)?;

        info!("Requesting meter profile of {}", form.meter_id);
        let page = self.post_action(session, "showMeterProfile", &[("mid", form.meter_id.as_str())]).await?;
        let values = parser::parse_meter_values(&page, &Local)?;

        Ok(Information::new(
            &Vendor::PPC,
            form.firmware_version,
            values.last_timestamp.unwrap_or_else(Utc::now),
            values.readings,
        ))
    }

    async fn logout(&self, session: &Session) {
        info!("Trying to log out");
        match self.post_action(session, "logout", &[]).await {
            Ok(body) => debug!("Logout response: {body}"),
            Err(e) => error!("Error logging out: {e}"),
        }
    }

    async fn post_action(&self, session: &Session, action: &str, extra: &[(&str, &str)]) -> Result<String, SmgwError> {
        let mut params = vec![("tkn", session.token.as_str()), ("action", action)];
        params.extend_from_slice(extra);

        let response = self.http.post_form(&self.host, form_body(&params)?, Some(&session.cookie)).await?;
        Ok(response.text().await?)
    }
}

/// `application/x-www-form-urlencoded` body with the parameters in the given order
fn form_body(params: &[(&str, &str)]) -> Result<String, SmgwError> {
    let url = Url::parse_with_params("http://localhost/", params)
        .map_err(|e| SmgwError::InvalidUrl(e.to_string()))?;
    Ok(url.query().unwrap_or_default().to_string())
}

fn session_cookie(response: &Response) -> Option<String> {
    response.headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|v| v.split_once('='))
        .find(|(name, _)| name.trim() == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::parser::fixtures::*;
    use crate::config::GatewayConfig;
    use mockito::{Matcher, Mock, Server, ServerGuard};

    const PATH: &str = "/cgi-bin/hanservice.cgi";

    fn client(server: &ServerGuard) -> PpcClient {
        let host = format!("{}{}", server.url(), PATH);
        let config = GatewayConfig::new("ppc", Vendor::PPC, &host, "user", "pass");
        PpcClient::new(config.host(), HttpClient::new(&config).unwrap())
    }

    async fn mock_login(server: &mut ServerGuard) -> Mock {
        server
            .mock("GET", PATH)
            .with_status(200)
            .with_header("set-cookie", "session=f00ba4; path=/; HttpOnly")
            .with_body(LOGIN_PAGE)
            .create_async()
            .await
    }

    async fn mock_action(server: &mut ServerGuard, body: &str, response: &str) -> Mock {
        server
            .mock("POST", PATH)
            .match_header("cookie", "session=f00ba4")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(body)
            .with_status(200)
            .with_body(response)
            .create_async()
            .await
    }

    #[test]
    fn test_form_body() {
        assert_eq!(form_body(&[("tkn", "abc"), ("action", "meterform")]).unwrap(), "tkn=abc&action=meterform");
        assert_eq!(form_body(&[("mid", "a b&c")]).unwrap(), "mid=a+b%26c");
    }

    #[tokio::test]
    async fn test_get_data() {
        let mut server = Server::new_async().await;
        let login = mock_login(&mut server).await;
        let form = mock_action(&mut server, "tkn=a1b2c3d4e5&action=meterform", METER_FORM).await;
        let profile = mock_action(&mut server, "tkn=a1b2c3d4e5&action=showMeterProfile&mid=MID-0815", METER_PROFILE).await;
        let logout = mock_action(&mut server, "tkn=a1b2c3d4e5&action=logout", "bye").await;

        let info = client(&server).get_data().await.unwrap();

        assert_eq!(info.name, "PPC SMGW");
        assert_eq!(info.manufacturer, "Power Plus Communications AG");
        assert_eq!(info.firmware_version, "1.2.3-45678");
        assert_eq!(info.readings.len(), 3);
        assert_eq!(info.get_reading("1-0:1.8.0").unwrap().value, "724.9204");
        assert_eq!(info.get_reading("1-0:2.8.0").unwrap().value, "3.0557");
        assert_eq!(info.last_update, info.get_reading("1-1:1.7.0").unwrap().timestamp);

        login.assert_async().await;
        form.assert_async().await;
        profile.assert_async().await;
        logout.assert_async().await;
    }

    #[tokio::test]
    async fn test_logout_after_failed_read() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _form = mock_action(&mut server, "tkn=a1b2c3d4e5&action=meterform", "<html>maintenance</html>").await;
        let logout = mock_action(&mut server, "tkn=a1b2c3d4e5&action=logout", "bye").await;

        let result = client(&server).get_data().await;
        assert!(matches!(result, Err(SmgwError::MissingElement(_))));
        logout.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_without_cookie() {
        let mut server = Server::new_async().await;
        let _login = server.mock("GET", PATH).with_status(200).with_body(LOGIN_PAGE).create_async().await;
        let nothing_posted = server.mock("POST", Matcher::Any).expect(0).create_async().await;

        let result = client(&server).get_data().await;
        assert!(matches!(result, Err(SmgwError::MissingCookie)));
        nothing_posted.assert_async().await;
    }

    #[tokio::test]
    async fn test_reboot_runs_selftest() {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let selftest = mock_action(&mut server, "tkn=a1b2c3d4e5&action=selftest", "ok").await;

        client(&server).reboot().await.unwrap();
        selftest.assert_async().await;
    }
}
