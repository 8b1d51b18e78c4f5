use digest_auth::AuthContext;
use log::{debug, trace};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, Response, StatusCode, Url};

use super::SmgwError;
use crate::config::GatewayConfig;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const APPLICATION_JSON: &str = "application/json";

/// reqwest client answering digest challenges of the gateways
pub struct HttpClient {
    client: Client,
    username: String,
    password: String,
}

struct RequestBody {
    data: Vec<u8>,
    content_type: &'static str,
}

impl HttpClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, SmgwError> {
        /* The gateways ship with self signed certificates */
        let client = Client::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(HttpClient {
            client,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub async fn get(&self, url: &str, cookie: Option<&str>) -> Result<Response, SmgwError> {
        self.send(Method::GET, url, None, cookie).await
    }

    pub async fn post_form(&self, url: &str, form: String, cookie: Option<&str>) -> Result<Response, SmgwError> {
        let body = RequestBody { data: form.into_bytes(), content_type: FORM_URLENCODED };
        self.send(Method::POST, url, Some(body), cookie).await
    }

    pub async fn post_json(&self, url: &str, json: &serde_json::Value) -> Result<Response, SmgwError> {
        let body = RequestBody { data: serde_json::to_vec(json)?, content_type: APPLICATION_JSON };
        self.send(Method::POST, url, Some(body), None).await
    }

    async fn send(&self, method: Method, url: &str, body: Option<RequestBody>, cookie: Option<&str>) -> Result<Response, SmgwError> {
        let response = self.build(&method, url, body.as_ref(), cookie, None).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response);
        }

        let challenge = response.headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SmgwError::Auth(format!("{url} answered 401 without a challenge")))?
            .to_string();
        trace!("Got challenge {challenge}");

        let mut prompt = digest_auth::parse(&challenge)
            .map_err(|e| SmgwError::Auth(format!("unsupported challenge {challenge:?}: {e:?}")))?;

        let uri = request_uri(url)?;
        let context = match (&method, body.as_ref()) {
            (&Method::POST, Some(b)) => AuthContext::new_post(self.username.as_str(), self.password.as_str(), uri.as_str(), Some(b.data.as_slice())),
            _ => AuthContext::new(self.username.as_str(), self.password.as_str(), uri.as_str()),
        };

        let answer = prompt.respond(&context)
            .map_err(|e| SmgwError::Auth(format!("unable to answer challenge: {e:?}")))?
            .to_header_string();

        debug!("Answering digest challenge for {method} {uri}");
        let response = self.build(&method, url, body.as_ref(), cookie, Some(answer)).send().await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(SmgwError::Auth(format!("{url} rejected the credentials")));
        }

        check_status(response)
    }

    fn build(&self, method: &Method, url: &str, body: Option<&RequestBody>, cookie: Option<&str>, auth: Option<String>) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method.clone(), url);

        if let Some(b) = body {
            req = req.header(CONTENT_TYPE, b.content_type).body(b.data.clone());
        }
        if let Some(c) = cookie {
            req = req.header(COOKIE, c);
        }
        if let Some(a) = auth {
            req = req.header(AUTHORIZATION, a);
        }

        req
    }
}

fn check_status(response: Response) -> Result<Response, SmgwError> {
    let status = response.status();
    if !status.is_success() {
        return Err(SmgwError::Status(status.as_u16()));
    }
    Ok(response)
}

/// Path and query as used in the digest `uri` field
fn request_uri(url: &str) -> Result<String, SmgwError> {
    let parsed = Url::parse(url).map_err(|e| SmgwError::InvalidUrl(format!("{url}: {e}")))?;
    Ok(match parsed.query() {
        Some(q) => format!("{}?{}", parsed.path(), q),
        None => parsed.path().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Vendor;
    use mockito::{Matcher, Server};

    const CHALLENGE: &str = r#"Digest realm="HANservice", nonce="5f2b1c7a9e", qop="auth", algorithm=MD5"#;

    fn client() -> HttpClient {
        let config = GatewayConfig::new("test", Vendor::EMH, "https://localhost", "user", "pass");
        HttpClient::new(&config).unwrap()
    }

    #[test]
    fn test_request_uri() {
        assert_eq!(request_uri("https://192.168.1.200/cgi-bin/hanservice.cgi").unwrap(), "/cgi-bin/hanservice.cgi");
        assert_eq!(request_uri("http://host/json?x=1").unwrap(), "/json?x=1");
        assert!(request_uri("not a url").is_err());
    }

    #[tokio::test]
    async fn test_answers_digest_challenge() {
        let mut server = Server::new_async().await;
        let challenge = server
            .mock("GET", "/json/metering/derived")
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", CHALLENGE)
            .create_async()
            .await;
        let authorized = server
            .mock("GET", "/json/metering/derived")
            .match_header("authorization", Matcher::Regex(r#"^Digest .*username="user""#.to_string()))
            .with_status(200)
            .with_body(r#"["c1"]"#)
            .create_async()
            .await;

        let url = format!("{}/json/metering/derived", server.url());
        let response = client().get(&url, None).await.unwrap();
        assert_eq!(response.text().await.unwrap(), r#"["c1"]"#);

        challenge.assert_async().await;
        authorized.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let mut server = Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(401)
            .with_header("www-authenticate", CHALLENGE)
            .expect(2)
            .create_async()
            .await;

        let result = client().post_form(&format!("{}/", server.url()), "a=b".to_string(), None).await;
        assert!(matches!(result, Err(SmgwError::Auth(_))));
    }

    #[tokio::test]
    async fn test_missing_challenge() {
        let mut server = Server::new_async().await;
        let _m = server.mock("GET", "/").with_status(401).create_async().await;

        let result = client().get(&format!("{}/", server.url()), None).await;
        assert!(matches!(result, Err(SmgwError::Auth(_))));
    }

    #[tokio::test]
    async fn test_error_status() {
        let mut server = Server::new_async().await;
        let _m = server.mock("GET", "/").with_status(500).create_async().await;

        let result = client().get(&format!("{}/", server.url()), None).await;
        assert!(matches!(result, Err(SmgwError::Status(500))));
    }

    #[tokio::test]
    async fn test_no_challenge_needed() {
        let mut server = Server::new_async().await;
        let m = server
            .mock("POST", "/json")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(serde_json::json!({"method": "smgw-info"})))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let response = client().post_json(&format!("{}/json", server.url()), &serde_json::json!({"method": "smgw-info"})).await;
        assert!(response.is_ok());
        m.assert_async().await;
    }
}
