//! The HTTP client for the remote control service.
//!
//! Every request carries a short signed token identifying the device; any
//! failure is logged and collapsed to `None` so callers decide between
//! retrying and serving from cache.

use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::Config;

/// Connect timeout of control-service requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default overall timeout of control-service requests.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// The claim signed into the `Authorization` header.
#[derive(Serialize, Deserialize)]
struct Claims {
    device: String,
}

/// A client bound to one device identity and one control service.
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    app_url: String,
    device_id: String,
    api_key: String,
}

impl RemoteClient {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            app_url: config.app_url.trim_end_matches('/').to_owned(),
            device_id: config.device_id.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// Builds the url of a device endpoint, e.g. `device_url("get-state")`.
    pub fn device_url(&self, endpoint: &str) -> String {
        format!("{}/api/devices/{}/{endpoint}/", self.app_url, self.device_id)
    }

    /// The HS512 token of `{device}` under the pre-shared key.
    fn auth_token(&self) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            device: self.device_id.clone(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(self.api_key.as_bytes()),
        )
    }

    /// GETs a url with the given query parameters.
    pub async fn get(
        &self,
        url: &str,
        params: &[(&str, &str)],
        response_timeout: Duration,
    ) -> Option<Response> {
        let request = self.http.get(url).query(params);
        self.send(url, request, response_timeout).await
    }

    /// POSTs a JSON body (or an empty one) to a url.
    pub async fn post(&self, url: &str, body: Option<&serde_json::Value>) -> Option<Response> {
        let mut request = self.http.post(url);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(url, request, RESPONSE_TIMEOUT).await
    }

    /// Signs and sends a request; 2xx yields the response, anything else
    /// is logged and dropped.
    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
        response_timeout: Duration,
    ) -> Option<Response> {
        let token = match self.auth_token() {
            Ok(token) => token,
            Err(e) => {
                error!("unable to sign request to {url}: {e}");
                return None;
            }
        };

        let result = request
            .header(reqwest::header::AUTHORIZATION, token)
            .timeout(response_timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => Some(response),
            Ok(response) => {
                error!("{url} returned {}", response.status());
                None
            }
            Err(e) => {
                error!("request to {url} failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jsonwebtoken::{Algorithm, DecodingKey, Validation};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{Claims, RemoteClient, RESPONSE_TIMEOUT};
    use crate::config::Config;

    fn config(app_url: &str) -> Config {
        Config {
            device_id: "dev-1".to_owned(),
            app_url: app_url.to_owned(),
            api_key: "hunter2".to_owned(),
            download_dir: "/tmp/playout".into(),
            media_backend: "dummy".to_owned(),
            redis_url: "redis://localhost".to_owned(),
            scheduler_channel: "SCHEDULER_REDIS_CHANNEL".to_owned(),
            player_channel: "PLAYER_REDIS_CHANNEL".to_owned(),
            debug: false,
        }
    }

    #[tokio::test]
    async fn requests_carry_a_verifiable_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/devices/dev-1/get-state/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = RemoteClient::new(&config(&server.uri())).unwrap();
        let response = client
            .get(&client.device_url("get-state"), &[], RESPONSE_TIMEOUT)
            .await;
        assert!(response.is_some());

        let requests = server.received_requests().await.unwrap();
        let token = requests[0]
            .headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();

        let mut validation = Validation::new(Algorithm::HS512);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let decoded = jsonwebtoken::decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"hunter2"),
            &validation,
        )
        .unwrap();
        assert_eq!(decoded.claims.device, "dev-1");
    }

    #[tokio::test]
    async fn http_errors_collapse_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/devices/dev-1/ack-sync/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = RemoteClient::new(&config(&server.uri())).unwrap();
        let response = client.post(&client.device_url("ack-sync"), None).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn transport_errors_collapse_to_none() {
        let client = RemoteClient::new(&config("http://127.0.0.1:1")).unwrap();
        let response = client
            .get(
                &client.device_url("get-state"),
                &[],
                Duration::from_secs(1),
            )
            .await;
        assert!(response.is_none());
    }
}
