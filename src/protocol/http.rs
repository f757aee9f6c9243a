//! reqwest transport for ActiveSync endpoints.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::{Client, Url};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::transport::{Method, Transport, TransportError, WireRequest, WireResponse};
use crate::config::AccountConfig;

pub struct HttpTransport {
    client: Client,
    endpoint: Url,
    username: String,
    password: RwLock<String>,
    device_id: String,
    device_type: String,
}

impl HttpTransport {
    pub fn new(account: &AccountConfig, password: String) -> Result<Self> {
        let scheme = if account.server.tls { "https" } else { "http" };
        let endpoint = Url::parse(&format!(
            "{}://{}:{}{}",
            scheme, account.server.host, account.server.port, account.server.path
        ))
        .with_context(|| format!("Invalid server address for {}", account.email))?;

        let client = Client::builder()
            .user_agent(concat!("airsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            username: account.username().to_string(),
            password: RwLock::new(password),
            device_id: account.device_id(),
            device_type: account.device_type.clone(),
        })
    }

    /// Replace the password used for subsequent requests.
    pub async fn set_password(&self, password: String) {
        *self.password.write().await = password;
    }

    fn request_url(&self, command: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("Cmd", command)
            .append_pair("User", &self.username)
            .append_pair("DeviceId", &self.device_id)
            .append_pair("DeviceType", &self.device_type);
        url
    }

    async fn send(
        &self,
        request: &WireRequest,
        timeout: Duration,
    ) -> Result<WireResponse, TransportError> {
        let method = match request.method {
            Method::Post => reqwest::Method::POST,
            Method::Options => reqwest::Method::OPTIONS,
        };
        let password = self.password.read().await.clone();

        let mut builder = self
            .client
            .request(method, self.request_url(request.command))
            .timeout(timeout)
            .basic_auth(&self.username, Some(password));
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, request.content_type)
                .body(body.clone());
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?.to_vec();

        Ok(WireResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Io(error.to_string())
    }
}

impl Transport for HttpTransport {
    fn execute<'a>(
        &'a self,
        request: &'a WireRequest,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<WireResponse, TransportError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransportError::Cancelled),
                result = self.send(request, timeout) => result,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_carries_device_identity() {
        let account = AccountConfig::for_tests(1, "user@example.com");
        let transport = HttpTransport::new(&account, "secret".to_string()).unwrap();

        let url = transport.request_url("FolderCreate");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert_eq!(url.scheme(), "https");
        assert_eq!(url.path(), "/Microsoft-Server-ActiveSync");
        assert_eq!(pairs[0], ("Cmd".to_string(), "FolderCreate".to_string()));
        assert_eq!(pairs[1], ("User".to_string(), "user@example.com".to_string()));
        assert_eq!(pairs[2].1, account.device_id());
        assert_eq!(pairs[3], ("DeviceType".to_string(), "airsync".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let account = AccountConfig::for_tests(1, "user@example.com");
        let transport = HttpTransport::new(&account, "secret".to_string()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = WireRequest::new(Method::Options, "Options", "application/json");
        let result = transport
            .execute(&request, Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(result, Err(TransportError::Cancelled));
    }
}
