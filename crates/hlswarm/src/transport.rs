// Network capability used by every simulated client.
//
// A single pooled reqwest client is shared by the whole fleet. Redirects are
// never followed: clients need to see them to apply their redirect policy.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{HOST, HeaderValue};
use tracing::trace;
use url::Url;

use crate::config::TransportConfig;
use crate::error::{SwarmError, TransportError};

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Drain the body without keeping it (media segments)
    pub discard_body: bool,
}

impl FetchOptions {
    pub fn discard_body() -> Self {
        Self { discard_body: true }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    /// Empty when the body was discarded
    pub body: Bytes,
    pub body_len: u64,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            body_len: body.len() as u64,
            body,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_redirect(&self) -> bool {
        is_redirect(self.status)
    }
}

/// Redirect statuses that end a session instead of being followed.
pub fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Issues one GET request. Dropping the returned future cancels the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &Url, options: FetchOptions)
    -> Result<FetchResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    host_header: Option<HeaderValue>,
}

impl ReqwestTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, SwarmError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .local_address(config.bind_address)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        let host_header = config
            .host_header
            .as_deref()
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|e| SwarmError::configuration(format!("invalid host header: {e}")))?;

        Ok(Self {
            client,
            host_header,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(
        &self,
        url: &Url,
        options: FetchOptions,
    ) -> Result<FetchResponse, TransportError> {
        let mut request = self.client.get(url.clone());
        if let Some(host) = &self.host_header {
            request = request.header(HOST, host.clone());
        }

        let mut response = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(url.as_str(), e))?;
        let status = response.status();

        if options.discard_body {
            let mut body_len = 0u64;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| TransportError::from_reqwest(url.as_str(), e))?
            {
                body_len += chunk.len() as u64;
            }
            trace!(%url, %status, body_len, "Drained response body");
            return Ok(FetchResponse {
                status,
                body: Bytes::new(),
                body_len,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(url.as_str(), e))?;
        Ok(FetchResponse::new(status, body))
    }
}
