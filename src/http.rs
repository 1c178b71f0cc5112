use anyhow::{anyhow, Result};
use reqwest::{
    header,
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder, StatusCode,
};
use serde_json::Value;
use tokio::time::Duration;
use tokio_retry::{strategy::FixedInterval, Retry};
use url::form_urlencoded;

use crate::{
    analytics::CountsByFlag,
    models::{ContextAttributes, RequestAttributes},
};

/// The environment variable to change the default timeout for tonga requests.
const TONGA_TIMEOUT_MS: &str = "TONGA_TIMEOUT_MS";

/// Percent-encodes the context attributes as a form-encoded query string.
/// Empty attributes produce an empty string, anything else starts with `?`.
pub(crate) fn build_query_string(attrs: &ContextAttributes) -> String {
    if attrs.is_empty() {
        return String::new();
    }
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(attrs.iter())
        .finish();
    format!("?{encoded}")
}

/// Turns request attributes into `X-Tonga-<key>` headers. Attributes with a
/// `None` value produce no header at all.
pub(crate) fn build_headers(attrs: &RequestAttributes) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in attrs {
        let Some(value) = value else { continue };
        let name = HeaderName::from_bytes(format!("x-tonga-{key}").as_bytes())
            .map_err(|err| anyhow!("invalid request attribute name {key:?}: {err}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| anyhow!("invalid request attribute value for {key:?}: {err}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn create_http_connection_client(default_headers: HeaderMap) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.extend(default_headers);
    let timeout = std::env::var(TONGA_TIMEOUT_MS)
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u64>()
        .unwrap_or(3000);
    ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(60)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .timeout(Duration::from_millis(timeout))
        .default_headers(headers)
        .build()
        .map_err(|err| anyhow!("failed to build the http client: {err}"))
}

/// HTTP layer of the client: owns the endpoint URL formats, the per-client
/// query string and headers, and the retry policy for flag fetches.
#[derive(Clone)]
pub(crate) struct TongaHttpClient {
    server_url: String,
    query_string: String,
    retries: u32,
    retry_delay: Duration,
    http_client: Client,
}

impl TongaHttpClient {
    pub fn new(
        server_url: String,
        context_attributes: &ContextAttributes,
        request_attributes: &RequestAttributes,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        let http_client = create_http_connection_client(build_headers(request_attributes)?)?;
        Ok(Self {
            server_url,
            query_string: build_query_string(context_attributes),
            retries,
            retry_delay,
            http_client,
        })
    }

    /// Fetches a single flag. `Ok(None)` is a definitive 404 (flag absent),
    /// returned without retrying.
    pub async fn get_flag_value(&self, flag: &str) -> Result<Option<Value>> {
        let url = format!(
            "{}/flag_value/{}{}",
            self.server_url, flag, self.query_string
        );
        self.get_json(&url).await
    }

    /// Fetches the full flag tree for bulk pre-fetch. `Ok(None)` on 404,
    /// which callers treat as an empty tree.
    pub async fn get_all_flag_values(&self) -> Result<Option<Value>> {
        let url = format!("{}/all_flags_values{}", self.server_url, self.query_string);
        self.get_json(&url).await
    }

    /// GET with bounded fixed-delay retries on transport errors and non-2xx
    /// statuses other than 404. The body is parsed after the retry loop so a
    /// malformed body is a parse error, not another retry.
    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        let strategy =
            FixedInterval::from_millis(self.retry_delay.as_millis() as u64).take(self.retries as usize);
        let body = Retry::spawn(strategy, || async move {
            let response = self
                .http_client
                .get(url)
                .send()
                .await
                .map_err(|err| anyhow!("failed to send request: {err}"))?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => {
                    let text = response
                        .text()
                        .await
                        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
                    Ok(Some(text))
                }
                status => Err(anyhow!("tonga server error: {status}")),
            }
        })
        .await?;

        match body {
            None => Ok(None),
            Some(text) => {
                let parsed = serde_json::from_str(&text)
                    .map_err(|err| anyhow!("error parsing flag response: {err}"))?;
                Ok(Some(parsed))
            }
        }
    }

    /// Reports aggregated usage counts. Best effort: not retried, any 2xx
    /// accepted, the response body ignored.
    pub async fn post_analytics(&self, counts: &CountsByFlag) -> Result<()> {
        let url = format!("{}/update_analytics{}", self.server_url, self.query_string);
        let response = self
            .http_client
            .post(url)
            .json(counts)
            .send()
            .await
            .map_err(|err| anyhow!("failed to send request: {err}"))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(anyhow!("tonga server error: {status}")),
        }
    }
}
