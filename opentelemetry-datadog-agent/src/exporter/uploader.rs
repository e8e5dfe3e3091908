use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use opentelemetry::otel_debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::exporter::model::Error;

/// Path of the v0.4 traces endpoint, relative to the agent endpoint.
pub const API_PATH: &str = "v0.4/traces";

const TRACE_COUNT_HEADER: HeaderName = HeaderName::from_static("x-datadog-trace-count");
const DATADOG_META_LANG_HEADER: HeaderName = HeaderName::from_static("datadog-meta-lang");
const DATADOG_META_LANG_VERSION_HEADER: HeaderName =
    HeaderName::from_static("datadog-meta-lang-version");
const DATADOG_META_LANG_INTERPRETER_HEADER: HeaderName =
    HeaderName::from_static("datadog-meta-lang-interpreter");
const DATADOG_META_TRACER_VERSION_HEADER: HeaderName =
    HeaderName::from_static("datadog-meta-tracer-version");

const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";
const TRACER_VERSION: &str = concat!("OTEL/", env!("CARGO_PKG_VERSION"));

// The idle pool timeout must stay the longest of these.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const MAX_IDLE_CONNECTIONS: usize = 100;

/// Response from the Datadog agent after a successful upload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TraceAgentResponse {
    /// Sampling rate per `service:<name>,env:<env>` key.
    #[serde(rename = "rate_by_service", default)]
    pub rates: HashMap<String, f64>,
}

/// Sends encoded traces to a Datadog agent.
pub trait Uploader: Debug + Send + Sync + 'static {
    /// Uploads a msgpack payload holding `trace_count` traces.
    fn upload(
        &self,
        payload: Vec<u8>,
        trace_count: usize,
    ) -> impl Future<Output = Result<TraceAgentResponse, Error>> + Send;
}

/// [`Uploader`] posting to the agent's `/v0.4/traces` endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct TraceAgentClient {
    url: Url,
    client: reqwest::Client,
    headers: HeaderMap,
}

impl TraceAgentClient {
    /// Creates a client for the agent listening at `agent_endpoint`, e.g.
    /// `http://localhost:8126`.
    pub fn new(agent_endpoint: &str) -> Result<Self, Error> {
        Self::with_client(agent_endpoint, default_http_client()?)
    }

    /// Creates a client sending requests through `client`.
    pub fn with_client(agent_endpoint: &str, client: reqwest::Client) -> Result<Self, Error> {
        Ok(TraceAgentClient {
            url: traces_url(agent_endpoint)?,
            client,
            headers: default_headers(),
        })
    }

    /// Full url of the traces endpoint.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Uploader for TraceAgentClient {
    async fn upload(
        &self,
        payload: Vec<u8>,
        trace_count: usize,
    ) -> Result<TraceAgentResponse, Error> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(TRACE_COUNT_HEADER, trace_count)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        // Always read the body to the end so the connection can go back to the pool.
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) if status.as_u16() < 400 => return Err(Error::Transport(err)),
            Err(err) => {
                otel_debug!(
                    name: "Datadog.Uploader.ResponseBodyUnreadable",
                    status = status.as_u16(),
                    error = err.to_string()
                );
                Default::default()
            }
        };

        if status.as_u16() >= 400 {
            return Err(Error::Agent {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

/// Builds the http client used when none is provided.
pub(crate) fn default_http_client() -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(KEEP_ALIVE)
        .timeout(REQUEST_TIMEOUT)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
        .build()
        .map_err(Error::Transport)
}

fn traces_url(agent_endpoint: &str) -> Result<Url, Error> {
    let mut url = Url::parse(agent_endpoint)?;
    if url.cannot_be_a_base() {
        return Err(Error::InvalidUri(agent_endpoint.to_string()));
    }
    // keep a path prefix such as a proxy mount point
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url.join(API_PATH)?)
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(5);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_MSGPACK));
    headers.insert(DATADOG_META_LANG_HEADER, HeaderValue::from_static("rust"));
    headers.insert(
        DATADOG_META_LANG_VERSION_HEADER,
        HeaderValue::from_static(option_env!("DD_RUSTC_VERSION").unwrap_or("unknown")),
    );
    let interpreter = format!(
        "rustc-{}-{}",
        std::env::consts::ARCH,
        std::env::consts::OS
    );
    if let Ok(value) = HeaderValue::from_str(&interpreter) {
        headers.insert(DATADOG_META_LANG_INTERPRETER_HEADER, value);
    }
    headers.insert(
        DATADOG_META_TRACER_VERSION_HEADER,
        HeaderValue::from_static(TRACER_VERSION),
    );
    headers
}
