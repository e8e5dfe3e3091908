mod bundler;
mod config;
pub mod model;
mod request;
mod uploader;

pub use bundler::{
    DEFAULT_BUFFERED_SPAN_LIMIT, DEFAULT_BUNDLE_COUNT_THRESHOLD, DEFAULT_FLUSH_INTERVAL,
};
pub use config::{DEFAULT_AGENT_HOST, DEFAULT_AGENT_PORT, DEFAULT_SERVICE_NAME};
pub use model::Error;
pub use request::{SpanPackets, TraceAgentRequest, FLUSH_THRESHOLD, MAX_SPAN_SIZE, PACKET_LIMIT};
pub use uploader::{TraceAgentClient, TraceAgentResponse, Uploader, API_PATH};

use opentelemetry::otel_debug;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions as semconv;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use self::bundler::{Bundler, BundlerConfig};
use self::model::Span;

/// Default time [`DatadogExporter::flush`] and [`DatadogExporter::shutdown`] wait
/// for the background worker.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Exports OpenTelemetry spans to a Datadog agent.
///
/// Spans are converted right away and handed to a background worker, which
/// batches them and uploads them to the agent's `/v0.4/traces` endpoint.
pub struct DatadogExporter {
    bundler: Bundler,
    service_name: String,
    service_name_is_explicit: bool,
    flush_timeout: Duration,
}

impl DatadogExporter {
    /// Returns a builder with default settings.
    pub fn builder() -> DatadogExporterBuilder {
        DatadogExporterBuilder::default()
    }

    /// Service name stamped on exported spans.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Converts a finished span and queues it for upload.
    pub fn export_span(&self, span: &SpanData) {
        self.bundler
            .add(vec![Span::from_span_data(span, &self.service_name)]);
    }

    /// Converts finished spans and queues them for upload.
    pub fn export_spans(&self, spans: &[SpanData]) {
        let spans = spans
            .iter()
            .map(|span| Span::from_span_data(span, &self.service_name))
            .collect();
        self.bundler.add(spans);
    }

    /// Blocks until every span exported so far has been sent to the agent.
    pub fn flush(&self) -> Result<(), Error> {
        self.bundler.flush(self.flush_timeout)
    }

    /// Sends what is still buffered and stops the background worker.
    ///
    /// Spans exported afterwards are dropped.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.bundler.shutdown(self.flush_timeout)
    }

    /// Sampling rates per `service:<name>,env:<env>` from the agent's latest
    /// successful response.
    pub fn sampling_rates(&self) -> HashMap<String, f64> {
        self.bundler.rates()
    }

    /// Number of spans accepted and not uploaded yet.
    pub fn buffered_span_count(&self) -> usize {
        self.bundler.buffered()
    }
}

impl fmt::Debug for DatadogExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatadogExporter")
            .field("service_name", &self.service_name)
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}

impl SpanExporter for DatadogExporter {
    async fn export(&self, batch: Vec<SpanData>) -> OTelSdkResult {
        self.export_spans(&batch);
        Ok(())
    }

    /// Not reached through `SdkTracerProvider::force_flush` when the exporter
    /// sits behind a simple span processor. Call [`DatadogExporter::flush`]
    /// directly, or shut the provider down, to drain buffered spans.
    fn force_flush(&mut self) -> OTelSdkResult {
        self.bundler
            .flush(self.flush_timeout)
            .map_err(|err| OTelSdkError::InternalFailure(err.to_string()))
    }

    fn shutdown_with_timeout(&mut self, timeout: Duration) -> OTelSdkResult {
        match self.bundler.shutdown(timeout) {
            Ok(()) => Ok(()),
            Err(Error::AlreadyShutdown) => Err(OTelSdkError::AlreadyShutdown),
            Err(err) => Err(OTelSdkError::InternalFailure(err.to_string())),
        }
    }

    fn shutdown(&mut self) -> OTelSdkResult {
        self.shutdown_with_timeout(self.flush_timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        if self.service_name_is_explicit {
            return;
        }
        let service_name = resource
            .iter()
            .find(|(key, _)| key.as_str() == semconv::resource::SERVICE_NAME)
            .map(|(_, value)| value.as_str().into_owned());
        if let Some(service_name) = service_name {
            otel_debug!(
                name: "Datadog.Exporter.ServiceNameFromResource",
                service_name = service_name.as_str()
            );
            self.service_name = service_name;
        }
    }
}

/// Builder for [`DatadogExporter`].
///
/// Settings left unset fall back to the `DD_TRACE_AGENT_URL`, `DD_AGENT_HOST`,
/// `DD_TRACE_AGENT_PORT` and `DD_SERVICE` environment variables, then to the
/// defaults of this crate.
#[derive(Debug, Default)]
pub struct DatadogExporterBuilder {
    service_name: Option<String>,
    agent_endpoint: Option<String>,
    client: Option<reqwest::Client>,
    bundler_config: BundlerConfig,
    flush_timeout: Option<Duration>,
}

impl DatadogExporterBuilder {
    /// Service name stamped on every span.
    pub fn with_service_name<T: Into<String>>(mut self, service_name: T) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Base url of the agent, e.g. `http://localhost:8126`.
    pub fn with_agent_endpoint<T: Into<String>>(mut self, endpoint: T) -> Self {
        self.agent_endpoint = Some(endpoint.into());
        self
    }

    /// Http client used for uploads. Its timeouts replace the defaults.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Maximum delay before buffered spans are uploaded.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.bundler_config.flush_interval = interval;
        self
    }

    /// Number of buffered spans that triggers an upload.
    pub fn with_bundle_count_threshold(mut self, count: usize) -> Self {
        self.bundler_config.bundle_count_threshold = count;
        self
    }

    /// Payload size in bytes past which a request is uploaded right away.
    ///
    /// Values above [`FLUSH_THRESHOLD`] are capped to it so that uploads stay under
    /// [`PACKET_LIMIT`].
    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.bundler_config.flush_threshold = bytes.min(FLUSH_THRESHOLD);
        self
    }

    /// Spans waiting for upload past which new spans are dropped.
    pub fn with_buffered_span_limit(mut self, limit: usize) -> Self {
        self.bundler_config.buffered_span_limit = limit;
        self
    }

    /// How long [`DatadogExporter::flush`] and [`DatadogExporter::shutdown`] wait.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    /// Builds an exporter uploading to the configured agent over HTTP.
    pub fn build(mut self) -> Result<DatadogExporter, Error> {
        let endpoint = self
            .agent_endpoint
            .take()
            .unwrap_or_else(config::agent_endpoint_from_env);
        let uploader = match self.client.take() {
            Some(client) => TraceAgentClient::with_client(&endpoint, client)?,
            None => TraceAgentClient::new(&endpoint)?,
        };
        otel_debug!(name: "Datadog.Exporter.Endpoint", url = uploader.url().as_str());
        self.build_with_uploader(uploader)
    }

    /// Builds an exporter handing its payloads to `uploader`.
    pub fn build_with_uploader<U: Uploader>(self, uploader: U) -> Result<DatadogExporter, Error> {
        let (service_name, service_name_is_explicit) =
            match self.service_name.or_else(config::service_name_from_env) {
                Some(service_name) => (service_name, true),
                None => (DEFAULT_SERVICE_NAME.to_string(), false),
            };

        Ok(DatadogExporter {
            bundler: Bundler::spawn(uploader, self.bundler_config)?,
            service_name,
            service_name_is_explicit,
            flush_timeout: self.flush_timeout.unwrap_or(DEFAULT_FLUSH_TIMEOUT),
        })
    }
}
