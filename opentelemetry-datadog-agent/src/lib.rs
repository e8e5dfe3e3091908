//! # OpenTelemetry Datadog Agent Exporter
//!
//! Batches OpenTelemetry spans and sends them to a [Datadog agent] over the v0.4
//! msgpack API.
//!
//! Finished spans are converted into the Datadog span model as soon as they are
//! exported and queued for a background worker. The worker uploads when enough
//! spans are buffered, when the flush interval elapses, or when a request grows past
//! the flush threshold, so that no payload goes over the agent's 10MB limit.
//!
//! [Datadog agent]: https://docs.datadoghq.com/agent/
//!
//! ## Quickstart
//!
//! Start a Datadog agent locally, listening for traces on port 8126:
//!
//! ```shell
//! $ docker run -d -v /var/run/docker.sock:/var/run/docker.sock:ro \
//!     -v /proc/:/host/proc/:ro \
//!     -v /sys/fs/cgroup/:/host/sys/fs/cgroup:ro \
//!     -p 127.0.0.1:8126:8126/tcp \
//!     -e DD_API_KEY="<DATADOG_API_KEY>" \
//!     -e DD_APM_ENABLED=true \
//!     datadog/agent:latest
//! ```
//!
//! Then install the exporter on a tracer provider:
//!
//! ```no_run
//! use opentelemetry::global;
//! use opentelemetry::trace::Tracer;
//! use opentelemetry_datadog_agent::DatadogExporter;
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let exporter = DatadogExporter::builder()
//!         .with_service_name("my_app")
//!         .with_agent_endpoint("http://localhost:8126")
//!         .build()?;
//!
//!     let provider = SdkTracerProvider::builder()
//!         .with_simple_exporter(exporter)
//!         .build();
//!     global::set_tracer_provider(provider.clone());
//!
//!     global::tracer("my_app").in_span("doing_work", |_cx| {
//!         // Traced app logic here...
//!     });
//!
//!     provider.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! The exporter batches on its own, so a simple span processor is enough.
//! Shutting the provider down uploads whatever is still buffered. A simple
//! processor never forwards `SdkTracerProvider::force_flush` to its exporter
//! though: register the exporter with `with_batch_exporter` when the
//! application needs to flush without shutting down.
//!
//! ## Configuration
//!
//! Anything not set on [`DatadogExporterBuilder`] is read from the environment:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `DD_TRACE_AGENT_URL` | agent endpoint | `http://$DD_AGENT_HOST:$DD_TRACE_AGENT_PORT` |
//! | `DD_AGENT_HOST` | agent host | `localhost` |
//! | `DD_TRACE_AGENT_PORT` | agent trace port | `8126` |
//! | `DD_SERVICE` | service name | `service.name` of the resource, then `unknown_service` |
//!
//! ## Internal logs
//!
//! With the default `internal-logs` feature the exporter reports dropped spans and
//! failed uploads through `tracing`, under the `opentelemetry-datadog-agent` target.
#![warn(missing_debug_implementations, missing_docs)]

mod exporter;

pub use exporter::{
    model::{self, msgpack, Span},
    DatadogExporter, DatadogExporterBuilder, Error, SpanPackets, TraceAgentClient,
    TraceAgentRequest, TraceAgentResponse, Uploader, API_PATH, DEFAULT_AGENT_HOST,
    DEFAULT_AGENT_PORT, DEFAULT_BUFFERED_SPAN_LIMIT, DEFAULT_BUNDLE_COUNT_THRESHOLD,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_TIMEOUT, DEFAULT_SERVICE_NAME, FLUSH_THRESHOLD,
    MAX_SPAN_SIZE, PACKET_LIMIT,
};
