//! The Datadog span model, its conversion from OpenTelemetry spans, and the
//! errors of this crate.

use indexmap::IndexMap;
use opentelemetry::trace::{SpanId, SpanKind, Status};
use opentelemetry::Value;
use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::ExportError;
use std::time::SystemTime;
use url::ParseError;

use self::msgpack::MSGPACK_MAX_LENGTH;

pub mod msgpack;
pub(crate) mod v04;

// https://github.com/DataDog/dd-trace-js/blob/c89a35f7d27beb4a60165409376e170eacb194c5/packages/dd-trace/src/constants.js#L4
static SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";

static SPAN_TYPE_KEY: &str = "span.type";
static ERROR_MESSAGE_KEY: &str = "error.msg";

/// Value of the Datadog `name` field for every exported span.
pub const SPAN_NAME: &str = "opentelemetry";

/// A span as the Datadog agent's v0.4 API expects it.
///
/// `meta` and `metrics` keep insertion order so that encoding the same span twice
/// produces the same bytes. Both are left out of the payload when empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Span {
    /// Span identifier.
    pub span_id: u64,
    /// Low 64 bits of the OpenTelemetry trace id.
    pub trace_id: u64,
    /// Parent span identifier, `0` for a root span.
    pub parent_id: u64,
    /// Datadog operation name, always [`SPAN_NAME`] for converted spans.
    pub name: String,
    /// Service the span belongs to.
    pub service: String,
    /// OpenTelemetry span name.
    pub resource: String,
    /// `client`, `server`, `producer`, `consumer` or empty.
    pub r#type: String,
    /// Start time in nanoseconds since the unix epoch.
    pub start: i64,
    /// Duration in nanoseconds.
    pub duration: i64,
    /// String tags.
    pub meta: IndexMap<String, String>,
    /// Numeric tags.
    pub metrics: IndexMap<String, f64>,
    /// `1` when the span recorded an error.
    pub error: i32,
}

impl Span {
    /// Returns `true` if the span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }

    /// Maps a finished OpenTelemetry span onto the Datadog span model.
    ///
    /// |Datadog field|source|
    /// |-------------|------|
    /// |trace_id|low 64 bits of the trace id|
    /// |span_id / parent_id|span ids, parent `0` when invalid|
    /// |name|[`SPAN_NAME`]|
    /// |resource|span name|
    /// |type|`span.type` attribute, otherwise derived from the span kind|
    /// |meta|string, boolean and array attributes, `error.msg`|
    /// |metrics|integer and float attributes, `_sampling_priority_v1`|
    /// |error|`1` for [`Status::Error`]|
    pub fn from_span_data(span: &SpanData, service: &str) -> Self {
        // Safe until the year 2262 when Datadog will need to change their API
        let start = span
            .start_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|x| x.as_nanos() as i64)
            .unwrap_or(0);

        let duration = span
            .end_time
            .duration_since(span.start_time)
            .map(|x| x.as_nanos() as i64)
            .unwrap_or(0);

        let parent_id = if span.parent_span_id == SpanId::INVALID {
            0
        } else {
            u64::from_be_bytes(span.parent_span_id.to_bytes())
        };

        let mut span_type = match span.span_kind {
            SpanKind::Client => "client",
            SpanKind::Server => "server",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "",
        }
        .to_string();

        let mut meta = IndexMap::with_capacity(span.attributes.len());
        let mut metrics = IndexMap::with_capacity(1);
        for kv in &span.attributes {
            let key = kv.key.as_str();
            if key == SPAN_TYPE_KEY {
                span_type = kv.value.as_str().into_owned();
                continue;
            }
            match &kv.value {
                Value::I64(value) => {
                    metrics.insert(key.to_string(), *value as f64);
                }
                Value::F64(value) => {
                    metrics.insert(key.to_string(), *value);
                }
                value => {
                    meta.insert(key.to_string(), value.as_str().into_owned());
                }
            }
        }

        let error = match &span.status {
            Status::Error { description } => {
                if !description.is_empty() {
                    meta.insert(ERROR_MESSAGE_KEY.to_string(), description.to_string());
                }
                1
            }
            _ => 0,
        };

        metrics.insert(
            SAMPLING_PRIORITY_KEY.to_string(),
            if span.span_context.is_sampled() {
                1.0
            } else {
                0.0
            },
        );

        Span {
            span_id: u64::from_be_bytes(span.span_context.span_id().to_bytes()),
            trace_id: u128::from_be_bytes(span.span_context.trace_id().to_bytes()) as u64,
            parent_id,
            name: SPAN_NAME.to_string(),
            service: service.to_string(),
            resource: span.name.to_string(),
            r#type: span_type,
            start,
            duration,
            meta,
            metrics,
            error,
        }
    }
}

/// Wrap type for errors from the Datadog agent exporter
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A msgpack array would exceed its maximum length
    #[error("maximum msgpack array length ({max}) exceeded", max = MSGPACK_MAX_LENGTH)]
    Overflow,
    /// A single encoded span does not fit in one agent request
    #[error("encoded span of {size} bytes exceeds the {limit} byte span limit")]
    SpanTooLarge {
        /// Encoded size of the rejected span
        size: usize,
        /// Largest accepted span encoding
        limit: usize,
    },
    /// Message pack error
    #[error("message pack error")]
    MessagePackError,
    /// The request never got a response from the agent
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    /// The agent answered with an error status
    #[error("[{status} {reason}] {body}")]
    Agent {
        /// HTTP status code
        status: u16,
        /// Canonical reason phrase of the status
        reason: String,
        /// Response body
        body: String,
    },
    /// The agent accepted the payload but its reply could not be parsed
    #[error("malformed agent response: {0}")]
    MalformedResponse(#[from] serde_json::Error),
    /// The Uri was invalid
    #[error("invalid url {0}")]
    InvalidUri(String),
    /// The exporter no longer accepts spans
    #[error("exporter is already shut down")]
    AlreadyShutdown,
    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl ExportError for Error {
    fn exporter_name(&self) -> &'static str {
        "datadog"
    }
}

impl From<rmp::encode::ValueWriteError> for Error {
    fn from(_: rmp::encode::ValueWriteError) -> Self {
        Self::MessagePackError
    }
}

impl From<url::ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Self::InvalidUri(err.to_string())
    }
}
