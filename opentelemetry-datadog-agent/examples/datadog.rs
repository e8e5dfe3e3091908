use opentelemetry::{
    global,
    trace::{Span, TraceContextExt, Tracer},
    Key, KeyValue, Value,
};
use opentelemetry_datadog_agent::DatadogExporter;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{prelude::*, EnvFilter};

fn bar() {
    let tracer = global::tracer("component-bar");
    let mut span = tracer.start("bar");
    span.set_attribute(KeyValue::new(
        Key::new("span.type"),
        Value::String("sql".into()),
    ));
    span.set_attribute(KeyValue::new(
        Key::new("sql.query"),
        Value::String("SELECT * FROM table".into()),
    ));
    thread::sleep(Duration::from_millis(6));
    span.end()
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    // Shows the exporter's own logs, e.g. RUST_LOG=opentelemetry-datadog-agent=debug
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let exporter = DatadogExporter::builder()
        .with_service_name("trace-demo")
        .with_flush_interval(Duration::from_millis(500))
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter)
        .build();
    global::set_tracer_provider(provider.clone());

    let tracer = global::tracer("component-main");
    tracer.in_span("foo", |cx| {
        let span = cx.span();
        span.set_attribute(KeyValue::new(
            Key::new("span.type"),
            Value::String("web".into()),
        ));
        span.set_attribute(KeyValue::new(
            Key::new("http.url"),
            Value::String("http://localhost:8080/foo".into()),
        ));
        span.set_attribute(KeyValue::new(
            Key::new("http.method"),
            Value::String("GET".into()),
        ));
        span.set_attribute(KeyValue::new(Key::new("http.status_code"), Value::I64(200)));

        thread::sleep(Duration::from_millis(6));
        bar();
        thread::sleep(Duration::from_millis(6));
    });

    // Uploads the spans still buffered. force_flush would not reach the
    // exporter behind a simple processor.
    provider.shutdown()?;

    Ok(())
}
