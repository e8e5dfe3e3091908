//! Background batching of converted spans.
//!
//! Spans are handed to a worker thread over a channel. The worker groups them into
//! bundles and folds every bundle into one or more agent requests, uploading a
//! request as soon as it grows past the flush threshold.

use opentelemetry::{otel_debug, otel_error, otel_warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::exporter::model::{Error, Span};
use crate::exporter::request::{TraceAgentRequest, FLUSH_THRESHOLD};
use crate::exporter::uploader::Uploader;

/// Default delay after which buffered spans are uploaded.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Default number of buffered spans that triggers an upload.
pub const DEFAULT_BUNDLE_COUNT_THRESHOLD: usize = 512;
/// Default number of spans the exporter buffers before dropping new ones.
pub const DEFAULT_BUFFERED_SPAN_LIMIT: usize = 1_000_000_000;

const BUNDLER_THREAD_NAME: &str = "OpenTelemetry.Datadog.Bundler";

/// Batching settings of the exporter.
#[derive(Debug, Clone)]
pub(crate) struct BundlerConfig {
    /// Upload buffered spans at least this often.
    pub(crate) flush_interval: Duration,
    /// Upload as soon as this many spans are buffered.
    pub(crate) bundle_count_threshold: usize,
    /// Upload a request once its payload is larger than this many bytes.
    pub(crate) flush_threshold: usize,
    /// Spans accepted but not yet uploaded, past which new spans are dropped.
    pub(crate) buffered_span_limit: usize,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        BundlerConfig {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            bundle_count_threshold: DEFAULT_BUNDLE_COUNT_THRESHOLD,
            flush_threshold: FLUSH_THRESHOLD,
            buffered_span_limit: DEFAULT_BUFFERED_SPAN_LIMIT,
        }
    }
}

enum BundlerMessage {
    Spans(Vec<Span>),
    Flush(std_mpsc::SyncSender<()>),
    Shutdown(std_mpsc::SyncSender<()>),
}

/// Outcome of folding one bundle into agent requests.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct DrainSummary {
    /// Upload attempts, failed ones included.
    pub(crate) uploads: usize,
    /// Spans that were not delivered.
    pub(crate) dropped: usize,
    /// Sampling rates from the last successful upload.
    pub(crate) rates: Option<HashMap<String, f64>>,
}

/// Handle to the bundler worker.
///
/// Dropping the handle closes the channel. The worker then uploads what it still
/// holds and exits on its own.
#[derive(Debug)]
pub(crate) struct Bundler {
    sender: mpsc::UnboundedSender<BundlerMessage>,
    buffered: Arc<AtomicUsize>,
    buffered_span_limit: usize,
    rates: Arc<Mutex<HashMap<String, f64>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
}

impl Bundler {
    /// Starts the worker thread.
    pub(crate) fn spawn<U: Uploader>(uploader: U, mut config: BundlerConfig) -> Result<Self, Error> {
        // tokio intervals cannot tick at a zero period
        if config.flush_interval.is_zero() {
            config.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        config.bundle_count_threshold = config.bundle_count_threshold.max(1);

        let (sender, receiver) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let rates = Arc::new(Mutex::new(HashMap::new()));
        let buffered_span_limit = config.buffered_span_limit;

        let worker = BundlerWorker {
            receiver,
            uploader,
            config,
            bundle: Vec::new(),
            buffered: buffered.clone(),
            rates: rates.clone(),
        };

        let handle = thread::Builder::new()
            .name(BUNDLER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        otel_error!(
                            name: "Datadog.Bundler.RuntimeCreationFailed",
                            error = err.to_string()
                        );
                        return;
                    }
                };
                runtime.block_on(worker.run());
            })
            .map_err(|err| Error::Other(format!("failed to spawn bundler thread: {err}")))?;

        otel_debug!(
            name: "Datadog.Bundler.Started",
            buffered_span_limit = buffered_span_limit
        );

        Ok(Bundler {
            sender,
            buffered,
            buffered_span_limit,
            rates,
            handle: Mutex::new(Some(handle)),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Queues spans for upload. Each span weighs one against the buffered span
    /// limit; spans past the limit are dropped.
    pub(crate) fn add(&self, spans: Vec<Span>) {
        if spans.is_empty() {
            return;
        }
        let count = spans.len();
        if self.is_shutdown.load(Ordering::Relaxed) {
            otel_debug!(name: "Datadog.Bundler.SpansAfterShutdown", dropped = count);
            return;
        }

        let buffered = self.buffered.fetch_add(count, Ordering::Relaxed) + count;
        if buffered > self.buffered_span_limit {
            self.buffered.fetch_sub(count, Ordering::Relaxed);
            otel_warn!(
                name: "Datadog.Bundler.BufferFull",
                dropped = count,
                buffered_span_limit = self.buffered_span_limit
            );
            return;
        }

        if self.sender.send(BundlerMessage::Spans(spans)).is_err() {
            self.buffered.fetch_sub(count, Ordering::Relaxed);
            otel_warn!(name: "Datadog.Bundler.WorkerGone", dropped = count);
        }
    }

    /// Number of spans accepted and not uploaded yet.
    pub(crate) fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Sampling rates from the agent's latest successful response.
    pub(crate) fn rates(&self) -> HashMap<String, f64> {
        self.rates
            .lock()
            .map(|rates| rates.clone())
            .unwrap_or_default()
    }

    /// Blocks until every span queued before the call has been uploaded.
    pub(crate) fn flush(&self, timeout: Duration) -> Result<(), Error> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(Error::AlreadyShutdown);
        }
        let (ack, done) = std_mpsc::sync_channel(1);
        self.sender
            .send(BundlerMessage::Flush(ack))
            .map_err(|_| Error::AlreadyShutdown)?;
        wait(done, timeout, "flush")
    }

    /// Uploads what is left and stops the worker.
    pub(crate) fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyShutdown);
        }
        let (ack, done) = std_mpsc::sync_channel(1);
        self.sender
            .send(BundlerMessage::Shutdown(ack))
            .map_err(|_| Error::AlreadyShutdown)?;
        wait(done, timeout, "shutdown")?;

        let handle = self.handle.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                otel_warn!(name: "Datadog.Bundler.WorkerPanicked");
            }
        }
        Ok(())
    }
}

fn wait(done: std_mpsc::Receiver<()>, timeout: Duration, operation: &str) -> Result<(), Error> {
    match done.recv_timeout(timeout) {
        Ok(()) => Ok(()),
        Err(std_mpsc::RecvTimeoutError::Timeout) => Err(Error::Other(format!(
            "{operation} timed out after {timeout:?}"
        ))),
        Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(Error::AlreadyShutdown),
    }
}

struct BundlerWorker<U> {
    receiver: mpsc::UnboundedReceiver<BundlerMessage>,
    uploader: U,
    config: BundlerConfig,
    bundle: Vec<Span>,
    buffered: Arc<AtomicUsize>,
    rates: Arc<Mutex<HashMap<String, f64>>>,
}

impl<U: Uploader> BundlerWorker<U> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                message = self.receiver.recv() => match message {
                    Some(BundlerMessage::Spans(spans)) => {
                        self.bundle.extend(spans);
                        if self.bundle.len() >= self.config.bundle_count_threshold {
                            self.drain().await;
                        }
                    }
                    Some(BundlerMessage::Flush(ack)) => {
                        self.drain().await;
                        let _ = ack.send(());
                    }
                    Some(BundlerMessage::Shutdown(ack)) => {
                        self.drain().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
                _ = ticker.tick() => self.drain().await,
            }
        }

        otel_debug!(name: "Datadog.Bundler.Stopped");
    }

    async fn drain(&mut self) {
        if self.bundle.is_empty() {
            return;
        }
        let spans = std::mem::take(&mut self.bundle);
        let summary = upload_spans(&self.uploader, &spans, self.config.flush_threshold).await;
        self.buffered.fetch_sub(spans.len(), Ordering::Relaxed);

        if let Some(rates) = summary.rates {
            if let Ok(mut current) = self.rates.lock() {
                *current = rates;
            }
        }

        otel_debug!(
            name: "Datadog.Bundler.Drained",
            spans = spans.len(),
            uploads = summary.uploads,
            dropped = summary.dropped
        );
    }
}

/// Folds `spans` into agent requests and uploads them.
///
/// A request is uploaded and reset as soon as its size exceeds `flush_threshold`,
/// and whatever remains is uploaded at the end. Spans that cannot be added are
/// skipped. A transport or agent error abandons the rest of the bundle, while an
/// unreadable response only loses the sampling rates.
pub(crate) async fn upload_spans<U: Uploader>(
    uploader: &U,
    spans: &[Span],
    flush_threshold: usize,
) -> DrainSummary {
    let mut summary = DrainSummary::default();
    let mut request = TraceAgentRequest::new();

    for (index, span) in spans.iter().enumerate() {
        if let Err(err) = request.add(span) {
            summary.dropped += 1;
            otel_warn!(
                name: "Datadog.Bundler.SpanDropped",
                trace_id = span.trace_id,
                span_id = span.span_id,
                error = err.to_string()
            );
            continue;
        }

        if request.size() > flush_threshold
            && !send_request(uploader, &mut request, &mut summary).await
        {
            summary.dropped += spans.len() - index - 1;
            return summary;
        }
    }

    if !request.is_empty() {
        send_request(uploader, &mut request, &mut summary).await;
    }

    summary
}

/// Uploads and resets `request`. Returns `false` when the rest of the bundle
/// should be abandoned.
async fn send_request<U: Uploader>(
    uploader: &U,
    request: &mut TraceAgentRequest,
    summary: &mut DrainSummary,
) -> bool {
    let span_count = request.span_count() as usize;
    let result = uploader
        .upload(request.buffer(), request.trace_count())
        .await;
    request.reset();
    summary.uploads += 1;

    match result {
        Ok(response) => {
            summary.rates = Some(response.rates);
            true
        }
        Err(Error::MalformedResponse(err)) => {
            otel_warn!(
                name: "Datadog.Bundler.MalformedResponse",
                error = err.to_string()
            );
            true
        }
        Err(err) => {
            summary.dropped += span_count;
            otel_error!(
                name: "Datadog.Bundler.UploadFailed",
                spans = span_count,
                error = err.to_string()
            );
            false
        }
    }
}
