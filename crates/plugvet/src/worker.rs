//! Worker-side dispatcher.
//!
//! The supervisor side (spawning, event fan-out) lives in supervisor.rs
//! and orchestrator.rs. The worker receives batch requests on its pipe,
//! queues them FIFO, and validates each plugin in document order through
//! the external battery, streaming started/log/result events back. A
//! batch arriving mid-validation waits in the queue; batches never
//! interleave.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{PluginEntry, WorkerEvent, WorkerRequest};
use crate::descriptor::PluginDescriptor;
use crate::log_flush::LogFlusher;
use crate::validator::{PluginSource, Validator, num_failures};

/// Token on the command line that switches the executable into worker
/// mode. Shared by both ends of the spawn; it has no meaning beyond
/// recognition.
pub const WORKER_MODE_TOKEN: &str = "validatorUID";

/// True when a command line asks for worker mode.
pub fn worker_mode<S: AsRef<str>>(args: &[S]) -> bool {
    args.iter().any(|a| a.as_ref().contains(WORKER_MODE_TOKEN))
}

pub(crate) type EventWriter = Arc<
    tokio::sync::Mutex<
        FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, EnvelopeCodec<WorkerEvent>>,
    >,
>;

pub struct WorkerConfig {
    /// How often buffered battery log lines are shipped as one `log`
    /// event.
    pub flush_interval: Duration,
    /// How long to wait for the flusher task when shutting down.
    pub flush_stop_grace: Duration,
    /// Force-terminate the process as soon as the supervisor's end
    /// closes, even mid-validation. Set for real worker processes;
    /// hosting state is not recoverable from a lost supervisor. Left off
    /// when the worker is embedded in tests.
    pub hard_exit_on_disconnect: bool,
    /// Hook run after the pipe is attached, before `connected` is emitted
    /// (file logger setup and similar).
    pub on_initialised: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(200),
            flush_stop_grace: Duration::from_secs(2),
            hard_exit_on_disconnect: false,
            on_initialised: None,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_hard_exit_on_disconnect(mut self, hard_exit: bool) -> Self {
        self.hard_exit_on_disconnect = hard_exit;
        self
    }

    pub fn with_init_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_initialised = Some(Box::new(hook));
        self
    }
}

/// Installs a stderr tracing subscriber for a worker process.
///
/// Diagnostics must stay off stdout, which carries the message stream.
pub fn init_worker_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Entry point for a spawned worker process: attaches to stdio, installs
/// crash containment, and serves until the supervisor goes away.
pub async fn run_worker_process(
    validator: Arc<dyn Validator>,
    config: WorkerConfig,
) -> io::Result<()> {
    crate::signal_guard::install_fatal_signal_guard();
    crate::signal_guard::install_panic_abort_hook();
    init_worker_logging();

    let config = WorkerConfig {
        hard_exit_on_disconnect: true,
        ..config
    };
    run_worker(tokio::io::stdin(), tokio::io::stdout(), validator, config).await
}

/// Runs the worker dispatch loop over an arbitrary duplex transport.
///
/// Emits `connected` first, then serves queued batches until the
/// transport closes. Returns once the supervisor's end closes and any
/// in-flight batch has drained, unless `hard_exit_on_disconnect` is set,
/// in which case the process dies the moment the pipe closes, even with
/// a validation still running. Closing the pipe is the supervisor's only
/// cancellation mechanism; a hung plugin must not outlive it.
pub async fn run_worker<R, W>(
    reader: R,
    writer: W,
    validator: Arc<dyn Validator>,
    mut config: WorkerConfig,
) -> io::Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut request_reader = FramedRead::new(reader, EnvelopeCodec::<WorkerRequest>::new());
    let writer: EventWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
        EnvelopeCodec::new(),
    )));

    let connected = Arc::new(AtomicBool::new(false));
    let flusher = LogFlusher::start(
        Arc::clone(&writer),
        Arc::clone(&connected),
        config.flush_interval,
        config.flush_stop_grace,
    );
    let hard_exit = config.hard_exit_on_disconnect;

    if let Some(hook) = config.on_initialised.take() {
        hook();
    }

    connected.store(true, Ordering::Release);
    {
        let mut w = writer.lock().await;
        w.send(WorkerEvent::Connected).await?;
    }

    // Intake decodes and enqueues only; validation happens on this task,
    // so queued batches drain strictly FIFO and never interleave. The
    // intake task also owns the disconnect policy: it sees the pipe close
    // regardless of what the dispatcher is blocked on.
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<WorkerRequest>();
    let intake = tokio::spawn(async move {
        loop {
            match request_reader.next().await {
                Some(Ok(request)) => {
                    tracing::trace!(target: "plugvet::wire", request = %request.diagnostic(), "received");
                    if queue_tx.send(request).is_err() {
                        // Dispatcher is gone; nothing left to deliver to.
                        return;
                    }
                }
                Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!(error = %e, "dropping malformed envelope");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "request pipe error");
                    break;
                }
                None => break,
            }
        }

        if hard_exit {
            // The supervisor is gone and hosting state is not recoverable
            // without it; die immediately, even mid-validation, rather
            // than attempting graceful cleanup.
            tracing::info!("supervisor connection closed, terminating");
            std::process::exit(0);
        }
    });

    let result = async {
        while let Some(request) = queue_rx.recv().await {
            process_batch(request, &validator, &writer, &flusher).await?;
        }
        Ok(())
    }
    .await;

    // Closing the queue unblocks the intake task if dispatch bailed early.
    drop(queue_rx);
    let _ = intake.await;

    flusher.stop().await;
    result
}

async fn process_batch(
    request: WorkerRequest,
    validator: &Arc<dyn Validator>,
    writer: &EventWriter,
    flusher: &LogFlusher,
) -> io::Result<()> {
    let strictness = request.strictness();
    let WorkerRequest::Plugins { plugins, .. } = request;

    for entry in plugins {
        let Some(source) = resolve_entry(&entry) else {
            continue;
        };
        let file_or_id = source.identifier();

        send_event(
            writer,
            WorkerEvent::Started {
                file_or_id: file_or_id.clone(),
            },
        )
        .await;

        let sink = flusher.sink();
        let validator = Arc::clone(validator);
        let run = tokio::task::spawn_blocking(move || {
            validator.validate(source, strictness, &|line| sink.push(line))
        });
        let results = run
            .await
            .map_err(|e| io::Error::other(format!("validator panicked: {e}")))?;

        // Flushing here makes `result` imply the plugin's accepted log
        // lines are already on the wire.
        flusher.flush_now().await;
        send_event(
            writer,
            WorkerEvent::Result {
                file_or_id,
                num_failures: num_failures(&results),
            },
        )
        .await;
    }

    send_event(writer, WorkerEvent::Complete).await;
    Ok(())
}

fn resolve_entry(entry: &PluginEntry) -> Option<PluginSource> {
    if let Some(file_or_id) = &entry.file_or_id {
        // `result` events carry a non-empty identifier; an empty locator
        // has nothing to report against.
        if file_or_id.is_empty() {
            tracing::warn!("skipping plugin entry with empty locator");
            return None;
        }
        return Some(PluginSource::Locator(file_or_id.clone()));
    }
    if let Some(encoded) = &entry.plugin_description {
        return match PluginDescriptor::from_base64(encoded) {
            Ok(descriptor) => Some(PluginSource::Descriptor(descriptor)),
            Err(e) => {
                tracing::warn!(error = %e, "skipping plugin with undecodable descriptor");
                None
            }
        };
    }
    tracing::warn!("skipping plugin entry with no locator or descriptor");
    None
}

async fn send_event(writer: &EventWriter, event: WorkerEvent) {
    tracing::trace!(target: "plugvet::wire", event = %event.diagnostic(), "sending");
    let mut w = writer.lock().await;
    if let Err(e) = w.send(event).await {
        tracing::warn!(error = %e, "failed to send event");
    }
}
