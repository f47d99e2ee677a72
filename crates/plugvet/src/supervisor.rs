//! Supervisor controller: the embedder-facing surface.
//!
//! Owns the worker handle, fans inbound events out to registered
//! listeners, and relaunches a fresh worker on the next validate after a
//! batch completes or the connection is lost. A truncated stream is never
//! patched up: a plugin that took the worker down is identifiable from
//! the last `validation_started` callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};

use crate::bridge::protocol::{PluginEntry, WorkerEvent, WorkerRequest};
use crate::descriptor::PluginDescriptor;
use crate::orchestrator::{
    EventReader, LaunchError, SelfSpawner, WorkerLink, WorkerSpawner, launch_worker,
};
use crate::version;

/// Observer of validation progress.
///
/// All methods default to no-ops. Callbacks arrive on the supervisor's
/// event-loop task; listeners that need another context repost
/// themselves.
pub trait ValidationListener: Send + Sync {
    fn validation_started(&self, _file_or_id: &str) {}
    fn log_message(&self, _text: &str) {}
    fn item_complete(&self, _file_or_id: &str, _num_failures: u32) {}
    fn all_items_complete(&self) {}
    fn connection_lost(&self) {}
}

pub struct SupervisorConfig {
    /// Deadline for the worker's `connected` handshake.
    pub launch_timeout: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(5),
            spawner: Arc::new(SelfSpawner),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    listeners: RwLock<Vec<Arc<dyn ValidationListener>>>,
    worker: tokio::sync::Mutex<Option<WorkerLink>>,
    connected: AtomicBool,
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                listeners: RwLock::new(Vec::new()),
                worker: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ValidationListener>) {
        let mut listeners = match self.inner.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.push(listener);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Launches a worker if none is attached. Fails only if the worker
    /// could not be launched; the supervisor then stays disconnected
    /// until the caller retries.
    pub async fn ensure_connected(&self) -> Result<(), LaunchError> {
        let mut slot = self.inner.worker.lock().await;
        self.inner.ensure_connected_locked(&mut slot).await
    }

    /// Triggers validation of a set of files or identifier strings.
    pub async fn validate_files(
        &self,
        file_or_ids: &[String],
        strictness: i32,
    ) -> Result<(), LaunchError> {
        let entries = file_or_ids
            .iter()
            .map(|id| {
                debug_assert!(!id.is_empty());
                PluginEntry::locator(id.as_str())
            })
            .collect();
        self.send_batch(WorkerRequest::batch(strictness, entries)).await
    }

    /// Triggers validation of a set of plugin descriptors, each serialised
    /// to its base64 wire form.
    pub async fn validate_descriptors(
        &self,
        descriptors: &[PluginDescriptor],
        strictness: i32,
    ) -> Result<(), LaunchError> {
        let entries = descriptors
            .iter()
            .filter_map(PluginEntry::descriptor)
            .collect();
        self.send_batch(WorkerRequest::batch(strictness, entries)).await
    }

    async fn send_batch(&self, request: WorkerRequest) -> Result<(), LaunchError> {
        let mut slot = self.inner.worker.lock().await;
        self.inner.ensure_connected_locked(&mut slot).await?;
        let Some(link) = slot.as_ref() else {
            return Err(LaunchError::Disconnected);
        };

        tracing::debug!(target: "plugvet::wire", request = %request.diagnostic(), "sending batch");
        let mut writer = link.writer.lock().await;
        if let Err(e) = writer.send(request).await {
            // The event loop surfaces the loss; the send itself is not an
            // error to the caller and is never retried.
            self.inner.fan_log(&format!("failed to send batch: {e}"));
        }
        Ok(())
    }
}

impl SupervisorInner {
    async fn ensure_connected_locked(
        self: &Arc<Self>,
        slot: &mut Option<WorkerLink>,
    ) -> Result<(), LaunchError> {
        if let Some(link) = slot.as_ref() {
            if !link.is_dead() {
                return Ok(());
            }
            // The event loop already saw this link's terminal event but
            // the async release has not run yet; reap it here so the
            // batch goes to a fresh worker, never to a link whose event
            // loop has exited.
            *slot = None;
            self.connected.store(false, Ordering::Release);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let launched = launch_worker(
            self.config.spawner.as_ref(),
            self.config.launch_timeout,
            generation,
        )
        .await;
        let (link, reader) = match launched {
            Ok(ok) => ok,
            Err(e) => {
                self.fan_log(&format!("Error: {e}"));
                return Err(e);
            }
        };

        self.fan_log(&version::banner());

        let inner = Arc::clone(self);
        let dead = link.dead_flag();
        tokio::spawn(async move { inner.run_event_loop(reader, generation, dead).await });

        *slot = Some(link);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut reader: EventReader,
        generation: u64,
        dead: Arc<AtomicBool>,
    ) {
        loop {
            match reader.next().await {
                Some(Ok(event)) => {
                    tracing::trace!(target: "plugvet::wire", event = %event.diagnostic(), "received");
                    match event {
                        WorkerEvent::Log { text } => self.fan_log(&text),
                        WorkerEvent::Started { file_or_id } => {
                            self.fan(|l| l.validation_started(&file_or_id));
                        }
                        WorkerEvent::Result {
                            file_or_id,
                            num_failures,
                        } => {
                            self.fan(|l| l.item_complete(&file_or_id, num_failures));
                        }
                        WorkerEvent::Complete => {
                            // Dead before the callback fires: a validate
                            // issued from inside it must relaunch, not
                            // reuse this link.
                            dead.store(true, Ordering::Release);
                            self.fan(|l| l.all_items_complete());
                            break;
                        }
                        WorkerEvent::Connected => {
                            tracing::warn!("unexpected connected event after handshake");
                        }
                    }
                }
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::warn!(error = %e, "dropping malformed envelope");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "connection error");
                    dead.store(true, Ordering::Release);
                    self.fan(|l| l.connection_lost());
                    break;
                }
                None => {
                    tracing::debug!("worker pipe closed");
                    dead.store(true, Ordering::Release);
                    self.fan(|l| l.connection_lost());
                    break;
                }
            }
        }

        // Release the worker handle from a task of its own: the transport
        // is never torn down from within its own delivery path.
        let inner = Arc::clone(&self);
        tokio::spawn(async move { inner.release_worker(generation).await });
    }

    async fn release_worker(&self, generation: u64) {
        let mut slot = self.worker.lock().await;
        if slot.as_ref().is_some_and(|link| link.generation == generation) {
            *slot = None;
            self.connected.store(false, Ordering::Release);
            tracing::debug!(generation, "worker released");
        }
    }

    fn fan(&self, call: impl Fn(&dyn ValidationListener)) {
        let listeners = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for listener in listeners {
            call(listener.as_ref());
        }
    }

    fn fan_log(&self, text: &str) {
        self.fan(|l| l.log_message(text));
    }
}
