//! Worker lifecycle management for the supervisor side.
//!
//! Flow:
//! 1. Spawn the worker: this executable re-run with the worker-mode
//!    token, or whatever a custom spawner produces
//! 2. Complete the `connected` handshake under the launch deadline
//! 3. Hand the reader to the supervisor's event loop
//!
//! Listener callbacks never fire during the handshake phase; a worker
//! that dies or stalls before `connected` surfaces only as a launch
//! error.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{WorkerEvent, WorkerRequest};
use crate::worker::WORKER_MODE_TOKEN;

/// A freshly spawned worker's transport, plus the child handle when the
/// worker is a real process.
pub struct WorkerConnection {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub child: Option<Child>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerConnection, SpawnError>;
}

/// Spawns this very executable with the worker-mode token on the command
/// line. The wire runs over the child's stdio; stderr stays attached to
/// the supervisor's so worker diagnostics remain visible.
pub struct SelfSpawner;

impl WorkerSpawner for SelfSpawner {
    fn spawn(&self) -> Result<WorkerConnection, SpawnError> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg(WORKER_MODE_TOKEN)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        Ok(WorkerConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("worker took too long to launch")]
    HandshakeTimeout,
    #[error("worker disconnected during launch")]
    Disconnected,
}

pub(crate) type RequestWriter = Arc<
    tokio::sync::Mutex<
        FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, EnvelopeCodec<WorkerRequest>>,
    >,
>;
pub(crate) type EventReader =
    FramedRead<Box<dyn AsyncRead + Send + Unpin>, EnvelopeCodec<WorkerEvent>>;

/// One launched worker generation. Dropping it closes the pipe and, for a
/// real process, kills the child.
pub(crate) struct WorkerLink {
    pub(crate) generation: u64,
    pub(crate) writer: RequestWriter,
    /// Set by the event loop the moment it observes `complete` or loss,
    /// before any teardown runs. A dead link must never carry another
    /// batch: its event loop has already exited.
    dead: Arc<AtomicBool>,
    #[allow(dead_code)] // held only so dropping the link reaps the process
    child: Option<Child>,
}

impl WorkerLink {
    pub(crate) fn dead_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.dead)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

/// Spawns a worker and completes the `connected` handshake under
/// `launch_timeout`.
pub(crate) async fn launch_worker(
    spawner: &dyn WorkerSpawner,
    launch_timeout: Duration,
    generation: u64,
) -> Result<(WorkerLink, EventReader), LaunchError> {
    let WorkerConnection {
        reader,
        writer,
        child,
    } = spawner.spawn()?;

    let mut reader: EventReader = FramedRead::new(reader, EnvelopeCodec::new());
    let writer: RequestWriter =
        Arc::new(tokio::sync::Mutex::new(FramedWrite::new(writer, EnvelopeCodec::new())));

    let handshake = tokio::time::timeout(launch_timeout, async {
        loop {
            match reader.next().await {
                Some(Ok(WorkerEvent::Connected)) => return Ok(()),
                Some(Ok(other)) => {
                    tracing::warn!(event = %other.diagnostic(), "unexpected event before handshake");
                }
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::warn!(error = %e, "dropping malformed envelope during handshake");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "pipe error during handshake");
                    return Err(LaunchError::Disconnected);
                }
                None => return Err(LaunchError::Disconnected),
            }
        }
    })
    .await;

    match handshake {
        Ok(Ok(())) => {
            tracing::debug!(generation, "worker connected");
            Ok((
                WorkerLink {
                    generation,
                    writer,
                    dead: Arc::new(AtomicBool::new(false)),
                    child,
                },
                reader,
            ))
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(LaunchError::HandshakeTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;

    fn scripted_connection(
        script: impl FnOnce(
            FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, EnvelopeCodec<WorkerRequest>>,
            FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, EnvelopeCodec<WorkerEvent>>,
        ) -> tokio::task::JoinHandle<()>,
    ) -> WorkerConnection {
        let (supervisor_io, worker_io) = tokio::io::duplex(16 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        script(
            FramedRead::new(worker_read, EnvelopeCodec::new()),
            FramedWrite::new(worker_write, EnvelopeCodec::new()),
        );

        let (read, write) = tokio::io::split(supervisor_io);
        WorkerConnection {
            reader: Box::new(read),
            writer: Box::new(write),
            child: None,
        }
    }

    struct OneShot(std::sync::Mutex<Option<WorkerConnection>>);

    impl WorkerSpawner for OneShot {
        fn spawn(&self) -> Result<WorkerConnection, SpawnError> {
            self.0
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| SpawnError::Other("already spawned".to_string()))
        }
    }

    #[tokio::test]
    async fn handshake_succeeds_on_connected() {
        let connection = scripted_connection(|_reader, mut writer| {
            tokio::spawn(async move {
                writer.send(WorkerEvent::Connected).await.unwrap();
                // Hold the pipe open until the test finishes.
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        });
        let spawner = OneShot(std::sync::Mutex::new(Some(connection)));

        let result = launch_worker(&spawner, Duration::from_secs(5), 1).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let connection = scripted_connection(|_reader, writer| {
            tokio::spawn(async move {
                let _writer = writer;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        });
        let spawner = OneShot(std::sync::Mutex::new(Some(connection)));

        let result = launch_worker(&spawner, Duration::from_millis(100), 1).await;
        assert!(matches!(result, Err(LaunchError::HandshakeTimeout)));
    }

    #[tokio::test]
    async fn worker_dying_before_handshake_is_a_launch_error() {
        let connection = scripted_connection(|_reader, writer| {
            tokio::spawn(async move {
                drop(writer);
            })
        });
        let spawner = OneShot(std::sync::Mutex::new(Some(connection)));

        let result = launch_worker(&spawner, Duration::from_secs(5), 1).await;
        assert!(matches!(result, Err(LaunchError::Disconnected)));
    }

    #[tokio::test]
    async fn spawn_refusal_propagates() {
        let spawner = OneShot(std::sync::Mutex::new(None));
        let result = launch_worker(&spawner, Duration::from_secs(5), 1).await;
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
    }
}
