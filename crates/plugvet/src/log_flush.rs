//! Coalescing log flusher for the worker.
//!
//! The test battery can emit hundreds of lines per second; shipping each
//! line as its own envelope would swamp the pipe. Lines are buffered and
//! flushed as one `log` event per interval, and once more on shutdown so
//! no accepted line is lost short of a hard crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::SinkExt;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::WorkerEvent;
use crate::worker::EventWriter;

/// Shared line buffer handed to battery log callbacks.
pub(crate) struct LogSink {
    lines: Mutex<Vec<String>>,
    connected: Arc<AtomicBool>,
}

impl LogSink {
    fn new(connected: Arc<AtomicBool>) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            connected,
        }
    }

    /// Accepts a line for the next flush. Pre-handshake noise is dropped.
    pub(crate) fn push(&self, line: &str) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        let mut lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push(line.to_string());
    }

    fn take_lines(&self) -> Vec<String> {
        let mut lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *lines)
    }
}

/// Periodic flusher owned by the worker dispatcher.
pub(crate) struct LogFlusher {
    sink: Arc<LogSink>,
    writer: EventWriter,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    stop_grace: Duration,
}

impl LogFlusher {
    pub(crate) fn start(
        writer: EventWriter,
        connected: Arc<AtomicBool>,
        interval: Duration,
        stop_grace: Duration,
    ) -> Self {
        let sink = Arc::new(LogSink::new(connected));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_flush_loop(
            Arc::clone(&sink),
            writer.clone(),
            interval,
            cancel.clone(),
        ));
        Self {
            sink,
            writer,
            cancel,
            task,
            stop_grace,
        }
    }

    pub(crate) fn sink(&self) -> Arc<LogSink> {
        Arc::clone(&self.sink)
    }

    /// Drains pending lines into a single `log` event immediately.
    pub(crate) async fn flush_now(&self) {
        flush(&self.sink, &self.writer).await;
    }

    /// Stops the periodic task with a grace period, then flushes once
    /// more.
    pub(crate) async fn stop(self) {
        let Self {
            sink,
            writer,
            cancel,
            mut task,
            stop_grace,
        } = self;

        cancel.cancel();
        if tokio::time::timeout(stop_grace, &mut task).await.is_err() {
            tracing::warn!("log flusher did not stop within grace period");
            task.abort();
        }
        flush(&sink, &writer).await;
    }
}

async fn run_flush_loop(
    sink: Arc<LogSink>,
    writer: EventWriter,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => flush(&sink, &writer).await,
        }
    }
}

async fn flush(sink: &Arc<LogSink>, writer: &EventWriter) {
    // Drain under the writer lock so two concurrent flushes cannot
    // reorder lines on the wire.
    let mut w = writer.lock().await;
    let batch = sink.take_lines();
    if batch.is_empty() {
        return;
    }
    let event = WorkerEvent::Log {
        text: batch.join("\n"),
    };
    if let Err(e) = w.send(event).await {
        tracing::warn!(error = %e, "failed to send log event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use crate::bridge::codec::EnvelopeCodec;

    fn event_writer_pair() -> (
        EventWriter,
        FramedRead<tokio::io::DuplexStream, EnvelopeCodec<WorkerEvent>>,
    ) {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let writer: EventWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            Box::new(near) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
            EnvelopeCodec::new(),
        )));
        (writer, FramedRead::new(far, EnvelopeCodec::new()))
    }

    #[tokio::test]
    async fn lines_coalesce_into_one_event() {
        let (writer, mut reader) = event_writer_pair();
        let connected = Arc::new(AtomicBool::new(true));
        let flusher = LogFlusher::start(
            writer,
            connected,
            Duration::from_secs(3600),
            Duration::from_secs(2),
        );

        let sink = flusher.sink();
        sink.push("line1");
        sink.push("line2");
        flusher.flush_now().await;

        let event = reader.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            WorkerEvent::Log {
                text: "line1\nline2".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn pre_handshake_lines_are_dropped() {
        let (writer, mut reader) = event_writer_pair();
        let connected = Arc::new(AtomicBool::new(false));
        let flusher = LogFlusher::start(
            writer,
            Arc::clone(&connected),
            Duration::from_secs(3600),
            Duration::from_secs(2),
        );

        let sink = flusher.sink();
        sink.push("noise before connect");

        connected.store(true, Ordering::Release);
        sink.push("kept");
        flusher.stop().await;

        let event = reader.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            WorkerEvent::Log {
                text: "kept".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn stop_performs_a_final_flush() {
        let (writer, mut reader) = event_writer_pair();
        let connected = Arc::new(AtomicBool::new(true));
        let flusher = LogFlusher::start(
            writer,
            connected,
            Duration::from_secs(3600),
            Duration::from_secs(2),
        );

        flusher.sink().push("last words");
        flusher.stop().await;

        let event = reader.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            WorkerEvent::Log {
                text: "last words".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn empty_buffer_sends_nothing() {
        let (writer, mut reader) = event_writer_pair();
        let connected = Arc::new(AtomicBool::new(true));
        let flusher = LogFlusher::start(
            writer,
            connected,
            Duration::from_secs(3600),
            Duration::from_secs(2),
        );

        flusher.stop().await;

        // The writer side is gone; an empty stream means no event was sent.
        assert!(reader.next().await.is_none());
    }
}
