use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use podwatch_k8s::{LogSource, OpenOptions, SourceError};
use podwatch_types::{LogLine, WatchStatus};

use crate::buffer::PodRing;
use crate::config::BackoffConfig;
use crate::parser::LineParser;

/// Sent when a reader stops because its pod no longer exists: (pod, reader id)
pub(crate) type GoneNotice = (String, u64);

/// Everything a reader task needs besides its pod name
pub(crate) struct ReaderContext {
    pub source: Arc<dyn LogSource>,
    pub ring: Arc<PodRing>,
    pub events: broadcast::Sender<LogLine>,
    pub backoff: BackoffConfig,
    pub tail_lines: Option<i64>,
    pub gone: mpsc::UnboundedSender<GoneNotice>,
}

/// Follows one pod's log stream in its own task, reconnecting with
/// exponential backoff until closed.
pub struct StreamReader {
    pod: String,
    id: u64,
    cancel: CancellationToken,
    status_tx: Arc<watch::Sender<WatchStatus>>,
    status_rx: watch::Receiver<WatchStatus>,
    /// Set while a log stream is open, even before its first line
    stream_open: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamReader {
    /// Start following `pod`. The reader stops when `parent` is cancelled
    /// or [`close`](Self::close) is called.
    pub(crate) fn open(
        pod: String,
        id: u64,
        ctx: ReaderContext,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let (status_tx, status_rx) = watch::channel(WatchStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let stream_open = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run(
            pod.clone(),
            id,
            ctx,
            cancel.clone(),
            Arc::clone(&status_tx),
            Arc::clone(&stream_open),
        ));

        Self {
            pod,
            id,
            cancel,
            status_tx,
            status_rx,
            stream_open,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Generation id, unique per multiplexer
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> WatchStatus {
        *self.status_rx.borrow()
    }

    /// Whether the reader currently holds an open log stream. A pod that
    /// has not logged anything yet is open but still `Connecting`.
    pub fn is_open(&self) -> bool {
        self.stream_open.load(Ordering::Acquire)
    }

    /// Stop following the pod. Safe to call more than once.
    pub fn close(&self) {
        self.cancel.cancel();
        self.status_tx.send_replace(WatchStatus::Stopped);
    }

    /// Close and wait up to `grace` for the task to exit, aborting it after that
    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        let Some(mut task) = self.task.lock().take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!(pod = %self.pod, "log reader did not stop in time, aborting");
            task.abort();
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("pod", &self.pod)
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Move to `next` unless the reader was already stopped
fn set_status(tx: &watch::Sender<WatchStatus>, next: WatchStatus) {
    tx.send_if_modified(|current| {
        if *current == WatchStatus::Stopped || *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

async fn run(
    pod: String,
    id: u64,
    ctx: ReaderContext,
    cancel: CancellationToken,
    status: Arc<watch::Sender<WatchStatus>>,
    stream_open: Arc<AtomicBool>,
) {
    let mut cursor = ResumeCursor::default();
    let mut attempt: u32 = 0;

    'session: loop {
        set_status(&status, WatchStatus::Connecting);
        cursor.rewind();
        let options = OpenOptions {
            since_time: cursor.since(),
            tail_lines: ctx.tail_lines,
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'session,
            result = ctx.source.open(&pod, &options) => result,
        };

        match opened {
            Ok(mut lines) => {
                tracing::debug!(pod = %pod, since = ?options.since_time, "log stream opened");
                stream_open.store(true, Ordering::Release);
                let mut streaming = false;

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            stream_open.store(false, Ordering::Release);
                            break 'session;
                        }
                        next = lines.next() => next,
                    };

                    match next {
                        Some(Ok(raw)) => {
                            if !streaming {
                                streaming = true;
                                attempt = 0;
                                set_status(&status, WatchStatus::Streaming);
                                tracing::info!(pod = %pod, "streaming logs");
                            }

                            let (timestamp, content) = LineParser::split_timestamp(&raw);
                            if !cursor.admit(timestamp) {
                                continue;
                            }

                            let line = ctx.ring.push(timestamp, content.to_string());
                            // No receivers is fine; the line is still buffered
                            let _ = ctx.events.send(line);
                        }
                        Some(Err(e)) => {
                            tracing::warn!(pod = %pod, error = %e, "log stream failed");
                            break;
                        }
                        None => {
                            tracing::info!(pod = %pod, "log stream ended");
                            break;
                        }
                    }
                }

                stream_open.store(false, Ordering::Release);
                set_status(&status, WatchStatus::Disconnected);
            }
            Err(SourceError::PodGone { .. }) => {
                tracing::info!(pod = %pod, "pod no longer exists, stopping");
                status.send_replace(WatchStatus::Stopped);
                let _ = ctx.gone.send((pod, id));
                return;
            }
            Err(e) => {
                tracing::warn!(pod = %pod, attempt, error = %e, "failed to open log stream");
            }
        }

        let delay = ctx.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(pod = %pod, attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'session,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    status.send_replace(WatchStatus::Stopped);
}

/// Tracks the newest delivered timestamp so a reconnect can resume without
/// repeating lines.
///
/// The source is asked for lines since the newest timestamp seen. Only while
/// that replay is in progress are lines older than it dropped, along with as
/// many lines carrying exactly that timestamp as were already delivered. The
/// first newer line ends the replay. Outside a replay every line is admitted,
/// even one stamped earlier than its predecessor (stdout and stderr are
/// stamped independently). Lines without a timestamp are always admitted.
#[derive(Debug, Default)]
pub(crate) struct ResumeCursor {
    last: Option<DateTime<Utc>>,
    seen_at_last: usize,
    skip: usize,
    replaying: bool,
}

impl ResumeCursor {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    /// Prepare for a new connection that replays from `since()`
    pub fn rewind(&mut self) {
        self.replaying = self.last.is_some();
        self.skip = if self.replaying { self.seen_at_last } else { 0 };
    }

    /// Whether a line with this timestamp is new
    pub fn admit(&mut self, timestamp: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = timestamp else {
            return true;
        };

        match self.last {
            Some(last) if ts < last => !self.replaying,
            Some(last) if ts == last => {
                if self.replaying && self.skip > 0 {
                    self.skip -= 1;
                    false
                } else {
                    self.seen_at_last += 1;
                    true
                }
            }
            _ => {
                self.last = Some(ts);
                self.seen_at_last = 1;
                self.skip = 0;
                self.replaying = false;
                true
            }
        }
    }
}
