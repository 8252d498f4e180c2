use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use podwatch_k8s::LogSource;
use podwatch_types::{LogLine, PodLogMessage, WatchStatus, WatchedPod};

use crate::buffer::LogBuffer;
use crate::config::WatcherConfig;
use crate::error::{Result, WatchError, validate_pod_name};
use crate::reader::{GoneNotice, ReaderContext, StreamReader};

/// How long shutdown waits for each reader before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Owns one [`StreamReader`] per watched pod and fans their lines out to
/// any number of subscribers.
///
/// Cloning is cheap and every clone refers to the same set of pods.
/// Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn LogSource>,
    buffer: LogBuffer,
    readers: RwLock<HashMap<String, StreamReader>>,
    events: broadcast::Sender<LogLine>,
    config: WatcherConfig,
    shutdown: CancellationToken,
    next_reader_id: AtomicU64,
    gone_tx: mpsc::UnboundedSender<GoneNotice>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl StreamMultiplexer {
    pub fn new(source: Arc<dyn LogSource>, config: WatcherConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            source,
            buffer: LogBuffer::new(config.buffer_capacity),
            readers: RwLock::new(HashMap::new()),
            events,
            config,
            shutdown: shutdown.clone(),
            next_reader_id: AtomicU64::new(1),
            gone_tx,
        });

        tokio::spawn(reap_gone_pods(Arc::downgrade(&inner), gone_rx, shutdown));

        Self { inner }
    }

    /// Shared buffer the readers write into
    pub fn buffer(&self) -> &LogBuffer {
        &self.inner.buffer
    }

    /// Start following `pod`. Returns `false` if it was already watched.
    pub fn add_pod(&self, pod: &str) -> Result<bool> {
        validate_pod_name(pod)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(WatchError::ShutDown);
        }

        let mut readers = self.inner.readers.write();
        if readers.contains_key(pod) {
            return Ok(false);
        }

        let id = self.inner.next_reader_id.fetch_add(1, Ordering::SeqCst);
        let ctx = ReaderContext {
            source: Arc::clone(&self.inner.source),
            ring: self.inner.buffer.register(pod),
            events: self.inner.events.clone(),
            backoff: self.inner.config.backoff.clone(),
            tail_lines: self.inner.config.tail_lines,
            gone: self.inner.gone_tx.clone(),
        };
        let reader = StreamReader::open(pod.to_string(), id, ctx, &self.inner.shutdown);
        readers.insert(pod.to_string(), reader);

        tracing::info!(pod, reader = id, "watching pod");
        Ok(true)
    }

    /// Stop following `pod` and release its buffer
    pub fn remove_pod(&self, pod: &str) -> Result<()> {
        let reader = {
            let mut readers = self.inner.readers.write();
            let reader = readers
                .remove(pod)
                .ok_or_else(|| WatchError::NotFound(pod.to_string()))?;
            // Cleared under the pod-set lock so a concurrent re-add keeps its fresh ring
            self.inner.buffer.clear(pod);
            reader
        };
        reader.close();

        tracing::info!(pod, reader = reader.id(), "stopped watching pod");
        Ok(())
    }

    /// Forget a pod whose reader stopped on its own, unless it was re-added since
    fn remove_gone(&self, pod: &str, id: u64) {
        let mut readers = self.inner.readers.write();
        if readers.get(pod).is_some_and(|r| r.id() == id) {
            readers.remove(pod);
            self.inner.buffer.clear(pod);
            tracing::info!(pod, reader = id, "removed pod that left the cluster");
        }
    }

    pub fn contains(&self, pod: &str) -> bool {
        self.inner.readers.read().contains_key(pod)
    }

    pub fn status(&self, pod: &str) -> Option<WatchStatus> {
        self.inner.readers.read().get(pod).map(|r| r.status())
    }

    /// Whether the pod's reader currently holds an open log stream
    pub fn is_open(&self, pod: &str) -> bool {
        self.inner.readers.read().get(pod).is_some_and(|r| r.is_open())
    }

    /// Watched pods and their status, sorted by name
    pub fn pods(&self) -> Vec<WatchedPod> {
        let mut pods: Vec<WatchedPod> = self
            .inner
            .readers
            .read()
            .values()
            .map(|r| WatchedPod::new(r.pod().to_string(), r.status()))
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        pods
    }

    pub fn len(&self) -> usize {
        self.inner.readers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.readers.read().is_empty()
    }

    /// New subscriber: buffered history of every watched pod, then live lines.
    pub fn events(&self) -> Subscription {
        // Subscribe before snapshotting so nothing falls between the two
        let live = self.inner.events.subscribe();

        let mut replayed = HashMap::new();
        let mut backlog = Vec::new();
        for (pod, lines) in self.inner.buffer.snapshot_all() {
            if let Some(last) = lines.last() {
                replayed.insert(pod, last.seq);
            }
            backlog.extend(lines);
        }
        // Sequence numbers are buffer-wide, so this restores arrival order
        backlog.sort_by_key(|l| l.seq);

        Subscription {
            backlog: backlog.into(),
            replayed,
            live,
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Stop every reader and release all buffers. Later `add_pod` calls fail.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let readers: Vec<StreamReader> = {
            let mut readers = self.inner.readers.write();
            readers.drain().map(|(_, r)| r).collect()
        };
        for reader in &readers {
            reader.close();
        }
        for reader in &readers {
            reader.shutdown(SHUTDOWN_GRACE).await;
            self.inner.buffer.clear(reader.pod());
        }

        tracing::info!(stopped = readers.len(), "multiplexer shut down");
    }
}

async fn reap_gone_pods(
    inner: Weak<Inner>,
    mut gone_rx: mpsc::UnboundedReceiver<GoneNotice>,
    shutdown: CancellationToken,
) {
    loop {
        let notice = tokio::select! {
            _ = shutdown.cancelled() => return,
            notice = gone_rx.recv() => notice,
        };
        let Some((pod, id)) = notice else {
            return;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        StreamMultiplexer { inner }.remove_gone(&pod, id);
    }
}

/// One subscriber's view of the event feed.
///
/// Yields buffered history first, then live lines. Lines from one pod arrive
/// in source order. Ends only when the multiplexer shuts down.
pub struct Subscription {
    backlog: VecDeque<LogLine>,
    /// Newest replayed sequence number per pod; older live lines are duplicates
    replayed: HashMap<String, u64>,
    live: broadcast::Receiver<LogLine>,
    shutdown: CancellationToken,
}

impl Subscription {
    /// Next message, or `None` once the watcher is shut down
    pub async fn next(&mut self) -> Option<PodLogMessage> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(line.into());
        }

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return None,
                received = self.live.recv() => received,
            };

            match received {
                Ok(line) => {
                    if self.replayed.get(&line.pod).is_some_and(|&last| line.seq <= last) {
                        continue;
                    }
                    return Some(line.into());
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber fell behind, dropped log lines");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = PodLogMessage> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|msg| (msg, sub))
        })
    }
}
