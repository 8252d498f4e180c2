use std::path::{Path, PathBuf};
use std::sync::Arc;

use podwatch_k8s::LogSource;
use podwatch_types::{PodLogMessage, SearchOptions, SearchResult, WatchStatus, WatchedPod};

use crate::config::WatcherConfig;
use crate::error::{Result, WatchError};
use crate::export::export_buffers;
use crate::multiplexer::{StreamMultiplexer, Subscription};
use crate::search::SearchIndex;

/// Entry point for callers (CLI, UI, RPC handlers).
///
/// Owns the set of watched pods explicitly; clone it to share it between
/// tasks. Every operation is safe to call concurrently.
#[derive(Clone)]
pub struct WatcherService {
    multiplexer: StreamMultiplexer,
    index: SearchIndex,
}

impl WatcherService {
    /// Must be called from within a Tokio runtime.
    pub fn new(source: Arc<dyn LogSource>, config: WatcherConfig) -> Self {
        let multiplexer = StreamMultiplexer::new(source, config);
        let index = SearchIndex::new(multiplexer.buffer().clone());
        Self { multiplexer, index }
    }

    /// Start watching a pod. Watching an already watched pod does nothing.
    pub fn watch(&self, pod: &str) -> Result<()> {
        self.multiplexer.add_pod(pod).map(|_| ())
    }

    /// Watch several pods; returns how many were newly added
    pub fn watch_many<I, S>(&self, pods: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for pod in pods {
            if self.multiplexer.add_pod(pod.as_ref())? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Stop watching a pod and drop its history
    pub fn unwatch(&self, pod: &str) -> Result<()> {
        self.multiplexer.remove_pod(pod)
    }

    /// Feed of every watched pod's lines: buffered history, then live
    pub fn stream_all(&self) -> Subscription {
        self.multiplexer.events()
    }

    /// Search one pod's buffered lines
    pub fn search(&self, pod: &str, query: &str, options: &SearchOptions) -> Result<SearchResult> {
        self.index.search(pod, query, options)
    }

    /// Search every watched pod; pods without matches are left out
    pub fn search_all(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        self.index.search_all(query, options)
    }

    /// Watched pods and their stream state
    pub fn watched(&self) -> Vec<WatchedPod> {
        self.multiplexer.pods()
    }

    pub fn status(&self, pod: &str) -> Result<WatchStatus> {
        self.multiplexer
            .status(pod)
            .ok_or_else(|| WatchError::NotFound(pod.to_string()))
    }

    /// Whether a log stream is open for the pod, even if it has not produced
    /// a line yet (false when not watched)
    pub fn is_open(&self, pod: &str) -> bool {
        self.multiplexer.is_open(pod)
    }

    /// Number of lines currently buffered for a pod (0 when not watched)
    pub fn buffered(&self, pod: &str) -> usize {
        self.multiplexer.buffer().len(pod)
    }

    /// Point-in-time copy of a pod's buffered messages
    pub fn snapshot(&self, pod: &str) -> Result<Vec<PodLogMessage>> {
        self.multiplexer
            .buffer()
            .snapshot(pod)
            .map(|lines| lines.into_iter().map(PodLogMessage::from).collect())
            .ok_or_else(|| WatchError::NotFound(pod.to_string()))
    }

    /// Write every watched pod's buffered lines to `<dir>/<pod>.log`
    pub fn export(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        export_buffers(self.multiplexer.buffer(), dir)
    }

    /// Stop all readers and release all buffers
    pub async fn shutdown(&self) {
        self.multiplexer.shutdown().await;
    }
}
