use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use podwatch_types::LogLine;

/// Bounded history for a single pod.
///
/// Written by exactly one stream reader, read by any number of snapshot and
/// search callers.
pub struct PodRing {
    pod: String,
    capacity: usize,
    lines: RwLock<VecDeque<LogLine>>,

    /// Sequence counter shared by every ring of the owning buffer
    next_seq: Arc<AtomicU64>,
}

impl PodRing {
    fn new(pod: String, capacity: usize, next_seq: Arc<AtomicU64>) -> Self {
        Self {
            pod,
            capacity,
            // Don't preallocate the full capacity; most pods never fill it
            lines: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            next_seq,
        }
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Append a line, evicting the oldest if at capacity. Returns the stored
    /// line with its sequence number assigned.
    pub fn push(&self, timestamp: Option<DateTime<Utc>>, message: String) -> LogLine {
        let mut lines = self.lines.write();
        // Taken under the write lock so sequence order matches ring order
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let line = LogLine::new(self.pod.clone(), seq, timestamp, message);

        if lines.len() >= self.capacity {
            lines.pop_front();
            tracing::trace!(pod = %self.pod, capacity = self.capacity, "evicted oldest buffered line");
        }
        lines.push_back(line.clone());
        line
    }

    /// Point-in-time copy of the buffered lines, oldest first
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.read().is_empty()
    }

    fn clear(&self) {
        self.lines.write().clear();
    }
}

/// Thread-safe per-pod ring buffers for log lines
#[derive(Clone)]
pub struct LogBuffer {
    rings: Arc<RwLock<HashMap<String, Arc<PodRing>>>>,

    /// Maximum lines kept per pod
    capacity: usize,

    /// Next line sequence number, increasing across all pods
    next_seq: Arc<AtomicU64>,
}

impl LogBuffer {
    /// Create a new log buffer keeping at most `capacity` lines per pod
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            next_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create an empty ring for `pod`, replacing any previous one
    pub fn register(&self, pod: &str) -> Arc<PodRing> {
        let ring = Arc::new(PodRing::new(
            pod.to_string(),
            self.capacity,
            Arc::clone(&self.next_seq),
        ));
        self.rings.write().insert(pod.to_string(), Arc::clone(&ring));
        ring
    }

    /// Ring handle for `pod`, if registered
    pub fn ring(&self, pod: &str) -> Option<Arc<PodRing>> {
        self.rings.read().get(pod).cloned()
    }

    /// Append a message to a registered pod. Messages for unknown pods are dropped.
    pub fn append(&self, pod: &str, message: impl Into<String>) -> Option<LogLine> {
        let ring = self.ring(pod)?;
        Some(ring.push(None, message.into()))
    }

    /// Point-in-time copy of a pod's lines, or `None` if the pod is unknown
    pub fn snapshot(&self, pod: &str) -> Option<Vec<LogLine>> {
        self.ring(pod).map(|r| r.snapshot())
    }

    /// Snapshot of every registered pod, ordered by pod name
    pub fn snapshot_all(&self) -> Vec<(String, Vec<LogLine>)> {
        let rings: Vec<Arc<PodRing>> = self.rings.read().values().cloned().collect();
        let mut all: Vec<_> = rings
            .into_iter()
            .map(|r| (r.pod().to_string(), r.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop a pod's lines and forget it
    pub fn clear(&self, pod: &str) -> bool {
        match self.rings.write().remove(pod) {
            Some(ring) => {
                ring.clear();
                true
            }
            None => false,
        }
    }

    /// Registered pod names, sorted
    pub fn pods(&self) -> Vec<String> {
        let mut pods: Vec<String> = self.rings.read().keys().cloned().collect();
        pods.sort();
        pods
    }

    /// Number of lines buffered for a pod (0 if unknown)
    pub fn len(&self, pod: &str) -> usize {
        self.ring(pod).map(|r| r.len()).unwrap_or(0)
    }

    /// Whether no pods are registered
    pub fn is_empty(&self) -> bool {
        self.rings.read().is_empty()
    }
}
