//! Shared types for podwatch
//!
//! This crate contains data structures used across multiple podwatch crates,
//! including the records that cross the serialization boundary to UI and
//! RPC consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Kubernetes context information
#[derive(Clone, Debug)]
pub struct ContextInfo {
    pub name: String,
    pub cluster: String,
    pub namespace: Option<String>,
    pub is_current: bool,
}

impl ContextInfo {
    pub fn new(name: String, cluster: String, namespace: Option<String>, is_current: bool) -> Self {
        Self {
            name,
            cluster,
            namespace,
            is_current,
        }
    }
}

/// Namespace information
#[derive(Clone, Debug)]
pub struct NamespaceInfo {
    pub name: String,
    pub status: String,
}

impl NamespaceInfo {
    pub fn new(name: String, status: String) -> Self {
        Self { name, status }
    }
}

/// Deployment information
#[derive(Clone, Debug)]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub selector: Vec<(String, String)>,
}

impl DeploymentInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            replicas: 0,
            ready_replicas: 0,
            selector: Vec::new(),
        }
    }

    /// Format replica status as "ready/total"
    pub fn replica_status(&self) -> String {
        format!("{}/{}", self.ready_replicas, self.replicas)
    }

    /// Label selector string in `k=v,k2=v2` form
    pub fn label_selector(&self) -> String {
        self.selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Pod information
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: PodPhase,
    pub containers: Vec<ContainerInfo>,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self {
            name,
            namespace,
            phase: PodPhase::Unknown,
            containers: Vec::new(),
        }
    }
}

/// Lifecycle phase reported by the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
}

impl ContainerInfo {
    pub fn new(name: String) -> Self {
        Self {
            name,
            ready: false,
            restart_count: 0,
        }
    }
}

// ============================================================================
// Watch Types
// ============================================================================

/// Connection state of a watched pod's log stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WatchStatus {
    /// Opening the stream, or waiting out a backoff delay before the next attempt
    #[default]
    Connecting,
    /// At least one line has arrived on the current connection
    Streaming,
    /// The stream ended or failed; a reconnect is pending
    Disconnected,
    /// Closed for good, either on request or because the pod is gone
    Stopped,
}

/// A pod under watch and its stream state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedPod {
    pub name: String,
    pub status: WatchStatus,
}

impl WatchedPod {
    pub fn new(name: String, status: WatchStatus) -> Self {
        Self { name, status }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// A buffered log line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    /// Source pod name
    pub pod: String,

    /// Buffer-wide sequence number; increases within a pod and is never reused
    pub seq: u64,

    /// Timestamp the cluster prefixed the line with (if any)
    pub timestamp: Option<DateTime<Utc>>,

    /// Line content with the timestamp prefix removed
    pub message: String,
}

impl LogLine {
    pub fn new(pod: String, seq: u64, timestamp: Option<DateTime<Utc>>, message: String) -> Self {
        Self {
            pod,
            seq,
            timestamp,
            message,
        }
    }
}

impl From<LogLine> for PodLogMessage {
    fn from(line: LogLine) -> Self {
        Self {
            pod: line.pod,
            message: line.message,
        }
    }
}

/// One log line as delivered to subscribers: `{"pod": .., "message": ..}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodLogMessage {
    pub pod: String,
    pub message: String,
}

impl PodLogMessage {
    pub fn new(pod: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Search Types
// ============================================================================

/// Matching lines for one pod: `{"pod_name": .., "matches": [..]}`
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub pod_name: String,
    pub matches: Vec<String>,
}

impl SearchResult {
    pub fn new(pod_name: impl Into<String>, matches: Vec<String>) -> Self {
        Self {
            pod_name: pod_name.into(),
            matches,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// How a search pattern is interpreted
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Match letter case exactly
    pub case_sensitive: bool,

    /// Treat the pattern as a regular expression instead of a literal substring
    pub use_regex: bool,

    /// Keep only the newest N matches; 0 means no limit
    pub limit: Option<usize>,

    /// Only lines stamped at or after this instant. Lines without a
    /// timestamp never match when this is set.
    pub since: Option<DateTime<Utc>>,
}

impl SearchOptions {
    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn regex(mut self) -> Self {
        self.use_regex = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// The effective match limit, with 0 meaning unlimited
    pub fn max_matches(&self) -> Option<usize> {
        self.limit.filter(|&n| n > 0)
    }
}
