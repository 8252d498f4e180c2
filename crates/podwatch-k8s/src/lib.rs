//! Kubernetes access for podwatch
//!
//! This crate provides Kubernetes API integration for fetching contexts,
//! namespaces, deployments and pods, and the [`LogSource`] abstraction the
//! watcher reads pod logs through.

mod client;
mod source;

pub use client::KubeClient;
pub use source::{KubeLogSource, LineStream, LogSource, OpenOptions, SourceError};

// Re-export types that are used in our public API
pub use podwatch_types::{ContainerInfo, ContextInfo, DeploymentInfo, NamespaceInfo, PodInfo, PodPhase};
