//! The seam between the watcher core and wherever log lines come from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use thiserror::Error;

/// Raw log lines from one open stream
pub type LineStream = BoxStream<'static, Result<String, SourceError>>;

/// Failures reported by a [`LogSource`]
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Transient: the pod could not be reached or the stream broke
    #[error("connection to pod '{pod}' failed: {reason}")]
    Connection { pod: String, reason: String },

    /// The pod no longer exists in the cluster
    #[error("pod '{pod}' not found")]
    PodGone { pod: String },
}

impl SourceError {
    pub fn connection(pod: &str, reason: impl ToString) -> Self {
        Self::Connection {
            pod: pod.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Where to start reading when a stream is opened
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Only lines at or after this instant
    pub since_time: Option<DateTime<Utc>>,

    /// Number of historical lines to include (ignored when `since_time` is set)
    pub tail_lines: Option<i64>,
}

/// A cluster log API that can follow one pod's output
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Open a follow stream for `pod`. Lines are expected to carry an RFC3339
    /// timestamp prefix when the source supports it.
    async fn open(&self, pod: &str, options: &OpenOptions) -> Result<LineStream, SourceError>;
}

/// [`LogSource`] backed by the Kubernetes pod log endpoint
#[derive(Clone)]
pub struct KubeLogSource {
    api: Api<Pod>,
    container: Option<String>,
    all_containers: bool,
}

impl KubeLogSource {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            container: None,
            all_containers: false,
        }
    }

    /// Follow a specific container instead of the pod's default one
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Follow every container of the pod. Each line is tagged `[container]`
    /// after its timestamp.
    pub fn with_all_containers(mut self) -> Self {
        self.all_containers = true;
        self
    }

    fn params(&self, options: &OpenOptions, container: Option<String>) -> LogParams {
        LogParams {
            follow: true,
            container,
            // since_time takes precedence over tail_lines
            tail_lines: if options.since_time.is_some() {
                None
            } else {
                options.tail_lines
            },
            since_time: options.since_time,
            timestamps: true,
            ..Default::default()
        }
    }

    /// Open one container's stream; `tag` marks each line with its container
    async fn open_container(
        &self,
        pod: &str,
        container: Option<String>,
        tag: bool,
        options: &OpenOptions,
    ) -> Result<LineStream, SourceError> {
        let params = self.params(options, container.clone());
        let tag = container.filter(|_| tag);
        let reader = self
            .api
            .log_stream(pod, &params)
            .await
            .map_err(|e| api_error(pod, e))?;

        let pod = pod.to_string();
        Ok(reader
            .lines()
            .map(move |line| match line {
                Ok(line) => Ok(match &tag {
                    Some(name) => tag_container(&line, name),
                    None => line,
                }),
                Err(e) => Err(SourceError::connection(&pod, e)),
            })
            .boxed())
    }

    async fn container_names(&self, pod: &str) -> Result<Vec<String>, SourceError> {
        let found = self.api.get(pod).await.map_err(|e| api_error(pod, e))?;
        Ok(found
            .spec
            .map(|spec| spec.containers.into_iter().map(|c| c.name).collect())
            .unwrap_or_default())
    }
}

fn api_error(pod: &str, err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => SourceError::PodGone {
            pod: pod.to_string(),
        },
        other => SourceError::connection(pod, other),
    }
}

/// Insert `[container]` after the timestamp prefix of a raw line
fn tag_container(line: &str, container: &str) -> String {
    match line.split_once(' ') {
        Some((ts, rest)) => format!("{} [{}] {}", ts, container, rest),
        None => format!("{} [{}]", line, container),
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn open(&self, pod: &str, options: &OpenOptions) -> Result<LineStream, SourceError> {
        if !self.all_containers {
            return self
                .open_container(pod, self.container.clone(), false, options)
                .await;
        }

        let mut streams = Vec::new();
        for name in self.container_names(pod).await? {
            streams.push(self.open_container(pod, Some(name), true, options).await?);
        }
        tracing::debug!(pod, containers = streams.len(), "following all containers");
        Ok(futures::stream::select_all(streams).boxed())
    }
}
