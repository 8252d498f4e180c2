use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Api;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};

use podwatch_types::{ContainerInfo, ContextInfo, DeploymentInfo, NamespaceInfo, PodInfo, PodPhase};

/// Kubernetes client wrapper
pub struct KubeClient {
    kubeconfig: Kubeconfig,
    current_context: Option<String>,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig
    pub fn new() -> Result<Self> {
        let kubeconfig =
            Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;

        let current_context = kubeconfig.current_context.clone();

        Ok(Self {
            kubeconfig,
            current_context,
        })
    }

    /// Get all available contexts from kubeconfig
    pub fn get_contexts(&self) -> Vec<ContextInfo> {
        self.kubeconfig
            .contexts
            .iter()
            .map(|ctx| {
                let context = ctx.context.as_ref();
                ContextInfo::new(
                    ctx.name.clone(),
                    context.map(|c| c.cluster.clone()).unwrap_or_default(),
                    context.and_then(|c| c.namespace.clone()),
                    Some(&ctx.name) == self.current_context.as_ref(),
                )
            })
            .collect()
    }

    /// Get the current context name
    pub fn current_context(&self) -> Option<&str> {
        self.current_context.as_deref()
    }

    /// Namespace configured for a context, if the kubeconfig names one
    pub fn context_namespace(&self, context_name: &str) -> Option<String> {
        self.kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .and_then(|c| c.context.as_ref())
            .and_then(|c| c.namespace.clone())
    }

    /// Create a kube::Client for a context, falling back to the current one
    pub async fn client_for_context(&self, context_name: Option<&str>) -> Result<kube::Client> {
        let context_name = context_name
            .or(self.current_context.as_deref())
            .context("No context given and kubeconfig has no current-context")?;

        if !self.kubeconfig.contexts.iter().any(|c| c.name == context_name) {
            anyhow::bail!("Context '{}' not found in kubeconfig", context_name);
        }

        let config = kube::Config::from_custom_kubeconfig(
            self.kubeconfig.clone(),
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name
        ))?;

        kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name
        ))
    }

    /// Fetch all namespaces from the cluster
    pub async fn get_namespaces(&self, client: &kube::Client) -> Result<Vec<NamespaceInfo>> {
        let namespaces: Api<Namespace> = Api::all(client.clone());
        let list = namespaces
            .list(&ListParams::default())
            .await
            .context("Failed to list namespaces")?;

        Ok(list
            .items
            .into_iter()
            .map(|ns| {
                let name = ns.metadata.name.unwrap_or_default();
                let status = ns
                    .status
                    .and_then(|s| s.phase)
                    .unwrap_or_else(|| "Unknown".to_string());
                NamespaceInfo::new(name, status)
            })
            .collect())
    }

    /// Fetch all deployments in a namespace
    pub async fn get_deployments(
        &self,
        client: &kube::Client,
        namespace: &str,
    ) -> Result<Vec<DeploymentInfo>> {
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        let list = deployments
            .list(&ListParams::default())
            .await
            .context(format!("Failed to list deployments in {}", namespace))?;

        Ok(list
            .items
            .into_iter()
            .map(|d| Self::deployment_to_info(d, namespace))
            .collect())
    }

    /// Fetch a single deployment by name
    pub async fn get_deployment(
        &self,
        client: &kube::Client,
        namespace: &str,
        name: &str,
    ) -> Result<DeploymentInfo> {
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        let deploy = deployments.get(name).await.context(format!(
            "Failed to get deployment '{}' in namespace '{}'",
            name, namespace
        ))?;

        Ok(Self::deployment_to_info(deploy, namespace))
    }

    fn deployment_to_info(deploy: Deployment, namespace: &str) -> DeploymentInfo {
        let name = deploy.metadata.name.unwrap_or_default();
        let mut info = DeploymentInfo::new(name, namespace.to_string());

        if let Some(spec) = deploy.spec {
            info.replicas = spec.replicas.unwrap_or(0);
            if let Some(selector) = spec.selector.match_labels {
                info.selector = selector.into_iter().collect();
            }
        }

        if let Some(status) = deploy.status {
            info.ready_replicas = status.ready_replicas.unwrap_or(0);
        }

        info
    }

    /// Fetch pods matching a deployment's selector
    pub async fn get_pods_for_deployment(
        &self,
        client: &kube::Client,
        namespace: &str,
        deployment: &DeploymentInfo,
    ) -> Result<Vec<PodInfo>> {
        if deployment.selector.is_empty() {
            anyhow::bail!(
                "Deployment '{}' has no matchLabels selector",
                deployment.name
            );
        }

        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&deployment.label_selector()))
            .await
            .context(format!(
                "Failed to list pods for deployment {}",
                deployment.name
            ))?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| Self::pod_to_info(pod, namespace))
            .collect())
    }

    fn pod_to_info(pod: Pod, namespace: &str) -> PodInfo {
        let name = pod.metadata.name.unwrap_or_default();
        let mut info = PodInfo::new(name, namespace.to_string());

        if let Some(spec) = &pod.spec {
            info.containers = spec
                .containers
                .iter()
                .map(|c| ContainerInfo::new(c.name.clone()))
                .collect();
        }

        if let Some(status) = pod.status {
            info.phase = status
                .phase
                .as_deref()
                .map(PodPhase::from)
                .unwrap_or(PodPhase::Unknown);

            for cs in status.container_statuses.unwrap_or_default() {
                if let Some(container) = info.containers.iter_mut().find(|c| c.name == cs.name) {
                    container.ready = cs.ready;
                    container.restart_count = cs.restart_count;
                }
            }
        }

        info
    }
}
