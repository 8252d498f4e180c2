use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use podwatch_k8s::{KubeClient, KubeLogSource};
use podwatch_logs::{SearchOptions, WatchStatus, WatcherConfig, WatcherService};

/// podwatch - Watch and search live logs from Kubernetes pods
#[derive(Parser, Debug)]
#[command(name = "podwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML file with watcher settings
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log lines kept per pod (overrides the config file)
    #[arg(long, global = true)]
    buffer_size: Option<usize>,

    /// Historical lines to fetch per pod (overrides the config file)
    #[arg(long, global = true)]
    tail_lines: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List contexts in the kubeconfig
    Contexts,

    /// List namespaces in a context
    Namespaces {
        #[arg(long)]
        context: Option<String>,
    },

    /// List deployments in a namespace
    Deployments {
        #[arg(long)]
        context: Option<String>,

        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Stream logs from pods to the console until interrupted
    Stream {
        #[command(flatten)]
        target: Target,

        /// Print each line as a JSON object
        #[arg(long)]
        json: bool,
    },

    /// Search the recent logs of pods
    Search {
        #[command(flatten)]
        target: Target,

        /// Text (or regular expression with --regex) to look for
        #[arg(short, long)]
        query: String,

        /// Interpret the query as a regular expression
        #[arg(long)]
        regex: bool,

        /// Match letter case exactly
        #[arg(long)]
        case_sensitive: bool,

        /// Keep only the newest N matches per pod (0 = no limit)
        #[arg(long)]
        limit: Option<usize>,

        /// Only lines logged at or after this RFC3339 time
        #[arg(long, value_name = "TIME")]
        since: Option<DateTime<Utc>>,

        /// Write matches to <DIR>/<pod>.log instead of printing them
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,

        /// Seconds to wait for log history to arrive
        #[arg(long, default_value = "10")]
        wait: u64,
    },

    /// Save the recent logs of pods to <DIR>/<pod>.log
    Save {
        #[command(flatten)]
        target: Target,

        /// Directory to write the log files to
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Seconds to wait for log history to arrive
        #[arg(long, default_value = "10")]
        wait: u64,
    },
}

/// Which pods to watch
#[derive(Args, Debug)]
struct Target {
    /// Kubernetes context (defaults to the current context)
    #[arg(long)]
    context: Option<String>,

    /// Namespace (defaults to the context's namespace, then "default")
    #[arg(short, long)]
    namespace: Option<String>,

    /// Watch every pod of this deployment
    #[arg(short, long)]
    deployment: Option<String>,

    /// Watch this pod (repeatable)
    #[arg(short, long = "pod", value_name = "POD")]
    pods: Vec<String>,

    /// Follow this container instead of the pod's default one
    #[arg(short, long, conflicts_with = "all_containers")]
    container: Option<String>,

    /// Follow every container of each pod, tagging lines with the container
    #[arg(long)]
    all_containers: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing for debugging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let kube_client = KubeClient::new()?;

    match cli.command {
        Command::Contexts => {
            for ctx in kube_client.get_contexts() {
                let marker = if ctx.is_current { "*" } else { " " };
                println!(
                    "{} {}\t{}\t{}",
                    marker,
                    ctx.name,
                    ctx.cluster,
                    ctx.namespace.as_deref().unwrap_or("-")
                );
            }
        }

        Command::Namespaces { context } => {
            let client = kube_client.client_for_context(context.as_deref()).await?;
            for ns in kube_client.get_namespaces(&client).await? {
                println!("{}\t{}", ns.name, ns.status);
            }
        }

        Command::Deployments { context, namespace } => {
            let client = kube_client.client_for_context(context.as_deref()).await?;
            let namespace = resolve_namespace(&kube_client, context.as_deref(), namespace);
            for deploy in kube_client.get_deployments(&client, &namespace).await? {
                println!("{}\t{}", deploy.name, deploy.replica_status());
            }
        }

        Command::Stream { target, json } => {
            let service = start_watching(&kube_client, &target, config).await?;
            stream_to_console(&service, json).await?;
            service.shutdown().await;
        }

        Command::Search {
            target,
            query,
            regex,
            case_sensitive,
            limit,
            since,
            output,
            json,
            wait,
        } => {
            let mut options: SearchOptions = config.search.clone();
            options.use_regex |= regex;
            options.case_sensitive |= case_sensitive;
            if limit.is_some() {
                options.limit = limit;
            }
            if since.is_some() {
                options.since = since;
            }

            let service = start_watching(&kube_client, &target, config).await?;
            wait_for_history(&service, Duration::from_secs(wait)).await;

            let results = service.search_all(&query, &options)?;
            service.shutdown().await;

            if let Some(dir) = output {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
                for result in &results {
                    let path = dir.join(format!("{}.log", result.pod_name));
                    let mut content = result.matches.join("\n");
                    content.push('\n');
                    std::fs::write(&path, content)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                }
                println!("Wrote matches for {} pods to {}", results.len(), dir.display());
            } else if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("Found matches in {} pods", results.len());
                for result in &results {
                    println!("Results for {}", result.pod_name);
                    println!("{}", "-".repeat(64));
                    for line in &result.matches {
                        println!("{}", line);
                    }
                    println!();
                }
            }
        }

        Command::Save { target, dir, wait } => {
            let service = start_watching(&kube_client, &target, config).await?;
            wait_for_history(&service, Duration::from_secs(wait)).await;

            let written = service.export(&dir)?;
            service.shutdown().await;
            println!("Saved logs for {} pods to {}", written.len(), dir.display());
        }
    }

    Ok(())
}

/// Config file first, then command line overrides
fn load_config(cli: &Cli) -> Result<WatcherConfig> {
    let mut config = match &cli.config {
        Some(path) => WatcherConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WatcherConfig::default(),
    };

    if let Some(size) = cli.buffer_size {
        config.buffer_capacity = size;
    }
    if let Some(lines) = cli.tail_lines {
        config.tail_lines = Some(lines);
    }
    config.validate()?;

    Ok(config)
}

fn resolve_namespace(
    kube_client: &KubeClient,
    context: Option<&str>,
    namespace: Option<String>,
) -> String {
    namespace
        .or_else(|| {
            context
                .or(kube_client.current_context())
                .and_then(|ctx| kube_client.context_namespace(ctx))
        })
        .unwrap_or_else(|| "default".to_string())
}

/// Resolve the target to pod names and start a watcher on them
async fn start_watching(
    kube_client: &KubeClient,
    target: &Target,
    config: WatcherConfig,
) -> Result<WatcherService> {
    let client = kube_client
        .client_for_context(target.context.as_deref())
        .await?;
    let namespace = resolve_namespace(kube_client, target.context.as_deref(), target.namespace.clone());

    let mut pods = target.pods.clone();
    if let Some(name) = &target.deployment {
        let deployment = kube_client.get_deployment(&client, &namespace, name).await?;
        let deployment_pods = kube_client
            .get_pods_for_deployment(&client, &namespace, &deployment)
            .await?;
        pods.extend(deployment_pods.into_iter().map(|p| p.name));
    }

    if pods.is_empty() {
        anyhow::bail!("Nothing to watch: pass --deployment or at least one --pod");
    }

    let mut source = KubeLogSource::new(client, &namespace);
    if let Some(container) = &target.container {
        source = source.with_container(container);
    }
    if target.all_containers {
        source = source.with_all_containers();
    }

    let service = WatcherService::new(Arc::new(source), config);
    service.watch_many(&pods)?;
    tracing::info!(namespace = %namespace, pods = pods.len(), "started watching");

    Ok(service)
}

/// Print every line until Ctrl-C
async fn stream_to_console(service: &WatcherService, json: bool) -> Result<()> {
    let mut events = service.stream_all();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            msg = events.next() => {
                let Some(msg) = msg else { break };
                if json {
                    println!("{}", serde_json::to_string(&msg)?);
                } else {
                    println!("{} {}", msg.pod, msg.message);
                }
            }
        }
    }

    Ok(())
}

/// Wait until every pod has an open stream and the history burst has died
/// down, or `timeout` passes. A pod that has not logged anything yet counts
/// as connected once its stream is open.
async fn wait_for_history(service: &WatcherService, timeout: Duration) {
    const POLL: Duration = Duration::from_millis(100);
    const QUIET: Duration = Duration::from_millis(500);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_total = usize::MAX;
    let mut quiet_for = Duration::ZERO;

    while tokio::time::Instant::now() < deadline {
        let pods = service.watched();
        let connected = pods
            .iter()
            .all(|p| p.status != WatchStatus::Connecting || service.is_open(&p.name));
        let total: usize = pods.iter().map(|p| service.buffered(&p.name)).sum();

        if connected && total == last_total {
            quiet_for += POLL;
            if quiet_for >= QUIET {
                return;
            }
        } else {
            quiet_for = Duration::ZERO;
        }
        last_total = total;

        tokio::time::sleep(POLL).await;
    }

    tracing::warn!("timed out waiting for log history; results may be incomplete");
}
