//! CodeServer Operator - lifecycle management for code-server instances

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, Resource};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use codeserver::controller::{
    error_policy, reconcile, Context, ControllerConfig, KubeClient, KubeClientImpl, FIELD_MANAGER,
};
use codeserver::crd::CodeServer;
use codeserver::lease::{self, LeaseTracker, TrackerConfig};

/// CodeServer operator - provisions and recycles code-server instances
#[derive(Parser, Debug)]
#[command(name = "codeserver-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "CODESERVER_LOG_JSON", global = true)]
    log_json: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches CodeServer resources, keeps their Service and workload in
    /// line with the spec, and recycles instances whose lease ran out.
    Controller,
}

/// Controller mode arguments
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "CODESERVER_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Seconds between lease sweeps
    #[arg(long, env = "CODESERVER_SWEEP_INTERVAL_SECS", global = true, default_value = "3")]
    sweep_interval_secs: u64,

    /// Lease applied when a CodeServer sets no positive recycleAfterSeconds
    #[arg(long, env = "CODESERVER_DEFAULT_LEASE_SECS", global = true, default_value = "100")]
    default_lease_secs: i64,

    /// Seconds before a failed reconciliation is retried
    #[arg(long, env = "CODESERVER_RETRY_BACKOFF_SECS", global = true, default_value = "20")]
    retry_backoff_secs: u64,

    /// Recycle attempts per expired lease before it is given up
    #[arg(long, env = "CODESERVER_MAX_RECYCLE_ATTEMPTS", global = true, default_value = "3")]
    max_recycle_attempts: u32,

    /// Buffer size of the reconciler -> tracker channel
    #[arg(long, env = "CODESERVER_LEASE_CHANNEL_CAPACITY", global = true, default_value = "1024")]
    lease_channel_capacity: usize,
}

impl ControllerArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            default_lease_seconds: self.default_lease_secs,
        }
    }

    fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            max_recycle_attempts: self.max_recycle_attempts,
            channel_capacity: self.lease_channel_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let fmt_layer = if cli.log_json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .init();

    if cli.crd {
        let crd = serde_yaml::to_string(&CodeServer::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Ensure the CodeServer CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let name = CodeServer::crd_name();

    tracing::info!(crd = %name, "Installing CodeServer CRD...");
    crds.patch(name, &params, &Patch::Apply(&CodeServer::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CodeServer CRD: {}", e))?;

    tracing::info!("CodeServer CRD installed/updated");
    Ok(())
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run in controller mode
///
/// The lease tracker runs as a background task for the lifetime of the
/// controller and stops once the controller drops its channel sender.
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(namespace = ?args.namespace, "CodeServer controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let kube: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(client.clone()));
    let tracker_config = args.tracker_config();
    let (leases, lease_events) = lease::channel(tracker_config.channel_capacity);
    let tracker = LeaseTracker::new(kube.clone(), lease_events, tracker_config);
    let tracker_handle = tokio::spawn(tracker.run());

    let ctx = Arc::new(Context::new(kube, leases, args.controller_config()));

    let namespace = args.namespace.as_deref();
    let code_servers: Api<CodeServer> = scoped_api(&client, namespace);
    let deployments: Api<Deployment> = scoped_api(&client, namespace);
    let services: Api<Service> = scoped_api(&client, namespace);
    let pods: Api<Pod> = scoped_api(&client, namespace);

    tracing::info!("Starting CodeServer controller...");

    Controller::new(code_servers, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "CodeServer reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "CodeServer reconciliation error");
                }
            }
        })
        .await;

    // The controller held the last sender; the tracker drains and exits
    if let Err(e) = tracker_handle.await {
        tracing::warn!(error = %e, "Lease tracker task failed");
    }

    tracing::info!("CodeServer controller shutting down");
    Ok(())
}
