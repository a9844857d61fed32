//! CodeServer controller implementation
//!
//! This module implements the reconciliation logic for CodeServer resources.
//! It follows the Kubernetes controller pattern: observe current state,
//! determine desired state, calculate diff, and apply changes.
//!
//! Lifecycle: Created -> Ready -> Bound, then Recycled -> Inactive once the
//! lease tracker expires the instance. Errored stops everything.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::client::KubeClient;
use crate::crd::{
    CodeServer, CodeServerStatus, Condition, ConditionType, DEFAULT_LEASE_SECONDS,
};
use crate::lease::{LeaseEvent, LeaseSender, ResourceKey};
use crate::workload::{self, DesiredWorkload};
use crate::Error;

/// Tuning for the CodeServer reconciler
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Delay before retrying a failed reconciliation
    pub retry_backoff: Duration,
    /// Lease used when a spec has no positive `recycleAfterSeconds`
    pub default_lease_seconds: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(20),
            default_lease_seconds: DEFAULT_LEASE_SECONDS,
        }
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds
/// resources that are expensive to create (like Kubernetes clients).
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Producer side of the lease tracker's channel
    pub leases: LeaseSender,
    /// Reconciler tuning
    pub config: ControllerConfig,
}

impl Context {
    /// Create a context from an explicit client implementation
    pub fn new(kube: Arc<dyn KubeClient>, leases: LeaseSender, config: ControllerConfig) -> Self {
        Self {
            kube,
            leases,
            config,
        }
    }
}

/// Reconcile a CodeServer resource
///
/// # Returns
///
/// `Action::await_change()` on success; further passes are driven by watch
/// events, including the status write the lease tracker makes on expiry.
/// Errors are turned into requeues by [`error_policy`].
#[instrument(skip(code_server, ctx), fields(code_server = %code_server.name_any()))]
pub async fn reconcile(code_server: Arc<CodeServer>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = ResourceKey::from_resource(&code_server)?;
    debug!("reconciling code server");

    let Some(current) = ctx.kube.get_code_server(&key.namespace, &key.name).await? else {
        debug!("code server no longer exists");
        return Ok(Action::await_change());
    };

    if current.has_condition(ConditionType::Errored) {
        warn!("code server is errored, awaiting manual intervention");
        return Err(Error::terminal(format!(
            "{} has condition {}",
            key,
            ConditionType::Errored
        )));
    }

    if current.has_condition(ConditionType::Recycled) {
        return tear_down(&current, &key, &ctx).await;
    }

    let mut status = current.status.clone().unwrap_or_default();
    let created = status.add_if_absent(Condition::new(ConditionType::Created, "resource create"));

    ensure_children(&current, &key, &ctx).await?;

    let ready = status.add_if_absent(Condition::new(ConditionType::Ready, "resource ready"));
    let bound = status.add_if_absent(Condition::new(ConditionType::Bound, "resource bound user"));

    if created || ready || bound {
        persist_conditions(&key, status, &ctx).await?;
        info!("code server status updated");
    }

    let lease_seconds = current
        .spec
        .lease_seconds_or(ctx.config.default_lease_seconds);
    ctx.leases.send(LeaseEvent {
        key,
        lease_seconds,
        timestamp: Utc::now(),
        extend: current.spec.add,
    });

    Ok(Action::await_change())
}

/// Error policy for the controller
///
/// Terminal and validation errors wait for a spec or status change; store
/// errors and status conflicts are retried after the configured backoff.
pub fn error_policy(code_server: Arc<CodeServer>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(
            %error,
            code_server = %code_server.name_any(),
            retry_in = ?ctx.config.retry_backoff,
            "reconciliation failed, will retry"
        );
        Action::requeue(ctx.config.retry_backoff)
    } else {
        error!(
            %error,
            code_server = %code_server.name_any(),
            "reconciliation failed permanently"
        );
        Action::await_change()
    }
}

/// Delete the children of a recycled CodeServer and mark it Inactive
///
/// Both workload kinds are removed regardless of the current runtime, so a
/// workload left over from an earlier runtime does not outlive the lease.
async fn tear_down(
    code_server: &CodeServer,
    key: &ResourceKey,
    ctx: &Context,
) -> Result<Action, Error> {
    let deleted_deployment = ctx
        .kube
        .delete_deployment(&key.namespace, &key.name)
        .await?;
    let deleted_pod = ctx.kube.delete_pod(&key.namespace, &key.name).await?;
    let deleted_service = ctx.kube.delete_service(&key.namespace, &key.name).await?;
    debug!(
        deleted_deployment,
        deleted_pod, deleted_service, "children removed"
    );

    let mut status = code_server.status.clone().unwrap_or_default();
    let inactive = Condition::new(ConditionType::Inactive, "expired, resources deleted")
        .with_message("runtime", code_server.spec.runtime.to_string());
    if status.add_if_absent(inactive) {
        let mut updated = code_server.clone();
        updated.status = Some(status);
        ctx.kube.replace_code_server_status(&updated).await?;
        info!("code server recycled, children deleted");
    }

    Ok(Action::await_change())
}

/// Re-read the CodeServer and write `status` onto the fresh copy
///
/// Conditions already present on the server (for example ServerRecycled
/// written by the lease tracker in the meantime) are kept.
async fn persist_conditions(
    key: &ResourceKey,
    status: CodeServerStatus,
    ctx: &Context,
) -> Result<(), Error> {
    let Some(mut fresh) = ctx.kube.get_code_server(&key.namespace, &key.name).await? else {
        debug!("code server deleted before status write");
        return Ok(());
    };

    let mut merged = fresh.status.take().unwrap_or_default();
    for condition in status.conditions {
        merged.add_if_absent(condition);
    }
    fresh.status = Some(merged);

    ctx.kube.replace_code_server_status(&fresh).await
}

async fn ensure_children(
    code_server: &CodeServer,
    key: &ResourceKey,
    ctx: &Context,
) -> Result<(), Error> {
    let desired = workload::desired_children(code_server)?;

    ensure_service(&desired.service, key, ctx).await?;
    match &desired.workload {
        DesiredWorkload::Deployment(deployment) => {
            ensure_deployment(deployment, key, ctx).await?;
            if ctx.kube.delete_pod(&key.namespace, &key.name).await? {
                info!("pod from previous runtime deleted");
            }
        }
        DesiredWorkload::Pod(pod) => {
            ensure_pod(pod, key, ctx).await?;
            if ctx
                .kube
                .delete_deployment(&key.namespace, &key.name)
                .await?
            {
                info!("deployment from previous runtime deleted");
            }
        }
    }
    Ok(())
}

async fn ensure_deployment(
    desired: &Deployment,
    key: &ResourceKey,
    ctx: &Context,
) -> Result<(), Error> {
    match ctx.kube.get_deployment(&key.namespace, &key.name).await? {
        None => {
            ctx.kube.create_deployment(desired).await?;
            info!("deployment created");
        }
        Some(observed) if workload::deployment_needs_update(&observed, desired) => {
            ctx.kube
                .patch_deployment_containers(
                    &key.namespace,
                    &key.name,
                    workload::deployment_containers(desired),
                )
                .await?;
            info!("deployment containers updated");
        }
        Some(_) => debug!("deployment up to date"),
    }
    Ok(())
}

async fn ensure_pod(desired: &Pod, key: &ResourceKey, ctx: &Context) -> Result<(), Error> {
    match ctx.kube.get_pod(&key.namespace, &key.name).await? {
        None => {
            ctx.kube.create_pod(desired).await?;
            info!("pod created");
        }
        Some(observed) if workload::pod_needs_update(&observed, desired) => {
            ctx.kube
                .patch_pod_containers(&key.namespace, &key.name, workload::pod_containers(desired))
                .await?;
            info!("pod containers updated");
        }
        Some(_) => debug!("pod up to date"),
    }
    Ok(())
}

async fn ensure_service(desired: &Service, key: &ResourceKey, ctx: &Context) -> Result<(), Error> {
    match ctx.kube.get_service(&key.namespace, &key.name).await? {
        None => {
            ctx.kube.create_service(desired).await?;
            info!("service created");
        }
        Some(observed) if workload::service_needs_update(&observed, desired) => {
            let patch = workload::service_routing_patch(&observed, desired);
            ctx.kube
                .patch_service_routing(&key.namespace, &key.name, &patch)
                .await?;
            info!("service routing updated");
        }
        Some(_) => debug!("service up to date"),
    }
    Ok(())
}
