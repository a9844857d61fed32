//! Desired child resources for a CodeServer
//!
//! This module turns a CodeServer into the Kubernetes objects that back it:
//! - Deployment: the default single-replica workload
//! - Pod: the alternate bare workload (`runtime: Pod`)
//! - Service: cluster-internal HTTP exposure on port 8080
//!
//! It also holds the drift predicates the reconciler uses to decide whether
//! an observed child must be patched. Everything here is pure.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{CodeServer, WorkloadRuntime};
use crate::Error;

/// Name of the single code server container
pub const CONTAINER_NAME: &str = "code-server";

/// Label key tying the Service and workload together
pub const APP_LABEL: &str = "app";

/// Port the code server listens on and the Service exposes
pub const HTTP_PORT: i32 = 8080;

/// Name of the Service port
pub const HTTP_PORT_NAME: &str = "http";

const PULL_ALWAYS: &str = "Always";
const RESTART_NEVER: &str = "Never";
const PROTOCOL_TCP: &str = "TCP";

// =============================================================================
// Desired State
// =============================================================================

/// The workload half of a CodeServer's child set
#[derive(Clone, Debug, PartialEq)]
pub enum DesiredWorkload {
    /// Single-replica Deployment
    Deployment(Box<Deployment>),
    /// Bare Pod
    Pod(Box<Pod>),
}

/// Every child object a CodeServer should own
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredChildren {
    /// Service exposing the code server
    pub service: Service,
    /// Deployment or Pod running the code server
    pub workload: DesiredWorkload,
}

/// Build the full child set for a CodeServer according to its runtime
pub fn desired_children(cs: &CodeServer) -> Result<DesiredChildren, Error> {
    let service = desired_service(cs)?;
    let workload = match cs.spec.runtime {
        WorkloadRuntime::Deployment => {
            DesiredWorkload::Deployment(Box::new(desired_deployment(cs)?))
        }
        WorkloadRuntime::Pod => DesiredWorkload::Pod(Box::new(desired_pod(cs)?)),
    };
    Ok(DesiredChildren { service, workload })
}

/// Build the desired Deployment for a CodeServer
pub fn desired_deployment(cs: &CodeServer) -> Result<Deployment, Error> {
    let labels = app_labels(cs);
    Ok(Deployment {
        metadata: child_meta(cs)?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![code_server_container(cs)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the desired bare Pod for a CodeServer
pub fn desired_pod(cs: &CodeServer) -> Result<Pod, Error> {
    let mut metadata = child_meta(cs)?;
    metadata.labels = Some(app_labels(cs));
    Ok(Pod {
        metadata,
        spec: Some(PodSpec {
            containers: vec![code_server_container(cs)],
            restart_policy: Some(RESTART_NEVER.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the desired Service for a CodeServer
pub fn desired_service(cs: &CodeServer) -> Result<Service, Error> {
    Ok(Service {
        metadata: child_meta(cs)?,
        spec: Some(ServiceSpec {
            selector: Some(app_labels(cs)),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: HTTP_PORT,
                protocol: Some(PROTOCOL_TCP.to_string()),
                target_port: Some(IntOrString::Int(HTTP_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn child_meta(cs: &CodeServer) -> Result<ObjectMeta, Error> {
    let namespace = cs
        .namespace()
        .ok_or_else(|| Error::validation(format!("CodeServer {} has no namespace", cs.name_any())))?;
    Ok(ObjectMeta {
        name: Some(cs.name_any()),
        namespace: Some(namespace),
        owner_references: cs.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    })
}

fn app_labels(cs: &CodeServer) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), cs.name_any())])
}

fn code_server_container(cs: &CodeServer) -> Container {
    let env = &cs.spec.envs;
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(cs.spec.image.clone()),
        image_pull_policy: Some(PULL_ALWAYS.to_string()),
        env: if env.is_empty() { None } else { Some(env.clone()) },
        ..Default::default()
    }
}

// =============================================================================
// Drift Detection
// =============================================================================
//
// Observed objects come back from the API server with defaulted fields
// (terminationMessagePath, clusterIP, ...). The predicates below only look at
// the fields the builder sets.

/// Returns true if the Service's ports or selector drifted
pub fn service_needs_update(observed: &Service, desired: &Service) -> bool {
    let observed = observed.spec.as_ref();
    let desired = desired.spec.as_ref();

    service_port_keys(observed) != service_port_keys(desired)
        || service_selector(observed) != service_selector(desired)
}

/// JSON merge patch that moves an observed Service onto the desired routing
///
/// `spec.ports` is replaced as a whole. Selector keys the desired Service does
/// not carry are set to null, since a merge patch otherwise keeps them.
pub fn service_routing_patch(observed: &Service, desired: &Service) -> serde_json::Value {
    let desired_spec = desired.spec.as_ref();
    let ports = desired_spec
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();

    let mut selector = serde_json::Map::new();
    for stale in service_selector(observed.spec.as_ref()).keys() {
        selector.insert(stale.clone(), serde_json::Value::Null);
    }
    for (key, value) in service_selector(desired_spec) {
        selector.insert(key, serde_json::Value::String(value));
    }

    serde_json::json!({
        "spec": { "ports": ports, "selector": selector }
    })
}

fn service_port_keys(spec: Option<&ServiceSpec>) -> Vec<PortKey<'_>> {
    spec.and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().map(port_key).collect())
        .unwrap_or_default()
}

fn service_selector(spec: Option<&ServiceSpec>) -> BTreeMap<String, String> {
    spec.and_then(|s| s.selector.clone()).unwrap_or_default()
}

/// Returns true if the Deployment's pod-template containers drifted
pub fn deployment_needs_update(observed: &Deployment, desired: &Deployment) -> bool {
    containers_differ(
        deployment_containers(observed),
        deployment_containers(desired),
    )
}

/// Returns true if the Pod's containers drifted
pub fn pod_needs_update(observed: &Pod, desired: &Pod) -> bool {
    containers_differ(pod_containers(observed), pod_containers(desired))
}

/// Containers inside a Deployment's pod template
pub fn deployment_containers(deployment: &Deployment) -> &[Container] {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
}

/// Containers of a Pod
pub fn pod_containers(pod: &Pod) -> &[Container] {
    pod.spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
}

fn containers_differ(observed: &[Container], desired: &[Container]) -> bool {
    observed.len() != desired.len()
        || observed
            .iter()
            .zip(desired)
            .any(|(o, d)| container_key(o) != container_key(d))
}

type ContainerKey<'a> = (&'a str, Option<&'a str>, Option<&'a str>, &'a [EnvVar]);

fn container_key(c: &Container) -> ContainerKey<'_> {
    (
        c.name.as_str(),
        c.image.as_deref(),
        c.image_pull_policy.as_deref(),
        c.env.as_deref().unwrap_or_default(),
    )
}

type PortKey<'a> = (Option<&'a str>, i32, &'a str, Option<&'a IntOrString>);

fn port_key(p: &ServicePort) -> PortKey<'_> {
    (
        p.name.as_deref(),
        p.port,
        p.protocol.as_deref().unwrap_or(PROTOCOL_TCP),
        p.target_port.as_ref(),
    )
}
