use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::ResizeError;
use crate::quantity;
use crate::recommender::{PlatformCaps, TargetSpec};

pub const FIELD_MANAGER: &str = "kube-rightsizer";

/* ============================= TYPES ============================= */

/// Workload kinds the restart-based fallback knows how to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParentKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
}

impl ParentKind {
    pub fn from_owner_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(ParentKind::Deployment),
            "StatefulSet" => Some(ParentKind::StatefulSet),
            "DaemonSet" => Some(ParentKind::DaemonSet),
            "Job" => Some(ParentKind::Job),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParentKind::Deployment => "Deployment",
            ParentKind::StatefulSet => "StatefulSet",
            ParentKind::DaemonSet => "DaemonSet",
            ParentKind::Job => "Job",
        }
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workload a fallback patch addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentWorkload {
    pub kind: ParentKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ParentWorkload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// How a resize reached the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMethod {
    Subresource,
    ParentPatch,
}

/// A successfully applied resize.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeOutcome {
    pub method: ResizeMethod,
    pub retries: u32,
}

/// Executor knobs taken from the resolved settings each tick.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub retry_attempts: u32,
    pub retry_interval: Duration,
    /// Parent kinds eligible for the restart-based fallback.
    pub parent_patch_kinds: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        ExecutorSettings {
            retry_attempts: 3,
            retry_interval: Duration::from_secs(5),
            parent_patch_kinds: vec!["Deployment".to_string()],
        }
    }
}

/* ============================= DISCOVERY ============================= */

/// Probe the platform's resize capabilities once at startup.
///
/// The pod `resize` subresource is looked up in the core v1 resource
/// list; in-place memory decrease tracks the server minor version.
pub async fn probe_platform_caps(client: &Client) -> Result<PlatformCaps> {
    let resources = client
        .list_core_api_resources("v1")
        .await
        .context("Failed to list core API resources")?;

    let resize_subresource = resources
        .resources
        .iter()
        .any(|r| r.name == "pods/resize");

    let version = client
        .apiserver_version()
        .await
        .context("Failed to read apiserver version")?;
    let minor: u32 = version
        .minor
        .trim_end_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(0);

    Ok(PlatformCaps {
        resize_subresource,
        in_place_memory_decrease: resize_subresource && minor >= 33,
    })
}

/* ============================= OWNER RESOLUTION ============================= */

/// First hop of owner resolution, decided without touching the API.
///
/// A ReplicaSet reference cannot be patched itself and does not name its
/// Deployment, so it needs a second hop through the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerLink {
    Direct(ParentWorkload),
    ViaReplicaSet { namespace: String, name: String },
}

/// Classify a pod's owner references. `None` means the pod is standalone
/// or owned by something the fallback cannot address.
pub fn parent_link(pod: &Pod) -> Option<OwnerLink> {
    let namespace = pod.namespace().unwrap_or_default();
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find_map(|owner| {
            if owner.kind == "ReplicaSet" {
                return Some(OwnerLink::ViaReplicaSet {
                    namespace: namespace.clone(),
                    name: owner.name.clone(),
                });
            }
            ParentKind::from_owner_kind(&owner.kind).map(|kind| {
                OwnerLink::Direct(ParentWorkload {
                    kind,
                    namespace: namespace.clone(),
                    name: owner.name.clone(),
                })
            })
        })
}

/// Resolve the patchable parent workload.
///
/// ReplicaSet-owned pods follow the ReplicaSet's own owner reference to
/// the Deployment it belongs to; guessing the Deployment from the
/// pod-template-hash in the ReplicaSet name breaks on names containing
/// dashes, so the extra read is worth it.
pub async fn resolve_parent(
    client: &Client,
    pod: &Pod,
) -> std::result::Result<Option<ParentWorkload>, kube::Error> {
    match parent_link(pod) {
        None => Ok(None),
        Some(OwnerLink::Direct(workload)) => Ok(Some(workload)),
        Some(OwnerLink::ViaReplicaSet { namespace, name }) => {
            let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), &namespace);
            let replica_set = replica_sets.get(&name).await?;
            let deployment = replica_set
                .metadata
                .owner_references
                .unwrap_or_default()
                .into_iter()
                .find(|owner| owner.kind == "Deployment");
            Ok(deployment.map(|owner| ParentWorkload {
                kind: ParentKind::Deployment,
                namespace,
                name: owner.name,
            }))
        }
    }
}

/* ============================= PATCH BODIES ============================= */

/// One container's admitted target, ready to patch.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerChange {
    pub container: String,
    pub target: TargetSpec,
}

fn resources_value(target: &TargetSpec) -> serde_json::Value {
    serde_json::json!({
        "requests": {
            "cpu": quantity::format_cpu_milli(target.cpu_request_milli),
            "memory": quantity::format_memory_bytes(target.memory_request_bytes),
        },
        "limits": {
            "cpu": quantity::format_cpu_milli(target.cpu_limit_milli),
            "memory": quantity::format_memory_bytes(target.memory_limit_bytes),
        }
    })
}

fn container_entries(changes: &[ContainerChange]) -> Vec<serde_json::Value> {
    changes
        .iter()
        .map(|change| {
            serde_json::json!({
                "name": change.container,
                "resources": resources_value(&change.target),
            })
        })
        .collect()
}

/// Body for the pod resize subresource. All changed containers ride in
/// one patch, so a pod is the subject of at most one mutation per tick.
pub fn build_resize_patch(changes: &[ContainerChange]) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "containers": container_entries(changes),
        }
    })
}

/// Body for the parent-workload fallback (pod template patch).
pub fn build_parent_patch(changes: &[ContainerChange]) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        "rightsizer.io/resized-by": FIELD_MANAGER
                    }
                },
                "spec": {
                    "containers": container_entries(changes),
                }
            }
        }
    })
}

/* ============================= APPLY ============================= */

async fn patch_pod_resize(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    body: &serde_json::Value,
) -> std::result::Result<(), kube::Error> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    pods.patch_subresource(
        "resize",
        pod_name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Strategic(body),
    )
    .await
    .map(|_| ())
}

async fn patch_parent(
    client: &Client,
    workload: &ParentWorkload,
    body: &serde_json::Value,
) -> std::result::Result<(), ResizeError> {
    let pp = PatchParams::apply(FIELD_MANAGER);
    let patch = Patch::Strategic(body);

    let result = match workload.kind {
        ParentKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(client.clone(), &workload.namespace);
            api.patch(&workload.name, &pp, &patch).await.map(|_| ())
        }
        ParentKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), &workload.namespace);
            api.patch(&workload.name, &pp, &patch).await.map(|_| ())
        }
        ParentKind::DaemonSet => {
            let api: Api<DaemonSet> = Api::namespaced(client.clone(), &workload.namespace);
            api.patch(&workload.name, &pp, &patch).await.map(|_| ())
        }
        ParentKind::Job => {
            let api: Api<Job> = Api::namespaced(client.clone(), &workload.namespace);
            api.patch(&workload.name, &pp, &patch).await.map(|_| ())
        }
    };

    result.map_err(ResizeError::classify)
}

/// Apply a target to a pod.
///
/// Primary path is the resize subresource. When the platform lacks it,
/// the parent workload is patched instead, but only for kinds the
/// settings allow. Transient failures retry with exponential backoff up
/// to the configured budget; conflicts get one immediate refetch-and-retry
/// before consuming the budget.
pub async fn apply_resize(
    client: &Client,
    pod: &Pod,
    changes: &[ContainerChange],
    caps: &PlatformCaps,
    settings: &ExecutorSettings,
) -> std::result::Result<ResizeOutcome, ResizeError> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    if changes.is_empty() {
        return Err(ResizeError::Fatal("empty change set".to_string()));
    }

    if !caps.resize_subresource {
        return apply_via_parent(client, pod, changes, settings).await;
    }

    let body = build_resize_patch(changes);
    let mut conflict_refetch_used = false;
    let mut attempt: u32 = 0;

    loop {
        match patch_pod_resize(client, &namespace, &name, &body).await {
            Ok(()) => {
                info!(
                    pod = %name,
                    namespace = %namespace,
                    containers = changes.len(),
                    retries = attempt,
                    "resize_patch_applied"
                );
                return Ok(ResizeOutcome {
                    method: ResizeMethod::Subresource,
                    retries: attempt,
                });
            }
            Err(e) => {
                let classified = ResizeError::classify(e);

                if matches!(classified, ResizeError::Conflict(_)) && !conflict_refetch_used {
                    // Refetch to refresh the cached resource version, then
                    // retry immediately without burning budget.
                    conflict_refetch_used = true;
                    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
                    if let Err(refetch) = pods.get(&name).await {
                        return Err(ResizeError::classify(refetch));
                    }
                    debug!(pod = %name, "resize_conflict_refetch");
                    continue;
                }

                if classified.is_retryable() && attempt < settings.retry_attempts {
                    let backoff = settings.retry_interval * 2u32.pow(attempt);
                    warn!(
                        pod = %name,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %classified,
                        "resize_patch_retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                    continue;
                }

                return Err(classified);
            }
        }
    }
}

async fn apply_via_parent(
    client: &Client,
    pod: &Pod,
    changes: &[ContainerChange],
    settings: &ExecutorSettings,
) -> std::result::Result<ResizeOutcome, ResizeError> {
    let name = pod.name_any();

    let workload = resolve_parent(client, pod)
        .await
        .map_err(ResizeError::classify)?
        .ok_or_else(|| {
            ResizeError::Fatal(format!("pod {name} has no patchable parent workload"))
        })?;

    if !rollout_permitted(workload.kind, &settings.parent_patch_kinds) {
        return Err(ResizeError::DecreaseUnsupported(format!(
            "rollout of {workload} is not permitted by parentPatchKinds"
        )));
    }

    let body = build_parent_patch(changes);
    patch_parent(client, &workload, &body).await?;

    info!(
        workload = %workload,
        pod = %name,
        containers = changes.len(),
        "parent_patch_applied"
    );

    Ok(ResizeOutcome {
        method: ResizeMethod::ParentPatch,
        retries: 0,
    })
}

/// Whether the fallback may roll this parent kind.
pub fn rollout_permitted(kind: ParentKind, allowed: &[String]) -> bool {
    allowed.iter().any(|k| k == kind.as_str())
}

/* ============================= POD CONDITIONS ============================= */

/// Resize progress reported on the pod's status conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePhase {
    Pending,
    InProgress,
    Completed,
}

impl ResizePhase {
    pub fn condition_type(&self) -> &'static str {
        match self {
            ResizePhase::Pending => "ResizePending",
            ResizePhase::InProgress => "ResizeInProgress",
            ResizePhase::Completed => "ResizeCompleted",
        }
    }
}

/// Record the resize phase as a pod condition, stamped with the pod's
/// current generation. Failures here are logged, never fatal.
pub async fn update_resize_condition(client: &Client, pod: &Pod, phase: ResizePhase) {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let generation = pod.metadata.generation.unwrap_or(0);

    let condition = serde_json::json!({
        "type": phase.condition_type(),
        "status": "True",
        "reason": FIELD_MANAGER,
        "message": format!("generation {generation}"),
        "lastTransitionTime": chrono::Utc::now().to_rfc3339(),
    });
    let body = serde_json::json!({ "status": { "conditions": [condition] } });

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    if let Err(e) = pods
        .patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Strategic(&body),
        )
        .await
    {
        debug!(pod = %name, error = %e, "resize_condition_update_failed");
    }
}

/* ============================= TESTS ============================= */
