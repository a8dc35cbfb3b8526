use std::sync::LazyLock;

use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use prometheus::{GaugeVec, IntCounter, IntCounterVec, IntGauge, Registry};
use tracing::{debug, info};

use crate::recommender::TargetSpec;

/* ============================= PROMETHEUS ============================= */

// Metric names below are part of the external contract; never rename.

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static PODS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "rightsizer_pods_processed_total",
        "Total pods evaluated across all reconcile ticks",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static PODS_RESIZED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "rightsizer_pods_resized_total",
        "Total pods successfully resized",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static CPU_ADJUSTMENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "rightsizer_cpu_adjustments_total",
        "Total CPU request/limit adjustments applied",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static MEMORY_ADJUSTMENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "rightsizer_memory_adjustments_total",
        "Total memory request/limit adjustments applied",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RESIZE_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rightsizer_resize_failed_total",
            "Total resize failures by classified reason",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RESIZE_DEFERRED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "rightsizer_resize_deferred_total",
            "Total resize deferrals by reason",
        ),
        &["reason"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static ACTIVE_PODS: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "rightsizer_active_pods_total",
        "Pods currently eligible for right-sizing",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static CPU_USAGE_PERCENT: LazyLock<GaugeVec> = LazyLock::new(|| {
    let g = GaugeVec::new(
        prometheus::Opts::new(
            "rightsizer_cpu_usage_percent",
            "Observed CPU utilization against the current request, per pod",
        ),
        &["pod"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static MEMORY_USAGE_PERCENT: LazyLock<GaugeVec> = LazyLock::new(|| {
    let g = GaugeVec::new(
        prometheus::Opts::new(
            "rightsizer_memory_usage_percent",
            "Observed memory utilization against the current request, per pod",
        ),
        &["pod"],
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static OPTIMIZATIONS_APPLIED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "rightsizer_optimizations_applied_total",
        "Optimizations applied over the lifetime of the current leader",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

/// Force-init every metric so all series appear on /metrics from startup.
pub fn force_init_metrics() {
    LazyLock::force(&PODS_PROCESSED);
    LazyLock::force(&PODS_RESIZED);
    LazyLock::force(&CPU_ADJUSTMENTS);
    LazyLock::force(&MEMORY_ADJUSTMENTS);
    LazyLock::force(&RESIZE_FAILED);
    LazyLock::force(&RESIZE_DEFERRED);
    LazyLock::force(&ACTIVE_PODS);
    LazyLock::force(&CPU_USAGE_PERCENT);
    LazyLock::force(&MEMORY_USAGE_PERCENT);
    LazyLock::force(&OPTIMIZATIONS_APPLIED);
}

/* ============================= EVENTS ============================= */

/// Audit event reasons written to the orchestrator.
///
/// `NoChange` covers noop decisions; every decision category produces an
/// event so the pod's event log reads as a full audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditReason {
    Resized,
    NoChange,
    ResizeFailed,
    ResizeDeferred,
    SelfProtected,
    PolicyInvalid,
}

impl AuditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditReason::Resized => "Resized",
            AuditReason::NoChange => "NoChange",
            AuditReason::ResizeFailed => "ResizeFailed",
            AuditReason::ResizeDeferred => "ResizeDeferred",
            AuditReason::SelfProtected => "SelfProtected",
            AuditReason::PolicyInvalid => "PolicyInvalid",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            AuditReason::Resized | AuditReason::NoChange => EventType::Normal,
            AuditReason::ResizeFailed | AuditReason::ResizeDeferred => EventType::Warning,
            AuditReason::SelfProtected => EventType::Warning,
            AuditReason::PolicyInvalid => EventType::Warning,
        }
    }
}

fn event_reporter() -> Reporter {
    Reporter {
        controller: "kube-rightsizer".to_string(),
        instance: std::env::var("POD_NAME").ok(),
    }
}

/// Publish an audit event against a pod. Event failures are logged and
/// swallowed; auditing must never block the reconcile path.
pub async fn publish_pod_event(client: &Client, pod: &Pod, reason: AuditReason, note: String) {
    let reference = ObjectReference {
        kind: Some("Pod".to_string()),
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        uid: pod.metadata.uid.clone(),
        api_version: Some("v1".to_string()),
        ..Default::default()
    };
    publish_event(client, reference, reason, note).await;
}

/// Publish an audit event against an arbitrary object reference.
pub async fn publish_event(
    client: &Client,
    reference: ObjectReference,
    reason: AuditReason,
    note: String,
) {
    let recorder = Recorder::new(client.clone(), event_reporter(), reference);
    let event = Event {
        type_: reason.event_type(),
        reason: reason.as_str().to_string(),
        note: Some(note),
        action: "Reconcile".to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(event).await {
        debug!(error = %e, reason = reason.as_str(), "audit_event_publish_failed");
    }
}

/// Object reference for a cluster-scoped CRD instance.
pub fn crd_reference<K>(object: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    ObjectReference {
        kind: Some(K::kind(&()).to_string()),
        api_version: Some(K::api_version(&()).to_string()),
        name: Some(object.name_any()),
        uid: object.meta().uid.clone(),
        ..Default::default()
    }
}

/* ============================= DECISION LOGS ============================= */

/// One structured line per decision, with old and new quantities.
pub fn log_decision(namespace: &str, pod: &str, container: &str, target: &TargetSpec) {
    info!(
        namespace = %namespace,
        pod = %pod,
        container = %container,
        decision = target.decision.as_str(),
        reason = %target.reason,
        cpu_request_milli = target.cpu_request_milli,
        cpu_limit_milli = target.cpu_limit_milli,
        memory_request_bytes = target.memory_request_bytes,
        memory_limit_bytes = target.memory_limit_bytes,
        qos = target.qos.as_str(),
        "reconcile_decision"
    );
}

/* ============================= TESTS ============================= */
