use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LimitRange, ResourceQuota};

use crate::quantity;
use crate::recommender::{CurrentResources, Decision, QosClass, TargetSpec, qos_of};
use crate::resolver::EffectiveStrategy;

/* ============================= VERDICT TYPES ============================= */

/// Why a target was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SelfPod,
    NamespaceExcluded,
    QosDegradation,
    OutOfBounds,
    AdmissionWouldReject,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::SelfPod => "SelfPod",
            RejectReason::NamespaceExcluded => "NamespaceExcluded",
            RejectReason::QosDegradation => "QoSDegradation",
            RejectReason::OutOfBounds => "OutOfBounds",
            RejectReason::AdmissionWouldReject => "AdmissionWouldReject",
        }
    }
}

/// Why a target was pushed to a later tick rather than refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    NodePressure,
    RateCap,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferReason::NodePressure => "NodePressure",
            DeferReason::RateCap => "RateCap",
        }
    }
}

/// Result of running a target through the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// Safe to apply.
    Admitted(TargetSpec),
    /// Observation only: log and emit, never patch.
    DryRun(TargetSpec),
    Rejected(RejectReason),
    Deferred(DeferReason),
}

/* ============================= CLUSTER VIEW ============================= */

/// Per-namespace container bounds distilled from LimitRange objects.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NamespaceLimits {
    pub min_cpu_milli: Option<i64>,
    pub max_cpu_milli: Option<i64>,
    pub min_memory_bytes: Option<i64>,
    pub max_memory_bytes: Option<i64>,
}

impl NamespaceLimits {
    /// Fold the Container-type items of a namespace's LimitRanges.
    pub fn from_limit_ranges(ranges: &[LimitRange]) -> Self {
        let mut limits = NamespaceLimits::default();
        for range in ranges {
            let Some(spec) = &range.spec else { continue };
            for item in &spec.limits {
                if item.type_ != "Container" {
                    continue;
                }
                if let Some(max) = &item.max {
                    if let Some(v) = max.get("cpu").and_then(quantity::quantity_as_cpu_milli) {
                        limits.max_cpu_milli =
                            Some(limits.max_cpu_milli.map_or(v, |cur| cur.min(v)));
                    }
                    if let Some(v) = max
                        .get("memory")
                        .and_then(quantity::quantity_as_memory_bytes)
                    {
                        limits.max_memory_bytes =
                            Some(limits.max_memory_bytes.map_or(v, |cur| cur.min(v)));
                    }
                }
                if let Some(min) = &item.min {
                    if let Some(v) = min.get("cpu").and_then(quantity::quantity_as_cpu_milli) {
                        limits.min_cpu_milli =
                            Some(limits.min_cpu_milli.map_or(v, |cur| cur.max(v)));
                    }
                    if let Some(v) = min
                        .get("memory")
                        .and_then(quantity::quantity_as_memory_bytes)
                    {
                        limits.min_memory_bytes =
                            Some(limits.min_memory_bytes.map_or(v, |cur| cur.max(v)));
                    }
                }
            }
        }
        limits
    }
}

/// Remaining quota headroom in a namespace (hard minus used).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuotaHeadroom {
    pub cpu_milli: Option<i64>,
    pub memory_bytes: Option<i64>,
}

impl QuotaHeadroom {
    pub fn from_quotas(quotas: &[ResourceQuota]) -> Self {
        let mut headroom = QuotaHeadroom::default();
        for quota in quotas {
            let Some(status) = &quota.status else { continue };
            let (Some(hard), Some(used)) = (&status.hard, &status.used) else {
                continue;
            };
            let remaining = |key: &str, parse: fn(&str) -> Option<i64>| -> Option<i64> {
                let h = hard.get(key).and_then(|q| parse(&q.0))?;
                let u = used.get(key).and_then(|q| parse(&q.0)).unwrap_or(0);
                Some((h - u).max(0))
            };
            for key in ["requests.cpu", "cpu"] {
                if let Some(v) = remaining(key, quantity::parse_cpu_milli) {
                    headroom.cpu_milli = Some(headroom.cpu_milli.map_or(v, |cur| cur.min(v)));
                }
            }
            for key in ["requests.memory", "memory"] {
                if let Some(v) = remaining(key, quantity::parse_memory_bytes) {
                    headroom.memory_bytes =
                        Some(headroom.memory_bytes.map_or(v, |cur| cur.min(v)));
                }
            }
        }
        headroom
    }
}

/// Remaining allocatable on the pod's node, advisory only.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeHeadroom {
    pub cpu_milli: i64,
    pub memory_bytes: i64,
}

/* ============================= GATE CONTEXT ============================= */

/// Everything the gate needs besides the target itself.
#[derive(Debug, Clone, Default)]
pub struct GateContext {
    pub operator_namespace: String,
    /// Name of the operator's own pod, when known.
    pub self_pod_name: Option<String>,
    pub namespace_exclude: Vec<String>,
    pub namespace_include: Vec<String>,
    pub dry_run: bool,
    pub updates_issued: u32,
    pub max_updates_per_run: u32,
    pub namespace_limits: Option<NamespaceLimits>,
    pub quota_headroom: Option<QuotaHeadroom>,
    pub node_headroom: Option<NodeHeadroom>,
    pub node_headroom_check: bool,
    pub node_headroom_tolerance_percent: u32,
}

/// Built-in system namespaces never touched regardless of configuration.
pub fn is_system_namespace(ns: &str) -> bool {
    ns.starts_with("kube-")
        || ns.ends_with("-system")
        || matches!(ns, "cert-manager" | "istio-system" | "monitoring" | "observability")
}

/* ============================= THE GATE ============================= */

/// Validate a recommended target before it leaves the process.
///
/// Checks run in a fixed order and the first failure wins. Only targets
/// whose decision actually mutates something reach the later checks.
pub fn check(
    pod_namespace: &str,
    pod_name: &str,
    current: &CurrentResources,
    target: TargetSpec,
    strategy: &EffectiveStrategy,
    ctx: &GateContext,
) -> GateOutcome {
    // SelfProtect: both the namespace and the pod-identity paths count.
    if pod_namespace == ctx.operator_namespace
        || ctx.self_pod_name.as_deref() == Some(pod_name)
    {
        return GateOutcome::Rejected(RejectReason::SelfPod);
    }

    // NamespaceScope
    if is_system_namespace(pod_namespace)
        || ctx.namespace_exclude.iter().any(|ns| ns == pod_namespace)
        || (!ctx.namespace_include.is_empty()
            && !ctx.namespace_include.iter().any(|ns| ns == pod_namespace))
    {
        return GateOutcome::Rejected(RejectReason::NamespaceExcluded);
    }

    if !(target.cpu_changed || target.memory_changed) {
        // Nothing to mutate; deferrals ride through so cooldowns apply.
        return GateOutcome::Admitted(target);
    }

    // QoSClassShift
    let target_resources = CurrentResources {
        cpu_request_milli: target.cpu_request_milli,
        cpu_limit_milli: target.cpu_limit_milli,
        memory_request_bytes: target.memory_request_bytes,
        memory_limit_bytes: target.memory_limit_bytes,
    };
    let current_qos = qos_of(current);
    let target_qos = qos_of(&target_resources);
    if (current_qos == QosClass::Guaranteed && target_qos != QosClass::Guaranteed)
        || (current_qos != QosClass::BestEffort && target_qos == QosClass::BestEffort)
    {
        return GateOutcome::Rejected(RejectReason::QosDegradation);
    }

    // Bounds: the clamps already ran; a violation here is a logic error
    // upstream and must never reach the API server.
    let cpu_in_bounds = !target.cpu_changed
        || (target.cpu_request_milli >= strategy.cpu.min_request
            && target.cpu_request_milli <= target.cpu_limit_milli
            && target.cpu_limit_milli <= strategy.cpu.max_limit);
    let memory_in_bounds = !target.memory_changed
        || (target.memory_request_bytes >= strategy.memory.min_request
            && target.memory_request_bytes <= target.memory_limit_bytes
            && target.memory_limit_bytes <= strategy.memory.max_limit);
    if !cpu_in_bounds || !memory_in_bounds {
        return GateOutcome::Rejected(RejectReason::OutOfBounds);
    }

    // LimitRange
    if let Some(limits) = &ctx.namespace_limits {
        let violates = limits
            .max_cpu_milli
            .is_some_and(|max| target.cpu_limit_milli > max)
            || limits
                .min_cpu_milli
                .is_some_and(|min| target.cpu_request_milli < min)
            || limits
                .max_memory_bytes
                .is_some_and(|max| target.memory_limit_bytes > max)
            || limits
                .min_memory_bytes
                .is_some_and(|min| target.memory_request_bytes < min);
        if violates {
            return GateOutcome::Rejected(RejectReason::AdmissionWouldReject);
        }
    }

    // ResourceQuota: only request increases consume headroom.
    if let Some(quota) = &ctx.quota_headroom {
        let cpu_delta = target.cpu_request_milli - current.cpu_request_milli;
        let memory_delta = target.memory_request_bytes - current.memory_request_bytes;
        let violates = quota.cpu_milli.is_some_and(|room| cpu_delta > room)
            || quota.memory_bytes.is_some_and(|room| memory_delta > room);
        if violates {
            return GateOutcome::Rejected(RejectReason::AdmissionWouldReject);
        }
    }

    // NodeHeadroom (advisory): defer, never reject.
    if ctx.node_headroom_check
        && target.decision == Decision::Upscale
        && let Some(node) = &ctx.node_headroom
    {
        let tolerance = 1.0 + ctx.node_headroom_tolerance_percent as f64 / 100.0;
        let cpu_delta = (target.cpu_request_milli - current.cpu_request_milli).max(0);
        let memory_delta = (target.memory_request_bytes - current.memory_request_bytes).max(0);
        if cpu_delta as f64 > node.cpu_milli as f64 * tolerance
            || memory_delta as f64 > node.memory_bytes as f64 * tolerance
        {
            return GateOutcome::Deferred(DeferReason::NodePressure);
        }
    }

    // DryRun
    if ctx.dry_run || strategy.dry_run {
        return GateOutcome::DryRun(target);
    }

    // RateCap
    if ctx.updates_issued >= ctx.max_updates_per_run {
        return GateOutcome::Deferred(DeferReason::RateCap);
    }

    GateOutcome::Admitted(target)
}

/// The ordered source chain attached to audit events for rejections.
pub fn source_chain(strategy: &EffectiveStrategy) -> BTreeMap<String, String> {
    strategy
        .sources
        .iter()
        .map(|(field, chain)| (field.clone(), chain.join(" -> ")))
        .collect()
}

/* ============================= TESTS ============================= */
