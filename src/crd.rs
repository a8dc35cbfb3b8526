use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= STRATEGY TYPES ============================= */

/// Statistic used to summarize the usage window before applying multipliers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ScalingAlgorithm {
    Mean,
    #[default]
    Percentile,
    Max,
    Ewma,
}

/// Sizing strategy for a single resource kind (cpu or memory).
///
/// Every field is optional: omitted fields fall through to lower-priority
/// sources during resolution, and ultimately to built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStrategy {
    /// Multiplier applied to the observed usage to derive the new request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_multiplier: Option<f64>,

    /// Multiplier applied to the new request to derive the new limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_multiplier: Option<f64>,

    /// Floor for the computed request (quantity string, e.g. "10m", "16Mi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_request: Option<String>,

    /// Ceiling for both request and limit (quantity string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<String>,

    /// Utilization at or above which the container is a scale-up candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold: Option<f64>,

    /// Utilization at or below which the container is a scale-down candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_threshold: Option<f64>,

    /// Number of usage samples retained per container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_window: Option<u32>,

    /// Statistic applied over the retained window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<ScalingAlgorithm>,

    /// Percentile (1-99) used when `algorithm` is `percentile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentile: Option<u8>,
}

/// Per-resource strategy pair carried by the global config.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ResourceStrategy>,
}

/* ============================= POLICY TYPES ============================= */

/// Preset aggressiveness for a policy.
///
/// A preset seeds the strategy fields before explicit overrides are
/// applied; `custom` seeds nothing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PolicyMode {
    Observe,
    Conservative,
    #[default]
    Balanced,
    Aggressive,
    Adaptive,
    Custom,
}

/// Workload selector: AND across dimensions, OR within each dimension.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicySelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Vec<String>>,

    /// Label key/value pairs; a pod matches if any pair is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Owner workload kinds (Deployment, StatefulSet, DaemonSet, Job).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_kinds: Option<Vec<String>>,

    /// Annotation key/value pairs; a pod matches if any pair is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Daily activation window for a policy. Outside the window the policy is
/// skipped during resolution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleWindow {
    /// Window start, "HH:MM" (UTC).
    pub start: String,

    /// Window end, "HH:MM" (UTC). An end before the start wraps midnight.
    pub end: String,

    /// Weekday names ("Mon".."Sun"); omitted means every day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<String>>,
}

/* ============================= CONFIG CRD ============================= */

/// RightSizerConfig is the singleton global configuration (named `default`).
///
/// Cluster-scoped. Operational knobs live here; sizing strategy defaults
/// can be overridden per workload by RightSizerPolicy objects.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "rightsizer.io",
    version = "v1",
    kind = "RightSizerConfig",
    plural = "rightsizerconfigs",
    status = "RightSizerConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RightSizerConfigSpec {
    /// Master switch; when false the reconciler idles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Observe and report, never mutate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,

    /// Seconds between reconcile ticks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_interval_seconds: Option<u64>,

    /// Pods processed concurrently within a tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Pause between batches, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_between_batches_seconds: Option<u64>,

    /// Hard cap on mutations per tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_updates_per_run: Option<u32>,

    /// Retry budget for transient resize failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,

    /// Initial retry backoff, seconds (doubles per attempt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_seconds: Option<u64>,

    /// Minimum pod age before it becomes eligible, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pod_age_seconds: Option<u64>,

    /// Namespaces to consider; empty means all non-system namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_include: Option<Vec<String>>,

    /// Namespaces to always skip (in addition to system namespaces).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_exclude: Option<Vec<String>>,

    /// Namespace the operator itself runs in. Computed from the
    /// environment when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_namespace: Option<String>,

    /// Defer upscales that exceed remaining node allocatable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_headroom_check: Option<bool>,

    /// Percent of node allocatable that may be overshot before deferring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_headroom_tolerance_percent: Option<u32>,

    /// Parent workload kinds eligible for the restart-based fallback path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_patch_kinds: Option<Vec<String>>,

    /// Cluster-wide default sizing strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<StrategySpec>,
}

/* ============================= POLICY CRD ============================= */

/// RightSizerPolicy overrides the default strategy for selected workloads.
///
/// Higher `priority` wins; ties break on lexicographic name.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "rightsizer.io",
    version = "v1",
    kind = "RightSizerPolicy",
    plural = "rightsizerpolicies",
    status = "RightSizerPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RightSizerPolicySpec {
    /// Overlay precedence; higher values override lower ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Preset seeding the strategy fields (see `PolicyMode`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PolicyMode>,

    /// Which workloads this policy applies to. An omitted selector
    /// matches everything in scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<PolicySelector>,

    /// CPU strategy overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceStrategy>,

    /// Memory strategy overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ResourceStrategy>,

    /// Permit restart-based resizes (parent patch, memory shrink).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_allowed: Option<bool>,

    /// Daily activation window; omitted means always active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleWindow>,
}

/* ============================= STATUS ============================= */

/// Lifecycle phase reported on both CRDs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum CrdPhase {
    #[default]
    Active,
    Degraded,
    Invalid,
}

/// A single status condition, mirroring the orchestrator convention.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False", or "Unknown".
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RightSizerConfigStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CrdPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<StatusCondition>>,

    /// ISO 8601 timestamp of the last completed reconcile tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RightSizerPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CrdPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<StatusCondition>>,

    /// Validation failures that made the policy inactive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,
}

/// Name of the singleton config object.
pub const CONFIG_NAME: &str = "default";

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_config_crd_generates_valid_yaml() {
        let crd = RightSizerConfig::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("rightsizer.io"));
        assert!(yaml.contains("RightSizerConfig"));
        assert!(yaml.contains("rightsizerconfigs"));
    }

    #[test]
    fn test_policy_crd_generates_valid_yaml() {
        let crd = RightSizerPolicy::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("rightsizer.io"));
        assert!(yaml.contains("RightSizerPolicy"));
        assert!(yaml.contains("rightsizerpolicies"));
    }

    #[test]
    fn test_both_crds_cluster_scoped() {
        assert_eq!(RightSizerConfig::crd().spec.scope, "Cluster");
        assert_eq!(RightSizerPolicy::crd().spec.scope, "Cluster");
    }

    #[test]
    fn test_crd_api_group_and_version() {
        let crd = RightSizerConfig::crd();
        assert_eq!(crd.spec.group, "rightsizer.io");
        assert_eq!(crd.spec.versions[0].name, "v1");
    }

    #[test]
    fn test_two_crds_different_names() {
        let config = RightSizerConfig::crd();
        let policy = RightSizerPolicy::crd();
        assert_ne!(config.spec.names.kind, policy.spec.names.kind);
        assert_ne!(config.spec.names.plural, policy.spec.names.plural);
    }

    #[test]
    fn test_config_spec_empty_object_deserializes() {
        let spec: RightSizerConfigSpec =
            serde_json::from_str("{}").expect("empty object should deserialize");
        assert_eq!(spec.enabled, None);
        assert_eq!(spec.dry_run, None);
        assert_eq!(spec.resize_interval_seconds, None);
        assert_eq!(spec.default_strategy, None);
    }

    #[test]
    fn test_config_spec_serialization_roundtrip() {
        let spec = RightSizerConfigSpec {
            enabled: Some(true),
            dry_run: Some(false),
            resize_interval_seconds: Some(30),
            batch_size: Some(10),
            delay_between_batches_seconds: Some(1),
            max_updates_per_run: Some(100),
            namespace_exclude: Some(vec!["qa".to_string()]),
            default_strategy: Some(StrategySpec {
                cpu: Some(ResourceStrategy {
                    request_multiplier: Some(1.2),
                    limit_multiplier: Some(2.0),
                    min_request: Some("10m".to_string()),
                    max_limit: Some("4".to_string()),
                    scale_up_threshold: Some(0.8),
                    scale_down_threshold: Some(0.5),
                    history_window: Some(12),
                    algorithm: Some(ScalingAlgorithm::Percentile),
                    percentile: Some(95),
                }),
                memory: None,
            }),
            ..Default::default()
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        let deserialized: RightSizerConfigSpec =
            serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(deserialized.resize_interval_seconds, Some(30));
        assert_eq!(deserialized.max_updates_per_run, Some(100));
        let cpu = deserialized.default_strategy.unwrap().cpu.unwrap();
        assert_eq!(cpu.request_multiplier, Some(1.2));
        assert_eq!(cpu.percentile, Some(95));
        assert_eq!(cpu.algorithm, Some(ScalingAlgorithm::Percentile));
    }

    #[test]
    fn test_config_spec_camel_case_field_names() {
        let spec = RightSizerConfigSpec {
            resize_interval_seconds: Some(15),
            max_updates_per_run: Some(5),
            ..Default::default()
        };
        let json = serde_json::to_string(&spec).expect("should serialize");
        assert!(json.contains("resizeIntervalSeconds"));
        assert!(json.contains("maxUpdatesPerRun"));
        assert!(!json.contains("resize_interval_seconds"));
    }

    #[test]
    fn test_algorithm_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ScalingAlgorithm::Ewma).unwrap(),
            r#""ewma""#
        );
        assert_eq!(
            serde_json::to_string(&ScalingAlgorithm::Percentile).unwrap(),
            r#""percentile""#
        );
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PolicyMode::Aggressive).unwrap(),
            r#""aggressive""#
        );
        let mode: PolicyMode = serde_json::from_str(r#""observe""#).unwrap();
        assert_eq!(mode, PolicyMode::Observe);
    }

    #[test]
    fn test_policy_spec_roundtrip() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());

        let spec = RightSizerPolicySpec {
            priority: Some(20),
            mode: Some(PolicyMode::Conservative),
            selector: Some(PolicySelector {
                namespaces: Some(vec!["prod".to_string()]),
                labels: Some(labels),
                workload_kinds: Some(vec!["Deployment".to_string()]),
                annotations: None,
            }),
            cpu: Some(ResourceStrategy {
                request_multiplier: Some(1.5),
                ..Default::default()
            }),
            restart_allowed: Some(false),
            schedule: Some(ScheduleWindow {
                start: "22:00".to_string(),
                end: "06:00".to_string(),
                days_of_week: Some(vec!["Sat".to_string(), "Sun".to_string()]),
            }),
            ..Default::default()
        };

        let json = serde_json::to_string(&spec).expect("should serialize");
        let deserialized: RightSizerPolicySpec =
            serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(deserialized.priority, Some(20));
        assert_eq!(deserialized.mode, Some(PolicyMode::Conservative));
        let selector = deserialized.selector.unwrap();
        assert_eq!(selector.namespaces.unwrap(), vec!["prod"]);
        assert_eq!(deserialized.cpu.unwrap().request_multiplier, Some(1.5));
        assert_eq!(deserialized.schedule.unwrap().end, "06:00");
    }

    #[test]
    fn test_policy_spec_defaults_to_all_none() {
        let spec = RightSizerPolicySpec::default();
        assert_eq!(spec.priority, None);
        assert_eq!(spec.mode, None);
        assert_eq!(spec.selector, None);
        assert_eq!(spec.cpu, None);
        assert_eq!(spec.memory, None);
        assert_eq!(spec.restart_allowed, None);
        assert_eq!(spec.schedule, None);
    }

    #[test]
    fn test_status_omits_none_fields() {
        let status = RightSizerPolicyStatus {
            phase: Some(CrdPhase::Invalid),
            validation_errors: Some(vec!["bad threshold".to_string()]),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).expect("should serialize");
        assert!(json.contains("validationErrors"));
        assert!(!json.contains("observedGeneration"));
        assert!(!json.contains("conditions"));
    }

    #[test]
    fn test_condition_type_field_renamed() {
        let condition = StatusCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            reason: None,
            message: None,
            last_transition_time: None,
        };
        let json = serde_json::to_string(&condition).expect("should serialize");
        assert!(json.contains(r#""type":"Ready""#));
        assert!(!json.contains("type_"));
    }

    #[test]
    fn test_phase_roundtrip() {
        for phase in [CrdPhase::Active, CrdPhase::Degraded, CrdPhase::Invalid] {
            let json = serde_json::to_string(&phase).unwrap();
            let back: CrdPhase = serde_json::from_str(&json).unwrap();
            assert_eq!(back, phase);
        }
    }
}
