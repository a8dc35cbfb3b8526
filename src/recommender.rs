use crate::crd::PolicyMode;
use crate::quantity::MIB;
use crate::resolver::{EffectiveStrategy, ResourceBand};
use crate::usage::UsageStats;

/* ============================= TYPES ============================= */

/// Orchestrator-computed service class of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl QosClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QosClass::Guaranteed => "Guaranteed",
            QosClass::Burstable => "Burstable",
            QosClass::BestEffort => "BestEffort",
        }
    }
}

/// Current requests/limits of one container, in millicores and bytes.
/// Zero means unset.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CurrentResources {
    pub cpu_request_milli: i64,
    pub cpu_limit_milli: i64,
    pub memory_request_bytes: i64,
    pub memory_limit_bytes: i64,
}

/// Resize capabilities discovered once at startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlatformCaps {
    /// The pod `resize` subresource is served.
    pub resize_subresource: bool,
    /// Memory can shrink without a container restart.
    pub in_place_memory_decrease: bool,
}

/// Outcome category of a recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Upscale,
    Downscale,
    Noop,
    Deferred,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Upscale => "upscale",
            Decision::Downscale => "downscale",
            Decision::Noop => "noop",
            Decision::Deferred => "deferred",
        }
    }
}

/// The recommended end state for one container.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub cpu_request_milli: i64,
    pub cpu_limit_milli: i64,
    pub memory_request_bytes: i64,
    pub memory_limit_bytes: i64,
    pub qos: QosClass,
    pub decision: Decision,
    pub reason: String,
    pub cpu_changed: bool,
    pub memory_changed: bool,
}

impl TargetSpec {
    /// A target that leaves everything as it is.
    pub fn unchanged(current: &CurrentResources, decision: Decision, reason: &str) -> Self {
        TargetSpec {
            cpu_request_milli: current.cpu_request_milli,
            cpu_limit_milli: current.cpu_limit_milli,
            memory_request_bytes: current.memory_request_bytes,
            memory_limit_bytes: current.memory_limit_bytes,
            qos: qos_of(current),
            decision,
            reason: reason.to_string(),
            cpu_changed: false,
            memory_changed: false,
        }
    }
}

/* ============================= QOS ============================= */

/// Compute the QoS class from one container's resources.
///
/// Guaranteed needs request == limit for both resources; any request or
/// limit set makes the pod Burstable; nothing set is BestEffort.
pub fn qos_of(current: &CurrentResources) -> QosClass {
    let any_set = current.cpu_request_milli > 0
        || current.cpu_limit_milli > 0
        || current.memory_request_bytes > 0
        || current.memory_limit_bytes > 0;
    if !any_set {
        return QosClass::BestEffort;
    }

    let guaranteed = current.cpu_request_milli > 0
        && current.cpu_request_milli == current.cpu_limit_milli
        && current.memory_request_bytes > 0
        && current.memory_request_bytes == current.memory_limit_bytes;
    if guaranteed {
        QosClass::Guaranteed
    } else {
        QosClass::Burstable
    }
}

/* ============================= PER-RESOURCE STEP ============================= */

/// Minimum absolute change worth acting on: 10% of the current request,
/// floored at 1 millicore for CPU and 16 MiB for memory.
fn hysteresis_floor(current_request: i64, unit: i64) -> i64 {
    (current_request / 10).max(unit)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ResourceOutcome {
    request: i64,
    limit: i64,
    decision: Decision,
}

fn clamp(value: i64, low: i64, high: i64) -> i64 {
    value.max(low).min(high)
}

fn evaluate_resource(
    band: &ResourceBand,
    usage: i64,
    current_request: i64,
    current_limit: i64,
    guaranteed: bool,
    unit: i64,
) -> ResourceOutcome {
    let keep = ResourceOutcome {
        request: current_request,
        limit: current_limit,
        decision: Decision::Noop,
    };

    let new_request = clamp(
        (usage as f64 * band.request_multiplier).round() as i64,
        band.min_request,
        band.max_limit,
    );
    let new_limit = if guaranteed {
        new_request
    } else {
        clamp(
            (new_request as f64 * band.limit_multiplier).round() as i64,
            new_request,
            band.max_limit,
        )
    };

    // An unset request is always treated as a scale-up candidate.
    if current_request == 0 {
        return ResourceOutcome {
            request: new_request,
            limit: new_limit,
            decision: Decision::Upscale,
        };
    }

    // The scale-down comparison is strict: utilization exactly at the
    // threshold stays a noop.
    let utilization = usage as f64 / current_request as f64;
    let candidate = if utilization >= band.scale_up_threshold {
        Decision::Upscale
    } else if utilization < band.scale_down_threshold {
        Decision::Downscale
    } else {
        Decision::Noop
    };

    if candidate == Decision::Noop {
        return keep;
    }

    if (new_request - current_request).abs() < hysteresis_floor(current_request, unit) {
        return keep;
    }

    ResourceOutcome {
        request: new_request,
        limit: new_limit,
        decision: candidate,
    }
}

/* ============================= RECOMMEND ============================= */

/// Produce a TargetSpec for one container.
///
/// Deterministic: identical strategy, stats, and current spec always
/// yield the identical target. QoS is read, never shifted: a Guaranteed
/// pod keeps request == limit on both resources.
pub fn recommend(
    strategy: &EffectiveStrategy,
    current: &CurrentResources,
    stats: &UsageStats,
    caps: &PlatformCaps,
) -> TargetSpec {
    let qos = qos_of(current);
    let guaranteed = qos == QosClass::Guaranteed;

    let cpu = evaluate_resource(
        &strategy.cpu,
        stats.cpu.select(strategy.cpu.algorithm),
        current.cpu_request_milli,
        current.cpu_limit_milli,
        guaranteed,
        1,
    );

    let mut memory = evaluate_resource(
        &strategy.memory,
        stats.memory.select(strategy.memory.algorithm),
        current.memory_request_bytes,
        current.memory_limit_bytes,
        guaranteed,
        16 * MIB,
    );

    // In-place memory shrink needs platform support; without it the
    // recommendation is acknowledged but not applied this tick, unless
    // the policy explicitly allows a restart-based path.
    let mut memory_deferred = false;
    if memory.decision == Decision::Downscale
        && !caps.in_place_memory_decrease
        && !(strategy.mode == PolicyMode::Aggressive && strategy.restart_allowed)
    {
        memory = ResourceOutcome {
            request: current.memory_request_bytes,
            limit: current.memory_limit_bytes,
            decision: Decision::Deferred,
        };
        memory_deferred = true;
    }

    let decisions = [cpu.decision, memory.decision];
    let merged = if decisions.contains(&Decision::Upscale) {
        Decision::Upscale
    } else if decisions.contains(&Decision::Deferred) {
        Decision::Deferred
    } else if decisions.iter().all(|d| *d == Decision::Downscale) {
        Decision::Downscale
    } else if decisions.contains(&Decision::Downscale) {
        Decision::Downscale
    } else {
        Decision::Noop
    };

    let cpu_changed = cpu.decision == Decision::Upscale || cpu.decision == Decision::Downscale;
    let memory_changed =
        memory.decision == Decision::Upscale || memory.decision == Decision::Downscale;

    let reason = match merged {
        Decision::Upscale => "high-util",
        Decision::Downscale => "low-util",
        Decision::Deferred if memory_deferred => "DecreaseUnsupported",
        Decision::Deferred => "deferred",
        Decision::Noop => "within-thresholds",
    };

    TargetSpec {
        cpu_request_milli: if cpu_changed { cpu.request } else { current.cpu_request_milli },
        cpu_limit_milli: if cpu_changed { cpu.limit } else { current.cpu_limit_milli },
        memory_request_bytes: if memory_changed {
            memory.request
        } else {
            current.memory_request_bytes
        },
        memory_limit_bytes: if memory_changed {
            memory.limit
        } else {
            current.memory_limit_bytes
        },
        qos,
        decision: merged,
        reason: reason.to_string(),
        cpu_changed,
        memory_changed,
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ScalingAlgorithm;
    use crate::resolver::ResourceKind;
    use crate::usage::ResourceStats;
    use std::collections::BTreeMap;

    fn strategy() -> EffectiveStrategy {
        EffectiveStrategy {
            cpu: ResourceBand::default_for(ResourceKind::Cpu),
            memory: ResourceBand::default_for(ResourceKind::Memory),
            mode: PolicyMode::Balanced,
            dry_run: false,
            restart_allowed: false,
            sources: BTreeMap::new(),
        }
    }

    fn caps() -> PlatformCaps {
        PlatformCaps {
            resize_subresource: true,
            in_place_memory_decrease: true,
        }
    }

    fn stats(cpu: i64, mem: i64) -> UsageStats {
        let flat = |v: i64| ResourceStats {
            mean: v,
            max: v,
            percentile: v,
            ewma: v,
        };
        UsageStats {
            n: 5,
            cpu: flat(cpu),
            memory: flat(mem),
        }
    }

    fn burstable(cpu_req: i64, cpu_lim: i64, mem_req: i64, mem_lim: i64) -> CurrentResources {
        CurrentResources {
            cpu_request_milli: cpu_req,
            cpu_limit_milli: cpu_lim,
            memory_request_bytes: mem_req,
            memory_limit_bytes: mem_lim,
        }
    }

    // ── QoS classification ──

    #[test]
    fn test_qos_guaranteed() {
        let current = burstable(500, 500, 256 * MIB, 256 * MIB);
        assert_eq!(qos_of(&current), QosClass::Guaranteed);
    }

    #[test]
    fn test_qos_burstable() {
        let current = burstable(500, 1000, 256 * MIB, 256 * MIB);
        assert_eq!(qos_of(&current), QosClass::Burstable);
    }

    #[test]
    fn test_qos_best_effort() {
        assert_eq!(qos_of(&CurrentResources::default()), QosClass::BestEffort);
    }

    // ── Reference downscale scenario ──

    #[test]
    fn test_simple_downscale_scenario() {
        // cpu 500m/1000m, p95 usage 125m, reqMult 1.2, limMult 2.0,
        // scaleDown 0.5: expect 150m/300m.
        let mut s = strategy();
        s.cpu.scale_down_threshold = 0.5;
        let current = burstable(500, 1000, 512 * MIB, 512 * MIB);
        let mut st = stats(125, 400 * MIB);
        st.memory = ResourceStats {
            mean: 400 * MIB,
            max: 400 * MIB,
            percentile: 400 * MIB,
            ewma: 400 * MIB,
        };

        let target = recommend(&s, &current, &st, &caps());

        assert_eq!(target.cpu_request_milli, 150);
        assert_eq!(target.cpu_limit_milli, 300);
        assert_eq!(target.decision, Decision::Downscale);
        assert_eq!(target.reason, "low-util");
        assert!(target.cpu_changed);
    }

    // ── Threshold endpoints are inclusive ──

    #[test]
    fn test_scale_down_endpoint_is_noop() {
        // util == scaleDown exactly stays a noop: the comparison is strict.
        let mut s = strategy();
        s.cpu.scale_down_threshold = 0.2;
        let current = burstable(1000, 2000, 512 * MIB, GIB_BYTES);
        let target = recommend(&s, &current, &stats(200, 400 * MIB), &caps());
        assert_eq!(target.decision, Decision::Noop);
        assert_eq!(target.cpu_request_milli, 1000);
        assert!(!target.cpu_changed);
    }

    #[test]
    fn test_just_below_scale_down_downscales() {
        let mut s = strategy();
        s.cpu.scale_down_threshold = 0.2;
        let current = burstable(1000, 2000, 512 * MIB, GIB_BYTES);
        // util 0.19 < 0.2 → downscale; new request 190 * 1.2 = 228.
        let target = recommend(&s, &current, &stats(190, 400 * MIB), &caps());
        assert_eq!(target.decision, Decision::Downscale);
        assert_eq!(target.cpu_request_milli, 228);
    }

    const GIB_BYTES: i64 = 1024 * MIB;

    // ── Upscale ──

    #[test]
    fn test_upscale_on_high_utilization() {
        let current = burstable(100, 200, 512 * MIB, GIB_BYTES);
        // util 0.9 ≥ 0.8 default threshold
        let target = recommend(&strategy(), &current, &stats(90, 400 * MIB), &caps());
        assert_eq!(target.decision, Decision::Upscale);
        assert_eq!(target.cpu_request_milli, 108);
        assert_eq!(target.cpu_limit_milli, 216);
    }

    #[test]
    fn test_zero_request_treated_as_upscale() {
        let current = burstable(0, 0, 512 * MIB, GIB_BYTES);
        let target = recommend(&strategy(), &current, &stats(50, 400 * MIB), &caps());
        assert_eq!(target.decision, Decision::Upscale);
        assert_eq!(target.cpu_request_milli, 60);
        assert!(target.cpu_changed);
    }

    #[test]
    fn test_upscale_wins_over_memory_downscale() {
        let mut s = strategy();
        s.memory.scale_down_threshold = 0.5;
        // cpu needs up (util 0.9), memory wants down (util 0.2)
        let current = burstable(100, 200, GIB_BYTES, 2 * GIB_BYTES);
        let target = recommend(&s, &current, &stats(90, 200 * MIB), &caps());
        assert_eq!(target.decision, Decision::Upscale);
        assert!(target.cpu_changed);
        assert!(target.memory_changed);
    }

    // ── Hysteresis ──

    #[test]
    fn test_small_change_suppressed_by_hysteresis() {
        let mut s = strategy();
        s.cpu.scale_down_threshold = 0.9;
        // util 0.83 ≤ 0.9 → downscale candidate, but the new request
        // (996m) is within 10% of 1000m.
        let current = burstable(1000, 2000, 512 * MIB, GIB_BYTES);
        let target = recommend(&s, &current, &stats(830, 400 * MIB), &caps());
        assert_eq!(target.decision, Decision::Noop);
        assert_eq!(target.reason, "within-thresholds");
    }

    #[test]
    fn test_memory_hysteresis_floor_is_sixteen_mib() {
        let mut s = strategy();
        s.memory.scale_down_threshold = 0.99;
        s.cpu.scale_down_threshold = 0.0;
        // 100Mi request, usage 80Mi → new request 96Mi, delta 4Mi < 16Mi.
        let current = burstable(1000, 1000, 100 * MIB, 200 * MIB);
        let target = recommend(&s, &current, &stats(900, 80 * MIB), &caps());
        assert_eq!(target.decision, Decision::Noop);
    }

    // ── Bounds ──

    #[test]
    fn test_min_request_pins_target() {
        let mut s = strategy();
        s.cpu.min_request = 100;
        s.cpu.scale_down_threshold = 0.5;
        let current = burstable(500, 1000, 512 * MIB, GIB_BYTES);
        // usage 10m would suggest 12m, pinned to 100m.
        let target = recommend(&s, &current, &stats(10, 400 * MIB), &caps());
        assert_eq!(target.cpu_request_milli, 100);
        assert_eq!(target.decision, Decision::Downscale);
    }

    #[test]
    fn test_max_limit_caps_both_request_and_limit() {
        let mut s = strategy();
        s.cpu.max_limit = 1000;
        let current = burstable(800, 900, 512 * MIB, GIB_BYTES);
        let target = recommend(&s, &current, &stats(900, 400 * MIB), &caps());
        assert!(target.cpu_request_milli <= 1000);
        assert!(target.cpu_limit_milli <= 1000);
        assert!(target.cpu_request_milli <= target.cpu_limit_milli);
    }

    // ── Memory decrease deferral ──

    #[test]
    fn test_memory_decrease_deferred_without_platform_support() {
        let mut s = strategy();
        s.memory.scale_down_threshold = 0.5;
        s.cpu.scale_down_threshold = 0.0;
        let no_shrink = PlatformCaps {
            resize_subresource: true,
            in_place_memory_decrease: false,
        };
        // 1Gi requested, 200Mi used.
        let current = burstable(100, 200, GIB_BYTES, 2 * GIB_BYTES);
        let target = recommend(&s, &current, &stats(50, 200 * MIB), &no_shrink);

        assert_eq!(target.decision, Decision::Deferred);
        assert_eq!(target.reason, "DecreaseUnsupported");
        // Values stay untouched while deferred.
        assert_eq!(target.memory_request_bytes, GIB_BYTES);
        assert!(!target.memory_changed);
    }

    #[test]
    fn test_aggressive_restart_allowed_overrides_deferral() {
        let mut s = strategy();
        s.mode = PolicyMode::Aggressive;
        s.restart_allowed = true;
        s.memory.scale_down_threshold = 0.5;
        s.cpu.scale_down_threshold = 0.0;
        let no_shrink = PlatformCaps {
            resize_subresource: true,
            in_place_memory_decrease: false,
        };
        let current = burstable(100, 200, GIB_BYTES, 2 * GIB_BYTES);
        let target = recommend(&s, &current, &stats(50, 200 * MIB), &no_shrink);

        assert_eq!(target.decision, Decision::Downscale);
        assert!(target.memory_changed);
        assert!(target.memory_request_bytes < GIB_BYTES);
    }

    // ── QoS preservation ──

    #[test]
    fn test_guaranteed_pod_keeps_request_equal_limit() {
        let s = strategy();
        let current = burstable(500, 500, 512 * MIB, 512 * MIB);
        let target = recommend(&s, &current, &stats(450, 480 * MIB), &caps());
        assert_eq!(target.qos, QosClass::Guaranteed);
        assert_eq!(target.cpu_request_milli, target.cpu_limit_milli);
        assert_eq!(target.memory_request_bytes, target.memory_limit_bytes);
    }

    // ── Determinism ──

    #[test]
    fn test_recommend_is_deterministic() {
        let s = strategy();
        let current = burstable(500, 1000, 512 * MIB, GIB_BYTES);
        let st = stats(125, 400 * MIB);
        let a = recommend(&s, &current, &st, &caps());
        let b = recommend(&s, &current, &st, &caps());
        assert_eq!(a, b);
    }

    // ── Invariants over admitted targets ──

    #[test]
    fn test_changed_targets_keep_request_below_limit() {
        let mut s = strategy();
        s.cpu.scale_down_threshold = 0.6;
        s.memory.scale_down_threshold = 0.6;
        for (cpu_use, mem_use) in [(10, 32 * MIB), (900, 3 * GIB_BYTES), (450, GIB_BYTES)] {
            let current = burstable(500, 1000, 2 * GIB_BYTES, 4 * GIB_BYTES);
            let target = recommend(&s, &current, &stats(cpu_use, mem_use), &caps());
            assert!(target.cpu_request_milli <= target.cpu_limit_milli);
            assert!(target.memory_request_bytes <= target.memory_limit_bytes);
            if target.cpu_changed {
                assert!(target.cpu_request_milli >= s.cpu.min_request);
                assert!(target.cpu_limit_milli <= s.cpu.max_limit);
            }
        }
    }
}
