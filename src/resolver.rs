use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc};

use crate::crd::{
    PolicyMode, PolicySelector, ResourceStrategy, RightSizerConfigSpec, RightSizerPolicySpec,
    ScalingAlgorithm, ScheduleWindow, StrategySpec,
};
use crate::error::StrategyError;
use crate::quantity::{self, MIB};

/* ============================= RESOLVED TYPES ============================= */

/// Which resource a band applies to; decides how quantity strings parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

/// Fully-resolved sizing parameters for one resource.
///
/// Units are millicores for CPU and bytes for memory.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceBand {
    pub request_multiplier: f64,
    pub limit_multiplier: f64,
    pub min_request: i64,
    pub max_limit: i64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub history_window: u32,
    pub algorithm: ScalingAlgorithm,
    pub percentile: u8,
}

impl ResourceBand {
    pub fn default_for(kind: ResourceKind) -> Self {
        let (min_request, max_limit) = match kind {
            ResourceKind::Cpu => (10, 4000),
            ResourceKind::Memory => (16 * MIB, 8 * 1024 * MIB),
        };
        ResourceBand {
            request_multiplier: 1.2,
            limit_multiplier: 2.0,
            min_request,
            max_limit,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            history_window: 12,
            algorithm: ScalingAlgorithm::Percentile,
            percentile: 95,
        }
    }
}

/// Immutable strategy snapshot for one (pod, container) at one tick.
///
/// `sources` maps each overridden field (e.g. `"cpu.requestMultiplier"`)
/// to the ordered list of sources that contributed a value; the last entry
/// is the effective one.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveStrategy {
    pub cpu: ResourceBand,
    pub memory: ResourceBand,
    pub mode: PolicyMode,
    pub dry_run: bool,
    pub restart_allowed: bool,
    pub sources: BTreeMap<String, Vec<String>>,
}

impl EffectiveStrategy {
    /// Stable digest of the numeric strategy, used to detect strategy
    /// changes that should unstick a failed pod record.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for band in [&self.cpu, &self.memory] {
            band.request_multiplier.to_bits().hash(&mut hasher);
            band.limit_multiplier.to_bits().hash(&mut hasher);
            band.min_request.hash(&mut hasher);
            band.max_limit.hash(&mut hasher);
            band.scale_up_threshold.to_bits().hash(&mut hasher);
            band.scale_down_threshold.to_bits().hash(&mut hasher);
            band.history_window.hash(&mut hasher);
            band.percentile.hash(&mut hasher);
            (band.algorithm as u8).hash(&mut hasher);
        }
        self.dry_run.hash(&mut hasher);
        self.restart_allowed.hash(&mut hasher);
        hasher.finish()
    }
}

/// The pod-side inputs selector matching runs against.
#[derive(Debug, Clone, Default)]
pub struct WorkloadMeta {
    pub namespace: String,
    pub workload_kind: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// A named, already-listed policy as the hub publishes it.
#[derive(Debug, Clone)]
pub struct NamedPolicy {
    pub name: String,
    pub spec: RightSizerPolicySpec,
}

/* ============================= VALIDATION ============================= */

/// Validate one partial strategy in isolation.
///
/// Cross-field rules that need both values only fire when both are set;
/// the merged band is re-validated after resolution.
pub fn validate_strategy(strategy: &ResourceStrategy) -> Result<(), StrategyError> {
    if let Some(m) = strategy.request_multiplier
        && m < 0.0
    {
        return Err(StrategyError::NegativeRequestMultiplier(m));
    }
    if let Some(m) = strategy.limit_multiplier
        && m < 1.0
    {
        return Err(StrategyError::LimitMultiplierBelowOne(m));
    }
    if let Some(up) = strategy.scale_up_threshold
        && !(up > 0.0 && up <= 1.0)
    {
        return Err(StrategyError::ScaleUpOutOfRange(up));
    }
    if let Some(down) = strategy.scale_down_threshold
        && !(0.0..1.0).contains(&down)
    {
        return Err(StrategyError::ScaleDownOutOfRange(down));
    }
    if let (Some(down), Some(up)) = (strategy.scale_down_threshold, strategy.scale_up_threshold)
        && down >= up
    {
        return Err(StrategyError::ThresholdOrder { down, up });
    }
    if let Some(p) = strategy.percentile
        && !(1..=99).contains(&p)
    {
        return Err(StrategyError::PercentileOutOfRange(p));
    }
    if strategy.history_window == Some(0) {
        return Err(StrategyError::EmptyHistoryWindow);
    }
    Ok(())
}

fn validate_band(band: &ResourceBand) -> Result<(), StrategyError> {
    if band.scale_down_threshold >= band.scale_up_threshold {
        return Err(StrategyError::ThresholdOrder {
            down: band.scale_down_threshold,
            up: band.scale_up_threshold,
        });
    }
    if band.min_request > band.max_limit {
        return Err(StrategyError::BoundsInverted {
            min: band.min_request.to_string(),
            max: band.max_limit.to_string(),
        });
    }
    Ok(())
}

/// Collect every validation error on a policy. Empty means valid.
pub fn validate_policy(spec: &RightSizerPolicySpec) -> Vec<String> {
    let mut errors = Vec::new();
    for (label, strategy) in [("cpu", &spec.cpu), ("memory", &spec.memory)] {
        if let Some(s) = strategy {
            if let Err(e) = validate_strategy(s) {
                errors.push(format!("{label}: {e}"));
            }
            let kind = if label == "cpu" {
                ResourceKind::Cpu
            } else {
                ResourceKind::Memory
            };
            for quantity in [&s.min_request, &s.max_limit].into_iter().flatten() {
                if parse_for(kind, quantity).is_none() {
                    errors.push(format!("{label}: {}", StrategyError::BadQuantity(quantity.clone())));
                }
            }
        }
    }
    if let Some(schedule) = &spec.schedule
        && parse_window(schedule).is_none()
    {
        errors.push(format!(
            "schedule: invalid window {}..{}",
            schedule.start, schedule.end
        ));
    }
    errors
}

/// Collect validation errors on the global config's default strategy.
pub fn validate_config(spec: &RightSizerConfigSpec) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(defaults) = &spec.default_strategy {
        for (label, strategy) in [("cpu", &defaults.cpu), ("memory", &defaults.memory)] {
            if let Some(s) = strategy
                && let Err(e) = validate_strategy(s)
            {
                errors.push(format!("defaultStrategy.{label}: {e}"));
            }
        }
    }
    errors
}

/* ============================= SELECTOR MATCHING ============================= */

fn map_overlaps(wanted: &BTreeMap<String, String>, actual: &BTreeMap<String, String>) -> bool {
    wanted
        .iter()
        .any(|(k, v)| actual.get(k).is_some_and(|have| have == v))
}

/// AND across selector dimensions, OR within each one. An absent selector
/// (or absent dimension) matches everything.
pub fn selector_matches(selector: Option<&PolicySelector>, meta: &WorkloadMeta) -> bool {
    let Some(selector) = selector else {
        return true;
    };

    if let Some(namespaces) = &selector.namespaces
        && !namespaces.is_empty()
        && !namespaces.iter().any(|ns| ns == &meta.namespace)
    {
        return false;
    }
    if let Some(kinds) = &selector.workload_kinds
        && !kinds.is_empty()
        && !kinds.iter().any(|k| k == &meta.workload_kind)
    {
        return false;
    }
    if let Some(labels) = &selector.labels
        && !labels.is_empty()
        && !map_overlaps(labels, &meta.labels)
    {
        return false;
    }
    if let Some(annotations) = &selector.annotations
        && !annotations.is_empty()
        && !map_overlaps(annotations, &meta.annotations)
    {
        return false;
    }
    true
}

/* ============================= SCHEDULE WINDOWS ============================= */

fn parse_window(window: &ScheduleWindow) -> Option<(NaiveTime, NaiveTime)> {
    let start = NaiveTime::parse_from_str(&window.start, "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(&window.end, "%H:%M").ok()?;
    Some((start, end))
}

/// Whether the policy's schedule admits `now`. No schedule means always.
pub fn schedule_active(schedule: Option<&ScheduleWindow>, now: DateTime<Utc>) -> bool {
    let Some(window) = schedule else {
        return true;
    };
    let Some((start, end)) = parse_window(window) else {
        // Unparseable windows were already flagged by validation.
        return false;
    };

    if let Some(days) = &window.days_of_week
        && !days.is_empty()
    {
        let today = match now.weekday() {
            chrono::Weekday::Mon => "Mon",
            chrono::Weekday::Tue => "Tue",
            chrono::Weekday::Wed => "Wed",
            chrono::Weekday::Thu => "Thu",
            chrono::Weekday::Fri => "Fri",
            chrono::Weekday::Sat => "Sat",
            chrono::Weekday::Sun => "Sun",
        };
        if !days.iter().any(|d| d == today) {
            return false;
        }
    }

    let minute_of_day = now.hour() * 60 + now.minute();
    let start_minute = start.hour() * 60 + start.minute();
    let end_minute = end.hour() * 60 + end.minute();

    if start_minute <= end_minute {
        (start_minute..=end_minute).contains(&minute_of_day)
    } else {
        // Wraps midnight, e.g. 22:00-06:00.
        minute_of_day >= start_minute || minute_of_day <= end_minute
    }
}

/* ============================= MODE PRESETS ============================= */

/// Strategy fields a mode preset seeds before explicit overrides.
pub fn mode_preset(mode: PolicyMode) -> Option<ResourceStrategy> {
    let preset = |req: f64, lim: f64, up: f64, down: f64| ResourceStrategy {
        request_multiplier: Some(req),
        limit_multiplier: Some(lim),
        scale_up_threshold: Some(up),
        scale_down_threshold: Some(down),
        ..Default::default()
    };

    match mode {
        PolicyMode::Conservative => Some(preset(1.5, 2.0, 0.9, 0.2)),
        PolicyMode::Balanced | PolicyMode::Observe => Some(preset(1.2, 2.0, 0.8, 0.3)),
        PolicyMode::Aggressive => Some(preset(1.1, 1.5, 0.7, 0.4)),
        PolicyMode::Adaptive => Some(ResourceStrategy {
            algorithm: Some(ScalingAlgorithm::Ewma),
            ..preset(1.2, 2.0, 0.8, 0.3)
        }),
        PolicyMode::Custom => None,
    }
}

/* ============================= RESOLUTION ============================= */

fn parse_for(kind: ResourceKind, quantity: &str) -> Option<i64> {
    match kind {
        ResourceKind::Cpu => quantity::parse_cpu_milli(quantity),
        ResourceKind::Memory => quantity::parse_memory_bytes(quantity),
    }
}

fn overlay_band(
    band: &mut ResourceBand,
    kind: ResourceKind,
    overlay: &ResourceStrategy,
    source: &str,
    prefix: &str,
    sources: &mut BTreeMap<String, Vec<String>>,
) {
    let mut record = |field: &str| {
        sources
            .entry(format!("{prefix}.{field}"))
            .or_default()
            .push(source.to_string());
    };

    if let Some(v) = overlay.request_multiplier {
        band.request_multiplier = v;
        record("requestMultiplier");
    }
    if let Some(v) = overlay.limit_multiplier {
        band.limit_multiplier = v;
        record("limitMultiplier");
    }
    if let Some(v) = overlay.min_request.as_deref().and_then(|q| parse_for(kind, q)) {
        band.min_request = v;
        record("minRequest");
    }
    if let Some(v) = overlay.max_limit.as_deref().and_then(|q| parse_for(kind, q)) {
        band.max_limit = v;
        record("maxLimit");
    }
    if let Some(v) = overlay.scale_up_threshold {
        band.scale_up_threshold = v;
        record("scaleUpThreshold");
    }
    if let Some(v) = overlay.scale_down_threshold {
        band.scale_down_threshold = v;
        record("scaleDownThreshold");
    }
    if let Some(v) = overlay.history_window {
        band.history_window = v;
        record("historyWindow");
    }
    if let Some(v) = overlay.algorithm {
        band.algorithm = v;
        record("algorithm");
    }
    if let Some(v) = overlay.percentile {
        band.percentile = v;
        record("percentile");
    }
}

fn overlay_pair(
    cpu: &mut ResourceBand,
    memory: &mut ResourceBand,
    pair: &StrategySpec,
    source: &str,
    sources: &mut BTreeMap<String, Vec<String>>,
) {
    if let Some(strategy) = &pair.cpu {
        overlay_band(cpu, ResourceKind::Cpu, strategy, source, "cpu", sources);
    }
    if let Some(strategy) = &pair.memory {
        overlay_band(memory, ResourceKind::Memory, strategy, source, "memory", sources);
    }
}

/// Resolve the effective strategy for one (pod, container).
///
/// Matching policies are applied in ascending `(priority, name)` order so
/// the highest priority (ties: lexicographically greater name) lands last
/// and wins. Policies failing validation or outside their schedule window
/// are skipped.
pub fn resolve(
    config: &RightSizerConfigSpec,
    policies: &[NamedPolicy],
    meta: &WorkloadMeta,
    now: DateTime<Utc>,
) -> Result<EffectiveStrategy, StrategyError> {
    let mut cpu = ResourceBand::default_for(ResourceKind::Cpu);
    let mut memory = ResourceBand::default_for(ResourceKind::Memory);
    let mut sources: BTreeMap<String, Vec<String>> = BTreeMap::new();

    if let Some(defaults) = &config.default_strategy {
        overlay_pair(&mut cpu, &mut memory, defaults, "config/default", &mut sources);
    }

    let mut matched: Vec<&NamedPolicy> = policies
        .iter()
        .filter(|p| validate_policy(&p.spec).is_empty())
        .filter(|p| schedule_active(p.spec.schedule.as_ref(), now))
        .filter(|p| selector_matches(p.spec.selector.as_ref(), meta))
        .collect();
    matched.sort_by(|a, b| {
        let pa = a.spec.priority.unwrap_or(0);
        let pb = b.spec.priority.unwrap_or(0);
        pa.cmp(&pb).then_with(|| a.name.cmp(&b.name))
    });

    let mut mode = PolicyMode::Balanced;
    let mut restart_allowed = false;

    for policy in &matched {
        let source = format!("policy/{}", policy.name);

        if let Some(policy_mode) = policy.spec.mode {
            mode = policy_mode;
            if let Some(preset) = mode_preset(policy_mode) {
                let preset_source = format!("{source}:mode");
                overlay_band(&mut cpu, ResourceKind::Cpu, &preset, &preset_source, "cpu", &mut sources);
                overlay_band(
                    &mut memory,
                    ResourceKind::Memory,
                    &preset,
                    &preset_source,
                    "memory",
                    &mut sources,
                );
            }
        }

        if let Some(strategy) = &policy.spec.cpu {
            overlay_band(&mut cpu, ResourceKind::Cpu, strategy, &source, "cpu", &mut sources);
        }
        if let Some(strategy) = &policy.spec.memory {
            overlay_band(&mut memory, ResourceKind::Memory, strategy, &source, "memory", &mut sources);
        }
        if let Some(allowed) = policy.spec.restart_allowed {
            restart_allowed = allowed;
        }
    }

    validate_band(&cpu)?;
    validate_band(&memory)?;

    let dry_run = config.dry_run.unwrap_or(false) || mode == PolicyMode::Observe;

    Ok(EffectiveStrategy {
        cpu,
        memory,
        mode,
        dry_run,
        restart_allowed,
        sources,
    })
}

/* ============================= TESTS ============================= */
