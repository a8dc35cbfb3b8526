use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container, LimitRange, Node, Pod, ResourceQuota};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::crd::{RightSizerConfig, RightSizerConfigSpec, CONFIG_NAME};
use crate::error::ResizeError;
use crate::executor::{self, ContainerChange, ExecutorSettings, OwnerLink, ResizePhase};
use crate::hub::ConfigSnapshot;
use crate::quantity;
use crate::recommender::{self, CurrentResources, Decision, PlatformCaps, TargetSpec};
use crate::reporter::{self, AuditReason};
use crate::resolver::{self, WorkloadMeta};
use crate::safety::{
    self, DeferReason, GateContext, GateOutcome, NamespaceLimits, NodeHeadroom, QuotaHeadroom,
    RejectReason,
};
use crate::usage::{UsageStore, usage_key};

/* ============================= SETTINGS ============================= */

/// Startup-time overrides layered over the CRD config: CLI beats
/// environment, environment beats CRD fields, CRD beats built-ins.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub dry_run: bool,
    pub operator_namespace: Option<String>,
    pub resize_interval: Option<Duration>,
    pub namespace_include: Vec<String>,
    pub namespace_exclude: Vec<String>,
}

/// Concrete knobs for one tick, resolved at the tick boundary so config
/// changes never switch strategy mid-tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSettings {
    pub enabled: bool,
    pub dry_run: bool,
    pub resize_interval: Duration,
    pub batch_size: usize,
    pub delay_between_batches: Duration,
    pub max_updates_per_run: u32,
    pub retry_attempts: u32,
    pub retry_interval: Duration,
    pub min_pod_age: Duration,
    pub namespace_include: Vec<String>,
    pub namespace_exclude: Vec<String>,
    pub operator_namespace: String,
    pub node_headroom_check: bool,
    pub node_headroom_tolerance_percent: u32,
    pub parent_patch_kinds: Vec<String>,
}

impl TickSettings {
    pub fn resolve(config: &RightSizerConfigSpec, overrides: &Overrides) -> Self {
        let mut namespace_exclude = config.namespace_exclude.clone().unwrap_or_default();
        for ns in &overrides.namespace_exclude {
            if !namespace_exclude.contains(ns) {
                namespace_exclude.push(ns.clone());
            }
        }

        let namespace_include = if !overrides.namespace_include.is_empty() {
            overrides.namespace_include.clone()
        } else {
            config.namespace_include.clone().unwrap_or_default()
        };

        TickSettings {
            enabled: config.enabled.unwrap_or(true),
            dry_run: overrides.dry_run || config.dry_run.unwrap_or(false),
            resize_interval: overrides
                .resize_interval
                .unwrap_or_else(|| Duration::from_secs(config.resize_interval_seconds.unwrap_or(30))),
            batch_size: config.batch_size.unwrap_or(10).max(1),
            delay_between_batches: Duration::from_secs(
                config.delay_between_batches_seconds.unwrap_or(1),
            ),
            max_updates_per_run: config.max_updates_per_run.unwrap_or(50),
            retry_attempts: config.retry_attempts.unwrap_or(3),
            retry_interval: Duration::from_secs(config.retry_interval_seconds.unwrap_or(5)),
            min_pod_age: Duration::from_secs(config.min_pod_age_seconds.unwrap_or(60)),
            namespace_include,
            namespace_exclude,
            operator_namespace: overrides
                .operator_namespace
                .clone()
                .or_else(|| config.operator_namespace.clone())
                .unwrap_or_else(|| "default".to_string()),
            node_headroom_check: config.node_headroom_check.unwrap_or(false),
            node_headroom_tolerance_percent: config.node_headroom_tolerance_percent.unwrap_or(10),
            parent_patch_kinds: config
                .parent_patch_kinds
                .clone()
                .unwrap_or_else(|| vec!["Deployment".to_string()]),
        }
    }

    /// Cooldown applied to deferred pods before re-evaluation.
    pub fn cooldown(&self) -> Duration {
        (self.resize_interval * 3).max(Duration::from_secs(60))
    }

    fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            retry_attempts: self.retry_attempts,
            retry_interval: self.retry_interval,
            parent_patch_kinds: self.parent_patch_kinds.clone(),
        }
    }
}

/* ============================= POD RECORDS ============================= */

/// Where a pod sits in the reconcile state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PodPhase {
    Discovered,
    Evaluating,
    Idle,
    Cooldown,
    Applying,
    Observing,
    Failed,
}

/// Per-pod state owned exclusively by the reconciler, keyed by pod UID.
#[derive(Debug, Clone)]
pub struct PodRecord {
    pub phase: PodPhase,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_decision: Option<Decision>,
    pub last_reason: Option<String>,
    /// Strategy+spec digest captured when the pod failed fatally; the
    /// record stays Failed until the digest changes.
    pub failed_fingerprint: Option<u64>,
    /// Deferred pods keep their place at the head of the next tick.
    pub deferred_priority: bool,
    /// Targets applied by the last successful resize, awaiting stability.
    pub applied: Vec<ContainerChange>,
    pub observing_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PodRecord {
    fn new() -> Self {
        PodRecord {
            phase: PodPhase::Discovered,
            cooldown_until: None,
            last_decision: None,
            last_reason: None,
            failed_fingerprint: None,
            deferred_priority: false,
            applied: Vec::new(),
            observing_since: None,
            updated_at: Utc::now(),
        }
    }
}

/// Entry in the record arena: the inner mutex serializes every operation
/// on one pod, including executor work.
pub struct PodEntry {
    pub record: Mutex<PodRecord>,
}

/* ============================= ELIGIBILITY ============================= */

/// Tick-level pod filter; the Safety Gate re-checks the protection rules
/// on every target so self pods that slip through are still refused.
pub fn is_eligible(pod: &Pod, settings: &TickSettings, now: DateTime<Utc>) -> bool {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();

    if pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        != Some("Running")
    {
        return false;
    }

    let old_enough = pod.metadata.creation_timestamp.as_ref().is_some_and(|t| {
        now.signed_duration_since(t.0)
            >= chrono::Duration::from_std(settings.min_pod_age).unwrap_or_default()
    });
    if !old_enough {
        return false;
    }

    if safety::is_system_namespace(namespace)
        || settings.namespace_exclude.iter().any(|ns| ns == namespace)
        || (!settings.namespace_include.is_empty()
            && !settings.namespace_include.iter().any(|ns| ns == namespace))
    {
        return false;
    }

    // Standalone pods are fine; owned pods must have a known workload kind.
    if let Some(owners) = &pod.metadata.owner_references
        && !owners.is_empty()
        && executor::parent_link(pod).is_none()
    {
        return false;
    }

    true
}

/// Deterministic per-tick ordering: hash of UID and tick seed. Keeps
/// later list entries from starving when ticks are cut short.
pub fn shuffle_deterministically(pods: &mut [Pod], seed: u64) {
    pods.sort_by_key(|pod| {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        pod.metadata.uid.as_deref().unwrap_or_default().hash(&mut hasher);
        seed.hash(&mut hasher);
        hasher.finish()
    });
}

/* ============================= SPEC EXTRACTION ============================= */

/// Pull current requests/limits out of a container spec.
pub fn extract_current(container: &Container) -> CurrentResources {
    let mut current = CurrentResources::default();
    let Some(resources) = &container.resources else {
        return current;
    };

    if let Some(requests) = &resources.requests {
        current.cpu_request_milli = requests
            .get("cpu")
            .and_then(quantity::quantity_as_cpu_milli)
            .unwrap_or(0);
        current.memory_request_bytes = requests
            .get("memory")
            .and_then(quantity::quantity_as_memory_bytes)
            .unwrap_or(0);
    }
    if let Some(limits) = &resources.limits {
        current.cpu_limit_milli = limits
            .get("cpu")
            .and_then(quantity::quantity_as_cpu_milli)
            .unwrap_or(0);
        current.memory_limit_bytes = limits
            .get("memory")
            .and_then(quantity::quantity_as_memory_bytes)
            .unwrap_or(0);
    }
    current
}

/// Digest of the pod's resource spec; combined with the strategy
/// fingerprint it decides when a Failed record may re-enter evaluation.
pub fn pod_spec_hash(pod: &Pod) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            container.name.hash(&mut hasher);
            let current = extract_current(container);
            current.cpu_request_milli.hash(&mut hasher);
            current.cpu_limit_milli.hash(&mut hasher);
            current.memory_request_bytes.hash(&mut hasher);
            current.memory_limit_bytes.hash(&mut hasher);
        }
    }
    hasher.finish()
}

fn workload_meta(pod: &Pod) -> WorkloadMeta {
    // Selector matching treats ReplicaSet-owned pods as members of their
    // Deployment; the exact Deployment name is irrelevant here.
    let workload_kind = match executor::parent_link(pod) {
        Some(OwnerLink::Direct(workload)) => workload.kind.as_str().to_string(),
        Some(OwnerLink::ViaReplicaSet { .. }) => "Deployment".to_string(),
        None => "Pod".to_string(),
    };
    WorkloadMeta {
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        workload_kind,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        annotations: pod.metadata.annotations.clone().unwrap_or_default(),
    }
}

/* ============================= CLUSTER VIEW ============================= */

/// Admission-relevant cluster data gathered once per tick.
#[derive(Debug, Default)]
pub struct ClusterView {
    pub limits: HashMap<String, NamespaceLimits>,
    pub quotas: HashMap<String, QuotaHeadroom>,
    pub node_free: HashMap<String, NodeHeadroom>,
}

/* ============================= RECONCILER ============================= */

pub struct Reconciler {
    client: Client,
    store: Arc<UsageStore>,
    snapshot_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    caps: PlatformCaps,
    active: Arc<AtomicBool>,
    overrides: Overrides,
    self_pod_name: Option<String>,
    records: RwLock<HashMap<String, Arc<PodEntry>>>,
    tick_counter: AtomicU64,
    ticked: AtomicBool,
}

impl Reconciler {
    pub fn new(
        client: Client,
        store: Arc<UsageStore>,
        snapshot_rx: watch::Receiver<Arc<ConfigSnapshot>>,
        caps: PlatformCaps,
        active: Arc<AtomicBool>,
        overrides: Overrides,
    ) -> Self {
        Reconciler {
            client,
            store,
            snapshot_rx,
            caps,
            active,
            overrides,
            self_pod_name: std::env::var("POD_NAME").ok(),
            records: RwLock::new(HashMap::new()),
            tick_counter: AtomicU64::new(0),
            ticked: AtomicBool::new(false),
        }
    }

    /// True once the first tick has dispatched; feeds the ready probe.
    pub fn has_ticked(&self) -> bool {
        self.ticked.load(Ordering::SeqCst)
    }

    /// Main loop: one tick per resize interval while this replica holds
    /// the lease. Followers keep looping so they start reconciling within
    /// one tick of acquiring the lease.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("reconciler_started");

        loop {
            let snapshot = self.snapshot_rx.borrow().clone();
            let settings = TickSettings::resolve(&snapshot.config, &self.overrides);

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("reconciler_stopped");
                    return;
                }
                _ = sleep(settings.resize_interval) => {}
            }

            if !self.active.load(Ordering::SeqCst) {
                debug!("reconcile_skipped_not_leader");
                continue;
            }
            if !settings.enabled {
                debug!("reconcile_skipped_disabled");
                continue;
            }
            if !snapshot.synced {
                debug!("reconcile_skipped_informers_not_synced");
                continue;
            }

            let seed = self.tick_counter.fetch_add(1, Ordering::SeqCst);
            match self.tick(&settings, &snapshot, seed, &mut shutdown).await {
                Ok(cancelled) => {
                    self.ticked.store(true, Ordering::SeqCst);
                    self.stamp_config_status().await;
                    if cancelled {
                        info!("reconciler_stopped");
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "reconcile_tick_failed");
                    self.ticked.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /* ── one tick ── */

    /// Returns `Ok(true)` when shutdown cancelled the tick mid-way.
    async fn tick(
        &self,
        settings: &TickSettings,
        snapshot: &ConfigSnapshot,
        seed: u64,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let started = std::time::Instant::now();

        let pods_api: Api<Pod> = Api::all(self.client.clone());
        let all_pods = pods_api.list(&Default::default()).await?.items;

        let mut eligible: Vec<Pod> = all_pods
            .iter()
            .filter(|p| is_eligible(p, settings, now))
            .cloned()
            .collect();

        reporter::ACTIVE_PODS.set(eligible.len() as i64);
        // Prune against every live pod: a temporarily ineligible pod keeps
        // its cooldown and failure state.
        self.prune_records(&all_pods).await;

        shuffle_deterministically(&mut eligible, seed);
        self.promote_deferred(&mut eligible).await;

        let view = self.gather_view(&eligible, &all_pods, settings).await;
        let updates = AtomicU32::new(0);

        let mut processed = 0usize;
        for batch in eligible.chunks(settings.batch_size) {
            futures::stream::iter(batch)
                .for_each_concurrent(settings.batch_size, |pod| {
                    let updates = &updates;
                    let view = &view;
                    async move {
                        self.process_pod(pod, settings, snapshot, view, updates, now)
                            .await;
                    }
                })
                .await;
            processed += batch.len();

            if processed < eligible.len() {
                // Cancellation point: a shutdown mid-tick stops before the
                // next batch; in-flight patches above already completed.
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!(processed, "reconcile_tick_cancelled");
                        return Ok(true);
                    }
                    _ = sleep(settings.delay_between_batches) => {}
                }
            }
        }

        info!(
            eligible = eligible.len(),
            applied = updates.load(Ordering::SeqCst),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconcile_tick_complete"
        );
        Ok(false)
    }

    /// Deferred pods keep priority: stable-partition them to the front.
    async fn promote_deferred(&self, pods: &mut Vec<Pod>) {
        let records = self.records.read().await;
        let mut priority = Vec::new();
        let mut rest = Vec::new();
        for pod in pods.drain(..) {
            let uid = pod.metadata.uid.clone().unwrap_or_default();
            let deferred = match records.get(&uid) {
                Some(entry) => entry
                    .record
                    .try_lock()
                    .map(|r| r.deferred_priority)
                    .unwrap_or(false),
                None => false,
            };
            if deferred {
                priority.push(pod);
            } else {
                rest.push(pod);
            }
        }
        pods.extend(priority);
        pods.extend(rest);
    }

    async fn prune_records(&self, live: &[Pod]) {
        let live_uids: HashSet<&str> = live
            .iter()
            .filter_map(|p| p.metadata.uid.as_deref())
            .collect();
        let mut records = self.records.write().await;
        records.retain(|uid, _| live_uids.contains(uid.as_str()));
    }

    async fn entry_for(&self, uid: &str) -> Arc<PodEntry> {
        {
            let records = self.records.read().await;
            if let Some(entry) = records.get(uid) {
                return entry.clone();
            }
        }
        let mut records = self.records.write().await;
        records
            .entry(uid.to_string())
            .or_insert_with(|| {
                Arc::new(PodEntry {
                    record: Mutex::new(PodRecord::new()),
                })
            })
            .clone()
    }

    /* ── cluster view ── */

    async fn gather_view(
        &self,
        eligible: &[Pod],
        all_pods: &[Pod],
        settings: &TickSettings,
    ) -> ClusterView {
        let mut view = ClusterView::default();

        let namespaces: HashSet<String> = eligible
            .iter()
            .filter_map(|p| p.metadata.namespace.clone())
            .collect();

        for namespace in &namespaces {
            let ranges: Api<LimitRange> = Api::namespaced(self.client.clone(), namespace);
            match ranges.list(&Default::default()).await {
                Ok(list) if !list.items.is_empty() => {
                    view.limits.insert(
                        namespace.clone(),
                        NamespaceLimits::from_limit_ranges(&list.items),
                    );
                }
                Ok(_) => {}
                Err(e) => debug!(namespace = %namespace, error = %e, "limit_range_list_failed"),
            }

            let quotas: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
            match quotas.list(&Default::default()).await {
                Ok(list) if !list.items.is_empty() => {
                    view.quotas
                        .insert(namespace.clone(), QuotaHeadroom::from_quotas(&list.items));
                }
                Ok(_) => {}
                Err(e) => debug!(namespace = %namespace, error = %e, "quota_list_failed"),
            }
        }

        if settings.node_headroom_check {
            let nodes: Api<Node> = Api::all(self.client.clone());
            if let Ok(list) = nodes.list(&Default::default()).await {
                for node in list.items {
                    let name = node.name_any();
                    let allocatable = node
                        .status
                        .as_ref()
                        .and_then(|s| s.allocatable.as_ref());
                    let alloc_cpu = allocatable
                        .and_then(|a| a.get("cpu"))
                        .and_then(quantity::quantity_as_cpu_milli)
                        .unwrap_or(0);
                    let alloc_memory = allocatable
                        .and_then(|a| a.get("memory"))
                        .and_then(quantity::quantity_as_memory_bytes)
                        .unwrap_or(0);

                    let (used_cpu, used_memory) = all_pods
                        .iter()
                        .filter(|p| {
                            p.spec.as_ref().and_then(|s| s.node_name.as_deref())
                                == Some(name.as_str())
                        })
                        .flat_map(|p| p.spec.iter().flat_map(|s| s.containers.iter()))
                        .map(extract_current)
                        .fold((0i64, 0i64), |(cpu, memory), c| {
                            (cpu + c.cpu_request_milli, memory + c.memory_request_bytes)
                        });

                    view.node_free.insert(
                        name,
                        NodeHeadroom {
                            cpu_milli: (alloc_cpu - used_cpu).max(0),
                            memory_bytes: (alloc_memory - used_memory).max(0),
                        },
                    );
                }
            }
        }

        view
    }

    /* ── per-pod processing ── */

    async fn process_pod(
        &self,
        pod: &Pod,
        settings: &TickSettings,
        snapshot: &ConfigSnapshot,
        view: &ClusterView,
        updates: &AtomicU32,
        now: DateTime<Utc>,
    ) {
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.name_any();

        let entry = self.entry_for(&uid).await;
        let mut record = entry.record.lock().await;

        // Cooldown: deferred pods sit out until their window passes.
        if record.phase == PodPhase::Cooldown
            && record.cooldown_until.is_some_and(|until| now < until)
        {
            return;
        }

        // Observing: wait for the applied values to land, then settle.
        if record.phase == PodPhase::Observing {
            self.settle_observation(pod, settings, &mut record, now).await;
            return;
        }

        let meta = workload_meta(pod);
        let strategy = match resolver::resolve(&snapshot.config, &snapshot.policies, &meta, now) {
            Ok(s) => s,
            Err(e) => {
                // Invalid merged strategy: keep previous state, surface in logs.
                warn!(pod = %name, error = %e, "strategy_resolution_failed");
                record.phase = PodPhase::Idle;
                record.last_reason = Some(e.to_string());
                record.updated_at = now;
                return;
            }
        };

        // Failed is sticky until the strategy or the pod spec changes.
        let fingerprint = strategy.fingerprint() ^ pod_spec_hash(pod);
        if record.phase == PodPhase::Failed {
            if record.failed_fingerprint == Some(fingerprint) {
                return;
            }
            record.failed_fingerprint = None;
        }

        record.phase = PodPhase::Evaluating;

        let containers = pod
            .spec
            .as_ref()
            .map(|s| s.containers.clone())
            .unwrap_or_default();

        let mut evaluations: Vec<(String, CurrentResources, TargetSpec)> = Vec::new();
        let mut usage_cpu = 0i64;
        let mut usage_memory = 0i64;
        let mut request_cpu = 0i64;
        let mut request_memory = 0i64;

        for container in &containers {
            let key = usage_key(&namespace, &name, &container.name);
            let stats = self
                .store
                .stats(&key, strategy.cpu.percentile, strategy.memory.percentile)
                .await;
            let Some(stats) = stats else { continue };

            let current = extract_current(container);
            usage_cpu += stats.cpu.select(strategy.cpu.algorithm);
            usage_memory += stats.memory.select(strategy.memory.algorithm);
            request_cpu += current.cpu_request_milli;
            request_memory += current.memory_request_bytes;

            let target = recommender::recommend(&strategy, &current, &stats, &self.caps);
            evaluations.push((container.name.clone(), current, target));
        }

        if evaluations.is_empty() {
            // Insufficient data: defer silently, no event.
            record.phase = PodPhase::Cooldown;
            record.cooldown_until = Some(now + chrono::Duration::from_std(settings.resize_interval).unwrap_or_default());
            record.last_decision = Some(Decision::Deferred);
            record.last_reason = Some("InsufficientData".to_string());
            record.updated_at = now;
            debug!(pod = %name, "reconcile_deferred_insufficient_data");
            return;
        }

        reporter::PODS_PROCESSED.inc();
        if request_cpu > 0 {
            reporter::CPU_USAGE_PERCENT
                .with_label_values(&[&name])
                .set(100.0 * usage_cpu as f64 / request_cpu as f64);
        }
        if request_memory > 0 {
            reporter::MEMORY_USAGE_PERCENT
                .with_label_values(&[&name])
                .set(100.0 * usage_memory as f64 / request_memory as f64);
        }

        // Gate each container's target; the first reject wins for the pod.
        let mut admitted: Vec<ContainerChange> = Vec::new();
        let mut dry_run_changes: Vec<ContainerChange> = Vec::new();
        let mut defer: Option<DeferReason> = None;
        let mut decrease_deferred = false;

        for (container, current, target) in &evaluations {
            reporter::log_decision(&namespace, &name, container, target);

            if target.decision == Decision::Deferred {
                decrease_deferred = true;
                continue;
            }
            if !(target.cpu_changed || target.memory_changed) {
                continue;
            }

            let ctx = GateContext {
                operator_namespace: settings.operator_namespace.clone(),
                self_pod_name: self.self_pod_name.clone(),
                namespace_exclude: settings.namespace_exclude.clone(),
                namespace_include: settings.namespace_include.clone(),
                dry_run: settings.dry_run,
                updates_issued: updates.load(Ordering::SeqCst),
                max_updates_per_run: settings.max_updates_per_run,
                namespace_limits: view.limits.get(&namespace).copied(),
                quota_headroom: view.quotas.get(&namespace).copied(),
                node_headroom: pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    .and_then(|node| view.node_free.get(node))
                    .copied(),
                node_headroom_check: settings.node_headroom_check,
                node_headroom_tolerance_percent: settings.node_headroom_tolerance_percent,
            };

            match safety::check(&namespace, &name, current, target.clone(), &strategy, &ctx) {
                GateOutcome::Admitted(target) => {
                    if target.cpu_changed || target.memory_changed {
                        admitted.push(ContainerChange {
                            container: container.clone(),
                            target,
                        });
                    }
                }
                GateOutcome::DryRun(target) => {
                    dry_run_changes.push(ContainerChange {
                        container: container.clone(),
                        target,
                    });
                }
                GateOutcome::Rejected(reason) => {
                    self.handle_rejection(pod, &strategy, reason, &mut record, now)
                        .await;
                    return;
                }
                GateOutcome::Deferred(reason) => {
                    defer = Some(reason);
                }
            }
        }

        if let Some(reason) = defer {
            self.handle_deferral(pod, reason.as_str(), settings, &mut record, now)
                .await;
            return;
        }

        if decrease_deferred && admitted.is_empty() && dry_run_changes.is_empty() {
            self.handle_deferral(pod, "DecreaseUnsupported", settings, &mut record, now)
                .await;
            return;
        }

        if !dry_run_changes.is_empty() {
            // Observation only: audit trail without mutation.
            let note = describe_changes(&dry_run_changes);
            reporter::publish_pod_event(
                &self.client,
                pod,
                AuditReason::Resized,
                format!("[dry-run] {note}"),
            )
            .await;
            record.phase = PodPhase::Idle;
            record.last_decision = Some(dry_run_changes[0].target.decision);
            record.last_reason = Some("dry-run".to_string());
            record.updated_at = now;
            return;
        }

        if admitted.is_empty() {
            // Noop decisions get a Normal event too; consecutive noops for
            // the same pod collapse into the first so steady state does not
            // flood the event log.
            if record.last_decision != Some(Decision::Noop) {
                reporter::publish_pod_event(
                    &self.client,
                    pod,
                    AuditReason::NoChange,
                    "within thresholds; no resize needed".to_string(),
                )
                .await;
            }
            record.phase = PodPhase::Idle;
            record.last_decision = Some(Decision::Noop);
            record.last_reason = Some("within-thresholds".to_string());
            record.deferred_priority = false;
            record.updated_at = now;
            return;
        }

        // Rate cap: reserve a slot atomically; losing the race defers.
        let reserved = updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < settings.max_updates_per_run).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            self.handle_deferral(pod, DeferReason::RateCap.as_str(), settings, &mut record, now)
                .await;
            return;
        }

        self.apply_changes(pod, admitted, settings, &mut record, now)
            .await;
    }

    async fn apply_changes(
        &self,
        pod: &Pod,
        changes: Vec<ContainerChange>,
        settings: &TickSettings,
        record: &mut PodRecord,
        now: DateTime<Utc>,
    ) {
        let name = pod.name_any();
        record.phase = PodPhase::Applying;

        executor::update_resize_condition(&self.client, pod, ResizePhase::Pending).await;

        let outcome = executor::apply_resize(
            &self.client,
            pod,
            &changes,
            &self.caps,
            &settings.executor_settings(),
        )
        .await;

        match outcome {
            Ok(applied) => {
                executor::update_resize_condition(&self.client, pod, ResizePhase::InProgress).await;

                reporter::PODS_RESIZED.inc();
                reporter::OPTIMIZATIONS_APPLIED.inc();
                if changes.iter().any(|c| c.target.cpu_changed) {
                    reporter::CPU_ADJUSTMENTS.inc();
                }
                if changes.iter().any(|c| c.target.memory_changed) {
                    reporter::MEMORY_ADJUSTMENTS.inc();
                }

                let note = describe_changes(&changes);
                reporter::publish_pod_event(&self.client, pod, AuditReason::Resized, note).await;

                record.phase = PodPhase::Observing;
                record.observing_since = Some(now);
                record.last_decision = Some(changes[0].target.decision);
                record.last_reason = Some(changes[0].target.reason.clone());
                record.applied = changes;
                record.deferred_priority = false;
                record.updated_at = now;
                debug!(pod = %name, method = ?applied.method, "pod_resized");
            }
            Err(err) => {
                self.handle_apply_error(pod, err, settings, record, now).await;
            }
        }
    }

    async fn handle_apply_error(
        &self,
        pod: &Pod,
        err: ResizeError,
        settings: &TickSettings,
        record: &mut PodRecord,
        now: DateTime<Utc>,
    ) {
        let name = pod.name_any();
        let reason = err.reason_label();

        match &err {
            ResizeError::DecreaseUnsupported(_) => {
                self.handle_deferral(pod, reason, settings, record, now).await;
            }
            ResizeError::AdmissionRejected(_) => {
                reporter::RESIZE_FAILED.with_label_values(&[reason]).inc();
                reporter::publish_pod_event(
                    &self.client,
                    pod,
                    AuditReason::ResizeFailed,
                    err.to_string(),
                )
                .await;
                // Re-evaluate next tick with a refreshed strategy.
                record.phase = PodPhase::Idle;
                record.last_reason = Some(reason.to_string());
                record.updated_at = now;
                warn!(pod = %name, error = %err, "resize_admission_rejected");
            }
            ResizeError::Conflict(_) | ResizeError::Transient(_) => {
                // The executor exhausted its budget; surface and retry on
                // a later tick.
                reporter::RESIZE_FAILED.with_label_values(&[reason]).inc();
                reporter::publish_pod_event(
                    &self.client,
                    pod,
                    AuditReason::ResizeFailed,
                    err.to_string(),
                )
                .await;
                record.phase = PodPhase::Idle;
                record.last_reason = Some(reason.to_string());
                record.updated_at = now;
                warn!(pod = %name, error = %err, "resize_retry_budget_exhausted");
            }
            ResizeError::Fatal(_) => {
                reporter::RESIZE_FAILED.with_label_values(&[reason]).inc();
                reporter::publish_pod_event(
                    &self.client,
                    pod,
                    AuditReason::ResizeFailed,
                    err.to_string(),
                )
                .await;
                record.phase = PodPhase::Failed;
                record.last_reason = Some(err.to_string());
                record.updated_at = now;
                warn!(pod = %name, error = %err, "resize_failed_fatally");
            }
        }

        if record.phase == PodPhase::Failed {
            // Recompute lazily on the next evaluation attempt.
            let meta = workload_meta(pod);
            let snapshot = self.snapshot_rx.borrow().clone();
            if let Ok(strategy) =
                resolver::resolve(&snapshot.config, &snapshot.policies, &meta, now)
            {
                record.failed_fingerprint = Some(strategy.fingerprint() ^ pod_spec_hash(pod));
            }
        }
    }

    async fn handle_rejection(
        &self,
        pod: &Pod,
        strategy: &resolver::EffectiveStrategy,
        reason: RejectReason,
        record: &mut PodRecord,
        now: DateTime<Utc>,
    ) {
        let name = pod.name_any();
        let chain = safety::source_chain(strategy);
        let note = format!("rejected: {} (sources: {:?})", reason.as_str(), chain);

        match reason {
            RejectReason::SelfPod => {
                // A refusal, not a failure: no failure counter.
                reporter::publish_pod_event(&self.client, pod, AuditReason::SelfProtected, note)
                    .await;
            }
            _ => {
                reporter::RESIZE_FAILED
                    .with_label_values(&[reason.as_str()])
                    .inc();
                reporter::publish_pod_event(&self.client, pod, AuditReason::ResizeFailed, note)
                    .await;
            }
        }

        record.phase = PodPhase::Idle;
        record.last_reason = Some(reason.as_str().to_string());
        record.updated_at = now;
        info!(pod = %name, reason = reason.as_str(), "resize_rejected");
    }

    async fn handle_deferral(
        &self,
        pod: &Pod,
        reason: &str,
        settings: &TickSettings,
        record: &mut PodRecord,
        now: DateTime<Utc>,
    ) {
        let name = pod.name_any();
        reporter::RESIZE_DEFERRED.with_label_values(&[reason]).inc();
        reporter::publish_pod_event(
            &self.client,
            pod,
            AuditReason::ResizeDeferred,
            format!("deferred: {reason}"),
        )
        .await;

        let cooldown = if reason == DeferReason::RateCap.as_str() {
            // Next tick, with priority preserved.
            settings.resize_interval
        } else {
            settings.cooldown()
        };

        record.phase = PodPhase::Cooldown;
        record.cooldown_until = Some(now + chrono::Duration::from_std(cooldown).unwrap_or_default());
        record.deferred_priority = true;
        record.last_decision = Some(Decision::Deferred);
        record.last_reason = Some(reason.to_string());
        record.updated_at = now;
        info!(pod = %name, reason = %reason, "resize_deferred");
    }

    /// Observing → stable → Idle. Stability means the live spec matches
    /// every applied target; three intervals without convergence settles
    /// back to Idle regardless so the pod re-enters evaluation.
    async fn settle_observation(
        &self,
        pod: &Pod,
        settings: &TickSettings,
        record: &mut PodRecord,
        now: DateTime<Utc>,
    ) {
        let stable = record.applied.iter().all(|change| {
            pod.spec
                .as_ref()
                .map(|s| s.containers.as_slice())
                .unwrap_or_default()
                .iter()
                .find(|c| c.name == change.container)
                .map(extract_current)
                .is_some_and(|current| {
                    current.cpu_request_milli == change.target.cpu_request_milli
                        && current.memory_request_bytes == change.target.memory_request_bytes
                })
        });

        let timed_out = record.observing_since.is_some_and(|since| {
            now.signed_duration_since(since)
                > chrono::Duration::from_std(settings.resize_interval * 3).unwrap_or_default()
        });

        if stable {
            executor::update_resize_condition(&self.client, pod, ResizePhase::Completed).await;
        }
        if stable || timed_out {
            record.phase = PodPhase::Idle;
            record.observing_since = None;
            record.applied.clear();
            record.updated_at = now;
        }
    }

    /// Stamp the config's status with the tick time; the hub owns phase.
    async fn stamp_config_status(&self) {
        let api: Api<RightSizerConfig> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "status": { "lastReconcileTime": Utc::now().to_rfc3339() }
        });
        if let Err(e) = api
            .patch_status(
                CONFIG_NAME,
                &PatchParams::apply(executor::FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
        {
            debug!(error = %e, "config_tick_stamp_failed");
        }
    }
}

fn describe_changes(changes: &[ContainerChange]) -> String {
    changes
        .iter()
        .map(|c| {
            format!(
                "{}: cpu {}/{} memory {}/{} ({})",
                c.container,
                quantity::format_cpu_milli(c.target.cpu_request_milli),
                quantity::format_cpu_milli(c.target.cpu_limit_milli),
                quantity::format_memory_bytes(c.target.memory_request_bytes),
                quantity::format_memory_bytes(c.target.memory_limit_bytes),
                c.target.reason,
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::MIB;
    use crate::recommender::QosClass;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn settings() -> TickSettings {
        TickSettings::resolve(&RightSizerConfigSpec::default(), &Overrides::default())
    }

    fn running_pod(name: &str, namespace: &str, age_secs: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(format!("uid-{name}")),
                creation_timestamp: Some(Time(Utc::now() - chrono::Duration::seconds(age_secs))),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    // ── Settings resolution ──

    #[test]
    fn test_settings_builtin_defaults() {
        let s = settings();
        assert!(s.enabled);
        assert!(!s.dry_run);
        assert_eq!(s.resize_interval, Duration::from_secs(30));
        assert_eq!(s.batch_size, 10);
        assert_eq!(s.delay_between_batches, Duration::from_secs(1));
        assert_eq!(s.max_updates_per_run, 50);
        assert_eq!(s.min_pod_age, Duration::from_secs(60));
        assert_eq!(s.operator_namespace, "default");
        assert_eq!(s.parent_patch_kinds, vec!["Deployment".to_string()]);
    }

    #[test]
    fn test_settings_crd_fields_override_builtins() {
        let config = RightSizerConfigSpec {
            resize_interval_seconds: Some(10),
            batch_size: Some(3),
            max_updates_per_run: Some(7),
            operator_namespace: Some("rightsizer-system".to_string()),
            ..Default::default()
        };
        let s = TickSettings::resolve(&config, &Overrides::default());
        assert_eq!(s.resize_interval, Duration::from_secs(10));
        assert_eq!(s.batch_size, 3);
        assert_eq!(s.max_updates_per_run, 7);
        assert_eq!(s.operator_namespace, "rightsizer-system");
    }

    #[test]
    fn test_settings_overrides_beat_crd() {
        let config = RightSizerConfigSpec {
            resize_interval_seconds: Some(10),
            dry_run: Some(false),
            operator_namespace: Some("from-crd".to_string()),
            namespace_exclude: Some(vec!["a".to_string()]),
            ..Default::default()
        };
        let overrides = Overrides {
            dry_run: true,
            operator_namespace: Some("from-cli".to_string()),
            resize_interval: Some(Duration::from_secs(99)),
            namespace_include: vec!["prod".to_string()],
            namespace_exclude: vec!["b".to_string()],
        };
        let s = TickSettings::resolve(&config, &overrides);
        assert!(s.dry_run);
        assert_eq!(s.resize_interval, Duration::from_secs(99));
        assert_eq!(s.operator_namespace, "from-cli");
        assert_eq!(s.namespace_include, vec!["prod".to_string()]);
        // Excludes are a union.
        assert!(s.namespace_exclude.contains(&"a".to_string()));
        assert!(s.namespace_exclude.contains(&"b".to_string()));
    }

    #[test]
    fn test_cooldown_floor_is_sixty_seconds() {
        let mut s = settings();
        s.resize_interval = Duration::from_secs(5);
        assert_eq!(s.cooldown(), Duration::from_secs(60));
        s.resize_interval = Duration::from_secs(30);
        assert_eq!(s.cooldown(), Duration::from_secs(90));
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let config = RightSizerConfigSpec {
            batch_size: Some(0),
            ..Default::default()
        };
        let s = TickSettings::resolve(&config, &Overrides::default());
        assert_eq!(s.batch_size, 1);
    }

    // ── Eligibility ──

    #[test]
    fn test_eligible_running_pod() {
        assert!(is_eligible(&running_pod("web", "prod", 300), &settings(), Utc::now()));
    }

    #[test]
    fn test_pending_pod_not_eligible() {
        let mut pod = running_pod("web", "prod", 300);
        pod.status.as_mut().unwrap().phase = Some("Pending".to_string());
        assert!(!is_eligible(&pod, &settings(), Utc::now()));
    }

    #[test]
    fn test_young_pod_not_eligible() {
        assert!(!is_eligible(&running_pod("web", "prod", 10), &settings(), Utc::now()));
    }

    #[test]
    fn test_system_namespace_not_eligible() {
        assert!(!is_eligible(
            &running_pod("dns", "kube-system", 300),
            &settings(),
            Utc::now()
        ));
    }

    #[test]
    fn test_excluded_namespace_not_eligible() {
        let mut s = settings();
        s.namespace_exclude = vec!["qa".to_string()];
        assert!(!is_eligible(&running_pod("web", "qa", 300), &s, Utc::now()));
    }

    #[test]
    fn test_include_list_restricts_scope() {
        let mut s = settings();
        s.namespace_include = vec!["prod".to_string()];
        assert!(is_eligible(&running_pod("web", "prod", 300), &s, Utc::now()));
        assert!(!is_eligible(&running_pod("web", "dev", 300), &s, Utc::now()));
    }

    #[test]
    fn test_unknown_owner_kind_not_eligible() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        let mut pod = running_pod("agent", "prod", 300);
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "Node".to_string(),
            name: "worker-1".to_string(),
            ..Default::default()
        }]);
        assert!(!is_eligible(&pod, &settings(), Utc::now()));
    }

    #[test]
    fn test_replicaset_owned_pod_eligible() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
        let mut pod = running_pod("web-abc", "prod", 300);
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "ReplicaSet".to_string(),
            name: "web-5d4f8b".to_string(),
            ..Default::default()
        }]);
        assert!(is_eligible(&pod, &settings(), Utc::now()));
    }

    // ── Shuffle ──

    #[test]
    fn test_shuffle_deterministic_per_seed() {
        let make = || {
            vec![
                running_pod("a", "prod", 300),
                running_pod("b", "prod", 300),
                running_pod("c", "prod", 300),
                running_pod("d", "prod", 300),
            ]
        };
        let mut one = make();
        let mut two = make();
        shuffle_deterministically(&mut one, 42);
        shuffle_deterministically(&mut two, 42);
        let names = |pods: &[Pod]| -> Vec<String> {
            pods.iter().map(|p| p.name_any()).collect()
        };
        assert_eq!(names(&one), names(&two));
    }

    #[test]
    fn test_shuffle_varies_with_seed() {
        // With enough pods, at least one seed pair produces a different order.
        let make = || -> Vec<Pod> {
            (0..16).map(|i| running_pod(&format!("p{i}"), "prod", 300)).collect()
        };
        let mut base = make();
        shuffle_deterministically(&mut base, 0);
        let base_names: Vec<String> = base.iter().map(|p| p.name_any()).collect();

        let differs = (1..8).any(|seed| {
            let mut pods = make();
            shuffle_deterministically(&mut pods, seed);
            let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
            names != base_names
        });
        assert!(differs);
    }

    // ── Spec extraction ──

    #[test]
    fn test_extract_current_resources() {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("500m".to_string()));
        requests.insert("memory".to_string(), Quantity("512Mi".to_string()));
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), Quantity("1".to_string()));
        limits.insert("memory".to_string(), Quantity("1Gi".to_string()));

        let container = Container {
            name: "app".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        };

        let current = extract_current(&container);
        assert_eq!(current.cpu_request_milli, 500);
        assert_eq!(current.cpu_limit_milli, 1000);
        assert_eq!(current.memory_request_bytes, 512 * MIB);
        assert_eq!(current.memory_limit_bytes, 1024 * MIB);
        assert_eq!(recommender::qos_of(&current), QosClass::Burstable);
    }

    #[test]
    fn test_extract_current_empty_container() {
        let container = Container {
            name: "bare".to_string(),
            ..Default::default()
        };
        assert_eq!(extract_current(&container), CurrentResources::default());
    }

    #[test]
    fn test_pod_spec_hash_tracks_resource_changes() {
        let pod_a = running_pod("web", "prod", 300);
        let mut pod_b = running_pod("web", "prod", 300);

        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), Quantity("100m".to_string()));
        pod_b.spec.as_mut().unwrap().containers[0].resources = Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        });

        assert_ne!(pod_spec_hash(&pod_a), pod_spec_hash(&pod_b));
        assert_eq!(pod_spec_hash(&pod_a), pod_spec_hash(&running_pod("web", "prod", 300)));
    }

    // ── Batch arithmetic (throttling scenario) ──

    #[test]
    fn test_batch_throttling_arithmetic() {
        // 1000 eligible pods, batches of 10, 1s between batches, cap 100:
        // the cap admits exactly 100 mutations, reached within the first
        // 10 batches, so the gap sleeps to that point total ~10s.
        let eligible = 1000usize;
        let batch_size = 10usize;
        let cap = 100u32;

        let updates = AtomicU32::new(0);
        let mut applied = 0u32;
        let mut batches_until_cap = 0usize;
        for batch in (0..eligible).collect::<Vec<_>>().chunks(batch_size) {
            for _ in batch {
                if updates
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < cap).then_some(n + 1)
                    })
                    .is_ok()
                {
                    applied += 1;
                }
            }
            batches_until_cap += 1;
            if updates.load(Ordering::SeqCst) >= cap {
                break;
            }
        }

        assert_eq!(applied, 100);
        assert_eq!(batches_until_cap, 100usize.div_ceil(batch_size));
    }

    // ── Record lifecycle helpers ──

    #[test]
    fn test_new_record_starts_discovered() {
        let record = PodRecord::new();
        assert_eq!(record.phase, PodPhase::Discovered);
        assert!(record.cooldown_until.is_none());
        assert!(!record.deferred_priority);
    }

    #[test]
    fn test_describe_changes_lists_quantities() {
        let change = ContainerChange {
            container: "app".to_string(),
            target: TargetSpec {
                cpu_request_milli: 150,
                cpu_limit_milli: 300,
                memory_request_bytes: 256 * MIB,
                memory_limit_bytes: 512 * MIB,
                qos: QosClass::Burstable,
                decision: Decision::Downscale,
                reason: "low-util".to_string(),
                cpu_changed: true,
                memory_changed: false,
            },
        };
        let described = describe_changes(&[change]);
        assert!(described.contains("app"));
        assert!(described.contains("150m/300m"));
        assert!(described.contains("256Mi/512Mi"));
        assert!(described.contains("low-util"));
    }
}
