use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kube::Client;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::hub::ConfigSnapshot;
use crate::quantity;
use crate::usage::{UsageSample, UsageStore, usage_key};

/* ============================= CAPABILITY ============================= */

/// One container's usage as reported by the metrics source.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsage {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub cpu_milli: i64,
    pub memory_bytes: i64,
    pub at: DateTime<Utc>,
}

/// Source of live container usage.
///
/// The sampler is generic over this so tests swap in an in-memory fake.
pub trait MetricsProvider: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<Vec<ContainerUsage>>> + Send;
}

/* ============================= METRICS API ============================= */

#[derive(Debug, Deserialize)]
struct PodMetricsMeta {
    name: String,
    namespace: String,
}

#[derive(Debug, Deserialize)]
struct ContainerMetricsItem {
    name: String,
    usage: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsItem {
    metadata: PodMetricsMeta,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    containers: Vec<ContainerMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetricsItem>,
}

/// Live provider backed by the cluster's `metrics.k8s.io` API.
#[derive(Clone)]
pub struct MetricsApiProvider {
    client: Client,
}

impl MetricsApiProvider {
    pub fn new(client: Client) -> Self {
        MetricsApiProvider { client }
    }
}

impl MetricsProvider for MetricsApiProvider {
    async fn fetch(&self) -> Result<Vec<ContainerUsage>> {
        let request = http::Request::get("/apis/metrics.k8s.io/v1beta1/pods")
            .body(Vec::new())
            .context("Failed to build metrics API request")?;

        let list: PodMetricsList = self
            .client
            .request(request)
            .await
            .context("Failed to query metrics.k8s.io; is metrics-server installed?")?;

        let mut usages = Vec::new();
        for item in list.items {
            let at = item
                .timestamp
                .as_deref()
                .and_then(|t| t.parse::<DateTime<Utc>>().ok())
                .unwrap_or_else(Utc::now);

            for container in item.containers {
                let cpu_milli = container
                    .usage
                    .get("cpu")
                    .and_then(|q| quantity::parse_cpu_milli(q));
                let memory_bytes = container
                    .usage
                    .get("memory")
                    .and_then(|q| quantity::parse_memory_bytes(q));

                let (Some(cpu_milli), Some(memory_bytes)) = (cpu_milli, memory_bytes) else {
                    debug!(
                        pod = %item.metadata.name,
                        container = %container.name,
                        "metrics_sample_unparseable"
                    );
                    continue;
                };

                usages.push(ContainerUsage {
                    namespace: item.metadata.namespace.clone(),
                    pod: item.metadata.name.clone(),
                    container: container.name,
                    cpu_milli,
                    memory_bytes,
                    at,
                });
            }
        }
        Ok(usages)
    }
}

/* ============================= IN-MEMORY FAKE ============================= */

/// Scripted provider for tests: returns whatever was staged.
#[derive(Debug, Default)]
pub struct InMemoryMetricsProvider {
    usages: Mutex<Vec<ContainerUsage>>,
}

impl InMemoryMetricsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_usages(&self, usages: Vec<ContainerUsage>) {
        *self.usages.lock().expect("provider mutex poisoned") = usages;
    }
}

impl MetricsProvider for InMemoryMetricsProvider {
    async fn fetch(&self) -> Result<Vec<ContainerUsage>> {
        Ok(self.usages.lock().expect("provider mutex poisoned").clone())
    }
}

/* ============================= SAMPLER TASK ============================= */

/// Ring capacity: the widest history window any active strategy asks for.
pub fn window_capacity(snapshot: &ConfigSnapshot) -> usize {
    let mut capacity: u32 = 12;

    let mut consider = |window: Option<u32>| {
        if let Some(w) = window
            && w > capacity
        {
            capacity = w;
        }
    };

    if let Some(defaults) = &snapshot.config.default_strategy {
        consider(defaults.cpu.as_ref().and_then(|s| s.history_window));
        consider(defaults.memory.as_ref().and_then(|s| s.history_window));
    }
    for policy in &snapshot.policies {
        consider(policy.spec.cpu.as_ref().and_then(|s| s.history_window));
        consider(policy.spec.memory.as_ref().and_then(|s| s.history_window));
    }

    capacity as usize
}

/// Periodically pull usage into the shared store.
///
/// Runs on its own ticker so a slow reconcile tick never starves history.
/// Also evicts windows whose pod has been gone for twice the window span.
pub async fn sampler_loop<M: MetricsProvider>(
    provider: M,
    store: Arc<UsageStore>,
    interval: Duration,
    snapshot_rx: tokio::sync::watch::Receiver<Arc<ConfigSnapshot>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(interval_secs = interval.as_secs(), "usage_sampler_started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("usage_sampler_stopped");
                return;
            }
            _ = sleep(interval) => {
                let window_capacity = window_capacity(&snapshot_rx.borrow().clone());
                match provider.fetch().await {
                    Ok(usages) => {
                        let count = usages.len();
                        for usage in usages {
                            let key = usage_key(&usage.namespace, &usage.pod, &usage.container);
                            let sample = UsageSample {
                                at: usage.at,
                                cpu_milli: usage.cpu_milli,
                                memory_bytes: usage.memory_bytes,
                            };
                            store.record(&key, sample, window_capacity).await;
                        }

                        let max_age = chrono::Duration::from_std(
                            interval * (2 * window_capacity as u32),
                        )
                        .unwrap_or_else(|_| chrono::Duration::hours(24));
                        let evicted = store.evict_stale(Utc::now(), max_age).await;

                        debug!(samples = count, evicted, "usage_sampler_tick");
                    }
                    Err(e) => {
                        warn!(error = %e, "usage_sampler_fetch_failed");
                    }
                }
            }
        }
    }
}

/* ============================= TESTS ============================= */
