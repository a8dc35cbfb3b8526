use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube_runtime::watcher::{watcher, Config, Event};
use kube::{Client, ResourceExt};
use tokio::sync::{broadcast, watch};
use tokio::time::interval;
use tracing::{info, warn};

use crate::crd::{
    CrdPhase, CONFIG_NAME, RightSizerConfig, RightSizerConfigSpec, RightSizerConfigStatus,
    RightSizerPolicy, RightSizerPolicyStatus, StatusCondition,
};
use crate::reporter::{self, AuditReason};
use crate::resolver::{self, NamedPolicy};

const RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/* ============================= SNAPSHOT ============================= */

/// Immutable view of the configuration the reconciler consumes.
///
/// Republished on every accepted change; readers hold an `Arc` and never
/// see a half-applied update. Invalid policies are excluded.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub config: RightSizerConfigSpec,
    pub policies: Vec<NamedPolicy>,
    /// Both informers have delivered their initial list.
    pub synced: bool,
}

/* ============================= HUB ============================= */

/// Watches both CRDs, validates eagerly, reports status, and publishes
/// snapshots. Validation failures mark the object `Invalid` and keep the
/// previous effective state; they never block other objects.
pub struct WatchHub {
    client: Client,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
}

impl WatchHub {
    pub fn new(client: Client) -> (Self, watch::Receiver<Arc<ConfigSnapshot>>) {
        let (tx, rx) = watch::channel(Arc::new(ConfigSnapshot::default()));
        (WatchHub { client, tx }, rx)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let configs: Api<RightSizerConfig> = Api::all(self.client.clone());
        let policies: Api<RightSizerPolicy> = Api::all(self.client.clone());

        let mut config_stream = watcher(configs.clone(), Config::default()).boxed();
        let mut policy_stream = watcher(policies.clone(), Config::default()).boxed();

        let mut resync = interval(RESYNC_INTERVAL);
        resync.tick().await; // first tick is immediate

        let mut state = HubState::default();

        info!("crd_watch_hub_started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("crd_watch_hub_stopped");
                    return Ok(());
                }

                _ = resync.tick() => {
                    if let Err(e) = self.resync(&configs, &policies, &mut state).await {
                        warn!(error = %e, "crd_resync_failed");
                    }
                }

                event = config_stream.next() => {
                    if let Some(Ok(event)) = event {
                        self.on_config_event(event, &mut state).await;
                    }
                }

                event = policy_stream.next() => {
                    if let Some(Ok(event)) = event {
                        self.on_policy_event(event, &mut state).await;
                    }
                }
            }
        }
    }

    /* ── config events ── */

    async fn on_config_event(&self, event: Event<RightSizerConfig>, state: &mut HubState) {
        match event {
            Event::Applied(config) => {
                self.admit_config(&config, state).await;
            }
            Event::Deleted(config) => {
                if config.name_any() == CONFIG_NAME {
                    info!("config_deleted_reverting_to_defaults");
                    state.config = RightSizerConfigSpec::default();
                    self.publish(state);
                }
            }
            Event::Restarted(items) => {
                state.config_synced = true;
                for config in &items {
                    self.admit_config(config, state).await;
                }
                if items.is_empty() {
                    self.publish(state);
                }
            }
        }
    }

    async fn admit_config(&self, config: &RightSizerConfig, state: &mut HubState) {
        let name = config.name_any();
        if name != CONFIG_NAME {
            warn!(config = %name, "config_ignored_not_singleton");
            return;
        }

        let errors = resolver::validate_config(&config.spec);
        let generation = config.metadata.generation;

        if errors.is_empty() {
            state.config = config.spec.clone();
            self.publish(state);
            self.patch_config_status(&name, generation, CrdPhase::Active, None)
                .await;
            info!(generation = ?generation, "config_admitted");
        } else {
            // Keep the previous effective config; only the status changes.
            let message = errors.join("; ");
            self.patch_config_status(&name, generation, CrdPhase::Invalid, Some(message.clone()))
                .await;
            warn!(errors = %message, "config_rejected");
        }
    }

    async fn patch_config_status(
        &self,
        name: &str,
        generation: Option<i64>,
        phase: CrdPhase,
        message: Option<String>,
    ) {
        let status = RightSizerConfigStatus {
            phase: Some(phase),
            observed_generation: generation,
            conditions: Some(vec![validated_condition(phase, message.clone())]),
            message,
            last_reconcile_time: Some(chrono::Utc::now().to_rfc3339()),
        };
        let api: Api<RightSizerConfig> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        if let Err(e) = api
            .patch_status(
                name,
                &PatchParams::apply("kube-rightsizer"),
                &Patch::Merge(&patch),
            )
            .await
        {
            warn!(error = %e, config = %name, "config_status_update_failed");
        }
    }

    /* ── policy events ── */

    async fn on_policy_event(&self, event: Event<RightSizerPolicy>, state: &mut HubState) {
        match event {
            Event::Applied(policy) => {
                self.admit_policy(&policy, state).await;
                self.publish(state);
            }
            Event::Deleted(policy) => {
                let name = policy.name_any();
                state.policies.remove(&name);
                info!(policy = %name, "policy_removed");
                self.publish(state);
            }
            Event::Restarted(items) => {
                state.policies_synced = true;
                state.policies.clear();
                for policy in &items {
                    self.admit_policy(policy, state).await;
                }
                self.publish(state);
            }
        }
    }

    async fn admit_policy(&self, policy: &RightSizerPolicy, state: &mut HubState) {
        let name = policy.name_any();
        let errors = resolver::validate_policy(&policy.spec);
        let generation = policy.metadata.generation;

        if errors.is_empty() {
            state.policies.insert(
                name.clone(),
                NamedPolicy {
                    name: name.clone(),
                    spec: policy.spec.clone(),
                },
            );
            self.patch_policy_status(&name, generation, CrdPhase::Active, Vec::new())
                .await;
            info!(policy = %name, priority = ?policy.spec.priority, "policy_admitted");
        } else {
            // Inactive: excluded from snapshots, surfaced on status.
            state.policies.remove(&name);
            self.patch_policy_status(&name, generation, CrdPhase::Invalid, errors.clone())
                .await;
            reporter::publish_event(
                &self.client,
                reporter::crd_reference(policy),
                AuditReason::PolicyInvalid,
                errors.join("; "),
            )
            .await;
            warn!(policy = %name, errors = %errors.join("; "), "policy_rejected");
        }
    }

    async fn patch_policy_status(
        &self,
        name: &str,
        generation: Option<i64>,
        phase: CrdPhase,
        errors: Vec<String>,
    ) {
        let message = (!errors.is_empty()).then(|| errors.join("; "));
        let status = RightSizerPolicyStatus {
            phase: Some(phase),
            observed_generation: generation,
            conditions: Some(vec![validated_condition(phase, message)]),
            validation_errors: if errors.is_empty() { None } else { Some(errors) },
            last_reconcile_time: Some(chrono::Utc::now().to_rfc3339()),
        };
        let api: Api<RightSizerPolicy> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        if let Err(e) = api
            .patch_status(
                name,
                &PatchParams::apply("kube-rightsizer"),
                &Patch::Merge(&patch),
            )
            .await
        {
            warn!(error = %e, policy = %name, "policy_status_update_failed");
        }
    }

    /* ── resync ── */

    async fn resync(
        &self,
        configs: &Api<RightSizerConfig>,
        policies: &Api<RightSizerPolicy>,
        state: &mut HubState,
    ) -> Result<()> {
        let config_list = configs
            .list(&Default::default())
            .await
            .context("Failed to relist configs")?;
        for config in &config_list.items {
            self.admit_config(config, state).await;
        }

        let policy_list = policies
            .list(&Default::default())
            .await
            .context("Failed to relist policies")?;
        state.policies.clear();
        for policy in &policy_list.items {
            self.admit_policy(policy, state).await;
        }

        state.config_synced = true;
        state.policies_synced = true;
        self.publish(state);
        info!(policies = state.policies.len(), "crd_resync_complete");
        Ok(())
    }

    fn publish(&self, state: &HubState) {
        let snapshot = ConfigSnapshot {
            config: state.config.clone(),
            policies: state.policies.values().cloned().collect(),
            synced: state.config_synced && state.policies_synced,
        };
        let _ = self.tx.send(Arc::new(snapshot));
    }
}

fn validated_condition(phase: CrdPhase, message: Option<String>) -> StatusCondition {
    StatusCondition {
        type_: "Validated".to_string(),
        status: if phase == CrdPhase::Invalid {
            "False".to_string()
        } else {
            "True".to_string()
        },
        reason: Some(format!("{phase:?}")),
        message,
        last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
    }
}

#[derive(Default)]
struct HubState {
    config: RightSizerConfigSpec,
    policies: BTreeMap<String, NamedPolicy>,
    config_synced: bool,
    policies_synced: bool,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ResourceStrategy, RightSizerPolicySpec};

    #[test]
    fn test_snapshot_default_not_synced() {
        let snapshot = ConfigSnapshot::default();
        assert!(!snapshot.synced);
        assert!(snapshot.policies.is_empty());
    }

    #[test]
    fn test_hub_state_publish_ordering_is_deterministic() {
        // Policies are kept in a BTreeMap, so snapshots list them in
        // name order regardless of arrival order.
        let mut state = HubState::default();
        for name in ["zeta", "alpha", "mid"] {
            state.policies.insert(
                name.to_string(),
                NamedPolicy {
                    name: name.to_string(),
                    spec: RightSizerPolicySpec::default(),
                },
            );
        }
        let names: Vec<&str> = state.policies.values().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_validated_condition_tracks_phase() {
        let ok = validated_condition(CrdPhase::Active, None);
        assert_eq!(ok.type_, "Validated");
        assert_eq!(ok.status, "True");
        assert_eq!(ok.reason.as_deref(), Some("Active"));

        let bad = validated_condition(CrdPhase::Invalid, Some("bad threshold".to_string()));
        assert_eq!(bad.status, "False");
        assert_eq!(bad.message.as_deref(), Some("bad threshold"));
    }

    #[test]
    fn test_invalid_policy_is_detected_before_admission() {
        let spec = RightSizerPolicySpec {
            cpu: Some(ResourceStrategy {
                scale_up_threshold: Some(0.2),
                scale_down_threshold: Some(0.8),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!resolver::validate_policy(&spec).is_empty());
    }
}
