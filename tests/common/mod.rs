#![allow(dead_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use kube_rightsizer::quantity::MIB;

pub const GIB: i64 = 1024 * MIB;

/// Build a Running pod with one container carrying the given resources.
/// Empty strings leave the corresponding request/limit unset.
pub fn make_test_pod(
    name: &str,
    namespace: &str,
    cpu_request: &str,
    cpu_limit: &str,
    memory_request: &str,
    memory_limit: &str,
    age_secs: i64,
) -> Pod {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    if !cpu_request.is_empty() {
        requests.insert("cpu".to_string(), Quantity(cpu_request.to_string()));
    }
    if !memory_request.is_empty() {
        requests.insert("memory".to_string(), Quantity(memory_request.to_string()));
    }
    if !cpu_limit.is_empty() {
        limits.insert("cpu".to_string(), Quantity(cpu_limit.to_string()));
    }
    if !memory_limit.is_empty() {
        limits.insert("memory".to_string(), Quantity(memory_limit.to_string()));
    }

    let resources = if requests.is_empty() && limits.is_empty() {
        None
    } else {
        Some(ResourceRequirements {
            requests: (!requests.is_empty()).then_some(requests),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        })
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            creation_timestamp: Some(Time(
                chrono::Utc::now() - chrono::Duration::seconds(age_secs),
            )),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                resources,
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
