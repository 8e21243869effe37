//! Helpers for the common case of Services employing Pods.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};

use consist_common::Result;

use crate::adapter::PodEmployeeStatuses;
use crate::naming::{CONTROLLED_BY_LABEL, POD_SERVICE_AVAILABLE_LABEL};

fn selector(service: &Service) -> Option<&BTreeMap<String, String>> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .filter(|selector| !selector.is_empty())
}

/// Whether the Service is marked for a consist controller
pub fn is_controlled(service: &Service) -> bool {
    service
        .labels()
        .get(CONTROLLED_BY_LABEL)
        .is_some_and(|v| v == "true")
}

/// Whether the Service's selector matches the pod.
///
/// A Service without a selector selects nothing.
pub fn service_selects_pod(service: &Service, pod: &Pod) -> bool {
    if service.namespace() != pod.namespace() {
        return false;
    }
    let Some(selector) = selector(service) else {
        return false;
    };
    let labels = pod.labels();
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Label selector string for the Service, `None` when it has no selector
pub fn label_selector(service: &Service) -> Option<String> {
    selector(service).map(|selector| {
        selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    })
}

/// Pods in the Service's namespace matched by its selector
pub async fn list_selected_pods(client: &Client, service: &Service) -> Result<Vec<Pod>> {
    let Some(selector) = label_selector(service) else {
        return Ok(Vec::new());
    };
    let namespace = service.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let list = pods.list(&ListParams::default().labels(&selector)).await?;
    Ok(list.items)
}

/// Names of the pods the Service selects
pub async fn selected_pod_names(client: &Client, service: &Service) -> Result<Vec<String>> {
    Ok(list_selected_pods(client, service)
        .await?
        .iter()
        .map(ResourceExt::name_any)
        .collect())
}

/// Standard employee status of a pod.
///
/// The pod is lifecycle-ready while it carries the service-available label.
pub fn pod_employee_statuses(pod: &Pod) -> PodEmployeeStatuses {
    let status = pod.status.as_ref();
    let ip = status
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_default();
    let ipv6 = status
        .and_then(|s| s.pod_ips.as_ref())
        .and_then(|ips| ips.iter().find(|pod_ip| pod_ip.ip.contains(':')))
        .map(|pod_ip| pod_ip.ip.clone())
        .unwrap_or_default();
    PodEmployeeStatuses {
        ip,
        ipv6,
        lifecycle_ready: pod.labels().contains_key(POD_SERVICE_AVAILABLE_LABEL),
        extra_status: serde_json::Value::Null,
    }
}
