//! Demo adapter: Services mirrored into an in-memory load balancer
//!
//! Every Service labelled `kusionstack.io/control=true` gets one listener
//! per port and one backend server per selected pod IP. The "load balancer"
//! lives in process memory, so the full finalizer protocol can be exercised
//! on a real cluster without any external system.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use consist_common::{Error, Result};
use consist_controller::adapter::{
    AdapterOptions, CudOutcome, Entity, JsonEmployer, PodEmployee, ReconcileAdapter,
};
use consist_controller::client::EmployerKey;
use consist_controller::cluster::{ClusterClients, ClusterRoute, EmployeeRouting, CLUSTER_SEPARATOR};
use consist_controller::naming::CONTROLLED_BY_LABEL;
use consist_controller::service::{
    is_controlled, list_selected_pods, pod_employee_statuses, selected_pod_names,
    service_selects_pod,
};

use crate::webhook::WebhookAdapter;

/// Controller and webhook name of the demo adapter
pub const DEMO_ADAPTER_NAME: &str = "resource-consist-demo";

/// Requeue delay after a pass with failed items
pub const DEMO_SYNC_REQUEUE: Duration = Duration::from_millis(100);

fn employer_id(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    )
}

fn deleting(service: &Service) -> bool {
    service.metadata.deletion_timestamp.is_some()
}

/// Listeners a Service should have, one per port
pub fn expected_listeners(service: &Service) -> Vec<JsonEmployer> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| JsonEmployer {
                    id: format!("{}-{}", port.protocol.as_deref().unwrap_or("TCP"), port.port),
                    status: json!({"port": port.port}),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Backend servers for the selected pods, keyed by pod IP.
///
/// Pods without an IP yet are skipped; traffic follows lifecycle readiness.
pub fn expected_servers(pods: Vec<(String, Pod)>) -> Vec<PodEmployee> {
    pods.into_iter()
        .filter_map(|(name, pod)| {
            let mut statuses = pod_employee_statuses(&pod);
            if statuses.ip.is_empty() {
                return None;
            }
            statuses.extra_status = json!({"trafficOn": statuses.lifecycle_ready});
            Some(PodEmployee {
                id: statuses.ip.clone(),
                name,
                statuses,
            })
        })
        .collect()
}

/// Controlled Services among `services` that select `pod`
pub fn selecting_services(services: &[Service], pod: &Pod) -> Vec<EmployerKey> {
    services
        .iter()
        .filter(|svc| is_controlled(svc) && service_selects_pod(svc, pod))
        .map(|svc| EmployerKey {
            kind: "Service".into(),
            namespace: svc.namespace().unwrap_or_default(),
            name: svc.name_any(),
        })
        .collect()
}

#[derive(Clone, Debug, Default)]
struct Balancer {
    listeners: BTreeMap<String, JsonEmployer>,
    servers: BTreeMap<String, PodEmployee>,
}

/// In-memory load balancers, one per employer
#[derive(Debug, Default)]
pub struct InMemoryBalancers {
    balancers: DashMap<String, Balancer>,
}

impl InMemoryBalancers {
    fn upsert<T: Entity>(
        &self,
        employer: &str,
        items: Vec<T>,
        table: impl Fn(&mut Balancer) -> &mut BTreeMap<String, T>,
    ) -> CudOutcome<T> {
        let mut balancer = self.balancers.entry(employer.to_string()).or_default();
        for item in &items {
            table(&mut *balancer).insert(item.id().to_string(), item.clone());
        }
        CudOutcome::all_succeeded(items)
    }

    fn remove<T: Entity>(
        &self,
        employer: &str,
        items: Vec<T>,
        table: impl Fn(&mut Balancer) -> &mut BTreeMap<String, T>,
    ) -> CudOutcome<T> {
        if let Some(mut balancer) = self.balancers.get_mut(employer) {
            for item in &items {
                table(&mut *balancer).remove(item.id());
            }
        }
        self.balancers
            .remove_if(employer, |_, b| b.listeners.is_empty() && b.servers.is_empty());
        CudOutcome::all_succeeded(items)
    }

    /// Listeners registered for the employer
    pub fn listeners(&self, employer: &str) -> Vec<JsonEmployer> {
        self.balancers
            .get(employer)
            .map(|b| b.listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Servers registered for the employer
    pub fn servers(&self, employer: &str) -> Vec<PodEmployee> {
        self.balancers
            .get(employer)
            .map(|b| b.servers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Register or refresh listeners
    pub fn upsert_listeners(&self, employer: &str, items: Vec<JsonEmployer>) -> CudOutcome<JsonEmployer> {
        self.upsert(employer, items, |b| &mut b.listeners)
    }

    /// Drop listeners
    pub fn remove_listeners(&self, employer: &str, items: Vec<JsonEmployer>) -> CudOutcome<JsonEmployer> {
        self.remove(employer, items, |b| &mut b.listeners)
    }

    /// Register or refresh servers
    pub fn upsert_servers(&self, employer: &str, items: Vec<PodEmployee>) -> CudOutcome<PodEmployee> {
        self.upsert(employer, items, |b| &mut b.servers)
    }

    /// Drop servers
    pub fn remove_servers(&self, employer: &str, items: Vec<PodEmployee>) -> CudOutcome<PodEmployee> {
        self.remove(employer, items, |b| &mut b.servers)
    }

    /// Number of employers with any backend state
    pub fn len(&self) -> usize {
        self.balancers.len()
    }

    /// True when no employer has backend state
    pub fn is_empty(&self) -> bool {
        self.balancers.is_empty()
    }
}

/// Controller half of the demo adapter
pub struct DemoAdapter {
    clusters: ClusterClients,
    routing: EmployeeRouting,
    balancers: InMemoryBalancers,
}

impl DemoAdapter {
    /// Create the adapter; employees are looked up according to `routing`
    pub fn new(clusters: ClusterClients, routing: EmployeeRouting) -> Self {
        Self {
            clusters,
            routing,
            balancers: InMemoryBalancers::default(),
        }
    }

    /// Selected pods with their employee names
    async fn selected_pods(&self, service: &Service) -> Result<Vec<(String, Pod)>> {
        if self.routing != EmployeeRouting::Local {
            let pods = list_selected_pods(self.clusters.hub(), service).await?;
            return Ok(pods.into_iter().map(|pod| (pod.name_any(), pod)).collect());
        }

        let members: Vec<String> = self.clusters.member_names().cloned().collect();
        let mut selected = Vec::new();
        for member in members {
            let client = self
                .clusters
                .client_for(&ClusterRoute::Member(member.clone()))?;
            for pod in list_selected_pods(&client, service).await? {
                selected.push((format!("{}{CLUSTER_SEPARATOR}{member}", pod.name_any()), pod));
            }
        }
        Ok(selected)
    }
}

#[async_trait]
impl ReconcileAdapter for DemoAdapter {
    type Employer = Service;
    type EmployerState = JsonEmployer;
    type EmployeeState = PodEmployee;

    fn controller_name(&self) -> &str {
        DEMO_ADAPTER_NAME
    }

    fn options(&self) -> AdapterOptions {
        AdapterOptions {
            employee_routing: self.routing,
            record_lifecycle_finalizers: true,
            employee_sync_requeue: Some(DEMO_SYNC_REQUEUE),
            employer_label_selector: Some(format!("{CONTROLLED_BY_LABEL}=true")),
            ..Default::default()
        }
    }

    fn employer_selects(&self, employer: &Service, pod: &Pod) -> bool {
        is_controlled(employer) && service_selects_pod(employer, pod)
    }

    async fn selected_employee_names(&self, employer: &Service) -> Result<Vec<String>> {
        if self.routing != EmployeeRouting::Local {
            return selected_pod_names(self.clusters.hub(), employer).await;
        }
        Ok(self
            .selected_pods(employer)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn expected_employers(&self, employer: &Service) -> Result<Vec<JsonEmployer>> {
        if deleting(employer) {
            return Ok(Vec::new());
        }
        Ok(expected_listeners(employer))
    }

    async fn current_employers(&self, employer: &Service) -> Result<Vec<JsonEmployer>> {
        Ok(self.balancers.listeners(&employer_id(employer)))
    }

    async fn create_employers(
        &self,
        employer: &Service,
        to_create: Vec<JsonEmployer>,
    ) -> Result<CudOutcome<JsonEmployer>> {
        Ok(self.balancers.upsert_listeners(&employer_id(employer), to_create))
    }

    async fn update_employers(
        &self,
        employer: &Service,
        to_update: Vec<JsonEmployer>,
    ) -> Result<CudOutcome<JsonEmployer>> {
        Ok(self.balancers.upsert_listeners(&employer_id(employer), to_update))
    }

    async fn delete_employers(
        &self,
        employer: &Service,
        to_delete: Vec<JsonEmployer>,
    ) -> Result<CudOutcome<JsonEmployer>> {
        Ok(self.balancers.remove_listeners(&employer_id(employer), to_delete))
    }

    async fn expected_employees(&self, employer: &Service) -> Result<Vec<PodEmployee>> {
        if deleting(employer) {
            return Ok(Vec::new());
        }
        Ok(expected_servers(self.selected_pods(employer).await?))
    }

    async fn current_employees(&self, employer: &Service) -> Result<Vec<PodEmployee>> {
        Ok(self.balancers.servers(&employer_id(employer)))
    }

    async fn create_employees(
        &self,
        employer: &Service,
        to_create: Vec<PodEmployee>,
    ) -> Result<CudOutcome<PodEmployee>> {
        debug!(employer = %employer_id(employer), count = to_create.len(), "registering servers");
        Ok(self.balancers.upsert_servers(&employer_id(employer), to_create))
    }

    async fn update_employees(
        &self,
        employer: &Service,
        to_update: Vec<PodEmployee>,
    ) -> Result<CudOutcome<PodEmployee>> {
        Ok(self.balancers.upsert_servers(&employer_id(employer), to_update))
    }

    async fn delete_employees(
        &self,
        employer: &Service,
        to_delete: Vec<PodEmployee>,
    ) -> Result<CudOutcome<PodEmployee>> {
        debug!(employer = %employer_id(employer), count = to_delete.len(), "deregistering servers");
        Ok(self.balancers.remove_servers(&employer_id(employer), to_delete))
    }
}

/// Webhook half of the demo adapter
pub struct DemoWebhookAdapter {
    client: Client,
}

impl DemoWebhookAdapter {
    /// Create the adapter reading Services through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookAdapter for DemoWebhookAdapter {
    fn name(&self) -> &str {
        DEMO_ADAPTER_NAME
    }

    async fn employers_for_employee(&self, pod: &Pod) -> Result<Vec<EmployerKey>> {
        let namespace = pod.namespace().unwrap_or_default();
        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        match services.list(&ListParams::default()).await.map_err(Error::from) {
            Ok(list) => Ok(selecting_services(&list.items, pod)),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
