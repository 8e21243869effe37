//! In-memory cluster and backend for multi-pass reconcile tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ObjectReference, Pod, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;

use consist_common::events::EventPublisher;
use consist_common::{Error, Result};

use crate::adapter::{
    AdapterOptions, CudOutcome, CudResults, JsonEmployer, PodEmployee, ReconcileAdapter,
};
use crate::client::{ConsistKubeClient, EmployeeKey, EmployerKey};
use crate::cluster::{ClusterRoute, EmployeeRouting, CLUSTER_SEPARATOR};
use crate::controller::{reconcile, Context};
use crate::naming::POD_SERVICE_AVAILABLE_LABEL;
use crate::service::{pod_employee_statuses, service_selects_pod};

pub const NAMESPACE: &str = "default";
pub const EMPLOYER: &str = "web";
pub const LB: &str = "lb";

fn bump(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

fn check_version(meta: &ObjectMeta, expected: &Option<String>) -> Result<()> {
    match expected {
        Some(rv) if meta.resource_version.as_ref() != Some(rv) => {
            Err(Error::internal_with_context("fake", "resourceVersion conflict"))
        }
        _ => Ok(()),
    }
}

fn released(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some() && meta.finalizers.as_ref().map_or(true, Vec::is_empty)
}

/// Objects on the hub and member clusters
#[derive(Default)]
pub struct FakeKube {
    employers: Mutex<HashMap<EmployerKey, Service>>,
    pods: Mutex<HashMap<EmployeeKey, Pod>>,
    failing_pod_annotations: Mutex<BTreeSet<String>>,
    failing_pod_finalizers: Mutex<BTreeSet<String>>,
}

impl FakeKube {
    pub fn employer_key() -> EmployerKey {
        EmployerKey {
            kind: "Service".into(),
            namespace: NAMESPACE.into(),
            name: EMPLOYER.into(),
        }
    }

    pub fn pod_key(route: ClusterRoute, name: &str) -> EmployeeKey {
        EmployeeKey {
            route,
            namespace: NAMESPACE.into(),
            name: name.into(),
        }
    }

    /// Create the `web` Service selecting `app=web`
    pub fn add_employer(&self) {
        let service = Service {
            metadata: ObjectMeta {
                name: Some(EMPLOYER.into()),
                namespace: Some(NAMESPACE.into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.employers
            .lock()
            .expect("lock")
            .insert(Self::employer_key(), service);
    }

    pub fn employer(&self) -> Option<Service> {
        self.employers
            .lock()
            .expect("lock")
            .get(&Self::employer_key())
            .cloned()
    }

    pub fn employer_annotation(&self, annotation: &str) -> Option<String> {
        self.employer()
            .and_then(|svc| svc.annotations().get(annotation).cloned())
    }

    pub fn delete_employer(&self) {
        let mut employers = self.employers.lock().expect("lock");
        let key = Self::employer_key();
        let release = match employers.get_mut(&key) {
            Some(svc) => {
                svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                released(&svc.metadata)
            }
            None => false,
        };
        if release {
            employers.remove(&key);
        }
    }

    /// Add a selected, lifecycle-ready pod with IP-like status
    pub fn add_pod(&self, route: ClusterRoute, name: &str) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(NAMESPACE.into()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "web".to_string()),
                    (POD_SERVICE_AVAILABLE_LABEL.to_string(), "true".to_string()),
                ])),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.pods
            .lock()
            .expect("lock")
            .insert(Self::pod_key(route, name), pod);
    }

    pub fn pod(&self, route: ClusterRoute, name: &str) -> Option<Pod> {
        self.pods
            .lock()
            .expect("lock")
            .get(&Self::pod_key(route, name))
            .cloned()
    }

    pub fn update_pod_labels(
        &self,
        route: ClusterRoute,
        name: &str,
        f: impl FnOnce(&mut BTreeMap<String, String>),
    ) {
        let mut pods = self.pods.lock().expect("lock");
        if let Some(pod) = pods.get_mut(&Self::pod_key(route, name)) {
            f(pod.metadata.labels.get_or_insert_with(BTreeMap::new));
            bump(&mut pod.metadata);
        }
    }

    pub fn fail_pod_annotations(&self, name: &str) {
        self.failing_pod_annotations
            .lock()
            .expect("lock")
            .insert(name.to_string());
    }

    pub fn fail_pod_finalizers(&self, name: &str) {
        self.failing_pod_finalizers
            .lock()
            .expect("lock")
            .insert(name.to_string());
    }

    /// Pods in the namespace with their cluster
    pub fn pods(&self) -> Vec<(ClusterRoute, Pod)> {
        self.pods
            .lock()
            .expect("lock")
            .iter()
            .map(|(key, pod)| (key.route.clone(), pod.clone()))
            .collect()
    }
}

#[async_trait]
impl ConsistKubeClient for FakeKube {
    async fn get_employer_meta(&self, key: &EmployerKey) -> Result<Option<ObjectMeta>> {
        Ok(self
            .employers
            .lock()
            .expect("lock")
            .get(key)
            .map(|svc| svc.metadata.clone()))
    }

    async fn replace_employer_finalizers(
        &self,
        key: &EmployerKey,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        let mut employers = self.employers.lock().expect("lock");
        let Some(svc) = employers.get_mut(key) else {
            return Err(Error::internal_with_context("fake", "employer not found"));
        };
        check_version(&svc.metadata, &resource_version)?;
        svc.metadata.finalizers = Some(finalizers);
        bump(&mut svc.metadata);
        if released(&svc.metadata) {
            employers.remove(key);
        }
        Ok(())
    }

    async fn patch_employer_annotation(
        &self,
        key: &EmployerKey,
        annotation: &str,
        value: &str,
    ) -> Result<()> {
        let mut employers = self.employers.lock().expect("lock");
        let Some(svc) = employers.get_mut(key) else {
            return Err(Error::internal_with_context("fake", "employer not found"));
        };
        svc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(annotation.to_string(), value.to_string());
        bump(&mut svc.metadata);
        Ok(())
    }

    async fn get_employee(&self, key: &EmployeeKey) -> Result<Option<Pod>> {
        Ok(self.pods.lock().expect("lock").get(key).cloned())
    }

    async fn replace_employee_finalizers(
        &self,
        key: &EmployeeKey,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<()> {
        if self.failing_pod_finalizers.lock().expect("lock").contains(&key.name) {
            return Err(Error::internal_with_context("fake", "pod finalizer patch rejected"));
        }
        let mut pods = self.pods.lock().expect("lock");
        let Some(pod) = pods.get_mut(key) else {
            return Err(Error::internal_with_context("fake", "pod not found"));
        };
        check_version(&pod.metadata, &resource_version)?;
        pod.metadata.finalizers = Some(finalizers);
        bump(&mut pod.metadata);
        if released(&pod.metadata) {
            pods.remove(key);
        }
        Ok(())
    }

    async fn patch_employee_annotation(
        &self,
        key: &EmployeeKey,
        annotation: &str,
        value: &str,
    ) -> Result<()> {
        if self.failing_pod_annotations.lock().expect("lock").contains(&key.name) {
            return Err(Error::internal_with_context("fake", "pod annotation patch rejected"));
        }
        let mut pods = self.pods.lock().expect("lock");
        let Some(pod) = pods.get_mut(key) else {
            return Err(Error::internal_with_context("fake", "pod not found"));
        };
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(annotation.to_string(), value.to_string());
        bump(&mut pod.metadata);
        Ok(())
    }
}

/// Events published on the employer, in order
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(bool, String)>>,
}

impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("lock")
            .iter()
            .filter(|(warning, _)| *warning)
            .map(|(_, reason)| reason.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("lock").clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .expect("lock")
            .push((matches!(type_, EventType::Warning), reason.to_string()));
    }
}

/// Adapter registering the pods a Service selects in an in-memory backend
pub struct TestAdapter {
    kube: Arc<FakeKube>,
    options: AdapterOptions,
    employers: Mutex<BTreeMap<String, JsonEmployer>>,
    employees: Mutex<BTreeMap<String, PodEmployee>>,
    failing_deletes: Mutex<BTreeSet<String>>,
    backend_down: Mutex<bool>,
    recorded_errors: Mutex<Vec<String>>,
    recorded_statuses: Mutex<usize>,
}

impl TestAdapter {
    pub fn new(kube: Arc<FakeKube>, options: AdapterOptions) -> Self {
        Self {
            kube,
            options,
            employers: Mutex::default(),
            employees: Mutex::default(),
            failing_deletes: Mutex::default(),
            backend_down: Mutex::default(),
            recorded_errors: Mutex::default(),
            recorded_statuses: Mutex::default(),
        }
    }

    pub fn registered(&self) -> Vec<String> {
        self.employees.lock().expect("lock").keys().cloned().collect()
    }

    pub fn has_employer_state(&self) -> bool {
        !self.employers.lock().expect("lock").is_empty()
    }

    pub fn forget_employee(&self, id: &str) {
        self.employees.lock().expect("lock").remove(id);
    }

    pub fn fail_delete(&self, id: &str) {
        self.failing_deletes
            .lock()
            .expect("lock")
            .insert(id.to_string());
    }

    /// Reject every registration until healed
    pub fn fail_registrations(&self) {
        *self.backend_down.lock().expect("lock") = true;
    }

    pub fn heal(&self) {
        self.failing_deletes.lock().expect("lock").clear();
        *self.backend_down.lock().expect("lock") = false;
    }

    pub fn recorded_errors(&self) -> Vec<String> {
        self.recorded_errors.lock().expect("lock").clone()
    }

    pub fn recorded_statuses(&self) -> usize {
        *self.recorded_statuses.lock().expect("lock")
    }

    fn employee_name(&self, route: &ClusterRoute, pod: &Pod) -> String {
        match route {
            ClusterRoute::Member(cluster) if self.options.employee_routing == EmployeeRouting::Local => {
                format!("{}{}{}", pod.name_any(), CLUSTER_SEPARATOR, cluster)
            }
            _ => pod.name_any(),
        }
    }

    fn selected(&self, employer: &Service) -> Vec<(String, Pod)> {
        self.kube
            .pods()
            .into_iter()
            .filter(|(_, pod)| service_selects_pod(employer, pod))
            .map(|(route, pod)| (self.employee_name(&route, &pod), pod))
            .collect()
    }

    fn split<T: Clone>(&self, items: Vec<T>, id: impl Fn(&T) -> String) -> CudOutcome<T> {
        let failing = self.failing_deletes.lock().expect("lock");
        let (failed, succeeded): (Vec<T>, Vec<T>) =
            items.into_iter().partition(|item| failing.contains(&id(item)));
        CudOutcome { succeeded, failed }
    }
}

#[async_trait]
impl ReconcileAdapter for TestAdapter {
    type Employer = Service;
    type EmployerState = JsonEmployer;
    type EmployeeState = PodEmployee;

    fn controller_name(&self) -> &str {
        "test-controller"
    }

    fn options(&self) -> AdapterOptions {
        self.options.clone()
    }

    fn employer_selects(&self, employer: &Service, pod: &Pod) -> bool {
        service_selects_pod(employer, pod)
    }

    async fn selected_employee_names(&self, employer: &Service) -> Result<Vec<String>> {
        Ok(self
            .selected(employer)
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn expected_employers(&self, employer: &Service) -> Result<Vec<JsonEmployer>> {
        if employer.metadata.deletion_timestamp.is_some() {
            return Ok(Vec::new());
        }
        Ok(vec![JsonEmployer {
            id: LB.into(),
            status: serde_json::json!({"listener": 80}),
        }])
    }

    async fn current_employers(&self, _employer: &Service) -> Result<Vec<JsonEmployer>> {
        Ok(self.employers.lock().expect("lock").values().cloned().collect())
    }

    async fn create_employers(
        &self,
        _employer: &Service,
        to_create: Vec<JsonEmployer>,
    ) -> Result<CudOutcome<JsonEmployer>> {
        let mut employers = self.employers.lock().expect("lock");
        for item in &to_create {
            employers.insert(item.id.clone(), item.clone());
        }
        Ok(CudOutcome::all_succeeded(to_create))
    }

    async fn update_employers(
        &self,
        employer: &Service,
        to_update: Vec<JsonEmployer>,
    ) -> Result<CudOutcome<JsonEmployer>> {
        self.create_employers(employer, to_update).await
    }

    async fn delete_employers(
        &self,
        _employer: &Service,
        to_delete: Vec<JsonEmployer>,
    ) -> Result<CudOutcome<JsonEmployer>> {
        let outcome = self.split(to_delete, |item| item.id.clone());
        let mut employers = self.employers.lock().expect("lock");
        for item in &outcome.succeeded {
            employers.remove(&item.id);
        }
        Ok(outcome)
    }

    async fn expected_employees(&self, employer: &Service) -> Result<Vec<PodEmployee>> {
        if employer.metadata.deletion_timestamp.is_some() {
            return Ok(Vec::new());
        }
        Ok(self
            .selected(employer)
            .into_iter()
            .map(|(name, pod)| PodEmployee {
                id: name.clone(),
                name,
                statuses: pod_employee_statuses(&pod),
            })
            .collect())
    }

    async fn current_employees(&self, _employer: &Service) -> Result<Vec<PodEmployee>> {
        Ok(self.employees.lock().expect("lock").values().cloned().collect())
    }

    async fn create_employees(
        &self,
        _employer: &Service,
        to_create: Vec<PodEmployee>,
    ) -> Result<CudOutcome<PodEmployee>> {
        if *self.backend_down.lock().expect("lock") {
            return Ok(CudOutcome::all_failed(to_create));
        }
        let mut employees = self.employees.lock().expect("lock");
        for item in &to_create {
            employees.insert(item.id.clone(), item.clone());
        }
        Ok(CudOutcome::all_succeeded(to_create))
    }

    async fn update_employees(
        &self,
        employer: &Service,
        to_update: Vec<PodEmployee>,
    ) -> Result<CudOutcome<PodEmployee>> {
        self.create_employees(employer, to_update).await
    }

    async fn delete_employees(
        &self,
        _employer: &Service,
        to_delete: Vec<PodEmployee>,
    ) -> Result<CudOutcome<PodEmployee>> {
        let outcome = self.split(to_delete, |item| item.id.clone());
        let mut employees = self.employees.lock().expect("lock");
        for item in &outcome.succeeded {
            employees.remove(&item.id);
        }
        Ok(outcome)
    }

    async fn record_statuses(
        &self,
        _employer: &Service,
        _employers: &CudResults<JsonEmployer>,
        _employees: &CudResults<PodEmployee>,
    ) -> Result<()> {
        *self.recorded_statuses.lock().expect("lock") += 1;
        Ok(())
    }

    async fn record_error_conditions(&self, _employer: &Service, error: &Error) -> Result<()> {
        self.recorded_errors
            .lock()
            .expect("lock")
            .push(error.to_string());
        Ok(())
    }
}

/// A fake cluster, backend and event sink wired into a controller context
pub struct Harness {
    pub kube: Arc<FakeKube>,
    pub adapter: Arc<TestAdapter>,
    pub events: Arc<RecordingEvents>,
    pub ctx: Arc<Context<TestAdapter>>,
}

impl Harness {
    pub fn new(options: AdapterOptions) -> Self {
        let kube = Arc::new(FakeKube::default());
        let adapter = Arc::new(TestAdapter::new(kube.clone(), options));
        let events = Arc::new(RecordingEvents::default());
        let ctx = Context::builder(adapter.clone())
            .kube_client(kube.clone())
            .event_publisher(events.clone())
            .build()
            .expect("context");
        Self {
            kube,
            adapter,
            events,
            ctx: Arc::new(ctx),
        }
    }

    /// Employer `web` with pods `p1` and `p2` on the hub
    pub fn with_two_pods(options: AdapterOptions) -> Self {
        let harness = Self::new(options);
        harness.kube.add_employer();
        harness.kube.add_pod(ClusterRoute::Hub, "p1");
        harness.kube.add_pod(ClusterRoute::Hub, "p2");
        harness
    }

    /// Reconcile the current employer once; `None` once it is gone
    pub async fn pass(&self) -> Option<Result<Action>> {
        let employer = self.kube.employer()?;
        Some(reconcile(Arc::new(employer), self.ctx.clone()).await)
    }

    /// Run `passes` passes, stopping early once the employer is gone
    pub async fn run_passes(&self, passes: usize) {
        for _ in 0..passes {
            if self.pass().await.is_none() {
                return;
            }
        }
    }
}
