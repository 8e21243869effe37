//! The adapter contract.
//!
//! An adapter connects the framework to one backend (a load balancer, a DNS
//! zone, a service mesh). It says which employees an employer selects,
//! reports expected and current state at employer and employee level, and
//! performs the create/update/delete calls against the backend. Everything
//! else (diffing, finalizers, sequencing) is done by the framework.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use consist_common::backoff::BackoffConfig;
use consist_common::{Error, Result};

use crate::cluster::EmployeeRouting;

/// Default bound on concurrently reconciled employers
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 5;

/// An item the diff engine can classify: keyed by id, compared by the adapter
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Backend status carried by the entity
    type Status: Clone + fmt::Debug + Send + Sync;

    /// Backend-defined identity
    fn id(&self) -> &str;

    /// Backend status
    fn status(&self) -> &Self::Status;

    /// Whether `self` (expected) and `other` (current) are in sync.
    ///
    /// A comparison error aborts the whole diff.
    fn equals(&self, other: &Self) -> Result<bool>;
}

/// Employer-level backend state (e.g. the load balancer listener itself)
pub trait EmployerEntity: Entity {}

/// Employee-level backend state (e.g. one backend server)
pub trait EmployeeEntity: Entity {
    /// Name of the employee object, `name#cluster` under local routing
    fn name(&self) -> &str;

    /// Pod lifecycle readiness, `None` when the employee does not report it.
    ///
    /// Employees returning `None` are never given or stripped of a lifecycle
    /// finalizer based on readiness.
    fn lifecycle_ready(&self) -> Option<bool> {
        None
    }
}

/// Standard status of a pod employee
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodEmployeeStatuses {
    /// Pod IPv4 address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    /// Pod IPv6 address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv6: String,
    /// Whether the pod may receive work from its employers
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lifecycle_ready: bool,
    /// Backend-specific status
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra_status: serde_json::Value,
}

/// A pod employee with the standard status
#[derive(Clone, Debug, PartialEq)]
pub struct PodEmployee {
    /// Backend id (often the pod IP)
    pub id: String,
    /// Pod name
    pub name: String,
    /// Status
    pub statuses: PodEmployeeStatuses,
}

impl Entity for PodEmployee {
    type Status = PodEmployeeStatuses;

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> &Self::Status {
        &self.statuses
    }

    fn equals(&self, other: &Self) -> Result<bool> {
        Ok(self.statuses == other.statuses)
    }
}

impl EmployeeEntity for PodEmployee {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle_ready(&self) -> Option<bool> {
        Some(self.statuses.lifecycle_ready)
    }
}

/// An employer-level entity carrying opaque JSON status
#[derive(Clone, Debug, PartialEq)]
pub struct JsonEmployer {
    /// Backend id
    pub id: String,
    /// Status
    pub status: serde_json::Value,
}

impl Entity for JsonEmployer {
    type Status = serde_json::Value;

    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> &Self::Status {
        &self.status
    }

    fn equals(&self, other: &Self) -> Result<bool> {
        Ok(self.status == other.status)
    }
}

impl EmployerEntity for JsonEmployer {}

/// Split of one create/update/delete call into succeeded and failed items
#[derive(Clone, Debug)]
pub struct CudOutcome<T> {
    /// Items the backend accepted
    pub succeeded: Vec<T>,
    /// Items the backend rejected
    pub failed: Vec<T>,
}

impl<T> CudOutcome<T> {
    /// Every item succeeded
    pub fn all_succeeded(items: Vec<T>) -> Self {
        Self {
            succeeded: items,
            failed: Vec::new(),
        }
    }

    /// Every item failed
    pub fn all_failed(items: Vec<T>) -> Self {
        Self {
            succeeded: Vec::new(),
            failed: items,
        }
    }
}

impl<T> Default for CudOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Outcome of syncing one level (employer or employees) in one pass
#[derive(Clone, Debug)]
pub struct CudResults<T> {
    /// Created successfully
    pub succ_created: Vec<T>,
    /// Creation failed
    pub fail_created: Vec<T>,
    /// Updated successfully
    pub succ_updated: Vec<T>,
    /// Update failed
    pub fail_updated: Vec<T>,
    /// Deleted successfully
    pub succ_deleted: Vec<T>,
    /// Deletion failed
    pub fail_deleted: Vec<T>,
    /// Already in sync
    pub unchanged: Vec<T>,
}

impl<T> Default for CudResults<T> {
    fn default() -> Self {
        Self {
            succ_created: Vec::new(),
            fail_created: Vec::new(),
            succ_updated: Vec::new(),
            fail_updated: Vec::new(),
            succ_deleted: Vec::new(),
            fail_deleted: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<T> CudResults<T> {
    /// Whether any create, update or delete failed
    pub fn failures_exist(&self) -> bool {
        !self.fail_created.is_empty()
            || !self.fail_updated.is_empty()
            || !self.fail_deleted.is_empty()
    }
}

/// What kind of object the employees are
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmployeeKind {
    /// Pods: lifecycle finalizers and the expected-finalizer handshake apply
    #[default]
    Pod,
    /// Anything else: only the backend sync runs
    Other,
}

/// Capabilities and tuning of an adapter.
///
/// | field | default |
/// |---|---|
/// | `max_concurrent_reconciles` | 5 |
/// | `backoff` | 5ms doubling to 1000s |
/// | `employee_kind` | `Pod` |
/// | `employee_routing` | `SingleCluster` |
/// | `follow_lifecycle` | `true` |
/// | `record_lifecycle_finalizers` | `false` |
/// | `record_expected_finalizers` | `false` |
/// | `employee_sync_requeue` | none (failures surface as errors) |
/// | `employer_label_selector` | none (all employers) |
#[derive(Clone, Debug)]
pub struct AdapterOptions {
    /// Maximum employers reconciled at once
    pub max_concurrent_reconciles: u16,
    /// Per-employer backoff after a failed pass
    pub backoff: BackoffConfig,
    /// Kind of the employees
    pub employee_kind: EmployeeKind,
    /// Multi-cluster routing of employees
    pub employee_routing: EmployeeRouting,
    /// Whether employees are guarded with lifecycle finalizers and expected tokens
    pub follow_lifecycle: bool,
    /// Persist which employees hold the lifecycle finalizer on the employer
    pub record_lifecycle_finalizers: bool,
    /// Persist which employees hold the expected token on the employer
    pub record_expected_finalizers: bool,
    /// Requeue delay when some CUD items failed
    pub employee_sync_requeue: Option<Duration>,
    /// Label selector restricting which employers are watched
    pub employer_label_selector: Option<String>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            backoff: BackoffConfig::default(),
            employee_kind: EmployeeKind::Pod,
            employee_routing: EmployeeRouting::SingleCluster,
            follow_lifecycle: true,
            record_lifecycle_finalizers: false,
            record_expected_finalizers: false,
            employee_sync_requeue: None,
            employer_label_selector: None,
        }
    }
}

impl AdapterOptions {
    /// Lifecycle finalizers and expected tokens are managed on employees
    pub fn manages_pod_lifecycle(&self) -> bool {
        self.employee_kind == EmployeeKind::Pod && self.follow_lifecycle
    }

    /// Lifecycle finalizer holders are persisted on the employer
    pub fn records_lifecycle_finalizers(&self) -> bool {
        self.manages_pod_lifecycle() && self.record_lifecycle_finalizers
    }
}

/// Backend-specific half of a consist controller.
///
/// All `Vec` results are unordered. Create/update/delete report per-item
/// outcomes through [`CudOutcome`]; an `Err` means the call as a whole could
/// not be made and fails the pass.
#[async_trait]
pub trait ReconcileAdapter: Send + Sync + 'static {
    /// The employer resource type
    type Employer: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static;
    /// Employer-level backend state
    type EmployerState: EmployerEntity;
    /// Employee-level backend state
    type EmployeeState: EmployeeEntity;

    /// Name used for the controller, Events and logs
    fn controller_name(&self) -> &str;

    /// Capabilities and tuning
    fn options(&self) -> AdapterOptions {
        AdapterOptions::default()
    }

    /// Whether `employer` selects `pod`; used to requeue employers on pod events
    fn employer_selects(&self, employer: &Self::Employer, pod: &Pod) -> bool;

    /// Names of the employees the employer currently selects
    async fn selected_employee_names(&self, employer: &Self::Employer) -> Result<Vec<String>>;

    /// Employer-level state the backend should have
    async fn expected_employers(&self, employer: &Self::Employer)
        -> Result<Vec<Self::EmployerState>>;

    /// Employer-level state the backend has
    async fn current_employers(&self, employer: &Self::Employer)
        -> Result<Vec<Self::EmployerState>>;

    /// Create employer-level state
    async fn create_employers(
        &self,
        employer: &Self::Employer,
        to_create: Vec<Self::EmployerState>,
    ) -> Result<CudOutcome<Self::EmployerState>>;

    /// Update employer-level state
    async fn update_employers(
        &self,
        employer: &Self::Employer,
        to_update: Vec<Self::EmployerState>,
    ) -> Result<CudOutcome<Self::EmployerState>>;

    /// Delete employer-level state
    async fn delete_employers(
        &self,
        employer: &Self::Employer,
        to_delete: Vec<Self::EmployerState>,
    ) -> Result<CudOutcome<Self::EmployerState>>;

    /// Employees the backend should have
    async fn expected_employees(&self, employer: &Self::Employer)
        -> Result<Vec<Self::EmployeeState>>;

    /// Employees the backend has
    async fn current_employees(&self, employer: &Self::Employer)
        -> Result<Vec<Self::EmployeeState>>;

    /// Register employees with the backend
    async fn create_employees(
        &self,
        employer: &Self::Employer,
        to_create: Vec<Self::EmployeeState>,
    ) -> Result<CudOutcome<Self::EmployeeState>>;

    /// Update employees in the backend
    async fn update_employees(
        &self,
        employer: &Self::Employer,
        to_update: Vec<Self::EmployeeState>,
    ) -> Result<CudOutcome<Self::EmployeeState>>;

    /// Deregister employees from the backend
    async fn delete_employees(
        &self,
        employer: &Self::Employer,
        to_delete: Vec<Self::EmployeeState>,
    ) -> Result<CudOutcome<Self::EmployeeState>>;

    /// Called after a pass in which every CUD item succeeded
    async fn record_statuses(
        &self,
        _employer: &Self::Employer,
        _employers: &CudResults<Self::EmployerState>,
        _employees: &CudResults<Self::EmployeeState>,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when a pass fails with an error
    async fn record_error_conditions(&self, _employer: &Self::Employer, _error: &Error) -> Result<()> {
        Ok(())
    }
}
