//! Finalizer lifecycle manager.
//!
//! Three idempotent protocols keep employers and employees from disappearing
//! while backend state still references them:
//!
//! - the employer **clean finalizer** ([`clean`]), held until a deleting
//!   employer has nothing left in the backend
//! - the employee **lifecycle finalizer** ([`lifecycle`]), held by every
//!   selected and ready employee
//! - the **expected-finalizer handshake** ([`expected`]), a token in the
//!   pod's availability annotation per selecting employer
//!
//! Every mutation is a read-modify-patch against the latest object. Nothing
//! is retried in-pass; a conflict fails the item and the next pass re-reads.

mod clean;
mod expected;
mod lifecycle;

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::{Resource, ResourceExt};

use consist_common::Result;

use crate::client::{ConsistKubeClient, EmployeeKey, EmployerKey};
use crate::cluster::EmployeeRouting;

pub use expected::ExpectedFinalizerOp;
pub use lifecycle::LifecycleChanges;

/// The parts of an employer the finalizer protocols read
#[derive(Clone, Debug, Default)]
pub struct EmployerView {
    /// Identity
    pub key: EmployerKey,
    /// Finalizers at the time the pass started
    pub finalizers: Vec<String>,
    /// Annotations at the time the pass started
    pub annotations: BTreeMap<String, String>,
    /// Whether a deletion timestamp is set
    pub deleting: bool,
    /// Resource version the view was taken at
    pub resource_version: Option<String>,
}

impl EmployerView {
    /// Snapshot an employer object
    pub fn from_resource<K: Resource<DynamicType = ()>>(employer: &K) -> Self {
        Self {
            key: EmployerKey {
                kind: K::kind(&()).to_string(),
                namespace: employer.namespace().unwrap_or_default(),
                name: employer.name_any(),
            },
            finalizers: employer.finalizers().to_vec(),
            annotations: employer.annotations().clone(),
            deleting: employer.meta().deletion_timestamp.is_some(),
            resource_version: employer.resource_version(),
        }
    }

    /// Value of an annotation, if set
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Whether the employer carries `finalizer`
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Runs the finalizer protocols for one employer pass
#[derive(Clone)]
pub struct FinalizerManager {
    kube: Arc<dyn ConsistKubeClient>,
    routing: EmployeeRouting,
}

impl FinalizerManager {
    /// Create a manager addressing employees with `routing`
    pub fn new(kube: Arc<dyn ConsistKubeClient>, routing: EmployeeRouting) -> Self {
        Self { kube, routing }
    }

    /// Address of an employee of `employer`, by its raw (possibly `name#cluster`) name
    pub fn employee_key(&self, employer: &EmployerView, raw_name: &str) -> Result<EmployeeKey> {
        let address = self.routing.resolve(raw_name)?;
        Ok(EmployeeKey {
            route: address.route,
            namespace: employer.key.namespace.clone(),
            name: address.name,
        })
    }
}
