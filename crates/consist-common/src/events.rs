//! Employer Events.
//!
//! Each reconcile phase reports its outcome on the employer object. Publishing
//! never fails a pass; a rejected Event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for employer Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Report `reason` for `action` on the employer behind `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the cluster's events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, instance taken from `POD_NAME`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "dropping employer event");
        }
    }
}

/// Discards every Event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, one per reconcile phase outcome
pub mod reasons {
    /// Adding the employer clean finalizer failed
    pub const ENSURE_EMPLOYER_CLEAN_FINALIZER_FAILED: &str = "EnsureEmployerCleanFinalizerFailed";
    /// The employer clean finalizer was added
    pub const ENSURE_EMPLOYER_CLEAN_FINALIZER_SUCCEED: &str = "EnsureEmployerCleanFinalizerSucceed";
    /// The expected-finalizer handshake failed
    pub const ENSURE_EXPECTED_FINALIZER_FAILED: &str = "EnsureExpectedFinalizerFailed";
    /// The adapter could not compute expected employer state
    pub const GET_EXPECT_EMPLOYER_FAILED: &str = "GetExpectEmployerFailed";
    /// The adapter could not read current employer state
    pub const GET_CURRENT_EMPLOYER_FAILED: &str = "GetCurrentEmployerFailed";
    /// Diffing or syncing employer state failed
    pub const SYNC_EMPLOYER_FAILED: &str = "SyncEmployerFailed";
    /// The adapter could not compute expected employees
    pub const GET_EXPECT_EMPLOYEE_FAILED: &str = "GetExpectEmployeeFailed";
    /// The adapter could not read current employees
    pub const GET_CURRENT_EMPLOYEE_FAILED: &str = "GetCurrentEmployeeFailed";
    /// Diffing or syncing employees failed
    pub const SYNC_EMPLOYEES_FAILED: &str = "SyncEmployeesFailed";
    /// Removing the employer clean finalizer failed
    pub const CLEAN_EMPLOYER_CLEAN_FINALIZER_FAILED: &str = "CleanEmployerCleanFinalizerFailed";
    /// The employer clean finalizer was removed
    pub const CLEAN_EMPLOYER_CLEAN_FINALIZER_SUCCEED: &str = "CleanEmployerCleanFinalizerSucceed";
    /// The adapter could not record statuses after a clean pass
    pub const RECORD_STATUSES_FAILED: &str = "RecordStatusesFailed";
    /// Some employer or employee CUD operations reported failures
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// The pass completed with every CUD operation succeeding
    pub const RECONCILE_SUCCEED: &str = "ReconcileSucceed";
}

/// Event actions
pub mod actions {
    /// The pass as a whole
    pub const RECONCILE: &str = "Reconcile";
    /// Clean, lifecycle or expected finalizer changes
    pub const FINALIZE: &str = "Finalize";
    /// Adapter reads and CUD calls
    pub const SYNC: &str = "Sync";
}
