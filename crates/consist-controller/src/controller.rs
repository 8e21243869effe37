//! Reconcile orchestrator.
//!
//! One pass per employer, strictly in this order:
//!
//! 1. ensure the clean finalizer (a fresh finalizer ends the pass)
//! 2. expected-finalizer handshake
//! 3. employer-level diff and sync
//! 4. employee-level diff and sync, then lifecycle finalizers
//! 5. drop the clean finalizer once a deleting employer is fully unwound
//! 6. requeue or fail on per-item CUD failures
//! 7. record statuses
//!
//! Any error in a phase ends the pass: it is reported as a Warning event on
//! the employer, handed to the adapter's error hook and returned so the
//! runtime backs off.

use std::future::Future;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use consist_common::backoff::KeyedBackoff;
use consist_common::events::{actions, reasons, EventPublisher, KubeEventPublisher, NoopEventPublisher};
use consist_common::{Error, Result};

use crate::adapter::{AdapterOptions, CudResults, Entity, ReconcileAdapter};
use crate::client::{ConsistKubeClient, KubeConsistClient};
use crate::cluster::ClusterClients;
use crate::diff::diff;
use crate::finalizer::{EmployerView, FinalizerManager, LifecycleChanges};
use crate::naming::{EmployeeNameSet, LIFECYCLE_FINALIZER_RECORDED_ANNOTATION};

/// Shared state of one consist controller
pub struct Context<A: ReconcileAdapter> {
    /// Backend adapter
    pub adapter: Arc<A>,
    /// Kubernetes access (trait object for testability)
    pub kube: Arc<dyn ConsistKubeClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Adapter options, read once at construction
    pub options: AdapterOptions,
    /// Per-employer error backoff
    pub backoff: KeyedBackoff<String>,
}

impl<A: ReconcileAdapter> Context<A> {
    /// Create a builder for constructing a Context
    pub fn builder(adapter: Arc<A>) -> ContextBuilder<A> {
        ContextBuilder::new(adapter)
    }

    /// Context talking to real clusters
    ///
    /// Equivalent to `Context::builder(adapter).clusters(clusters).build()`.
    pub fn from_client(adapter: Arc<A>, clusters: ClusterClients) -> Result<Self> {
        Self::builder(adapter).clusters(clusters).build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder<A: ReconcileAdapter> {
    adapter: Arc<A>,
    clusters: Option<ClusterClients>,
    kube: Option<Arc<dyn ConsistKubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl<A: ReconcileAdapter> ContextBuilder<A> {
    fn new(adapter: Arc<A>) -> Self {
        Self {
            adapter,
            clusters: None,
            kube: None,
            events: None,
        }
    }

    /// Cluster clients used for the default kube client and event recorder
    pub fn clusters(mut self, clusters: ClusterClients) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn ConsistKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher (primarily for testing)
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    ///
    /// Needs either cluster clients or an explicit kube client. Without
    /// cluster clients and an explicit publisher, events are dropped.
    pub fn build(self) -> Result<Context<A>> {
        let options = self.adapter.options();
        let kube: Arc<dyn ConsistKubeClient> = match (self.kube, &self.clusters) {
            (Some(kube), _) => kube,
            (None, Some(clusters)) => Arc::new(KubeConsistClient::<A::Employer>::new(clusters.clone())),
            (None, None) => {
                return Err(Error::internal_with_context(
                    "context",
                    "either cluster clients or a kube client is required",
                ))
            }
        };
        let events: Arc<dyn EventPublisher> = match (self.events, &self.clusters) {
            (Some(events), _) => events,
            (None, Some(clusters)) => Arc::new(KubeEventPublisher::new(
                clusters.hub().clone(),
                self.adapter.controller_name(),
            )),
            (None, None) => Arc::new(NoopEventPublisher),
        };
        Ok(Context {
            backoff: KeyedBackoff::new(options.backoff.clone()),
            adapter: self.adapter,
            kube,
            events,
            options,
        })
    }
}

/// Result of syncing one level in one pass
#[derive(Clone, Debug)]
pub struct SyncOutcome<T> {
    /// Nothing is left in the backend at this level
    pub clean: bool,
    /// Per-item outcome
    pub results: CudResults<T>,
}

impl<T> SyncOutcome<T> {
    fn new(nothing_pending: bool, results: CudResults<T>) -> Self {
        Self {
            clean: nothing_pending && results.fail_deleted.is_empty(),
            results,
        }
    }
}

fn ids<T: Entity>(items: &[T]) -> Vec<&str> {
    let mut ids: Vec<&str> = items.iter().map(Entity::id).collect();
    ids.sort_unstable();
    ids
}

/// Diff employer-level state and push the difference to the backend
pub async fn sync_employer<A: ReconcileAdapter>(
    adapter: &A,
    employer: &A::Employer,
    expected: Vec<A::EmployerState>,
    current: Vec<A::EmployerState>,
) -> Result<SyncOutcome<A::EmployerState>> {
    let partition = diff(expected, current)?;
    debug!(
        to_create = ?ids(&partition.to_create),
        to_update = ?ids(&partition.to_update),
        to_delete = ?ids(&partition.to_delete),
        unchanged = ?ids(&partition.unchanged),
        "employer diff"
    );
    let nothing_pending = partition.to_create.is_empty()
        && partition.to_update.is_empty()
        && partition.unchanged.is_empty();

    let created = adapter.create_employers(employer, partition.to_create).await?;
    let updated = adapter.update_employers(employer, partition.to_update).await?;
    let deleted = adapter.delete_employers(employer, partition.to_delete).await?;

    Ok(SyncOutcome::new(
        nothing_pending,
        CudResults {
            succ_created: created.succeeded,
            fail_created: created.failed,
            succ_updated: updated.succeeded,
            fail_updated: updated.failed,
            succ_deleted: deleted.succeeded,
            fail_deleted: deleted.failed,
            unchanged: partition.unchanged,
        },
    ))
}

/// Reconcile one employer
#[instrument(
    skip(employer, ctx),
    fields(
        controller = %ctx.adapter.controller_name(),
        employer = %employer_name(employer.as_ref()),
    )
)]
pub async fn reconcile<A: ReconcileAdapter>(
    employer: Arc<A::Employer>,
    ctx: Arc<Context<A>>,
) -> Result<Action> {
    let pass = Pass::new(&ctx, employer.as_ref());
    let action = pass.run().await?;
    ctx.backoff.reset(&employer_name(employer.as_ref()));
    Ok(action)
}

/// Requeue policy after a failed pass
pub fn error_policy<A: ReconcileAdapter>(
    employer: Arc<A::Employer>,
    error: &Error,
    ctx: Arc<Context<A>>,
) -> Action {
    let key = employer_name(employer.as_ref());
    if error.is_not_found() {
        debug!(employer = %key, "employer gone, dropping its backoff");
        ctx.backoff.reset(&key);
        return Action::await_change();
    }
    let delay = if error.is_retryable() {
        ctx.backoff.next_delay(key.clone())
    } else {
        ctx.backoff.max_delay()
    };
    error!(
        error = %error,
        employer = %key,
        retryable = error.is_retryable(),
        delay_ms = delay.as_millis() as u64,
        "employer reconciliation failed"
    );
    Action::requeue(delay)
}

fn employer_name<K: Resource>(employer: &K) -> String {
    backoff_key(employer.namespace().as_deref(), &employer.name_any())
}

/// Key an employer's error backoff is tracked under
pub fn backoff_key(namespace: Option<&str>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

/// One reconcile pass over one employer
struct Pass<'a, A: ReconcileAdapter> {
    ctx: &'a Context<A>,
    employer: &'a A::Employer,
    view: EmployerView,
    object_ref: ObjectReference,
    finalizers: FinalizerManager,
}

impl<'a, A: ReconcileAdapter> Pass<'a, A> {
    fn new(ctx: &'a Context<A>, employer: &'a A::Employer) -> Self {
        Self {
            ctx,
            employer,
            view: EmployerView::from_resource(employer),
            object_ref: employer.object_ref(&()),
            finalizers: FinalizerManager::new(ctx.kube.clone(), ctx.options.employee_routing),
        }
    }

    async fn run(&self) -> Result<Action> {
        let adapter = self.ctx.adapter.as_ref();
        let options = &self.ctx.options;

        let added = self
            .step(
                reasons::ENSURE_EMPLOYER_CLEAN_FINALIZER_FAILED,
                actions::FINALIZE,
                self.finalizers.ensure_clean_finalizer(&self.view),
            )
            .await?;
        if added {
            self.event(
                EventType::Normal,
                reasons::ENSURE_EMPLOYER_CLEAN_FINALIZER_SUCCEED,
                actions::FINALIZE,
                "add employer clean finalizer".to_string(),
            )
            .await;
            return Ok(Action::await_change());
        }

        let expected_clean = if options.manages_pod_lifecycle() {
            self.step(
                reasons::ENSURE_EXPECTED_FINALIZER_FAILED,
                actions::FINALIZE,
                self.ensure_expected_finalizers(),
            )
            .await?
        } else {
            true
        };

        let expected_employers = self
            .step(
                reasons::GET_EXPECT_EMPLOYER_FAILED,
                actions::SYNC,
                adapter.expected_employers(self.employer),
            )
            .await?;
        let current_employers = self
            .step(
                reasons::GET_CURRENT_EMPLOYER_FAILED,
                actions::SYNC,
                adapter.current_employers(self.employer),
            )
            .await?;
        let employer_sync = self
            .step(
                reasons::SYNC_EMPLOYER_FAILED,
                actions::SYNC,
                sync_employer(adapter, self.employer, expected_employers, current_employers),
            )
            .await?;

        let expected_employees = self
            .step(
                reasons::GET_EXPECT_EMPLOYEE_FAILED,
                actions::SYNC,
                adapter.expected_employees(self.employer),
            )
            .await?;
        let current_employees = self
            .step(
                reasons::GET_CURRENT_EMPLOYEE_FAILED,
                actions::SYNC,
                adapter.current_employees(self.employer),
            )
            .await?;
        let employee_sync = self
            .step(
                reasons::SYNC_EMPLOYEES_FAILED,
                actions::SYNC,
                self.sync_employees(expected_employees, current_employees),
            )
            .await?;

        debug!(
            deleting = self.view.deleting,
            employer_clean = employer_sync.clean,
            employees_clean = employee_sync.clean,
            expected_clean,
            "pass settled"
        );
        if self.view.deleting && employer_sync.clean && employee_sync.clean && expected_clean {
            let removed = self
                .step(
                    reasons::CLEAN_EMPLOYER_CLEAN_FINALIZER_FAILED,
                    actions::FINALIZE,
                    self.finalizers.remove_clean_finalizer(&self.view.key),
                )
                .await?;
            if removed {
                self.event(
                    EventType::Normal,
                    reasons::CLEAN_EMPLOYER_CLEAN_FINALIZER_SUCCEED,
                    actions::FINALIZE,
                    "clean employer clean finalizer".to_string(),
                )
                .await;
            }
        }

        if employer_sync.results.failures_exist() || employee_sync.results.failures_exist() {
            self.event(
                EventType::Normal,
                reasons::RECONCILE_FAILED,
                actions::RECONCILE,
                "employer or employees synced failed exist".to_string(),
            )
            .await;
            return match options.employee_sync_requeue {
                Some(delay) => {
                    warn!(delay_ms = delay.as_millis() as u64, "sync failures, requeueing");
                    Ok(Action::requeue(delay))
                }
                None => Err(Error::sync_failures(self.view.key.to_string())),
            };
        }

        self.step(
            reasons::RECORD_STATUSES_FAILED,
            actions::RECONCILE,
            adapter.record_statuses(self.employer, &employer_sync.results, &employee_sync.results),
        )
        .await?;

        self.event(
            EventType::Normal,
            reasons::RECONCILE_SUCCEED,
            actions::RECONCILE,
            String::new(),
        )
        .await;
        info!("employer reconciled");
        Ok(Action::await_change())
    }

    async fn ensure_expected_finalizers(&self) -> Result<bool> {
        let selected = self
            .ctx
            .adapter
            .selected_employee_names(self.employer)
            .await?;
        self.finalizers
            .ensure_expected_finalizers(
                &self.view,
                selected,
                self.ctx.options.record_expected_finalizers,
            )
            .await
    }

    async fn sync_employees(
        &self,
        expected: Vec<A::EmployeeState>,
        current: Vec<A::EmployeeState>,
    ) -> Result<SyncOutcome<A::EmployeeState>> {
        let adapter = self.ctx.adapter.as_ref();
        let options = &self.ctx.options;

        let partition = diff(expected, current)?;
        debug!(
            to_create = ?ids(&partition.to_create),
            to_update = ?ids(&partition.to_update),
            to_delete = ?ids(&partition.to_delete),
            unchanged = ?ids(&partition.unchanged),
            "employee diff"
        );
        let nothing_pending = partition.to_create.is_empty()
            && partition.to_update.is_empty()
            && partition.unchanged.is_empty();

        let created = adapter.create_employees(self.employer, partition.to_create).await?;
        let updated = adapter.update_employees(self.employer, partition.to_update).await?;
        let deleted = adapter.delete_employees(self.employer, partition.to_delete).await?;
        let results = CudResults {
            succ_created: created.succeeded,
            fail_created: created.failed,
            succ_updated: updated.succeeded,
            fail_updated: updated.failed,
            succ_deleted: deleted.succeeded,
            fail_deleted: deleted.failed,
            unchanged: partition.unchanged,
        };

        if options.manages_pod_lifecycle() {
            let mut changes = LifecycleChanges::from_results(&results, self.view.deleting);
            let record = options.records_lifecycle_finalizers();
            if record {
                let recorded = EmployeeNameSet::parse(
                    self.view.annotation(LIFECYCLE_FINALIZER_RECORDED_ANNOTATION),
                );
                if !recorded.is_empty() {
                    let selected: EmployeeNameSet = adapter
                        .selected_employee_names(self.employer)
                        .await?
                        .into_iter()
                        .collect();
                    changes.extend_delete(recorded.difference(&selected));
                }
            }
            self.finalizers
                .apply_lifecycle_finalizers(&self.view, &changes)
                .await?;
            if record {
                self.finalizers
                    .record_lifecycle_finalizers(&self.view, &changes)
                    .await?;
            }
        }

        Ok(SyncOutcome::new(nothing_pending, results))
    }

    /// Await a phase, reporting its failure on the employer
    async fn step<T>(
        &self,
        reason: &str,
        action: &str,
        phase: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match phase.await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(reason, action, e).await),
        }
    }

    async fn fail(&self, reason: &str, action: &str, error: Error) -> Error {
        error!(reason, error = %error, "reconcile phase failed");
        self.event(EventType::Warning, reason, action, error.to_string())
            .await;
        if let Err(e) = self
            .ctx
            .adapter
            .record_error_conditions(self.employer, &error)
            .await
        {
            warn!(error = %e, "recording error conditions failed");
        }
        error
    }

    async fn event(&self, type_: EventType, reason: &str, action: &str, note: String) {
        let note = (!note.is_empty()).then_some(note);
        self.ctx
            .events
            .publish(&self.object_ref, type_, reason, action, note)
            .await;
    }
}
