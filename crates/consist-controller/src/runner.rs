//! Controller runner - wires an adapter into a kube-runtime controller
//!
//! Employers are watched on the hub, optionally narrowed by the adapter's
//! label selector. When employees are pods, pod events on the hub requeue
//! every cached employer in the pod's namespace that selects it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{self, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use crate::adapter::{EmployeeKind, ReconcileAdapter};
use crate::cluster::ClusterClients;
use consist_common::backoff::KeyedBackoff;

use crate::controller::{backoff_key, error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config(label_selector: Option<&str>) -> WatcherConfig {
    let config = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    match label_selector {
        Some(selector) => config.labels(selector),
        None => config,
    }
}

/// Build the controller future for one adapter
pub fn build_controller<A: ReconcileAdapter>(
    ctx: Arc<Context<A>>,
    clusters: &ClusterClients,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let name = ctx.adapter.controller_name().to_string();
    let options = &ctx.options;
    let employers: Api<A::Employer> = Api::all(clusters.hub().clone());

    info!(
        controller = %name,
        concurrency = options.max_concurrent_reconciles,
        selector = ?options.employer_label_selector,
        routing = ?options.employee_routing,
        "starting consist controller"
    );

    let mut controller = Controller::new(
        employers,
        watcher_config(options.employer_label_selector.as_deref()),
    )
    .with_config(ControllerConfig::default().concurrency(options.max_concurrent_reconciles));

    if options.employee_kind == EmployeeKind::Pod {
        let store = controller.store();
        let adapter = ctx.adapter.clone();
        let pods: Api<Pod> = Api::all(clusters.hub().clone());
        controller = controller.watches(pods, watcher_config(None), move |pod| {
            let namespace = pod.namespace();
            let affected: Vec<ObjectRef<A::Employer>> = store
                .state()
                .iter()
                .filter(|employer| employer.namespace() == namespace)
                .filter(|employer| adapter.employer_selects(employer, &pod))
                .map(|employer| ObjectRef::from_obj(&**employer))
                .collect();
            if !affected.is_empty() {
                debug!(
                    pod = %pod.name_any(),
                    affected_count = affected.len(),
                    "Triggering re-reconciliation of selecting employers"
                );
            }
            affected
        });
    }

    let backoff_ctx = ctx.clone();
    let log = log_reconcile_result(name);
    Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile::<A>, error_policy::<A>, ctx)
            .for_each(move |result| {
                forget_deleted(&backoff_ctx.backoff, &result);
                log(result)
            }),
    )
}

/// Drop the backoff of an employer deleted while it was failing
fn forget_deleted<T, E1: 'static, E2: 'static>(
    backoff: &KeyedBackoff<String>,
    result: &Result<T, controller::Error<E1, E2>>,
) {
    if let Err(controller::Error::ObjectNotFound(employer)) = result {
        backoff.reset(&backoff_key(employer.namespace.as_deref(), &employer.name));
    }
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: String,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
