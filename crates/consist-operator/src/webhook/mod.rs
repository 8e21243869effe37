//! Mutating admission webhook for employee pods
//!
//! A pod created into the selection of an employer must carry that
//! employer's expected-finalizer token from birth, so the pod lifecycle
//! operator never sees it available before the controller has caught up.
//! Each adapter is served on `POST /mutate/{adapter-name}`.

pub mod pod;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use consist_common::{Error, Result};
use consist_controller::client::EmployerKey;

/// Webhook half of an adapter
#[async_trait]
pub trait WebhookAdapter: Send + Sync {
    /// Name the adapter is served under
    fn name(&self) -> &str;

    /// Employers that will select the pod being created
    async fn employers_for_employee(&self, pod: &Pod) -> Result<Vec<EmployerKey>>;
}

/// Shared state for webhook handlers
#[derive(Clone, Default)]
pub struct WebhookState {
    adapters: HashMap<String, Arc<dyn WebhookAdapter>>,
}

impl WebhookState {
    /// Create a state serving no adapters
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `adapter` under its name; adapters without a name are skipped
    pub fn with_adapter(mut self, adapter: Arc<dyn WebhookAdapter>) -> Self {
        let name = adapter.name().trim_start_matches('/').to_string();
        if name.is_empty() {
            info!("Skip registering webhook adapter without a name");
            return self;
        }
        info!(path = %format!("/mutate/{name}"), "Registered webhook handler");
        self.adapters.insert(name, adapter);
        self
    }

    /// Adapter registered under `name`
    pub fn adapter(&self, name: &str) -> Option<Arc<dyn WebhookAdapter>> {
        self.adapters.get(name).cloned()
    }
}

/// Create the webhook router
///
/// - POST /mutate/{adapter} - stamp expected-finalizer tokens on new pods
/// - GET /healthz - liveness
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate/{adapter}", post(pod::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the router, over TLS when `cert_dir` holds `tls.crt` and `tls.key`
pub async fn serve(router: Router, addr: SocketAddr, cert_dir: Option<&Path>) -> Result<()> {
    let served = match cert_dir {
        Some(dir) => {
            let tls_config = RustlsConfig::from_pem_file(dir.join("tls.crt"), dir.join("tls.key"))
                .await
                .map_err(|e| {
                    Error::internal_with_context("webhook", format!("TLS config error: {e}"))
                })?;
            info!(addr = %addr, cert_dir = %dir.display(), "Starting webhook server (TLS)");
            axum_server::bind_rustls(addr, tls_config)
                .serve(router.into_make_service())
                .await
        }
        None => {
            info!(addr = %addr, "Starting webhook server (plain HTTP)");
            axum_server::bind(addr)
                .serve(router.into_make_service())
                .await
        }
    };
    served.map_err(|e| Error::internal_with_context("webhook", format!("server error: {e}")))
}
