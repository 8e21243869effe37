//! Pod Mutation Webhook
//!
//! Handles AdmissionReview requests for Pods, writing an expected-finalizer
//! token for every employer that will select the new pod into the pod's
//! availability-conditions annotation.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use tracing::{debug, error, info, warn};

use consist_controller::client::EmployerKey;
use consist_controller::naming::{
    expected_finalizer_key, lifecycle_finalizer, AvailableConditions,
    POD_AVAILABLE_CONDITIONS_ANNOTATION,
};

use super::{WebhookAdapter, WebhookState};

/// Error type for webhook operations
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// No adapter is registered under the requested path
    #[error("no webhook adapter named {0}")]
    UnknownAdapter(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::UnknownAdapter(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Handle mutating admission review for Pods
pub async fn mutate_handler(
    Path(adapter): Path<String>,
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Result<Json<AdmissionReview<DynamicObject>>, WebhookError> {
    let adapter = state
        .adapter(&adapter)
        .ok_or(WebhookError::UnknownAdapter(adapter))?;

    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Ok(Json(AdmissionResponse::invalid(e.to_string()).into_review()));
        }
    };

    let response = mutate_pod(adapter.as_ref(), &req).await;
    Ok(Json(response.into_review()))
}

/// Outcome of reviewing one pod admission request
#[derive(Debug)]
pub enum Mutation {
    /// Admit unchanged
    Allow,
    /// Admit with a JSON patch
    Patch(json_patch::Patch),
    /// Reject with a message
    Deny(String),
}

/// Process a single pod admission request
pub async fn mutate_pod(
    adapter: &dyn WebhookAdapter,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    match review_pod(adapter, request).await {
        Mutation::Allow => AdmissionResponse::from(request),
        Mutation::Deny(message) => AdmissionResponse::from(request).deny(message),
        Mutation::Patch(patch) => match AdmissionResponse::from(request).with_patch(patch) {
            Ok(response) => response,
            Err(e) => {
                error!(uid = %request.uid, error = %e, "Failed to serialize patch");
                AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
            }
        },
    }
}

/// Decide how to admit a pod
///
/// Only pod creations are mutated; dry runs, updates and other kinds pass
/// unchanged. A failed employer lookup or a malformed existing annotation
/// rejects the pod.
pub async fn review_pod(
    adapter: &dyn WebhookAdapter,
    request: &AdmissionRequest<DynamicObject>,
) -> Mutation {
    let uid = &request.uid;
    if request.dry_run {
        return Mutation::Allow;
    }
    if request.kind.kind != "Pod" || request.operation != Operation::Create {
        debug!(uid = %uid, kind = %request.kind.kind, "Not a pod creation, allowing unchanged");
        return Mutation::Allow;
    }
    let Some(obj) = &request.object else {
        return Mutation::Allow;
    };

    let mut pod = match decode_pod(obj) {
        Ok(pod) => pod,
        Err(e) => {
            warn!(uid = %uid, error = %e, "Failed to decode pod");
            return Mutation::Deny(e.to_string());
        }
    };
    if pod.metadata.namespace.is_none() {
        pod.metadata.namespace = request.namespace.clone();
    }

    let employers = match adapter.employers_for_employee(&pod).await {
        Ok(employers) => employers,
        Err(e) => {
            warn!(uid = %uid, error = %e, "Failed to look up employers of pod");
            return Mutation::Deny(e.to_string());
        }
    };
    if employers.is_empty() {
        return Mutation::Allow;
    }

    let annotations = pod.metadata.annotations.as_ref();
    let existing = annotations.and_then(|a| a.get(POD_AVAILABLE_CONDITIONS_ANNOTATION));
    let annotation = match expected_tokens_annotation(existing.map(String::as_str), &employers) {
        Ok(annotation) => annotation,
        Err(e) => {
            warn!(uid = %uid, error = %e, "Malformed pod availability annotation");
            return Mutation::Deny(e.to_string());
        }
    };

    info!(
        uid = %uid,
        pod = ?pod.metadata.name,
        employers = employers.len(),
        "Stamping expected finalizers on new pod"
    );
    Mutation::Patch(json_patch::Patch(vec![annotation_patch(
        annotations.is_some(),
        annotation,
    )]))
}

fn decode_pod(obj: &DynamicObject) -> consist_common::Result<Pod> {
    let value = serde_json::to_value(obj)?;
    Ok(serde_json::from_value(value)?)
}

/// Merge a token per employer into the existing annotation value
fn expected_tokens_annotation(
    existing: Option<&str>,
    employers: &[EmployerKey],
) -> consist_common::Result<String> {
    let mut conditions = AvailableConditions::parse(existing)?;
    for employer in employers {
        conditions.insert_expected(
            &expected_finalizer_key(&employer.kind, &employer.namespace, &employer.name),
            &lifecycle_finalizer(&employer.name),
        );
    }
    conditions.to_annotation()
}

fn annotation_patch(has_annotations: bool, value: String) -> PatchOperation {
    if has_annotations {
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens([
                "metadata",
                "annotations",
                POD_AVAILABLE_CONDITIONS_ANNOTATION,
            ]),
            value: serde_json::Value::String(value),
        })
    } else {
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::json!({ POD_AVAILABLE_CONDITIONS_ANNOTATION: value }),
        })
    }
}
