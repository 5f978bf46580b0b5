use crate::admission::{AdmissionResponse, AdmissionReview};
use crate::state::WebhookState;
use crate::{mutate, validate};

use axum::extract::State;
use axum::response::Json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, error};

/// `POST /mutate-v1-pod`: inject extended resource requests on create.
pub async fn mutate_pod(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<()>> {
    let Some(request) = review.request.as_ref() else {
        error!("missing request in admission review");
        return Json(review.response(AdmissionResponse::deny(
            "unknown".to_string(),
            "invalid admission review: missing request",
        )));
    };
    let uid = request.uid.clone();

    if request.operation != "CREATE" {
        return Json(review.response(AdmissionResponse::allow(uid)));
    }
    let Some(pod) = request.object.as_ref() else {
        return Json(review.response(AdmissionResponse::deny(
            uid,
            "invalid admission review: missing object",
        )));
    };

    match mutate::mutate(&state, pod) {
        Ok(None) => Json(review.response(AdmissionResponse::allow(uid))),
        Ok(Some(patch)) => {
            debug!(
                msg = "mutating pod",
                pod = pod.name_any(),
                namespace = pod.namespace().unwrap_or_default(),
                ?patch
            );
            match serde_json::to_vec(&patch) {
                Ok(bytes) => {
                    let response = AdmissionResponse::patched(uid, BASE64.encode(bytes));
                    Json(review.response(response))
                }
                Err(e) => {
                    error!(msg = "failed to serialize the patch", %e);
                    Json(review.response(AdmissionResponse::deny(
                        uid,
                        format!("failed to serialize the patch: {e}"),
                    )))
                }
            }
        }
        Err(message) => {
            // Matcher failures must never silently admit the pod.
            error!(msg = "pod mutation failed", message);
            Json(review.response(AdmissionResponse::deny(uid, message)))
        }
    }
}

/// `POST /validate-v1-pod`: protect the controller managed annotations.
pub async fn validate_pod(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<()>> {
    let Some(request) = review.request.as_ref() else {
        error!("missing request in admission review");
        return Json(review.response(AdmissionResponse::deny(
            "unknown".to_string(),
            "invalid admission review: missing request",
        )));
    };

    let response = validate::validate(&state, request);
    Json(review.response(response))
}
