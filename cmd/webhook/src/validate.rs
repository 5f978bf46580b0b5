//! Annotation validation: the pod annotations carrying allocated resources
//! are written by the controller only. Users may neither create pods with
//! them preset nor change them afterwards.

use eniop_operator::config::{
    FARGATE_POD_SG_ANNOTATION, RESOURCE_NAME_IPV4_ADDRESS, RESOURCE_NAME_POD_ENI,
    TRUSTED_ANNOTATION_USERS,
};
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use crate::admission::{AdmissionRequest, AdmissionResponse};
use crate::mutate::is_windows_pod;
use crate::state::WebhookState;

const PROTECTED_ANNOTATIONS: [&str; 2] = [RESOURCE_NAME_POD_ENI, RESOURCE_NAME_IPV4_ADDRESS];

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

pub fn validate(state: &WebhookState, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let uid = request.uid.clone();
    let Some(pod) = request.object.as_ref() else {
        return AdmissionResponse::deny(uid, "invalid admission review: missing object");
    };

    // Clusters that never used a SecurityGroupPolicy skip the validation
    // for Linux pods entirely.
    if !is_windows_pod(pod) && !state.sgp_enabled() {
        return AdmissionResponse::allow(uid);
    }

    match request.operation.as_str() {
        "CREATE" => handle_create(uid, pod),
        "UPDATE" => {
            let Some(old_pod) = request.old_object.as_ref() else {
                return AdmissionResponse::deny(uid, "invalid admission review: missing oldObject");
            };
            let username = request
                .user_info
                .as_ref()
                .and_then(|user| user.username.as_deref())
                .unwrap_or_default();
            handle_update(uid, username, pod, old_pod)
        }
        _ => AdmissionResponse::allow(uid),
    }
}

fn handle_create(uid: String, pod: &Pod) -> AdmissionResponse {
    // The controller annotates pods through updates, a create carrying the
    // annotation was forged by the requester.
    for key in PROTECTED_ANNOTATIONS {
        if let Some(value) = annotation(pod, key) {
            info!(msg = "blocking pod create", annotation = key, value);
            return AdmissionResponse::deny(
                uid,
                format!("pod cannot be created with the {key} annotation"),
            );
        }
    }
    AdmissionResponse::allow(uid)
}

fn handle_update(uid: String, username: &str, pod: &Pod, old_pod: &Pod) -> AdmissionResponse {
    // The Fargate security group annotation is written once by its own
    // mutating webhook and immutable after that, for every user.
    if annotation(pod, FARGATE_POD_SG_ANNOTATION) != annotation(old_pod, FARGATE_POD_SG_ANNOTATION)
    {
        info!(msg = "denying annotation change", username, annotation = FARGATE_POD_SG_ANNOTATION);
        return AdmissionResponse::deny(uid, "annotation is not set by the mutating webhook");
    }

    for key in PROTECTED_ANNOTATIONS {
        if annotation(pod, key) != annotation(old_pod, key)
            && !TRUSTED_ANNOTATION_USERS.contains(&username)
        {
            info!(msg = "denying annotation change", username, annotation = key);
            return AdmissionResponse::deny(
                uid,
                format!("the {key} annotation is managed by the vpc resource controller"),
            );
        }
    }
    AdmissionResponse::allow(uid)
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::admission::UserInfo;
    use kube::runtime::reflector;
    use kube::runtime::watcher;

    fn state(sgp_enabled: bool) -> WebhookState {
        let (sgp_store, mut sgp_writer) = reflector::store();
        if sgp_enabled {
            sgp_writer.apply_watcher_event(&watcher::Event::Apply(
                eniop_api::security_group_policy::SecurityGroupPolicy {
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: Some("sgp".to_string()),
                        namespace: Some("default".to_string()),
                        ..Default::default()
                    },
                    spec: Default::default(),
                },
            ));
        }
        let (sa_store, _sa_writer) = reflector::store();
        WebhookState::new(sgp_store, sa_store)
    }

    fn pod(annotations: serde_json::Value) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "p",
                "namespace": "default",
                "annotations": annotations,
            },
            "spec": {"containers": [{"name": "app"}]}
        }))
        .unwrap()
    }

    fn request(
        operation: &str,
        object: Pod,
        old_object: Option<Pod>,
        username: &str,
    ) -> AdmissionRequest<Pod> {
        AdmissionRequest {
            uid: "req-1".to_string(),
            operation: operation.to_string(),
            object: Some(object),
            old_object,
            user_info: Some(UserInfo {
                username: Some(username.to_string()),
            }),
        }
    }

    #[test]
    fn test_create_with_protected_annotation_denied() {
        let response = validate(
            &state(true),
            &request(
                "CREATE",
                pod(serde_json::json!({RESOURCE_NAME_POD_ENI: "[]"})),
                None,
                "someone",
            ),
        );
        assert!(!response.allowed);
    }

    #[test]
    fn test_create_without_protected_annotation_allowed() {
        let response = validate(
            &state(true),
            &request("CREATE", pod(serde_json::json!({})), None, "someone"),
        );
        assert!(response.allowed);
    }

    #[test]
    fn test_linux_pod_allowed_when_sgp_never_observed() {
        let response = validate(
            &state(false),
            &request(
                "CREATE",
                pod(serde_json::json!({RESOURCE_NAME_POD_ENI: "[]"})),
                None,
                "someone",
            ),
        );
        assert!(response.allowed);
    }

    #[test]
    fn test_update_by_untrusted_user_denied() {
        let old = pod(serde_json::json!({}));
        let new = pod(serde_json::json!({RESOURCE_NAME_IPV4_ADDRESS: "10.0.0.5"}));
        let response = validate(
            &state(true),
            &request("UPDATE", new, Some(old), "system:serviceaccount:default:app"),
        );
        assert!(!response.allowed);
    }

    #[test]
    fn test_update_by_controller_service_account_allowed() {
        let old = pod(serde_json::json!({}));
        let new = pod(serde_json::json!({RESOURCE_NAME_IPV4_ADDRESS: "10.0.0.5"}));
        let response = validate(
            &state(true),
            &request(
                "UPDATE",
                new,
                Some(old),
                "system:serviceaccount:kube-system:eks-vpc-resource-controller",
            ),
        );
        assert!(response.allowed);
    }

    #[test]
    fn test_fargate_annotation_immutable_even_for_controller() {
        let old = pod(serde_json::json!({FARGATE_POD_SG_ANNOTATION: "sg-1"}));
        let new = pod(serde_json::json!({FARGATE_POD_SG_ANNOTATION: "sg-2"}));
        let response = validate(
            &state(true),
            &request(
                "UPDATE",
                new,
                Some(old),
                "system:serviceaccount:kube-system:eks-vpc-resource-controller",
            ),
        );
        assert!(!response.allowed);
    }

    #[test]
    fn test_unchanged_annotations_allowed_for_any_user() {
        let old = pod(serde_json::json!({RESOURCE_NAME_POD_ENI: "[]"}));
        let new = pod(serde_json::json!({RESOURCE_NAME_POD_ENI: "[]"}));
        let response = validate(&state(true), &request("UPDATE", new, Some(old), "someone"));
        assert!(response.allowed);
    }
}
