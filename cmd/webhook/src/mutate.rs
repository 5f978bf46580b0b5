//! Pod mutation: converts a pod's security group or Windows placement
//! intent into an extended resource request so the scheduler only binds it
//! to a node advertising capacity.

use eniop_k8s_util::sgp::security_groups_for_pod;
use eniop_operator::config::{
    NODE_LABEL_OS, NODE_LABEL_OS_BETA, OS_WINDOWS, RESOURCE_NAME_IPV4_ADDRESS,
    RESOURCE_NAME_POD_ENI,
};
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::info;

use crate::state::WebhookState;

const RESOURCE_LIMIT: &str = "1";

/// Windows pods are recognised by their node selector; the beta label is
/// honoured for clusters that still carry it.
pub fn is_windows_pod(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_selector.as_ref())
        .map(|selector| {
            selector.get(NODE_LABEL_OS).map(String::as_str) == Some(OS_WINDOWS)
                || selector.get(NODE_LABEL_OS_BETA).map(String::as_str) == Some(OS_WINDOWS)
        })
        .unwrap_or(false)
}

fn inject_resource(pod: &mut Pod, resource: &str) {
    let Some(container) = pod
        .spec
        .as_mut()
        .and_then(|spec| spec.containers.first_mut())
    else {
        return;
    };
    let resources = container.resources.get_or_insert_default();
    resources
        .limits
        .get_or_insert_default()
        .insert(resource.to_string(), Quantity(RESOURCE_LIMIT.to_string()));
    resources
        .requests
        .get_or_insert_default()
        .insert(resource.to_string(), Quantity(RESOURCE_LIMIT.to_string()));
}

/// Decide the mutation for a pod at admission. Returns the JSONPatch to
/// apply, or `None` when the pod is admitted unchanged. Errors are
/// messages for a 500 class deny; a matcher failure must never silently
/// allow.
pub fn mutate(state: &WebhookState, pod: &Pod) -> Result<Option<json_patch::Patch>, String> {
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false);
    if host_network {
        info!(msg = "not injecting resources, the pod runs on the host network");
        return Ok(None);
    }

    let mut mutated = pod.clone();
    if is_windows_pod(pod) {
        inject_resource(&mut mutated, RESOURCE_NAME_IPV4_ADDRESS);
    } else {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let sa_name = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.as_deref())
            .unwrap_or("default");
        // A service account missing from the cache is evaluated with its
        // name and no labels.
        let service_account = state.service_account(namespace, sa_name).unwrap_or_else(|| {
            ServiceAccount {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(sa_name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..ServiceAccount::default()
            }
        });
        let policies = state.policies_in(namespace);
        let security_groups = security_groups_for_pod(pod, &service_account, &policies);
        if security_groups.is_empty() {
            return Ok(None);
        }
        inject_resource(&mut mutated, RESOURCE_NAME_POD_ENI);
    }

    let original = serde_json::to_value(pod)
        .map_err(|e| format!("failed to serialize the original pod: {e}"))?;
    let mutated = serde_json::to_value(&mutated)
        .map_err(|e| format!("failed to serialize the mutated pod: {e}"))?;
    Ok(Some(json_patch::diff(&original, &mutated)))
}

#[cfg(test)]
mod test {
    use super::*;

    use eniop_api::security_group_policy::{
        GroupIds, SecurityGroupPolicy, SecurityGroupPolicySpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use kube::runtime::reflector;
    use kube::runtime::watcher;

    fn state_with_policies(policies: Vec<SecurityGroupPolicy>) -> WebhookState {
        let (sgp_store, mut sgp_writer) = reflector::store();
        for sgp in policies {
            sgp_writer.apply_watcher_event(&watcher::Event::Apply(sgp));
        }
        let (sa_store, _sa_writer) = reflector::store();
        WebhookState::new(sgp_store, sa_store)
    }

    fn sgp(namespace: &str, pod_labels: &[(&str, &str)], groups: &[&str]) -> SecurityGroupPolicy {
        SecurityGroupPolicy {
            metadata: ObjectMeta {
                name: Some("test-sgp".to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            spec: SecurityGroupPolicySpec {
                pod_selector: Some(LabelSelector {
                    match_labels: Some(
                        pod_labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..LabelSelector::default()
                }),
                service_account_selector: None,
                security_groups: GroupIds {
                    groups: groups.iter().map(|g| g.to_string()).collect(),
                },
            },
        }
    }

    fn pod_json(namespace: &str, labels: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "metadata": {
                "name": "p",
                "namespace": namespace,
                "labels": labels,
            },
            "spec": {
                "containers": [
                    {"name": "app", "image": "nginx"}
                ]
            }
        })
    }

    fn apply(pod: &Pod, patch: json_patch::Patch) -> serde_json::Value {
        let mut value = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut value, &patch).unwrap();
        value
    }

    #[test]
    fn test_sgp_match_injects_pod_eni_request() {
        let state = state_with_policies(vec![sgp("ns", &[("role", "db")], &["sg-A"])]);
        let pod: Pod =
            serde_json::from_value(pod_json("ns", serde_json::json!({"role": "db"}))).unwrap();

        let patch = mutate(&state, &pod).unwrap().expect("expected a patch");
        let mutated = apply(&pod, patch);

        let resources = &mutated["spec"]["containers"][0]["resources"];
        assert_eq!(resources["requests"][RESOURCE_NAME_POD_ENI], "1");
        assert_eq!(resources["limits"][RESOURCE_NAME_POD_ENI], "1");
        // Nothing else changed.
        assert_eq!(mutated["metadata"], serde_json::to_value(&pod).unwrap()["metadata"]);
        assert_eq!(mutated["spec"]["containers"][0]["image"], "nginx");
    }

    #[test]
    fn test_windows_pod_gets_ipv4_address_request() {
        let state = state_with_policies(vec![]);
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "win-pod", "namespace": "default"},
            "spec": {
                "nodeSelector": {"kubernetes.io/os": "windows"},
                "containers": [{"name": "app", "image": "app:latest"}]
            }
        }))
        .unwrap();

        let patch = mutate(&state, &pod).unwrap().expect("expected a patch");
        let mutated = apply(&pod, patch);

        let resources = &mutated["spec"]["containers"][0]["resources"];
        assert_eq!(resources["requests"][RESOURCE_NAME_IPV4_ADDRESS], "1");
        assert_eq!(resources["limits"][RESOURCE_NAME_IPV4_ADDRESS], "1");
    }

    #[test]
    fn test_beta_os_label_is_recognised() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "win-pod"},
            "spec": {
                "nodeSelector": {"beta.kubernetes.io/os": "windows"},
                "containers": [{"name": "app"}]
            }
        }))
        .unwrap();
        assert!(is_windows_pod(&pod));
    }

    #[test]
    fn test_host_network_pod_unchanged() {
        let state = state_with_policies(vec![sgp("ns", &[("role", "db")], &["sg-A"])]);
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p", "namespace": "ns", "labels": {"role": "db"}},
            "spec": {
                "hostNetwork": true,
                "containers": [{"name": "app"}]
            }
        }))
        .unwrap();

        assert!(mutate(&state, &pod).unwrap().is_none());
    }

    #[test]
    fn test_pod_without_match_unchanged() {
        let state = state_with_policies(vec![sgp("ns", &[("role", "db")], &["sg-A"])]);
        let pod: Pod =
            serde_json::from_value(pod_json("ns", serde_json::json!({"role": "web"}))).unwrap();

        assert!(mutate(&state, &pod).unwrap().is_none());
    }

    #[test]
    fn test_policies_in_other_namespaces_are_ignored() {
        let state = state_with_policies(vec![sgp("other", &[("role", "db")], &["sg-A"])]);
        let pod: Pod =
            serde_json::from_value(pod_json("ns", serde_json::json!({"role": "db"}))).unwrap();

        assert!(mutate(&state, &pod).unwrap().is_none());
    }
}
