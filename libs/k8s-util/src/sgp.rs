//! SecurityGroupPolicy matching. A policy matches a pod when every
//! selector it carries matches; a policy with no selector at all is
//! invalid and skipped.

use std::collections::BTreeMap;

use eniop_api::security_group_policy::SecurityGroupPolicy;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::Selector;
use tracing::{error, info};

/// Security groups for the pod, unioned over every matching policy with
/// duplicates removed in first seen order.
pub fn security_groups_for_pod(
    pod: &Pod,
    service_account: &ServiceAccount,
    policies: &[SecurityGroupPolicy],
) -> Vec<String> {
    let mut groups: Vec<String> = Vec::new();
    for sgp in policies {
        if !sgp_matches(sgp, pod, service_account) {
            continue;
        }
        for group in &sgp.spec.security_groups.groups {
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }
    }
    if !groups.is_empty() {
        info!(
            msg = "pod matched a SecurityGroupPolicy",
            pod = pod.name_any(),
            namespace = pod.namespace().unwrap_or_default(),
            security_groups = ?groups
        );
    }
    groups
}

fn sgp_matches(sgp: &SecurityGroupPolicy, pod: &Pod, sa: &ServiceAccount) -> bool {
    let has_pod_selector = sgp.spec.pod_selector.is_some();
    let sa_selector = sgp.spec.service_account_selector.as_ref();
    let has_sa_selector = sa_selector
        .map(|s| s.label_selector.is_some() || s.match_names.is_some())
        .unwrap_or(false);

    if !has_pod_selector && !has_sa_selector {
        info!(
            msg = "skipping invalid SecurityGroupPolicy with neither pod nor service account selector",
            sgp = sgp.name_any(),
            namespace = sgp.namespace().unwrap_or_default()
        );
        return false;
    }

    if has_pod_selector {
        let pod_selector = sgp.spec.pod_selector.as_ref().expect("checked by has_pod_selector");
        let pod_labels = pod.metadata.labels.clone().unwrap_or_default();
        if !selector_matches(sgp, pod_selector, &pod_labels) {
            return false;
        }
    }

    if has_sa_selector {
        let selector = sa_selector.expect("checked by has_sa_selector");
        // Both parts must match; a part that is not set selects nothing,
        // so a selector carrying only one of them never matches.
        let names_match = selector
            .match_names
            .as_ref()
            .is_some_and(|names| names.contains(&sa.name_any()));
        let sa_labels = sa.metadata.labels.clone().unwrap_or_default();
        let labels_match = selector
            .label_selector
            .as_ref()
            .is_some_and(|label_selector| selector_matches(sgp, label_selector, &sa_labels));
        if !(names_match && labels_match) {
            return false;
        }
    }

    true
}

fn selector_matches(
    sgp: &SecurityGroupPolicy,
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> bool {
    match Selector::try_from(selector.clone()) {
        Ok(selector) => selector.matches(labels),
        Err(e) => {
            error!(
                msg = "failed converting the SecurityGroupPolicy selector",
                sgp = sgp.name_any(),
                namespace = sgp.namespace().unwrap_or_default(),
                %e
            );
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use eniop_api::security_group_policy::{
        GroupIds, SecurityGroupPolicySpec, ServiceAccountSelector,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn pod(pod_labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_string()),
                namespace: Some("test-namespace".to_string()),
                labels: Some(labels(pod_labels)),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        }
    }

    fn service_account(name: &str, sa_labels: &[(&str, &str)]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("test-namespace".to_string()),
                labels: Some(labels(sa_labels)),
                ..ObjectMeta::default()
            },
            ..ServiceAccount::default()
        }
    }

    fn sgp(
        pod_selector: Option<&[(&str, &str)]>,
        sa_names: Option<&[&str]>,
        sa_labels: Option<&[(&str, &str)]>,
        groups: &[&str],
    ) -> SecurityGroupPolicy {
        let service_account_selector = if sa_names.is_some() || sa_labels.is_some() {
            Some(ServiceAccountSelector {
                label_selector: sa_labels.map(|l| LabelSelector {
                    match_labels: Some(labels(l)),
                    ..LabelSelector::default()
                }),
                match_names: sa_names.map(|n| n.iter().map(|s| s.to_string()).collect()),
            })
        } else {
            None
        };
        SecurityGroupPolicy {
            metadata: ObjectMeta {
                name: Some("test-sgp".to_string()),
                namespace: Some("test-namespace".to_string()),
                ..ObjectMeta::default()
            },
            spec: SecurityGroupPolicySpec {
                pod_selector: pod_selector.map(|l| LabelSelector {
                    match_labels: Some(labels(l)),
                    ..LabelSelector::default()
                }),
                service_account_selector,
                security_groups: GroupIds {
                    groups: groups.iter().map(|g| g.to_string()).collect(),
                },
            },
        }
    }

    #[test]
    fn test_pod_selector_only_matches_on_pod_labels() {
        let policies = [sgp(Some(&[("role", "db")]), None, None, &["sg-1"])];
        let sa = service_account("default", &[]);

        assert_eq!(
            security_groups_for_pod(&pod(&[("role", "db")]), &sa, &policies),
            vec!["sg-1".to_string()]
        );
        assert!(security_groups_for_pod(&pod(&[("role", "web")]), &sa, &policies).is_empty());
    }

    #[test]
    fn test_sa_selector_only_matches_on_service_account() {
        let policies = [sgp(
            None,
            Some(&["backend"]),
            Some(&[("team", "storage")]),
            &["sg-2"],
        )];
        let p = pod(&[]);

        let matching = service_account("backend", &[("team", "storage")]);
        assert_eq!(
            security_groups_for_pod(&p, &matching, &policies),
            vec!["sg-2".to_string()]
        );

        let wrong_name = service_account("frontend", &[("team", "storage")]);
        assert!(security_groups_for_pod(&p, &wrong_name, &policies).is_empty());

        let wrong_labels = service_account("backend", &[("team", "compute")]);
        assert!(security_groups_for_pod(&p, &wrong_labels, &policies).is_empty());
    }

    #[test]
    fn test_both_selectors_require_both_to_match() {
        // An empty label selector selects everything, so the name list is
        // the discriminating part of the service account selector here.
        let policies = [sgp(
            Some(&[("role", "db")]),
            Some(&["backend"]),
            Some(&[]),
            &["sg-3"],
        )];

        let sa = service_account("backend", &[]);
        assert_eq!(
            security_groups_for_pod(&pod(&[("role", "db")]), &sa, &policies),
            vec!["sg-3".to_string()]
        );
        assert!(security_groups_for_pod(&pod(&[("role", "web")]), &sa, &policies).is_empty());

        let other_sa = service_account("frontend", &[]);
        assert!(
            security_groups_for_pod(&pod(&[("role", "db")]), &other_sa, &policies).is_empty()
        );
    }

    #[test]
    fn test_sa_selector_with_only_labels_never_matches() {
        // matchNames is unset: the name part selects nothing, regardless
        // of the service account's labels.
        let policies = [sgp(None, None, Some(&[("team", "storage")]), &["sg-5"])];
        let p = pod(&[]);

        let sa = service_account("backend", &[("team", "storage")]);
        assert!(security_groups_for_pod(&p, &sa, &policies).is_empty());
    }

    #[test]
    fn test_sa_selector_with_only_names_never_matches() {
        // labelSelector is unset: the label part selects nothing, even
        // for a service account the name list contains.
        let policies = [sgp(None, Some(&["backend"]), None, &["sg-6"])];
        let p = pod(&[]);

        let sa = service_account("backend", &[("team", "storage")]);
        assert!(security_groups_for_pod(&p, &sa, &policies).is_empty());
    }

    #[test]
    fn test_sgp_with_no_selectors_never_matches() {
        let policies = [sgp(None, None, None, &["sg-4"])];
        let sa = service_account("default", &[]);
        assert!(security_groups_for_pod(&pod(&[("role", "db")]), &sa, &policies).is_empty());
    }

    #[test]
    fn test_union_is_deduplicated_in_first_seen_order() {
        let policies = [
            sgp(Some(&[("role", "db")]), None, None, &["sg-b", "sg-a"]),
            sgp(Some(&[("role", "db")]), None, None, &["sg-a", "sg-c"]),
        ];
        let sa = service_account("default", &[]);
        assert_eq!(
            security_groups_for_pod(&pod(&[("role", "db")]), &sa, &policies),
            vec!["sg-b".to_string(), "sg-a".to_string(), "sg-c".to_string()]
        );
    }
}
