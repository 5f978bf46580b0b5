use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eniop_api::security_group_policy::SecurityGroupPolicy;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::runtime::reflector::{ObjectRef, Store};

#[derive(Clone)]
pub struct WebhookState {
    pub sgp_store: Store<SecurityGroupPolicy>,
    pub sa_store: Store<ServiceAccount>,
    /// Latches to true once any SecurityGroupPolicy has been observed and
    /// never resets, mirroring the controller's conservative flag.
    sgp_seen: Arc<AtomicBool>,
}

impl WebhookState {
    pub fn new(sgp_store: Store<SecurityGroupPolicy>, sa_store: Store<ServiceAccount>) -> Self {
        Self {
            sgp_store,
            sa_store,
            sgp_seen: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sgp_enabled(&self) -> bool {
        if self.sgp_seen.load(Ordering::Relaxed) {
            return true;
        }
        if !self.sgp_store.state().is_empty() {
            self.sgp_seen.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Policies in the pod's namespace, from the shared cache.
    pub fn policies_in(&self, namespace: &str) -> Vec<SecurityGroupPolicy> {
        self.sgp_store
            .state()
            .iter()
            .filter(|sgp| sgp.metadata.namespace.as_deref() == Some(namespace))
            .map(|sgp| (**sgp).clone())
            .collect()
    }

    pub fn service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        let object_ref = ObjectRef::new(name).within(namespace);
        self.sa_store.get(&object_ref).map(|sa| (*sa).clone())
    }
}
