use super::{ControllerId, DEFAULT_RECONCILE_INTERVAL};

use crate::metrics::ControllerMetrics;

use std::collections::HashMap;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use eniop_api::cninode::CNINode;
use eniop_k8s_util::wrapper::K8sApi;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::{Lookup, ObjectRef, Store};
use kube::{Resource, client::Client};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{error, trace};

// Context for our reconciler
#[derive(Clone)]
pub struct Context<K: Resource> {
    /// Controller ID
    pub controller_id: ControllerId,
    /// Kubernetes client
    pub client: Client,
    /// Typed Kubernetes operations
    pub k8s: Arc<dyn K8sApi>,
    /// Prometheus metrics
    pub metrics: Arc<ControllerMetrics>,
    /// State of the error backoff policy per object
    error_backoff_cache: Arc<RwLock<HashMap<ObjectRef<K>, RwLock<ExponentialBackoff>>>>,
    /// Event recorder
    pub recorder: Recorder,
    /// Process global security-groups-per-pod flag, set only, never cleared
    sgp_enabled: Arc<RwLock<bool>>,
    /// Cache for Node resources
    pub node_store: Store<Node>,
    /// Cache for CNINode resources
    pub cninode_store: Store<CNINode>,
}

impl<K> Context<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller_id: ControllerId,
        client: Client,
        metrics: Arc<ControllerMetrics>,
        recorder: Recorder,
        k8s: Arc<dyn K8sApi>,
        sgp_enabled: Arc<RwLock<bool>>,
        node_store: Store<Node>,
        cninode_store: Store<CNINode>,
    ) -> Self {
        Self {
            controller_id,
            client,
            k8s,
            metrics,
            recorder,
            sgp_enabled,
            node_store,
            cninode_store,
            error_backoff_cache: Arc::default(),
        }
    }

    pub async fn sgp_enabled(&self) -> bool {
        *self.sgp_enabled.read().await
    }

    pub async fn mark_sgp_enabled(&self) {
        let mut flag = self.sgp_enabled.write().await;
        *flag = true;
    }

    /// Publish a warning event against the given object reference.
    pub async fn publish_warning(
        &self,
        reference: &k8s_openapi::api::core::v1::ObjectReference,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.publish(reference, EventType::Warning, reason, action, note)
            .await;
    }

    pub async fn publish_normal(
        &self,
        reference: &k8s_openapi::api::core::v1::ObjectReference,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.publish(reference, EventType::Normal, reason, action, note)
            .await;
    }

    async fn publish(
        &self,
        reference: &k8s_openapi::api::core::v1::ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        if let Err(e) = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.to_string(),
                    note: Some(note),
                    action: action.to_string(),
                    secondary: None,
                },
                reference,
            )
            .await
        {
            error!(msg = "failed to publish event", reason, %e);
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait BackoffContext<K: Resource> {
    fn metrics(&self) -> &Arc<ControllerMetrics>;
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration;
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>);
}

impl<K> BackoffContext<K> for Context<K>
where
    K: Resource<DynamicType = ()> + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Return next duration of the backoff policy for the given object
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration {
        {
            let read_guard = self.error_backoff_cache.read().await;
            if let Some(backoff) = read_guard.get(&obj_ref) {
                if let Some(duration) = backoff.write().await.next() {
                    return duration;
                }
            }
        }

        // Backoff policy: 1s, 2s, 4s, 8s, 16s, 32s, 64s, 128s, 256s, 300s, 300s...
        let mut backoff = ExponentialBuilder::default()
            .with_max_delay(DEFAULT_RECONCILE_INTERVAL)
            .without_max_times()
            .build();
        // safe unwrap: first backoff is always Some(Duration)
        let duration = backoff.next().unwrap();
        self.error_backoff_cache
            .write()
            .await
            .insert(obj_ref.clone(), RwLock::new(backoff));
        trace!(
            msg = "recreate backoff policy",
            name = %obj_ref.name,
        );
        duration
    }

    /// Reset the backoff policy for the given object
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>) {
        let read_guard = self.error_backoff_cache.read().await;
        if read_guard.get(&obj_ref).is_some() {
            drop(read_guard);
            trace!(msg = "reset backoff policy", name = %obj_ref.name);
            self.error_backoff_cache.write().await.remove(&obj_ref);
        }
    }
}
