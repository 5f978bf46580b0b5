pub mod context;

use self::context::Context;

use crate::error::Error;
use crate::metrics::Metrics;

use std::fmt::Debug;
use std::sync::Arc;

use eniop_api::cninode::CNINode;
use eniop_k8s_util::wrapper::K8sApi;
use k8s_openapi::api::core::v1::Node;
use kube::Resource;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup, ReflectHandle, Store};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{error, info};

pub type ControllerId = &'static str;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const SUBSCRIBE_BUFFER_SIZE: usize = 256;

fn short_type_name<K>() -> Option<&'static str> {
    std::any::type_name::<K>().split("::").last()
}

/// State shared between the controllers and the web server.
#[derive(Clone)]
pub struct State {
    metrics: Arc<Metrics>,
    /// Flipped to true on the first SecurityGroupPolicy observation and
    /// never cleared.
    sgp_enabled: Arc<RwLock<bool>>,
    /// Typed Kubernetes operations shared by every reconciler.
    pub k8s: Arc<dyn K8sApi>,
    /// Cache for Node resources
    pub node_store: Store<Node>,
    /// Cache for CNINode resources
    pub cninode_store: Store<CNINode>,
}

/// Shared state for a resource stream
pub struct ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub store: Store<K>,
    pub writer: Writer<K>,
    pub subscriber: ReflectHandle<K>,
}

impl State {
    pub fn new(
        metrics: Metrics,
        k8s: Arc<dyn K8sApi>,
        node_store: Store<Node>,
        cninode_store: Store<CNINode>,
    ) -> Self {
        Self {
            metrics: Arc::new(metrics),
            sgp_enabled: Arc::default(),
            k8s,
            node_store,
            cninode_store,
        }
    }

    pub async fn sgp_enabled(&self) -> bool {
        *self.sgp_enabled.read().await
    }

    /// Conservative: support for security groups per pod stays on for the
    /// lifetime of the process once any policy has been seen.
    pub async fn mark_sgp_enabled(&self) {
        let mut flag = self.sgp_enabled.write().await;
        if !*flag {
            info!(msg = "observed a SecurityGroupPolicy, enabling security groups for pods");
            *flag = true;
        }
    }

    /// Create a Controller Context that can update State
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Context<K>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Context::new(
            controller_id,
            client.clone(),
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all CONTROLLER_IDs have to be registered")
                .clone(),
            kube::runtime::events::Recorder::new(client, controller_id.into()),
            self.k8s.clone(),
            self.sgp_enabled.clone(),
            self.node_store.clone(),
            self.cninode_store.clone(),
        )
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn create_subscriber<K>(buffer_size: usize) -> ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, writer) = reflector::store_shared(buffer_size);
    let subscriber = writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    ResourceReflector {
        store,
        writer,
        subscriber,
    }
}

pub fn error_policy<K, Ctx>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Ctx>) -> Action {
    unreachable!("Handle in backoff_reconciler macro")
}

#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::context::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    let namespace =
                        kube::ResourceExt::namespace(obj.as_ref()).unwrap_or_default();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
