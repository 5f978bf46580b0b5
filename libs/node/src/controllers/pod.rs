use crate::handler::ResourceHandler;

use std::ops::Deref;
use std::sync::Arc;

use eniop_operator::backoff_reconciler;
use eniop_operator::controller::context::Context;
use eniop_operator::controller::{ControllerId, State, check_api_queryable, error_policy};
use eniop_operator::error::{Error, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "pod";

pub struct PodContext {
    base: Context<Pod>,
    handler: Arc<ResourceHandler>,
}

impl Deref for PodContext {
    type Target = Context<Pod>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

fn pod_reference(pod: &Pod) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        uid: pod.metadata.uid.clone(),
        ..ObjectReference::default()
    }
}

async fn reconcile_pod(pod: Arc<Pod>, ctx: Arc<PodContext>) -> Result<Action> {
    let _timer = ctx.metrics.reconcile_count_and_measure();

    let host_network = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false);
    let scheduled = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some();
    if host_network || !scheduled {
        return Ok(Action::await_change());
    }

    if pod.metadata.deletion_timestamp.is_some() {
        ctx.handler.handle_delete(&pod).await?;
        return Ok(Action::await_change());
    }

    match ctx.handler.handle_create(&pod).await {
        Ok(()) => Ok(Action::await_change()),
        Err(Error::Ec2Error(context, e)) if e.is_quota() => {
            // Capacity problems are surfaced on the pod; retrying in a
            // tight loop would only burn the API budget.
            ctx.publish_warning(
                &pod_reference(&pod),
                "InsufficientCidrBlocks",
                "PodResourceAllocation",
                format!("{context}: {e}"),
            )
            .await;
            Err(Error::Ec2Error(context, e))
        }
        Err(e) => Err(e),
    }
}

/// Initialize the pod controller: watches scheduled pods and drives the
/// resource providers on create and delete transitions.
pub async fn run(state: State, client: Client, handler: Arc<ResourceHandler>) {
    let pods = check_api_queryable::<Pod>(client.clone()).await;

    let ctx = Arc::new(PodContext {
        base: state.to_context(client, CONTROLLER_ID),
        handler,
    });

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let pod_controller = Controller::new(pods, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(backoff_reconciler!(reconcile_pod), error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    pod_controller.await;
}
