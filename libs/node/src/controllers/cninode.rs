use crate::manager::NodeManager;

use std::ops::Deref;
use std::sync::Arc;

use eniop_api::cninode::CNINode;
use eniop_operator::backoff_reconciler;
use eniop_operator::controller::context::Context;
use eniop_operator::controller::{ControllerId, State, check_api_queryable, error_policy};
use eniop_operator::error::{Error, Result};
use futures::StreamExt;
use kube::ResourceExt;
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "cninode";

pub struct CNINodeContext {
    base: Context<CNINode>,
    manager: Arc<NodeManager>,
}

impl Deref for CNINodeContext {
    type Target = Context<CNINode>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

async fn reconcile_cninode(cninode: Arc<CNINode>, ctx: Arc<CNINodeContext>) -> Result<Action> {
    let _timer = ctx.metrics.reconcile_count_and_measure();

    if cninode.spec.features.is_empty() {
        return Ok(Action::await_change());
    }
    let node_name = cninode.name_any();
    info!(
        msg = "the CNINode has been updated",
        cninode = node_name,
        features = ?cninode.spec.features
    );

    ctx.k8s
        .get_node(&node_name)
        .await
        .map_err(|e| Error::K8sApiError("failed to get the backing node".to_string(), e))?;

    if ctx.manager.get_node(&node_name).is_none() {
        // The node controller has not caught up yet, come back shortly.
        info!(
            msg = "backing node not managed yet, will try again",
            cninode = node_name
        );
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    ctx.manager.update_node(&node_name);
    Ok(Action::await_change())
}

/// Initialize the CNINode controller: feature changes on the custom
/// resource are folded back into the node manager's queue.
pub async fn run(state: State, client: Client, manager: Arc<NodeManager>) {
    let cninodes = check_api_queryable::<CNINode>(client.clone()).await;

    let ctx = Arc::new(CNINodeContext {
        base: state.to_context(client, CONTROLLER_ID),
        manager,
    });

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let cninode_controller = Controller::new(cninodes, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_cninode),
            error_policy,
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    cninode_controller.await;
}
