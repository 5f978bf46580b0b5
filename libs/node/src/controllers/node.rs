use crate::manager::NodeManager;

use std::ops::Deref;
use std::sync::Arc;

use eniop_operator::backoff_reconciler;
use eniop_operator::controller::context::Context;
use eniop_operator::controller::{
    ControllerId, DEFAULT_RECONCILE_INTERVAL, State, check_api_queryable, error_policy,
};
use eniop_operator::error::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "node";

pub struct NodeControllerContext {
    base: Context<Node>,
    manager: Arc<NodeManager>,
}

impl Deref for NodeControllerContext {
    type Target = Context<Node>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

async fn reconcile_node(node: Arc<Node>, ctx: Arc<NodeControllerContext>) -> Result<Action> {
    let _timer = ctx.metrics.reconcile_count_and_measure();
    let name = node.name_any();

    if node.metadata.deletion_timestamp.is_some() {
        ctx.manager.delete_node(&name);
        return Ok(Action::await_change());
    }

    // The manager dedups add against update internally.
    ctx.manager.add_node(&name);

    // Periodic requeue repairs drift between watch deliveries.
    Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
}

/// Initialize the node controller: keeps the node manager's contexts in
/// sync with the cluster's nodes.
pub async fn run(state: State, client: Client, manager: Arc<NodeManager>) {
    let nodes = check_api_queryable::<Node>(client.clone()).await;

    let ctx = Arc::new(NodeControllerContext {
        base: state.to_context(client, CONTROLLER_ID),
        manager,
    });

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let node_controller = Controller::new(nodes, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(backoff_reconciler!(reconcile_node), error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    node_controller.await;
}
