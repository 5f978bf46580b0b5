use std::ops::Deref;
use std::sync::Arc;

use eniop_api::security_group_policy::SecurityGroupPolicy;
use eniop_operator::backoff_reconciler;
use eniop_operator::controller::context::Context;
use eniop_operator::controller::{ControllerId, State, check_api_queryable, error_policy};
use eniop_operator::error::Result;
use futures::StreamExt;
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "security-group-policy";

pub struct SgpContext {
    base: Context<SecurityGroupPolicy>,
}

impl Deref for SgpContext {
    type Target = Context<SecurityGroupPolicy>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

async fn reconcile_sgp(
    _sgp: Arc<SecurityGroupPolicy>,
    ctx: Arc<SgpContext>,
) -> Result<Action> {
    let _timer = ctx.metrics.reconcile_count_and_measure();
    // Observing any policy permanently enables the feature for the
    // process; the flag is never cleared.
    ctx.mark_sgp_enabled().await;
    Ok(Action::await_change())
}

/// Initialize the SecurityGroupPolicy controller: its only job is to flip
/// the process wide feature flag on the first policy observation.
pub async fn run(state: State, client: Client) {
    let sgps = check_api_queryable::<SecurityGroupPolicy>(client.clone()).await;

    let ctx = Arc::new(SgpContext {
        base: state.to_context(client, CONTROLLER_ID),
    });

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let sgp_controller = Controller::new(sgps, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(backoff_reconciler!(reconcile_sgp), error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    sgp_controller.await;
}
