use std::sync::Arc;

use axum::response::{IntoResponse, Json};
use axum::routing::{Router, get};
use clap::{Parser, crate_authors, crate_description, crate_version};
use eniop_api::cninode::CNINode;
use eniop_aws::ec2::Ec2Wrapper;
use eniop_aws::helper::{Ec2Api, Ec2ApiHelper};
use eniop_branch::provider::BranchEniProvider;
use eniop_ip::provider::Ipv4Provider;
use eniop_k8s_util::wrapper::{K8sApi, K8sClient};
use eniop_node::cleanup::CNINodeCleaner;
use eniop_node::controllers;
use eniop_node::handler::ResourceHandler;
use eniop_node::manager::NodeManager;
use eniop_operator::config::{
    CNI_NODE_CLEANUP_INTERVAL, WORK_QUEUE_CAPACITY, WORKER_MAX_REQUEUE,
};
use eniop_operator::controller::{
    SUBSCRIBE_BUFFER_SIZE, State, check_api_queryable, create_subscriber,
};
use eniop_operator::metrics::Metrics;
use eniop_operator::pool::{WarmPoolConfig, WarmPoolJob};
use eniop_operator::provider::{PodResourceHandler, ResourceProvider};
use eniop_operator::telemetry;
use eniop_operator::worker::WorkerPool;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Client, Config};
use kube::runtime::WatchStreamExt;
use kube::runtime::events::Recorder;
use kube::runtime::watcher;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

async fn health() -> impl IntoResponse {
    Json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name = "eniop",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,eniop=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing, 1.0 samples every trace.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Name of the cluster, used to tag the network interfaces the
    /// controller creates.
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: String,

    /// Role to assume for the EC2 calls. Without it the instance
    /// credentials are used directly.
    #[arg(long, env = "AWS_ROLE_ARN")]
    role_arn: Option<String>,

    /// Sustained EC2 request rate.
    #[arg(long, default_value_t = 12, env)]
    ec2_api_qps: u32,

    /// EC2 request burst.
    #[arg(long, default_value_t = 18, env)]
    ec2_api_burst: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().build();
    opentelemetry::global::set_meter_provider(provider.clone());
    let meter = opentelemetry::global::meter("eniop");

    let config = Config::infer().await?;
    let client = Client::try_from(config)?;

    let controller_ids = [
        controllers::pod::CONTROLLER_ID,
        controllers::node::CONTROLLER_ID,
        controllers::sgp::CONTROLLER_ID,
        controllers::cninode::CONTROLLER_ID,
    ];
    let metrics = Metrics::new(&meter, &controller_ids);

    let node_api = check_api_queryable::<Node>(client.clone()).await;
    let node_r = create_subscriber::<Node>(SUBSCRIBE_BUFFER_SIZE);
    let cninode_api = check_api_queryable::<CNINode>(client.clone()).await;
    let cninode_r = create_subscriber::<CNINode>(SUBSCRIBE_BUFFER_SIZE);

    let node_watcher = watcher(node_api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect_shared(node_r.writer)
        .for_each(|_| async {});
    let cninode_watcher = watcher(cninode_api, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect_shared(cninode_r.writer)
        .for_each(|_| async {});

    let k8s: Arc<dyn K8sApi> = Arc::new(K8sClient::new(client.clone(), &meter));
    let wrapper = Ec2Wrapper::new(
        args.role_arn.as_deref(),
        args.ec2_api_qps,
        args.ec2_api_burst,
        &meter,
    )
    .await?;
    let ec2: Arc<dyn Ec2Api> = Arc::new(Ec2ApiHelper::new(wrapper, &args.cluster_name));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("received shutdown signal, cancelling background tasks");
            shutdown.cancel();
        });
    }

    let branch_worker = Arc::new(WorkerPool::<WarmPoolJob>::new(
        "vpc.amazonaws.com/pod-eni",
        1,
        WORKER_MAX_REQUEUE,
        WORK_QUEUE_CAPACITY,
        shutdown.clone(),
        metrics.worker.clone(),
    ));
    let ip_worker = Arc::new(WorkerPool::<WarmPoolJob>::new(
        "vpc.amazonaws.com/PrivateIPv4Address",
        1,
        WORKER_MAX_REQUEUE,
        WORK_QUEUE_CAPACITY,
        shutdown.clone(),
        metrics.worker.clone(),
    ));

    let branch_provider = Arc::new(BranchEniProvider::new(
        Arc::clone(&k8s),
        Arc::clone(&ec2),
        branch_worker,
    ));
    Arc::clone(&branch_provider).start().await?;
    let ip_provider = Arc::new(Ipv4Provider::new(
        Arc::clone(&k8s),
        Arc::clone(&ec2),
        WarmPoolConfig::default(),
        ip_worker,
    ));
    Arc::clone(&ip_provider).start().await?;

    let manager = Arc::new(NodeManager::new(
        Arc::clone(&k8s),
        Arc::clone(&ec2),
        vec![
            Arc::clone(&branch_provider) as Arc<dyn ResourceProvider>,
            Arc::clone(&ip_provider) as Arc<dyn ResourceProvider>,
        ],
        Recorder::new(client.clone(), "eniop".into()),
        metrics.worker.clone(),
        shutdown.clone(),
    ));
    Arc::clone(&manager).start().await?;

    let handler = Arc::new(ResourceHandler::new(vec![
        Arc::clone(&branch_provider) as Arc<dyn PodResourceHandler>,
        Arc::clone(&ip_provider) as Arc<dyn PodResourceHandler>,
    ]));

    let state = State::new(
        metrics,
        Arc::clone(&k8s),
        node_r.store.clone(),
        cninode_r.store.clone(),
    );

    let pod_c = controllers::pod::run(state.clone(), client.clone(), handler);
    let node_c = controllers::node::run(state.clone(), client.clone(), Arc::clone(&manager));
    let sgp_c = controllers::sgp::run(state.clone(), client.clone());
    let cninode_c = controllers::cninode::run(state.clone(), client.clone(), Arc::clone(&manager));

    let cleaner = CNINodeCleaner::new(
        Arc::clone(&k8s),
        Some(Arc::clone(&manager)),
        CNI_NODE_CLEANUP_INTERVAL,
    );
    let janitor = cleaner.run(shutdown.clone());

    let app = Router::new()
        .route("/health", get(health))
        .route("/readyz", get(health));
    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::join!(
        pod_c,
        node_c,
        sgp_c,
        cninode_c,
        janitor,
        node_watcher,
        cninode_watcher,
        server
    )
    .7?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
