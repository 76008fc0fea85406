use anyhow::Error;
use clap::Parser;
use config::{Config, File};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;

use microvm_api::api::{routes, track_requests, RequestStats, RouterState};
use microvm_api::cluster::{
    ClusterBackend, HorizontalScaler, LoadBalancer, OrchestratorBackend, ServiceDiscovery,
    StaticBackend,
};
use microvm_api::exec::{CommandExecutor, ShellExecutor};
use microvm_api::images::ImageRegistry;
use microvm_api::network::NetworkManager;
use microvm_api::resources::{ResourceManager, SysinfoSampler, SystemSampler};
use microvm_api::settings::{ClusterBackendConfig, Settings};
use microvm_api::vnc::VncManager;
use microvm_api::worker::BackgroundWorker;

#[derive(Parser)]
#[clap(about, version, author)]
struct Args {
    /// Path to the config file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let args = Args::parse();
    let settings: Settings = Config::builder()
        .add_source(
            File::from(args.config.unwrap_or(PathBuf::from("config.yaml"))).required(false),
        )
        .build()?
        .try_deserialize()?;

    let executor: Arc<dyn CommandExecutor> = Arc::new(ShellExecutor);
    let sampler: Arc<dyn SystemSampler> = Arc::new(SysinfoSampler);

    let resources = Arc::new(ResourceManager::new(&settings.resources, sampler));
    let network = Arc::new(NetworkManager::new(&settings.network, executor.clone())?);
    let images = Arc::new(ImageRegistry::new(settings.images_dir(), executor.clone())?);
    let vnc = Arc::new(VncManager::new(
        &settings.vnc,
        settings.data_dir(),
        executor.clone(),
    )?);

    let backend: Arc<dyn ClusterBackend> = match &settings.cluster.backend {
        ClusterBackendConfig::Orchestrator {
            api_url,
            namespace,
            service,
            deployment,
        } => {
            info!("Using orchestrator service discovery in namespace {}", namespace);
            Arc::new(OrchestratorBackend::new(api_url, namespace, service, deployment))
        }
        ClusterBackendConfig::Static { hosts } => {
            info!("Using static service discovery: {}", hosts);
            Arc::new(StaticBackend::parse(hosts)?)
        }
    };
    let discovery = Arc::new(ServiceDiscovery::new(
        backend,
        Duration::from_secs(settings.cluster.discovery_interval_s.max(1)),
    ));
    let balancer = Arc::new(LoadBalancer::new(
        discovery.clone(),
        (&settings.cluster.load_balancer).into(),
    ));
    let scaler = Arc::new(HorizontalScaler::new(
        discovery.clone(),
        settings.cluster.scaler.clone(),
    ));

    // bridge setup needs CAP_NET_ADMIN, degrade to read-only networking
    if let Err(e) = network.setup_bridge().await {
        warn!("Failed to set up bridge network: {}", e);
    }

    let worker = BackgroundWorker::new(
        balancer.clone(),
        scaler.clone(),
        settings.worker.clone(),
        settings.hypervisor.api_socket_dir.clone(),
    );
    let shutdown = Arc::new(Notify::new());
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let state = RouterState {
        resources,
        network,
        images,
        vnc: vnc.clone(),
        discovery,
        balancer,
        scaler,
        stats: Arc::new(RequestStats::default()),
    };

    let app = routes()
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listen = settings
        .listen
        .clone()
        .unwrap_or_else(|| "0.0.0.0:8000".to_string());
    let listener = TcpListener::bind(&listen).await?;
    info!("Listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    // stop periodic work, then tear down owned VNC processes
    shutdown.notify_waiters();
    let _ = worker_handle.await;
    vnc.stop_all().await;

    Ok(())
}
