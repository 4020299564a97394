use crate::oci_registry::RegistryClient;
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::rollout::KubePatcher;
use crate::state::{ControllerContext, HealthState};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod controller;
mod digest_state;
mod error;
mod image_reference;
mod oci_registry;
mod reconciler;
mod rollout;
mod secret_string;
mod selector;
mod state;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting kube-image-updater {}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config::load_config(config::config_path())?);

    let kube_client = controller::create_client().await?;
    let http_client = oci_registry::create_client(&config.registry)?;
    let resolver = Arc::new(RegistryClient::new(http_client, &config.registry)?);
    let patcher = Arc::new(KubePatcher::new(kube_client.clone()));
    let reconciler = Arc::new(Reconciler::new(
        resolver,
        patcher,
        ReconcilerSettings::from_config(&config),
    ));

    let health = HealthState::default();
    let ctx = ControllerContext {
        kube_client,
        config: config.clone(),
        reconciler,
        health: health.clone(),
        scan_lock: Default::default(),
    };
    let cancel = CancellationToken::new();

    info!(
        "Checking workloads every {} seconds",
        config.check_interval_seconds
    );
    let mut scheduler = JobScheduler::new().await?;

    let job_ctx = ctx.clone();
    let job_cancel = cancel.clone();
    let job = Job::new_repeated_async(config.check_interval(), move |_uuid, _l| {
        let ctx = job_ctx.clone();
        let cancel = job_cancel.clone();
        Box::pin(async move {
            if let Err(e) = controller::run(ctx, cancel).await {
                error!("Error running controller job: {:?}", e);
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    // The repeated job first fires after one interval, so check once right away.
    let initial_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = controller::run(ctx, initial_cancel).await {
            error!("Error running initial controller job: {:?}", e);
        }
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, cancelling in-flight reconciliations");
        signal_cancel.cancel();
    });

    let app = webserver::create_app(health);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    scheduler.shutdown().await?;
    info!("kube-image-updater stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
