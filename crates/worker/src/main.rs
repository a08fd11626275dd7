//! Worker process: one loop that refreshes the API session and gives each
//! controller a turn, with a watchdog around every pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use api_client::ApiClient;
use build_client::{BuildClient, OpenShiftBuildClient};
use controllers::{ClusterController, CustomImageController, SessionController};
use drivers::{ClustersConfig, DriverRegistry};

mod settings;
mod watchdog;

use settings::Settings;
use watchdog::Watchdog;

const WORKER_EXT_ID: &str = "worker@pb";

/// A single pass over all controllers must finish well within this.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;
    info!(worker_id = %settings.worker_id, "worker starting");

    let clusters = ClustersConfig::load(
        &settings.cluster_config_file,
        settings.cluster_passwords_file.as_deref(),
    )
    .context("loading cluster config")?;

    let client = Arc::new(ApiClient::new(
        &settings.api_base_url,
        WORKER_EXT_ID,
        &settings.api_key,
    )?);
    let registry = Arc::new(DriverRegistry::new(
        clusters.clone(),
        settings.kubeconfig_file.clone(),
    ));

    let mut session_controller = SessionController::new(
        settings.worker_id.clone(),
        client.clone(),
        registry.clone(),
    );
    let mut cluster_controller = ClusterController::new(client.clone(), registry.clone())?;
    let mut image_controller = match &clusters.image_builds {
        Some(build_config) => match OpenShiftBuildClient::in_cluster(build_config) {
            Ok(build_client) => Some(CustomImageController::new(
                settings.worker_id.clone(),
                client.clone(),
                Arc::new(build_client) as Arc<dyn BuildClient>,
                build_config.allowed_base_images.clone(),
            )),
            Err(err) => {
                warn!(error = %err, "image builds configured but build client unavailable");
                None
            }
        },
        None => None,
    };

    let terminate = Arc::new(AtomicBool::new(false));
    spawn_signal_listener(terminate.clone())?;

    let watchdog = Watchdog::start();
    while !terminate.load(Ordering::SeqCst) {
        debug!("worker main loop");
        watchdog.arm(WATCHDOG_TIMEOUT);

        match client.ensure_session().await {
            Ok(()) => {
                // one failing controller must not starve the others
                if let Err(err) = session_controller.process().await {
                    warn!(error = %err, "session controller pass failed");
                }
                if let Err(err) = cluster_controller.process().await {
                    warn!(error = %err, "cluster controller pass failed");
                }
                if let Some(controller) = image_controller.as_mut() {
                    if let Err(err) = controller.process().await {
                        warn!(error = %err, "custom image controller pass failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "could not refresh api session"),
        }

        watchdog.disarm();

        // jittered sleep to keep replicas out of sync, checking for
        // termination every second
        let pause = rand::thread_rng().gen_range(2..5);
        for _ in 0..pause {
            if terminate.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    info!("worker shutting down");
    Ok(())
}

/// SIGTERM is what Kubernetes sends on pod shutdown; SIGINT covers running
/// in a terminal. Both finish the current pass before dropping out.
fn spawn_signal_listener(terminate: Arc<AtomicBool>) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, stopping worker"),
            _ = sigint.recv() => info!("received SIGINT, stopping worker"),
        }
        terminate.store(true, Ordering::SeqCst);
    });
    Ok(())
}
