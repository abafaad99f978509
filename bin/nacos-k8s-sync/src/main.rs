use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{stopped, Controller, Readiness};
use sync_kube::KubeWatchCache;
use sync_nacos::NacosClient;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{LogFormat, SyncConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SyncConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_format)?;

    info!(
        namespace = %config.watched_namespace,
        direction = %config.direction,
        nacos_namespace = %config.nacos.namespace_id,
        nacos_servers = ?config.nacos.servers,
        nacos_port = config.nacos.port,
        context_path = %config.nacos.context_path,
        max_attempts = config.controller.max_attempts,
        retry_delay_ms = config.controller.retry_delay.as_millis() as u64,
        "Starting nacos-k8s-sync"
    );

    let nacos = Arc::new(NacosClient::new(config.nacos.clone()).context("failed to create Nacos client")?);
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let (cache, watchers) = KubeWatchCache::new(client, &config.watched_namespace);
    let controller = Controller::new(config.controller.clone(), Arc::new(cache), nacos.clone());
    let queue = controller.queue();
    let readiness = controller.readiness();

    let (stop_tx, stop_rx) = watch::channel(false);
    let tasks = vec![
        ("watchers", tokio::spawn(watchers.run(queue, stop_rx.clone()))),
        ("heartbeats", tokio::spawn(nacos.run_heartbeats(stop_rx.clone()))),
        ("controller", tokio::spawn(controller.run(stop_rx.clone()))),
        ("readiness", tokio::spawn(report_readiness(readiness, stop_rx))),
    ];

    shutdown_signal().await?;
    info!("Shutdown signal received, stopping");
    let _ = stop_tx.send(true);

    for (name, task) in tasks {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Task did not stop cleanly");
        }
    }

    info!("nacos-k8s-sync stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    }
    .context("failed to install tracing subscriber")
}

/// Log once the controller has completed its first full pass
async fn report_readiness(readiness: Readiness<KubeWatchCache>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => return,
            _ = interval.tick() => {
                if readiness.has_synced() {
                    info!("Initial sync complete, controller is ready");
                    return;
                }
            }
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
