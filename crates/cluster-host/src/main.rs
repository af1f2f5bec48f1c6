use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cluster_client::ClusterClient;
use cluster_host::cli::Args;
use cluster_host::config::HostConfig;
use cluster_host::devices::{CommandDeviceLister, DeviceLister, DevicePool, EmptyDeviceLister};
use cluster_host::executor::{CommandExecutor, LocalExecutor};
use cluster_host::heartbeat::HeartbeatPool;
use cluster_host::host::host_name;
use cluster_host::launcher::{CommandLauncher, LaunchConfig};
use cluster_host::logging::init_tracing;
use cluster_host::monitor::DeviceMonitor;
use cluster_host::scheduler::ClusterCommandScheduler;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(
        HostConfig::load(&args.config)
            .with_context(|| format!("failed to load config {}", args.config.display()))?,
    );
    let log_dir = system_utils::path::expand_tilde(&args.log_dir);
    let _file_guard = init_tracing(&log_dir, args.log_to_stderr)?;

    let hostname = host_name();
    let client = Arc::new(
        ClusterClient::from_service_url(&config.service_url, config.uploader_options())
            .context("failed to build cluster client")?,
    );
    let lister: Arc<dyn DeviceLister> = match config.devices.list_cmd.as_deref() {
        Some(list_cmd) => Arc::new(CommandDeviceLister::new(
            list_cmd,
            config.devices.list_cmd_timeout(),
        )?),
        None => {
            tracing::warn!("devices.list_cmd is not set, host has no devices");
            Arc::new(EmptyDeviceLister)
        }
    };
    let pool = Arc::new(DevicePool::new(lister));
    let launcher = Arc::new(CommandLauncher::new(LaunchConfig::from_config(
        &config.launcher,
    )));
    let executor = Arc::new(LocalExecutor::new(
        &config,
        Arc::clone(&pool),
        Arc::clone(&client),
        launcher,
    ));
    let heartbeat_pool = Arc::new(HeartbeatPool::new());
    let scheduler = ClusterCommandScheduler::new(
        Arc::clone(&config),
        Arc::clone(&client),
        Arc::clone(&pool),
        Arc::clone(&executor) as Arc<dyn CommandExecutor>,
        heartbeat_pool,
        hostname,
    );
    let monitor = Arc::new(
        DeviceMonitor::new(Arc::clone(&config), Arc::clone(&client), pool, hostname)
            .context("failed to build device monitor")?,
    );
    tracing::info!(
        cluster = %config.cluster_id,
        hostname,
        service_url = %config.service_url,
        "cluster-host starting"
    );

    let monitor_task = monitor.start();
    if args.once {
        scheduler.process_ready_commands().await;
        executor.wait_idle().await;
    } else {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
            }
            signal.cancel();
        });
        scheduler.run(shutdown).await;
    }

    tracing::info!("cluster-host shutting down");
    monitor.stop();
    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    scheduler.shutdown();
    executor.wait_idle().await;
    client.command_event_uploader().flush().await;
    client.host_event_uploader().flush().await;
    Ok(())
}
