use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_client::ClusterClient;
use cluster_protocol::events::DATA_KEY_ERROR;
use cluster_protocol::{
    ClusterCommand, CommandEvent, CommandEventType, DeviceAllocationState, DeviceInfo,
    RequestType, UNKNOWN_DEVICE,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::devices::{is_ip_port, DeviceDescriptor, DevicePool, NoDeviceError};
use crate::executor::{
    is_dry_run, CommandExecutor, ConfigurationError, InvocationRequest, SERIAL_FLAG,
};
use crate::handler::{BuildInfo, InvocationContext, InvocationEventHandler, InvocationListener};
use crate::heartbeat::HeartbeatPool;
use crate::managed;
use crate::run_target::run_target;

const DRY_RUN_BUILD_ID: &str = "stub";

/// Leases commands from the coordinator for this host's free devices and dispatches them.
pub struct ClusterCommandScheduler {
    config: Arc<HostConfig>,
    client: Arc<ClusterClient>,
    pool: Arc<DevicePool>,
    executor: Arc<dyn CommandExecutor>,
    heartbeat_pool: Arc<HeartbeatPool>,
    hostname: String,
    shutting_down: AtomicBool,
}

impl ClusterCommandScheduler {
    pub fn new(
        config: Arc<HostConfig>,
        client: Arc<ClusterClient>,
        pool: Arc<DevicePool>,
        executor: Arc<dyn CommandExecutor>,
        heartbeat_pool: Arc<HeartbeatPool>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            config,
            client,
            pool,
            executor,
            heartbeat_pool,
            hostname: hostname.into(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Polls every `poll_interval` until `shutdown` fires. A running cycle always completes.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.process_ready_commands().await,
            }
        }
        tracing::info!("scheduler loop stopped");
    }

    /// Stops leasing new work and cancels outstanding heartbeats. In-flight invocations keep
    /// running.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            self.heartbeat_pool.shutdown();
            tracing::info!("scheduler shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// One scheduling cycle.
    pub async fn process_ready_commands(&self) {
        if self.is_shutting_down() {
            return;
        }
        let available = self.devices(true).await;
        if available.is_empty() {
            tracing::debug!("no available devices, skipping lease");
            return;
        }
        let commands = if self.config.lease_host_commands {
            let all = self.devices(false).await;
            self.fetch_host_commands(&all).await
        } else {
            self.fetch_commands(&available).await
        };
        if commands.is_empty() {
            tracing::debug!("no commands leased");
            return;
        }
        tracing::info!(count = commands.len(), "leased commands");
        self.exec_commands(commands).await;
    }

    /// Physical devices grouped by run target, optionally only those available.
    pub async fn devices(&self, available_only: bool) -> BTreeMap<String, Vec<DeviceDescriptor>> {
        let mut groups: BTreeMap<String, Vec<DeviceDescriptor>> = BTreeMap::new();
        for device in self.pool.devices().await {
            if is_ip_port(&device.serial) {
                continue;
            }
            if available_only && device.state != DeviceAllocationState::Available {
                continue;
            }
            let target = run_target(
                &device,
                self.config.run_target_format.as_deref(),
                &self.config.device_tag,
            );
            groups.entry(target).or_default().push(device);
        }
        groups
    }

    async fn fetch_commands(
        &self,
        groups: &BTreeMap<String, Vec<DeviceDescriptor>>,
    ) -> Vec<ClusterCommand> {
        let mut commands = Vec::new();
        for (target, devices) in groups {
            if target == UNKNOWN_DEVICE {
                tracing::debug!(count = devices.len(), "skipping devices with unknown run target");
                continue;
            }
            let count = lease_count(devices.len());
            let serials: Vec<String> = devices.iter().map(|device| device.serial.clone()).collect();
            let leased = self
                .client
                .lease_commands(
                    &self.config.cluster_id,
                    target,
                    count,
                    &self.config.next_cluster_ids,
                )
                .await;
            commands.extend(leased.into_iter().map(|mut command| {
                command.set_target_device_serials(serials.clone());
                command
            }));
        }
        commands
    }

    async fn fetch_host_commands(
        &self,
        groups: &BTreeMap<String, Vec<DeviceDescriptor>>,
    ) -> Vec<ClusterCommand> {
        let device_to_group = self.config.device_to_group();
        let device_infos = groups
            .iter()
            .flat_map(|(target, devices)| {
                devices.iter().map(|device| DeviceInfo {
                    device_serial: device.serial.clone(),
                    run_target: Some(target.clone()),
                    state: device.state,
                    group_name: device_to_group.get(&device.serial).cloned(),
                    ..DeviceInfo::default()
                })
            })
            .collect();
        self.client
            .lease_host_commands(
                &self.config.cluster_id,
                &self.hostname,
                device_infos,
                &self.config.next_cluster_ids,
            )
            .await
    }

    async fn exec_commands(&self, commands: Vec<ClusterCommand>) {
        let uploader = self.client.command_event_uploader();
        for command in commands {
            let handler = Arc::new(InvocationEventHandler::new(
                command.clone(),
                self.hostname.clone(),
                Arc::clone(&uploader),
                Arc::clone(&self.heartbeat_pool),
                self.config.heartbeat_interval(),
            ));
            let Err(err) = self.execute(&command, handler).await else {
                continue;
            };
            let event = CommandEvent::builder(&command).hostname(self.hostname.clone());
            let event = if err.downcast_ref::<NoDeviceError>().is_some() {
                tracing::warn!(task_id = %command.task_id(), error = %err, "device allocation failed");
                event.event_type(CommandEventType::AllocationFailed)
            } else {
                tracing::warn!(task_id = %command.task_id(), error = %format!("{err:#}"), "command failed to start");
                event
                    .event_type(CommandEventType::ConfigurationError)
                    .set_data(DATA_KEY_ERROR, Some(format!("{err:#}")))
            };
            uploader.post_event(event.build()).await;
            uploader.flush().await;
        }
    }

    async fn execute(
        &self,
        command: &ClusterCommand,
        handler: Arc<InvocationEventHandler>,
    ) -> anyhow::Result<()> {
        let mut args = shell_words::split(command.command_line())
            .map_err(|err| ConfigurationError::new(format!("invalid command line: {err}")))?;
        if is_dry_run(&args) {
            return self.dry_run(&handler, &args).await;
        }
        for serial in command.target_device_serials() {
            args.push(SERIAL_FLAG.to_string());
            args.push(serial.clone());
        }
        let managed = match command.request_type() {
            RequestType::Unmanaged => None,
            RequestType::Managed => Some(
                managed::prepare_launch(&self.client, command, &self.config.launcher.work_root())
                    .await?,
            ),
        };
        let request = InvocationRequest {
            task_id: command.task_id().to_string(),
            attempt_id: command.attempt_id().to_string(),
            args,
            managed,
        };
        self.executor.exec_command(handler, request).await
    }

    async fn dry_run(&self, handler: &InvocationEventHandler, args: &[String]) -> anyhow::Result<()> {
        let context = InvocationContext {
            device_serial: None,
            build: Some(BuildInfo {
                build_id: DRY_RUN_BUILD_ID.to_string(),
                device_serial: None,
            }),
        };
        handler.invocation_started(&context).await;
        if let Err(err) = self.executor.validate(args) {
            handler.cancel_heartbeat();
            return Err(err);
        }
        handler.invocation_ended(Duration::ZERO).await;
        handler.invocation_complete(None).await;
        Ok(())
    }
}

/// Asks for half of the free devices, at least one.
pub fn lease_count(free_devices: usize) -> usize {
    (free_devices / 2).max(1)
}
