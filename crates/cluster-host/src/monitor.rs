use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use cluster_client::ClusterClient;
use cluster_protocol::{DeviceInfo, HostEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::devices::{DeviceDescriptor, DevicePool};
use crate::host::to_valid_tool_version;
use crate::run_target::run_target;

/// Periodically reports the host's full device inventory as `DeviceSnapshot` host events.
pub struct DeviceMonitor {
    config: Arc<HostConfig>,
    client: Arc<ClusterClient>,
    pool: Arc<DevicePool>,
    hostname: String,
    host_info_cmds: Vec<(String, Vec<String>)>,
    stop: CancellationToken,
    started: AtomicBool,
}

impl DeviceMonitor {
    pub fn new(
        config: Arc<HostConfig>,
        client: Arc<ClusterClient>,
        pool: Arc<DevicePool>,
        hostname: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let mut host_info_cmds = Vec::new();
        for (key, raw) in &config.device_monitor.host_info_cmds {
            let argv = shell_words::split(raw)
                .with_context(|| format!("invalid host info command {key}"))?;
            if argv.is_empty() {
                anyhow::bail!("host info command {key} is empty");
            }
            host_info_cmds.push((key.clone(), argv));
        }
        Ok(Self {
            config,
            client,
            pool,
            hostname: hostname.into(),
            host_info_cmds,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Spawns the snapshot loop. Returns `None` when disabled, stopped, or already started.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.config.device_monitor.disabled {
            tracing::info!("device monitor disabled");
            return None;
        }
        if self.stop.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let monitor = Arc::clone(self);
        let interval = self.config.device_monitor.interval();
        Some(tokio::spawn(async move {
            tracing::info!(interval = %humantime::format_duration(interval), "device monitor started");
            while !monitor.stop.is_cancelled() {
                monitor.dispatch().await;
                tokio::select! {
                    biased;
                    _ = monitor.stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!("device monitor stopped");
        }))
    }

    /// Ends the loop before its next sleep completes. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Posts one snapshot and flushes it.
    pub async fn dispatch(&self) {
        let tool_version = to_valid_tool_version(self.config.tool_version.as_deref());
        let device_to_group = self.config.device_to_group();
        let mut builder = HostEvent::builder()
            .hostname(self.hostname.clone())
            .tool_version(tool_version)
            .cluster(self.config.cluster_id.clone())
            .data(self.host_info().await);
        for device in self.pool.devices().await {
            let group_name = device_to_group.get(&device.serial).cloned();
            builder = builder.add_device_info(self.device_info(device, group_name));
        }
        let uploader = self.client.host_event_uploader();
        uploader.post_event(builder.build()).await;
        uploader.flush().await;
    }

    fn device_info(&self, device: DeviceDescriptor, group_name: Option<String>) -> DeviceInfo {
        let target = run_target(
            &device,
            self.config.run_target_format.as_deref(),
            &self.config.device_tag,
        );
        DeviceInfo {
            run_target: Some(target),
            build_id: Some(device.build_id),
            product: Some(device.product),
            product_variant: Some(device.product_variant),
            sdk_version: Some(device.sdk_version),
            battery_level: Some(device.battery_level),
            mac_address: Some(device.mac_address),
            sim_state: Some(device.sim_state),
            sim_operator: Some(device.sim_operator),
            state: device.state,
            group_name,
            device_serial: device.serial,
        }
    }

    async fn host_info(&self) -> BTreeMap<String, String> {
        let timeout = self.config.device_monitor.host_info_cmd_timeout();
        let mut data = BTreeMap::new();
        for (key, argv) in &self.host_info_cmds {
            let value =
                match system_utils::process::run_argv_with_timeout(argv, timeout, key).await {
                    Ok(output) if output.status.success() => {
                        String::from_utf8_lossy(&output.stdout).into_owned()
                    }
                    Ok(output) => String::from_utf8_lossy(&output.stderr).into_owned(),
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "host info command failed");
                        String::new()
                    }
                };
            data.insert(key.clone(), value);
        }
        data
    }
}
