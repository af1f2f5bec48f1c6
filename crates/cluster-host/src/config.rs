use anyhow::Context;
use cluster_client::UploaderOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 60;
const DEFAULT_HOST_INFO_CMD_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_BATCH_SIZE: usize = 200;
const DEFAULT_UPLOAD_INTERVAL_SECS: u64 = 60;
const DEFAULT_LIST_CMD_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RESULT_FILE_NAME: &str = "invocation_result.json";
const DEFAULT_JAVA_BIN: &str = "java";
const DEFAULT_MAIN_CLASS: &str = "com.android.tradefed.command.CommandRunner";
const DEFAULT_WORK_ROOT: &str = "/tmp/cluster-host";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub service_url: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub next_cluster_ids: Vec<String>,
    #[serde(default)]
    pub run_target_format: Option<String>,
    #[serde(default)]
    pub lease_host_commands: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub device_tag: BTreeMap<String, String>,
    #[serde(default)]
    pub device_group: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub device_monitor: DeviceMonitorConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceMonitorConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_host_info_cmd_timeout_secs")]
    pub host_info_cmd_timeout_secs: u64,
    #[serde(default)]
    pub host_info_cmds: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploaderConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_upload_interval_secs")]
    pub upload_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    #[serde(default)]
    pub list_cmd: Option<String>,
    #[serde(default = "default_list_cmd_timeout_secs")]
    pub list_cmd_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub runner: Vec<String>,
    #[serde(default = "default_result_file_name")]
    pub result_file_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub tf_path: Option<String>,
    #[serde(default = "default_java_bin")]
    pub java_bin: String,
    #[serde(default = "default_main_class")]
    pub main_class: String,
    #[serde(default = "default_work_root")]
    pub work_root: String,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for DeviceMonitorConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval_secs: DEFAULT_MONITOR_INTERVAL_SECS,
            host_info_cmd_timeout_secs: DEFAULT_HOST_INFO_CMD_TIMEOUT_SECS,
            host_info_cmds: BTreeMap::new(),
        }
    }
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            upload_interval_secs: DEFAULT_UPLOAD_INTERVAL_SECS,
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            list_cmd: None,
            list_cmd_timeout_secs: DEFAULT_LIST_CMD_TIMEOUT_SECS,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            runner: Vec::new(),
            result_file_name: default_result_file_name(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tf_path: None,
            java_bin: default_java_bin(),
            main_class: default_main_class(),
            work_root: default_work_root(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: HostConfig = toml::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.service_url.trim().is_empty() {
            anyhow::bail!("service_url is required");
        }
        if self.cluster_id.trim().is_empty() {
            anyhow::bail!("cluster_id is required");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be positive");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be positive");
        }
        if self.device_monitor.interval_secs == 0 {
            anyhow::bail!("device_monitor.interval_secs must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn uploader_options(&self) -> UploaderOptions {
        UploaderOptions {
            max_batch_size: self.uploader.max_batch_size,
            upload_interval: Duration::from_secs(self.uploader.upload_interval_secs),
        }
    }

    /// Group name per serial, inverted from `[device_group]`.
    pub fn device_to_group(&self) -> BTreeMap<String, String> {
        self.device_group
            .iter()
            .flat_map(|(group, serials)| {
                serials
                    .iter()
                    .map(move |serial| (serial.clone(), group.clone()))
            })
            .collect()
    }
}

impl DeviceMonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn host_info_cmd_timeout(&self) -> Duration {
        Duration::from_secs(self.host_info_cmd_timeout_secs)
    }
}

impl DevicesConfig {
    pub fn list_cmd_timeout(&self) -> Duration {
        Duration::from_secs(self.list_cmd_timeout_secs)
    }
}

impl LauncherConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn work_root(&self) -> PathBuf {
        system_utils::path::expand_tilde(&self.work_root)
    }
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_monitor_interval_secs() -> u64 {
    DEFAULT_MONITOR_INTERVAL_SECS
}

fn default_host_info_cmd_timeout_secs() -> u64 {
    DEFAULT_HOST_INFO_CMD_TIMEOUT_SECS
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_upload_interval_secs() -> u64 {
    DEFAULT_UPLOAD_INTERVAL_SECS
}

fn default_list_cmd_timeout_secs() -> u64 {
    DEFAULT_LIST_CMD_TIMEOUT_SECS
}

fn default_result_file_name() -> String {
    DEFAULT_RESULT_FILE_NAME.to_string()
}

fn default_java_bin() -> String {
    DEFAULT_JAVA_BIN.to_string()
}

fn default_main_class() -> String {
    DEFAULT_MAIN_CLASS.to_string()
}

fn default_work_root() -> String {
    DEFAULT_WORK_ROOT.to_string()
}

fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}
