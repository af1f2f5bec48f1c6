use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cluster_client::ClusterClient;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::task::TaskTracker;

use crate::config::HostConfig;
use crate::devices::DevicePool;
use crate::handler::{InvocationContext, InvocationListener};
use crate::launcher::{self, CommandLauncher, ManagedLaunch};
use crate::managed;

pub const SERIAL_FLAG: &str = "--serial";
pub const DRY_RUN_FLAG: &str = "--dry-run";
pub const RESULT_FILE_ENV: &str = "CLUSTER_RESULT_FILE";

/// A command that cannot run as written. Reported to the coordinator as a configuration error.
#[derive(Debug, Clone)]
pub struct ConfigurationError {
    pub message: String,
}

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConfigurationError {}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub task_id: String,
    pub attempt_id: String,
    /// Tokenized command line followed by the candidate `--serial` pairs.
    pub args: Vec<String>,
    pub managed: Option<ManagedLaunch>,
}

/// Runs invocations on local devices.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Checks a command without touching any device.
    fn validate(&self, args: &[String]) -> anyhow::Result<()>;

    /// Allocates a device and starts the invocation in the background.
    ///
    /// Fails with `NoDeviceError` when no candidate can be allocated; the listener is not called
    /// in that case.
    async fn exec_command(
        &self,
        listener: Arc<dyn InvocationListener>,
        request: InvocationRequest,
    ) -> anyhow::Result<()>;
}

pub fn is_dry_run(args: &[String]) -> bool {
    args.iter().any(|arg| arg == DRY_RUN_FLAG)
}

pub fn validate_args(args: &[String]) -> anyhow::Result<()> {
    let Some(first) = args.first() else {
        return Err(ConfigurationError::new("empty command line").into());
    };
    if first.starts_with('-') {
        return Err(ConfigurationError::new(format!(
            "command line must start with a config name, got {first}"
        ))
        .into());
    }
    split_serials(args).map(|_| ())
}

/// Separates `--serial <value>` pairs from the rest of `args`.
pub fn split_serials(args: &[String]) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let mut rest = Vec::with_capacity(args.len());
    let mut serials = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg != SERIAL_FLAG {
            rest.push(arg.clone());
            continue;
        }
        match iter.next() {
            Some(serial) if !serial.starts_with('-') => serials.push(serial.clone()),
            _ => return Err(ConfigurationError::new("--serial requires a value").into()),
        }
    }
    Ok((rest, serials))
}

#[derive(Debug, Default, Deserialize)]
struct InvocationResult {
    #[serde(default)]
    total_tests: u64,
    #[serde(default)]
    failed_tests: u64,
    #[serde(default)]
    summaries: Vec<String>,
}

async fn read_result(path: &Path) -> Option<InvocationResult> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(result) => Some(result),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring malformed result file");
            None
        }
    }
}

/// Default executor: runs unmanaged commands through the configured runner and managed ones
/// through the command launcher.
pub struct LocalExecutor {
    pool: Arc<DevicePool>,
    client: Arc<ClusterClient>,
    launcher: Arc<CommandLauncher>,
    runner: Arc<Vec<String>>,
    result_file_name: String,
    work_root: PathBuf,
    command_timeout: Duration,
    tasks: TaskTracker,
}

impl LocalExecutor {
    pub fn new(
        config: &HostConfig,
        pool: Arc<DevicePool>,
        client: Arc<ClusterClient>,
        launcher: Arc<CommandLauncher>,
    ) -> Self {
        Self {
            pool,
            client,
            launcher,
            runner: Arc::new(config.executor.runner.clone()),
            result_file_name: config.executor.result_file_name.clone(),
            work_root: config.launcher.work_root(),
            command_timeout: config.launcher.command_timeout(),
            tasks: TaskTracker::new(),
        }
    }

    /// Waits until every invocation started so far has completed.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    fn validate(&self, args: &[String]) -> anyhow::Result<()> {
        validate_args(args)
    }

    async fn exec_command(
        &self,
        listener: Arc<dyn InvocationListener>,
        request: InvocationRequest,
    ) -> anyhow::Result<()> {
        let (args, candidates) = split_serials(&request.args)?;
        let serial = self.pool.allocate(&candidates).await?;
        tracing::info!(task_id = %request.task_id, serial = %serial, "invocation allocated");

        let root = match &request.managed {
            Some(launch) => launch.root_dir.clone(),
            None => self.work_root.join(&request.attempt_id),
        };
        let invocation = Invocation {
            pool: Arc::clone(&self.pool),
            client: Arc::clone(&self.client),
            launcher: Arc::clone(&self.launcher),
            runner: Arc::clone(&self.runner),
            result_file: root.join(&self.result_file_name),
            root,
            command_timeout: self.command_timeout,
            request: InvocationRequest { args, ..request },
            serial,
        };
        self.tasks.spawn(invocation.run(listener));
        Ok(())
    }
}

struct Invocation {
    pool: Arc<DevicePool>,
    client: Arc<ClusterClient>,
    launcher: Arc<CommandLauncher>,
    runner: Arc<Vec<String>>,
    root: PathBuf,
    result_file: PathBuf,
    command_timeout: Duration,
    request: InvocationRequest,
    serial: String,
}

impl Invocation {
    async fn run(self, listener: Arc<dyn InvocationListener>) {
        let context = InvocationContext::for_device(&self.serial);
        let started = Instant::now();
        listener.invocation_started(&context).await;

        let outcome = match &self.request.managed {
            Some(launch) => self.run_managed(launch).await,
            None => self.run_unmanaged().await,
        };
        if let Err(err) = outcome {
            tracing::warn!(
                task_id = %self.request.task_id,
                serial = %self.serial,
                error = %format!("{err:#}"),
                "invocation failed"
            );
            listener.invocation_failed(&format!("{err:#}")).await;
        }
        if let Some(result) = read_result(&self.result_file).await {
            if !result.summaries.is_empty() {
                listener.put_summary(&result.summaries).await;
            }
            listener
                .set_test_counts(result.total_tests, result.failed_tests)
                .await;
        }

        listener.invocation_ended(started.elapsed()).await;
        self.pool.release(&self.serial);
        listener.invocation_complete(Some(&context)).await;
    }

    async fn run_unmanaged(&self) -> anyhow::Result<()> {
        let Some((program, runner_args)) = self.runner.split_first() else {
            anyhow::bail!("executor.runner is not configured");
        };
        let mut cmd = Command::new(program);
        cmd.args(runner_args)
            .args(&self.request.args)
            .arg(SERIAL_FLAG)
            .arg(&self.serial)
            .current_dir(&self.root)
            .env(RESULT_FILE_ENV, &self.result_file);
        tokio::fs::create_dir_all(&self.root).await?;
        launcher::run_logged(cmd, &self.root, self.command_timeout).await
    }

    async fn run_managed(&self, launch: &ManagedLaunch) -> anyhow::Result<()> {
        let mut launch = launch.clone();
        launch.command_line = format!(
            "{} {SERIAL_FLAG} {}",
            launch.command_line,
            shell_words::quote(&self.serial)
        );
        let result_env = [(
            RESULT_FILE_ENV.to_string(),
            self.result_file.to_string_lossy().into_owned(),
        )];
        let outcome = self.launcher.run(&launch, &result_env).await;
        let uploaded = managed::upload_outputs(&self.client, &launch, &self.request.attempt_id).await;
        if uploaded > 0 {
            tracing::info!(attempt_id = %self.request.attempt_id, uploaded, "output files uploaded");
        }
        outcome
    }
}
