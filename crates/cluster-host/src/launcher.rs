use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use regex::{Captures, Regex};
use tokio::process::Command;

use crate::config::LauncherConfig;

const GLOBAL_CONFIG_VAR: &str = "TF_GLOBAL_CONFIG";
const LOG_DIR: &str = "logs";
const STDOUT_FILE: &str = "stdout.txt";
const STDERR_FILE: &str = "stderr.txt";

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub tf_path: Option<PathBuf>,
    pub java_bin: String,
    pub main_class: String,
    pub command_timeout: Duration,
}

impl LaunchConfig {
    pub fn from_config(config: &LauncherConfig) -> Self {
        Self {
            tf_path: config
                .tf_path
                .as_deref()
                .map(system_utils::path::expand_tilde),
            java_bin: config.java_bin.clone(),
            main_class: config.main_class.clone(),
            command_timeout: config.command_timeout(),
        }
    }
}

/// Everything needed to run one managed command in its own work directory.
#[derive(Debug, Clone, Default)]
pub struct ManagedLaunch {
    pub root_dir: PathBuf,
    pub env_vars: Vec<(String, String)>,
    pub setup_scripts: Vec<String>,
    pub command_line: String,
    pub output_file_patterns: Vec<String>,
    pub output_file_upload_url: Option<String>,
}

/// Runs managed commands as separate processes.
pub struct CommandLauncher {
    config: LaunchConfig,
}

impl CommandLauncher {
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    /// Runs `launch` to completion. `extra_env` is applied after the launch's own variables.
    pub async fn run(
        &self,
        launch: &ManagedLaunch,
        extra_env: &[(String, String)],
    ) -> anyhow::Result<()> {
        let tf_path = self
            .config
            .tf_path
            .as_deref()
            .context("launcher.tf_path is not configured")?;
        let classpath = build_classpath(tf_path)?;
        let args = shell_words::split(&launch.command_line)
            .with_context(|| format!("invalid command line {}", launch.command_line))?;
        if !launch.setup_scripts.is_empty() {
            tracing::debug!(scripts = ?launch.setup_scripts, "setup scripts left to the runner");
        }

        let mut cmd = Command::new(&self.config.java_bin);
        cmd.arg("-cp")
            .arg(&classpath)
            .arg(&self.config.main_class)
            .args(&args)
            .current_dir(&launch.root_dir)
            .envs(expand_env_vars(&launch.env_vars))
            .envs(extra_env.iter().map(|(key, value)| (key, value)))
            .env_remove(GLOBAL_CONFIG_VAR);
        tracing::info!(
            root = %launch.root_dir.display(),
            command_line = %launch.command_line,
            "launching managed command"
        );
        run_logged(cmd, &launch.root_dir, self.config.command_timeout).await
    }
}

/// Every `*.jar` directly inside `dir`, sorted, followed by `dir` itself.
pub fn build_classpath(dir: &Path) -> anyhow::Result<String> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read classpath dir {}", dir.display()))?;
    let mut jars = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "jar") {
            jars.push(path);
        }
    }
    jars.sort();
    jars.push(dir.to_path_buf());
    let parts: Vec<_> = jars
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    Ok(parts.join(":"))
}

fn env_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("env reference pattern should compile"))
}

/// Expands `${name}` references against the raw values of `vars`, once, without recursion.
///
/// Unknown names expand to the empty string.
pub fn expand_env_vars(vars: &[(String, String)]) -> Vec<(String, String)> {
    let raw: HashMap<&str, &str> = vars
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    vars.iter()
        .map(|(key, value)| {
            let expanded = env_ref_pattern().replace_all(value, |caps: &Captures<'_>| {
                raw.get(&caps[1]).copied().unwrap_or_default().to_string()
            });
            (key.clone(), expanded.into_owned())
        })
        .collect()
}

/// Runs `cmd` with stdout and stderr redirected into `<root>/logs/`.
///
/// The log handles are released once the child is spawned. On timeout the child is killed
/// and stderr is left unread.
pub(crate) async fn run_logged(
    mut cmd: Command,
    root: &Path,
    command_timeout: Duration,
) -> anyhow::Result<()> {
    let log_dir = root.join(LOG_DIR);
    tokio::fs::create_dir_all(&log_dir)
        .await
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    let stdout_path = log_dir.join(STDOUT_FILE);
    let stderr_path = log_dir.join(STDERR_FILE);
    let stdout = std::fs::File::create(&stdout_path)
        .with_context(|| format!("failed to create {}", stdout_path.display()))?;
    let stderr = std::fs::File::create(&stderr_path)
        .with_context(|| format!("failed to create {}", stderr_path.display()))?;

    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    let spawned = cmd.spawn();
    drop(cmd);
    let mut child = spawned.context("failed to spawn command")?;

    let outcome = tokio::time::timeout(command_timeout, child.wait()).await;
    match outcome {
        Err(_) => {
            let _ = child.kill().await;
            anyhow::bail!(
                "command timeout after {}",
                humantime::format_duration(command_timeout)
            )
        }
        Ok(status) => {
            let status = status.context("failed to wait for command")?;
            if status.success() {
                return Ok(());
            }
            let stderr = tokio::fs::read_to_string(&stderr_path)
                .await
                .unwrap_or_default();
            anyhow::bail!("command failed with {status}: {}", stderr.trim())
        }
    }
}
