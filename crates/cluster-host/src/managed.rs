use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use cluster_client::ClusterClient;
use cluster_protocol::ClusterCommand;
use regex::Regex;
use walkdir::WalkDir;

use crate::executor::ConfigurationError;
use crate::launcher::ManagedLaunch;

/// Builds the work directory of a managed command from its request's environment and resources.
pub async fn prepare_launch(
    client: &ClusterClient,
    command: &ClusterCommand,
    work_root: &Path,
) -> anyhow::Result<ManagedLaunch> {
    let root_dir = work_root.join(command.attempt_id());
    if tokio::fs::try_exists(&root_dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&root_dir)
            .await
            .with_context(|| format!("failed to clear {}", root_dir.display()))?;
    }
    tokio::fs::create_dir_all(&root_dir)
        .await
        .with_context(|| format!("failed to create {}", root_dir.display()))?;

    let environment = client.get_test_environment(command.request_id()).await?;
    let resources = client.get_test_resources(command.request_id()).await?;
    for resource in &resources {
        let dest = resource_path(&root_dir, &resource.name)?;
        tracing::debug!(name = %resource.name, url = %resource.url, "downloading test resource");
        client
            .download_resource(&resource.url, &dest)
            .await
            .with_context(|| format!("failed to download test resource {}", resource.name))?;
    }

    Ok(ManagedLaunch {
        root_dir,
        env_vars: environment
            .env_vars
            .into_iter()
            .map(|var| (var.key, var.value))
            .collect(),
        setup_scripts: environment.setup_scripts,
        command_line: command.command_line().to_string(),
        output_file_patterns: environment.output_file_patterns,
        output_file_upload_url: environment.output_file_upload_url,
    })
}

fn resource_path(root: &Path, name: &str) -> anyhow::Result<PathBuf> {
    let relative = Path::new(name);
    let contained = !name.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !contained {
        return Err(ConfigurationError::new(format!("invalid test resource name {name:?}")).into());
    }
    Ok(root.join(relative))
}

/// Uploads every file under the launch root whose relative path fully matches an output
/// pattern. Returns how many files were uploaded; failures are only logged.
pub async fn upload_outputs(client: &ClusterClient, launch: &ManagedLaunch, attempt_id: &str) -> usize {
    let Some(base_url) = launch.output_file_upload_url.as_deref() else {
        return 0;
    };
    let mut patterns = Vec::new();
    for pattern in &launch.output_file_patterns {
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => patterns.push(regex),
            Err(err) => tracing::warn!(pattern, error = %err, "ignoring invalid output file pattern"),
        }
    }
    if patterns.is_empty() {
        return 0;
    }

    let root = launch.root_dir.clone();
    let files = match tokio::task::spawn_blocking(move || matching_files(&root, &patterns)).await {
        Ok(files) => files,
        Err(err) => {
            tracing::warn!(error = %err, "output file scan failed");
            return 0;
        }
    };

    let base_url = base_url.trim_end_matches('/');
    let mut uploaded = 0;
    for relative in files {
        let url = format!("{base_url}/{attempt_id}/{relative}");
        let path = launch.root_dir.join(&relative);
        match client.upload_file(&url, &path).await {
            Ok(()) => uploaded += 1,
            Err(err) => tracing::warn!(file = %relative, error = %err, "failed to upload output file"),
        }
    }
    uploaded
}

fn matching_files(root: &Path, patterns: &[Regex]) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable output entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if patterns.iter().any(|pattern| pattern.is_match(&relative)) {
            files.push(relative);
        }
    }
    files
}
