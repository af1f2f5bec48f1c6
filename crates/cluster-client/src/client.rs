use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use cluster_protocol::{
    ClusterCommand, CommandEvent, DeviceInfo, EnvVar, HostEvent, HostLeaseRequest,
    LeaseResponse, TestEnvironment, TestResource,
};
use reqwest::Method;
use serde::Deserialize;

use crate::api::{ApiHelper, RestApiHelper};
use crate::uploader::{EventUploader, UploaderOptions};

#[derive(Debug, Deserialize)]
struct RawTestEnvironment {
    #[serde(default)]
    env_vars: Option<Vec<EnvVar>>,
    #[serde(default)]
    setup_scripts: Option<Vec<String>>,
    #[serde(default)]
    output_file_patterns: Option<Vec<String>>,
    #[serde(default)]
    output_file_upload_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTestResources {
    #[serde(default)]
    test_resources: Option<Vec<TestResource>>,
}

/// Typed client for the cluster coordinator.
pub struct ClusterClient {
    api: Arc<dyn ApiHelper>,
    uploader_options: UploaderOptions,
    command_uploader: OnceLock<Arc<EventUploader<CommandEvent>>>,
    host_uploader: OnceLock<Arc<EventUploader<HostEvent>>>,
}

impl ClusterClient {
    pub fn new(api: Arc<dyn ApiHelper>, uploader_options: UploaderOptions) -> Self {
        Self {
            api,
            uploader_options,
            command_uploader: OnceLock::new(),
            host_uploader: OnceLock::new(),
        }
    }

    pub fn from_service_url(
        service_url: &str,
        uploader_options: UploaderOptions,
    ) -> anyhow::Result<Self> {
        let api = RestApiHelper::new(service_url)?;
        Ok(Self::new(Arc::new(api), uploader_options))
    }

    /// Leases up to `count` commands for one run target. Never fails: any error yields no work.
    pub async fn lease_commands(
        &self,
        cluster_id: &str,
        run_target: &str,
        count: usize,
        next_cluster_ids: &[String],
    ) -> Vec<ClusterCommand> {
        let mut query = vec![("num_tasks".to_string(), count.to_string())];
        query.extend(
            next_cluster_ids
                .iter()
                .map(|id| ("next_cluster_ids".to_string(), id.clone())),
        );
        let response = self
            .api
            .execute(
                Method::GET,
                &["tasks", "lease", cluster_id, run_target],
                &query,
                None,
            )
            .await;
        match response {
            Ok(body) => parse_command_tasks(&body),
            Err(err) => {
                tracing::warn!(
                    cluster = cluster_id,
                    run_target = run_target,
                    error = %err,
                    "failed to lease commands"
                );
                Vec::new()
            }
        }
    }

    /// Leases commands for the whole host given its full device inventory. Never fails.
    pub async fn lease_host_commands(
        &self,
        cluster_id: &str,
        hostname: &str,
        device_infos: Vec<DeviceInfo>,
        next_cluster_ids: &[String],
    ) -> Vec<ClusterCommand> {
        let request = HostLeaseRequest {
            next_cluster_ids: next_cluster_ids.to_vec(),
            device_infos,
        };
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize host lease request");
                return Vec::new();
            }
        };
        let query = [
            ("cluster".to_string(), cluster_id.to_string()),
            ("hostname".to_string(), hostname.to_string()),
        ];
        let response = self
            .api
            .execute(
                Method::POST,
                &["tasks", "leasehosttasks"],
                &query,
                Some(&body),
            )
            .await;
        match response {
            Ok(body) => parse_command_tasks(&body),
            Err(err) => {
                tracing::warn!(
                    cluster = cluster_id,
                    hostname = hostname,
                    error = %err,
                    "failed to lease host commands"
                );
                Vec::new()
            }
        }
    }

    pub async fn get_test_environment(&self, request_id: &str) -> anyhow::Result<TestEnvironment> {
        let body = self
            .api
            .execute(
                Method::GET,
                &["requests", request_id, "test_environment"],
                &[],
                None,
            )
            .await
            .with_context(|| format!("failed to fetch test environment for {request_id}"))?;
        tracing::debug!(request_id, body = %body, "test environment response");
        let raw: RawTestEnvironment = serde_json::from_str(&body)
            .with_context(|| format!("invalid test environment for {request_id}"))?;

        let mut environment = TestEnvironment::default();
        match raw.env_vars {
            Some(vars) => environment.env_vars = vars,
            None => tracing::warn!(request_id, "env_vars is null"),
        }
        match raw.setup_scripts {
            Some(scripts) => environment.setup_scripts = scripts,
            None => tracing::warn!(request_id, "setup_scripts is null"),
        }
        match raw.output_file_patterns {
            Some(patterns) => environment.output_file_patterns = patterns,
            None => tracing::warn!(request_id, "output_file_patterns is null"),
        }
        match raw.output_file_upload_url {
            Some(url) => environment.output_file_upload_url = Some(url),
            None => tracing::warn!(request_id, "output_file_upload_url is null"),
        }
        Ok(environment)
    }

    pub async fn get_test_resources(&self, request_id: &str) -> anyhow::Result<Vec<TestResource>> {
        let body = self
            .api
            .execute(
                Method::GET,
                &["requests", request_id, "test_resources"],
                &[],
                None,
            )
            .await
            .with_context(|| format!("failed to fetch test resources for {request_id}"))?;
        let raw: RawTestResources = serde_json::from_str(&body)
            .with_context(|| format!("invalid test resources for {request_id}"))?;
        Ok(raw.test_resources.unwrap_or_else(|| {
            tracing::warn!(request_id, "test_resources is null");
            Vec::new()
        }))
    }

    pub fn command_event_uploader(&self) -> Arc<EventUploader<CommandEvent>> {
        Arc::clone(self.command_uploader.get_or_init(|| {
            Arc::new(EventUploader::new(
                Arc::clone(&self.api),
                self.uploader_options,
            ))
        }))
    }

    pub fn host_event_uploader(&self) -> Arc<EventUploader<HostEvent>> {
        Arc::clone(self.host_uploader.get_or_init(|| {
            Arc::new(EventUploader::new(
                Arc::clone(&self.api),
                self.uploader_options,
            ))
        }))
    }

    /// Materializes one test resource at `dest`.
    ///
    /// `http://` and `https://` are fetched, `file://` URLs and bare paths are copied.
    pub async fn download_resource(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.api.fetch_url(url, dest).await;
        }
        let source = match url.strip_prefix("file://") {
            Some(path) => path,
            None if !url.contains("://") => url,
            None => anyhow::bail!("unsupported resource url {url}"),
        };
        tokio::fs::copy(source, dest)
            .await
            .with_context(|| format!("failed to copy {source} to {}", dest.display()))?;
        Ok(())
    }

    pub async fn upload_file(&self, url: &str, path: &Path) -> anyhow::Result<()> {
        self.api.put_url(url, path).await
    }
}

fn parse_command_tasks(body: &str) -> Vec<ClusterCommand> {
    match serde_json::from_str::<LeaseResponse>(body) {
        Ok(response) => response
            .tasks
            .unwrap_or_default()
            .into_iter()
            .map(|task| task.into_command())
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, body, "failed to parse lease response");
            Vec::new()
        }
    }
}
