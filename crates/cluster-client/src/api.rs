use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Method, Url};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_RPC_TIMEOUT: Duration = Duration::from_secs(60);
/// Longest gap between two body chunks of a file transfer.
pub const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport seam between the typed client and the coordinator.
#[async_trait]
pub trait ApiHelper: Send + Sync {
    /// Sends one request to `<base>/<path...>` and returns the response body.
    ///
    /// Every path segment is percent-encoded on its own. Query pairs keep their order and may
    /// repeat a key. Non-2xx statuses are errors.
    async fn execute(
        &self,
        method: Method,
        path: &[&str],
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> anyhow::Result<String>;

    /// Downloads an absolute URL into `dest`, replacing its contents.
    async fn fetch_url(&self, url: &str, dest: &Path) -> anyhow::Result<()>;

    /// Uploads the file at `path` to an absolute URL with PUT.
    async fn put_url(&self, url: &str, path: &Path) -> anyhow::Result<()>;
}

pub struct RestApiHelper {
    base_url: Url,
    client: Client,
}

impl RestApiHelper {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        if base_url.trim().is_empty() {
            anyhow::bail!("service url is empty");
        }
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid service url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("service url {base_url} cannot be used as a base");
        }
        // File transfers have no total deadline; coordinator calls set one per request.
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self { base_url, client })
    }

    fn build_url(&self, path: &[&str], query: &[(String, String)]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow::anyhow!("service url cannot be a base"))?;
            segments.pop_if_empty();
            segments.extend(path);
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ApiHelper for RestApiHelper {
    async fn execute(
        &self,
        method: Method,
        path: &[&str],
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> anyhow::Result<String> {
        let url = self.build_url(path, query)?;
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .timeout(HTTP_RPC_TIMEOUT)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{method} {url} failed"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("failed to read {method} {url} response"))?;
        if !status.is_success() {
            anyhow::bail!("{method} {url} returned status {status}: {text}");
        }
        Ok(text)
    }

    async fn fetch_url(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url} returned status {status}");
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let copied = async {
            loop {
                let chunk = tokio::time::timeout(TRANSFER_IDLE_TIMEOUT, response.chunk())
                    .await
                    .map_err(|_| {
                        anyhow::anyhow!(
                            "GET {url} stalled for {}",
                            humantime::format_duration(TRANSFER_IDLE_TIMEOUT)
                        )
                    })?
                    .with_context(|| format!("failed to read GET {url} body"))?;
                let Some(chunk) = chunk else {
                    break;
                };
                file.write_all(&chunk)
                    .await
                    .with_context(|| format!("failed to write {}", dest.display()))?;
            }
            file.flush()
                .await
                .with_context(|| format!("failed to write {}", dest.display()))
        }
        .await;
        if copied.is_err() {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
        }
        copied
    }

    async fn put_url(&self, url: &str, path: &Path) -> anyhow::Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .with_context(|| format!("PUT {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("PUT {url} returned status {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_or_relative_base() {
        assert!(RestApiHelper::new("").is_err());
        assert!(RestApiHelper::new("not a url").is_err());
    }

    #[test]
    fn builds_encoded_path_and_repeated_query() {
        let helper = RestApiHelper::new("http://localhost:8080/api/v1/").expect("helper");
        let url = helper
            .build_url(
                &["tasks", "lease", "lab a", "taimen:userdebug"],
                &[
                    ("num_tasks".to_string(), "5".to_string()),
                    ("next_cluster_ids".to_string(), "b".to_string()),
                    ("next_cluster_ids".to_string(), "c".to_string()),
                ],
            )
            .expect("url");
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/v1/tasks/lease/lab%20a/taimen:userdebug\
             ?num_tasks=5&next_cluster_ids=b&next_cluster_ids=c"
        );
    }

    #[test]
    fn encodes_slashes_inside_segments() {
        let helper = RestApiHelper::new("http://localhost/api").expect("helper");
        let url = helper.build_url(&["requests", "a/b"], &[]).expect("url");
        assert_eq!(url.path(), "/api/requests/a%2Fb");
        assert!(url.query().is_none());
    }
}
