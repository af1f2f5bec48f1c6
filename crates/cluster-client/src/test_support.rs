//! Recording `ApiHelper` double shared by this crate's tests and the host crate's tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::api::ApiHelper;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RecordedRequest {
    pub fn joined_path(&self) -> String {
        self.path.join("/")
    }
}

#[derive(Default)]
struct FakeState {
    requests: Vec<RecordedRequest>,
    responses: HashMap<String, VecDeque<anyhow::Result<String>>>,
    fail_next: usize,
    fail_after: Option<usize>,
    urls: HashMap<String, Vec<u8>>,
    puts: Vec<(String, Vec<u8>)>,
}

/// Answers `execute` with canned bodies keyed by the `/`-joined path, `"{}"` otherwise.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Queues one response for `path`; the last queued response is reused once drained.
    pub fn respond(&self, path: &str, body: impl Into<String>) {
        self.state()
            .responses
            .entry(path.to_string())
            .or_default()
            .push_back(Ok(body.into()));
    }

    pub fn respond_error(&self, path: &str, message: &str) {
        self.state()
            .responses
            .entry(path.to_string())
            .or_default()
            .push_back(Err(anyhow::anyhow!(message.to_string())));
    }

    /// Fails the next `count` calls to `execute`.
    pub fn fail_next(&self, count: usize) {
        self.state().fail_next = count;
    }

    /// Lets `count` calls succeed, then fails every later call.
    pub fn fail_after(&self, count: usize) {
        self.state().fail_after = Some(count);
    }

    pub fn serve_url(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.state().urls.insert(url.to_string(), body.into());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.joined_path() == path)
            .collect()
    }

    pub fn puts(&self) -> Vec<(String, Vec<u8>)> {
        self.state().puts.clone()
    }

    /// Every event posted to `endpoint` (`command_events` or `host_events`), in upload order.
    pub fn posted_events(&self, endpoint: &str) -> Vec<Value> {
        self.requests_to(endpoint)
            .into_iter()
            .filter_map(|request| request.body)
            .flat_map(|body| body[endpoint].as_array().cloned().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl ApiHelper for FakeApi {
    async fn execute(
        &self,
        method: Method,
        path: &[&str],
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> anyhow::Result<String> {
        let mut state = self.state();
        let request = RecordedRequest {
            method,
            path: path.iter().map(|segment| segment.to_string()).collect(),
            query: query.to_vec(),
            body: body.cloned(),
        };
        let key = request.joined_path();
        state.requests.push(request);

        if state.fail_next > 0 {
            state.fail_next -= 1;
            anyhow::bail!("injected failure for {key}");
        }
        if let Some(remaining) = state.fail_after.as_mut() {
            if *remaining == 0 {
                anyhow::bail!("injected failure for {key}");
            }
            *remaining -= 1;
        }

        match state.responses.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Ok("{}".to_string())),
            Some(queue) => match queue.front() {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(err)) => Err(anyhow::anyhow!(err.to_string())),
                None => Ok("{}".to_string()),
            },
            None => Ok("{}".to_string()),
        }
    }

    async fn fetch_url(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let body = self
            .state()
            .urls
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("GET {url} returned status 404 Not Found"))?;
        tokio::fs::write(dest, body)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))
    }

    async fn put_url(&self, url: &str, path: &Path) -> anyhow::Result<()> {
        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        self.state().puts.push((url.to_string(), body));
        Ok(())
    }
}
