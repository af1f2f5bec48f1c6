use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster_protocol::events::UploadableEvent;
use reqwest::Method;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::api::ApiHelper;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 200;
pub const DEFAULT_UPLOAD_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploaderOptions {
    pub max_batch_size: usize,
    pub upload_interval: Duration,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            upload_interval: DEFAULT_UPLOAD_INTERVAL,
        }
    }
}

struct QueueState<E> {
    queue: VecDeque<E>,
    last_upload: Option<Instant>,
}

/// Buffers events of one kind and posts them to the coordinator in batches.
///
/// Events leave the queue only after the batch carrying them was accepted, so a failed post
/// is retried with the same events on the next attempt. Queue mutation and the upload pass
/// share one lock.
pub struct EventUploader<E> {
    api: Arc<dyn ApiHelper>,
    state: Mutex<QueueState<E>>,
    max_batch_size: AtomicUsize,
    upload_interval_ms: AtomicU64,
}

impl<E: UploadableEvent> EventUploader<E> {
    pub fn new(api: Arc<dyn ApiHelper>, options: UploaderOptions) -> Self {
        let uploader = Self {
            api,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                last_upload: None,
            }),
            max_batch_size: AtomicUsize::new(DEFAULT_MAX_BATCH_SIZE),
            upload_interval_ms: AtomicU64::new(0),
        };
        uploader.set_max_batch_size(options.max_batch_size);
        uploader.set_upload_interval(options.upload_interval);
        uploader
    }

    pub fn set_max_batch_size(&self, size: usize) {
        self.max_batch_size.store(size.max(1), Ordering::Relaxed);
    }

    pub fn set_upload_interval(&self, interval: Duration) {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.upload_interval_ms.store(millis, Ordering::Relaxed);
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Relaxed)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_millis(self.upload_interval_ms.load(Ordering::Relaxed))
    }

    /// Queues `event` and uploads only when the upload interval has elapsed.
    pub async fn post_event(&self, event: E) {
        let mut state = self.state.lock().await;
        state.queue.push_back(event);
        let due = state
            .last_upload
            .map_or(true, |at| at.elapsed() >= self.upload_interval());
        if due {
            self.upload_queued(&mut state).await;
        }
    }

    /// Uploads everything queued right away.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        self.upload_queued(&mut state).await;
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    async fn upload_queued(&self, state: &mut QueueState<E>) {
        state.last_upload = Some(Instant::now());
        while !state.queue.is_empty() {
            let count = state.queue.len().min(self.max_batch_size());
            let body = match build_post_data(state.queue.iter().take(count)) {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(
                        endpoint = E::ENDPOINT,
                        error = %err,
                        "failed to serialize events"
                    );
                    return;
                }
            };
            if let Err(err) = self
                .api
                .execute(Method::POST, &[E::ENDPOINT], &[], Some(&body))
                .await
            {
                tracing::warn!(
                    endpoint = E::ENDPOINT,
                    pending = state.queue.len(),
                    error = %err,
                    "failed to upload events"
                );
                return;
            }
            state.queue.drain(..count);
        }
    }
}

fn build_post_data<'a, E: UploadableEvent>(
    events: impl Iterator<Item = &'a E>,
) -> serde_json::Result<Value> {
    let batch = events
        .map(serde_json::to_value)
        .collect::<serde_json::Result<Vec<_>>>()?;
    let mut body = Map::new();
    body.insert(E::ENDPOINT.to_string(), Value::Array(batch));
    Ok(Value::Object(body))
}
