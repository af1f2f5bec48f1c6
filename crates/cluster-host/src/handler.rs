use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cluster_client::EventUploader;
use cluster_protocol::events::{
    DATA_KEY_ERROR, DATA_KEY_FAILED_TEST_COUNT, DATA_KEY_SUMMARY, DATA_KEY_TOTAL_TEST_COUNT,
};
use cluster_protocol::{ClusterCommand, CommandEvent, CommandEventBuilder, CommandEventType};

use crate::heartbeat::{HeartbeatHandle, HeartbeatPool};

const BUILD_NOT_FOUND: &str = "build not found";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub build_id: String,
    pub device_serial: Option<String>,
}

/// What the runner knows about an invocation when it starts or completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    pub device_serial: Option<String>,
    pub build: Option<BuildInfo>,
}

impl InvocationContext {
    pub fn for_device(serial: &str) -> Self {
        Self {
            device_serial: Some(serial.to_string()),
            build: Some(BuildInfo {
                build_id: cluster_protocol::UNKNOWN_DEVICE.to_string(),
                device_serial: Some(serial.to_string()),
            }),
        }
    }
}

/// Callbacks an invocation runner drives over the life of one invocation.
#[async_trait]
pub trait InvocationListener: Send + Sync {
    async fn invocation_started(&self, context: &InvocationContext);
    async fn invocation_failed(&self, cause: &str);
    async fn invocation_ended(&self, elapsed: Duration);
    async fn put_summary(&self, summaries: &[String]);
    async fn set_test_counts(&self, total: u64, failed: u64);
    async fn invocation_complete(&self, context: Option<&InvocationContext>);
}

struct HandlerState {
    command: ClusterCommand,
    build_seen: bool,
    error: Option<String>,
    summary: Option<String>,
    total_tests: u64,
    failed_tests: u64,
    heartbeat: Option<HeartbeatHandle>,
}

struct Shared {
    task_id: String,
    hostname: String,
    uploader: Arc<EventUploader<CommandEvent>>,
    state: Mutex<HandlerState>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn event(&self, event_type: CommandEventType) -> CommandEventBuilder {
        CommandEvent::builder(&self.state().command)
            .event_type(event_type)
            .hostname(self.hostname.clone())
    }
}

/// Reports one command's invocation lifecycle to the coordinator.
pub struct InvocationEventHandler {
    shared: Arc<Shared>,
    heartbeat_pool: Arc<HeartbeatPool>,
    heartbeat_interval: Duration,
}

impl InvocationEventHandler {
    pub fn new(
        command: ClusterCommand,
        hostname: impl Into<String>,
        uploader: Arc<EventUploader<CommandEvent>>,
        heartbeat_pool: Arc<HeartbeatPool>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                task_id: command.task_id().to_string(),
                hostname: hostname.into(),
                uploader,
                state: Mutex::new(HandlerState {
                    command,
                    build_seen: false,
                    error: None,
                    summary: None,
                    total_tests: 0,
                    failed_tests: 0,
                    heartbeat: None,
                }),
            }),
            heartbeat_pool,
            heartbeat_interval,
        }
    }

    /// The command as reported so far, including its device once the invocation started.
    pub fn command(&self) -> ClusterCommand {
        self.shared.state().command.clone()
    }

    /// Stops the heartbeat of an invocation that will never complete.
    pub fn cancel_heartbeat(&self) {
        if let Some(heartbeat) = self.shared.state().heartbeat.take() {
            heartbeat.cancel();
        }
    }

    fn start_heartbeat(&self) -> HeartbeatHandle {
        let shared = Arc::clone(&self.shared);
        self.heartbeat_pool.schedule(
            &self.shared.task_id,
            self.heartbeat_interval,
            move || {
                let shared = Arc::clone(&shared);
                async move {
                    let event = shared.event(CommandEventType::TestRunInProgress).build();
                    shared.uploader.post_event(event).await;
                }
            },
        )
    }

    async fn post_and_flush(&self, event: CommandEvent) {
        self.shared.uploader.post_event(event).await;
        self.shared.uploader.flush().await;
    }
}

#[async_trait]
impl InvocationListener for InvocationEventHandler {
    async fn invocation_started(&self, context: &InvocationContext) {
        {
            let mut state = self.shared.state();
            let serial = context
                .build
                .as_ref()
                .and_then(|build| build.device_serial.clone())
                .or_else(|| context.device_serial.clone());
            if let Some(serial) = serial {
                state.command.set_device_serial(serial);
            }
            state.build_seen = context.build.is_some();
        }
        let event = self.shared.event(CommandEventType::InvocationStarted).build();
        self.post_and_flush(event).await;
        let heartbeat = self.start_heartbeat();
        if let Some(previous) = self.shared.state().heartbeat.replace(heartbeat) {
            previous.cancel();
        }
    }

    async fn invocation_failed(&self, cause: &str) {
        self.shared.state().error = Some(cause.to_string());
    }

    async fn invocation_ended(&self, elapsed: Duration) {
        tracing::debug!(
            task_id = %self.shared.task_id,
            elapsed = %humantime::format_duration(elapsed),
            "invocation ended"
        );
        let error = self.shared.state().error.clone().unwrap_or_default();
        let event = self
            .shared
            .event(CommandEventType::InvocationEnded)
            .set_data(DATA_KEY_ERROR, Some(error))
            .build();
        self.post_and_flush(event).await;
    }

    async fn put_summary(&self, summaries: &[String]) {
        let summary: String = summaries
            .iter()
            .map(|summary| format!("{summary}\n"))
            .collect();
        self.shared.state().summary = Some(summary);
    }

    async fn set_test_counts(&self, total: u64, failed: u64) {
        let mut state = self.shared.state();
        state.total_tests = total;
        state.failed_tests = failed;
    }

    async fn invocation_complete(&self, context: Option<&InvocationContext>) {
        let (error, summary, total, failed) = {
            let mut state = self.shared.state();
            let has_build =
                state.build_seen || context.is_some_and(|context| context.build.is_some());
            if !has_build && state.error.is_none() {
                state.error = Some(BUILD_NOT_FOUND.to_string());
            }
            (
                state.error.clone().unwrap_or_default(),
                state.summary.clone(),
                state.total_tests,
                state.failed_tests,
            )
        };
        let event = self
            .shared
            .event(CommandEventType::InvocationCompleted)
            .set_data(DATA_KEY_ERROR, Some(error))
            .set_data(DATA_KEY_SUMMARY, summary)
            .set_data(DATA_KEY_TOTAL_TEST_COUNT, Some(total))
            .set_data(DATA_KEY_FAILED_TEST_COUNT, Some(failed))
            .build();
        self.post_and_flush(event).await;
        self.cancel_heartbeat();
    }
}
