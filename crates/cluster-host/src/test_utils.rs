use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cluster_client::test_support::FakeApi;
use cluster_client::{ApiHelper, ClusterClient, EventUploader, UploaderOptions};
use cluster_protocol::{CommandEvent, DeviceAllocationState};
use serde_json::Value;

use crate::devices::{DeviceDescriptor, DeviceLister};
use crate::executor::{CommandExecutor, InvocationRequest};
use crate::handler::{InvocationContext, InvocationListener};

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = NEXT_DIR.fetch_add(1, Ordering::SeqCst);
    dir.push(format!("{prefix}-{}-{nanos}-{seq}", std::process::id()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Stand-in `java` that drops `-cp <classpath> <main class>` and execs the rest.
#[cfg(unix)]
pub(crate) fn fake_java() -> &'static Path {
    static SCRIPT: OnceLock<PathBuf> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        use std::os::unix::fs::PermissionsExt;
        let path = temp_dir("fake-java").join("java");
        fs::write(&path, "#!/bin/sh\nshift 3\nexec \"$@\"\n").expect("write fake java");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake java");
        path
    })
}

pub(crate) fn fake_client(api: &Arc<FakeApi>) -> ClusterClient {
    ClusterClient::new(Arc::clone(api) as Arc<dyn ApiHelper>, UploaderOptions::default())
}

pub(crate) fn command_uploader(api: &Arc<FakeApi>) -> Arc<EventUploader<CommandEvent>> {
    Arc::new(EventUploader::new(
        Arc::clone(api) as Arc<dyn ApiHelper>,
        UploaderOptions {
            max_batch_size: 200,
            upload_interval: Duration::from_secs(60),
        },
    ))
}

pub(crate) fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub(crate) fn available(serial: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(serial, DeviceAllocationState::Available)
}

pub(crate) struct StaticLister {
    devices: Mutex<Vec<DeviceDescriptor>>,
    fail: bool,
}

impl StaticLister {
    pub(crate) fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: Mutex::new(devices),
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            fail: true,
        }
    }
}

#[async_trait]
impl DeviceLister for StaticLister {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        if self.fail {
            anyhow::bail!("lister unavailable");
        }
        Ok(self.devices.lock().expect("devices lock").clone())
    }
}

/// Records listener callbacks as short strings.
#[derive(Default)]
pub(crate) struct RecordingListener {
    calls: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl InvocationListener for RecordingListener {
    async fn invocation_started(&self, context: &InvocationContext) {
        let serial = context.device_serial.as_deref().unwrap_or("none");
        self.record(format!("started {serial}"));
    }

    async fn invocation_failed(&self, cause: &str) {
        self.record(format!("failed {cause}"));
    }

    async fn invocation_ended(&self, _elapsed: Duration) {
        self.record("ended".to_string());
    }

    async fn put_summary(&self, summaries: &[String]) {
        self.record(format!("summary {}", summaries.join(",")));
    }

    async fn set_test_counts(&self, total: u64, failed: u64) {
        self.record(format!("counts {total} {failed}"));
    }

    async fn invocation_complete(&self, context: Option<&InvocationContext>) {
        let build = match context.and_then(|context| context.build.as_ref()) {
            Some(_) => "build",
            None => "none",
        };
        self.record(format!("complete {build}"));
    }
}

/// Executor double that records requests and answers with a scripted error or success.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    requests: Mutex<Vec<InvocationRequest>>,
    failures: Mutex<Vec<Option<anyhow::Error>>>,
}

impl RecordingExecutor {
    /// Queues the outcome of the next `exec_command` calls, in order.
    pub(crate) fn push_outcome(&self, failure: Option<anyhow::Error>) {
        self.failures.lock().expect("failures lock").push(failure);
    }

    pub(crate) fn requests(&self) -> Vec<InvocationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    fn validate(&self, args: &[String]) -> anyhow::Result<()> {
        crate::executor::validate_args(args)
    }

    async fn exec_command(
        &self,
        _listener: Arc<dyn InvocationListener>,
        request: InvocationRequest,
    ) -> anyhow::Result<()> {
        self.requests.lock().expect("requests lock").push(request);
        let mut failures = self.failures.lock().expect("failures lock");
        if failures.is_empty() {
            return Ok(());
        }
        match failures.remove(0) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
