use serde::{Deserialize, Serialize};

pub mod device;
pub mod environment;
pub mod events;

pub use device::{DeviceAllocationState, DeviceInfo};
pub use environment::{EnvVar, TestEnvironment, TestResource};
pub use events::{
    CommandEvent, CommandEventBuilder, CommandEventType, HostEvent, HostEventBuilder,
    HostEventType,
};

/// Display string used for any device attribute that could not be resolved.
pub const UNKNOWN_DEVICE: &str = "unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    /// Run through the host's own invocation runner.
    #[default]
    Unmanaged,
    /// Run as an isolated subprocess through the command launcher.
    Managed,
}

/// One unit of leased work.
///
/// `attempt_id` is generated when the value is constructed and never changes afterwards; it
/// is the key the coordinator uses to group every event of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCommand {
    request_id: String,
    command_id: String,
    task_id: String,
    attempt_id: String,
    command_line: String,
    request_type: RequestType,
    target_device_serials: Vec<String>,
    device_serial: Option<String>,
}

impl ClusterCommand {
    pub fn new(
        request_id: impl Into<String>,
        command_id: impl Into<String>,
        task_id: impl Into<String>,
        command_line: impl Into<String>,
        request_type: RequestType,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            command_id: command_id.into(),
            task_id: task_id.into(),
            attempt_id: uuid::Uuid::new_v4().to_string(),
            command_line: command_line.into(),
            request_type,
            target_device_serials: Vec::new(),
            device_serial: None,
        }
    }

    pub fn with_target_device_serials(mut self, serials: Vec<String>) -> Self {
        self.target_device_serials = serials;
        self
    }

    pub fn set_target_device_serials(&mut self, serials: Vec<String>) {
        self.target_device_serials = serials;
    }

    pub fn set_device_serial(&mut self, serial: impl Into<String>) {
        self.device_serial = Some(serial.into());
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn target_device_serials(&self) -> &[String] {
        &self.target_device_serials
    }

    pub fn device_serial(&self) -> Option<&str> {
        self.device_serial.as_deref()
    }
}

/// A task entry as returned by the lease endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeasedTask {
    pub request_id: String,
    pub command_id: String,
    pub task_id: String,
    pub command_line: String,
    #[serde(default)]
    pub request_type: RequestType,
    #[serde(default)]
    pub device_serials: Option<Vec<String>>,
}

impl LeasedTask {
    pub fn into_command(self) -> ClusterCommand {
        let command = ClusterCommand::new(
            self.request_id,
            self.command_id,
            self.task_id,
            self.command_line,
            self.request_type,
        );
        match self.device_serials {
            Some(serials) => command.with_target_device_serials(serials),
            None => command,
        }
    }
}

/// Body of both lease endpoints. A missing `tasks` key means there is no work.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LeaseResponse {
    #[serde(default)]
    pub tasks: Option<Vec<LeasedTask>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostLeaseRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_cluster_ids: Vec<String>,
    pub device_infos: Vec<DeviceInfo>,
}
