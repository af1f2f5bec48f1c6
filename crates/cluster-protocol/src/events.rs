use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{ClusterCommand, DeviceInfo};

pub const DATA_KEY_ERROR: &str = "error";
pub const DATA_KEY_SUMMARY: &str = "summary";
pub const DATA_KEY_TOTAL_TEST_COUNT: &str = "total_test_count";
pub const DATA_KEY_FAILED_TEST_COUNT: &str = "failed_test_count";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandEventType {
    AllocationFailed,
    ConfigurationError,
    FetchFailed,
    ExecuteFailed,
    InvocationStarted,
    InvocationFailed,
    InvocationEnded,
    InvocationCompleted,
    TestRunInProgress,
    TestEnded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HostEventType {
    DeviceSnapshot,
}

/// Which coordinator endpoint a kind of event is uploaded to.
pub trait UploadableEvent: Serialize + Send + Sync + 'static {
    /// Path segment of the upload endpoint, also the key of the batch array in the body.
    const ENDPOINT: &'static str;
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandEvent {
    #[serde(rename = "type")]
    pub event_type: CommandEventType,
    pub time: u64,
    pub task_id: String,
    pub attempt_id: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_serial: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl CommandEvent {
    /// Starts an event correlated with `command` through its task and attempt ids.
    pub fn builder(command: &ClusterCommand) -> CommandEventBuilder {
        CommandEventBuilder {
            event_type: None,
            time: None,
            task_id: command.task_id().to_string(),
            attempt_id: command.attempt_id().to_string(),
            hostname: String::new(),
            device_serial: command.device_serial().map(str::to_string),
            data: BTreeMap::new(),
        }
    }
}

impl UploadableEvent for CommandEvent {
    const ENDPOINT: &'static str = "command_events";
}

#[derive(Debug, Clone)]
pub struct CommandEventBuilder {
    event_type: Option<CommandEventType>,
    time: Option<u64>,
    task_id: String,
    attempt_id: String,
    hostname: String,
    device_serial: Option<String>,
    data: BTreeMap<String, String>,
}

impl CommandEventBuilder {
    pub fn event_type(mut self, event_type: CommandEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn device_serial(mut self, serial: Option<impl Into<String>>) -> Self {
        self.device_serial = serial.map(Into::into);
        self
    }

    pub fn set_data(mut self, key: &str, value: Option<impl ToString>) -> Self {
        if let Some(value) = value {
            self.data.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn build(self) -> CommandEvent {
        CommandEvent {
            event_type: self
                .event_type
                .unwrap_or(CommandEventType::InvocationStarted),
            time: self.time.unwrap_or_else(now_secs),
            task_id: self.task_id,
            attempt_id: self.attempt_id,
            hostname: self.hostname,
            device_serial: self.device_serial,
            data: self.data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostEvent {
    #[serde(rename = "type")]
    pub event_type: HostEventType,
    pub time: u64,
    pub hostname: String,
    pub tf_version: String,
    pub cluster: String,
    #[serde(default)]
    pub device_infos: Vec<DeviceInfo>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl HostEvent {
    pub fn builder() -> HostEventBuilder {
        HostEventBuilder::default()
    }
}

impl UploadableEvent for HostEvent {
    const ENDPOINT: &'static str = "host_events";
}

#[derive(Debug, Clone, Default)]
pub struct HostEventBuilder {
    time: Option<u64>,
    hostname: String,
    tf_version: String,
    cluster: String,
    device_infos: Vec<DeviceInfo>,
    data: BTreeMap<String, String>,
}

impl HostEventBuilder {
    pub fn time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn tool_version(mut self, version: impl Into<String>) -> Self {
        self.tf_version = version.into();
        self
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn add_device_info(mut self, info: DeviceInfo) -> Self {
        self.device_infos.push(info);
        self
    }

    pub fn data(mut self, data: BTreeMap<String, String>) -> Self {
        self.data.extend(data);
        self
    }

    pub fn build(self) -> HostEvent {
        HostEvent {
            event_type: HostEventType::DeviceSnapshot,
            time: self.time.unwrap_or_else(now_secs),
            hostname: self.hostname,
            tf_version: self.tf_version,
            cluster: self.cluster,
            device_infos: self.device_infos,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceAllocationState, RequestType};

    #[test]
    fn command_event_wire_shape() {
        let mut command = ClusterCommand::new("r1", "c1", "t1", "run", RequestType::Unmanaged);
        command.set_device_serial("ABC123");
        let event = CommandEvent::builder(&command)
            .event_type(CommandEventType::InvocationCompleted)
            .time(1_700_000_000)
            .hostname("host-1")
            .set_data(DATA_KEY_ERROR, Some(""))
            .set_data(DATA_KEY_TOTAL_TEST_COUNT, Some(10))
            .set_data(DATA_KEY_SUMMARY, None::<String>)
            .build();

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "InvocationCompleted");
        assert_eq!(value["time"], 1_700_000_000u64);
        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["attempt_id"], command.attempt_id());
        assert_eq!(value["hostname"], "host-1");
        assert_eq!(value["device_serial"], "ABC123");
        assert_eq!(value["data"]["error"], "");
        assert_eq!(value["data"]["total_test_count"], "10");
        assert!(value["data"].get("summary").is_none());
    }

    #[test]
    fn command_event_omits_missing_serial() {
        let command = ClusterCommand::new("r1", "c1", "t1", "run", RequestType::Unmanaged);
        let event = CommandEvent::builder(&command)
            .event_type(CommandEventType::AllocationFailed)
            .build();
        let value = serde_json::to_value(&event).expect("serialize");
        assert!(value.get("device_serial").is_none());
        assert!(value["time"].as_u64().expect("time") > 0);
    }

    #[test]
    fn host_event_wire_shape() {
        let event = HostEvent::builder()
            .time(42)
            .hostname("host-1")
            .tool_version("12345")
            .cluster("lab-a")
            .add_device_info(DeviceInfo {
                device_serial: "ABC123".to_string(),
                state: DeviceAllocationState::Allocated,
                ..Default::default()
            })
            .data(BTreeMap::from([("disk".to_string(), "ok".to_string())]))
            .build();
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "DeviceSnapshot");
        assert_eq!(value["tf_version"], "12345");
        assert_eq!(value["cluster"], "lab-a");
        assert_eq!(value["device_infos"][0]["device_serial"], "ABC123");
        assert_eq!(value["device_infos"][0]["state"], "Allocated");
        assert_eq!(value["data"]["disk"], "ok");
    }
}
