use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum DeviceAllocationState {
    Available,
    Allocated,
    Unavailable,
    Ignored,
    CheckingAvailability,
    #[default]
    Unknown,
}

/// Snapshot of one device as reported to the coordinator.
///
/// Built fresh for every snapshot or lease request and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub device_serial: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_operator: Option<String>,
    pub state: DeviceAllocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}
