use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cluster_protocol::{DeviceAllocationState, UNKNOWN_DEVICE};
use serde::Deserialize;

fn unknown() -> String {
    UNKNOWN_DEVICE.to_string()
}

/// One device as the local pool sees it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub serial: String,
    #[serde(default)]
    pub state: DeviceAllocationState,
    #[serde(default = "unknown")]
    pub product: String,
    #[serde(default = "unknown")]
    pub product_variant: String,
    #[serde(default = "unknown")]
    pub sdk_version: String,
    #[serde(default = "unknown")]
    pub build_id: String,
    #[serde(default = "unknown")]
    pub battery_level: String,
    #[serde(default = "unknown")]
    pub device_class: String,
    #[serde(default = "unknown")]
    pub mac_address: String,
    #[serde(default = "unknown")]
    pub sim_state: String,
    #[serde(default = "unknown")]
    pub sim_operator: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DeviceDescriptor {
    pub fn new(serial: impl Into<String>, state: DeviceAllocationState) -> Self {
        Self {
            serial: serial.into(),
            state,
            product: unknown(),
            product_variant: unknown(),
            sdk_version: unknown(),
            build_id: unknown(),
            battery_level: unknown(),
            device_class: unknown(),
            mac_address: unknown(),
            sim_state: unknown(),
            sim_operator: unknown(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_product(mut self, product: &str, variant: &str) -> Self {
        self.product = product.to_string();
        self.product_variant = variant.to_string();
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// Raised when none of the candidate devices could be allocated.
#[derive(Debug, Clone)]
pub struct NoDeviceError {
    pub candidates: Vec<String>,
}

impl fmt::Display for NoDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.candidates.is_empty() {
            write!(f, "no available device")
        } else {
            write!(
                f,
                "no available device among [{}]",
                self.candidates.join(", ")
            )
        }
    }
}

impl std::error::Error for NoDeviceError {}

/// Source of the host's device inventory.
#[async_trait]
pub trait DeviceLister: Send + Sync {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceDescriptor>>;
}

/// Lists devices by running an external command that prints a JSON array of descriptors.
pub struct CommandDeviceLister {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandDeviceLister {
    pub fn new(list_cmd: &str, timeout: Duration) -> anyhow::Result<Self> {
        let argv = shell_words::split(list_cmd)
            .with_context(|| format!("invalid device list command {list_cmd}"))?;
        if argv.is_empty() {
            anyhow::bail!("device list command is empty");
        }
        Ok(Self { argv, timeout })
    }
}

#[async_trait]
impl DeviceLister for CommandDeviceLister {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        let output =
            system_utils::process::run_argv_with_timeout(&self.argv, self.timeout, "device list")
                .await?;
        if !output.status.success() {
            anyhow::bail!(
                "device list exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout).context("failed to parse device list output")
    }
}

/// Lister for hosts without a configured device source.
pub struct EmptyDeviceLister;

#[async_trait]
impl DeviceLister for EmptyDeviceLister {
    async fn list_devices(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        Ok(Vec::new())
    }
}

/// Whether `serial` names a network-attached device (`ip:port`) instead of a physical one.
pub fn is_ip_port(serial: &str) -> bool {
    serial.parse::<SocketAddr>().is_ok() || serial.parse::<IpAddr>().is_ok()
}

/// The local device pool: the lister's inventory plus this host's own reservations.
pub struct DevicePool {
    lister: Arc<dyn DeviceLister>,
    reserved: Mutex<HashSet<String>>,
}

impl DevicePool {
    pub fn new(lister: Arc<dyn DeviceLister>) -> Self {
        Self {
            lister,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    fn reserved(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.reserved.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Every known device. Devices reserved here are reported `Allocated`.
    pub async fn devices(&self) -> Vec<DeviceDescriptor> {
        let mut devices = match self.lister.list_devices().await {
            Ok(devices) => devices,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list devices");
                return Vec::new();
            }
        };
        let reserved = self.reserved();
        for device in &mut devices {
            if reserved.contains(&device.serial) {
                device.state = DeviceAllocationState::Allocated;
            }
        }
        devices
    }

    /// Reserves the first candidate, in order, that is available and physical.
    ///
    /// With no candidates any available physical device qualifies.
    pub async fn allocate(&self, candidates: &[String]) -> anyhow::Result<String> {
        let devices = self.devices().await;
        let mut reserved = self.reserved();
        let usable = |device: &DeviceDescriptor| {
            device.state == DeviceAllocationState::Available
                && !is_ip_port(&device.serial)
                && !reserved.contains(&device.serial)
        };
        let chosen = if candidates.is_empty() {
            devices.iter().find(|device| usable(*device))
        } else {
            candidates.iter().find_map(|serial| {
                devices
                    .iter()
                    .find(|device| &device.serial == serial && usable(*device))
            })
        };
        let Some(device) = chosen else {
            return Err(NoDeviceError {
                candidates: candidates.to_vec(),
            }
            .into());
        };
        let serial = device.serial.clone();
        reserved.insert(serial.clone());
        tracing::debug!(serial = %serial, "device allocated");
        Ok(serial)
    }

    pub fn release(&self, serial: &str) {
        if self.reserved().remove(serial) {
            tracing::debug!(serial, "device released");
        }
    }
}
