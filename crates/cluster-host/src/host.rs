use std::sync::OnceLock;

use cluster_protocol::UNKNOWN_DEVICE;

pub const DEFAULT_TOOL_VERSION: &str = "(unknown)";

static HOST_NAME: OnceLock<String> = OnceLock::new();

/// Name this host reports in every event, resolved once per process.
pub fn host_name() -> &'static str {
    HOST_NAME.get_or_init(|| match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to resolve hostname");
            UNKNOWN_DEVICE.to_string()
        }
    })
}

/// Returns `version` when it is a build number, otherwise a placeholder.
pub fn to_valid_tool_version(version: Option<&str>) -> String {
    match version {
        Some(version) if !version.is_empty() && version.parse::<i64>().is_ok() => {
            version.to_string()
        }
        _ => DEFAULT_TOOL_VERSION.to_string(),
    }
}
