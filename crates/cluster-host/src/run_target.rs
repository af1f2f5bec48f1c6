use std::collections::BTreeMap;
use std::sync::OnceLock;

use cluster_protocol::UNKNOWN_DEVICE;
use regex::Regex;

use crate::devices::DeviceDescriptor;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([^:}]+)(?::([^}]*))?\}").expect("placeholder pattern should compile")
    })
}

/// Computes the run target a device is leased against.
///
/// `format` holds `{NAME}` placeholders (`PRODUCT`, `PRODUCT_VARIANT`, `API_LEVEL`,
/// `DEVICE_CLASS`, `SERIAL`, `TAG`, `DEVICE_PROP:<name>`). A placeholder that cannot be resolved
/// turns the whole result into [`UNKNOWN_DEVICE`]. Without a format the run target is the
/// product, suffixed with `:variant` when the variant differs.
pub fn run_target(
    device: &DeviceDescriptor,
    format: Option<&str>,
    device_tags: &BTreeMap<String, String>,
) -> String {
    let Some(format) = format.filter(|format| !format.is_empty()) else {
        return default_run_target(device);
    };

    let mut out = String::with_capacity(format.len());
    let mut last = 0;
    for captures in placeholder_pattern().captures_iter(format) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let name = captures.get(1).map_or("", |m| m.as_str());
        let arg = captures.get(2).map(|m| m.as_str());
        let value = match name {
            "PRODUCT" => Some(device.product.as_str()),
            "PRODUCT_VARIANT" => Some(device.product_variant.as_str()),
            "API_LEVEL" => Some(device.sdk_version.as_str()),
            "DEVICE_CLASS" => Some(device.device_class.as_str()),
            "SERIAL" => Some(device.serial.as_str()),
            "TAG" => Some(
                device_tags
                    .get(&device.serial)
                    .map(String::as_str)
                    .unwrap_or(""),
            ),
            "DEVICE_PROP" => arg.and_then(|key| device.property(key)),
            _ => {
                tracing::warn!(
                    placeholder = name,
                    format,
                    "unsupported placeholder in run target format"
                );
                return UNKNOWN_DEVICE.to_string();
            }
        };
        match value {
            Some(value) if value != UNKNOWN_DEVICE => {
                out.push_str(&format[last..whole.start()]);
                out.push_str(value);
                last = whole.end();
            }
            _ => {
                tracing::info!(
                    placeholder = name,
                    format,
                    serial = %device.serial,
                    "no value for run target placeholder"
                );
                return UNKNOWN_DEVICE.to_string();
            }
        }
    }
    out.push_str(&format[last..]);
    out
}

fn default_run_target(device: &DeviceDescriptor) -> String {
    if device.product == device.product_variant {
        device.product.clone()
    } else {
        format!("{}:{}", device.product, device.product_variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_protocol::DeviceAllocationState;

    fn device() -> DeviceDescriptor {
        let mut device = DeviceDescriptor::new("ABC123", DeviceAllocationState::Available)
            .with_product("taimen", "userdebug");
        device.sdk_version = "28".to_string();
        device.device_class = "PhysicalDevice".to_string();
        device
            .properties
            .insert("ro.hardware".to_string(), "walleye".to_string());
        device
    }

    fn no_tags() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn substitutes_product_and_variant() {
        let target = run_target(&device(), Some("{PRODUCT}:{PRODUCT_VARIANT}"), &no_tags());
        assert_eq!(target, "taimen:userdebug");
    }

    #[test]
    fn unknown_placeholder_yields_sentinel() {
        let target = run_target(&device(), Some("{UNKNOWN_KEY}"), &no_tags());
        assert_eq!(target, UNKNOWN_DEVICE);
        let target = run_target(&device(), Some("prefix-{PRODUCT}-{BOGUS}"), &no_tags());
        assert_eq!(target, UNKNOWN_DEVICE);
    }

    #[test]
    fn unknown_attribute_yields_sentinel() {
        let mut device = device();
        device.product_variant = UNKNOWN_DEVICE.to_string();
        let target = run_target(&device, Some("{PRODUCT}:{PRODUCT_VARIANT}"), &no_tags());
        assert_eq!(target, UNKNOWN_DEVICE);

        let target = run_target(&device, Some("{DEVICE_PROP:missing}"), &no_tags());
        assert_eq!(target, UNKNOWN_DEVICE);
    }

    #[test]
    fn resolves_other_attributes() {
        let format = "{API_LEVEL}/{DEVICE_CLASS}/{SERIAL}/{DEVICE_PROP:ro.hardware}";
        let target = run_target(&device(), Some(format), &no_tags());
        assert_eq!(target, "28/PhysicalDevice/ABC123/walleye");
    }

    #[test]
    fn repeated_placeholders_are_each_substituted() {
        let target = run_target(&device(), Some("{PRODUCT}-{PRODUCT}"), &no_tags());
        assert_eq!(target, "taimen-taimen");
    }

    #[test]
    fn tag_placeholder_is_deleted_when_missing() {
        let format = "{PRODUCT}{TAG}";
        assert_eq!(run_target(&device(), Some(format), &no_tags()), "taimen");

        let tags = BTreeMap::from([("OTHER".to_string(), "rack2".to_string())]);
        assert_eq!(run_target(&device(), Some(format), &tags), "taimen");

        let tags = BTreeMap::from([("ABC123".to_string(), "-rack1".to_string())]);
        assert_eq!(run_target(&device(), Some(format), &tags), "taimen-rack1");
    }

    #[test]
    fn replacement_values_are_literal() {
        let mut device = device();
        device.product = "$1{PRODUCT}".to_string();
        let target = run_target(&device, Some("{PRODUCT}"), &no_tags());
        assert_eq!(target, "$1{PRODUCT}");
    }

    #[test]
    fn default_format_is_product_and_variant() {
        assert_eq!(run_target(&device(), None, &no_tags()), "taimen:userdebug");
        assert_eq!(run_target(&device(), Some(""), &no_tags()), "taimen:userdebug");
        let same = DeviceDescriptor::new("X", DeviceAllocationState::Available)
            .with_product("bullhead", "bullhead");
        assert_eq!(run_target(&same, None, &no_tags()), "bullhead");
    }
}
