//! Parsing of `adb devices -l`

use serde::Serialize;

/// One line of `adb devices -l`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEntry {
    pub serial: String,
    /// Bridge-reported state: `device`, `offline`, `unauthorized`, ...
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
}

impl DeviceEntry {
    /// Whether adb will accept commands for this device
    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

pub fn parse_device_list(stdout: &str) -> Vec<DeviceEntry> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*')
        })
        .filter_map(parse_device_line)
        .collect()
}

fn parse_device_line(line: &str) -> Option<DeviceEntry> {
    let mut parts = line.split_whitespace();
    let serial = parts.next()?.to_string();
    let state = parts.next()?.to_string();

    let mut entry = DeviceEntry {
        serial,
        state,
        model: None,
        product: None,
    };

    for part in parts {
        if let Some(model) = part.strip_prefix("model:") {
            entry.model = Some(model.replace('_', " "));
        } else if let Some(product) = part.strip_prefix("product:") {
            entry.product = Some(product.to_string());
        }
    }

    Some(entry)
}
