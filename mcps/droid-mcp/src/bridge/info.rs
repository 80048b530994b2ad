//! Read-only device queries: screen size, properties, packages, focus, logs
//!
//! Everything here runs as a [`CallKind::Query`](super::CallKind::Query).
//! Filtering happens on the host so no caller text reaches a device pipe.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{shell_quote, BridgeAdapter, BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
    pub manufacturer: String,
    pub android_version: String,
    pub sdk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenSize>,
}

/// The app holding input focus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForegroundApp {
    pub package: Option<String>,
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PackageFilter {
    #[default]
    ThirdParty,
    System,
    All,
}

impl PackageFilter {
    fn flag(self) -> Option<&'static str> {
        match self {
            PackageFilter::ThirdParty => Some("-3"),
            PackageFilter::System => Some("-s"),
            PackageFilter::All => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogBuffer {
    #[default]
    Main,
    Events,
    Radio,
    System,
    Crash,
}

impl LogBuffer {
    fn name(self) -> &'static str {
        match self {
            LogBuffer::Main => "main",
            LogBuffer::Events => "events",
            LogBuffer::Radio => "radio",
            LogBuffer::System => "system",
            LogBuffer::Crash => "crash",
        }
    }
}

/// Installed package entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    pub package: String,
}

impl BridgeAdapter {
    /// Effective display size; an override set with `wm size` wins
    pub async fn screen_size(&self, serial: &str) -> BridgeResult<ScreenSize> {
        let output = self.query(serial, &["wm", "size"]).await?;
        parse_wm_size(&output.stdout).ok_or_else(|| BridgeError::InvalidOutput {
            command: "shell wm size".into(),
            reason: format!("no size in {:?}", output.stdout.trim()),
        })
    }

    pub async fn device_info(&self, serial: &str) -> BridgeResult<DeviceInfo> {
        let output = self.query(serial, &["getprop"]).await?;
        let props = parse_getprop(&output.stdout);
        let prop = |key: &str| props.get(key).cloned().unwrap_or_default();

        let screen = match self.screen_size(serial).await {
            Ok(size) => Some(size),
            Err(e @ (BridgeError::Timeout { .. } | BridgeError::Unreachable { .. })) => return Err(e),
            Err(e) => {
                debug!(device = serial, error = %e, "screen size unavailable");
                None
            }
        };

        Ok(DeviceInfo {
            serial: props
                .get("ro.serialno")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| serial.to_string()),
            model: prop("ro.product.model"),
            manufacturer: prop("ro.product.manufacturer"),
            android_version: prop("ro.build.version.release"),
            sdk: prop("ro.build.version.sdk"),
            screen,
        })
    }

    /// Installed packages, sorted
    pub async fn list_packages(&self, serial: &str, filter: PackageFilter) -> BridgeResult<Vec<AppInfo>> {
        let mut words = vec!["pm", "list", "packages"];
        words.extend(filter.flag());
        let output = self.query(serial, &words).await?;

        let mut packages = parse_packages(&output.stdout);
        packages.sort();
        debug!(device = serial, count = packages.len(), "listed packages");
        Ok(packages.into_iter().map(|package| AppInfo { package }).collect())
    }

    /// `pm list packages <name>` matches substrings, so look for the exact entry
    pub async fn package_installed(&self, serial: &str, package: &str) -> BridgeResult<bool> {
        let output = self
            .query(serial, &["pm", "list", "packages", shell_quote(package).as_str()])
            .await?;
        Ok(parse_packages(&output.stdout).iter().any(|p| p == package))
    }

    pub async fn foreground_app(&self, serial: &str) -> BridgeResult<ForegroundApp> {
        let output = self.query(serial, &["dumpsys", "window"]).await?;
        Ok(parse_focus(&output.stdout))
    }

    /// Last `lines` entries of a log buffer, optionally only those mentioning `filter`
    pub async fn logcat(
        &self,
        serial: &str,
        buffer: LogBuffer,
        lines: u32,
        filter: Option<&str>,
    ) -> BridgeResult<Vec<String>> {
        let count = lines.to_string();
        let output = self
            .query(serial, &["logcat", "-b", buffer.name(), "-d", "-t", count.as_str()])
            .await?;

        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.starts_with("--------- beginning of"))
            .filter(|line| filter.map_or(true, |f| line.contains(f)))
            .map(str::to_string)
            .collect())
    }
}

/// `Physical size: 1080x2400`, optionally followed by `Override size: ...`
fn parse_wm_size(stdout: &str) -> Option<ScreenSize> {
    stdout
        .lines()
        .filter_map(|line| line.rsplit(' ').next())
        .filter_map(|dims| {
            let (w, h) = dims.trim().split_once('x')?;
            Some(ScreenSize {
                width: w.parse().ok()?,
                height: h.parse().ok()?,
            })
        })
        .last()
}

/// `[ro.product.model]: [Pixel 7]` lines
fn parse_getprop(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once("]: [")?;
            let key = key.strip_prefix('[')?;
            let value = value.strip_suffix(']')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_packages(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::to_string)
        .collect()
}

/// `mCurrentFocus=Window{4f1c u0 com.android.settings/com.android.settings.Settings}`,
/// falling back to `mFocusedApp` when no window has focus
fn parse_focus(stdout: &str) -> ForegroundApp {
    ["mCurrentFocus=", "mFocusedApp="]
        .iter()
        .find_map(|marker| {
            stdout
                .lines()
                .filter(|line| line.contains(marker))
                .find_map(component_of)
        })
        .unwrap_or_default()
}

fn component_of(line: &str) -> Option<ForegroundApp> {
    let token = line
        .split_whitespace()
        .map(|t| t.trim_end_matches('}'))
        .find(|t| t.contains('/') && !t.contains('='))?;
    let (package, activity) = token.split_once('/')?;
    let activity = match activity.strip_prefix(package) {
        Some(rest) if rest.starts_with('.') => rest,
        _ => activity,
    };
    Some(ForegroundApp {
        package: Some(package.to_string()),
        activity: Some(activity.to_string()),
    })
}
