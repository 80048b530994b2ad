//! Parameter types for droid-mcp methods
//!
//! Every method's parameters deserialize from a JSON object. Shape errors
//! come from serde; [`Validate`] catches values serde accepts but the
//! device would not.

use base64::Engine;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::bridge::{LogBuffer, PackageFilter};
use crate::processing::{OutputFormat, ProcessOptions, Region};
use crate::recognition::{MatchRequest, OcrRequest, StageKind, StageRequest};

pub trait Validate {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListDevicesParams {}

impl Validate for ListDevicesParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct OcrStageParams {
    #[schemars(description = "Tesseract language code (default: \"eng\")")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[schemars(description = "Only read text inside this region")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MatchStageParams {
    #[schemars(description = "Template image to look for, base64 PNG or JPEG")]
    pub template: String,

    #[schemars(description = "Minimum similarity 0..1 (default: 0.7)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,

    #[schemars(description = "Only search inside this region")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    #[schemars(description = "Maximum number of matches (default: 10)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CaptureScreenParams {
    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[schemars(description = "Output format: \"png\" or \"jpeg\" (default: raw PNG)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,

    #[schemars(description = "JPEG quality 1-100 (default: 80, ignored for PNG)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,

    #[schemars(description = "Max output width in pixels, preserving aspect ratio (0 = no resize)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,

    #[schemars(description = "Crop the returned image to this region")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    #[schemars(description = "Recognition stages to run on the capture, in order: \"ocr\", \"imageMatch\"")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageKind>,

    #[schemars(description = "Options for the OCR stage")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr: Option<OcrStageParams>,

    #[schemars(description = "Options for the image match stage (template required)")]
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub image_match: Option<MatchStageParams>,
}

impl CaptureScreenParams {
    pub fn process_options(&self) -> ProcessOptions {
        let defaults = ProcessOptions::default();
        ProcessOptions {
            format: self.format.unwrap_or(defaults.format),
            quality: self.quality.unwrap_or(defaults.quality),
            max_width: self.max_width.unwrap_or(defaults.max_width),
            crop: self.region,
        }
    }

    /// Requested stages in order; a stage given only by its options object
    /// runs after the listed ones
    pub fn stage_requests(&self) -> Result<Vec<StageRequest>, String> {
        let mut kinds: Vec<StageKind> = Vec::new();
        let implied = [
            self.ocr.as_ref().map(|_| StageKind::Ocr),
            self.image_match.as_ref().map(|_| StageKind::ImageMatch),
        ];
        for kind in self.stages.iter().copied().chain(implied.into_iter().flatten()) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        kinds
            .into_iter()
            .map(|kind| match kind {
                StageKind::Ocr => Ok(StageRequest::Ocr(
                    self.ocr.as_ref().map(OcrStageParams::to_request).unwrap_or_default(),
                )),
                StageKind::ImageMatch => {
                    let options = self
                        .image_match
                        .as_ref()
                        .ok_or("the imageMatch stage needs match.template")?;
                    options.to_request().map(StageRequest::ImageMatch)
                }
            })
            .collect()
    }
}

impl Validate for CaptureScreenParams {
    fn validate(&self) -> Result<(), String> {
        if let Some(quality) = self.quality {
            if !(1..=100).contains(&quality) {
                return Err(format!("quality must be within 1..100, got {}", quality));
            }
        }
        validate_region(self.region.as_ref())?;
        if let Some(ocr) = &self.ocr {
            ocr.validate()?;
        }
        self.stage_requests().map(|_| ())
    }
}

impl OcrStageParams {
    fn to_request(&self) -> OcrRequest {
        OcrRequest {
            language: self.language.clone(),
            region: self.region,
        }
    }
}

impl Validate for OcrStageParams {
    fn validate(&self) -> Result<(), String> {
        validate_language(self.language.as_deref())?;
        validate_region(self.region.as_ref())
    }
}

impl MatchStageParams {
    pub fn to_request(&self) -> Result<MatchRequest, String> {
        match_request(&self.template, self.threshold, self.region, self.max_results)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LaunchAppParams {
    #[schemars(description = "Package name, e.g. \"com.android.settings\"")]
    pub package: String,

    #[schemars(description = "Activity to start, e.g. \".Settings\" (optional, launcher activity if omitted)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for LaunchAppParams {
    fn validate(&self) -> Result<(), String> {
        validate_package(&self.package)?;
        match &self.activity {
            Some(activity) if !is_component_name(activity) => {
                Err(format!("invalid activity name \"{}\"", activity))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StopAppParams {
    #[schemars(description = "Package name to force-stop")]
    pub package: String,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for StopAppParams {
    fn validate(&self) -> Result<(), String> {
        validate_package(&self.package)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TapParams {
    #[schemars(description = "X coordinate to tap")]
    pub x: u32,

    #[schemars(description = "Y coordinate to tap")]
    pub y: u32,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for TapParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LongPressParams {
    #[schemars(description = "X coordinate to press")]
    pub x: u32,

    #[schemars(description = "Y coordinate to press")]
    pub y: u32,

    #[schemars(description = "How long to hold, in milliseconds (default: 1000)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u32>,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl LongPressParams {
    pub fn duration(&self) -> u32 {
        self.duration_ms.unwrap_or(1000)
    }
}

impl Validate for LongPressParams {
    fn validate(&self) -> Result<(), String> {
        if self.duration_ms == Some(0) {
            return Err("duration_ms must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SwipeParams {
    #[schemars(description = "Starting X coordinate")]
    pub start_x: u32,

    #[schemars(description = "Starting Y coordinate")]
    pub start_y: u32,

    #[schemars(description = "Ending X coordinate")]
    pub end_x: u32,

    #[schemars(description = "Ending Y coordinate")]
    pub end_y: u32,

    #[schemars(description = "Swipe duration in milliseconds (optional)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u32>,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for SwipeParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct InputTextParams {
    #[schemars(description = "Text to type into the focused field")]
    pub text: String,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for InputTextParams {
    fn validate(&self) -> Result<(), String> {
        if self.text.is_empty() {
            return Err("text must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct KeyeventParams {
    #[schemars(description = "Key code: name (\"HOME\", \"KEYCODE_BACK\") or number (\"4\")")]
    pub key: String,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for KeyeventParams {
    fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() || !self.key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid key \"{}\"", self.key));
        }
        Ok(())
    }
}

impl KeyeventParams {
    /// Numeric codes and `KEYCODE_*` names pass through, bare names get the prefix
    pub fn keycode(&self) -> String {
        if self.key.starts_with("KEYCODE_") || self.key.parse::<u32>().is_ok() {
            self.key.clone()
        } else {
            format!("KEYCODE_{}", self.key.to_uppercase())
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RunOcrParams {
    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[schemars(description = "Only read text inside this region")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    #[schemars(description = "Tesseract language code (default: \"eng\")")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl RunOcrParams {
    pub fn to_request(&self) -> OcrRequest {
        OcrRequest {
            language: self.language.clone(),
            region: self.region,
        }
    }
}

impl Validate for RunOcrParams {
    fn validate(&self) -> Result<(), String> {
        validate_language(self.language.as_deref())?;
        validate_region(self.region.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MatchImageParams {
    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[schemars(description = "Template image to look for, base64 PNG or JPEG")]
    pub template: String,

    #[schemars(description = "Minimum similarity 0..1 (default: 0.7)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,

    #[schemars(description = "Only search inside this region")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,

    #[schemars(description = "Maximum number of matches (default: 10)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

impl MatchImageParams {
    pub fn to_request(&self) -> Result<MatchRequest, String> {
        match_request(&self.template, self.threshold, self.region, self.max_results)
    }
}

impl Validate for MatchImageParams {
    fn validate(&self) -> Result<(), String> {
        self.to_request().map(|_| ())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ShellParams {
    #[schemars(description = "Shell command line to run on the device")]
    pub command: String,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for ShellParams {
    fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PushFileParams {
    #[schemars(description = "Local file to upload")]
    pub local_path: String,

    #[schemars(description = "Destination path on the device, e.g. /sdcard/Download/a.txt")]
    pub remote_path: String,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for PushFileParams {
    fn validate(&self) -> Result<(), String> {
        validate_paths(&self.local_path, &self.remote_path)
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PullFileParams {
    #[schemars(description = "File on the device to download")]
    pub remote_path: String,

    #[schemars(description = "Local destination path")]
    pub local_path: String,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for PullFileParams {
    fn validate(&self) -> Result<(), String> {
        validate_paths(&self.local_path, &self.remote_path)
    }
}

/// Parameters of the methods that only name a device
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct DeviceParams {
    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for DeviceParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListAppsParams {
    #[schemars(description = "Which packages: \"third_party\" (default), \"system\" or \"all\"")]
    #[serde(default)]
    pub filter: PackageFilter,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for ListAppsParams {}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CheckAppInstalledParams {
    #[schemars(description = "Package name to look for")]
    pub package: String,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Validate for CheckAppInstalledParams {
    fn validate(&self) -> Result<(), String> {
        validate_package(&self.package)
    }
}

pub const MAX_LOG_LINES: u32 = 5000;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CaptureLogsParams {
    #[schemars(description = "Log buffer: main (default), events, radio, system or crash")]
    #[serde(default)]
    pub buffer: LogBuffer,

    #[schemars(description = "Number of most recent lines to read (default: 100, max: 5000)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<u32>,

    #[schemars(description = "Only keep lines containing this text, e.g. a package name")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    #[schemars(description = "Device serial number (optional, auto-selects if only one device)")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl CaptureLogsParams {
    pub fn line_count(&self) -> u32 {
        self.lines.unwrap_or(100)
    }
}

impl Validate for CaptureLogsParams {
    fn validate(&self) -> Result<(), String> {
        let lines = self.line_count();
        if !(1..=MAX_LOG_LINES).contains(&lines) {
            return Err(format!("lines must be within 1..{}, got {}", MAX_LOG_LINES, lines));
        }
        if self.filter.as_deref() == Some("") {
            return Err("filter must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectDeviceParams {
    #[schemars(description = "Network address of the device, host:port")]
    pub address: String,
}

impl Validate for ConnectDeviceParams {
    fn validate(&self) -> Result<(), String> {
        match self.address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
            _ => Err(format!("address must be host:port, got \"{}\"", self.address)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DisconnectDeviceParams {
    #[schemars(description = "Device serial number or host:port to disconnect")]
    pub device: String,
}

impl Validate for DisconnectDeviceParams {
    fn validate(&self) -> Result<(), String> {
        if self.device.is_empty() {
            return Err("device must not be empty".into());
        }
        Ok(())
    }
}

fn match_request(
    template: &str,
    threshold: Option<f32>,
    region: Option<Region>,
    max_results: Option<usize>,
) -> Result<MatchRequest, String> {
    if let Some(threshold) = threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(format!("threshold must be within 0..1, got {}", threshold));
        }
    }
    if max_results == Some(0) {
        return Err("max_results must be at least 1".into());
    }
    validate_region(region.as_ref())?;

    // Accept data URLs as well as bare base64
    let encoded = template
        .split_once(";base64,")
        .map_or(template, |(_, data)| data)
        .trim();
    let template = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("template is not valid base64: {}", e))?;
    if template.is_empty() {
        return Err("template must not be empty".into());
    }

    Ok(MatchRequest {
        template,
        threshold,
        region,
        max_results,
    })
}

fn validate_region(region: Option<&Region>) -> Result<(), String> {
    match region {
        Some(r) if r.width == 0 || r.height == 0 => {
            Err(format!("region {} must have a non-zero size", r))
        }
        _ => Ok(()),
    }
}

fn validate_language(language: Option<&str>) -> Result<(), String> {
    match language {
        Some(lang) if lang.is_empty() || !lang.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '+') => {
            Err(format!("invalid OCR language \"{}\"", lang))
        }
        _ => Ok(()),
    }
}

fn validate_package(package: &str) -> Result<(), String> {
    if is_component_name(package) && !package.starts_with('.') && package.contains('.') {
        Ok(())
    } else {
        Err(format!("invalid package name \"{}\"", package))
    }
}

fn is_component_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '$')
}

fn validate_paths(local: &str, remote: &str) -> Result<(), String> {
    if local.is_empty() {
        return Err("local_path must not be empty".into());
    }
    if !remote.starts_with('/') {
        return Err(format!("remote_path must be absolute, got \"{}\"", remote));
    }
    Ok(())
}
