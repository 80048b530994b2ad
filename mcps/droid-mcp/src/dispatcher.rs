//! Command dispatcher
//!
//! Turns a [`CommandRequest`] into exactly one [`CommandResult`]:
//!
//! ```text
//! Received -> Rejected                           (unknown method, bad params)
//! Received -> Resolved -> Executing -> Completed
//! ```
//!
//! Device work runs under a [`SessionLease`], so requests for one device are
//! executed one at a time in arrival order. A [`CancellationToken`] cancels a
//! request cleanly until it starts executing; after that the dispatcher waits
//! at most one bridge deadline for the call to settle and reports an
//! `Uncertain` outcome.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bridge::{
    shell_quote, AppInfo, BridgeAdapter, BridgeError, CaptureFrame, DeviceInfo, ForegroundApp,
    LogBuffer, ScreenSize, TransferReport,
};
use crate::config::Config;
use crate::error::{DroidError, DroidResult, ErrorDescriptor};
use crate::params::*;
use crate::processing::{process_capture, ProcessOptions, ProcessedImage, ProcessingError};
use crate::recognition::{Availability, RecognitionPipeline, RecognitionResult, StageKind, StageReport, StageRequest};
use crate::registry::{DeviceRegistry, SessionLease, SessionSnapshot};

/// The fixed set of methods a caller can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    ListDevices,
    CaptureScreen,
    LaunchApp,
    StopApp,
    Tap,
    LongPress,
    Swipe,
    InputText,
    Keyevent,
    RunOcr,
    MatchImage,
    Shell,
    PushFile,
    PullFile,
    ConnectDevice,
    DisconnectDevice,
    GetScreenSize,
    GetDeviceInfo,
    ListApps,
    CheckAppInstalled,
    GetCurrentApp,
    CaptureLogs,
}

impl Method {
    pub const ALL: [Method; 22] = [
        Method::ListDevices,
        Method::CaptureScreen,
        Method::LaunchApp,
        Method::StopApp,
        Method::Tap,
        Method::LongPress,
        Method::Swipe,
        Method::InputText,
        Method::Keyevent,
        Method::RunOcr,
        Method::MatchImage,
        Method::Shell,
        Method::PushFile,
        Method::PullFile,
        Method::ConnectDevice,
        Method::DisconnectDevice,
        Method::GetScreenSize,
        Method::GetDeviceInfo,
        Method::ListApps,
        Method::CheckAppInstalled,
        Method::GetCurrentApp,
        Method::CaptureLogs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::ListDevices => "list_devices",
            Method::CaptureScreen => "capture_screen",
            Method::LaunchApp => "launch_app",
            Method::StopApp => "stop_app",
            Method::Tap => "tap",
            Method::LongPress => "long_press",
            Method::Swipe => "swipe",
            Method::InputText => "input_text",
            Method::Keyevent => "keyevent",
            Method::RunOcr => "run_ocr",
            Method::MatchImage => "match_image",
            Method::Shell => "shell",
            Method::PushFile => "push_file",
            Method::PullFile => "pull_file",
            Method::ConnectDevice => "connect_device",
            Method::DisconnectDevice => "disconnect_device",
            Method::GetScreenSize => "get_screen_size",
            Method::GetDeviceInfo => "get_device_info",
            Method::ListApps => "list_apps",
            Method::CheckAppInstalled => "check_app_installed",
            Method::GetCurrentApp => "get_current_app",
            Method::CaptureLogs => "capture_logs",
        }
    }
}

impl FromStr for Method {
    type Err = DroidError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| DroidError::UnknownMethod(name.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A method with its validated parameters
#[derive(Debug)]
pub enum Command {
    ListDevices(ListDevicesParams),
    CaptureScreen(CaptureScreenParams),
    LaunchApp(LaunchAppParams),
    StopApp(StopAppParams),
    Tap(TapParams),
    LongPress(LongPressParams),
    Swipe(SwipeParams),
    InputText(InputTextParams),
    Keyevent(KeyeventParams),
    RunOcr(RunOcrParams),
    MatchImage(MatchImageParams),
    Shell(ShellParams),
    PushFile(PushFileParams),
    PullFile(PullFileParams),
    ConnectDevice(ConnectDeviceParams),
    DisconnectDevice(DisconnectDeviceParams),
    GetScreenSize(DeviceParams),
    GetDeviceInfo(DeviceParams),
    ListApps(ListAppsParams),
    CheckAppInstalled(CheckAppInstalledParams),
    GetCurrentApp(DeviceParams),
    CaptureLogs(CaptureLogsParams),
}

impl Command {
    /// Validate `params` against `method`'s schema; `null` counts as `{}`
    pub fn parse(method: Method, params: Value) -> DroidResult<Self> {
        Ok(match method {
            Method::ListDevices => Command::ListDevices(decode(params)?),
            Method::CaptureScreen => Command::CaptureScreen(decode(params)?),
            Method::LaunchApp => Command::LaunchApp(decode(params)?),
            Method::StopApp => Command::StopApp(decode(params)?),
            Method::Tap => Command::Tap(decode(params)?),
            Method::LongPress => Command::LongPress(decode(params)?),
            Method::Swipe => Command::Swipe(decode(params)?),
            Method::InputText => Command::InputText(decode(params)?),
            Method::Keyevent => Command::Keyevent(decode(params)?),
            Method::RunOcr => Command::RunOcr(decode(params)?),
            Method::MatchImage => Command::MatchImage(decode(params)?),
            Method::Shell => Command::Shell(decode(params)?),
            Method::PushFile => Command::PushFile(decode(params)?),
            Method::PullFile => Command::PullFile(decode(params)?),
            Method::ConnectDevice => Command::ConnectDevice(decode(params)?),
            Method::DisconnectDevice => Command::DisconnectDevice(decode(params)?),
            Method::GetScreenSize => Command::GetScreenSize(decode(params)?),
            Method::GetDeviceInfo => Command::GetDeviceInfo(decode(params)?),
            Method::ListApps => Command::ListApps(decode(params)?),
            Method::CheckAppInstalled => Command::CheckAppInstalled(decode(params)?),
            Method::GetCurrentApp => Command::GetCurrentApp(decode(params)?),
            Method::CaptureLogs => Command::CaptureLogs(decode(params)?),
        })
    }

    /// Device named by the parameters, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            Command::ListDevices(_) => None,
            Command::CaptureScreen(p) => p.device.as_deref(),
            Command::LaunchApp(p) => p.device.as_deref(),
            Command::StopApp(p) => p.device.as_deref(),
            Command::Tap(p) => p.device.as_deref(),
            Command::LongPress(p) => p.device.as_deref(),
            Command::Swipe(p) => p.device.as_deref(),
            Command::InputText(p) => p.device.as_deref(),
            Command::Keyevent(p) => p.device.as_deref(),
            Command::RunOcr(p) => p.device.as_deref(),
            Command::MatchImage(p) => p.device.as_deref(),
            Command::Shell(p) => p.device.as_deref(),
            Command::PushFile(p) => p.device.as_deref(),
            Command::PullFile(p) => p.device.as_deref(),
            Command::ConnectDevice(p) => Some(p.address.as_str()),
            Command::DisconnectDevice(p) => Some(p.device.as_str()),
            Command::GetScreenSize(p) | Command::GetDeviceInfo(p) | Command::GetCurrentApp(p) => {
                p.device.as_deref()
            }
            Command::ListApps(p) => p.device.as_deref(),
            Command::CheckAppInstalled(p) => p.device.as_deref(),
            Command::CaptureLogs(p) => p.device.as_deref(),
        }
    }
}

fn decode<P: DeserializeOwned + Validate>(params: Value) -> DroidResult<P> {
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };
    let parsed: P = serde_json::from_value(params).map_err(|e| DroidError::invalid(e.to_string()))?;
    parsed.validate().map_err(DroidError::invalid)?;
    Ok(parsed)
}

/// Caller-supplied request identifier, echoed back unchanged
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::Text(id.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: RequestId,
    pub method: String,
    /// Overrides any `device` inside `params`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default)]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            device: None,
            params,
        }
    }

    pub fn on_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    fn merged_params(&self) -> Value {
        let mut params = self.params.clone();
        if let Some(device) = &self.device {
            if params.is_null() {
                params = Value::Object(Default::default());
            }
            if let Value::Object(map) = &mut params {
                map.insert("device".into(), Value::String(device.clone()));
            }
        }
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Received,
    Resolved,
    Executing,
    Completed,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Payload),
    Error(ErrorDescriptor),
}

/// Method-specific success payloads
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Devices {
        devices: Vec<SessionSnapshot>,
    },
    Capture(CapturePayload),
    Ack {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Shell {
        stdout: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        stderr: String,
    },
    Recognition(RecognitionResult),
    Transfer(TransferReport),
    Device(SessionSnapshot),
    Screen(ScreenSize),
    DeviceInfo(DeviceInfo),
    Apps {
        apps: Vec<AppInfo>,
    },
    Installed {
        package: String,
        installed: bool,
    },
    Foreground(ForegroundApp),
    Logs {
        buffer: LogBuffer,
        lines: Vec<String>,
    },
}

impl Payload {
    fn ack() -> Self {
        Payload::Ack {
            success: true,
            detail: None,
        }
    }

    fn ack_with(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Payload::Ack {
            success: true,
            detail: (!detail.is_empty()).then_some(detail),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapturePayload {
    pub device: String,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
    #[serde(serialize_with = "as_base64")]
    pub data: Vec<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageReport>,
}

/// Capture metadata without the image bytes
#[derive(Debug, Serialize)]
pub struct CaptureSummary<'a> {
    pub device: &'a str,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub mime_type: &'a str,
    pub bytes: usize,
    #[serde(skip_serializing_if = "no_stages")]
    pub stages: &'a [StageReport],
}

impl CapturePayload {
    pub fn summary(&self) -> CaptureSummary<'_> {
        CaptureSummary {
            device: &self.device,
            captured_at: self.captured_at,
            width: self.width,
            height: self.height,
            mime_type: &self.mime_type,
            bytes: self.data.len(),
            stages: &self.stages,
        }
    }
}

fn no_stages(stages: &&[StageReport]) -> bool {
    stages.is_empty()
}

fn as_base64<T: AsRef<[u8]>, S: Serializer>(data: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data.as_ref()))
}

/// Terminal answer to one request
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub id: RequestId,
    pub method: String,
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Result(_))
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.outcome {
            Outcome::Result(payload) => Some(payload),
            Outcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorDescriptor> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(error) => Some(error),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    pipeline: Arc<RecognitionPipeline>,
}

impl Dispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, pipeline: Arc<RecognitionPipeline>) -> Self {
        Self { registry, pipeline }
    }

    pub fn from_config(config: &Config) -> Self {
        let bridge = BridgeAdapter::from_config(&config.bridge);
        Self::new(
            Arc::new(DeviceRegistry::from_config(bridge, &config.devices)),
            Arc::new(RecognitionPipeline::from_config(&config.recognition)),
        )
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<RecognitionPipeline> {
        &self.pipeline
    }

    pub async fn dispatch(&self, request: CommandRequest) -> CommandResult {
        self.dispatch_with_cancel(request, CancellationToken::new()).await
    }

    #[instrument(skip_all, fields(id = %request.id, method = %request.method))]
    pub async fn dispatch_with_cancel(
        &self,
        request: CommandRequest,
        cancel: CancellationToken,
    ) -> CommandResult {
        debug!(state = ?RequestState::Received, "request received");

        let parsed = request
            .method
            .parse::<Method>()
            .and_then(|method| Command::parse(method, request.merged_params()));

        let command = match parsed {
            Ok(command) => command,
            Err(e) => {
                warn!(state = ?RequestState::Rejected, error = %e, "request rejected");
                return CommandResult {
                    id: request.id,
                    method: request.method,
                    state: RequestState::Rejected,
                    device: request.device,
                    outcome: Outcome::Error(e.descriptor()),
                };
            }
        };

        let mut resolved = None;
        let outcome = match self.execute(&command, &cancel, &mut resolved).await {
            Ok(payload) => Outcome::Result(payload),
            Err(e) => {
                warn!(kind = %e.kind(), error = %e, "request failed");
                Outcome::Error(e.descriptor())
            }
        };

        let device = resolved.or_else(|| command.device().map(str::to_string));
        info!(state = ?RequestState::Completed, device = device.as_deref().unwrap_or("-"), "request completed");

        CommandResult {
            id: request.id,
            method: request.method,
            state: RequestState::Completed,
            device,
            outcome,
        }
    }

    async fn execute(
        &self,
        command: &Command,
        cancel: &CancellationToken,
        resolved: &mut Option<String>,
    ) -> DroidResult<Payload> {
        match command {
            Command::ListDevices(_) => {
                let devices = self.registry.list().await?;
                Ok(Payload::Devices { devices })
            }

            Command::CaptureScreen(p) => {
                let stages = p.stage_requests().map_err(DroidError::invalid)?;
                let frame = self.capture(p.device.as_deref(), cancel, resolved).await?;
                self.finish_capture(frame, p.process_options(), &stages).await
            }

            Command::LaunchApp(p) => {
                let output = self
                    .on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                        let output = match &p.activity {
                            Some(activity) => {
                                let component = shell_quote(&format!("{}/{}", p.package, activity));
                                lease.shell_args(&["am", "start", "-n", component.as_str()]).await?
                            }
                            None => {
                                lease
                                    .shell_args(&[
                                        "monkey",
                                        "-p",
                                        p.package.as_str(),
                                        "-c",
                                        "android.intent.category.LAUNCHER",
                                        "1",
                                    ])
                                    .await?
                            }
                        };
                        Ok::<_, DroidError>(output)
                    })
                    .await?;

                // am and monkey exit 0 even when nothing was launched
                let text = format!("{}\n{}", output.stdout, output.stderr);
                if let Some(line) = text.lines().map(str::trim).find(|l| is_launch_failure(l)) {
                    return Err(BridgeError::CommandFailed {
                        command: format!("launch {}", p.package),
                        code: 0,
                        stderr: line.to_string(),
                    }
                    .into());
                }
                info!(package = %p.package, "app launched");
                Ok(Payload::ack_with(output.stdout.lines().next().unwrap_or_default().trim()))
            }

            Command::StopApp(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    lease.shell_args(&["am", "force-stop", p.package.as_str()]).await?;
                    Ok::<_, DroidError>(Payload::ack())
                })
                .await
            }

            Command::Tap(p) => {
                let (x, y) = (p.x.to_string(), p.y.to_string());
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    lease.shell_args(&["input", "tap", x.as_str(), y.as_str()]).await?;
                    Ok::<_, DroidError>(Payload::ack())
                })
                .await
            }

            Command::LongPress(p) => {
                let (x, y) = (p.x.to_string(), p.y.to_string());
                let duration = p.duration().to_string();
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let (x, y) = (x.as_str(), y.as_str());
                    lease.shell_args(&["input", "swipe", x, y, x, y, duration.as_str()]).await?;
                    Ok::<_, DroidError>(Payload::ack())
                })
                .await
            }

            Command::Swipe(p) => {
                let mut words: Vec<String> = [p.start_x, p.start_y, p.end_x, p.end_y]
                    .iter()
                    .map(u32::to_string)
                    .collect();
                if let Some(duration) = p.duration_ms {
                    words.push(duration.to_string());
                }
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let mut argv = vec!["input", "swipe"];
                    argv.extend(words.iter().map(String::as_str));
                    lease.shell_args(&argv).await?;
                    Ok::<_, DroidError>(Payload::ack())
                })
                .await
            }

            Command::InputText(p) => {
                let text = encode_input_text(&p.text);
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    lease.shell_args(&["input", "text", text.as_str()]).await?;
                    Ok::<_, DroidError>(Payload::ack())
                })
                .await
            }

            Command::Keyevent(p) => {
                let keycode = p.keycode();
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    lease.shell_args(&["input", "keyevent", keycode.as_str()]).await?;
                    Ok::<_, DroidError>(Payload::ack_with(keycode))
                })
                .await
            }

            Command::RunOcr(p) => {
                self.require(StageKind::Ocr).await?;
                let frame = self.capture(p.device.as_deref(), cancel, resolved).await?;
                let result = self.pipeline.ocr(&frame, &p.to_request()).await?;
                Ok(Payload::Recognition(result))
            }

            Command::MatchImage(p) => {
                let request = p.to_request().map_err(DroidError::invalid)?;
                self.require(StageKind::ImageMatch).await?;
                let frame = self.capture(p.device.as_deref(), cancel, resolved).await?;
                let result = self.pipeline.match_template(&frame, &request).await?;
                Ok(Payload::Recognition(result))
            }

            Command::Shell(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let output = lease.shell(&p.command).await?;
                    Ok::<_, DroidError>(Payload::Shell {
                        stdout: output.stdout,
                        stderr: output.stderr,
                    })
                })
                .await
            }

            Command::PushFile(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let report = lease.push_file(Path::new(&p.local_path), &p.remote_path).await?;
                    Ok::<_, DroidError>(Payload::Transfer(report))
                })
                .await
            }

            Command::PullFile(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let report = lease.pull_file(&p.remote_path, Path::new(&p.local_path)).await?;
                    Ok::<_, DroidError>(Payload::Transfer(report))
                })
                .await
            }

            Command::ConnectDevice(p) => {
                cancelled_before_start(cancel)?;
                let snapshot = self.registry.connect(&p.address).await?;
                *resolved = Some(snapshot.device.clone());
                Ok(Payload::Device(snapshot))
            }

            Command::DisconnectDevice(p) => {
                cancelled_before_start(cancel)?;
                self.registry.disconnect(&p.device).await?;
                *resolved = Some(p.device.clone());
                Ok(Payload::ack())
            }

            Command::GetScreenSize(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    Ok::<_, DroidError>(Payload::Screen(lease.screen_size().await?))
                })
                .await
            }

            Command::GetDeviceInfo(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    Ok::<_, DroidError>(Payload::DeviceInfo(lease.device_info().await?))
                })
                .await
            }

            Command::ListApps(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let apps = lease.list_packages(p.filter).await?;
                    Ok::<_, DroidError>(Payload::Apps { apps })
                })
                .await
            }

            Command::CheckAppInstalled(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let installed = lease.package_installed(&p.package).await?;
                    Ok::<_, DroidError>(Payload::Installed {
                        package: p.package.clone(),
                        installed,
                    })
                })
                .await
            }

            Command::GetCurrentApp(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    Ok::<_, DroidError>(Payload::Foreground(lease.foreground_app().await?))
                })
                .await
            }

            Command::CaptureLogs(p) => {
                self.on_device(p.device.as_deref(), cancel, resolved, |lease| async move {
                    let lines = lease
                        .logcat(p.buffer, p.line_count(), p.filter.as_deref())
                        .await?;
                    Ok::<_, DroidError>(Payload::Logs {
                        buffer: p.buffer,
                        lines,
                    })
                })
                .await
            }
        }
    }

    /// Resolve the target session, lease it and run `op`
    ///
    /// Cancellation while resolving or queued yields `Cancelled` and the
    /// device is never touched. Once `op` runs, a cancel waits at most one
    /// bridge deadline for it before giving up on the device call.
    async fn on_device<T, F, Fut>(
        &self,
        device: Option<&str>,
        cancel: &CancellationToken,
        resolved: &mut Option<String>,
        op: F,
    ) -> DroidResult<T>
    where
        F: FnOnce(SessionLease) -> Fut,
        Fut: Future<Output = DroidResult<T>>,
    {
        cancelled_before_start(cancel)?;

        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(RequestState::Received)),
            session = self.registry.acquire(device) => session?,
        };
        *resolved = Some(session.id().to_string());
        debug!(state = ?RequestState::Resolved, device = session.id(), "session resolved");

        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(RequestState::Resolved)),
            lease = self.registry.lease(&session) => lease?,
        };
        debug!(state = ?RequestState::Executing, device = session.id(), "executing");

        let work = op(lease);
        tokio::pin!(work);
        let finished = tokio::select! {
            biased;
            result = &mut work => Some(result),
            _ = cancel.cancelled() => None,
        };
        if let Some(result) = finished {
            return result;
        }

        let grace = self.registry.bridge().policy().timeout;
        warn!(device = session.id(), ?grace, "cancelled during execution, waiting for the device call to settle");
        let detail = match tokio::time::timeout(grace, work).await {
            Ok(Ok(_)) => "the operation finished after cancellation".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("abandoned the device call, no answer within {:?} of cancellation", grace),
        };
        Err(DroidError::Uncertain(detail))
    }

    async fn capture(
        &self,
        device: Option<&str>,
        cancel: &CancellationToken,
        resolved: &mut Option<String>,
    ) -> DroidResult<CaptureFrame> {
        self.on_device(device, cancel, resolved, |lease| async move {
            lease.capture_screen().await.map_err(DroidError::from)
        })
        .await
    }

    async fn require(&self, stage: StageKind) -> DroidResult<()> {
        match self.pipeline.availability(stage).await {
            Availability::Available => Ok(()),
            Availability::Unavailable(reason) => Err(DroidError::RecognitionUnavailable {
                stage: stage.name().to_string(),
                reason,
            }),
        }
    }

    /// Recognition and re-encoding run after the device is released
    async fn finish_capture(
        &self,
        frame: CaptureFrame,
        options: ProcessOptions,
        stages: &[StageRequest],
    ) -> DroidResult<Payload> {
        let reports = if stages.is_empty() {
            Vec::new()
        } else {
            self.pipeline.run(&frame, stages).await
        };

        let image = if options.is_passthrough() {
            ProcessedImage {
                data: frame.data.clone(),
                mime_type: "image/png",
                width: frame.width,
                height: frame.height,
            }
        } else {
            let png = frame.data.clone();
            tokio::task::spawn_blocking(move || process_capture(&png, &options))
                .await
                .map_err(|e| capture_output_error(e.to_string()))?
                .map_err(processing_error)?
        };

        debug!(
            device = %frame.device,
            bytes = image.data.len(),
            stages = reports.len(),
            "capture ready"
        );

        Ok(Payload::Capture(CapturePayload {
            device: frame.device,
            captured_at: frame.captured_at,
            width: image.width,
            height: image.height,
            mime_type: image.mime_type.to_string(),
            data: image.data,
            stages: reports,
        }))
    }
}

fn cancelled_before_start(cancel: &CancellationToken) -> DroidResult<()> {
    if cancel.is_cancelled() {
        return Err(cancelled(RequestState::Received));
    }
    Ok(())
}

fn cancelled(state: RequestState) -> DroidError {
    info!(state = ?state, "request cancelled before execution");
    DroidError::Cancelled
}

fn processing_error(e: ProcessingError) -> DroidError {
    match e {
        ProcessingError::OutsideFrame { .. } => DroidError::invalid(e.to_string()),
        other => capture_output_error(other.to_string()),
    }
}

fn capture_output_error(reason: String) -> DroidError {
    BridgeError::InvalidOutput {
        command: "exec-out screencap -p".into(),
        reason,
    }
    .into()
}

fn is_launch_failure(line: &str) -> bool {
    line.starts_with("Error")
        || line.contains("No activities found")
        || line.contains("monkey aborted")
        || line.contains("does not exist")
}

/// `input text` argument: spaces become `%s`, the rest is quoted for the
/// device shell
fn encode_input_text(text: &str) -> String {
    shell_quote(&text.replace(' ', "%s"))
}
