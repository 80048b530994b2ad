//! MCP server exposing device commands as tools

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use mcp_common::{
    async_trait, CallToolResult, EmbeddableError, EmbeddableMcp, EmbeddableResult, McpError,
    ResultExt, Tool,
};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    service::RequestContext,
    tool, tool_handler, tool_router, RoleServer,
};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatcher::{CommandRequest, Dispatcher, Method, RequestId};
use crate::params::*;

/// The droid MCP server
#[derive(Clone)]
pub struct DroidMcpServer {
    dispatcher: Arc<Dispatcher>,
    /// Ids for calls that arrive without a protocol request id
    next_id: Arc<AtomicI64>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl DroidMcpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            next_id: Arc::new(AtomicI64::new(1)),
            tool_router: Self::tool_router(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Arc::new(Dispatcher::from_config(config)))
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[tool(description = "List attached Android devices with their connection state, model and queue depth")]
    async fn list_devices(
        &self,
        Parameters(params): Parameters<ListDevicesParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::ListDevices, &params, ctx).await
    }

    #[tool(description = "Capture the device screen. Returns the PNG (or JPEG when requested), optionally cropped/resized, plus results of the requested recognition stages (ocr, imageMatch).")]
    async fn capture_screen(
        &self,
        Parameters(params): Parameters<CaptureScreenParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::CaptureScreen, &params, ctx).await
    }

    #[tool(description = "Launch an app by package name, optionally a specific activity")]
    async fn launch_app(
        &self,
        Parameters(params): Parameters<LaunchAppParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::LaunchApp, &params, ctx).await
    }

    #[tool(description = "Force-stop an app by package name")]
    async fn stop_app(
        &self,
        Parameters(params): Parameters<StopAppParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::StopApp, &params, ctx).await
    }

    #[tool(description = "Tap at specific x,y coordinates on the device screen")]
    async fn tap(
        &self,
        Parameters(params): Parameters<TapParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::Tap, &params, ctx).await
    }

    #[tool(description = "Press and hold at x,y coordinates (default 1000 ms)")]
    async fn long_press(
        &self,
        Parameters(params): Parameters<LongPressParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::LongPress, &params, ctx).await
    }

    #[tool(description = "Perform a swipe gesture from start to end coordinates")]
    async fn swipe(
        &self,
        Parameters(params): Parameters<SwipeParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::Swipe, &params, ctx).await
    }

    #[tool(description = "Type text on the device (requires focus on a text field)")]
    async fn input_text(
        &self,
        Parameters(params): Parameters<InputTextParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::InputText, &params, ctx).await
    }

    #[tool(description = "Send a key event (e.g., BACK, HOME, ENTER, or numeric keycode)")]
    async fn keyevent(
        &self,
        Parameters(params): Parameters<KeyeventParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::Keyevent, &params, ctx).await
    }

    #[tool(description = "Capture the screen and read its text with OCR. Returns words with bounding boxes and confidence; empty when no text is found.")]
    async fn run_ocr(
        &self,
        Parameters(params): Parameters<RunOcrParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::RunOcr, &params, ctx).await
    }

    #[tool(description = "Capture the screen and locate a template image on it. Returns matched regions with tap centers, best first.")]
    async fn match_image(
        &self,
        Parameters(params): Parameters<MatchImageParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::MatchImage, &params, ctx).await
    }

    #[tool(description = "Execute a shell command on the device and return its output")]
    async fn shell(
        &self,
        Parameters(params): Parameters<ShellParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::Shell, &params, ctx).await
    }

    #[tool(description = "Upload a local file to the device. The file only appears at remote_path once fully transferred.")]
    async fn push_file(
        &self,
        Parameters(params): Parameters<PushFileParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::PushFile, &params, ctx).await
    }

    #[tool(description = "Download a file from the device. The file only appears at local_path once fully transferred.")]
    async fn pull_file(
        &self,
        Parameters(params): Parameters<PullFileParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::PullFile, &params, ctx).await
    }

    #[tool(description = "Connect to a device over the network (adb connect host:port)")]
    async fn connect_device(
        &self,
        Parameters(params): Parameters<ConnectDeviceParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::ConnectDevice, &params, ctx).await
    }

    #[tool(description = "Forget a device session once idle; network devices are also disconnected")]
    async fn disconnect_device(
        &self,
        Parameters(params): Parameters<DisconnectDeviceParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::DisconnectDevice, &params, ctx).await
    }

    #[tool(description = "Get the effective screen resolution in pixels (an override set with wm size wins)")]
    async fn get_screen_size(
        &self,
        Parameters(params): Parameters<DeviceParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::GetScreenSize, &params, ctx).await
    }

    #[tool(description = "Get device model, manufacturer, Android version, SDK level and screen size")]
    async fn get_device_info(
        &self,
        Parameters(params): Parameters<DeviceParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::GetDeviceInfo, &params, ctx).await
    }

    #[tool(description = "List installed packages: third_party (default), system or all")]
    async fn list_apps(
        &self,
        Parameters(params): Parameters<ListAppsParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::ListApps, &params, ctx).await
    }

    #[tool(description = "Check whether a package is installed")]
    async fn check_app_installed(
        &self,
        Parameters(params): Parameters<CheckAppInstalledParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::CheckAppInstalled, &params, ctx).await
    }

    #[tool(description = "Get the package and activity currently in the foreground")]
    async fn get_current_app(
        &self,
        Parameters(params): Parameters<DeviceParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::GetCurrentApp, &params, ctx).await
    }

    #[tool(description = "Read recent logcat lines from a buffer (main, events, radio, system, crash), optionally filtered by text such as a package name")]
    async fn capture_logs(
        &self,
        Parameters(params): Parameters<CaptureLogsParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(Method::CaptureLogs, &params, ctx).await
    }
}

impl DroidMcpServer {
    async fn call<P: Serialize>(
        &self,
        method: Method,
        params: &P,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let id = serde_json::to_value(&ctx.id)
            .ok()
            .and_then(|v| serde_json::from_value::<RequestId>(v).ok())
            .unwrap_or_else(|| self.fresh_id());
        let params = serde_json::to_value(params).to_mcp_err()?;

        self.dispatcher
            .dispatch_with_cancel(CommandRequest::new(id, method.as_str(), params), ctx.ct)
            .await
            .into_call_result()
    }

    fn fresh_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

#[tool_handler]
impl rmcp::ServerHandler for DroidMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Android device control over adb. Use list_devices to see attached devices; \
                 every other tool takes an optional device serial and auto-selects when exactly \
                 one device is connected. Commands for one device run one at a time, in order. \
                 capture_screen can run OCR and template matching on the same frame via `stages`."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EmbeddableMcp for DroidMcpServer {
    fn server_name(&self) -> &str {
        "droid-mcp"
    }

    fn list_tools(&self) -> Vec<Tool> {
        self.tool_router.list_all()
    }

    async fn call_tool(&self, name: &str, params: Value) -> EmbeddableResult<CallToolResult> {
        let request = CommandRequest::new(self.fresh_id(), name, params);
        let result = self
            .dispatcher
            .dispatch_with_cancel(request, CancellationToken::new())
            .await;
        result.into_call_result().map_err(EmbeddableError::from)
    }

    fn server_description(&self) -> Option<&str> {
        Some("Android device orchestration over adb with OCR and image matching")
    }

    fn server_version(&self) -> Option<&str> {
        Some(env!("CARGO_PKG_VERSION"))
    }
}
