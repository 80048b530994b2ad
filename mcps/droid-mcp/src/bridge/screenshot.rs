use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::png::{self, PngError, PngInfo};
use super::{device_args, BridgeAdapter, BridgeError, BridgeResult, CallKind};

const STORAGE_CAPTURE_PATH: &str = "/sdcard/droid_mcp_capture.png";

/// One screen capture, as PNG bytes
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub device: String,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl CaptureFrame {
    fn new(device: &str, data: Vec<u8>, info: PngInfo) -> Self {
        Self {
            device: device.to_string(),
            captured_at: Utc::now(),
            width: info.width,
            height: info.height,
            data,
        }
    }
}

impl BridgeAdapter {
    /// Capture the screen, streaming first and falling back to device storage
    ///
    /// Timeouts and unreachable devices are returned immediately; only a
    /// failed or garbled stream triggers the fallback.
    pub async fn capture_screen(&self, serial: &str) -> BridgeResult<CaptureFrame> {
        info!(device = serial, "capturing screen");

        match self.capture_streamed(serial).await {
            Ok(frame) => return Ok(frame),
            Err(e @ (BridgeError::Timeout { .. } | BridgeError::Unreachable { .. })) => {
                return Err(e)
            }
            Err(e) => warn!(device = serial, error = %e, "streamed capture failed, using device storage"),
        }

        self.capture_via_storage(serial).await
    }

    async fn capture_streamed(&self, serial: &str) -> BridgeResult<CaptureFrame> {
        let argv = device_args(serial, ["exec-out", "screencap", "-p"]);
        let output = self.invoke_checked(&argv, CallKind::Query).await?;

        let (data, info) = png::normalize(output.stdout).map_err(|e| invalid(&argv, e))?;
        debug!(width = info.width, height = info.height, "streamed capture ok");
        Ok(CaptureFrame::new(serial, data, info))
    }

    async fn capture_via_storage(&self, serial: &str) -> BridgeResult<CaptureFrame> {
        let capture = device_args(serial, ["shell", "screencap", "-p", STORAGE_CAPTURE_PATH]);
        self.invoke_checked(&capture, CallKind::Query).await?;

        let argv = device_args(serial, ["exec-out", "cat", STORAGE_CAPTURE_PATH]);
        let read_back = self.invoke_checked(&argv, CallKind::Query).await;

        if let Err(e) = self
            .invoke(&device_args(serial, ["shell", "rm", "-f", STORAGE_CAPTURE_PATH]), CallKind::Query)
            .await
        {
            warn!(device = serial, error = %e, "failed to remove capture from device storage");
        }

        let (data, info) = png::normalize(read_back?.stdout).map_err(|e| invalid(&argv, e))?;
        debug!(width = info.width, height = info.height, "storage capture ok");
        Ok(CaptureFrame::new(serial, data, info))
    }
}

fn invalid(argv: &[String], e: PngError) -> BridgeError {
    BridgeError::InvalidOutput {
        command: argv.join(" "),
        reason: e.to_string(),
    }
}
