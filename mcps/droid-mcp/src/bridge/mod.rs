//! Bridge adapter: every interaction with the `adb` executable
//!
//! Each call runs under a deadline. Spawn failures and adb transport faults
//! are retried with a fixed backoff, and so are timed-out [`CallKind::Query`]
//! calls. A timed-out [`CallKind::Action`] is not repeated, since the device
//! may already have acted on it. Everything else is terminal.
//!
//! ```rust,ignore
//! let adapter = BridgeAdapter::new(Arc::new(ProcessRunner::new("adb")), RetryPolicy::default());
//! let devices = adapter.enumerate_devices().await?;
//! let frame = adapter.capture_screen(&devices[0].serial).await?;
//! ```

mod device;
mod error;
mod info;
pub mod png;
mod runner;
mod screenshot;
mod transfer;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use crate::config::BridgeConfig;

pub use device::{parse_device_list, DeviceEntry};
pub use error::{BridgeError, BridgeResult};
pub use info::{AppInfo, DeviceInfo, ForegroundApp, LogBuffer, PackageFilter, ScreenSize};
pub use runner::{BridgeOutput, BridgeRunner, ProcessRunner};
pub use screenshot::CaptureFrame;
pub use transfer::TransferReport;

/// adb's own error lines (as opposed to a remote command's stderr) that mean
/// the transport, not the command, failed
const TRANSPORT_FAULTS: &[&str] = &[
    "device offline",
    "not found",
    "no devices/emulators found",
    "closed",
    "protocol fault",
    "cannot connect to daemon",
    "connection reset",
];

/// Per-call deadline and retry bounds
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        (&BridgeConfig::default()).into()
    }
}

impl From<&BridgeConfig> for RetryPolicy {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        }
    }
}

/// Stdout/stderr of a successful device shell command
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Whether a call may be repeated after it timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Reads device state, or rewrites the same scratch file
    Query,
    /// Changes device state
    Action,
}

enum Attempt {
    Finished(BridgeOutput),
    Transient(String),
}

#[derive(Clone)]
pub struct BridgeAdapter {
    runner: Arc<dyn BridgeRunner>,
    policy: RetryPolicy,
}

impl BridgeAdapter {
    pub fn new(runner: Arc<dyn BridgeRunner>, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(Arc::new(ProcessRunner::new(&config.adb_path)), config.into())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run adb with retry; a non-zero exit is returned, not raised
    #[instrument(skip(self, args), fields(cmd = %args.join(" ")))]
    pub(crate) async fn invoke(&self, args: &[String], kind: CallKind) -> BridgeResult<BridgeOutput> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let reason = match self.attempt(args, kind).await? {
                Attempt::Finished(output) => return Ok(output),
                Attempt::Transient(reason) => reason,
            };

            if attempt >= max_attempts {
                error!(attempt, %reason, "adb transport failure persisted, giving up");
                return Err(BridgeError::Unreachable {
                    attempts: attempt,
                    reason,
                });
            }

            warn!(attempt, max_attempts, %reason, "transient adb failure, retrying");
            tokio::time::sleep(self.policy.backoff).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, args: &[String], kind: CallKind) -> BridgeResult<Attempt> {
        match tokio::time::timeout(self.policy.timeout, self.runner.run(args)).await {
            Err(_) if kind == CallKind::Query => Ok(Attempt::Transient(format!(
                "no answer within {:?}",
                self.policy.timeout
            ))),
            Err(_) => {
                warn!(timeout = ?self.policy.timeout, "adb call timed out");
                Err(BridgeError::Timeout {
                    command: args.join(" "),
                    timeout: self.policy.timeout,
                })
            }
            Ok(Err(e)) => Ok(Attempt::Transient(format!("failed to run adb: {}", e))),
            Ok(Ok(output)) => match transport_fault(&output) {
                Some(fault) => Ok(Attempt::Transient(fault)),
                None => Ok(Attempt::Finished(output)),
            },
        }
    }

    /// Like [`invoke`](Self::invoke), but a non-zero exit is an error
    pub(crate) async fn invoke_checked(
        &self,
        args: &[String],
        kind: CallKind,
    ) -> BridgeResult<BridgeOutput> {
        let output = self.invoke(args, kind).await?;
        if !output.success() {
            let stderr = if output.stderr.trim().is_empty() {
                output.stdout_text().trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            error!(code = output.code, stderr = %stderr, "adb command failed");
            return Err(BridgeError::CommandFailed {
                command: args.join(" "),
                code: output.code,
                stderr,
            });
        }
        Ok(output)
    }

    /// First line of `adb version`
    pub async fn version(&self) -> BridgeResult<String> {
        let output = self.invoke_checked(&args(["version"]), CallKind::Query).await?;
        Ok(output
            .stdout_text()
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    pub async fn enumerate_devices(&self) -> BridgeResult<Vec<DeviceEntry>> {
        let output = self.invoke_checked(&args(["devices", "-l"]), CallKind::Query).await?;
        let devices = parse_device_list(&output.stdout_text());
        debug!(count = devices.len(), "enumerated devices");
        Ok(devices)
    }

    /// Run a shell command line on the device
    pub async fn shell(&self, serial: &str, command: &str) -> BridgeResult<ShellOutput> {
        self.shell_args(serial, &[command]).await
    }

    /// Run a shell command given as separate words; adb joins them with spaces
    pub async fn shell_args(&self, serial: &str, words: &[&str]) -> BridgeResult<ShellOutput> {
        self.run_shell(serial, words, CallKind::Action).await
    }

    /// Like [`shell_args`](Self::shell_args), for commands that only read
    pub async fn query(&self, serial: &str, words: &[&str]) -> BridgeResult<ShellOutput> {
        self.run_shell(serial, words, CallKind::Query).await
    }

    async fn run_shell(&self, serial: &str, words: &[&str], kind: CallKind) -> BridgeResult<ShellOutput> {
        let mut argv = device_args(serial, ["shell"]);
        argv.extend(words.iter().map(|w| w.to_string()));

        let output = self.invoke_checked(&argv, kind).await?;
        Ok(ShellOutput {
            stdout: output.stdout_text(),
            stderr: output.stderr,
        })
    }

    /// `adb connect <address>`; adb exits 0 even when the connection fails
    pub async fn connect(&self, address: &str) -> BridgeResult<String> {
        let argv = args(["connect", address]);
        let output = self.invoke_checked(&argv, CallKind::Action).await?;
        let message = output.stdout_text().trim().to_string();
        if message.starts_with("connected to") || message.starts_with("already connected to") {
            Ok(message)
        } else {
            Err(BridgeError::CommandFailed {
                command: argv.join(" "),
                code: output.code,
                stderr: message,
            })
        }
    }

    pub async fn disconnect(&self, address: &str) -> BridgeResult<()> {
        self.invoke_checked(&args(["disconnect", address]), CallKind::Action).await?;
        Ok(())
    }
}

fn transport_fault(output: &BridgeOutput) -> Option<String> {
    if output.success() {
        return None;
    }
    output
        .stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("error:") || line.starts_with("adb: "))
        .find(|line| {
            let line = line.to_ascii_lowercase();
            TRANSPORT_FAULTS.iter().any(|fault| line.contains(fault))
        })
        .map(str::to_string)
}

fn args<const N: usize>(words: [&str; N]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

fn device_args<const N: usize>(serial: &str, words: [&str; N]) -> Vec<String> {
    let mut argv = vec!["-s".to_string(), serial.to_string()];
    argv.extend(words.iter().map(|w| w.to_string()));
    argv
}

/// Single-quote a value for the device shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
