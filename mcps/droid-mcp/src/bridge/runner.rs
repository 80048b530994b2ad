//! Process seam between the adapter and the adb executable

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Raw result of one adb process run
#[derive(Debug, Clone, Default)]
pub struct BridgeOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub code: i32,
}

impl BridgeOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs adb once with the given argv
///
/// Only failures to run the process at all are errors; a non-zero exit is a
/// normal [`BridgeOutput`]. Implementations must stop the child when the
/// returned future is dropped, which is how deadlines are enforced.
#[async_trait]
pub trait BridgeRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> std::io::Result<BridgeOutput>;
}

/// Runs the real adb executable
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl BridgeRunner for ProcessRunner {
    async fn run(&self, args: &[String]) -> std::io::Result<BridgeOutput> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(BridgeOutput {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}
