//! OCR engines
//!
//! The default engine pipes the frame into the `tesseract` CLI and reads
//! word-level TSV back.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::processing::Region;

use super::Availability;

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// One recognised word
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextEntry {
    pub text: String,
    pub bounds: Region,
    /// 0..1
    pub confidence: f32,
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("failed to run OCR engine: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR engine did not finish within {0:?}")]
    Timeout(Duration),

    #[error("OCR engine exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Checked before every invocation
    async fn availability(&self) -> Availability;

    /// Recognise words in a PNG image, boxes relative to that image
    async fn recognize(&self, png: &[u8], language: &str) -> Result<Vec<TextEntry>, OcrError>;
}

pub struct TesseractOcr {
    program: PathBuf,
    timeout: Duration,
    detected: OnceCell<Availability>,
}

impl TesseractOcr {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            detected: OnceCell::new(),
        }
    }

    async fn detect(&self) -> Availability {
        let run = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(VERSION_TIMEOUT, run).await {
            Ok(Ok(output)) if output.status.success() => {
                // Older releases print the banner on stderr
                let banner = if output.stdout.is_empty() {
                    output.stderr
                } else {
                    output.stdout
                };
                let version = String::from_utf8_lossy(&banner)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                info!(%version, "tesseract available");
                Availability::Available
            }
            Ok(Ok(output)) => Availability::Unavailable(format!(
                "{} --version exited with code {}",
                self.program.display(),
                output.status.code().unwrap_or(-1)
            )),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Availability::Unavailable(format!("{} not found", self.program.display()))
            }
            Ok(Err(e)) => Availability::Unavailable(format!(
                "cannot run {}: {}",
                self.program.display(),
                e
            )),
            Err(_) => Availability::Unavailable(format!(
                "{} --version did not answer",
                self.program.display()
            )),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn availability(&self) -> Availability {
        let availability = self.detected.get_or_init(|| self.detect()).await;
        if let Availability::Unavailable(reason) = availability {
            warn!(%reason, "tesseract unavailable");
        }
        availability.clone()
    }

    async fn recognize(&self, png: &[u8], language: &str) -> Result<Vec<TextEntry>, OcrError> {
        let mut child = Command::new(&self.program)
            .args(["stdin", "stdout", "-l", language, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let writer = child.stdin.take().map(|mut stdin| {
            let input = png.to_vec();
            tokio::spawn(async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            })
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OcrError::Timeout(self.timeout))??;

        if let Some(writer) = writer {
            if let Ok(Err(e)) = writer.await {
                debug!(error = %e, "tesseract closed stdin early");
            }
        }

        if !output.status.success() {
            return Err(OcrError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let entries = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!(words = entries.len(), language, "tesseract finished");
        Ok(entries)
    }
}

/// Word-level rows (level 5) of tesseract's TSV output
///
/// Columns: level page_num block_num par_num line_num word_num left top
/// width height conf text
pub fn parse_tsv(tsv: &str) -> Vec<TextEntry> {
    tsv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let text = cols[11].trim();
            let conf: f32 = cols[10].trim().parse().ok()?;
            if text.is_empty() || conf < 0.0 {
                return None;
            }
            let bounds = Region::new(
                cols[6].parse().ok()?,
                cols[7].parse().ok()?,
                cols[8].parse().ok()?,
                cols[9].parse().ok()?,
            );
            Some(TextEntry {
                text: text.to_string(),
                bounds,
                confidence: (conf / 100.0).clamp(0.0, 1.0),
            })
        })
        .collect()
}
