//! Recognition pipeline over captured frames
//!
//! Stages are independent analyses of the same frame. They run concurrently
//! and are reported in the order they were requested. A stage whose engine
//! is missing reports `RecognitionUnavailable` without affecting the others.

mod matcher;
mod ocr;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bridge::CaptureFrame;
use crate::config::RecognitionConfig;
use crate::error::{DroidError, DroidResult, ErrorDescriptor};
use crate::processing::{crop_png, decode_luma, Region};

pub use matcher::{MatchEntry, Point, TemplateMatcher};
pub use ocr::{parse_tsv, OcrEngine, OcrError, TesseractOcr, TextEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum StageKind {
    #[serde(rename = "ocr", alias = "run_ocr")]
    Ocr,
    #[serde(rename = "imageMatch", alias = "image_match", alias = "match_image")]
    ImageMatch,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Ocr => "ocr",
            StageKind::ImageMatch => "imageMatch",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OcrRequest {
    pub language: Option<String>,
    pub region: Option<Region>,
}

#[derive(Debug, Clone)]
pub struct MatchRequest {
    /// Encoded PNG or JPEG
    pub template: Vec<u8>,
    pub threshold: Option<f32>,
    pub region: Option<Region>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum StageRequest {
    Ocr(OcrRequest),
    ImageMatch(MatchRequest),
}

impl StageRequest {
    pub fn kind(&self) -> StageKind {
        match self {
            StageRequest::Ocr(_) => StageKind::Ocr,
            StageRequest::ImageMatch(_) => StageKind::ImageMatch,
        }
    }
}

/// Output of one stage; empty means "nothing found"
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "entries", rename_all = "snake_case")]
pub enum RecognitionResult {
    Text(Vec<TextEntry>),
    Matches(Vec<MatchEntry>),
}

impl RecognitionResult {
    pub fn len(&self) -> usize {
        match self {
            RecognitionResult::Text(entries) => entries.len(),
            RecognitionResult::Matches(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Result(RecognitionResult),
    Error(ErrorDescriptor),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageKind,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

pub struct RecognitionPipeline {
    ocr: Option<Arc<dyn OcrEngine>>,
    matcher: Option<TemplateMatcher>,
    language: String,
    threshold: f32,
    max_results: usize,
}

impl RecognitionPipeline {
    pub fn new(ocr: Option<Arc<dyn OcrEngine>>, matcher: Option<TemplateMatcher>) -> Self {
        let defaults = RecognitionConfig::default();
        Self {
            ocr,
            matcher,
            language: defaults.ocr.language,
            threshold: defaults.image_match.default_threshold,
            max_results: defaults.image_match.max_results,
        }
    }

    pub fn from_config(config: &RecognitionConfig) -> Self {
        let ocr = config.ocr.enabled.then(|| {
            Arc::new(TesseractOcr::new(
                &config.ocr.tesseract_path,
                Duration::from_millis(config.ocr.timeout_ms),
            )) as Arc<dyn OcrEngine>
        });
        let matcher = config
            .image_match
            .enabled
            .then(|| TemplateMatcher::new(config.image_match.max_search_width));

        Self {
            ocr,
            matcher,
            language: config.ocr.language.clone(),
            threshold: config.image_match.default_threshold,
            max_results: config.image_match.max_results,
        }
    }

    pub async fn availability(&self, stage: StageKind) -> Availability {
        match stage {
            StageKind::Ocr => match &self.ocr {
                Some(engine) => engine.availability().await,
                None => Availability::Unavailable("OCR is disabled".into()),
            },
            StageKind::ImageMatch => match &self.matcher {
                Some(_) => Availability::Available,
                None => Availability::Unavailable("image matching is disabled".into()),
            },
        }
    }

    /// Run every requested stage over `frame`, reports in request order
    pub async fn run(&self, frame: &CaptureFrame, stages: &[StageRequest]) -> Vec<StageReport> {
        join_all(stages.iter().map(|stage| async move {
            let result = match stage {
                StageRequest::Ocr(request) => self.ocr(frame, request).await,
                StageRequest::ImageMatch(request) => self.match_template(frame, request).await,
            };
            let outcome = match result {
                Ok(result) => StageOutcome::Result(result),
                Err(e) => {
                    warn!(stage = stage.kind().name(), error = %e, "recognition stage did not produce a result");
                    StageOutcome::Error(e.descriptor())
                }
            };
            StageReport {
                stage: stage.kind(),
                outcome,
            }
        }))
        .await
    }

    pub async fn ocr(&self, frame: &CaptureFrame, request: &OcrRequest) -> DroidResult<RecognitionResult> {
        let stage = StageKind::Ocr;
        if let Availability::Unavailable(reason) = self.availability(stage).await {
            return Err(unavailable(stage, reason));
        }
        let Some(engine) = &self.ocr else {
            return Err(unavailable(stage, "OCR is disabled"));
        };

        let (png, origin) = match &request.region {
            Some(region) => {
                let (cut, used) = crop_png(&frame.data, region).map_err(|e| failed(stage, e))?;
                (Cow::Owned(cut), Some(used))
            }
            None => (Cow::Borrowed(frame.data.as_slice()), None),
        };

        let language = request.language.as_deref().unwrap_or(&self.language);
        let mut entries = engine
            .recognize(&png, language)
            .await
            .map_err(|e| failed(stage, e))?;

        if let Some(origin) = origin {
            for entry in &mut entries {
                entry.bounds = entry.bounds.offset(origin.x, origin.y);
            }
        }

        debug!(engine = engine.name(), words = entries.len(), "ocr done");
        Ok(RecognitionResult::Text(entries))
    }

    pub async fn match_template(
        &self,
        frame: &CaptureFrame,
        request: &MatchRequest,
    ) -> DroidResult<RecognitionResult> {
        let stage = StageKind::ImageMatch;
        let Some(matcher) = self.matcher.clone() else {
            return Err(unavailable(stage, "image matching is disabled"));
        };

        let threshold = request.threshold.unwrap_or(self.threshold);
        let max_results = request.max_results.unwrap_or(self.max_results);
        let screen = frame.data.clone();
        let template = request.template.clone();
        let region = request.region;

        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<MatchEntry>, String> {
            let screen = decode_luma(&screen).map_err(|e| format!("frame: {}", e))?;
            let template = decode_luma(&template).map_err(|e| format!("template: {}", e))?;

            let (width, height) = screen.dimensions();
            let search = match region {
                Some(r) => r
                    .clamp_to(width, height)
                    .ok_or_else(|| format!("region {} lies outside the {}x{} frame", r, width, height))?,
                None => Region::new(0, 0, width, height),
            };
            let area = image::imageops::crop_imm(&screen, search.x, search.y, search.width, search.height)
                .to_image();

            Ok(matcher
                .find(&area, &template, threshold, max_results)
                .into_iter()
                .map(|m| m.offset(search.x, search.y))
                .collect())
        })
        .await
        .map_err(|e| failed(stage, e))?
        .map_err(|e| failed(stage, e))?;

        debug!(matches = entries.len(), threshold, "image match done");
        Ok(RecognitionResult::Matches(entries))
    }
}

fn unavailable(stage: StageKind, reason: impl Into<String>) -> DroidError {
    DroidError::RecognitionUnavailable {
        stage: stage.name().to_string(),
        reason: reason.into(),
    }
}

fn failed(stage: StageKind, reason: impl ToString) -> DroidError {
    DroidError::RecognitionFailed {
        stage: stage.name().to_string(),
        reason: reason.to_string(),
    }
}
