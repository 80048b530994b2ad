//! Template matching on grayscale frames
//!
//! Confidence is the normalised cross-correlation of the template with each
//! window, so an exact copy scores 1.0 and so does a uniformly dimmed one.
//! Large frames are downscaled before the search and hits are mapped back
//! to full-resolution coordinates.

use std::borrow::Cow;
use std::cmp::Ordering;

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use serde::Serialize;

use crate::processing::Region;

/// Hits overlapping a better hit by more than this are dropped
const NMS_IOU: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchEntry {
    pub region: Region,
    /// Tap target
    pub center: Point,
    pub confidence: f32,
}

impl MatchEntry {
    fn new(region: Region, confidence: f32) -> Self {
        let (x, y) = region.center();
        Self {
            region,
            center: Point { x, y },
            confidence,
        }
    }

    pub fn offset(self, dx: u32, dy: u32) -> Self {
        Self::new(self.region.offset(dx, dy), self.confidence)
    }
}

#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    max_search_width: u32,
}

impl TemplateMatcher {
    /// `max_search_width` of 0 searches at full resolution
    pub fn new(max_search_width: u32) -> Self {
        Self { max_search_width }
    }

    /// Best non-overlapping hits at or above `threshold`, best first
    pub fn find(
        &self,
        screen: &GrayImage,
        template: &GrayImage,
        threshold: f32,
        max_results: usize,
    ) -> Vec<MatchEntry> {
        if max_results == 0
            || template.width() == 0
            || template.height() == 0
            || template.width() > screen.width()
            || template.height() > screen.height()
        {
            return Vec::new();
        }

        let scale = if self.max_search_width > 0 && screen.width() > self.max_search_width {
            self.max_search_width as f32 / screen.width() as f32
        } else {
            1.0
        };

        let (screen_s, template_s) = if scale < 1.0 {
            (Cow::Owned(shrink(screen, scale)), Cow::Owned(shrink(template, scale)))
        } else {
            (Cow::Borrowed(screen), Cow::Borrowed(template))
        };

        let scores = match_template(
            &screen_s,
            &template_s,
            MatchTemplateMethod::CrossCorrelationNormalized,
        );

        let mut hits: Vec<(u32, u32, f32)> = scores
            .enumerate_pixels()
            .filter_map(|(x, y, p)| {
                let confidence = p[0];
                (confidence.is_finite() && confidence >= threshold).then_some((x, y, confidence))
            })
            .collect();
        hits.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let mut kept: Vec<MatchEntry> = Vec::new();
        for (x, y, confidence) in hits {
            let region = Region::new(
                ((x as f32 / scale).round() as u32).min(screen.width() - template.width()),
                ((y as f32 / scale).round() as u32).min(screen.height() - template.height()),
                template.width(),
                template.height(),
            );
            if kept.iter().all(|k| k.region.iou(&region) <= NMS_IOU) {
                kept.push(MatchEntry::new(region, confidence.min(1.0)));
                if kept.len() == max_results {
                    break;
                }
            }
        }
        kept
    }
}

fn shrink(img: &GrayImage, scale: f32) -> GrayImage {
    let width = ((img.width() as f32 * scale).round() as u32).max(1);
    let height = ((img.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(img, width, height, FilterType::Triangle)
}
