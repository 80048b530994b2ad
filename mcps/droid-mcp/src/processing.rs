//! Frame post-processing: cropping, downscaling and re-encoding captures
//!
//! Also hosts the helpers the recognition stages use to cut regions out of
//! a frame and to decode images to grayscale.

use std::fmt;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pixel rectangle in screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Region {
    #[schemars(description = "Left edge in pixels")]
    pub x: u32,
    #[schemars(description = "Top edge in pixels")]
    pub y: u32,
    #[schemars(description = "Width in pixels")]
    pub width: u32,
    #[schemars(description = "Height in pixels")]
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersect with a `frame_width` x `frame_height` frame
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<Region> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        (width > 0 && height > 0).then(|| Region::new(self.x, self.y, width, height))
    }

    pub fn offset(&self, dx: u32, dy: u32) -> Region {
        Region::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersection over union
    pub fn iou(&self, other: &Region) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        if right <= left || bottom <= top {
            return 0.0;
        }
        let overlap = (right - left) as u64 * (bottom - top) as u64;
        let union = self.area() + other.area() - overlap;
        overlap as f32 / union as f32
    }

    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{} {}x{})", self.x, self.y, self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
}

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("cannot decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("cannot encode {format}: {source}")]
    Encode {
        format: &'static str,
        #[source]
        source: image::ImageError,
    },

    #[error("region {region} lies outside the {width}x{height} frame")]
    OutsideFrame {
        region: Region,
        width: u32,
        height: u32,
    },
}

/// Options controlling capture post-processing
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOptions {
    pub format: OutputFormat,
    /// JPEG quality (1-100). Ignored for PNG.
    pub quality: u8,
    /// Downscale (preserving aspect ratio) when wider; 0 disables resizing
    pub max_width: u32,
    /// Applied before resizing
    pub crop: Option<Region>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            quality: 80,
            max_width: 0,
            crop: None,
        }
    }
}

impl ProcessOptions {
    /// The capture can be returned untouched
    pub fn is_passthrough(&self) -> bool {
        self.format == OutputFormat::Png && self.max_width == 0 && self.crop.is_none()
    }
}

pub struct ProcessedImage {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Decode a PNG capture, crop, resize and re-encode it
pub fn process_capture(png: &[u8], opts: &ProcessOptions) -> Result<ProcessedImage, ProcessingError> {
    let img = decode_png(png)?;

    let img = match &opts.crop {
        Some(region) => crop(&img, region)?.0,
        None => img,
    };

    let img = if opts.max_width > 0 && img.width() > opts.max_width {
        let height = (img.height() as f64 * opts.max_width as f64 / img.width() as f64) as u32;
        img.resize_exact(opts.max_width, height.max(1), FilterType::Lanczos3)
    } else {
        img
    };

    let (width, height) = (img.width(), img.height());
    let (data, mime_type) = encode(&img, opts.format, opts.quality)?;

    Ok(ProcessedImage {
        data,
        mime_type,
        width,
        height,
    })
}

/// Cut `region` out of a PNG, returning the PNG of the cut and the region
/// actually used after clamping to the frame
pub fn crop_png(png: &[u8], region: &Region) -> Result<(Vec<u8>, Region), ProcessingError> {
    let img = decode_png(png)?;
    let (cut, used) = crop(&img, region)?;
    let (data, _) = encode(&cut, OutputFormat::Png, 100)?;
    Ok((data, used))
}

/// Decode any supported image (PNG or JPEG) to 8-bit grayscale
pub fn decode_luma(bytes: &[u8]) -> Result<GrayImage, ProcessingError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_luma8())
        .map_err(ProcessingError::Decode)
}

fn decode_png(png: &[u8]) -> Result<DynamicImage, ProcessingError> {
    image::load_from_memory_with_format(png, ImageFormat::Png).map_err(ProcessingError::Decode)
}

fn crop(img: &DynamicImage, region: &Region) -> Result<(DynamicImage, Region), ProcessingError> {
    let used = region
        .clamp_to(img.width(), img.height())
        .ok_or(ProcessingError::OutsideFrame {
            region: *region,
            width: img.width(),
            height: img.height(),
        })?;
    Ok((img.crop_imm(used.x, used.y, used.width, used.height), used))
}

fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    quality: u8,
) -> Result<(Vec<u8>, &'static str), ProcessingError> {
    let mut buf = Vec::new();

    match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
            rgb.write_with_encoder(encoder)
                .map_err(|source| ProcessingError::Encode {
                    format: "jpeg",
                    source,
                })?;
            Ok((buf, "image/jpeg"))
        }
        OutputFormat::Png => {
            img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
                .map_err(|source| ProcessingError::Encode {
                    format: "png",
                    source,
                })?;
            Ok((buf, "image/png"))
        }
    }
}
