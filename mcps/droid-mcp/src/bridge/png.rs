//! Sanity checks for PNG bytes coming back from `screencap`

use thiserror::Error;

const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Signature + IHDR + one IDAT + IEND
const MIN_PNG_LEN: usize = 57;

const MAX_DIMENSION: u32 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PngInfo {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error, PartialEq)]
pub enum PngError {
    #[error("capture is empty")]
    Empty,

    #[error("capture is not a PNG (bad signature)")]
    BadSignature,

    #[error("capture is too small ({0} bytes)")]
    TooSmall(usize),

    #[error("capture is truncated (no IEND chunk)")]
    Truncated,

    #[error("bad IHDR chunk: {0}")]
    BadHeader(String),

    #[error("adb printed text before the image: {0}")]
    TextPrefix(String),
}

/// Validate PNG bytes and read their dimensions
pub fn inspect(data: &[u8]) -> Result<PngInfo, PngError> {
    let Some(&first) = data.first() else {
        return Err(PngError::Empty);
    };

    if first != PNG_SIGNATURE[0] && first.is_ascii() {
        let preview: String = data
            .iter()
            .take(100)
            .take_while(|&&b| b != PNG_SIGNATURE[0])
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
            .collect();
        return Err(PngError::TextPrefix(preview.trim().to_string()));
    }

    if data.len() < PNG_SIGNATURE.len() || data[..8] != PNG_SIGNATURE {
        return Err(PngError::BadSignature);
    }

    if data.len() < MIN_PNG_LEN {
        return Err(PngError::TooSmall(data.len()));
    }

    if !data.windows(4).rev().take(16).any(|w| w == b"IEND") {
        return Err(PngError::Truncated);
    }

    let (width, height) = read_ihdr(data)?;
    Ok(PngInfo { width, height })
}

/// Validate a capture, dropping any text adb wrote ahead of the image
pub fn normalize(data: Vec<u8>) -> Result<(Vec<u8>, PngInfo), PngError> {
    match inspect(&data) {
        Ok(info) => Ok((data, info)),
        Err(PngError::TextPrefix(text)) => {
            let Some(start) = data.windows(8).position(|w| w == PNG_SIGNATURE) else {
                return Err(PngError::TextPrefix(text));
            };
            tracing::debug!(prefix = %text, "stripping text ahead of PNG signature");
            let stripped = data[start..].to_vec();
            let info = inspect(&stripped)?;
            Ok((stripped, info))
        }
        Err(e) => Err(e),
    }
}

fn read_ihdr(data: &[u8]) -> Result<(u32, u32), PngError> {
    if &data[12..16] != b"IHDR" {
        return Err(PngError::BadHeader("first chunk is not IHDR".into()));
    }

    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);

    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(PngError::BadHeader(format!("dimensions {}x{}", width, height)));
    }

    Ok((width, height))
}
