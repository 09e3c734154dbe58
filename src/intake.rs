// 📷 Image Intake - Rotate, crop and normalize receipt photos
// Everything that reaches the extraction service goes through `normalize`

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use thiserror::Error;

/// Longest edge the extraction service handles without downscaling itself
pub const DEFAULT_MAX_EDGE: u32 = 1568;

pub const JPEG_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("uploaded image is empty")]
    Empty,

    #[error("unsupported image format, expected JPEG or PNG")]
    UnsupportedFormat,

    #[error("image could not be decoded: {0}")]
    Decode(#[source] image::ImageError),

    #[error("rotation must be a multiple of 90 degrees, got {0}")]
    Rotation(i32),

    #[error("crop box {crop} does not fit a {width}x{height} image")]
    Crop {
        crop: CropBox,
        width: u32,
        height: u32,
    },

    #[error("image could not be encoded: {0}")]
    Encode(#[source] image::ImageError),
}

// ============================================================================
// INPUTS
// ============================================================================

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        ImageUpload {
            file_name: file_name.into(),
            bytes,
        }
    }
}

/// Crop rectangle in pixel coordinates of the rotated image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropBox {
    /// Parse `x,y,width,height`
    pub fn parse(raw: &str) -> Option<CropBox> {
        let parts: Vec<u32> = raw
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .ok()?;

        match parts.as_slice() {
            [x, y, width, height] => Some(CropBox {
                x: *x,
                y: *y,
                width: *width,
                height: *height,
            }),
            _ => None,
        }
    }

    fn fits(&self, width: u32, height: u32) -> bool {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        self.width > 0
            && self.height > 0
            && matches!(right, Some(r) if r <= width)
            && matches!(bottom, Some(b) if b <= height)
    }
}

impl std::fmt::Display for CropBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustments {
    /// Clockwise rotation, any multiple of 90 (negative turns counter-clockwise)
    pub rotation_degrees: i32,
    pub crop: Option<CropBox>,
}

#[derive(Debug, Clone, Copy)]
pub struct IntakeOptions {
    pub max_edge: u32,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        IntakeOptions {
            max_edge: DEFAULT_MAX_EDGE,
        }
    }
}

// ============================================================================
// NORMALIZED IMAGE
// ============================================================================

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub source_name: String,
    /// Upload exactly as received
    pub original: Vec<u8>,
    pub original_sha256: String,
    /// Rotated, cropped, downscaled JPEG sent to the model
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
    pub width: u32,
    pub height: u32,
}

impl NormalizedImage {
    /// Directory key for this upload: `<file-name>-<sha256>`
    pub fn artifact_key(&self) -> String {
        format!("{}-{}", sanitize_file_name(&self.source_name), self.original_sha256)
    }
}

/// Keep file names usable as a path component
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');

    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// NORMALIZE
// ============================================================================

/// Decode, rotate, crop and downscale an upload, re-encoding it as JPEG.
///
/// Fails before any network activity when the payload is empty, not a
/// JPEG/PNG, or the adjustments don't fit the image.
pub fn normalize(
    upload: &ImageUpload,
    adjustments: &Adjustments,
    options: &IntakeOptions,
) -> Result<NormalizedImage, IntakeError> {
    if upload.bytes.is_empty() {
        return Err(IntakeError::Empty);
    }

    let format = image::guess_format(&upload.bytes).map_err(|_| IntakeError::UnsupportedFormat)?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(IntakeError::UnsupportedFormat);
    }

    let decoded =
        image::load_from_memory_with_format(&upload.bytes, format).map_err(IntakeError::Decode)?;

    let rotated = rotate(decoded, adjustments.rotation_degrees)?;

    let cropped = match adjustments.crop {
        Some(crop) => {
            let (width, height) = rotated.dimensions();
            if !crop.fits(width, height) {
                return Err(IntakeError::Crop {
                    crop,
                    width,
                    height,
                });
            }
            rotated.crop_imm(crop.x, crop.y, crop.width, crop.height)
        }
        None => rotated,
    };

    let max_edge = options.max_edge.max(1);
    let (width, height) = cropped.dimensions();
    let sized = if width.max(height) > max_edge {
        cropped.resize(max_edge, max_edge, FilterType::Triangle)
    } else {
        cropped
    };

    let (width, height) = sized.dimensions();
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(sized.to_rgb8())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .map_err(IntakeError::Encode)?;

    let original_sha256 = sha256_hex(&upload.bytes);
    tracing::debug!(
        file = %upload.file_name,
        sha256 = %original_sha256,
        width,
        height,
        rotation = adjustments.rotation_degrees,
        "normalized upload"
    );

    Ok(NormalizedImage {
        source_name: upload.file_name.clone(),
        original: upload.bytes.clone(),
        original_sha256,
        bytes,
        media_type: JPEG_MEDIA_TYPE,
        width,
        height,
    })
}

fn rotate(image: DynamicImage, degrees: i32) -> Result<DynamicImage, IntakeError> {
    match degrees.rem_euclid(360) {
        0 => Ok(image),
        90 => Ok(image.rotate90()),
        180 => Ok(image.rotate180()),
        270 => Ok(image.rotate270()),
        _ => Err(IntakeError::Rotation(degrees)),
    }
}

// ============================================================================
// TESTS
// ============================================================================
