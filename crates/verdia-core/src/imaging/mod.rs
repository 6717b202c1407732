//! Image payload normalization for inference input.
//!
//! Client devices (notably budget mobile cameras) submit arbitrarily large,
//! arbitrarily rotated images. Unbounded payloads inflate inference latency
//! and cost and risk provider-side size rejection, so every submitted image
//! is normalized before the external call, never after:
//!
//! 1. Bounds check the raw bytes, then decode; undecodable bytes fail with
//!    [`DecodeError::Undecodable`].
//! 2. Apply the EXIF orientation tag (0x0112) so the output is visually
//!    upright regardless of how the camera was held.
//! 3. Resize to fit inside the configured bound, preserving aspect ratio
//!    and never upscaling.
//! 4. Re-encode as JPEG at a fixed quality to bound output size.
//!
//! The output is produced exactly once per request and consumed exactly
//! once by the inference client.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use thiserror::Error;

/// Media type of every normalized payload.
pub const NORMALIZED_MIME: &str = "image/jpeg";

/// Smallest byte count worth handing to the decoder.
const MIN_IMAGE_BYTES: usize = 16;

/// Configuration for the normalizer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    /// Ceiling on the decoded input payload, enforced before any expensive
    /// processing.
    pub max_input_bytes: usize,

    /// Bound that both output dimensions must fit inside.
    pub max_dimension: u32,

    /// JPEG re-encode quality (1-100).
    pub jpeg_quality: u8,
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            // 1.5 MB decoded ceiling
            max_input_bytes: 1_572_864,
            max_dimension: 1024,
            jpeg_quality: 80,
        }
    }
}

/// Raw submitted image: byte payload plus the declared media type. Owned by
/// a single request for its lifetime.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    /// Decoded (not base64) image bytes.
    pub bytes: Vec<u8>,
    /// Media type as declared by the client, if any. Informational only;
    /// the decoder sniffs the actual format.
    pub media_type: Option<String>,
}

/// Upright, bounded, re-encoded JPEG ready for the inference call.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    /// JPEG bytes at the configured quality.
    pub bytes: Vec<u8>,
    /// Output width, `<= max_dimension`.
    pub width: u32,
    /// Output height, `<= max_dimension`.
    pub height: u32,
}

/// Failures while turning a submitted payload into a [`NormalizedImage`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload exceeds the input ceiling.
    #[error("image payload of {actual} bytes exceeds the {limit} byte limit")]
    Oversized {
        /// Size of the submitted payload.
        actual: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// Bytes are not a decodable raster image.
    #[error("image payload is not decodable: {0}")]
    Undecodable(String),

    /// Re-encoding the bounded image failed.
    #[error("failed to encode normalized image: {0}")]
    Encode(String),
}

/// Normalizes a submitted image: decode, orient, bound, re-encode.
///
/// # Errors
///
/// Returns [`DecodeError::Oversized`] when the payload exceeds the input
/// ceiling and [`DecodeError::Undecodable`] when the bytes are not a raster
/// image.
pub fn normalize(asset: &ImageAsset, config: &ImagingConfig) -> Result<NormalizedImage, DecodeError> {
    validate_input_bytes(&asset.bytes, config.max_input_bytes)?;

    let decoded = image::load_from_memory(&asset.bytes)
        .map_err(|e| DecodeError::Undecodable(e.to_string()))?;
    let (orig_w, orig_h) = decoded.dimensions();

    let orientation = read_exif_orientation(&asset.bytes);
    let upright = apply_orientation(decoded, orientation);

    // JPEG output has no alpha channel
    let rgb = upright.to_rgb8();
    let (w, h) = (rgb.width(), rgb.height());
    let (fit_w, fit_h) = fit_dimensions(w, h, config.max_dimension);

    let bounded = if (fit_w, fit_h) == (w, h) {
        rgb
    } else {
        image::imageops::resize(&rgb, fit_w, fit_h, FilterType::CatmullRom)
    };

    let mut cursor = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut cursor, config.jpeg_quality);
    DynamicImage::ImageRgb8(bounded)
        .write_with_encoder(encoder)
        .map_err(|e| DecodeError::Encode(e.to_string()))?;
    let bytes = cursor.into_inner();

    tracing::debug!(
        original = format!("{orig_w}x{orig_h}"),
        orientation,
        output = format!("{fit_w}x{fit_h}"),
        output_bytes = bytes.len(),
        "image normalized for inference"
    );

    Ok(NormalizedImage {
        bytes,
        width: fit_w,
        height: fit_h,
    })
}

/// Rejects payloads outside the accepted byte range before decode work.
fn validate_input_bytes(bytes: &[u8], limit: usize) -> Result<(), DecodeError> {
    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(DecodeError::Undecodable(
            "image data too small to be valid".into(),
        ));
    }
    if bytes.len() > limit {
        return Err(DecodeError::Oversized {
            actual: bytes.len(),
            limit,
        });
    }
    Ok(())
}

/// Reads the EXIF orientation tag from raw image bytes.
///
/// Returns 1 (upright) when there is no EXIF segment or no orientation tag.
#[must_use]
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let Ok(reader) = exif::Reader::new().read_from_container(&mut cursor) else {
        return 1;
    };

    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        .unwrap_or(1)
}

/// Applies an EXIF orientation transform.
///
/// Orientation values: 1 = upright, 2 = mirrored, 3 = 180 degrees,
/// 4 = flipped vertically, 5 = mirrored + 90 CW, 6 = 90 CW,
/// 7 = mirrored + 270 CW, 8 = 270 CW. Unknown values are left untouched.
#[must_use]
pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Computes dimensions that fit inside `bound` preserving aspect ratio.
///
/// The longest edge is scaled down to `bound`; images already inside the
/// bound are returned unchanged (no upscaling).
#[must_use]
pub fn fit_dimensions(width: u32, height: u32, bound: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (1, 1);
    }

    let scale = (f64::from(bound) / f64::from(width)).min(f64::from(bound) / f64::from(height));
    if scale >= 1.0 {
        return (width, height);
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // bounded by `bound`
    let new_w = ((f64::from(width) * scale).round() as u32).clamp(1, bound);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let new_h = ((f64::from(height) * scale).round() as u32).clamp(1, bound);

    (new_w, new_h)
}
