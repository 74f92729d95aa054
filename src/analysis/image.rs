// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Image preparation for vision models

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::{debug, warn};

use super::EncodedImage;
use crate::Result;

const FALLBACK_MIME: &str = "application/octet-stream";

/// Encode file bytes for the model, downscaling images whose longest side
/// exceeds `max_dimension`.
///
/// Bytes the `image` crate cannot decode (raw sensor dumps, radar frames) are
/// sent unchanged.
pub fn encode_for_model(bytes: Vec<u8>, max_dimension: u32) -> EncodedImage {
    let format = image::guess_format(&bytes).ok();

    if let Some(fmt) = format {
        match shrink(&bytes, fmt, max_dimension) {
            Ok(Some(jpeg)) => {
                return EncodedImage {
                    base64: general_purpose::STANDARD.encode(&jpeg),
                    mime_type: ImageFormat::Jpeg.to_mime_type().to_string(),
                };
            }
            Ok(None) => {}
            Err(e) => warn!("Could not resize image, sending original bytes: {}", e),
        }
    }

    EncodedImage {
        base64: general_purpose::STANDARD.encode(&bytes),
        mime_type: format
            .map(|f| f.to_mime_type().to_string())
            .unwrap_or_else(|| FALLBACK_MIME.to_string()),
    }
}

/// Resize to fit `max_dimension` and re-encode as JPEG. `None` when already small enough.
fn shrink(bytes: &[u8], format: ImageFormat, max_dimension: u32) -> Result<Option<Vec<u8>>> {
    let img = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = img.dimensions();
    if width <= max_dimension && height <= max_dimension {
        return Ok(None);
    }

    debug!("Downscaling {}x{} image to fit {}px", width, height, max_dimension);
    let resized = img.resize(max_dimension, max_dimension, image::imageops::FilterType::Triangle);

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut buffer = Vec::new();
    rgb.write_to(&mut std::io::Cursor::new(&mut buffer), ImageFormat::Jpeg)?;
    Ok(Some(buffer))
}
