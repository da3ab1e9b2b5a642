//! Blur placeholder generation.
//!
//! Placeholders are tiny, heavily blurred previews shipped inline while the
//! real artifact is still processing. The mobile profile caps the width at
//! 40px, pads to the target box with neutral grey, and encodes a progressive
//! jpeg (mozjpeg, 4:2:0 chroma subsampling) at reduced quality.

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::TransformError;

use super::codec;

/// Default placeholder width in pixels.
pub const DEFAULT_PLACEHOLDER_WIDTH: u32 = 40;

/// Width ceiling applied by the mobile profile.
const MOBILE_MAX_WIDTH: u32 = 40;

/// Width floor applied by the mobile profile when no width was requested.
const MOBILE_MIN_WIDTH: u32 = 20;

/// Default gaussian blur radius.
pub const DEFAULT_BLUR_RADIUS: u32 = 15;

/// Default encode quality before the mobile reduction.
pub const DEFAULT_PLACEHOLDER_QUALITY: u8 = 15;

/// Quality floor after the mobile reduction.
const MIN_PLACEHOLDER_QUALITY: u8 = 10;

/// Padding color for letterboxed placeholders.
const PAD_GREY: Rgb<u8> = Rgb([128, 128, 128]);

// =============================================================================
// Options
// =============================================================================

/// Parameters for placeholder generation. Unset fields take the documented
/// defaults; `mobile_optimized` defaults to on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub blur_radius: Option<u32>,
    pub quality: Option<u8>,
    pub mobile_optimized: Option<bool>,
}

/// A generated placeholder with its final pixel dimensions.
#[derive(Debug, Clone)]
pub struct PlaceholderImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

// =============================================================================
// Generation
// =============================================================================

/// Generate a blurred placeholder from source bytes.
pub(crate) fn generate(
    source: &[u8],
    options: &PlaceholderOptions,
) -> Result<PlaceholderImage, TransformError> {
    let img = codec::decode(source)?;

    let mobile = options.mobile_optimized.unwrap_or(true);
    let (target_w, target_h) = target_box(&img, options, mobile);

    // Fit inside the box, then pad with grey to exactly the target size.
    let fitted = img.resize(target_w, target_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(target_w, target_h, PAD_GREY);
    let offset_x = ((target_w - fitted.width()) / 2) as i64;
    let offset_y = ((target_h - fitted.height()) / 2) as i64;
    imageops::overlay(&mut canvas, &fitted.to_rgb8(), offset_x, offset_y);

    let blur_radius = options.blur_radius.unwrap_or(DEFAULT_BLUR_RADIUS);
    let blurred = DynamicImage::ImageRgb8(canvas).blur(blur_radius as f32);

    let quality = options.quality.unwrap_or(DEFAULT_PLACEHOLDER_QUALITY);
    let quality = if mobile {
        quality
            .saturating_sub(5)
            .max(MIN_PLACEHOLDER_QUALITY)
    } else {
        quality
    };

    let bytes = encode_progressive_jpeg(&blurred.to_rgb8(), quality)?;
    Ok(PlaceholderImage {
        bytes: Bytes::from(bytes),
        width: target_w,
        height: target_h,
    })
}

/// Resolve the target box from options, source aspect ratio and the mobile
/// profile. The mobile profile only applies its width cap when no explicit
/// height was requested.
fn target_box(img: &DynamicImage, options: &PlaceholderOptions, mobile: bool) -> (u32, u32) {
    let requested_w = options.width.unwrap_or(DEFAULT_PLACEHOLDER_WIDTH).max(1);

    let width = if mobile && options.height.is_none() {
        let capped = requested_w.min(MOBILE_MAX_WIDTH);
        if options.width.is_none() {
            capped.clamp(MOBILE_MIN_WIDTH, MOBILE_MAX_WIDTH)
        } else {
            capped
        }
    } else {
        requested_w
    };

    let height = match options.height {
        Some(h) => h.max(1),
        None => {
            // Derive from the source aspect ratio.
            let aspect = img.height() as f64 / img.width().max(1) as f64;
            ((width as f64 * aspect).round() as u32).max(1)
        }
    };

    (width, height)
}

/// Encode RGB pixels as a progressive jpeg. mozjpeg's default chroma
/// subsampling for color output is 4:2:0.
fn encode_progressive_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let (width, height) = img.dimensions();

    let mut compress = mozjpeg::Compress::new(mozjpeg::ColorSpace::JCS_RGB);
    compress.set_size(width as usize, height as usize);
    compress.set_quality(quality.clamp(1, 100) as f32);
    compress.set_progressive_mode();

    let mut started = compress
        .start_compress(Vec::new())
        .map_err(|e| TransformError::Encode {
            format: "jpeg",
            message: e.to_string(),
        })?;
    started
        .write_scanlines(img.as_raw())
        .map_err(|e| TransformError::Encode {
            format: "jpeg",
            message: e.to_string(),
        })?;
    started.finish().map_err(|e| TransformError::Encode {
        format: "jpeg",
        message: e.to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
