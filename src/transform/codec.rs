//! Format detection, decoding and per-format encoding.
//!
//! Raster formats are handled by the `image` crate. Lossy WebP goes through
//! the `webp` crate because the `image` WebP encoder is lossless-only. SVG
//! input is rasterized with `resvg` before entering the raster pipeline.

use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::{DynamicImage, ImageFormat, ImageReader};
use resvg::{tiny_skia, usvg};

use crate::error::TransformError;

/// AVIF encoder speed (1 = slowest/best, 10 = fastest). Mid-range keeps the
/// worker pool responsive on large sources.
const AVIF_SPEED: u8 = 6;

// =============================================================================
// Encoded Format
// =============================================================================

/// A concrete output encoding. Unlike [`super::OutputFormat`] this never
/// carries `auto`: by the time bytes exist, a format has been chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodedFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
    Gif,
    Tiff,
}

impl EncodedFormat {
    /// Candidate set and tie-break order for auto-format selection.
    pub const AUTO_CANDIDATES: [EncodedFormat; 4] = [
        EncodedFormat::Jpeg,
        EncodedFormat::WebP,
        EncodedFormat::Avif,
        EncodedFormat::Png,
    ];

    /// Canonical lowercase name (also the minted file extension).
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodedFormat::Jpeg => "jpeg",
            EncodedFormat::Png => "png",
            EncodedFormat::WebP => "webp",
            EncodedFormat::Avif => "avif",
            EncodedFormat::Gif => "gif",
            EncodedFormat::Tiff => "tiff",
        }
    }

    /// MIME type for HTTP content negotiation and blob uploads.
    pub fn mime_type(&self) -> &'static str {
        match self {
            EncodedFormat::Jpeg => "image/jpeg",
            EncodedFormat::Png => "image/png",
            EncodedFormat::WebP => "image/webp",
            EncodedFormat::Avif => "image/avif",
            EncodedFormat::Gif => "image/gif",
            EncodedFormat::Tiff => "image/tiff",
        }
    }
}

impl std::fmt::Display for EncodedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Heuristic check for SVG input. The raster sniffers cannot identify SVG,
/// so we look for an `<svg` root in the first kilobyte of valid UTF-8.
pub fn is_svg(source: &[u8]) -> bool {
    let head = &source[..source.len().min(1024)];
    match std::str::from_utf8(head) {
        Ok(text) => {
            let trimmed = text.trim_start_matches('\u{feff}').trim_start();
            trimmed.starts_with("<svg") || (trimmed.starts_with("<?xml") && text.contains("<svg"))
        }
        Err(_) => false,
    }
}

/// Decode source bytes into pixels.
///
/// Raster inputs (jpeg/png/gif/webp/tiff/bmp) are decoded with format
/// auto-detection; SVG inputs are rasterized at their natural size.
pub fn decode(source: &[u8]) -> Result<DynamicImage, TransformError> {
    if source.is_empty() {
        return Err(TransformError::Decode("empty input".to_string()));
    }
    if is_svg(source) {
        return rasterize_svg(source);
    }

    ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| TransformError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| TransformError::Decode(e.to_string()))
}

/// Identify the container format of encoded bytes, if it is one we can also
/// produce. SVG is reported as `None` (it has no raster re-encode target).
pub fn detect_encoded_format(source: &[u8]) -> Option<EncodedFormat> {
    match image::guess_format(source).ok()? {
        ImageFormat::Jpeg => Some(EncodedFormat::Jpeg),
        ImageFormat::Png => Some(EncodedFormat::Png),
        ImageFormat::WebP => Some(EncodedFormat::WebP),
        ImageFormat::Avif => Some(EncodedFormat::Avif),
        ImageFormat::Gif => Some(EncodedFormat::Gif),
        ImageFormat::Tiff => Some(EncodedFormat::Tiff),
        _ => None,
    }
}

fn rasterize_svg(source: &[u8]) -> Result<DynamicImage, TransformError> {
    let text = std::str::from_utf8(source)
        .map_err(|e| TransformError::Decode(format!("SVG is not valid UTF-8: {}", e)))?;

    let mut options = usvg::Options::default();
    options.fontdb_mut().load_system_fonts();

    let tree = usvg::Tree::from_str(text, &options)
        .map_err(|e| TransformError::Decode(format!("invalid SVG: {}", e)))?;

    let size = tree.size();
    let width = size.width().ceil() as u32;
    let height = size.height().ceil() as u32;
    render_svg_tree(&tree, width, height)
}

/// Rasterize a parsed SVG tree onto a transparent canvas of the given size.
pub(crate) fn render_svg_tree(
    tree: &usvg::Tree,
    width: u32,
    height: u32,
) -> Result<DynamicImage, TransformError> {
    if width == 0 || height == 0 {
        return Err(TransformError::Decode(
            "SVG has zero-sized viewport".to_string(),
        ));
    }

    let mut pixmap = tiny_skia::Pixmap::new(width, height)
        .ok_or_else(|| TransformError::Decode("cannot allocate SVG canvas".to_string()))?;
    resvg::render(tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    let png = pixmap
        .encode_png()
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    image::load_from_memory(&png).map_err(|e| TransformError::Decode(e.to_string()))
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode pixels into the requested format at the given quality.
///
/// Quality semantics follow the codec: jpeg/webp/avif/tiff are lossy at
/// `quality`; png ignores quality and uses maximum lossless compression;
/// gif uses its default settings.
pub fn encode(
    img: &DynamicImage,
    format: EncodedFormat,
    quality: u8,
) -> Result<Vec<u8>, TransformError> {
    let quality = quality.clamp(1, 100);
    match format {
        EncodedFormat::Jpeg => encode_jpeg(img, quality),
        EncodedFormat::Png => encode_png(img),
        EncodedFormat::WebP => encode_webp(img, quality),
        EncodedFormat::Avif => encode_avif(img, quality),
        EncodedFormat::Gif => encode_gif(img),
        EncodedFormat::Tiff => encode_tiff(img),
    }
}

/// Encode every auto-format candidate and return the smallest result.
///
/// Candidates that fail to encode are skipped; ties are broken by the
/// candidate order (jpeg, webp, avif, png). Fails only when every candidate
/// fails.
pub fn encode_auto(
    img: &DynamicImage,
    quality: u8,
) -> Result<(Vec<u8>, EncodedFormat), TransformError> {
    let mut best: Option<(Vec<u8>, EncodedFormat)> = None;

    for candidate in EncodedFormat::AUTO_CANDIDATES {
        match encode(img, candidate, quality) {
            Ok(bytes) => {
                let smaller = best
                    .as_ref()
                    .map(|(b, _)| bytes.len() < b.len())
                    .unwrap_or(true);
                if smaller {
                    best = Some((bytes, candidate));
                }
            }
            Err(e) => {
                tracing::debug!(candidate = %candidate, error = %e, "auto candidate skipped");
            }
        }
    }

    best.ok_or(TransformError::AllCandidatesFailed)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    // JPEG has no alpha channel; flatten to RGB first.
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| TransformError::Encode {
            format: "jpeg",
            message: e.to_string(),
        })?;
    Ok(out)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilterType::Adaptive);
    img.write_with_encoder(encoder)
        .map_err(|e| TransformError::Encode {
            format: "png",
            message: e.to_string(),
        })?;
    Ok(out)
}

fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let encoder = webp::Encoder::from_image(&rgba).map_err(|e| TransformError::Encode {
        format: "webp",
        message: e.to_string(),
    })?;
    Ok(encoder.encode(quality as f32).to_vec())
}

fn encode_avif(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut out = Vec::new();
    let encoder = AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, quality);
    rgba.write_with_encoder(encoder)
        .map_err(|e| TransformError::Encode {
            format: "avif",
            message: e.to_string(),
        })?;
    Ok(out)
}

fn encode_gif(img: &DynamicImage) -> Result<Vec<u8>, TransformError> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut cursor = Cursor::new(Vec::new());
    rgba.write_to(&mut cursor, ImageFormat::Gif)
        .map_err(|e| TransformError::Encode {
            format: "gif",
            message: e.to_string(),
        })?;
    Ok(cursor.into_inner())
}

fn encode_tiff(img: &DynamicImage) -> Result<Vec<u8>, TransformError> {
    let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
    let mut cursor = Cursor::new(Vec::new());
    rgba.write_to(&mut cursor, ImageFormat::Tiff)
        .map_err(|e| TransformError::Encode {
            format: "tiff",
            message: e.to_string(),
        })?;
    Ok(cursor.into_inner())
}

// =============================================================================
// Tests
// =============================================================================
