//! Image transformer.
//!
//! A pure, side-effect-free pipeline over in-memory buffers: decode, fit
//! inside the requested box (never enlarging), and re-encode in the target
//! format. The transformer performs no I/O; callers supply bytes and receive
//! bytes.
//!
//! # Operations
//!
//! - [`ImageOptimizer::optimize`] - resize + re-encode, including `auto`
//!   smallest-output selection
//! - [`ImageOptimizer::convert`] - format conversion at high quality
//! - [`ImageOptimizer::thumbnail`] - cover/inside thumbnail as jpeg
//! - [`ImageOptimizer::watermark`] - bottom-center vector text label
//! - [`ImageOptimizer::blur_placeholder`] - tiny blurred progressive jpeg
//! - [`ImageOptimizer::metadata`] - dimensions/format/channels probe

mod codec;
mod placeholder;
mod watermark;

pub use codec::EncodedFormat;
pub use placeholder::{PlaceholderImage, PlaceholderOptions};
pub use watermark::WatermarkOptions;

use std::str::FromStr;

use bytes::Bytes;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::TransformError;

/// Default encode quality (1-100).
pub const DEFAULT_QUALITY: u8 = 80;

/// Quality used by format conversion.
pub const CONVERT_QUALITY: u8 = 90;

/// Quality used by thumbnail encoding.
pub const THUMBNAIL_QUALITY: u8 = 80;

/// Largest accepted target dimension in pixels.
pub const MAX_DIMENSION: u32 = 8000;

/// Human-readable list of accepted output formats, for client errors.
pub const SUPPORTED_OUTPUT_FORMATS: &str = "jpeg, png, webp, avif, gif, tiff, auto";

// =============================================================================
// Output Format
// =============================================================================

/// Requested output encoding, including the `auto` selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
    Gif,
    Tiff,
    /// Encode jpeg/webp/avif/png candidates and keep the smallest
    Auto,
}

impl OutputFormat {
    /// Canonical lowercase name; also the extension handed to the path
    /// minter (so `auto` mints `.auto`, matching the accept-time contract
    /// that the destination key is fixed before any encoding happens).
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
            OutputFormat::Avif => "avif",
            OutputFormat::Gif => "gif",
            OutputFormat::Tiff => "tiff",
            OutputFormat::Auto => "auto",
        }
    }

    /// The concrete encoding, or `None` for `auto`.
    pub fn encoded(&self) -> Option<EncodedFormat> {
        match self {
            OutputFormat::Jpeg => Some(EncodedFormat::Jpeg),
            OutputFormat::Png => Some(EncodedFormat::Png),
            OutputFormat::WebP => Some(EncodedFormat::WebP),
            OutputFormat::Avif => Some(EncodedFormat::Avif),
            OutputFormat::Gif => Some(EncodedFormat::Gif),
            OutputFormat::Tiff => Some(EncodedFormat::Tiff),
            OutputFormat::Auto => None,
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::WebP),
            "avif" => Ok(OutputFormat::Avif),
            "gif" => Ok(OutputFormat::Gif),
            "tiff" | "tif" => Ok(OutputFormat::Tiff),
            "auto" => Ok(OutputFormat::Auto),
            other => Err(TransformError::UnsupportedFormat(other.to_string())),
        }
    }
}

// =============================================================================
// Options
// =============================================================================

/// Parameters of one optimization request. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeOptions {
    /// Target width bound in pixels (1-8000)
    pub width: Option<u32>,

    /// Target height bound in pixels (1-8000)
    pub height: Option<u32>,

    /// Encode quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Output encoding
    #[serde(default = "default_format")]
    pub format: OutputFormat,

    /// Gaussian blur radius for placeholder generation (1-50)
    pub blur_radius: Option<u32>,

    /// Placeholder mobile defaults toggle
    pub mobile_optimized: Option<bool>,
}

fn default_quality() -> u8 {
    DEFAULT_QUALITY
}

fn default_format() -> OutputFormat {
    OutputFormat::Jpeg
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            quality: DEFAULT_QUALITY,
            format: OutputFormat::Jpeg,
            blur_radius: None,
            mobile_optimized: None,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// An encoded optimization result together with the format actually chosen
/// (relevant when the request asked for `auto`).
#[derive(Debug, Clone)]
pub struct OptimizedImage {
    /// Encoded bytes
    pub bytes: Bytes,

    /// The encoding the bytes are in
    pub format: EncodedFormat,
}

/// Probe result of [`ImageOptimizer::metadata`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    /// Container format name (`jpeg`, `png`, `svg`, ...)
    pub format: String,
    /// Encoded size in bytes
    pub size: u64,
    /// Channels of the decoded pixel data
    pub channels: u8,
    /// Pixel density, when the container carries one
    pub density: Option<u32>,
}

// =============================================================================
// Image Optimizer
// =============================================================================

/// Stateless transformer over in-memory image buffers.
///
/// # Example
///
/// ```ignore
/// use imgopt::transform::{ImageOptimizer, OptimizeOptions, OutputFormat};
///
/// let optimizer = ImageOptimizer::new();
/// let options = OptimizeOptions {
///     width: Some(800),
///     format: OutputFormat::WebP,
///     ..Default::default()
/// };
/// let result = optimizer.optimize(&source_bytes, &options)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct ImageOptimizer {}

impl ImageOptimizer {
    /// Create a new optimizer.
    pub fn new() -> Self {
        Self {}
    }

    /// Resize to fit inside the requested box (never enlarging) and encode
    /// per the requested format. `auto` returns the smallest successful
    /// candidate among jpeg/webp/avif/png.
    pub fn optimize(
        &self,
        source: &[u8],
        options: &OptimizeOptions,
    ) -> Result<OptimizedImage, TransformError> {
        let img = codec::decode(source)?;
        let img = fit_inside(img, options.width, options.height);
        let quality = options.quality.clamp(1, 100);

        match options.format.encoded() {
            Some(format) => {
                let bytes = codec::encode(&img, format, quality)?;
                Ok(OptimizedImage {
                    bytes: Bytes::from(bytes),
                    format,
                })
            }
            None => {
                let (bytes, format) = codec::encode_auto(&img, quality)?;
                Ok(OptimizedImage {
                    bytes: Bytes::from(bytes),
                    format,
                })
            }
        }
    }

    /// Re-encode into the given format at conversion quality (90), without
    /// resizing.
    pub fn convert(
        &self,
        source: &[u8],
        format: OutputFormat,
    ) -> Result<OptimizedImage, TransformError> {
        let img = codec::decode(source)?;
        match format.encoded() {
            Some(format) => {
                let bytes = codec::encode(&img, format, CONVERT_QUALITY)?;
                Ok(OptimizedImage {
                    bytes: Bytes::from(bytes),
                    format,
                })
            }
            None => {
                let (bytes, format) = codec::encode_auto(&img, CONVERT_QUALITY)?;
                Ok(OptimizedImage {
                    bytes: Bytes::from(bytes),
                    format,
                })
            }
        }
    }

    /// Produce a jpeg thumbnail.
    ///
    /// With a height: `cover` fit, center-weighted crop. Without: `inside`
    /// fit on width alone. Never enlarges the source.
    pub fn thumbnail(
        &self,
        source: &[u8],
        width: u32,
        height: Option<u32>,
    ) -> Result<Bytes, TransformError> {
        if width == 0 {
            return Err(TransformError::InvalidDimensions(
                "thumbnail width must be positive".to_string(),
            ));
        }
        let img = codec::decode(source)?;

        let thumb = match height {
            Some(h) if h == 0 => {
                return Err(TransformError::InvalidDimensions(
                    "thumbnail height must be positive".to_string(),
                ))
            }
            Some(h) => cover_fit(img, width, h),
            None => fit_inside(img, Some(width), None),
        };

        let bytes = codec::encode(&thumb, EncodedFormat::Jpeg, THUMBNAIL_QUALITY)?;
        Ok(Bytes::from(bytes))
    }

    /// Composite a text label at bottom-center of the image.
    pub fn watermark(
        &self,
        source: &[u8],
        text: &str,
        options: &WatermarkOptions,
    ) -> Result<Bytes, TransformError> {
        watermark::apply(source, text, options)
    }

    /// Generate a tiny blurred progressive-jpeg placeholder.
    pub fn blur_placeholder(
        &self,
        source: &[u8],
        options: &PlaceholderOptions,
    ) -> Result<PlaceholderImage, TransformError> {
        placeholder::generate(source, options)
    }

    /// Probe dimensions, container format and channel layout.
    pub fn metadata(&self, source: &[u8]) -> Result<ImageMetadata, TransformError> {
        if codec::is_svg(source) {
            let img = codec::decode(source)?;
            return Ok(ImageMetadata {
                width: img.width(),
                height: img.height(),
                format: "svg".to_string(),
                size: source.len() as u64,
                channels: 4,
                density: None,
            });
        }

        let format = image::guess_format(source)
            .map_err(|e| TransformError::Decode(e.to_string()))?
            .extensions_str()
            .first()
            .copied()
            .unwrap_or("unknown")
            .to_string();

        let img = codec::decode(source)?;
        Ok(ImageMetadata {
            width: img.width(),
            height: img.height(),
            format,
            size: source.len() as u64,
            channels: img.color().channel_count(),
            density: None,
        })
    }
}

// =============================================================================
// Geometry Helpers
// =============================================================================

/// Scale to fit inside the `(width, height)` box preserving aspect ratio.
/// Missing bounds are unbounded; an image already inside the box is returned
/// untouched (never enlarge).
fn fit_inside(img: DynamicImage, width: Option<u32>, height: Option<u32>) -> DynamicImage {
    let bound_w = width.unwrap_or(u32::MAX).max(1);
    let bound_h = height.unwrap_or(u32::MAX).max(1);

    if img.width() <= bound_w && img.height() <= bound_h {
        return img;
    }
    img.resize(bound_w, bound_h, FilterType::Lanczos3)
}

/// Scale and center-crop to cover a `(width, height)` box. When covering
/// would require enlarging, the box is shrunk to the source instead so the
/// output keeps the requested aspect ratio at natural resolution.
fn cover_fit(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    let scale = f64::min(
        img.width() as f64 / width as f64,
        img.height() as f64 / height as f64,
    );

    let (target_w, target_h) = if scale < 1.0 {
        (
            ((width as f64 * scale).round() as u32).max(1),
            ((height as f64 * scale).round() as u32).max(1),
        )
    } else {
        (width, height)
    };

    img.resize_to_fill(target_w, target_h, FilterType::Lanczos3)
}

// =============================================================================
// Tests
// =============================================================================
