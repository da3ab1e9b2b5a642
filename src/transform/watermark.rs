//! Text watermark compositing.
//!
//! The label is built as an inline SVG document, rasterized at the source
//! image's natural size, and alpha-composited onto the pixels. Rendering
//! uses the system font database; a host without any fonts fails the
//! operation like any other codec error.

use bytes::Bytes;
use image::imageops;
use resvg::usvg;
use serde::{Deserialize, Serialize};

use crate::error::TransformError;

use super::codec::{self, EncodedFormat};

/// Quality used when re-encoding the watermarked image.
const WATERMARK_QUALITY: u8 = 90;

/// Divisor for the default font size: `min(width, height) / 20`.
const FONT_SIZE_DIVISOR: u32 = 20;

// =============================================================================
// Options
// =============================================================================

/// Appearance of the watermark label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkOptions {
    /// Font size in pixels; defaults to `min(width, height) / 20`
    pub font_size: Option<u32>,

    /// CSS font weight (`normal`, `bold`, `700`, ...)
    pub font_weight: Option<String>,

    /// SVG color (`white`, `#rrggbb`, ...)
    pub color: Option<String>,

    /// Label opacity in `0.0..=1.0`; defaults to 0.7
    pub opacity: Option<f32>,
}

// =============================================================================
// Compositing
// =============================================================================

/// Composite `text` at bottom-center (x=50%, y=95%) of the source image.
///
/// The output keeps the source's container format where detectable,
/// falling back to PNG.
pub(crate) fn apply(
    source: &[u8],
    text: &str,
    options: &WatermarkOptions,
) -> Result<Bytes, TransformError> {
    if text.trim().is_empty() {
        return Err(TransformError::Render(
            "watermark text is empty".to_string(),
        ));
    }

    let mut base = codec::decode(source)?;
    let (width, height) = (base.width(), base.height());

    let label = render_label(text, width, height, options)?;
    imageops::overlay(&mut base, &label, 0, 0);

    let format = codec::detect_encoded_format(source).unwrap_or(EncodedFormat::Png);
    let bytes = codec::encode(&base, format, WATERMARK_QUALITY)?;
    Ok(Bytes::from(bytes))
}

/// Rasterize the label SVG onto a transparent canvas of the image size.
fn render_label(
    text: &str,
    width: u32,
    height: u32,
    options: &WatermarkOptions,
) -> Result<image::DynamicImage, TransformError> {
    let font_size = options
        .font_size
        .unwrap_or_else(|| (width.min(height) / FONT_SIZE_DIVISOR).max(1));
    let font_weight = options.font_weight.as_deref().unwrap_or("normal");
    let color = options.color.as_deref().unwrap_or("white");
    let opacity = options.opacity.unwrap_or(0.7).clamp(0.0, 1.0);

    let svg = format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}">
  <text x="50%" y="95%" text-anchor="middle" font-family="sans-serif" font-size="{font_size}" font-weight="{font_weight}" fill="{color}" fill-opacity="{opacity}">{text}</text>
</svg>"#,
        text = escape_xml(text),
    );

    let mut svg_options = usvg::Options::default();
    svg_options.fontdb_mut().load_system_fonts();

    let tree = usvg::Tree::from_str(&svg, &svg_options)
        .map_err(|e| TransformError::Render(e.to_string()))?;

    codec::render_svg_tree(&tree, width, height)
        .map_err(|e| TransformError::Render(e.to_string()))
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
