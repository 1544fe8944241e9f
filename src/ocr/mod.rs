use anyhow::Result;
use image::DynamicImage;

mod font;
mod render;
mod tesseract;

pub use font::{FontMetrics, ResolvedOverlayFont, load_font_metrics, resolve_overlay_font};
pub use render::{StripLayout, compose_strip, layout_strip, render_svg_bytes, strip_svg};
pub use tesseract::{TesseractRecognizer, list_tesseract_languages};

/// Reads text out of a raster. Returns an empty string when nothing is found.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image: &DynamicImage) -> Result<String>;
}

/// Look of the translated-text strip drawn onto images.
#[derive(Clone)]
pub struct OverlayStyle {
    pub text_color: String,
    pub fill_color: String,
    pub font_size: f32,
    pub font_family: Option<String>,
    pub font_metrics: Option<FontMetrics>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            text_color: "#000000".to_string(),
            fill_color: "#ffffff".to_string(),
            font_size: 18.0,
            font_family: None,
            font_metrics: None,
        }
    }
}

/// Collapses recognizer output to one line of single-spaced words.
pub fn normalize_recognized(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
