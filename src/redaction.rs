use serde::Serialize;

use crate::background::PageRaster;
use crate::span::{Rect, Rgb, TranslationTask};

pub const REDACTION_PADDING: f32 = 1.0;
const GLYPH_WIDTH_FACTOR: f32 = 0.6;
const LINE_HEIGHT_FACTOR: f32 = 1.2;

/// An area to erase. `fill: None` removes the content without painting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RedactionRegion {
    pub rect: Rect,
    pub fill: Option<Rgb>,
}

/// Monospace-equivalent size estimate for `text` at `size` points.
pub fn estimate_text_size(text: &str, size: f32) -> (f32, f32) {
    let chars = text.chars().count() as f32;
    (chars * GLYPH_WIDTH_FACTOR * size, LINE_HEIGHT_FACTOR * size)
}

/// Rectangle covering both the original glyphs and the estimated translated text.
pub fn region_rect(bbox: &Rect, original: &str, translated: &str, size: f32) -> Rect {
    let longer = if translated.chars().count() > original.chars().count() {
        translated
    } else {
        original
    };
    let (est_w, est_h) = estimate_text_size(longer, size);
    let width = bbox.width().max(est_w);
    let height = bbox.height().max(est_h);
    Rect::new(bbox.x0, bbox.y0, bbox.x0 + width, bbox.y0 + height).inflate(REDACTION_PADDING)
}

/// How erased areas are filled.
#[derive(Debug, Clone, Copy)]
pub enum FillSource<'a> {
    /// Sample the rendered page behind each region.
    Sampled(Option<&'a PageRaster>),
    Solid(Rgb),
    None,
}

pub fn plan_region(task: &TranslationTask, fill: FillSource<'_>) -> RedactionRegion {
    let rect = region_rect(&task.bbox, &task.original, &task.translated, task.font.size);
    let fill = match fill {
        FillSource::Sampled(Some(raster)) => Some(raster.background_of(&task.bbox)),
        FillSource::Sampled(None) => Some(Rgb::WHITE),
        FillSource::Solid(color) => Some(color),
        FillSource::None => None,
    };
    RedactionRegion { rect, fill }
}

pub fn plan_regions(tasks: &[TranslationTask], fill: FillSource<'_>) -> Vec<RedactionRegion> {
    tasks.iter().map(|task| plan_region(task, fill)).collect()
}
