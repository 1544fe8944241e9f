//! Translates text baked into embedded raster images.

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::background::contrast_color;
use crate::document::{ImageRef, PageSurface};
use crate::fonts::{FontFamily, FontInfo};
use crate::ocr::{OverlayStyle, Recognizer, compose_strip};
use crate::policy::TranslationPolicy;
use crate::providers::Provider;
use crate::redaction::{REDACTION_PADDING, RedactionRegion};
use crate::reinsert::{InsertOutcome, ReinsertOptions, reinsert};
use crate::span::{Rect, Rgb, TranslationTask};

const ASSUMED_DPI: f32 = 150.0;
const FIXED_ORIGIN: f32 = 50.0;
const ASPECT_TOLERANCE: f32 = 0.05;
const DRAW_SIZE: f32 = 10.0;

/// Where an image-pipeline failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStage {
    Extract,
    Decode,
    Recognize,
    Translate,
    Place,
    Composite,
}

impl fmt::Display for ImageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ImageStage::Extract => "extract",
            ImageStage::Decode => "decode",
            ImageStage::Recognize => "recognize",
            ImageStage::Translate => "translate",
            ImageStage::Place => "place",
            ImageStage::Composite => "composite",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageMode {
    /// Draw the translation onto a copy of the raster and swap the image.
    #[default]
    Overlay,
    /// Erase the image area and draw the translation as page text.
    RedactAndDraw,
}

impl FromStr for ImageMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overlay" => Ok(ImageMode::Overlay),
            "redact-and-draw" | "redact" => Ok(ImageMode::RedactAndDraw),
            other => Err(format!(
                "unknown image mode '{other}' (expected overlay or redact-and-draw)"
            )),
        }
    }
}

/// Last-resort placement when the page never reveals where an image is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackPlacement {
    #[default]
    FixedOrigin,
    Center,
    FullPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementStrategy {
    Direct,
    Block,
    Drawing,
    Fallback,
}

#[derive(Clone, Default)]
pub struct ImageOptions {
    pub mode: ImageMode,
    pub fallback: FallbackPlacement,
    pub overlay: OverlayStyle,
    /// Composited rasters are also written here as `page_<n>_image_<m>.png`.
    pub debug_dir: Option<PathBuf>,
}

/// One image as it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct ImageUnit {
    pub image: ImageRef,
    pub placement: Option<(Rect, PlacementStrategy)>,
    pub pixels: Option<DynamicImage>,
    pub recognized: String,
    pub translated: String,
}

impl ImageUnit {
    fn new(image: ImageRef) -> Self {
        Self {
            image,
            placement: None,
            pixels: None,
            recognized: String::new(),
            translated: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    Replaced(PlacementStrategy),
    Drawn(PlacementStrategy),
    NoText,
    /// The translation came back identical to the recognized text.
    Unchanged,
    Failed(ImageStage),
}

impl ImageOutcome {
    pub fn is_replaced(&self) -> bool {
        matches!(self, ImageOutcome::Replaced(_) | ImageOutcome::Drawn(_))
    }
}

/// Picks the largest rectangle whose aspect ratio is within 5% of `width:height`.
pub fn match_drawing_rect(rects: &[Rect], width: u32, height: u32) -> Option<Rect> {
    if width == 0 || height == 0 {
        return None;
    }
    let aspect = width as f32 / height as f32;
    rects
        .iter()
        .filter(|rect| rect.is_valid())
        .filter(|rect| {
            let candidate = rect.width() / rect.height();
            ((candidate - aspect) / aspect).abs() <= ASPECT_TOLERANCE
        })
        .copied()
        .max_by(|a, b| a.area().total_cmp(&b.area()))
}

pub fn fallback_rect(page: &Rect, width: u32, height: u32, fallback: FallbackPlacement) -> Rect {
    let scale = 72.0 / ASSUMED_DPI;
    let (w, h) = (width as f32 * scale, height as f32 * scale);
    match fallback {
        FallbackPlacement::FixedOrigin => {
            Rect::new(FIXED_ORIGIN, FIXED_ORIGIN, FIXED_ORIGIN + w, FIXED_ORIGIN + h)
        }
        FallbackPlacement::Center => {
            let center = page.center();
            Rect::new(center.x - w / 2.0, center.y - h / 2.0, center.x + w / 2.0, center.y + h / 2.0)
        }
        FallbackPlacement::FullPage => *page,
    }
}

/// Direct placement, then form blocks, then drawn rectangles, then the fallback.
pub fn resolve_placement<S: PageSurface + ?Sized>(
    page: &S,
    image: &ImageRef,
    fallback: FallbackPlacement,
) -> (Rect, PlacementStrategy) {
    match page.image_placement(image) {
        Ok(Some(rect)) => return (rect, PlacementStrategy::Direct),
        Ok(None) => {}
        Err(err) => debug!(image = %image.name, "direct placement lookup failed: {err:#}"),
    }
    match page.image_block(image) {
        Ok(Some(rect)) => return (rect, PlacementStrategy::Block),
        Ok(None) => {}
        Err(err) => debug!(image = %image.name, "block placement lookup failed: {err:#}"),
    }
    match page.drawing_rects() {
        Ok(rects) => {
            if let Some(rect) = match_drawing_rect(&rects, image.width, image.height) {
                return (rect, PlacementStrategy::Drawing);
            }
        }
        Err(err) => debug!(image = %image.name, "drawing lookup failed: {err:#}"),
    }
    (
        fallback_rect(&page.page_rect(), image.width, image.height, fallback),
        PlacementStrategy::Fallback,
    )
}

/// The overlay text takes whichever of its own color or black/white reads on the fill.
fn contrasting(style: &OverlayStyle) -> OverlayStyle {
    let fill = Rgb::from_hex(&style.fill_color).unwrap_or(Rgb::WHITE);
    let text = Rgb::from_hex(&style.text_color).unwrap_or(Rgb::BLACK);
    OverlayStyle {
        text_color: contrast_color(text, fill).to_hex(),
        ..style.clone()
    }
}

/// Image streams already rewritten during a run.
///
/// Overlay replacement changes the shared stream, so a page reusing the same image
/// must not composite a second strip onto it.
#[derive(Debug, Default)]
pub struct ImageLedger {
    seen: Mutex<HashSet<(u32, u16)>>,
}

impl ImageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `id` is offered.
    pub fn first_visit(&self, id: (u32, u16)) -> bool {
        self.lock().insert(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<(u32, u16)>> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ImagePipeline<'a, P> {
    policy: &'a TranslationPolicy<P>,
    recognizer: &'a dyn Recognizer,
    options: &'a ImageOptions,
    ledger: Option<&'a ImageLedger>,
}

impl<'a, P: Provider> ImagePipeline<'a, P> {
    pub fn new(
        policy: &'a TranslationPolicy<P>,
        recognizer: &'a dyn Recognizer,
        options: &'a ImageOptions,
    ) -> Self {
        Self {
            policy,
            recognizer,
            options,
            ledger: None,
        }
    }

    /// Skips images another page already rewrote. Only overlay mode rewrites the
    /// stream itself; redact-and-draw works on each page's own drawing.
    pub fn with_ledger(mut self, ledger: &'a ImageLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    fn already_done(&self, image: &ImageRef) -> bool {
        match (self.options.mode, self.ledger) {
            (ImageMode::Overlay, Some(ledger)) => !ledger.first_visit(image.id),
            _ => false,
        }
    }

    /// Runs every image on the page. A failing image never stops the next one.
    pub async fn run<S: PageSurface + ?Sized>(&self, page: &mut S) -> Result<Vec<ImageOutcome>> {
        let images = page.images()?;
        let mut outcomes = Vec::with_capacity(images.len());
        for (index, image) in images.into_iter().enumerate() {
            let name = image.name.clone();
            if self.already_done(&image) {
                debug!(page = page.number(), image = %name, "image already handled on an earlier page");
                continue;
            }
            let outcome = match self.process(page, image, index + 1).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let stage = err
                        .downcast_ref::<ImageStage>()
                        .copied()
                        .unwrap_or(ImageStage::Composite);
                    warn!(page = page.number(), image = %name, %stage, "image skipped: {err:#}");
                    ImageOutcome::Failed(stage)
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn process<S: PageSurface + ?Sized>(
        &self,
        page: &mut S,
        image: ImageRef,
        index: usize,
    ) -> Result<ImageOutcome> {
        let mut unit = ImageUnit::new(image);
        let raw = page
            .extract_image(&unit.image)
            .context(ImageStage::Extract)?;
        let pixels = raw.decode().context(ImageStage::Decode)?;
        unit.recognized = self
            .recognizer
            .recognize(&pixels)
            .context(ImageStage::Recognize)?
            .trim()
            .to_string();
        if unit.recognized.is_empty() {
            debug!(page = page.number(), image = %unit.image.name, "no text detected");
            return Ok(ImageOutcome::NoText);
        }
        unit.pixels = Some(pixels);

        unit.translated = self.policy.translate(&unit.recognized).await;
        if unit.translated == unit.recognized {
            debug!(page = page.number(), image = %unit.image.name, "image text left as is");
            return Ok(ImageOutcome::Unchanged);
        }

        let (rect, strategy) = resolve_placement(&*page, &unit.image, self.options.fallback);
        unit.placement = Some((rect, strategy));
        debug!(
            page = page.number(),
            image = %unit.image.name,
            ?strategy,
            x0 = rect.x0,
            y0 = rect.y0,
            x1 = rect.x1,
            y1 = rect.y1,
            "resolved image placement"
        );

        match self.options.mode {
            ImageMode::Overlay => self.overlay(page, &unit, index),
            ImageMode::RedactAndDraw => self.redact_and_draw(page, &unit),
        }
    }

    fn overlay<S: PageSurface + ?Sized>(
        &self,
        page: &mut S,
        unit: &ImageUnit,
        index: usize,
    ) -> Result<ImageOutcome> {
        let (Some(pixels), Some((rect, strategy))) = (&unit.pixels, unit.placement) else {
            return Err(anyhow::Error::msg("image was not decoded or placed").context(ImageStage::Place));
        };
        let style = contrasting(&self.options.overlay);
        let composited =
            compose_strip(pixels, &unit.translated, &style).context(ImageStage::Composite)?;
        self.write_debug(page.number(), index, &composited);

        if let Err(err) = page.replace_image(&unit.image, &composited) {
            debug!(image = %unit.image.name, "in-place replacement failed, drawing over it: {err:#}");
            let region = RedactionRegion {
                rect: rect.inflate(REDACTION_PADDING),
                fill: Some(Rgb::WHITE),
            };
            page.apply_redactions(&[region])
                .context(ImageStage::Composite)?;
            page.insert_image(&rect, &composited)
                .context(ImageStage::Composite)?;
        }
        info!(page = page.number(), image = %unit.image.name, "replaced image text");
        Ok(ImageOutcome::Replaced(strategy))
    }

    fn redact_and_draw<S: PageSurface + ?Sized>(
        &self,
        page: &mut S,
        unit: &ImageUnit,
    ) -> Result<ImageOutcome> {
        let Some((rect, strategy)) = unit.placement else {
            return Err(anyhow::Error::msg("image was not placed").context(ImageStage::Place));
        };
        let region = RedactionRegion {
            rect: rect.inflate(REDACTION_PADDING),
            fill: Some(Rgb::WHITE),
        };
        page.apply_redactions(&[region])
            .context(ImageStage::Composite)?;
        let task = TranslationTask {
            original: unit.recognized.clone(),
            translated: unit.translated.clone(),
            bbox: rect,
            font: FontInfo::new(FontFamily::Regular, DRAW_SIZE, Rgb::BLACK),
            rotation: 0,
        };
        let outcome = reinsert(page, &task, Rgb::BLACK, ReinsertOptions::default());
        if outcome == InsertOutcome::Failed {
            warn!(page = page.number(), image = %unit.image.name, "image erased but its text could not be drawn");
            return Ok(ImageOutcome::Failed(ImageStage::Composite));
        }
        info!(page = page.number(), image = %unit.image.name, ?outcome, "drew image text on page");
        Ok(ImageOutcome::Drawn(strategy))
    }

    fn write_debug(&self, page: usize, index: usize, image: &DynamicImage) {
        let Some(dir) = &self.options.debug_dir else {
            return;
        };
        let path = dir.join(format!("page_{page}_image_{index}.png"));
        let written = std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create debug dir: {}", dir.display()))
            .and_then(|_| {
                image
                    .save_with_format(&path, image::ImageFormat::Png)
                    .with_context(|| format!("failed to write debug image: {}", path.display()))
            });
        match written {
            Ok(()) => debug!(path = %path.display(), "wrote composited image"),
            Err(err) => warn!("{err:#}"),
        }
    }
}
