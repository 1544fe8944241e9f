use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::fonts::FontFamily;
use crate::span::{Point, Rect, Rgb, TranslationTask};

const LADDER_MIN_SIZE: f32 = 6.0;
const LADDER_MAX_SIZE: f32 = 20.0;
const FALLBACK_POINT_SIZE: f32 = 8.0;
const FALLBACK_POINT_OFFSET: f32 = 10.0;
const EXPAND_RIGHT: f32 = 50.0;
const EXPAND_DOWN: f32 = 5.0;

/// Text laid out inside a rectangle.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBox<'a> {
    pub rect: Rect,
    pub text: &'a str,
    pub family: FontFamily,
    pub size: f32,
    pub color: Rgb,
    /// Multiple of 90 degrees.
    pub rotation: i32,
}

/// Drawing surface for translated text.
///
/// `insert_textbox` and `probe_textbox` return the vertical space left after layout;
/// a negative value means the text did not fit and nothing was drawn.
pub trait TextCanvas {
    fn insert_textbox(&mut self, text_box: &TextBox<'_>) -> Result<f32>;

    fn probe_textbox(&self, text_box: &TextBox<'_>) -> Result<f32>;

    /// Draws a single line with its baseline at `at`. Never clips.
    fn insert_text(
        &mut self,
        at: Point,
        text: &str,
        family: FontFamily,
        size: f32,
        color: Rgb,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FontChoice {
    Original,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SizeChoice {
    Original,
    /// Percentage of the original size.
    Scaled(u8),
    /// Absolute size in points.
    Fixed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RectChoice {
    Original,
    Expanded,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Strategy {
    pub font: FontChoice,
    pub size: SizeChoice,
    pub rect: RectChoice,
}

impl Strategy {
    const fn new(font: FontChoice, size: SizeChoice, rect: RectChoice) -> Self {
        Self { font, size, rect }
    }

    pub fn family(&self, original: FontFamily) -> FontFamily {
        match self.font {
            FontChoice::Original => original,
            FontChoice::Fallback => FontFamily::Regular,
        }
    }

    pub fn size(&self, original: f32) -> f32 {
        let size = match self.size {
            SizeChoice::Original => original,
            SizeChoice::Scaled(percent) => original * percent as f32 / 100.0,
            SizeChoice::Fixed(size) => size as f32,
        };
        size.clamp(LADDER_MIN_SIZE, LADDER_MAX_SIZE)
    }

    pub fn rect(&self, target: &Rect) -> Rect {
        match self.rect {
            RectChoice::Original => *target,
            RectChoice::Expanded => Rect::new(
                target.x0,
                target.y0,
                target.x1 + EXPAND_RIGHT,
                target.y1 + EXPAND_DOWN,
            ),
        }
    }
}

use FontChoice::{Fallback, Original as OrigFont};
use RectChoice::{Expanded, Original as OrigRect};
use SizeChoice::{Fixed, Original as OrigSize, Scaled};

/// Fallback search order; the first strategy whose layout fits wins.
pub const LADDER: [Strategy; 9] = [
    Strategy::new(OrigFont, OrigSize, OrigRect),
    Strategy::new(OrigFont, Scaled(90), OrigRect),
    Strategy::new(OrigFont, Scaled(80), OrigRect),
    Strategy::new(Fallback, OrigSize, OrigRect),
    Strategy::new(Fallback, Scaled(90), OrigRect),
    Strategy::new(Fallback, Fixed(8), OrigRect),
    Strategy::new(OrigFont, OrigSize, Expanded),
    Strategy::new(Fallback, OrigSize, Expanded),
    Strategy::new(Fallback, Fixed(8), Expanded),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "value")]
pub enum InsertOutcome {
    /// Index into [`LADDER`].
    Strategy(usize),
    ShrunkToFit(f32),
    PointFallback,
    Failed,
}

impl InsertOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, InsertOutcome::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReinsertOptions {
    pub shrink_to_fit: bool,
}

/// Widens degenerate boxes so short strings still get a usable target.
pub fn target_rect(bbox: &Rect, text: &str) -> Rect {
    let mut rect = *bbox;
    if rect.width() < 10.0 {
        let chars = text.chars().count() as f32;
        rect.x1 = rect.x0 + (chars * 8.0).max(50.0);
    }
    if rect.height() < 8.0 {
        rect.y1 = rect.y0 + 12.0;
    }
    rect
}

/// Draws `task.translated` near its original position in `color`.
pub fn reinsert<C: TextCanvas + ?Sized>(
    canvas: &mut C,
    task: &TranslationTask,
    color: Rgb,
    options: ReinsertOptions,
) -> InsertOutcome {
    let target = target_rect(&task.bbox, &task.translated);
    if options.shrink_to_fit {
        if let Some(size) = shrink_to_fit(canvas, task, &target, color) {
            return InsertOutcome::ShrunkToFit(size);
        }
        return point_fallback(canvas, task, color);
    }

    for (index, strategy) in LADDER.iter().enumerate() {
        let text_box = TextBox {
            rect: strategy.rect(&target),
            text: &task.translated,
            family: strategy.family(task.font.family),
            size: strategy.size(task.font.size),
            color,
            rotation: 0,
        };
        match canvas.insert_textbox(&text_box) {
            Ok(remaining) if remaining >= 0.0 => {
                debug!(strategy = index + 1, size = text_box.size, "translated text inserted");
                return InsertOutcome::Strategy(index);
            }
            Ok(_) => {}
            Err(err) => debug!(strategy = index + 1, "textbox insertion failed: {err:#}"),
        }
    }
    point_fallback(canvas, task, color)
}

/// Walks integer sizes downward, probing before drawing. Falls back to the floor size.
pub fn shrink_to_fit<C: TextCanvas + ?Sized>(
    canvas: &mut C,
    task: &TranslationTask,
    rect: &Rect,
    color: Rgb,
) -> Option<f32> {
    let original = task.font.size;
    let start = original.trunc() as i32;
    let floor = (original * 0.3).max(4.0).trunc() as i32;
    let rotation = snap_rotation(task.rotation);
    let text_box = |size: f32| TextBox {
        rect: *rect,
        text: &task.translated,
        family: task.font.family,
        size,
        color,
        rotation,
    };

    for size in (floor + 1..=start).rev() {
        let candidate = text_box(size as f32);
        let fits = canvas
            .probe_textbox(&candidate)
            .map(|remaining| remaining >= 0.0)
            .unwrap_or(false);
        if !fits {
            continue;
        }
        match canvas.insert_textbox(&candidate) {
            Ok(remaining) if remaining >= 0.0 => return Some(size as f32),
            Ok(_) => {}
            Err(err) => debug!(size, "shrink-to-fit insertion failed: {err:#}"),
        }
    }

    match canvas.insert_textbox(&text_box(floor as f32)) {
        Ok(remaining) if remaining >= 0.0 => Some(floor as f32),
        _ => None,
    }
}

fn point_fallback<C: TextCanvas + ?Sized>(
    canvas: &mut C,
    task: &TranslationTask,
    color: Rgb,
) -> InsertOutcome {
    let at = Point::new(task.bbox.x0, task.bbox.y0 + FALLBACK_POINT_OFFSET);
    match canvas.insert_text(
        at,
        &task.translated,
        FontFamily::Regular,
        FALLBACK_POINT_SIZE,
        color,
    ) {
        Ok(()) => {
            debug!(text = %task.translated, "used point insertion fallback");
            InsertOutcome::PointFallback
        }
        Err(err) => {
            warn!("point insertion failed for {:?}: {err:#}", task.translated);
            InsertOutcome::Failed
        }
    }
}

pub fn snap_rotation(degrees: i32) -> i32 {
    let normalized = degrees.rem_euclid(360);
    ((normalized + 45) / 90 * 90) % 360
}
