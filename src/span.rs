use serde::{Deserialize, Serialize};

use crate::fonts::FontInfo;

/// Axis-aligned rectangle in top-left-origin page space (points).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut rect = Rect::new(first.x, first.y, first.x, first.y);
        for point in &points[1..] {
            rect.x0 = rect.x0.min(point.x);
            rect.y0 = rect.y0.min(point.y);
            rect.x1 = rect.x1.max(point.x);
            rect.y1 = rect.y1.max(point.y);
        }
        Some(rect)
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn is_valid(&self) -> bool {
        [self.x0, self.y0, self.x1, self.y1]
            .iter()
            .all(|value| value.is_finite())
            && self.x1 > self.x0
            && self.y1 > self.y0
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x0, self.y0)
    }

    pub fn bottom_left(&self) -> Point {
        Point::new(self.x0, self.y1)
    }

    pub fn center(&self) -> Point {
        Point::new((self.x0 + self.x1) * 0.5, (self.y0 + self.y1) * 0.5)
    }

    pub fn contains_point(&self, point: Point) -> bool {
        point.x >= self.x0 && point.x <= self.x1 && point.y >= self.y0 && point.y <= self.y1
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x0 <= other.x0 && self.y0 <= other.y0 && self.x1 >= other.x1 && self.y1 >= other.y1
    }

    pub fn strictly_contains(&self, other: &Rect) -> bool {
        self.x0 < other.x0 && self.y0 < other.y0 && self.x1 > other.x1 && self.y1 > other.y1
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
    }

    pub fn inflate(&self, padding: f32) -> Rect {
        Rect::new(
            self.x0 - padding,
            self.y0 - padding,
            self.x1 + padding,
            self.y1 + padding,
        )
    }

    pub fn area(&self) -> f32 {
        if self.is_valid() {
            self.width() * self.height()
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// RGB color with channels in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb {
        r: 0.0,
        g: 0.0,
        b: 0.0,
    };
    pub const WHITE: Rgb = Rgb {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self {
            r: clamp_unit(r),
            g: clamp_unit(g),
            b: clamp_unit(b),
        }
    }

    pub fn from_u8(r: u8, g: u8, b: u8) -> Self {
        Self::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0)
    }

    pub fn mean(&self) -> f32 {
        (self.r + self.g + self.b) / 3.0
    }

    pub fn to_u8(&self) -> [u8; 3] {
        [
            (self.r * 255.0).round() as u8,
            (self.g * 255.0).round() as u8,
            (self.b * 255.0).round() as u8,
        ]
    }

    /// Parses `#rrggbb` or `rrggbb`.
    pub fn from_hex(value: &str) -> Option<Self> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return None;
        }
        let packed = u32::from_str_radix(hex, 16).ok()?;
        Some(Self::from_u8(
            ((packed >> 16) & 0xff) as u8,
            ((packed >> 8) & 0xff) as u8,
            (packed & 0xff) as u8,
        ))
    }

    pub fn to_hex(&self) -> String {
        let [r, g, b] = self.to_u8();
        format!("#{:02x}{:02x}{:02x}", r, g, b)
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Color as reported by the extractor: a packed `0xRRGGBB` integer or a triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EncodedColor {
    Packed(u32),
    Triple(f32, f32, f32),
    Unknown,
}

impl EncodedColor {
    pub fn decode(&self) -> Rgb {
        match *self {
            EncodedColor::Packed(0) => Rgb::BLACK,
            EncodedColor::Packed(value) if value == 1 || value >= 0xff_ffff => Rgb::WHITE,
            EncodedColor::Packed(value) => Rgb::from_u8(
                ((value >> 16) & 0xff) as u8,
                ((value >> 8) & 0xff) as u8,
                (value & 0xff) as u8,
            ),
            EncodedColor::Triple(r, g, b) => Rgb::new(r, g, b),
            EncodedColor::Unknown => Rgb::BLACK,
        }
    }
}

impl Default for EncodedColor {
    fn default() -> Self {
        EncodedColor::Packed(0)
    }
}

/// Font style bits, using the same layout as common extractors
/// (superscript=1, italic=2, serif=4, mono=8, bold=16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StyleFlags(pub u32);

impl StyleFlags {
    pub const SUPERSCRIPT: u32 = 1;
    pub const ITALIC: u32 = 2;
    pub const SERIF: u32 = 4;
    pub const MONOSPACE: u32 = 8;
    pub const BOLD: u32 = 16;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn is_bold(&self) -> bool {
        self.contains(Self::BOLD)
    }

    pub fn is_italic(&self) -> bool {
        self.contains(Self::ITALIC)
    }
}

/// One contiguous run of text with uniform styling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextSpan {
    pub text: String,
    pub bbox: Rect,
    pub font_size: f32,
    pub flags: StyleFlags,
    pub font_name: String,
    pub color: EncodedColor,
    pub rotation: i32,
    pub origin: Point,
}

impl TextSpan {
    pub fn new(text: impl Into<String>, bbox: Rect, font_size: f32) -> Self {
        let rotation = infer_rotation(0.0, &bbox);
        Self {
            text: text.into(),
            bbox,
            font_size,
            flags: StyleFlags::empty(),
            font_name: String::new(),
            color: EncodedColor::default(),
            rotation,
            origin: bbox.bottom_left(),
        }
    }

    pub fn with_font(mut self, name: impl Into<String>, flags: StyleFlags) -> Self {
        self.font_name = name.into();
        self.flags = flags;
        self
    }

    pub fn with_color(mut self, color: EncodedColor) -> Self {
        self.color = color;
        self
    }

    pub fn with_text_angle(mut self, degrees: f32) -> Self {
        self.rotation = infer_rotation(degrees, &self.bbox);
        self
    }

    pub fn with_origin(mut self, origin: Point) -> Self {
        self.origin = origin;
        self
    }

    /// Whether the extractor produced something the engine can work with.
    pub fn is_usable(&self) -> bool {
        !self.text.trim().is_empty()
            && self.bbox.is_valid()
            && self.font_size.is_finite()
            && self.font_size > 0.0
    }
}

/// Uses the reported angle when present, otherwise treats tall narrow boxes as 90°.
pub fn infer_rotation(text_angle: f32, bbox: &Rect) -> i32 {
    if text_angle.is_finite() && text_angle.round() as i32 != 0 {
        return (text_angle.round() as i32).rem_euclid(360);
    }
    if bbox.height().abs() > bbox.width().abs() * 1.5 {
        return 90;
    }
    0
}

/// A span whose translation differs from its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationTask {
    pub original: String,
    pub translated: String,
    pub bbox: Rect,
    pub font: FontInfo,
    pub rotation: i32,
}

impl TranslationTask {
    pub fn from_span(span: &TextSpan, translated: String) -> Option<Self> {
        if translated == span.text || translated.trim().is_empty() {
            return None;
        }
        Some(Self {
            original: span.text.clone(),
            translated,
            bbox: span.bbox,
            font: FontInfo::from_span(span),
            rotation: span.rotation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_colors_decode_like_the_extractor() {
        assert_eq!(EncodedColor::Packed(0).decode(), Rgb::BLACK);
        assert_eq!(EncodedColor::Packed(1).decode(), Rgb::WHITE);
        assert_eq!(EncodedColor::Packed(0xffffff).decode(), Rgb::WHITE);
        let red = EncodedColor::Packed(0xff0000).decode();
        assert_eq!(red.to_u8(), [255, 0, 0]);
        assert_eq!(EncodedColor::Unknown.decode(), Rgb::BLACK);
        assert_eq!(
            EncodedColor::Triple(2.0, -1.0, 0.5).decode(),
            Rgb::new(1.0, 0.0, 0.5)
        );
    }

    #[test]
    fn hex_round_trip_for_settings_colors() {
        let color = Rgb::from_hex("#c40000").expect("hex");
        assert_eq!(color.to_hex(), "#c40000");
        assert!(Rgb::from_hex("c4000").is_none());
    }

    #[test]
    fn tall_boxes_are_inferred_as_rotated() {
        let tall = Rect::new(0.0, 0.0, 10.0, 40.0);
        assert_eq!(infer_rotation(0.0, &tall), 90);
        let wide = Rect::new(0.0, 0.0, 40.0, 10.0);
        assert_eq!(infer_rotation(0.0, &wide), 0);
        assert_eq!(infer_rotation(-90.0, &wide), 270);
    }

    #[test]
    fn task_requires_a_changed_translation() {
        let span = TextSpan::new("Copay", Rect::new(10.0, 10.0, 60.0, 22.0), 12.0);
        assert!(TranslationTask::from_span(&span, "Copay".to_string()).is_none());
        let task = TranslationTask::from_span(&span, "copago".to_string()).expect("task");
        assert_eq!(task.bbox, span.bbox);
        assert_eq!(task.original, "Copay");
    }
}
