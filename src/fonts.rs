use serde::Serialize;

use crate::span::{EncodedColor, Rgb, StyleFlags, TextSpan};

pub const MIN_FONT_SIZE: f32 = 6.0;
pub const MAX_FONT_SIZE: f32 = 24.0;
const DEFAULT_FONT_SIZE: f32 = 12.0;

/// The four renderable families every PDF viewer ships (standard-14 Helvetica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FontFamily {
    Regular,
    Bold,
    Italic,
    BoldItalic,
}

impl FontFamily {
    pub const ALL: [FontFamily; 4] = [
        FontFamily::Regular,
        FontFamily::Bold,
        FontFamily::Italic,
        FontFamily::BoldItalic,
    ];

    pub fn from_style(bold: bool, italic: bool) -> Self {
        match (bold, italic) {
            (true, true) => FontFamily::BoldItalic,
            (true, false) => FontFamily::Bold,
            (false, true) => FontFamily::Italic,
            (false, false) => FontFamily::Regular,
        }
    }

    pub fn base_font(&self) -> &'static str {
        match self {
            FontFamily::Regular => "Helvetica",
            FontFamily::Bold => "Helvetica-Bold",
            FontFamily::Italic => "Helvetica-Oblique",
            FontFamily::BoldItalic => "Helvetica-BoldOblique",
        }
    }

    /// Resource key used when the family is registered on a page.
    pub fn resource_name(&self) -> &'static str {
        match self {
            FontFamily::Regular => "LTHelv",
            FontFamily::Bold => "LTHelvB",
            FontFamily::Italic => "LTHelvI",
            FontFamily::BoldItalic => "LTHelvBI",
        }
    }

    pub fn is_bold(&self) -> bool {
        matches!(self, FontFamily::Bold | FontFamily::BoldItalic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FontInfo {
    pub family: FontFamily,
    pub size: f32,
    pub color: Rgb,
}

impl FontInfo {
    pub fn new(family: FontFamily, size: f32, color: Rgb) -> Self {
        Self {
            family,
            size: clamp_font_size(size),
            color,
        }
    }

    pub fn from_span(span: &TextSpan) -> Self {
        classify(&span.font_name, span.flags, span.font_size, &span.color)
    }
}

/// Maps raw font metadata to a renderable style. Never fails; unknown fonts are regular.
pub fn classify(font_name: &str, flags: StyleFlags, size: f32, color: &EncodedColor) -> FontInfo {
    let name = font_name.to_lowercase();
    let bold = name.contains("bold") || flags.is_bold();
    let italic = name.contains("italic") || name.contains("oblique") || flags.is_italic();
    FontInfo::new(FontFamily::from_style(bold, italic), size, color.decode())
}

pub fn clamp_font_size(size: f32) -> f32 {
    if !size.is_finite() || size <= 0.0 {
        return DEFAULT_FONT_SIZE;
    }
    size.clamp(MIN_FONT_SIZE, MAX_FONT_SIZE)
}

/// Rendered width of `text` in points using Helvetica advance widths.
pub fn text_width(text: &str, family: FontFamily, size: f32) -> f32 {
    let units: u32 = text.chars().map(|ch| glyph_width(ch) as u32).sum();
    let scale = if family.is_bold() { 1.05 } else { 1.0 };
    units as f32 / 1000.0 * size * scale
}

/// Helvetica AFM advance width for a character, in 1/1000 em.
pub fn glyph_width(ch: char) -> u16 {
    const ASCII: [u16; 95] = [
        278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // ' '..'/'
        556, 556, 556, 556, 556, 556, 556, 556, 556, 556, // '0'..'9'
        278, 278, 584, 584, 584, 556, 1015, // ':'..'@'
        667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, // 'A'..'M'
        722, 778, 667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, // 'N'..'Z'
        278, 278, 278, 469, 556, 333, // '['..'`'
        556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, // 'a'..'m'
        556, 556, 556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, // 'n'..'z'
        334, 260, 334, 584, // '{'..'~'
    ];
    let code = ch as u32;
    if (32..127).contains(&code) {
        return ASCII[(code - 32) as usize];
    }
    match ch {
        '\u{a0}' => 278,
        'á' | 'é' | 'ó' | 'ú' | 'ñ' | 'ü' | 'à' | 'è' | 'ò' | 'ù' | 'â' | 'ê' | 'ô' | 'û' | 'ç' => {
            556
        }
        'í' | 'ì' | 'î' | 'ï' => 278,
        'Á' | 'À' | 'Â' | 'Ä' | 'É' | 'È' | 'Ê' | 'Ë' => 667,
        'Í' | 'Ì' | 'Î' | 'Ï' => 278,
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Ú' | 'Ù' | 'Û' | 'Ü' | 'Ñ' | 'Ç' => 722,
        '¿' | '¡' => 611,
        '–' => 556,
        '—' => 1000,
        '‘' | '’' => 222,
        '“' | '”' => 333,
        '•' => 350,
        '…' => 1000,
        '€' => 556,
        _ => 556,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bold_and_italic_come_from_name_or_flags() {
        let black = EncodedColor::Packed(0);
        let info = classify("Arial-BoldMT", StyleFlags::empty(), 12.0, &black);
        assert_eq!(info.family, FontFamily::Bold);

        let info = classify("Arial", StyleFlags::empty().with(StyleFlags::ITALIC), 12.0, &black);
        assert_eq!(info.family, FontFamily::Italic);

        let flags = StyleFlags::empty().with(StyleFlags::BOLD);
        let info = classify("Times-Italic", flags, 12.0, &black);
        assert_eq!(info.family, FontFamily::BoldItalic);

        let info = classify("", StyleFlags::empty(), 12.0, &black);
        assert_eq!(info.family, FontFamily::Regular);
    }

    #[test]
    fn sizes_are_clamped() {
        let black = EncodedColor::Packed(0);
        assert_eq!(classify("", StyleFlags::empty(), 2.0, &black).size, MIN_FONT_SIZE);
        assert_eq!(classify("", StyleFlags::empty(), 72.0, &black).size, MAX_FONT_SIZE);
        assert_eq!(classify("", StyleFlags::empty(), f32::NAN, &black).size, 12.0);
    }

    #[test]
    fn color_defaults_to_black_and_decodes_packed_values() {
        let info = classify("", StyleFlags::empty(), 10.0, &EncodedColor::Unknown);
        assert_eq!(info.color, Rgb::BLACK);
        let info = classify("", StyleFlags::empty(), 10.0, &EncodedColor::Packed(0x0000ff));
        assert_eq!(info.color.to_u8(), [0, 0, 255]);
    }

    #[test]
    fn helvetica_widths_match_the_afm() {
        assert!((text_width("Copay", FontFamily::Regular, 10.0) - 27.23).abs() < 0.01);
        assert_eq!(glyph_width(' '), 278);
        assert_eq!(glyph_width('W'), 944);
        assert!(text_width("abc", FontFamily::Bold, 10.0) > text_width("abc", FontFamily::Regular, 10.0));
    }
}
