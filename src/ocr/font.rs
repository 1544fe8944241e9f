use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use ttf_parser::{Face, name_id};
use usvg::fontdb;

/// Horizontal metrics of one face, kept alongside its raw data so resvg can load it too.
#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    face_index: u32,
    units_per_em: u16,
    space_advance: u16,
    family: Option<String>,
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Width of `text` in pixels at `font_size`, or `None` if the face no longer parses.
    pub fn measure(&self, text: &str, font_size: f32) -> Option<f32> {
        let face = Face::parse(&self.data, self.face_index).ok()?;
        let advance: u32 = text
            .chars()
            .filter(|ch| *ch != '\n')
            .map(|ch| {
                face.glyph_index(ch)
                    .and_then(|glyph| face.glyph_hor_advance(glyph))
                    .unwrap_or(self.space_advance) as u32
            })
            .sum();
        Some(advance as f32 * font_size / self.units_per_em.max(1) as f32)
    }
}

pub struct ResolvedOverlayFont {
    pub metrics: FontMetrics,
    pub family: String,
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    metrics_from_data(data, None)
        .with_context(|| format!("failed to parse font: {}", path.display()))
}

/// Finds a face for the overlay strip: explicit file, then family name, then the fallbacks.
pub fn resolve_overlay_font(
    font_path: Option<&Path>,
    font_family: Option<&str>,
    fallback: &[&str],
) -> Result<ResolvedOverlayFont> {
    if let Some(path) = font_path {
        let metrics = load_font_metrics(path)?;
        let family = metrics
            .family()
            .or(font_family)
            .unwrap_or("sans-serif")
            .to_string();
        return Ok(ResolvedOverlayFont { metrics, family });
    }

    let mut db = fontdb::Database::new();
    db.load_system_fonts();

    let candidates = font_family.into_iter().chain(fallback.iter().copied());
    for candidate in candidates {
        if let Ok(resolved) = metrics_from_family(&db, candidate) {
            return Ok(resolved);
        }
    }
    Err(anyhow!("no usable overlay font found"))
}

/// Pixel width with real metrics when available, else a per-character estimate.
pub(crate) fn measure_text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    font.and_then(|metrics| metrics.measure(text, font_size))
        .unwrap_or_else(|| estimate_text_width_units(text) * font_size)
}

fn estimate_char_units(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else if ch.is_alphabetic() && (ch as u32) < 0x0250 {
        // Latin-1 and Latin Extended letters render like ASCII.
        0.55
    } else {
        0.9
    }
}

fn estimate_text_width_units(text: &str) -> f32 {
    text.chars().map(estimate_char_units).sum()
}

fn metrics_from_data(data: Vec<u8>, preferred_family: Option<&str>) -> Result<FontMetrics> {
    let data = Arc::new(data);
    let count = ttf_parser::fonts_in_collection(&data).unwrap_or(1);
    let mut fallback = None;
    for index in 0..count {
        let Ok(face) = Face::parse(&data, index) else {
            continue;
        };
        let units_per_em = face.units_per_em().max(1);
        let metrics = FontMetrics {
            data: Arc::clone(&data),
            face_index: index,
            units_per_em,
            space_advance: face
                .glyph_index(' ')
                .and_then(|id| face.glyph_hor_advance(id))
                .unwrap_or(units_per_em / 2),
            family: family_name(&face),
        };
        let matches_preferred = match (preferred_family, metrics.family()) {
            (Some(preferred), Some(found)) => found.eq_ignore_ascii_case(preferred),
            _ => false,
        };
        if matches_preferred {
            return Ok(metrics);
        }
        if fallback.is_none() {
            fallback = Some(metrics);
        }
    }
    fallback.ok_or_else(|| anyhow!("no parsable face in font data"))
}

fn metrics_from_family(db: &fontdb::Database, family: &str) -> Result<ResolvedOverlayFont> {
    let families = if family.eq_ignore_ascii_case("sans-serif") {
        vec![fontdb::Family::SansSerif]
    } else {
        vec![fontdb::Family::Name(family)]
    };
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let data = db
        .with_face_data(id, |data, _index| data.to_vec())
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    let metrics = metrics_from_data(data, Some(family))?;
    let resolved = metrics.family().unwrap_or(family).to_string();
    Ok(ResolvedOverlayFont {
        metrics,
        family: resolved,
    })
}

fn family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_scales_with_font_size() {
        let small = measure_text_width_px("Copago", 10.0, None);
        let large = measure_text_width_px("Copago", 20.0, None);
        assert!((large - small * 2.0).abs() < 1e-3);
        assert!((small - 6.0 * 0.55 * 10.0).abs() < 1e-3);
    }

    #[test]
    fn accented_letters_estimate_like_ascii() {
        assert_eq!(
            measure_text_width_px("año", 10.0, None),
            measure_text_width_px("ano", 10.0, None)
        );
    }

    #[test]
    fn garbage_font_data_is_rejected() {
        assert!(metrics_from_data(vec![0u8; 16], None).is_err());
    }
}
