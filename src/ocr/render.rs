use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::DynamicImage;
use resvg::render;
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use super::OverlayStyle;
use super::font::measure_text_width_px;

const STRIP_PADDING: f32 = 5.0;
const MIN_STRIP_HEIGHT: f32 = 40.0;
const MIN_STRIP_FONT_SIZE: f32 = 8.0;
const LINE_HEIGHT_FACTOR: f32 = 1.2;

/// Wrapped text block for the strip across the top of an image.
#[derive(Debug, Clone, PartialEq)]
pub struct StripLayout {
    pub lines: Vec<String>,
    pub font_size: f32,
    pub line_height: f32,
    pub padding: f32,
    pub height: f32,
}

fn wrap_to_width(text: &str, font_size: f32, max_width: f32, style: &OverlayStyle) -> Vec<String> {
    let measure = |value: &str| measure_text_width_px(value, font_size, style.font_metrics.as_ref());
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
            continue;
        }
        let candidate = format!("{} {}", current, word);
        if measure(&candidate) > max_width {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        } else {
            current = candidate;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Lays `text` out at the style's size, shrinking (not below 8px) until the strip fits
/// in `height`. Lines that still overflow are dropped.
pub fn layout_strip(text: &str, width: u32, height: u32, style: &OverlayStyle) -> StripLayout {
    let max_height = height as f32;
    let inner_width = (width as f32 - STRIP_PADDING * 2.0).max(1.0);
    let mut font_size = style.font_size.max(MIN_STRIP_FONT_SIZE);
    loop {
        let lines = wrap_to_width(text, font_size, inner_width, style);
        let line_height = font_size * LINE_HEIGHT_FACTOR;
        let needed = lines.len() as f32 * line_height + STRIP_PADDING * 2.0;
        if needed <= max_height || font_size <= MIN_STRIP_FONT_SIZE {
            let mut lines = lines;
            let fit = ((max_height - STRIP_PADDING * 2.0) / line_height).floor().max(1.0) as usize;
            lines.truncate(fit);
            let used = lines.len() as f32 * line_height + STRIP_PADDING * 2.0;
            return StripLayout {
                lines,
                font_size,
                line_height,
                padding: STRIP_PADDING,
                height: used.max(MIN_STRIP_HEIGHT).min(max_height),
            };
        }
        font_size = (font_size - 1.0).max(MIN_STRIP_FONT_SIZE);
    }
}

pub fn strip_svg(
    png_bytes: &[u8],
    width: u32,
    height: u32,
    layout: &StripLayout,
    style: &OverlayStyle,
) -> String {
    let data_uri = format!("data:image/png;base64,{}", BASE64.encode(png_bytes));
    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    ));
    svg.push_str(&format!(
        r#"<image href="{uri}" xlink:href="{uri}" x="0" y="0" width="{w}" height="{h}" preserveAspectRatio="none"/>"#,
        uri = data_uri,
        w = width,
        h = height
    ));
    svg.push_str(&format!(
        r#"<rect x="0" y="0" width="{w}" height="{h}" fill="{fill}"/>"#,
        w = width,
        h = layout.height,
        fill = escape_xml(&style.fill_color)
    ));

    let family = style
        .font_family
        .as_deref()
        .or_else(|| style.font_metrics.as_ref().and_then(|m| m.family()))
        .unwrap_or("sans-serif");
    svg.push_str(&format!(
        r#"<text x="{x}" y="{y}" font-size="{size}" fill="{color}" font-family="{family}">"#,
        x = layout.padding,
        y = layout.padding + layout.font_size,
        size = layout.font_size,
        color = escape_xml(&style.text_color),
        family = escape_xml(family)
    ));
    for (idx, line) in layout.lines.iter().enumerate() {
        let escaped = escape_xml(line);
        if idx == 0 {
            svg.push_str(&escaped);
        } else {
            svg.push_str(&format!(
                r#"<tspan x="{x}" dy="{dy}">{text}</tspan>"#,
                x = layout.padding,
                dy = layout.line_height,
                text = escaped
            ));
        }
    }
    svg.push_str("</text></svg>");
    svg
}

/// Returns a copy of `image` with `text` drawn on a solid strip across its top.
pub fn compose_strip(image: &DynamicImage, text: &str, style: &OverlayStyle) -> Result<DynamicImage> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(anyhow!("image has no pixels"));
    }
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .with_context(|| "failed to encode source image")?;
    let layout = layout_strip(text, width, height, style);
    let svg = strip_svg(&png, width, height, &layout, style);
    let font_data = style.font_metrics.as_ref().map(|metrics| metrics.data());
    let bytes = render_svg_bytes(&svg, "image/png", font_data)?;
    image::load_from_memory(&bytes).with_context(|| "failed to decode composed image")
}

pub fn render_svg_bytes(svg: &str, output_mime: &str, font_data: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    if let Some(data) = font_data {
        db.load_font_data(data.to_vec());
    }
    let options = Options {
        fontdb: Arc::new(db),
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap =
        Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
    render(&tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());
    let image = image::RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("failed to build image buffer from SVG"))?;
    let format = image_format_from_mime(output_mime)
        .ok_or_else(|| anyhow!("unsupported output image mime '{}'", output_mime))?;
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .with_context(|| "failed to encode image from SVG")?;
    Ok(bytes)
}

fn image_format_from_mime(mime: &str) -> Option<image::ImageFormat> {
    match mime {
        "image/png" => Some(image::ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(image::ImageFormat::Jpeg),
        _ => None,
    }
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_gets_the_minimum_strip() {
        let layout = layout_strip("Copago", 400, 300, &OverlayStyle::default());
        assert_eq!(layout.lines, vec!["Copago"]);
        assert_eq!(layout.font_size, 18.0);
        assert_eq!(layout.height, 40.0);
    }

    #[test]
    fn long_text_wraps_and_grows_the_strip() {
        let text = "Llame a Servicios para Miembros para obtener más información sobre sus beneficios";
        let layout = layout_strip(text, 200, 400, &OverlayStyle::default());
        assert!(layout.lines.len() > 2);
        assert!(layout.height > 40.0);
        assert!(layout.height <= 400.0);
        assert_eq!(layout.lines.join(" "), text);
    }

    #[test]
    fn tiny_images_shrink_and_truncate() {
        let text = "Servicios hospitalarios para pacientes internados y ambulatorios";
        let layout = layout_strip(text, 60, 30, &OverlayStyle::default());
        assert_eq!(layout.font_size, 8.0);
        assert!(layout.height <= 30.0);
        assert!(!layout.lines.is_empty());
    }

    #[test]
    fn svg_escapes_text() {
        let layout = StripLayout {
            lines: vec!["A & B <C>".to_string(), "second".to_string()],
            font_size: 18.0,
            line_height: 21.6,
            padding: 5.0,
            height: 52.2,
        };
        let svg = strip_svg(&[1, 2, 3], 100, 80, &layout, &OverlayStyle::default());
        assert!(svg.contains("A &amp; B &lt;C&gt;"));
        assert!(svg.contains(r#"<tspan x="5" dy="21.6">second</tspan>"#));
        assert!(svg.contains(r##"fill="#ffffff""##));
        assert!(svg.starts_with("<svg"));
    }
}
