use crate::fonts::{FontFamily, text_width};
use crate::reinsert::{TextBox, snap_rotation};
use crate::span::{Point, Rect};

pub const LINE_HEIGHT: f32 = 1.2;
pub const ASCENT: f32 = 0.8;

/// One laid-out line: baseline origin plus reading and line-advance directions, all in
/// top-left page space.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedLine {
    pub text: String,
    pub origin: Point,
    pub direction: (f32, f32),
    pub down: (f32, f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLayout {
    pub lines: Vec<PlacedLine>,
    /// Vertical space left in the box; negative when the text overflows.
    pub remaining: f32,
}

/// Greedy word wrap. `None` when a single word is wider than `max_width`.
pub fn wrap_lines(text: &str, family: FontFamily, size: f32, max_width: f32) -> Option<Vec<String>> {
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            if text_width(word, family, size) > max_width + 0.01 {
                return None;
            }
            if current.is_empty() {
                current.push_str(word);
                continue;
            }
            let candidate = format!("{current} {word}");
            if text_width(&candidate, family, size) > max_width + 0.01 {
                lines.push(std::mem::replace(&mut current, word.to_string()));
            } else {
                current = candidate;
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }
    Some(lines)
}

/// Where a box's first line starts and how lines run for each quarter turn.
fn basis(rect: &Rect, rotation: i32) -> (Point, (f32, f32), (f32, f32)) {
    match rotation {
        90 => (Point::new(rect.x0, rect.y1), (0.0, -1.0), (1.0, 0.0)),
        180 => (Point::new(rect.x1, rect.y1), (-1.0, 0.0), (0.0, -1.0)),
        270 => (Point::new(rect.x1, rect.y0), (0.0, 1.0), (-1.0, 0.0)),
        _ => (Point::new(rect.x0, rect.y0), (1.0, 0.0), (0.0, 1.0)),
    }
}

/// Lays `text_box` out without drawing it.
pub fn layout_textbox(text_box: &TextBox<'_>) -> TextLayout {
    let rotation = snap_rotation(text_box.rotation);
    let rect = text_box.rect;
    let (line_width, available) = if rotation % 180 == 0 {
        (rect.width(), rect.height())
    } else {
        (rect.height(), rect.width())
    };
    let size = text_box.size;
    let line_height = size * LINE_HEIGHT;

    let Some(lines) = wrap_lines(text_box.text, text_box.family, size, line_width) else {
        return TextLayout {
            lines: Vec::new(),
            remaining: -line_height,
        };
    };
    let remaining = available - lines.len() as f32 * line_height;
    let (start, direction, down) = basis(&rect, rotation);
    let lines = lines
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let offset = ASCENT * size + index as f32 * line_height;
            PlacedLine {
                text,
                origin: Point::new(start.x + down.0 * offset, start.y + down.1 * offset),
                direction,
                down,
            }
        })
        .collect();
    TextLayout { lines, remaining }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Rgb;

    fn text_box(rect: Rect, text: &str, size: f32, rotation: i32) -> TextBox<'_> {
        TextBox {
            rect,
            text,
            family: FontFamily::Regular,
            size,
            color: Rgb::BLACK,
            rotation,
        }
    }

    #[test]
    fn wraps_on_word_boundaries() {
        let lines = wrap_lines("copago mensual del plan", FontFamily::Regular, 10.0, 60.0).unwrap();
        assert_eq!(lines, vec!["copago", "mensual del", "plan"]);
    }

    #[test]
    fn a_word_wider_than_the_box_overflows() {
        assert!(wrap_lines("hospitalización", FontFamily::Regular, 12.0, 30.0).is_none());
        let layout = layout_textbox(&text_box(Rect::new(0.0, 0.0, 30.0, 100.0), "hospitalización", 12.0, 0));
        assert!(layout.remaining < 0.0);
        assert!(layout.lines.is_empty());
    }

    #[test]
    fn remaining_space_counts_line_height() {
        let layout = layout_textbox(&text_box(Rect::new(10.0, 10.0, 200.0, 40.0), "copago", 10.0, 0));
        assert_eq!(layout.lines.len(), 1);
        assert!((layout.remaining - 18.0).abs() < 1e-4);
        assert_eq!(layout.lines[0].origin, Point::new(10.0, 18.0));
    }

    #[test]
    fn quarter_turn_swaps_the_box_axes() {
        let layout = layout_textbox(&text_box(Rect::new(0.0, 0.0, 20.0, 200.0), "copago", 10.0, 90));
        assert!((layout.remaining - 8.0).abs() < 1e-4);
        let line = &layout.lines[0];
        assert_eq!(line.direction, (0.0, -1.0));
        assert_eq!(line.origin, Point::new(8.0, 200.0));
    }
}
