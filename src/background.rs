use image::RgbImage;

use crate::span::{Rect, Rgb};

/// A page rendered at `zoom` raster pixels per point.
#[derive(Debug, Clone)]
pub struct PageRaster {
    pub image: RgbImage,
    pub zoom: f32,
}

impl PageRaster {
    pub fn new(image: RgbImage, zoom: f32) -> Self {
        Self { image, zoom }
    }

    pub fn background_of(&self, region: &Rect) -> Rgb {
        sample_background(&self.image, self.zoom, region)
    }
}

/// Estimates the fill color behind `region` (page points) from a page raster.
///
/// Samples the center and the four corners pushed outward by `2.5 × zoom` pixels,
/// quantizes each sample to one decimal per channel and returns the most frequent
/// value. Ties go to the earliest sample. Returns white when nothing could be sampled.
pub fn sample_background(raster: &RgbImage, zoom: f32, region: &Rect) -> Rgb {
    let (width, height) = raster.dimensions();
    if width == 0 || height == 0 || !zoom.is_finite() || zoom <= 0.0 || !region.is_valid() {
        return Rgb::WHITE;
    }

    let x0 = (region.x0 * zoom) as i64;
    let y0 = (region.y0 * zoom) as i64;
    let x1 = (region.x1 * zoom) as i64;
    let y1 = (region.y1 * zoom) as i64;
    let (max_x, max_y) = (width as i64 - 1, height as i64 - 1);
    if x1 < 0 || y1 < 0 || x0 > max_x || y0 > max_y {
        return Rgb::WHITE;
    }

    let margin = (2.5 * zoom) as i64;
    let points = [
        ((x0 + x1) / 2, (y0 + y1) / 2),
        (x0 - margin, y0 - margin),
        (x1 + margin, y0 - margin),
        (x0 - margin, y1 + margin),
        (x1 + margin, y1 + margin),
    ];

    let mut tally: Vec<([u8; 3], usize)> = Vec::with_capacity(points.len());
    for (x, y) in points {
        let px = x.clamp(0, max_x) as u32;
        let py = y.clamp(0, max_y) as u32;
        let Some(pixel) = raster.get_pixel_checked(px, py) else {
            continue;
        };
        let key = quantize(pixel.0);
        match tally.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 += 1,
            None => tally.push((key, 1)),
        }
    }

    let mut best: Option<([u8; 3], usize)> = None;
    for (key, count) in tally {
        if best.is_none_or(|(_, top)| count > top) {
            best = Some((key, count));
        }
    }
    match best {
        Some(([r, g, b], _)) => Rgb::new(r as f32 / 10.0, g as f32 / 10.0, b as f32 / 10.0),
        None => Rgb::WHITE,
    }
}

/// Channel values in tenths, so equal colors compare exactly.
fn quantize(pixel: [u8; 3]) -> [u8; 3] {
    pixel.map(|channel| ((channel as f32 / 255.0) * 10.0).round() as u8)
}

pub fn is_dark(color: &Rgb) -> bool {
    color.mean() < 0.4
}

/// Snaps near-extreme text colors to pure white/black and flips dark-on-dark or
/// light-on-light text to the opposite extreme.
pub fn contrast_color(text: Rgb, background: Rgb) -> Rgb {
    let mean = text.mean();
    if is_dark(&background) {
        if mean > 0.8 || is_dark(&text) {
            return Rgb::WHITE;
        }
    } else if mean < 0.2 || mean > 0.8 {
        return Rgb::BLACK;
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb as Pixel;

    fn solid(width: u32, height: u32, value: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Pixel(value))
    }

    #[test]
    fn uniform_raster_returns_its_color() {
        let raster = solid(200, 200, [0, 0, 255]);
        let color = sample_background(&raster, 2.0, &Rect::new(10.0, 10.0, 40.0, 20.0));
        assert_eq!(color, Rgb::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn region_outside_raster_is_white() {
        let raster = solid(20, 20, [0, 0, 0]);
        let color = sample_background(&raster, 2.0, &Rect::new(500.0, 500.0, 600.0, 520.0));
        assert_eq!(color, Rgb::WHITE);
        assert_eq!(
            sample_background(&RgbImage::new(0, 0), 2.0, &Rect::new(0.0, 0.0, 1.0, 1.0)),
            Rgb::WHITE
        );
    }

    #[test]
    fn corners_at_the_edge_are_clamped_without_panicking() {
        let raster = solid(30, 30, [255, 255, 255]);
        let color = sample_background(&raster, 2.0, &Rect::new(0.0, 0.0, 15.0, 15.0));
        assert_eq!(color, Rgb::WHITE);
    }

    #[test]
    fn most_common_sample_wins() {
        // Gray surround with a dark text box in the middle.
        let mut raster = solid(100, 100, [128, 128, 128]);
        for x in 20..60 {
            for y in 20..40 {
                raster.put_pixel(x, y, Pixel([0, 0, 0]));
            }
        }
        let color = sample_background(&raster, 2.0, &Rect::new(10.0, 10.0, 30.0, 20.0));
        assert_eq!(color, Rgb::new(0.5, 0.5, 0.5));
    }

    #[test]
    fn ties_go_to_the_first_sample() {
        // Center sample red, two corners green, two corners blue.
        let mut raster = solid(100, 100, [0, 255, 0]);
        for x in 50..100 {
            for y in 0..100 {
                raster.put_pixel(x, y, Pixel([0, 0, 255]));
            }
        }
        raster.put_pixel(50, 50, Pixel([255, 0, 0]));
        let color = sample_background(&raster, 1.0, &Rect::new(30.0, 30.0, 70.0, 70.0));
        assert_eq!(color, Rgb::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn contrast_flips_light_on_light_and_dark_on_dark() {
        let navy = Rgb::new(0.0, 0.0, 0.3);
        assert!(is_dark(&navy));
        assert_eq!(contrast_color(Rgb::BLACK, navy), Rgb::WHITE);
        assert_eq!(contrast_color(Rgb::WHITE, navy), Rgb::WHITE);
        assert_eq!(contrast_color(Rgb::WHITE, Rgb::WHITE), Rgb::BLACK);
        let red = Rgb::new(0.8, 0.1, 0.1);
        assert_eq!(contrast_color(red, Rgb::WHITE), red);
    }
}
