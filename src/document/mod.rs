//! Document I/O: the traits the engine drives, and the lopdf implementation.

use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::path::Path;

use crate::background::PageRaster;
use crate::redaction::RedactionRegion;
use crate::reinsert::TextCanvas;
use crate::span::{Rect, TextSpan};

pub mod content;
pub mod layout;
mod pdf;
mod raster;

pub use pdf::{PdfDocument, PdfPage};
pub use raster::render_pdf_page;

/// An embedded raster image on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Object number and generation of the image stream.
    pub id: (u32, u16),
    pub name: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEncoding {
    Jpeg,
    Jpeg2000,
    /// Unfiltered samples, `components` per pixel.
    Samples,
}

/// Image bytes as stored in the document, before decoding.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub bits_per_component: u8,
    pub encoding: ImageEncoding,
    pub data: Vec<u8>,
}

impl RawImage {
    pub fn decode(&self) -> Result<DynamicImage> {
        match self.encoding {
            ImageEncoding::Jpeg => {
                image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg)
                    .with_context(|| "failed to decode JPEG image")
            }
            ImageEncoding::Jpeg2000 => Err(anyhow!("JPEG 2000 images are not supported")),
            ImageEncoding::Samples => self.decode_samples(),
        }
    }

    fn decode_samples(&self) -> Result<DynamicImage> {
        let (width, height) = (self.width, self.height);
        let pixels = width as usize * height as usize;
        match (self.components, self.bits_per_component) {
            (1, 1) => {
                let stride = (width as usize).div_ceil(8);
                if self.data.len() < stride * height as usize {
                    return Err(anyhow!("image data is truncated"));
                }
                Ok(DynamicImage::ImageLuma8(GrayImage::from_fn(width, height, |x, y| {
                    let byte = self.data[y as usize * stride + x as usize / 8];
                    let bit = (byte >> (7 - x % 8)) & 1;
                    image::Luma([if bit == 1 { 255 } else { 0 }])
                })))
            }
            (1, 8) => GrayImage::from_raw(
                width,
                height,
                self.data.get(..pixels).map(<[u8]>::to_vec).unwrap_or_default(),
            )
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| anyhow!("image data is truncated")),
            (3, 8) => RgbImage::from_raw(
                width,
                height,
                self.data.get(..pixels * 3).map(<[u8]>::to_vec).unwrap_or_default(),
            )
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| anyhow!("image data is truncated")),
            (4, 8) => {
                if self.data.len() < pixels * 4 {
                    return Err(anyhow!("image data is truncated"));
                }
                let mut rgb = Vec::with_capacity(pixels * 3);
                for cmyk in self.data[..pixels * 4].chunks_exact(4) {
                    let k = 255 - cmyk[3] as u16;
                    rgb.extend(cmyk[..3].iter().map(|c| ((255 - *c as u16) * k / 255) as u8));
                }
                RgbImage::from_raw(width, height, rgb)
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| anyhow!("image data is truncated"))
            }
            (components, bits) => Err(anyhow!(
                "unsupported image layout: {components} components at {bits} bits"
            )),
        }
    }
}

/// One page of an open document.
///
/// Geometry is top-left-origin page space in points.
pub trait PageSurface: TextCanvas {
    /// 1-based page number.
    fn number(&self) -> usize;

    fn page_rect(&self) -> Rect;

    fn spans(&self) -> Result<Vec<TextSpan>>;

    fn images(&self) -> Result<Vec<ImageRef>>;

    fn extract_image(&self, image: &ImageRef) -> Result<RawImage>;

    /// Where the page content paints `image` directly.
    fn image_placement(&self, image: &ImageRef) -> Result<Option<Rect>>;

    /// Where `image` ends up when painted through a form XObject.
    fn image_block(&self, image: &ImageRef) -> Result<Option<Rect>>;

    /// Rectangles drawn or clipped by the page content.
    fn drawing_rects(&self) -> Result<Vec<Rect>>;

    fn render(&self, zoom: f32) -> Result<PageRaster>;

    /// Erases every region in one batch. Text and images inside a region are removed
    /// before any fill is painted.
    fn apply_redactions(&mut self, regions: &[RedactionRegion]) -> Result<()>;

    /// Swaps the pixels of `image` everywhere it is used.
    fn replace_image(&mut self, image: &ImageRef, replacement: &DynamicImage) -> Result<()>;

    fn insert_image(&mut self, rect: &Rect, image: &DynamicImage) -> Result<()>;
}

pub trait Document: Sized {
    type Page<'a>: PageSurface
    where
        Self: 'a;

    fn open(path: &Path) -> Result<Self>;

    fn page_count(&self) -> usize;

    /// `number` is 1-based.
    fn page(&mut self, number: usize) -> Result<Self::Page<'_>>;

    fn save(&mut self, path: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(components: u8, bits: u8, data: Vec<u8>) -> RawImage {
        RawImage {
            width: 2,
            height: 2,
            components,
            bits_per_component: bits,
            encoding: ImageEncoding::Samples,
            data,
        }
    }

    #[test]
    fn decodes_rgb_samples() {
        let image = raw(3, 8, vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 9, 9, 9]).decode().unwrap();
        assert_eq!(image.to_rgb8().get_pixel(1, 1).0, [9, 9, 9]);
    }

    #[test]
    fn decodes_one_bit_gray() {
        let image = raw(1, 1, vec![0b1000_0000, 0b0100_0000]).decode().unwrap().to_luma8();
        assert_eq!(image.get_pixel(0, 0).0, [255]);
        assert_eq!(image.get_pixel(1, 0).0, [0]);
        assert_eq!(image.get_pixel(1, 1).0, [255]);
    }

    #[test]
    fn cmyk_converts_to_rgb() {
        let image = raw(4, 8, vec![0, 0, 0, 0, 255, 0, 0, 0, 0, 0, 0, 255, 0, 255, 255, 0])
            .decode()
            .unwrap()
            .to_rgb8();
        assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 255, 255]);
        assert_eq!(image.get_pixel(0, 1).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(1, 1).0, [255, 0, 0]);
    }

    #[test]
    fn truncated_and_unsupported_layouts_fail() {
        assert!(raw(3, 8, vec![0; 5]).decode().is_err());
        assert!(raw(2, 8, vec![0; 8]).decode().is_err());
        let mut jpx = raw(3, 8, vec![]);
        jpx.encoding = ImageEncoding::Jpeg2000;
        assert!(jpx.decode().is_err());
    }
}
