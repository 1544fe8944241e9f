use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, ImageFormat};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Object, ObjectId, Stream, StringFormat, dictionary};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::content::{
    ContentVisitor, ContentWalker, FontMap, INSERTED_TAG, Matrix, PaintedXObject, Painted, Quad,
    ShownText, encode_win_ansi, load_fonts, name_of, number, redact_operations, resolve,
    resolve_dict, stream_bytes,
};
use super::layout::{PlacedLine, layout_textbox};
use super::raster::render_pdf_page;
use super::{Document, ImageEncoding, ImageRef, PageSurface, RawImage};
use crate::background::PageRaster;
use crate::fonts::FontFamily;
use crate::redaction::RedactionRegion;
use crate::reinsert::{TextBox, TextCanvas};
use crate::span::{EncodedColor, Point, Rect, Rgb, TextSpan};

const MAX_INHERITANCE_DEPTH: usize = 32;
const MAX_FORM_DEPTH: usize = 4;
const IMAGE_PREFIX: &str = "LTImg";

/// MediaBox in user space.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PageBox {
    llx: f32,
    lly: f32,
    urx: f32,
    ury: f32,
}

const LETTER: PageBox = PageBox {
    llx: 0.0,
    lly: 0.0,
    urx: 612.0,
    ury: 792.0,
};

impl PageBox {
    fn from_array(array: &[Object]) -> Option<Self> {
        let values: Vec<f32> = array.iter().filter_map(number).collect();
        let [x0, y0, x1, y1] = values.as_slice() else {
            return None;
        };
        let page_box = PageBox {
            llx: x0.min(*x1),
            lly: y0.min(*y1),
            urx: x0.max(*x1),
            ury: y0.max(*y1),
        };
        (page_box.urx > page_box.llx && page_box.ury > page_box.lly).then_some(page_box)
    }

    fn rect(&self) -> Rect {
        Rect::new(0.0, 0.0, self.urx - self.llx, self.ury - self.lly)
    }

    fn to_page(&self, (x, y): (f32, f32)) -> Point {
        Point::new(x - self.llx, self.ury - y)
    }

    fn to_user(&self, point: Point) -> (f32, f32) {
        (point.x + self.llx, self.ury - point.y)
    }

    fn quad_rect(&self, quad: &Quad) -> Option<Rect> {
        Rect::from_points(&quad.map(|corner| self.to_page(corner)))
    }
}

fn inherited<'d>(doc: &'d lopdf::Document, page_id: ObjectId, key: &[u8]) -> Option<&'d Object> {
    let mut current = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_INHERITANCE_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(value);
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn content_objects(doc: &lopdf::Document, page_id: ObjectId) -> Vec<Object> {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    match page.get(b"Contents") {
        Ok(Object::Array(items)) => items.clone(),
        Ok(Object::Reference(id)) => match doc.get_object(*id) {
            Ok(Object::Array(items)) => items.clone(),
            _ => vec![Object::Reference(*id)],
        },
        _ => Vec::new(),
    }
}

fn page_content(doc: &lopdf::Document, page_id: ObjectId) -> Result<Content> {
    let mut bytes = Vec::new();
    for object in content_objects(doc, page_id) {
        let stream = resolve(doc, &object)
            .and_then(|object| object.as_stream().ok())
            .ok_or_else(|| anyhow!("page contents entry is not a stream"))?;
        if !bytes.is_empty() {
            bytes.push(b'\n');
        }
        bytes.extend(stream_bytes(stream)?);
    }
    Content::decode(&bytes).map_err(|err| anyhow!("failed to parse page content: {err}"))
}

fn xobject_refs(doc: &lopdf::Document, resources: Option<&Dictionary>) -> BTreeMap<Vec<u8>, ObjectId> {
    resources
        .and_then(|resources| resources.get(b"XObject").ok())
        .and_then(|object| resolve_dict(doc, object))
        .map(|dict| {
            dict.iter()
                .filter_map(|(name, object)| Some((name.clone(), object.as_reference().ok()?)))
                .collect()
        })
        .unwrap_or_default()
}

fn xobject_subtype(doc: &lopdf::Document, id: ObjectId) -> Option<String> {
    let stream = doc.get_object(id).and_then(Object::as_stream).ok()?;
    stream.dict.get(b"Subtype").ok().and_then(name_of)
}

fn image_ref(doc: &lopdf::Document, id: ObjectId, name: &[u8]) -> Option<ImageRef> {
    let stream = doc.get_object(id).and_then(Object::as_stream).ok()?;
    let dimension = |key: &[u8]| {
        stream
            .dict
            .get(key)
            .ok()
            .and_then(|object| object.as_i64().ok())
            .filter(|value| *value > 0)
            .map(|value| value as u32)
    };
    Some(ImageRef {
        id,
        name: String::from_utf8_lossy(name).into_owned(),
        width: dimension(b"Width")?,
        height: dimension(b"Height")?,
    })
}

fn filter_names(dict: &Dictionary) -> Vec<String> {
    match dict.get(b"Filter") {
        Ok(Object::Array(items)) => items.iter().filter_map(name_of).collect(),
        Ok(object) => name_of(object).into_iter().collect(),
        Err(_) => Vec::new(),
    }
}

fn color_components(doc: &lopdf::Document, space: Option<&Object>) -> u8 {
    let Some(space) = space.and_then(|object| resolve(doc, object)) else {
        // image masks carry no color space
        return 1;
    };
    match space {
        Object::Name(name) => match name.as_slice() {
            b"DeviceRGB" | b"CalRGB" => 3,
            b"DeviceCMYK" => 4,
            b"DeviceGray" | b"CalGray" => 1,
            _ => 0,
        },
        Object::Array(items) => match items.first().and_then(name_of).as_deref() {
            Some("ICCBased") => items
                .get(1)
                .and_then(|object| resolve_dict(doc, object))
                .and_then(|dict| dict.get(b"N").ok())
                .and_then(|n| n.as_i64().ok())
                .unwrap_or(3) as u8,
            Some("CalRGB" | "Lab") => 3,
            Some("CalGray") => 1,
            _ => 0,
        },
        _ => 0,
    }
}

/// Encodes `image` as a DCT image XObject.
fn jpeg_stream(image: &DynamicImage) -> Result<Stream> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .with_context(|| "failed to encode image as JPEG")?;
    let dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => rgb.width() as i64,
        "Height" => rgb.height() as i64,
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
        "Filter" => "DCTDecode",
    };
    Ok(Stream::new(dict, bytes).with_compression(false))
}

fn reals(values: &[f32]) -> Vec<Object> {
    values.iter().map(|value| Object::Real(*value)).collect()
}

fn text_operations(font: &str, size: f32, color: Rgb, lines: &[(Matrix, &str)]) -> Vec<Operation> {
    let mut operations = vec![
        Operation::new("BMC", vec![Object::Name(INSERTED_TAG.as_bytes().to_vec())]),
        Operation::new("q", vec![]),
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![Object::Name(font.as_bytes().to_vec()), Object::Real(size)],
        ),
        Operation::new("rg", reals(&[color.r, color.g, color.b])),
    ];
    for (matrix, text) in lines {
        operations.push(Operation::new(
            "Tm",
            reals(&[matrix.a, matrix.b, matrix.c, matrix.d, matrix.e, matrix.f]),
        ));
        operations.push(Operation::new(
            "Tj",
            vec![Object::String(encode_win_ansi(text), StringFormat::Literal)],
        ));
    }
    operations.push(Operation::new("ET", vec![]));
    operations.push(Operation::new("Q", vec![]));
    operations.push(Operation::new("EMC", vec![]));
    operations
}

fn fill_operations(page_box: &PageBox, rect: &Rect, color: Rgb) -> Vec<Operation> {
    let (x, y) = page_box.to_user(rect.bottom_left());
    vec![
        Operation::new("q", vec![]),
        Operation::new("rg", reals(&[color.r, color.g, color.b])),
        Operation::new("re", reals(&[x, y, rect.width(), rect.height()])),
        Operation::new("f", vec![]),
        Operation::new("Q", vec![]),
    ]
}

fn line_matrix(page_box: &PageBox, line: &PlacedLine) -> Matrix {
    let (x, y) = page_box.to_user(line.origin);
    // page space has y pointing down
    let (ux, uy) = (line.direction.0, -line.direction.1);
    let (dx, dy) = (line.down.0, -line.down.1);
    Matrix::new(ux, uy, -dx, -dy, x, y)
}

/// A lopdf-backed document opened for in-place editing.
pub struct PdfDocument {
    inner: lopdf::Document,
    source: PathBuf,
    pages: Vec<ObjectId>,
    isolated: HashSet<ObjectId>,
    fonts: HashMap<FontFamily, ObjectId>,
    images_added: usize,
}

impl PdfDocument {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = lopdf::Document::load_mem(bytes)
            .map_err(|err| anyhow!("failed to load PDF from memory: {err}"))?;
        Ok(Self::from_lopdf(inner, PathBuf::from("<memory>")))
    }

    fn from_lopdf(inner: lopdf::Document, source: PathBuf) -> Self {
        let pages = inner.get_pages().into_values().collect();
        Self {
            inner,
            source,
            pages,
            isolated: HashSet::new(),
            fonts: HashMap::new(),
            images_added: 0,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Serializes the current state without compressing it.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.inner
            .save_to(&mut bytes)
            .map_err(|err| anyhow!("failed to serialize PDF: {err}"))?;
        Ok(bytes)
    }
}

impl Document for PdfDocument {
    type Page<'a> = PdfPage<'a>;

    fn open(path: &Path) -> Result<Self> {
        let inner = lopdf::Document::load(path)
            .map_err(|err| anyhow!("failed to open PDF {}: {err}", path.display()))?;
        let document = Self::from_lopdf(inner, path.to_path_buf());
        info!(path = %path.display(), pages = document.pages.len(), "opened PDF");
        Ok(document)
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn page(&mut self, number: usize) -> Result<PdfPage<'_>> {
        let id = number
            .checked_sub(1)
            .and_then(|index| self.pages.get(index))
            .copied()
            .ok_or_else(|| {
                anyhow!(
                    "page {number} is out of range (document has {} pages)",
                    self.pages.len()
                )
            })?;
        let page_box = inherited(&self.inner, id, b"MediaBox")
            .and_then(|object| resolve(&self.inner, object))
            .and_then(|object| object.as_array().ok())
            .and_then(|array| PageBox::from_array(array))
            .unwrap_or(LETTER);
        Ok(PdfPage {
            doc: self,
            id,
            number,
            page_box,
        })
    }

    fn save(&mut self, path: &Path) -> Result<()> {
        self.inner.compress();
        self.inner
            .save(path)
            .map_err(|err| anyhow!("failed to save PDF {}: {err}", path.display()))?;
        info!(path = %path.display(), pages = self.pages.len(), "saved PDF");
        Ok(())
    }
}

struct Placement {
    id: ObjectId,
    name: Vec<u8>,
    quad: Quad,
    nested: bool,
}

struct PlacementCollector<'d> {
    doc: &'d lopdf::Document,
    xobjects: BTreeMap<Vec<u8>, ObjectId>,
    nested: bool,
    depth: usize,
    found: Vec<Placement>,
}

impl ContentVisitor for PlacementCollector<'_> {
    fn xobject(&mut self, painted: PaintedXObject) {
        let Some(&id) = self.xobjects.get(&painted.name) else {
            return;
        };
        let Ok(stream) = self.doc.get_object(id).and_then(Object::as_stream) else {
            return;
        };
        match stream.dict.get(b"Subtype").ok().and_then(name_of).as_deref() {
            Some("Image") => self.found.push(Placement {
                id,
                name: painted.name,
                quad: painted.ctm.quad(0.0, 0.0, 1.0, 1.0),
                nested: self.nested,
            }),
            Some("Form") if self.depth < MAX_FORM_DEPTH => {
                let matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(|object| object.as_array().ok())
                    .and_then(|array| Matrix::from_operands(array))
                    .unwrap_or(Matrix::IDENTITY);
                let Some(content) = stream_bytes(stream)
                    .ok()
                    .and_then(|bytes| Content::decode(&bytes).ok())
                else {
                    return;
                };
                let xobjects = match stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|object| resolve_dict(self.doc, object))
                {
                    Some(resources) => xobject_refs(self.doc, Some(resources)),
                    None => self.xobjects.clone(),
                };
                let mut inner = PlacementCollector {
                    doc: self.doc,
                    xobjects,
                    nested: true,
                    depth: self.depth + 1,
                    found: Vec::new(),
                };
                let fonts = FontMap::new();
                ContentWalker::new(&fonts)
                    .with_ctm(matrix.concat(&painted.ctm))
                    .walk(&content.operations, &mut inner);
                self.found.extend(inner.found);
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct SpanCollector {
    shown: Vec<ShownText>,
}

impl ContentVisitor for SpanCollector {
    fn text(&mut self, shown: ShownText) {
        let has_text = shown.text.as_ref().is_some_and(|text| !text.is_empty());
        if !shown.inserted && has_text {
            self.shown.push(shown);
        }
    }
}

#[derive(Default)]
struct RectCollector {
    quads: Vec<Quad>,
}

impl ContentVisitor for RectCollector {
    fn rect(&mut self, quad: Quad) {
        self.quads.push(quad);
    }
}

fn x_range(quad: &Quad) -> (f32, f32) {
    quad.iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), (x, _)| {
            (lo.min(*x), hi.max(*x))
        })
}

/// Whether `next` continues `run` on the same horizontal line in the same style.
fn continues(run: &ShownText, next: &ShownText) -> bool {
    let horizontal = run.angle.abs() < 0.5 && next.angle.abs() < 0.5;
    let same_style = run.block == next.block
        && run.font_name == next.font_name
        && (run.font_size - next.font_size).abs() < 0.01
        && run.color == next.color;
    if !horizontal || !same_style || (run.origin.1 - next.origin.1).abs() > 0.5 {
        return false;
    }
    let gap = x_range(&next.quad).0 - x_range(&run.quad).1;
    gap > -0.5 && gap < 0.6 * run.font_size
}

fn append_run(run: &mut ShownText, next: ShownText) {
    let gap = x_range(&next.quad).0 - x_range(&run.quad).1;
    if let (Some(text), Some(more)) = (run.text.as_mut(), next.text) {
        if gap > 0.15 * run.font_size
            && !text.ends_with(char::is_whitespace)
            && !more.starts_with(char::is_whitespace)
        {
            text.push(' ');
        }
        text.push_str(&more);
    }
    let points = run.quad.iter().chain(next.quad.iter());
    let (mut x0, mut y0, mut x1, mut y1) = (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
    for (x, y) in points {
        x0 = x0.min(*x);
        y0 = y0.min(*y);
        x1 = x1.max(*x);
        y1 = y1.max(*y);
    }
    run.quad = [(x0, y0), (x1, y0), (x1, y1), (x0, y1)];
}

/// Joins consecutive shows that form one styled run.
fn merge_runs(shown: Vec<ShownText>) -> Vec<ShownText> {
    let mut runs: Vec<ShownText> = Vec::new();
    for next in shown {
        if let Some(run) = runs.last_mut()
            && continues(run, &next)
        {
            append_run(run, next);
            continue;
        }
        runs.push(next);
    }
    runs
}

fn to_span(page_box: &PageBox, shown: ShownText) -> Option<TextSpan> {
    let bbox = page_box.quad_rect(&shown.quad)?;
    let text = shown.text?.trim().to_string();
    let color = shown.color;
    let span = TextSpan::new(text, bbox, shown.font_size)
        .with_font(shown.font_name, shown.flags)
        .with_color(EncodedColor::Triple(color.r, color.g, color.b))
        .with_text_angle(shown.angle)
        .with_origin(page_box.to_page(shown.origin));
    span.is_usable().then_some(span)
}

/// One page of a [`PdfDocument`].
pub struct PdfPage<'a> {
    doc: &'a mut PdfDocument,
    id: ObjectId,
    number: usize,
    page_box: PageBox,
}

impl PdfPage<'_> {
    fn lopdf(&self) -> &lopdf::Document {
        &self.doc.inner
    }

    fn resources(&self) -> Option<&Dictionary> {
        let doc = self.lopdf();
        inherited(doc, self.id, b"Resources").and_then(|object| resolve_dict(doc, object))
    }

    fn fonts(&self) -> FontMap {
        self.resources()
            .map(|resources| load_fonts(self.lopdf(), resources))
            .unwrap_or_default()
    }

    fn content(&self) -> Result<Content> {
        page_content(self.lopdf(), self.id)
            .with_context(|| format!("page {}", self.number))
    }

    fn placements(&self) -> Result<Vec<Placement>> {
        let content = self.content()?;
        let mut collector = PlacementCollector {
            doc: self.lopdf(),
            xobjects: xobject_refs(self.lopdf(), self.resources()),
            nested: false,
            depth: 0,
            found: Vec::new(),
        };
        let fonts = FontMap::new();
        ContentWalker::new(&fonts).walk(&content.operations, &mut collector);
        Ok(collector.found)
    }

    fn page_dict_mut(&mut self) -> Result<&mut Dictionary> {
        let number = self.number;
        self.doc
            .inner
            .get_object_mut(self.id)
            .and_then(Object::as_dict_mut)
            .map_err(|err| anyhow!("page {number} is not a dictionary: {err}"))
    }

    fn add_stream(&mut self, operations: Vec<Operation>) -> Result<ObjectId> {
        let bytes = Content { operations }
            .encode()
            .map_err(|err| anyhow!("failed to encode content stream: {err}"))?;
        Ok(self.doc.inner.add_object(Stream::new(Dictionary::new(), bytes)))
    }

    /// Brackets the existing content in `q`/`Q` once so appended operators start from
    /// the default graphics state.
    fn isolate(&mut self) -> Result<()> {
        if self.doc.isolated.contains(&self.id) {
            return Ok(());
        }
        let mut contents = content_objects(self.lopdf(), self.id);
        if !contents.is_empty() {
            let open = self.add_stream(vec![Operation::new("q", vec![])])?;
            let close = self.add_stream(vec![Operation::new("Q", vec![])])?;
            contents.insert(0, Object::Reference(open));
            contents.push(Object::Reference(close));
            self.page_dict_mut()?.set("Contents", Object::Array(contents));
        }
        self.doc.isolated.insert(self.id);
        Ok(())
    }

    fn append_contents(&mut self, operations: Vec<Operation>) -> Result<()> {
        self.isolate()?;
        let stream = self.add_stream(operations)?;
        let mut contents = content_objects(self.lopdf(), self.id);
        contents.push(Object::Reference(stream));
        self.page_dict_mut()?.set("Contents", Object::Array(contents));
        Ok(())
    }

    fn has_resource(&self, category: &[u8], name: &str) -> bool {
        self.resources()
            .and_then(|resources| resources.get(category).ok())
            .and_then(|object| resolve_dict(self.lopdf(), object))
            .is_some_and(|entries| entries.has(name.as_bytes()))
    }

    /// Adds `name -> target` to the page's own resource dictionary, copying inherited
    /// or shared dictionaries first so other pages are unaffected.
    fn register_resource(&mut self, category: &str, name: &str, target: ObjectId) -> Result<()> {
        let mut resources = self.resources().cloned().unwrap_or_else(Dictionary::new);
        let mut entries = resources
            .get(category.as_bytes())
            .ok()
            .and_then(|object| resolve_dict(self.lopdf(), object))
            .cloned()
            .unwrap_or_else(Dictionary::new);
        entries.set(name, Object::Reference(target));
        resources.set(category, Object::Dictionary(entries));
        self.page_dict_mut()?
            .set("Resources", Object::Dictionary(resources));
        Ok(())
    }

    fn ensure_font(&mut self, family: FontFamily) -> Result<&'static str> {
        let name = family.resource_name();
        if self.has_resource(b"Font", name) {
            return Ok(name);
        }
        let font_id = match self.doc.fonts.get(&family) {
            Some(id) => *id,
            None => {
                let id = self.doc.inner.add_object(dictionary! {
                    "Type" => "Font",
                    "Subtype" => "Type1",
                    "BaseFont" => family.base_font(),
                    "Encoding" => "WinAnsiEncoding",
                });
                self.doc.fonts.insert(family, id);
                id
            }
        };
        self.register_resource("Font", name, font_id)?;
        Ok(name)
    }

    fn page_images(&self) -> HashSet<Vec<u8>> {
        let doc = self.lopdf();
        xobject_refs(doc, self.resources())
            .into_iter()
            .filter(|(_, id)| xobject_subtype(doc, *id).as_deref() == Some("Image"))
            .map(|(name, _)| name)
            .collect()
    }
}

impl TextCanvas for PdfPage<'_> {
    fn insert_textbox(&mut self, text_box: &TextBox<'_>) -> Result<f32> {
        let layout = layout_textbox(text_box);
        if layout.remaining < 0.0 || layout.lines.is_empty() {
            return Ok(layout.remaining);
        }
        let font = self.ensure_font(text_box.family)?;
        let lines: Vec<(Matrix, &str)> = layout
            .lines
            .iter()
            .map(|line| (line_matrix(&self.page_box, line), line.text.as_str()))
            .collect();
        let operations = text_operations(font, text_box.size, text_box.color, &lines);
        self.append_contents(operations)?;
        Ok(layout.remaining)
    }

    fn probe_textbox(&self, text_box: &TextBox<'_>) -> Result<f32> {
        Ok(layout_textbox(text_box).remaining)
    }

    fn insert_text(
        &mut self,
        at: Point,
        text: &str,
        family: FontFamily,
        size: f32,
        color: Rgb,
    ) -> Result<()> {
        let font = self.ensure_font(family)?;
        let (x, y) = self.page_box.to_user(at);
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let operations = text_operations(font, size, color, &[(Matrix::translate(x, y), &line)]);
        self.append_contents(operations)
    }
}

impl PageSurface for PdfPage<'_> {
    fn number(&self) -> usize {
        self.number
    }

    fn page_rect(&self) -> Rect {
        self.page_box.rect()
    }

    fn spans(&self) -> Result<Vec<TextSpan>> {
        let content = self.content()?;
        let fonts = self.fonts();
        let mut collector = SpanCollector::default();
        ContentWalker::new(&fonts).walk(&content.operations, &mut collector);
        Ok(merge_runs(collector.shown)
            .into_iter()
            .filter_map(|run| to_span(&self.page_box, run))
            .collect())
    }

    /// Images this page paints, directly or through forms, in drawing order.
    /// Shared resource entries the page never draws are left out.
    fn images(&self) -> Result<Vec<ImageRef>> {
        let doc = self.lopdf();
        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for placement in self.placements()? {
            if let Some(image) = image_ref(doc, placement.id, &placement.name)
                && seen.insert(placement.id)
            {
                images.push(image);
            }
        }
        Ok(images)
    }

    fn extract_image(&self, image: &ImageRef) -> Result<RawImage> {
        let doc = self.lopdf();
        let stream = doc
            .get_object(image.id)
            .and_then(Object::as_stream)
            .map_err(|err| anyhow!("image {} is not a stream: {err}", image.name))?;
        let filters = filter_names(&stream.dict);
        let encoding = match filters.last().map(String::as_str) {
            Some("DCTDecode") => ImageEncoding::Jpeg,
            Some("JPXDecode") => ImageEncoding::Jpeg2000,
            _ => ImageEncoding::Samples,
        };
        let data = match encoding {
            ImageEncoding::Samples => stream_bytes(stream)?,
            _ if filters.len() == 1 => stream.content.clone(),
            _ => return Err(anyhow!("unsupported filter chain {}", filters.join(", "))),
        };
        let image_mask = stream
            .dict
            .get(b"ImageMask")
            .ok()
            .and_then(|object| object.as_bool().ok())
            .unwrap_or(false);
        let bits = if image_mask {
            1
        } else {
            stream
                .dict
                .get(b"BitsPerComponent")
                .ok()
                .and_then(|object| object.as_i64().ok())
                .unwrap_or(8) as u8
        };
        Ok(RawImage {
            width: image.width,
            height: image.height,
            components: color_components(doc, stream.dict.get(b"ColorSpace").ok()),
            bits_per_component: bits,
            encoding,
            data,
        })
    }

    fn image_placement(&self, image: &ImageRef) -> Result<Option<Rect>> {
        Ok(self
            .placements()?
            .into_iter()
            .find(|placement| !placement.nested && placement.id == image.id)
            .and_then(|placement| self.page_box.quad_rect(&placement.quad)))
    }

    fn image_block(&self, image: &ImageRef) -> Result<Option<Rect>> {
        Ok(self
            .placements()?
            .into_iter()
            .find(|placement| placement.nested && placement.id == image.id)
            .and_then(|placement| self.page_box.quad_rect(&placement.quad)))
    }

    fn drawing_rects(&self) -> Result<Vec<Rect>> {
        let content = self.content()?;
        let fonts = FontMap::new();
        let mut collector = RectCollector::default();
        ContentWalker::new(&fonts).walk(&content.operations, &mut collector);
        Ok(collector
            .quads
            .iter()
            .filter_map(|quad| self.page_box.quad_rect(quad))
            .filter(Rect::is_valid)
            .collect())
    }

    fn render(&self, zoom: f32) -> Result<PageRaster> {
        let mut snapshot = self.doc.inner.clone();
        let mut bytes = Vec::new();
        snapshot
            .save_to(&mut bytes)
            .map_err(|err| anyhow!("failed to serialize PDF for rendering: {err}"))?;
        let image = render_pdf_page(&bytes, self.number, zoom)?;
        Ok(PageRaster::new(image, zoom))
    }

    fn apply_redactions(&mut self, regions: &[RedactionRegion]) -> Result<()> {
        if regions.is_empty() {
            return Ok(());
        }
        let content = self.content()?;
        let fonts = self.fonts();
        let images = self.page_images();
        let page_box = self.page_box;
        let walker = ContentWalker::new(&fonts);
        let (rewritten, removed) =
            redact_operations(content.operations, &walker, &images, |painted, quad| {
                let Some(rect) = page_box.quad_rect(quad) else {
                    return false;
                };
                match painted {
                    Painted::Text => regions
                        .iter()
                        .any(|region| region.rect.contains_point(rect.center())),
                    Painted::Image => regions.iter().any(|region| region.rect.contains(&rect)),
                }
            });

        let mut operations = Vec::with_capacity(rewritten.len() + 2 + regions.len() * 5);
        operations.push(Operation::new("q", vec![]));
        operations.extend(rewritten);
        operations.push(Operation::new("Q", vec![]));
        for region in regions {
            if let Some(fill) = region.fill {
                operations.extend(fill_operations(&page_box, &region.rect, fill));
            }
        }

        let stream = self.add_stream(operations)?;
        self.page_dict_mut()?
            .set("Contents", Object::Reference(stream));
        self.doc.isolated.insert(self.id);
        debug!(
            page = self.number,
            regions = regions.len(),
            removed,
            "applied redactions"
        );
        Ok(())
    }

    fn replace_image(&mut self, image: &ImageRef, replacement: &DynamicImage) -> Result<()> {
        if !matches!(self.lopdf().get_object(image.id), Ok(Object::Stream(_))) {
            return Err(anyhow!("image {} not found", image.name));
        }
        let stream = jpeg_stream(replacement)?;
        self.doc.inner.objects.insert(image.id, Object::Stream(stream));
        debug!(page = self.number, image = %image.name, "replaced image");
        Ok(())
    }

    fn insert_image(&mut self, rect: &Rect, image: &DynamicImage) -> Result<()> {
        let stream = jpeg_stream(image)?;
        let id = self.doc.inner.add_object(stream);
        let name = loop {
            self.doc.images_added += 1;
            let candidate = format!("{IMAGE_PREFIX}{}", self.doc.images_added);
            if !self.has_resource(b"XObject", &candidate) {
                break candidate;
            }
        };
        self.register_resource("XObject", &name, id)?;
        let (x, y) = self.page_box.to_user(rect.bottom_left());
        self.append_contents(vec![
            Operation::new("q", vec![]),
            Operation::new("cm", reals(&[rect.width(), 0.0, 0.0, rect.height(), x, y])),
            Operation::new("Do", vec![Object::Name(name.into_bytes())]),
            Operation::new("Q", vec![]),
        ])
    }
}
