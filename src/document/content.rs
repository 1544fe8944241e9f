//! Content-stream interpretation for the lopdf backend.
//!
//! Everything here works in PDF user space (origin bottom-left). Conversion to the
//! engine's top-left page space happens in [`super::pdf`].

use std::collections::{BTreeMap, HashMap, HashSet};

use lopdf::content::Operation;
use lopdf::{Dictionary, Document, Object};

use crate::fonts::glyph_width;
use crate::span::{Rgb, StyleFlags};

/// Marked-content tag around text this crate draws; extraction skips it.
pub const INSERTED_TAG: &str = "LTInserted";

const ASCENT: f32 = 0.8;
const DESCENT: f32 = -0.2;
const MAX_CMAP_RANGE: u32 = 0x1_0000;

/// Four corners of a transformed rectangle.
pub type Quad = [(f32, f32); 4];

/// PDF transformation matrix `[a b c d e f]` acting on row vectors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Matrix {
    pub const IDENTITY: Matrix = Matrix::new(1.0, 0.0, 0.0, 1.0, 0.0, 0.0);

    pub const fn new(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    pub const fn translate(tx: f32, ty: f32) -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    pub fn from_operands(operands: &[Object]) -> Option<Self> {
        let [a, b, c, d, e, f] = numbers::<6>(operands)?;
        Some(Self::new(a, b, c, d, e, f))
    }

    /// `self × other`: apply `self` first, then `other`.
    pub fn concat(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.a + y * self.c + self.e,
            x * self.b + y * self.d + self.f,
        )
    }

    pub fn quad(&self, x0: f32, y0: f32, x1: f32, y1: f32) -> Quad {
        [
            self.apply(x0, y0),
            self.apply(x1, y0),
            self.apply(x1, y1),
            self.apply(x0, y1),
        ]
    }

    /// Length of the transformed unit y vector; the factor applied to font sizes.
    pub fn vertical_scale(&self) -> f32 {
        self.c.hypot(self.d)
    }

    /// Counter-clockwise angle of the transformed x axis, in degrees.
    pub fn angle(&self) -> f32 {
        self.b.atan2(self.a).to_degrees()
    }
}

pub fn number(object: &Object) -> Option<f32> {
    object.as_float().ok()
}

fn numbers<const N: usize>(operands: &[Object]) -> Option<[f32; N]> {
    if operands.len() < N {
        return None;
    }
    let mut values = [0.0; N];
    for (slot, operand) in values.iter_mut().zip(operands) {
        *slot = number(operand)?;
    }
    Some(values)
}

pub fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

pub fn resolve_dict<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, object)? {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

pub fn name_of(object: &Object) -> Option<String> {
    object
        .as_name()
        .ok()
        .map(|name| String::from_utf8_lossy(name).into_owned())
}

/// Plain bytes of a stream, decompressing when it carries a filter.
pub fn stream_bytes(stream: &lopdf::Stream) -> anyhow::Result<Vec<u8>> {
    if stream.dict.get(b"Filter").is_ok() {
        stream
            .decompressed_content()
            .map_err(|err| anyhow::anyhow!("failed to decompress stream: {err}"))
    } else {
        Ok(stream.content.clone())
    }
}

const WIN_ANSI_HIGH: [(u8, char); 27] = [
    (0x80, '€'),
    (0x82, '‚'),
    (0x83, 'ƒ'),
    (0x84, '„'),
    (0x85, '…'),
    (0x86, '†'),
    (0x87, '‡'),
    (0x88, 'ˆ'),
    (0x89, '‰'),
    (0x8a, 'Š'),
    (0x8b, '‹'),
    (0x8c, 'Œ'),
    (0x8e, 'Ž'),
    (0x91, '‘'),
    (0x92, '’'),
    (0x93, '“'),
    (0x94, '”'),
    (0x95, '•'),
    (0x96, '–'),
    (0x97, '—'),
    (0x98, '˜'),
    (0x99, '™'),
    (0x9a, 'š'),
    (0x9b, '›'),
    (0x9c, 'œ'),
    (0x9e, 'ž'),
    (0x9f, 'Ÿ'),
];

pub fn win_ansi_char(byte: u8) -> Option<char> {
    match byte {
        0x20..=0x7e | 0xa0..=0xff => Some(byte as char),
        b'\t' | b'\n' | b'\r' => Some(' '),
        0x80..=0x9f => WIN_ANSI_HIGH
            .iter()
            .find(|(code, _)| *code == byte)
            .map(|(_, ch)| *ch),
        _ => None,
    }
}

/// Encodes `text` for a WinAnsi font; characters outside the encoding become `?`.
pub fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|ch| match ch as u32 {
            0x20..=0x7e | 0xa0..=0xff => ch as u8,
            _ => WIN_ANSI_HIGH
                .iter()
                .find(|(_, mapped)| *mapped == ch)
                .map(|(code, _)| *code)
                .unwrap_or(b'?'),
        })
        .collect()
}

/// Parsed `/ToUnicode` CMap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToUnicode {
    map: HashMap<u32, String>,
    code_len: usize,
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Hex(Vec<u8>),
    Word(&'a str),
    Open,
    Close,
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'%' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            }
            b'<' if bytes.get(pos + 1) == Some(&b'<') => pos += 2,
            b'>' if bytes.get(pos + 1) == Some(&b'>') => pos += 2,
            b'<' => {
                let start = pos + 1;
                let end = text[start..].find('>').map_or(bytes.len(), |i| start + i);
                tokens.push(Token::Hex(parse_hex(&text[start..end])));
                pos = end + 1;
            }
            b'[' => {
                tokens.push(Token::Open);
                pos += 1;
            }
            b']' => {
                tokens.push(Token::Close);
                pos += 1;
            }
            byte if byte.is_ascii_whitespace() => pos += 1,
            _ => {
                let start = pos;
                while pos < bytes.len()
                    && !bytes[pos].is_ascii_whitespace()
                    && !matches!(bytes[pos], b'<' | b'>' | b'[' | b']' | b'%')
                {
                    pos += 1;
                }
                if pos == start {
                    // stray `>`
                    pos += 1;
                    continue;
                }
                tokens.push(Token::Word(&text[start..pos]));
            }
        }
    }
    tokens
}

fn parse_hex(digits: &str) -> Vec<u8> {
    let clean: Vec<u8> = digits
        .bytes()
        .filter(|byte| byte.is_ascii_hexdigit())
        .collect();
    clean
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).unwrap_or(0);
            let lo = pair
                .get(1)
                .and_then(|byte| (*byte as char).to_digit(16))
                .unwrap_or(0);
            (hi * 16 + lo) as u8
        })
        .collect()
}

fn code_value(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, byte| (acc << 8) | *byte as u32)
}

fn utf16_units(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [single] => *single as u16,
            _ => 0,
        })
        .collect()
}

impl ToUnicode {
    pub fn parse(data: &[u8]) -> Self {
        let text = String::from_utf8_lossy(data);
        let tokens = tokenize(&text);
        let mut cmap = ToUnicode::default();
        let mut iter = tokens.into_iter();
        while let Some(token) = iter.next() {
            match token {
                Token::Word("begincodespacerange") => {
                    if let Some(Token::Hex(lo)) = iter.next()
                        && cmap.code_len == 0
                    {
                        cmap.code_len = lo.len();
                    }
                }
                Token::Word("beginbfchar") => loop {
                    match iter.next() {
                        Some(Token::Hex(src)) => {
                            let Some(Token::Hex(dst)) = iter.next() else {
                                break;
                            };
                            cmap.note_width(&src);
                            cmap.map.insert(
                                code_value(&src),
                                String::from_utf16_lossy(&utf16_units(&dst)),
                            );
                        }
                        Some(Token::Word("endbfchar")) | None => break,
                        _ => {}
                    }
                },
                Token::Word("beginbfrange") => loop {
                    match iter.next() {
                        Some(Token::Hex(lo)) => {
                            let Some(Token::Hex(hi)) = iter.next() else {
                                break;
                            };
                            cmap.note_width(&lo);
                            let (start, end) = (code_value(&lo), code_value(&hi));
                            if end < start || end - start > MAX_CMAP_RANGE {
                                continue;
                            }
                            match iter.next() {
                                Some(Token::Hex(dst)) => {
                                    let units = utf16_units(&dst);
                                    for (offset, code) in (start..=end).enumerate() {
                                        let mut shifted = units.clone();
                                        if let Some(last) = shifted.last_mut() {
                                            *last = last.wrapping_add(offset as u16);
                                        }
                                        cmap.map
                                            .insert(code, String::from_utf16_lossy(&shifted));
                                    }
                                }
                                Some(Token::Open) => {
                                    let mut code = start;
                                    while let Some(Token::Hex(dst)) = iter.next() {
                                        if code <= end {
                                            cmap.map.insert(
                                                code,
                                                String::from_utf16_lossy(&utf16_units(&dst)),
                                            );
                                        }
                                        code += 1;
                                    }
                                }
                                _ => break,
                            }
                        }
                        Some(Token::Word("endbfrange")) | None => break,
                        _ => {}
                    }
                },
                _ => {}
            }
        }
        if cmap.code_len == 0 {
            cmap.code_len = 1;
        }
        cmap
    }

    fn note_width(&mut self, src: &[u8]) {
        if self.code_len == 0 {
            self.code_len = src.len().clamp(1, 4);
        }
    }

    pub fn get(&self, code: u32) -> Option<&str> {
        self.map.get(&code).map(String::as_str)
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// What the walker needs to know about one font resource.
#[derive(Debug, Clone, Default)]
pub struct PdfFont {
    pub base_font: String,
    pub flags: StyleFlags,
    code_len: usize,
    first_char: u32,
    widths: Vec<f32>,
    cid_widths: HashMap<u32, f32>,
    default_width: Option<f32>,
    monospace_width: Option<f32>,
    to_unicode: Option<ToUnicode>,
}

pub type FontMap = HashMap<Vec<u8>, PdfFont>;

fn strip_subset_prefix(name: &str) -> &str {
    match name.split_once('+') {
        Some((prefix, rest))
            if prefix.len() == 6 && prefix.chars().all(|ch| ch.is_ascii_uppercase()) =>
        {
            rest
        }
        _ => name,
    }
}

fn descriptor_flags(doc: &Document, font: &Dictionary) -> StyleFlags {
    let Some(descriptor) = font
        .get(b"FontDescriptor")
        .ok()
        .and_then(|object| resolve_dict(doc, object))
    else {
        return StyleFlags::empty();
    };
    let raw = descriptor
        .get(b"Flags")
        .ok()
        .and_then(|object| object.as_i64().ok())
        .unwrap_or(0);
    let weight = descriptor.get(b"FontWeight").ok().and_then(number);
    let mut flags = StyleFlags::empty();
    if raw & 1 != 0 {
        flags = flags.with(StyleFlags::MONOSPACE);
    }
    if raw & 2 != 0 {
        flags = flags.with(StyleFlags::SERIF);
    }
    if raw & 64 != 0 {
        flags = flags.with(StyleFlags::ITALIC);
    }
    if raw & (1 << 18) != 0 || weight.is_some_and(|weight| weight >= 600.0) {
        flags = flags.with(StyleFlags::BOLD);
    }
    flags
}

fn missing_width(doc: &Document, font: &Dictionary) -> Option<f32> {
    font.get(b"FontDescriptor")
        .ok()
        .and_then(|object| resolve_dict(doc, object))
        .and_then(|descriptor| descriptor.get(b"MissingWidth").ok())
        .and_then(number)
        .filter(|width| *width > 0.0)
}

fn parse_cid_widths(doc: &Document, array: &[Object]) -> HashMap<u32, f32> {
    let mut widths = HashMap::new();
    let mut index = 0;
    while index < array.len() {
        let Some(first) = number(&array[index]) else {
            break;
        };
        let first = first as u32;
        match array.get(index + 1).and_then(|object| resolve(doc, object)) {
            Some(Object::Array(list)) => {
                for (offset, width) in list.iter().enumerate() {
                    if let Some(width) = number(width) {
                        widths.insert(first + offset as u32, width);
                    }
                }
                index += 2;
            }
            Some(last) => {
                let (Some(last), Some(width)) =
                    (number(last), array.get(index + 2).and_then(number))
                else {
                    break;
                };
                let last = last as u32;
                if last >= first && last - first <= MAX_CMAP_RANGE {
                    for cid in first..=last {
                        widths.insert(cid, width);
                    }
                }
                index += 3;
            }
            None => break,
        }
    }
    widths
}

impl PdfFont {
    /// A standard-14 font with WinAnsi encoding and built-in metrics.
    pub fn standard(base_font: &str) -> Self {
        Self {
            base_font: base_font.to_string(),
            code_len: 1,
            monospace_width: base_font.contains("Courier").then_some(600.0),
            ..Self::default()
        }
    }

    pub fn from_dict(doc: &Document, dict: &Dictionary) -> Self {
        let base_font = dict
            .get(b"BaseFont")
            .ok()
            .and_then(name_of)
            .map(|name| strip_subset_prefix(&name).to_string())
            .unwrap_or_default();
        let subtype = dict.get(b"Subtype").ok().and_then(name_of);
        let to_unicode = dict
            .get(b"ToUnicode")
            .ok()
            .and_then(|object| resolve(doc, object))
            .and_then(|object| object.as_stream().ok())
            .and_then(|stream| stream_bytes(stream).ok())
            .map(|bytes| ToUnicode::parse(&bytes))
            .filter(|cmap| !cmap.is_empty());

        if subtype.as_deref() == Some("Type0") {
            let descendant = dict
                .get(b"DescendantFonts")
                .ok()
                .and_then(|object| resolve(doc, object))
                .and_then(|object| object.as_array().ok())
                .and_then(|array| array.first())
                .and_then(|object| resolve_dict(doc, object));
            let (cid_widths, default_width, flags) = match descendant {
                Some(descendant) => (
                    descendant
                        .get(b"W")
                        .ok()
                        .and_then(|object| resolve(doc, object))
                        .and_then(|object| object.as_array().ok())
                        .map(|array| parse_cid_widths(doc, array))
                        .unwrap_or_default(),
                    descendant.get(b"DW").ok().and_then(number),
                    descriptor_flags(doc, descendant),
                ),
                None => (HashMap::new(), None, StyleFlags::empty()),
            };
            return Self {
                base_font,
                flags,
                code_len: 2,
                cid_widths,
                default_width: Some(default_width.unwrap_or(1000.0)),
                to_unicode,
                ..Self::default()
            };
        }

        let widths = dict
            .get(b"Widths")
            .ok()
            .and_then(|object| resolve(doc, object))
            .and_then(|object| object.as_array().ok())
            .map(|array| {
                array
                    .iter()
                    .map(|width| resolve(doc, width).and_then(number).unwrap_or(0.0))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            first_char: dict
                .get(b"FirstChar")
                .ok()
                .and_then(|object| object.as_i64().ok())
                .unwrap_or(0)
                .max(0) as u32,
            widths,
            default_width: missing_width(doc, dict),
            flags: descriptor_flags(doc, dict),
            to_unicode,
            ..Self::standard(&base_font)
        }
    }

    pub fn code_len(&self) -> usize {
        self.code_len.max(1)
    }

    pub fn codes(&self, bytes: &[u8]) -> Vec<u32> {
        bytes.chunks(self.code_len()).map(code_value).collect()
    }

    /// Unicode text for one character code; `None` when the font gives no way to know.
    pub fn decode(&self, code: u32) -> Option<String> {
        if let Some(text) = self.to_unicode.as_ref().and_then(|cmap| cmap.get(code)) {
            return Some(text.to_string());
        }
        if self.code_len() == 1 {
            return win_ansi_char(code as u8).map(String::from);
        }
        None
    }

    /// Advance width in 1/1000 text-space units.
    pub fn width(&self, code: u32) -> f32 {
        if self.code_len() > 1 {
            return self
                .cid_widths
                .get(&code)
                .copied()
                .or(self.default_width)
                .unwrap_or(1000.0);
        }
        if let Some(width) = code
            .checked_sub(self.first_char)
            .and_then(|index| self.widths.get(index as usize))
            .filter(|width| **width > 0.0)
        {
            return *width;
        }
        if let Some(width) = self.monospace_width {
            return width;
        }
        if let Some(width) = self.default_width.filter(|_| !self.widths.is_empty()) {
            return width;
        }
        let ch = self
            .decode(code)
            .and_then(|text| text.chars().next())
            .unwrap_or(' ');
        glyph_width(ch) as f32
    }
}

/// Fonts named in a resource dictionary's `/Font` entry.
pub fn load_fonts(doc: &Document, resources: &Dictionary) -> FontMap {
    let Some(fonts) = resources
        .get(b"Font")
        .ok()
        .and_then(|object| resolve_dict(doc, object))
    else {
        return FontMap::new();
    };
    fonts
        .iter()
        .filter_map(|(name, object)| {
            let dict = resolve_dict(doc, object)?;
            Some((name.clone(), PdfFont::from_dict(doc, dict)))
        })
        .collect()
}

/// One text-show operator, measured in user space.
#[derive(Debug, Clone, PartialEq)]
pub struct ShownText {
    /// Index of the operator in the walked slice.
    pub index: usize,
    /// `None` when some code could not be mapped to Unicode.
    pub text: Option<String>,
    pub quad: Quad,
    pub origin: (f32, f32),
    pub font_size: f32,
    pub font_name: String,
    pub flags: StyleFlags,
    pub color: Rgb,
    pub angle: f32,
    /// Horizontal displacement in text space.
    pub advance: f32,
    /// `Tf` size times horizontal scaling; converts `TJ` adjustments to text space.
    pub scale: f32,
    pub inserted: bool,
    /// Ordinal of the enclosing `BT`.
    pub block: usize,
}

/// A `Do` operator with the CTM it ran under.
#[derive(Debug, Clone, PartialEq)]
pub struct PaintedXObject {
    pub index: usize,
    pub name: Vec<u8>,
    pub ctm: Matrix,
}

pub trait ContentVisitor {
    fn text(&mut self, _shown: ShownText) {}

    fn xobject(&mut self, _painted: PaintedXObject) {}

    fn rect(&mut self, _quad: Quad) {}
}

#[derive(Debug, Clone)]
struct GraphicsState {
    ctm: Matrix,
    fill: Rgb,
    font: Option<Vec<u8>>,
    size: f32,
    char_spacing: f32,
    word_spacing: f32,
    horizontal_scale: f32,
    leading: f32,
    rise: f32,
}

impl GraphicsState {
    fn new(ctm: Matrix) -> Self {
        Self {
            ctm,
            fill: Rgb::BLACK,
            font: None,
            size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            horizontal_scale: 100.0,
            leading: 0.0,
            rise: 0.0,
        }
    }
}

fn fill_color(operands: &[Object]) -> Option<Rgb> {
    let values: Vec<f32> = operands.iter().map_while(number).collect();
    match values.as_slice() {
        [gray] => Some(Rgb::new(*gray, *gray, *gray)),
        [r, g, b] => Some(Rgb::new(*r, *g, *b)),
        [c, m, y, k] => Some(Rgb::new(
            (1.0 - c) * (1.0 - k),
            (1.0 - m) * (1.0 - k),
            (1.0 - y) * (1.0 - k),
        )),
        _ => None,
    }
}

enum Piece<'o> {
    Bytes(&'o [u8]),
    Adjust(f32),
}

fn pieces<'o>(operator: &str, operands: &'o [Object]) -> Vec<Piece<'o>> {
    let shown = match operator {
        "\"" => operands.get(2),
        _ => operands.first(),
    };
    match shown {
        Some(Object::String(bytes, _)) => vec![Piece::Bytes(bytes)],
        Some(Object::Array(items)) if operator == "TJ" => items
            .iter()
            .filter_map(|item| match item {
                Object::String(bytes, _) => Some(Piece::Bytes(bytes)),
                other => number(other).map(Piece::Adjust),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Walks content operators, tracking the graphics and text state.
pub struct ContentWalker<'a> {
    fonts: &'a FontMap,
    fallback: PdfFont,
    initial: Matrix,
}

impl<'a> ContentWalker<'a> {
    pub fn new(fonts: &'a FontMap) -> Self {
        Self {
            fonts,
            fallback: PdfFont::standard("Helvetica"),
            initial: Matrix::IDENTITY,
        }
    }

    pub fn with_ctm(mut self, ctm: Matrix) -> Self {
        self.initial = ctm;
        self
    }

    pub fn walk<V: ContentVisitor + ?Sized>(&self, operations: &[Operation], visitor: &mut V) {
        let mut state = GraphicsState::new(self.initial);
        let mut saved = Vec::new();
        let mut tm = Matrix::IDENTITY;
        let mut tlm = Matrix::IDENTITY;
        let mut marked: Vec<bool> = Vec::new();
        let mut block = 0;

        for (index, operation) in operations.iter().enumerate() {
            let operands = operation.operands.as_slice();
            match operation.operator.as_str() {
                "q" => saved.push(state.clone()),
                "Q" => {
                    if let Some(previous) = saved.pop() {
                        state = previous;
                    }
                }
                "cm" => {
                    if let Some(matrix) = Matrix::from_operands(operands) {
                        state.ctm = matrix.concat(&state.ctm);
                    }
                }
                "BT" => {
                    tm = Matrix::IDENTITY;
                    tlm = Matrix::IDENTITY;
                    block += 1;
                }
                "Tf" => {
                    state.font = operands
                        .first()
                        .and_then(|name| name.as_name().ok())
                        .map(<[u8]>::to_vec);
                    if let Some(size) = operands.get(1).and_then(number) {
                        state.size = size;
                    }
                }
                "Tc" => set_number(&mut state.char_spacing, operands),
                "Tw" => set_number(&mut state.word_spacing, operands),
                "Tz" => set_number(&mut state.horizontal_scale, operands),
                "TL" => set_number(&mut state.leading, operands),
                "Ts" => set_number(&mut state.rise, operands),
                "Td" | "TD" => {
                    if let Some([tx, ty]) = numbers::<2>(operands) {
                        if operation.operator == "TD" {
                            state.leading = -ty;
                        }
                        tlm = Matrix::translate(tx, ty).concat(&tlm);
                        tm = tlm;
                    }
                }
                "Tm" => {
                    if let Some(matrix) = Matrix::from_operands(operands) {
                        tm = matrix;
                        tlm = matrix;
                    }
                }
                "T*" => {
                    tlm = Matrix::translate(0.0, -state.leading).concat(&tlm);
                    tm = tlm;
                }
                operator @ ("Tj" | "TJ" | "'" | "\"") => {
                    if operator == "\"" {
                        set_number(&mut state.word_spacing, operands);
                        set_number(&mut state.char_spacing, &operands[operands.len().min(1)..]);
                    }
                    if operator == "'" || operator == "\"" {
                        tlm = Matrix::translate(0.0, -state.leading).concat(&tlm);
                        tm = tlm;
                    }
                    let mut shown = self.show(&pieces(operator, operands), &state, &mut tm);
                    shown.index = index;
                    shown.block = block;
                    shown.inserted = marked.iter().any(|inserted| *inserted);
                    visitor.text(shown);
                }
                "rg" | "g" | "k" | "sc" | "scn" => {
                    if let Some(color) = fill_color(operands) {
                        state.fill = color;
                    }
                }
                "Do" => {
                    if let Some(name) = operands.first().and_then(|name| name.as_name().ok()) {
                        visitor.xobject(PaintedXObject {
                            index,
                            name: name.to_vec(),
                            ctm: state.ctm,
                        });
                    }
                }
                "re" => {
                    if let Some([x, y, w, h]) = numbers::<4>(operands) {
                        visitor.rect(state.ctm.quad(x, y, x + w, y + h));
                    }
                }
                "BMC" | "BDC" => {
                    let tag = operands.first().and_then(name_of);
                    marked.push(tag.as_deref() == Some(INSERTED_TAG));
                }
                "EMC" => {
                    marked.pop();
                }
                _ => {}
            }
        }
    }

    fn show(&self, pieces: &[Piece<'_>], state: &GraphicsState, tm: &mut Matrix) -> ShownText {
        let font = state
            .font
            .as_ref()
            .and_then(|name| self.fonts.get(name))
            .unwrap_or(&self.fallback);
        let th = state.horizontal_scale / 100.0;
        let mut advance = 0.0;
        let mut text = Some(String::new());
        for piece in pieces {
            match piece {
                Piece::Adjust(amount) => advance -= amount / 1000.0 * state.size * th,
                Piece::Bytes(bytes) => {
                    for code in font.codes(bytes) {
                        match (font.decode(code), text.as_mut()) {
                            (Some(decoded), Some(buffer)) => buffer.push_str(&decoded),
                            (None, _) => text = None,
                            _ => {}
                        }
                        let mut width = font.width(code) / 1000.0 * state.size + state.char_spacing;
                        if font.code_len() == 1 && code == 32 {
                            width += state.word_spacing;
                        }
                        advance += width * th;
                    }
                }
            }
        }

        let trm = tm.concat(&state.ctm);
        let rise = state.rise;
        let shown = ShownText {
            index: 0,
            text,
            quad: trm.quad(
                0.0,
                rise + DESCENT * state.size,
                advance,
                rise + ASCENT * state.size,
            ),
            origin: trm.apply(0.0, rise),
            font_size: state.size * trm.vertical_scale(),
            font_name: font.base_font.clone(),
            flags: font.flags,
            color: state.fill,
            angle: trm.angle(),
            advance,
            scale: state.size * th,
            inserted: false,
            block: 0,
        };
        *tm = Matrix::translate(advance, 0.0).concat(tm);
        shown
    }
}

fn set_number(slot: &mut f32, operands: &[Object]) {
    if let Some(value) = operands.first().and_then(number) {
        *slot = value;
    }
}

/// What a redaction callback is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Painted {
    Text,
    Image,
}

struct RedactionVisitor<'o, F> {
    operations: &'o [Operation],
    images: &'o HashSet<Vec<u8>>,
    remove: F,
    replacements: BTreeMap<usize, Vec<Operation>>,
}

impl<F: FnMut(Painted, &Quad) -> bool> ContentVisitor for RedactionVisitor<'_, F> {
    fn text(&mut self, shown: ShownText) {
        if (self.remove)(Painted::Text, &shown.quad) {
            let original = &self.operations[shown.index];
            self.replacements
                .insert(shown.index, blank_show(original, &shown));
        }
    }

    fn xobject(&mut self, painted: PaintedXObject) {
        if self.images.contains(&painted.name)
            && (self.remove)(Painted::Image, &painted.ctm.quad(0.0, 0.0, 1.0, 1.0))
        {
            self.replacements.insert(painted.index, Vec::new());
        }
    }
}

/// Operators standing in for a removed text show: same state changes and advance, no glyphs.
fn blank_show(original: &Operation, shown: &ShownText) -> Vec<Operation> {
    let mut operations = Vec::new();
    match original.operator.as_str() {
        "'" => operations.push(Operation::new("T*", vec![])),
        "\"" => {
            if let [word, char_spacing, ..] = original.operands.as_slice() {
                operations.push(Operation::new("Tw", vec![word.clone()]));
                operations.push(Operation::new("Tc", vec![char_spacing.clone()]));
            }
            operations.push(Operation::new("T*", vec![]));
        }
        _ => {}
    }
    if shown.scale.abs() > f32::EPSILON && shown.advance != 0.0 {
        let adjustment = -shown.advance * 1000.0 / shown.scale;
        operations.push(Operation::new(
            "TJ",
            vec![Object::Array(vec![Object::Real(adjustment)])],
        ));
    }
    operations
}

/// Removes the text shows and image paints `remove` selects. Returns the rewritten
/// operators and how many were removed.
pub fn redact_operations(
    operations: Vec<Operation>,
    walker: &ContentWalker<'_>,
    images: &HashSet<Vec<u8>>,
    remove: impl FnMut(Painted, &Quad) -> bool,
) -> (Vec<Operation>, usize) {
    let mut visitor = RedactionVisitor {
        operations: &operations,
        images,
        remove,
        replacements: BTreeMap::new(),
    };
    walker.walk(&operations, &mut visitor);
    let mut replacements = visitor.replacements;
    let removed = replacements.len();
    if removed == 0 {
        return (operations, 0);
    }

    let mut rewritten = Vec::with_capacity(operations.len() + removed);
    for (index, operation) in operations.into_iter().enumerate() {
        match replacements.remove(&index) {
            Some(replacement) => rewritten.extend(replacement),
            None => rewritten.push(operation),
        }
    }
    (rewritten, removed)
}
