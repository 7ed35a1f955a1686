//! Content-stream interpretation: PDF operators → page primitives.
//!
//! The splitter hands each page's decoded content stream to [`interpret`],
//! which walks the operators once while tracking the graphics state (CTM
//! stack) and the text state (text matrix, font size, spacing). It records
//! three kinds of primitive:
//!
//! * [`GlyphRun`]: one `Tj`/`TJ`/`'`/`"` string with its estimated box.
//! * [`ImagePlacement`]: one image XObject drawn with `Do`. The stream is
//!   shared, never decoded to pixels here.
//! * [`RulingLine`]: horizontal/vertical strokes and thin filled rectangles,
//!   the usual skeleton of a ruled table.
//!
//! Glyph widths are not read from font programs; every glyph is assumed to
//! advance half an em. That is accurate enough for line grouping and
//! reading order, which is all downstream stages need.

use crate::geometry::BoundingBox;
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, Stream};
use std::sync::Arc;
use tracing::{debug, warn};

/// Average glyph advance as a fraction of the font size.
const GLYPH_ADVANCE_EM: f32 = 0.5;
/// Descender depth below the baseline, as a fraction of the font size.
const DESCENT_EM: f32 = 0.2;
/// Ascender height above the baseline, as a fraction of the font size.
const ASCENT_EM: f32 = 0.8;
/// Form XObjects nested deeper than this are ignored.
const MAX_FORM_DEPTH: usize = 8;
/// Strokes thinner than this (points) along one axis count as rulings.
const RULING_TOLERANCE: f32 = 2.0;

/// A 2-D affine transform `[a b c d e f]` in PDF order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix([f32; 6]);

impl Matrix {
    pub const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    pub fn new(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Matrix([a, b, c, d, e, f])
    }

    pub fn translation(tx: f32, ty: f32) -> Self {
        Matrix([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    /// `self × other`: apply `self` first, then `other`.
    pub fn then(&self, other: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [a2, b2, c2, d2, e2, f2] = other.0;
        Matrix([
            a * a2 + b * c2,
            a * b2 + b * d2,
            c * a2 + d * c2,
            c * b2 + d * d2,
            e * a2 + f * c2 + e2,
            e * b2 + f * d2 + f2,
        ])
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + c * y + e, b * x + d * y + f)
    }

    /// Length of the transformed unit y-vector: the vertical scale.
    pub fn vertical_scale(&self) -> f32 {
        let [_, _, c, d, _, _] = self.0;
        (c * c + d * d).sqrt()
    }
}

/// Maps PDF user space onto the page's top-left coordinate system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageFrame {
    /// MediaBox lower-left x.
    pub x0: f32,
    /// MediaBox upper y.
    pub y1: f32,
}

impl PageFrame {
    fn to_page(self, x: f32, y: f32) -> (f32, f32) {
        (x - self.x0, self.y1 - y)
    }

    fn rect(self, points: &[(f32, f32)]) -> BoundingBox {
        let mut xs = points.iter().map(|p| self.to_page(p.0, p.1));
        let first = xs.next().unwrap_or((0.0, 0.0));
        let (mut l, mut t, mut r, mut b) = (first.0, first.1, first.0, first.1);
        for (x, y) in xs {
            l = l.min(x);
            r = r.max(x);
            t = t.min(y);
            b = b.max(y);
        }
        BoundingBox::new(l, t, r, b)
    }
}

/// A shown string with its estimated extent.
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphRun {
    pub text: String,
    pub bbox: BoundingBox,
    /// Effective font size after text and graphics scaling, in points.
    pub font_size: f32,
    /// Baseline y in page coordinates (top-left origin).
    pub baseline: f32,
}

/// Compression of an image XObject stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageFilter {
    /// JPEG data (`DCTDecode`).
    Dct,
    /// zlib data (`FlateDecode`).
    Flate,
    /// Uncompressed samples.
    Raw,
    /// A filter this crate does not decode (JBIG2, CCITT, JPX, …).
    Other(String),
}

/// An image XObject drawn on the page.
#[derive(Debug, Clone)]
pub struct ImagePlacement {
    /// Resource name (e.g. `Im0`).
    pub name: String,
    pub bbox: BoundingBox,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// Colour components per sample (1 gray, 3 RGB, 4 CMYK).
    pub components: u8,
    pub bits_per_component: u8,
    pub filter: ImageFilter,
    /// Stencil mask: no content of its own.
    pub is_mask: bool,
    stream: Arc<Stream>,
}

impl ImagePlacement {
    /// Raw (still encoded) stream bytes.
    pub fn encoded_bytes(&self) -> &[u8] {
        &self.stream.content
    }

    /// Sample bytes after undoing `FlateDecode`; raw bytes for unfiltered
    /// streams. `None` for filters lopdf cannot undo.
    pub fn decoded_samples(&self) -> Option<Vec<u8>> {
        match self.filter {
            ImageFilter::Raw => Some(self.stream.content.clone()),
            ImageFilter::Flate => self.stream.decompressed_content().ok(),
            ImageFilter::Dct | ImageFilter::Other(_) => None,
        }
    }
}

/// Orientation of a ruling line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// A horizontal or vertical line segment, in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RulingLine {
    pub orientation: Orientation,
    /// y for horizontal lines, x for vertical ones.
    pub position: f32,
    /// Lower end along the line's own axis.
    pub start: f32,
    /// Upper end along the line's own axis.
    pub end: f32,
}

impl RulingLine {
    pub fn length(&self) -> f32 {
        self.end - self.start
    }
}

/// Everything [`interpret`] found on a page.
#[derive(Debug, Clone, Default)]
pub struct PagePrimitives {
    pub glyph_runs: Vec<GlyphRun>,
    pub images: Vec<ImagePlacement>,
    pub rulings: Vec<RulingLine>,
    /// Number of text-showing operators seen, including empty strings.
    pub text_operators: usize,
}

/// Walk `content` and collect primitives.
///
/// Operator errors are never fatal: an operator with the wrong operand types
/// is skipped, mirroring how viewers render damaged pages.
pub fn interpret(
    doc: &Document,
    resources: Option<&Dictionary>,
    content: &[u8],
    frame: PageFrame,
) -> PagePrimitives {
    let mut out = PagePrimitives::default();
    let mut interp = Interpreter {
        doc,
        frame,
        out: &mut out,
    };
    interp.run(resources, content, Matrix::IDENTITY, 0);
    out
}

struct Interpreter<'a> {
    doc: &'a Document,
    frame: PageFrame,
    out: &'a mut PagePrimitives,
}

#[derive(Debug, Clone, Copy)]
struct TextState {
    tm: Matrix,
    tlm: Matrix,
    font_size: f32,
    leading: f32,
    char_spacing: f32,
    word_spacing: f32,
    h_scale: f32,
    rise: f32,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            tm: Matrix::IDENTITY,
            tlm: Matrix::IDENTITY,
            font_size: 12.0,
            leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            h_scale: 1.0,
            rise: 0.0,
        }
    }
}

impl<'a> Interpreter<'a> {
    fn run(&mut self, resources: Option<&Dictionary>, content: &[u8], base: Matrix, depth: usize) {
        let ops = match Content::decode(content) {
            Ok(c) => c.operations,
            Err(e) => {
                warn!("Undecodable content stream (depth {}): {}", depth, e);
                return;
            }
        };

        let mut ctm = base;
        let mut stack: Vec<Matrix> = Vec::new();
        let mut ts = TextState::default();
        let mut path: Vec<Vec<(f32, f32)>> = Vec::new();
        let mut rects: Vec<[(f32, f32); 4]> = Vec::new();

        for op in &ops {
            let nums = numbers(&op.operands);
            match op.operator.as_str() {
                "q" => stack.push(ctm),
                "Q" => ctm = stack.pop().unwrap_or(base),
                "cm" if nums.len() == 6 => {
                    let m = Matrix::new(nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]);
                    ctm = m.then(&ctm);
                }
                "BT" => {
                    ts.tm = Matrix::IDENTITY;
                    ts.tlm = Matrix::IDENTITY;
                }
                "Tf" => {
                    if let Some(size) = op.operands.get(1).and_then(number) {
                        ts.font_size = size;
                    }
                }
                "TL" if !nums.is_empty() => ts.leading = nums[0],
                "Tc" if !nums.is_empty() => ts.char_spacing = nums[0],
                "Tw" if !nums.is_empty() => ts.word_spacing = nums[0],
                "Tz" if !nums.is_empty() => ts.h_scale = nums[0] / 100.0,
                "Ts" if !nums.is_empty() => ts.rise = nums[0],
                "Td" if nums.len() == 2 => {
                    ts.tlm = Matrix::translation(nums[0], nums[1]).then(&ts.tlm);
                    ts.tm = ts.tlm;
                }
                "TD" if nums.len() == 2 => {
                    ts.leading = -nums[1];
                    ts.tlm = Matrix::translation(nums[0], nums[1]).then(&ts.tlm);
                    ts.tm = ts.tlm;
                }
                "Tm" if nums.len() == 6 => {
                    ts.tlm = Matrix::new(nums[0], nums[1], nums[2], nums[3], nums[4], nums[5]);
                    ts.tm = ts.tlm;
                }
                "T*" => next_line(&mut ts),
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = op.operands.first() {
                        self.show(&mut ts, &ctm, &[TjPart::Text(bytes)]);
                    }
                }
                "'" => {
                    next_line(&mut ts);
                    if let Some(Object::String(bytes, _)) = op.operands.first() {
                        self.show(&mut ts, &ctm, &[TjPart::Text(bytes)]);
                    }
                }
                "\"" => {
                    if nums.len() >= 2 {
                        ts.word_spacing = nums[0];
                        ts.char_spacing = nums[1];
                    }
                    next_line(&mut ts);
                    if let Some(Object::String(bytes, _)) = op.operands.get(2) {
                        self.show(&mut ts, &ctm, &[TjPart::Text(bytes)]);
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = op.operands.first() {
                        let parts: Vec<TjPart<'_>> = items
                            .iter()
                            .filter_map(|o| match o {
                                Object::String(b, _) => Some(TjPart::Text(b)),
                                other => number(other).map(TjPart::Adjust),
                            })
                            .collect();
                        self.show(&mut ts, &ctm, &parts);
                    }
                }
                "m" if nums.len() == 2 => path.push(vec![ctm.apply(nums[0], nums[1])]),
                "l" if nums.len() == 2 => {
                    let p = ctm.apply(nums[0], nums[1]);
                    match path.last_mut() {
                        Some(sub) => sub.push(p),
                        None => path.push(vec![p]),
                    }
                }
                "h" => {
                    if let Some(sub) = path.last_mut() {
                        if let Some(&first) = sub.first() {
                            sub.push(first);
                        }
                    }
                }
                "re" if nums.len() == 4 => {
                    let (x, y, w, h) = (nums[0], nums[1], nums[2], nums[3]);
                    rects.push([
                        ctm.apply(x, y),
                        ctm.apply(x + w, y),
                        ctm.apply(x + w, y + h),
                        ctm.apply(x, y + h),
                    ]);
                }
                "S" | "s" => {
                    self.stroke_path(&path);
                    self.stroke_rects(&rects);
                    path.clear();
                    rects.clear();
                }
                "f" | "F" | "f*" => {
                    self.fill_rects(&rects);
                    path.clear();
                    rects.clear();
                }
                "B" | "B*" | "b" | "b*" => {
                    self.stroke_path(&path);
                    self.stroke_rects(&rects);
                    path.clear();
                    rects.clear();
                }
                "n" => {
                    path.clear();
                    rects.clear();
                }
                "Do" => {
                    if let Some(Object::Name(name)) = op.operands.first() {
                        self.draw_xobject(resources, name, &ctm, depth);
                    }
                }
                _ => {}
            }
        }
    }

    fn show(&mut self, ts: &mut TextState, ctm: &Matrix, parts: &[TjPart<'_>]) {
        self.out.text_operators += 1;
        let start = Matrix::translation(0.0, ts.rise).then(&ts.tm).then(ctm);
        let mut text = String::new();
        let mut advance = 0.0f32;

        for part in parts {
            match part {
                TjPart::Text(bytes) => {
                    let decoded = decode_pdf_string(bytes);
                    for ch in decoded.chars() {
                        let mut w = GLYPH_ADVANCE_EM * ts.font_size + ts.char_spacing;
                        if ch == ' ' {
                            w += ts.word_spacing;
                        }
                        advance += w * ts.h_scale;
                    }
                    text.push_str(&decoded);
                }
                TjPart::Adjust(n) => {
                    let shift = -n / 1000.0 * ts.font_size * ts.h_scale;
                    // Large negative kerning is how many producers encode spaces.
                    if shift > ts.font_size * 0.25 && !text.is_empty() && !text.ends_with(' ') {
                        text.push(' ');
                    }
                    advance += shift;
                }
            }
        }

        ts.tm = Matrix::translation(advance, 0.0).then(&ts.tm);

        if text.trim().is_empty() {
            return;
        }

        let size = ts.font_size * start.vertical_scale();
        let corners = [
            start.apply(0.0, -DESCENT_EM * ts.font_size),
            start.apply(advance, -DESCENT_EM * ts.font_size),
            start.apply(advance, ASCENT_EM * ts.font_size),
            start.apply(0.0, ASCENT_EM * ts.font_size),
        ];
        let bbox = self.frame.rect(&corners);
        let (_, baseline) = self.frame.to_page(start.apply(0.0, 0.0).0, start.apply(0.0, 0.0).1);

        self.out.glyph_runs.push(GlyphRun {
            text,
            bbox,
            font_size: size.abs(),
            baseline,
        });
    }

    fn stroke_path(&mut self, path: &[Vec<(f32, f32)>]) {
        for sub in path {
            for pair in sub.windows(2) {
                if let Some(line) = self.ruling_between(pair[0], pair[1]) {
                    self.out.rulings.push(line);
                }
            }
        }
    }

    fn stroke_rects(&mut self, rects: &[[(f32, f32); 4]]) {
        for r in rects {
            for i in 0..4 {
                if let Some(line) = self.ruling_between(r[i], r[(i + 1) % 4]) {
                    self.out.rulings.push(line);
                }
            }
        }
    }

    /// Thin filled rectangles are drawn rules; wide ones are backgrounds.
    fn fill_rects(&mut self, rects: &[[(f32, f32); 4]]) {
        for r in rects {
            let bbox = self.frame.rect(r);
            if bbox.height() <= RULING_TOLERANCE && bbox.width() > RULING_TOLERANCE {
                self.out.rulings.push(RulingLine {
                    orientation: Orientation::Horizontal,
                    position: (bbox.top + bbox.bottom) / 2.0,
                    start: bbox.left,
                    end: bbox.right,
                });
            } else if bbox.width() <= RULING_TOLERANCE && bbox.height() > RULING_TOLERANCE {
                self.out.rulings.push(RulingLine {
                    orientation: Orientation::Vertical,
                    position: (bbox.left + bbox.right) / 2.0,
                    start: bbox.top,
                    end: bbox.bottom,
                });
            }
        }
    }

    fn ruling_between(&self, a: (f32, f32), b: (f32, f32)) -> Option<RulingLine> {
        let (ax, ay) = self.frame.to_page(a.0, a.1);
        let (bx, by) = self.frame.to_page(b.0, b.1);
        if (ay - by).abs() <= RULING_TOLERANCE && (ax - bx).abs() > RULING_TOLERANCE {
            Some(RulingLine {
                orientation: Orientation::Horizontal,
                position: (ay + by) / 2.0,
                start: ax.min(bx),
                end: ax.max(bx),
            })
        } else if (ax - bx).abs() <= RULING_TOLERANCE && (ay - by).abs() > RULING_TOLERANCE {
            Some(RulingLine {
                orientation: Orientation::Vertical,
                position: (ax + bx) / 2.0,
                start: ay.min(by),
                end: ay.max(by),
            })
        } else {
            None
        }
    }

    fn draw_xobject(&mut self, resources: Option<&Dictionary>, name: &[u8], ctm: &Matrix, depth: usize) {
        let Some(stream) = resources
            .and_then(|r| lookup_dict(self.doc, r, b"XObject"))
            .and_then(|xobjects| xobjects.get(name).ok())
            .and_then(|o| resolve(self.doc, o))
            .and_then(|o| match o {
                Object::Stream(s) => Some(s),
                _ => None,
            })
        else {
            debug!("XObject /{} not found in resources", String::from_utf8_lossy(name));
            return;
        };

        match name_of(&stream.dict, b"Subtype") {
            Some(b"Image") => self.place_image(name, stream, ctm),
            Some(b"Form") => {
                if depth >= MAX_FORM_DEPTH {
                    warn!("Form XObject nesting exceeds {}; skipping", MAX_FORM_DEPTH);
                    return;
                }
                let matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(|o| resolve(self.doc, o))
                    .map(|o| match o {
                        Object::Array(a) => numbers(a),
                        _ => Vec::new(),
                    })
                    .filter(|n| n.len() == 6)
                    .map(|n| Matrix::new(n[0], n[1], n[2], n[3], n[4], n[5]))
                    .unwrap_or(Matrix::IDENTITY);
                let form_resources = lookup_dict(self.doc, &stream.dict, b"Resources").or(resources);
                let content = stream_bytes(stream);
                self.run(form_resources, &content, matrix.then(ctm), depth + 1);
            }
            _ => {}
        }
    }

    fn place_image(&mut self, name: &[u8], stream: &Stream, ctm: &Matrix) {
        let dict = &stream.dict;
        let int = |key: &[u8]| {
            dict.get(key)
                .ok()
                .and_then(|o| resolve(self.doc, o))
                .and_then(number)
                .map(|n| n.max(0.0) as u32)
        };
        let is_mask = matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true)));
        let components = if is_mask {
            1
        } else {
            colour_components(self.doc, dict.get(b"ColorSpace").ok())
        };
        let corners = [
            ctm.apply(0.0, 0.0),
            ctm.apply(1.0, 0.0),
            ctm.apply(1.0, 1.0),
            ctm.apply(0.0, 1.0),
        ];

        self.out.images.push(ImagePlacement {
            name: String::from_utf8_lossy(name).into_owned(),
            bbox: self.frame.rect(&corners),
            pixel_width: int(b"Width").unwrap_or(0),
            pixel_height: int(b"Height").unwrap_or(0),
            components,
            bits_per_component: int(b"BitsPerComponent").unwrap_or(8).min(16) as u8,
            filter: image_filter(dict),
            is_mask,
            stream: Arc::new(stream.clone()),
        });
    }
}

enum TjPart<'b> {
    Text(&'b [u8]),
    Adjust(f32),
}

fn next_line(ts: &mut TextState) {
    ts.tlm = Matrix::translation(0.0, -ts.leading).then(&ts.tlm);
    ts.tm = ts.tlm;
}

// ── Object helpers ───────────────────────────────────────────────────────

/// Follow references until a direct object is reached.
pub(crate) fn resolve<'d>(doc: &'d Document, mut obj: &'d Object) -> Option<&'d Object> {
    for _ in 0..16 {
        match obj {
            Object::Reference(id) => obj = doc.get_object(*id).ok()?,
            other => return Some(other),
        }
    }
    None
}

/// Resolve `dict[key]` to a dictionary (direct or referenced).
pub(crate) fn lookup_dict<'d>(doc: &'d Document, dict: &'d Dictionary, key: &[u8]) -> Option<&'d Dictionary> {
    dict.get(key)
        .ok()
        .and_then(|o| resolve(doc, o))
        .and_then(|o| match o {
            Object::Dictionary(d) => Some(d),
            Object::Stream(s) => Some(&s.dict),
            _ => None,
        })
}

pub(crate) fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn numbers(objs: &[Object]) -> Vec<f32> {
    objs.iter().filter_map(number).collect()
}

fn name_of<'d>(dict: &'d Dictionary, key: &[u8]) -> Option<&'d [u8]> {
    match dict.get(key) {
        Ok(Object::Name(n)) => Some(n.as_slice()),
        _ => None,
    }
}

/// Stream content with filters undone when lopdf can undo them.
pub(crate) fn stream_bytes(stream: &Stream) -> Vec<u8> {
    if stream.dict.get(b"Filter").is_ok() {
        stream
            .decompressed_content()
            .unwrap_or_else(|_| stream.content.clone())
    } else {
        stream.content.clone()
    }
}

fn image_filter(dict: &Dictionary) -> ImageFilter {
    let name = match dict.get(b"Filter") {
        Ok(Object::Name(n)) => Some(n.clone()),
        // Filter chains: the last filter is the one closest to the samples.
        Ok(Object::Array(a)) => a.iter().rev().find_map(|o| match o {
            Object::Name(n) => Some(n.clone()),
            _ => None,
        }),
        _ => None,
    };
    match name.as_deref() {
        None => ImageFilter::Raw,
        Some(b"DCTDecode") | Some(b"DCT") => ImageFilter::Dct,
        Some(b"FlateDecode") | Some(b"Fl") => ImageFilter::Flate,
        Some(other) => ImageFilter::Other(String::from_utf8_lossy(other).into_owned()),
    }
}

fn colour_components(doc: &Document, cs: Option<&Object>) -> u8 {
    let Some(cs) = cs.and_then(|o| resolve(doc, o)) else {
        return 3;
    };
    match cs {
        Object::Name(n) => match n.as_slice() {
            b"DeviceGray" | b"G" | b"CalGray" => 1,
            b"DeviceCMYK" | b"CMYK" => 4,
            _ => 3,
        },
        Object::Array(a) => match a.first() {
            Some(Object::Name(n)) if n == b"Indexed" || n == b"I" => 1,
            Some(Object::Name(n)) if n == b"ICCBased" => a
                .get(1)
                .and_then(|o| resolve(doc, o))
                .and_then(|o| match o {
                    Object::Stream(s) => s.dict.get(b"N").ok().and_then(number),
                    _ => None,
                })
                .map(|n| n as u8)
                .unwrap_or(3),
            Some(Object::Name(n)) if n == b"CalGray" => 1,
            _ => 3,
        },
        _ => 3,
    }
}

/// Decode a PDF string: UTF-16BE when it carries a BOM, Latin-1 otherwise.
/// Control characters other than tab become U+FFFD so callers can measure
/// how much of a run was actually decodable.
pub fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes
        .iter()
        .map(|&b| match b {
            b'\t' => ' ',
            0x00..=0x1F | 0x7F => '\u{FFFD}',
            other => other as char,
        })
        .collect()
}
