//! Item rasterization: images/video frames, shapes and text drawn through
//! `vello_cpu` onto pooled surfaces. All outputs are premultiplied RGBA8.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use kurbo::Shape as _;

use crate::{
    blur::gaussian_blur_rgba8_premul,
    composite::{destination_in_alpha, destination_out_alpha, over_in_place},
    core::{Affine, BezPath, parse_hex_rgba},
    error::{MontageError, MontageResult},
    keyframe::AnimatedTransform,
    media::{DecodedFrame, FontProvider},
    model::{ShapeItem, ShapeType, TextAlign, TextItem, VerticalAlign},
    surface::{Surface, SurfacePool},
};

/// Canvas-space affine of an item box: rotate about the box center, then place
/// the local origin at the box's top-left.
pub fn item_affine(tr: &AnimatedTransform) -> Affine {
    Affine::translate((tr.x, tr.y))
        * Affine::rotate(tr.rotation_deg.to_radians())
        * Affine::translate((-tr.width / 2.0, -tr.height / 2.0))
}

/// Shape outline in local box coordinates.
pub fn shape_path(shape_type: ShapeType, w: f64, h: f64, corner_radius: f64) -> BezPath {
    match shape_type {
        ShapeType::Rectangle => {
            if corner_radius > 0.0 {
                let radius = corner_radius.min(w / 2.0).min(h / 2.0);
                kurbo::RoundedRect::new(0.0, 0.0, w, h, radius).to_path(0.1)
            } else {
                kurbo::Rect::new(0.0, 0.0, w, h).to_path(0.1)
            }
        }
        ShapeType::Ellipse => {
            kurbo::Ellipse::new((w / 2.0, h / 2.0), (w / 2.0, h / 2.0), 0.0).to_path(0.1)
        }
        ShapeType::Triangle => {
            let mut p = BezPath::new();
            p.move_to((w / 2.0, 0.0));
            p.line_to((w, h));
            p.line_to((0.0, h));
            p.close_path();
            p
        }
        ShapeType::Star => {
            let cx = w / 2.0;
            let cy = h / 2.0;
            let outer = (w.min(h)) / 2.0;
            let inner = outer * 0.4;
            let mut p = BezPath::new();
            for i in 0..10 {
                let angle = std::f64::consts::PI * (i as f64) / 5.0 - std::f64::consts::FRAC_PI_2;
                let r = if i % 2 == 0 { outer } else { inner };
                let pt = (cx + r * angle.cos(), cy + r * angle.sin());
                if i == 0 {
                    p.move_to(pt);
                } else {
                    p.line_to(pt);
                }
            }
            p.close_path();
            p
        }
        ShapeType::Line => {
            // A line item is a horizontal bar through the box middle; its
            // thickness comes from the stroke width at draw time.
            kurbo::Rect::new(0.0, h / 2.0 - 1.0, w, h / 2.0 + 1.0).to_path(0.1)
        }
    }
}

/// Rounded-rect (or plain) stencil of the item box, used to crop cover-scaled
/// media and apply corner radius.
pub fn box_stencil_path(tr: &AnimatedTransform) -> BezPath {
    if tr.corner_radius > 0.0 {
        let radius = tr
            .corner_radius
            .min(tr.width / 2.0)
            .min(tr.height / 2.0);
        kurbo::RoundedRect::new(0.0, 0.0, tr.width, tr.height, radius).to_path(0.1)
    } else {
        kurbo::Rect::new(0.0, 0.0, tr.width, tr.height).to_path(0.1)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TextBrush {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// Stateful helper building Parley layouts from provider-resolved font bytes.
struct TextLayoutEngine {
    font_ctx: parley::FontContext,
    layout_ctx: parley::LayoutContext<TextBrush>,
    registered: HashMap<(String, u16), String>,
}

impl TextLayoutEngine {
    fn new() -> Self {
        Self {
            font_ctx: parley::FontContext::default(),
            layout_ctx: parley::LayoutContext::new(),
            registered: HashMap::new(),
        }
    }

    fn family_for(
        &mut self,
        family: &str,
        weight: u16,
        font_bytes: &Arc<Vec<u8>>,
    ) -> MontageResult<String> {
        let key = (family.to_string(), weight);
        if let Some(name) = self.registered.get(&key) {
            return Ok(name.clone());
        }
        let families = self
            .font_ctx
            .collection
            .register_fonts(parley::fontique::Blob::from(font_bytes.as_ref().clone()), None);
        let family_id = families
            .first()
            .map(|(id, _)| *id)
            .ok_or_else(|| MontageError::media("no font families registered from font bytes"))?;
        let name = self
            .font_ctx
            .collection
            .family_name(family_id)
            .ok_or_else(|| MontageError::media("registered font family has no name"))?
            .to_string();
        self.registered.insert(key, name.clone());
        Ok(name)
    }

    fn layout_line(
        &mut self,
        text: &str,
        family_name: &str,
        size_px: f32,
        letter_spacing: f32,
        brush: TextBrush,
    ) -> parley::Layout<TextBrush> {
        let mut builder = self
            .layout_ctx
            .ranged_builder(&mut self.font_ctx, text, 1.0, true);
        builder.push_default(parley::style::StyleProperty::FontStack(
            parley::style::FontStack::Source(std::borrow::Cow::Owned(family_name.to_string())),
        ));
        builder.push_default(parley::style::StyleProperty::FontSize(size_px));
        builder.push_default(parley::style::StyleProperty::LetterSpacing(letter_spacing));
        builder.push_default(parley::style::StyleProperty::Brush(brush));

        let mut layout: parley::Layout<TextBrush> = builder.build(text);
        layout.break_all_lines(None);
        layout
    }
}

/// LRU memo for text width measurement, keyed by font, size, spacing and
/// content.
struct MeasureCache {
    map: HashMap<String, f64>,
    order: VecDeque<String>,
    capacity: usize,
}

impl MeasureCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<f64> {
        let hit = self.map.get(key).copied();
        if hit.is_some() {
            self.touch(key);
        }
        hit
    }

    fn insert(&mut self, key: String, width: f64) {
        self.map.insert(key.clone(), width);
        self.touch(&key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/// One rasterizer per render task. Owns the vello context, the Parley engine
/// and the text measure cache.
pub struct Raster {
    ctx: Option<vello_cpu::RenderContext>,
    text: TextLayoutEngine,
    measure: MeasureCache,
    font_data: HashMap<(String, u16), vello_cpu::peniko::FontData>,
}

impl Default for Raster {
    fn default() -> Self {
        Self::new()
    }
}

impl Raster {
    const MEASURE_CACHE_CAP: usize = 1000;

    pub fn new() -> Self {
        Self {
            ctx: None,
            text: TextLayoutEngine::new(),
            measure: MeasureCache::new(Self::MEASURE_CACHE_CAP),
            font_data: HashMap::new(),
        }
    }

    fn with_ctx<R>(
        &mut self,
        width: u16,
        height: u16,
        f: impl FnOnce(&mut Self, &mut vello_cpu::RenderContext) -> MontageResult<R>,
    ) -> MontageResult<R> {
        let mut ctx = match self.ctx.take() {
            None => vello_cpu::RenderContext::new(width, height),
            Some(ctx) if ctx.width() == width && ctx.height() == height => ctx,
            Some(_) => vello_cpu::RenderContext::new(width, height),
        };
        ctx.reset();
        let out = f(self, &mut ctx)?;
        self.ctx = Some(ctx);
        Ok(out)
    }

    /// Fill `path` under `transform` with a straight RGBA color. `dst` must
    /// come in cleared; the scene renders over its existing content.
    pub fn fill_path(
        &mut self,
        dst: &mut Surface,
        path: &BezPath,
        transform: Affine,
        rgba: [u8; 4],
    ) -> MontageResult<()> {
        let (w, h) = (dst.width() as u16, dst.height() as u16);
        self.with_ctx(w, h, |_, ctx| {
            ctx.set_transform(affine_to_cpu(transform));
            ctx.set_paint(vello_cpu::peniko::Color::from_rgba8(
                rgba[0], rgba[1], rgba[2], rgba[3],
            ));
            ctx.fill_path(&bezpath_to_cpu(path));
            ctx.flush();
            ctx.render_to_pixmap(dst.pixmap_mut());
            Ok(())
        })
    }

    /// Draw a decoded frame into the item box with cover scaling, cropped to
    /// the (possibly rounded) box.
    pub fn draw_frame(
        &mut self,
        dst: &mut Surface,
        frame: &DecodedFrame,
        tr: &AnimatedTransform,
        pool: &mut SurfacePool,
    ) -> MontageResult<()> {
        if tr.width <= 0.0 || tr.height <= 0.0 || frame.width == 0 || frame.height == 0 {
            return Ok(());
        }

        let image = image_paint(frame)?;
        let nat_w = f64::from(frame.width);
        let nat_h = f64::from(frame.height);
        let scale = (tr.width / nat_w).max(tr.height / nat_h);
        let cover = Affine::translate((
            (tr.width - nat_w * scale) / 2.0,
            (tr.height - nat_h * scale) / 2.0,
        )) * Affine::scale(scale);
        let transform = item_affine(tr) * cover;

        let (w, h) = (dst.width() as u16, dst.height() as u16);
        self.with_ctx(w, h, |_, ctx| {
            ctx.set_transform(affine_to_cpu(transform));
            ctx.set_paint(image);
            ctx.fill_rect(&vello_cpu::kurbo::Rect::new(0.0, 0.0, nat_w, nat_h));
            ctx.flush();
            ctx.render_to_pixmap(dst.pixmap_mut());
            Ok(())
        })?;

        // Crop the cover spill (and round corners) with a box stencil.
        let needs_crop = scale * nat_w > tr.width + 0.5
            || scale * nat_h > tr.height + 0.5
            || tr.corner_radius > 0.0;
        if needs_crop {
            let mut stencil = pool.acquire()?;
            self.fill_path(
                &mut stencil,
                &box_stencil_path(tr),
                item_affine(tr),
                [255, 255, 255, 255],
            )?;
            destination_in_alpha(dst.data_mut(), stencil.data(), false)?;
            pool.release(stencil);
        }
        Ok(())
    }

    /// Fill (and optionally stroke) a shape into the item box.
    pub fn draw_shape(
        &mut self,
        dst: &mut Surface,
        shape: &ShapeItem,
        tr: &AnimatedTransform,
        pool: &mut SurfacePool,
    ) -> MontageResult<()> {
        if tr.width <= 0.0 || tr.height <= 0.0 {
            return Ok(());
        }

        let transform = item_affine(tr);
        let fill = parse_hex_rgba(&shape.fill_color)?;
        let path = shape_path(shape.shape_type, tr.width, tr.height, tr.corner_radius);
        self.fill_path(dst, &path, transform, fill)?;

        let stroke_width = shape.stroke_width;
        if stroke_width > 0.0
            && let Some(stroke_color) = &shape.stroke_color
        {
            let stroke = parse_hex_rgba(stroke_color)?;
            let mut ring = pool.acquire()?;
            self.fill_path(&mut ring, &path, transform, stroke)?;

            // Carve the interior out of the stroke ring.
            let inner_w = (tr.width - 2.0 * stroke_width).max(0.0);
            let inner_h = (tr.height - 2.0 * stroke_width).max(0.0);
            if inner_w > 0.0 && inner_h > 0.0 {
                let inner_radius = (tr.corner_radius - stroke_width).max(0.0);
                let inner = shape_path(shape.shape_type, inner_w, inner_h, inner_radius);
                let mut hole = pool.acquire()?;
                self.fill_path(
                    &mut hole,
                    &inner,
                    transform * Affine::translate((stroke_width, stroke_width)),
                    [255, 255, 255, 255],
                )?;
                destination_out_alpha(ring.data_mut(), hole.data())?;
                pool.release(hole);
            }

            over_in_place(dst.data_mut(), ring.data(), 1.0)?;
            pool.release(ring);
        }
        Ok(())
    }

    /// Measure one line of text (memoized).
    pub fn measure_text(
        &mut self,
        line: &str,
        family: &str,
        weight: u16,
        size_px: f32,
        letter_spacing: f32,
        font_bytes: &Arc<Vec<u8>>,
    ) -> MontageResult<f64> {
        let key =
            format!("{family}|{weight}|{size_px}|{letter_spacing}|{line}");
        if let Some(w) = self.measure.get(&key) {
            return Ok(w);
        }
        let family_name = self.text.family_for(family, weight, font_bytes)?;
        let layout = self.text.layout_line(
            line,
            &family_name,
            size_px,
            letter_spacing,
            TextBrush::default(),
        );
        let width = f64::from(layout.width());
        self.measure.insert(key, width);
        Ok(width)
    }

    /// Render a text item (shadow, stroke ring, fill) into the item box.
    pub fn draw_text(
        &mut self,
        dst: &mut Surface,
        text: &TextItem,
        tr: &AnimatedTransform,
        fonts: &dyn FontProvider,
        pool: &mut SurfacePool,
    ) -> MontageResult<()> {
        if tr.width <= 0.0 || tr.height <= 0.0 || text.text.is_empty() {
            return Ok(());
        }

        let font_bytes = fonts.font_bytes(&text.font_family, text.font_weight)?;
        let color = parse_hex_rgba(&text.color)?;

        if let Some(shadow) = &text.text_shadow {
            let shadow_color = parse_hex_rgba(&shadow.color)?;
            let mut layer = pool.acquire()?;
            self.draw_text_pass(
                &mut layer,
                text,
                tr,
                &font_bytes,
                shadow_color,
                (shadow.offset_x, shadow.offset_y),
            )?;
            if shadow.blur > 0.0 {
                let (w, h) = (layer.width(), layer.height());
                gaussian_blur_rgba8_premul(layer.data_mut(), w, h, (shadow.blur / 2.0) as f32)?;
            }
            over_in_place(dst.data_mut(), layer.data(), 1.0)?;
            pool.release(layer);
        }

        if let Some(stroke) = &text.stroke
            && stroke.width > 0.0
        {
            // Poor-man's outline: fill passes offset around a ring.
            let stroke_color = parse_hex_rgba(&stroke.color)?;
            let mut layer = pool.acquire()?;
            let r = stroke.width;
            for (dx, dy) in [
                (r, 0.0),
                (-r, 0.0),
                (0.0, r),
                (0.0, -r),
                (r * 0.7071, r * 0.7071),
                (-r * 0.7071, r * 0.7071),
                (r * 0.7071, -r * 0.7071),
                (-r * 0.7071, -r * 0.7071),
            ] {
                let mut pass = pool.acquire()?;
                self.draw_text_pass(&mut pass, text, tr, &font_bytes, stroke_color, (dx, dy))?;
                over_in_place(layer.data_mut(), pass.data(), 1.0)?;
                pool.release(pass);
            }
            over_in_place(dst.data_mut(), layer.data(), 1.0)?;
            pool.release(layer);
        }

        let mut fill = pool.acquire()?;
        self.draw_text_pass(&mut fill, text, tr, &font_bytes, color, (0.0, 0.0))?;
        over_in_place(dst.data_mut(), fill.data(), 1.0)?;
        pool.release(fill);
        Ok(())
    }

    fn draw_text_pass(
        &mut self,
        dst: &mut Surface,
        text: &TextItem,
        tr: &AnimatedTransform,
        font_bytes: &Arc<Vec<u8>>,
        rgba: [u8; 4],
        offset: (f64, f64),
    ) -> MontageResult<()> {
        let family_name = self
            .text
            .family_for(&text.font_family, text.font_weight, font_bytes)?;
        let font = self.font_data_for(&text.font_family, text.font_weight, font_bytes);

        let size_px = text.font_size as f32;
        let line_advance = text.font_size * text.line_height.max(0.1);
        let lines: Vec<&str> = text.text.split('\n').collect();
        let block_height = line_advance * lines.len() as f64;

        let block_top = match text.vertical_align {
            VerticalAlign::Top => 0.0,
            VerticalAlign::Middle => (tr.height - block_height) / 2.0,
            VerticalAlign::Bottom => tr.height - block_height,
        };

        let brush = TextBrush {
            r: rgba[0],
            g: rgba[1],
            b: rgba[2],
            a: rgba[3],
        };

        let mut line_widths = Vec::with_capacity(lines.len());
        for line in &lines {
            line_widths.push(self.measure_text(
                line,
                &text.font_family,
                text.font_weight,
                size_px,
                text.letter_spacing as f32,
                font_bytes,
            )?);
        }

        let mut layouts = Vec::with_capacity(lines.len());
        for line in &lines {
            layouts.push(self.text.layout_line(
                line,
                &family_name,
                size_px,
                text.letter_spacing as f32,
                brush,
            ));
        }

        let (w, h) = (dst.width() as u16, dst.height() as u16);
        self.with_ctx(w, h, |_, ctx| {
            for (i, layout) in layouts.iter().enumerate() {
                let line_width = line_widths[i];
                let line_x = match text.text_align {
                    TextAlign::Left => 0.0,
                    TextAlign::Center => (tr.width - line_width) / 2.0,
                    TextAlign::Right => tr.width - line_width,
                };
                let line_y =
                    block_top + line_advance * i as f64 + (line_advance - f64::from(layout.height())) / 2.0;
                let transform = item_affine(tr)
                    * Affine::translate((line_x + offset.0, line_y + offset.1));
                ctx.set_transform(affine_to_cpu(transform));

                for line in layout.lines() {
                    for item in line.items() {
                        let parley::layout::PositionedLayoutItem::GlyphRun(run) = item else {
                            continue;
                        };
                        let b = run.style().brush;
                        ctx.set_paint(vello_cpu::peniko::Color::from_rgba8(b.r, b.g, b.b, b.a));
                        let glyphs = run.glyphs().map(|g| vello_cpu::Glyph {
                            id: g.id,
                            x: g.x,
                            y: g.y,
                        });
                        ctx.glyph_run(&font)
                            .font_size(run.run().font_size())
                            .fill_glyphs(glyphs);
                    }
                }
            }
            ctx.flush();
            ctx.render_to_pixmap(dst.pixmap_mut());
            Ok(())
        })
    }

    fn font_data_for(
        &mut self,
        family: &str,
        weight: u16,
        font_bytes: &Arc<Vec<u8>>,
    ) -> vello_cpu::peniko::FontData {
        let key = (family.to_string(), weight);
        if let Some(font) = self.font_data.get(&key) {
            return font.clone();
        }
        let font = vello_cpu::peniko::FontData::new(
            vello_cpu::peniko::Blob::from(font_bytes.as_ref().clone()),
            0,
        );
        self.font_data.insert(key, font.clone());
        font
    }
}

pub(crate) fn affine_to_cpu(a: Affine) -> vello_cpu::kurbo::Affine {
    vello_cpu::kurbo::Affine::new(a.as_coeffs())
}

pub(crate) fn bezpath_to_cpu(path: &BezPath) -> vello_cpu::kurbo::BezPath {
    use kurbo::PathEl;

    let mut out = vello_cpu::kurbo::BezPath::new();
    for &el in path.elements() {
        match el {
            PathEl::MoveTo(p) => out.move_to(vello_cpu::kurbo::Point::new(p.x, p.y)),
            PathEl::LineTo(p) => out.line_to(vello_cpu::kurbo::Point::new(p.x, p.y)),
            PathEl::QuadTo(p1, p2) => out.quad_to(
                vello_cpu::kurbo::Point::new(p1.x, p1.y),
                vello_cpu::kurbo::Point::new(p2.x, p2.y),
            ),
            PathEl::CurveTo(p1, p2, p3) => out.curve_to(
                vello_cpu::kurbo::Point::new(p1.x, p1.y),
                vello_cpu::kurbo::Point::new(p2.x, p2.y),
                vello_cpu::kurbo::Point::new(p3.x, p3.y),
            ),
            PathEl::ClosePath => out.close_path(),
        }
    }
    out
}

fn image_paint(frame: &DecodedFrame) -> MontageResult<vello_cpu::Image> {
    let w: u16 = frame
        .width
        .try_into()
        .map_err(|_| MontageError::evaluation("frame width exceeds u16"))?;
    let h: u16 = frame
        .height
        .try_into()
        .map_err(|_| MontageError::evaluation("frame height exceeds u16"))?;
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.rgba8_premul.len() != expected {
        return Err(MontageError::evaluation("frame byte length mismatch"));
    }

    let mut pixels = Vec::<vello_cpu::peniko::color::PremulRgba8>::with_capacity(
        frame.width as usize * frame.height as usize,
    );
    for px in frame.rgba8_premul.chunks_exact(4) {
        pixels.push(vello_cpu::peniko::color::PremulRgba8::from_u8_array([
            px[0], px[1], px[2], px[3],
        ]));
    }
    let pixmap = vello_cpu::Pixmap::from_parts_with_opacity(pixels, w, h, true);
    Ok(vello_cpu::Image {
        image: vello_cpu::ImageSource::Pixmap(Arc::new(pixmap)),
        sampler: vello_cpu::peniko::ImageSampler::default(),
    })
}
