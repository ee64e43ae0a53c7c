//! Item effects: CSS-like color filters, glitch family, halftone and
//! vignette. All passes operate on premultiplied RGBA8 surfaces.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    blur::gaussian_blur_rgba8_premul,
    composite::{mix_weighted, over},
    core::parse_hex_rgba,
    error::{MontageError, MontageResult},
    model::EffectInstance,
    surface::{Surface, SurfacePool},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterKind {
    Brightness,
    Contrast,
    Saturate,
    Blur,
    HueRotate,
    Grayscale,
    Sepia,
    Invert,
}

impl FilterKind {
    /// Value at which the filter is a no-op.
    pub fn noop_value(self) -> f64 {
        match self {
            Self::Brightness | Self::Contrast | Self::Saturate => 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalftonePattern {
    Dots,
    Lines,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HalftoneParams {
    pub pattern: HalftonePattern,
    pub dot_size: f64,
    pub spacing: f64,
    pub angle_deg: f64,
    pub intensity: f64,
    pub softness: f64,
    pub blend_mode: BlendMode,
    pub inverted: bool,
    pub dot_color: [u8; 4],
}

#[derive(Clone, Debug, PartialEq)]
pub struct VignetteParams {
    pub size: f64,
    pub softness: f64,
    pub intensity: f64,
    pub color: [u8; 4],
    pub elliptical: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Filter { kind: FilterKind, value: f64 },
    RgbSplit { intensity: f64, seed: u64, speed: f64 },
    Scanlines { intensity: f64 },
    ColorGlitch { intensity: f64, seed: u64, speed: f64 },
    Halftone(HalftoneParams),
    Vignette(VignetteParams),
}

/// A parsed, enabled effect with its output opacity.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedEffect {
    pub effect: Effect,
    pub opacity: f64,
}

impl ResolvedEffect {
    /// Conservative check used by occlusion culling: can this effect punch
    /// holes into (or spread past) an otherwise opaque item?
    pub fn introduces_transparency(&self) -> bool {
        if self.opacity < 1.0 {
            return true;
        }
        matches!(
            self.effect,
            Effect::RgbSplit { .. }
                | Effect::Scanlines { .. }
                | Effect::ColorGlitch { .. }
                | Effect::Halftone(_)
                | Effect::Vignette(_)
                | Effect::Filter {
                    kind: FilterKind::Blur,
                    ..
                }
        )
    }
}

pub fn parse_effect(inst: &EffectInstance) -> MontageResult<Effect> {
    let kind = inst.kind.trim().to_ascii_lowercase();
    if kind.is_empty() {
        return Err(MontageError::validation("effect kind must be non-empty"));
    }

    let filter = |k: FilterKind| -> MontageResult<Effect> {
        let value = get_f64_or(&inst.params, "value", k.noop_value())?;
        Ok(Effect::Filter { kind: k, value })
    };

    match kind.as_str() {
        "brightness" => filter(FilterKind::Brightness),
        "contrast" => filter(FilterKind::Contrast),
        "saturate" | "saturation" => filter(FilterKind::Saturate),
        "blur" => filter(FilterKind::Blur),
        "hue-rotate" | "hue_rotate" => filter(FilterKind::HueRotate),
        "grayscale" => filter(FilterKind::Grayscale),
        "sepia" => filter(FilterKind::Sepia),
        "invert" => filter(FilterKind::Invert),
        "rgb-split" | "rgb_split" => Ok(Effect::RgbSplit {
            intensity: get_f64_or(&inst.params, "intensity", 0.5)?.clamp(0.0, 1.0),
            seed: get_u64_or(&inst.params, "seed", 0)?,
            speed: get_f64_or(&inst.params, "speed", 1.0)?,
        }),
        "scanlines" => Ok(Effect::Scanlines {
            intensity: get_f64_or(&inst.params, "intensity", 0.5)?.clamp(0.0, 1.0),
        }),
        "color-glitch" | "color_glitch" => Ok(Effect::ColorGlitch {
            intensity: get_f64_or(&inst.params, "intensity", 0.5)?.clamp(0.0, 1.0),
            seed: get_u64_or(&inst.params, "seed", 0)?,
            speed: get_f64_or(&inst.params, "speed", 1.0)?,
        }),
        "halftone" => {
            let pattern = match inst
                .params
                .get("pattern")
                .and_then(|v| v.as_str())
                .unwrap_or("dots")
            {
                "dots" => HalftonePattern::Dots,
                "lines" => HalftonePattern::Lines,
                other @ ("rays" | "ripples") => {
                    warn_halftone_pattern_once(other);
                    HalftonePattern::Dots
                }
                other => {
                    return Err(MontageError::validation(format!(
                        "unknown halftone pattern '{other}'"
                    )));
                }
            };
            let blend_mode = match inst
                .params
                .get("blend_mode")
                .and_then(|v| v.as_str())
                .unwrap_or("normal")
            {
                "normal" => BlendMode::Normal,
                "multiply" => BlendMode::Multiply,
                "screen" => BlendMode::Screen,
                "overlay" => BlendMode::Overlay,
                "darken" => BlendMode::Darken,
                "lighten" => BlendMode::Lighten,
                other => {
                    return Err(MontageError::validation(format!(
                        "unknown halftone blend_mode '{other}'"
                    )));
                }
            };
            Ok(Effect::Halftone(HalftoneParams {
                pattern,
                dot_size: get_f64_or(&inst.params, "dot_size", 4.0)?.max(0.5),
                spacing: get_f64_or(&inst.params, "spacing", 8.0)?.max(1.0),
                angle_deg: get_f64_or(&inst.params, "angle", 0.0)?,
                intensity: get_f64_or(&inst.params, "intensity", 1.0)?.clamp(0.0, 1.0),
                softness: get_f64_or(&inst.params, "softness", 0.0)?.clamp(0.0, 1.0),
                blend_mode,
                inverted: inst
                    .params
                    .get("inverted")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                dot_color: parse_hex_rgba(
                    inst.params
                        .get("dot_color")
                        .and_then(|v| v.as_str())
                        .unwrap_or("#000000"),
                )?,
            }))
        }
        "vignette" => Ok(Effect::Vignette(VignetteParams {
            size: get_f64_or(&inst.params, "size", 0.5)?.clamp(0.0, 1.0),
            softness: get_f64_or(&inst.params, "softness", 0.5)?.clamp(0.0, 1.0),
            intensity: get_f64_or(&inst.params, "intensity", 0.8)?.clamp(0.0, 1.0),
            color: parse_hex_rgba(
                inst.params
                    .get("color")
                    .and_then(|v| v.as_str())
                    .unwrap_or("#000000"),
            )?,
            elliptical: inst
                .params
                .get("elliptical")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })),
        _ => Err(MontageError::validation(format!(
            "unknown effect kind '{kind}'"
        ))),
    }
}

fn warn_halftone_pattern_once(pattern: &str) {
    static WARNED: AtomicBool = AtomicBool::new(false);
    if !WARNED.swap(true, Ordering::Relaxed) {
        tracing::warn!(
            target: "montage::effects",
            "halftone pattern '{pattern}' renders as dots"
        );
    }
}

/// Parse and keep enabled effects in order.
pub fn resolve_effects(list: &[EffectInstance]) -> MontageResult<Vec<ResolvedEffect>> {
    let mut out = Vec::with_capacity(list.len());
    for inst in list {
        if !inst.enabled {
            continue;
        }
        out.push(ResolvedEffect {
            effect: parse_effect(inst)?,
            opacity: inst.opacity.clamp(0.0, 1.0),
        });
    }
    Ok(out)
}

fn get_f64_or(params: &serde_json::Value, key: &str, default: f64) -> MontageResult<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => {
            let n = v.as_f64().ok_or_else(|| {
                MontageError::validation(format!("effect param '{key}' must be a number"))
            })?;
            if !n.is_finite() {
                return Err(MontageError::validation(format!(
                    "effect param '{key}' must be finite"
                )));
            }
            Ok(n)
        }
    }
}

fn get_u64_or(params: &serde_json::Value, key: &str, default: u64) -> MontageResult<u64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            MontageError::validation(format!("effect param '{key}' must be an unsigned integer"))
        }),
    }
}

/// Apply all effects in place at `frame`. Color filters collapse into one
/// matrix (+ optional blur) applied first; the remaining effects run in list
/// order.
pub fn apply_effects(
    surface: &mut Surface,
    pool: &mut SurfacePool,
    effects: &[ResolvedEffect],
    frame: u64,
) -> MontageResult<()> {
    if effects.is_empty() {
        return Ok(());
    }

    let mut matrix = identity_matrix();
    let mut matrix_active = false;
    let mut blur_px = 0.0f64;
    let mut filter_opacity = 1.0f64;
    let mut rest = Vec::new();

    for e in effects {
        match &e.effect {
            Effect::Filter { kind, value } => {
                filter_opacity *= e.opacity;
                match kind {
                    FilterKind::Blur => blur_px += value.max(0.0),
                    _ => {
                        matrix = compose_matrix(&filter_matrix(*kind, *value), &matrix);
                        matrix_active = true;
                    }
                }
            }
            _ => rest.push(e),
        }
    }

    if matrix_active || blur_px > 0.0 {
        let original = if filter_opacity < 1.0 {
            let mut snap = pool.acquire()?;
            snap.copy_from(surface)?;
            Some(snap)
        } else {
            None
        };

        if matrix_active {
            apply_color_matrix(surface.data_mut(), &matrix);
        }
        if blur_px > 0.0 {
            let (w, h) = (surface.width(), surface.height());
            gaussian_blur_rgba8_premul(surface.data_mut(), w, h, (blur_px / 2.0) as f32)?;
        }

        if let Some(snap) = original {
            mix_into(surface, &snap, filter_opacity as f32);
            pool.release(snap);
        }
    }

    for e in rest {
        let original = if e.opacity < 1.0 {
            let mut snap = pool.acquire()?;
            snap.copy_from(surface)?;
            Some(snap)
        } else {
            None
        };

        match &e.effect {
            Effect::RgbSplit {
                intensity,
                seed,
                speed,
            } => apply_rgb_split(surface, pool, *intensity, *seed, *speed, frame)?,
            Effect::Scanlines { intensity } => apply_scanlines(surface, *intensity),
            Effect::ColorGlitch {
                intensity,
                seed,
                speed,
            } => apply_color_glitch(surface, *intensity, *seed, *speed, frame),
            Effect::Halftone(params) => apply_halftone(surface, params),
            Effect::Vignette(params) => apply_vignette(surface, params),
            Effect::Filter { .. } => unreachable!("filters handled above"),
        }

        if let Some(snap) = original {
            mix_into(surface, &snap, e.opacity as f32);
            pool.release(snap);
        }
    }

    Ok(())
}

/// `surface = lerp(original, surface, t)`.
fn mix_into(surface: &mut Surface, original: &Surface, t: f32) {
    let t = t.clamp(0.0, 1.0);
    for (d, o) in surface
        .data_mut()
        .chunks_exact_mut(4)
        .zip(original.data().chunks_exact(4))
    {
        let out = mix_weighted([o[0], o[1], o[2], o[3]], [d[0], d[1], d[2], d[3]], 1.0 - t, t);
        d.copy_from_slice(&out);
    }
}

// --- color matrix -----------------------------------------------------------

type ColorMatrix = [f64; 20];

fn identity_matrix() -> ColorMatrix {
    let mut m = [0.0; 20];
    m[0] = 1.0;
    m[6] = 1.0;
    m[12] = 1.0;
    m[18] = 1.0;
    m
}

/// `a ∘ b`: apply `b` first, then `a`.
fn compose_matrix(a: &ColorMatrix, b: &ColorMatrix) -> ColorMatrix {
    let mut out = [0.0; 20];
    for row in 0..4 {
        for col in 0..5 {
            let mut acc = 0.0;
            for k in 0..4 {
                acc += a[row * 5 + k] * b[k * 5 + col];
            }
            if col == 4 {
                acc += a[row * 5 + 4];
            }
            out[row * 5 + col] = acc;
        }
    }
    out
}

fn filter_matrix(kind: FilterKind, value: f64) -> ColorMatrix {
    const LR: f64 = 0.2126;
    const LG: f64 = 0.7152;
    const LB: f64 = 0.0722;

    let mut m = identity_matrix();
    match kind {
        FilterKind::Brightness => {
            let s = (value / 100.0).max(0.0);
            m[0] = s;
            m[6] = s;
            m[12] = s;
        }
        FilterKind::Contrast => {
            let s = (value / 100.0).max(0.0);
            let off = 0.5 * (1.0 - s);
            m[0] = s;
            m[6] = s;
            m[12] = s;
            m[4] = off;
            m[9] = off;
            m[14] = off;
        }
        FilterKind::Saturate => {
            let s = (value / 100.0).max(0.0);
            m = saturation_matrix(s);
        }
        FilterKind::Grayscale => {
            let g = (value / 100.0).clamp(0.0, 1.0);
            m = saturation_matrix(1.0 - g);
        }
        FilterKind::Sepia => {
            let amount = (value / 100.0).clamp(0.0, 1.0);
            let sepia: [[f64; 3]; 3] = [
                [0.393, 0.769, 0.189],
                [0.349, 0.686, 0.168],
                [0.272, 0.534, 0.131],
            ];
            for row in 0..3 {
                for col in 0..3 {
                    let ident = if row == col { 1.0 } else { 0.0 };
                    m[row * 5 + col] = ident + (sepia[row][col] - ident) * amount;
                }
            }
        }
        FilterKind::Invert => {
            let a = (value / 100.0).clamp(0.0, 1.0);
            for row in 0..3 {
                m[row * 5 + row] = 1.0 - 2.0 * a;
                m[row * 5 + 4] = a;
            }
        }
        FilterKind::HueRotate => {
            let rad = value.to_radians();
            let (cos, sin) = (rad.cos(), rad.sin());
            let rows: [[f64; 3]; 3] = [
                [
                    LR + cos * (1.0 - LR) + sin * (-LR),
                    LG + cos * (-LG) + sin * (-LG),
                    LB + cos * (-LB) + sin * (1.0 - LB),
                ],
                [
                    LR + cos * (-LR) + sin * 0.143,
                    LG + cos * (1.0 - LG) + sin * 0.140,
                    LB + cos * (-LB) + sin * (-0.283),
                ],
                [
                    LR + cos * (-LR) + sin * (-(1.0 - LR)),
                    LG + cos * (-LG) + sin * LG,
                    LB + cos * (1.0 - LB) + sin * LB,
                ],
            ];
            for row in 0..3 {
                for col in 0..3 {
                    m[row * 5 + col] = rows[row][col];
                }
            }
        }
        FilterKind::Blur => {}
    }
    m
}

fn saturation_matrix(s: f64) -> ColorMatrix {
    const LR: f64 = 0.2126;
    const LG: f64 = 0.7152;
    const LB: f64 = 0.0722;

    let mut m = identity_matrix();
    m[0] = LR + (1.0 - LR) * s;
    m[1] = LG * (1.0 - s);
    m[2] = LB * (1.0 - s);
    m[5] = LR * (1.0 - s);
    m[6] = LG + (1.0 - LG) * s;
    m[7] = LB * (1.0 - s);
    m[10] = LR * (1.0 - s);
    m[11] = LG * (1.0 - s);
    m[12] = LB + (1.0 - LB) * s;
    m
}

/// Unpremultiply, run the 4x5 matrix, re-premultiply.
fn apply_color_matrix(buf: &mut [u8], m: &ColorMatrix) {
    for px in buf.chunks_exact_mut(4) {
        let pa = f64::from(px[3]) / 255.0;
        let inv_a = if pa > 0.0 { 1.0 / pa } else { 0.0 };
        let r = f64::from(px[0]) / 255.0 * inv_a;
        let g = f64::from(px[1]) / 255.0 * inv_a;
        let b = f64::from(px[2]) / 255.0 * inv_a;
        let a = pa;

        let nr = (m[0] * r + m[1] * g + m[2] * b + m[3] * a + m[4]).clamp(0.0, 1.0);
        let ng = (m[5] * r + m[6] * g + m[7] * b + m[8] * a + m[9]).clamp(0.0, 1.0);
        let nb = (m[10] * r + m[11] * g + m[12] * b + m[13] * a + m[14]).clamp(0.0, 1.0);
        let na = (m[15] * r + m[16] * g + m[17] * b + m[18] * a + m[19]).clamp(0.0, 1.0);

        px[0] = (nr * na * 255.0).round() as u8;
        px[1] = (ng * na * 255.0).round() as u8;
        px[2] = (nb * na * 255.0).round() as u8;
        px[3] = (na * 255.0).round() as u8;
    }
}

// --- glitch -----------------------------------------------------------------

/// The deterministic per-frame PRNG behind the glitch family.
#[derive(Clone, Copy, Debug)]
struct FrameRng(u32);

impl FrameRng {
    fn for_frame(frame: u64, speed: f64, seed: u64) -> Self {
        let base = ((frame as f64) * speed).floor() as i64;
        Self(((base as u64).wrapping_add(seed) & 0x7fff_ffff) as u32)
    }

    fn next(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(1_103_515_245)
            .wrapping_add(12_345)
            & 0x7fff_ffff;
        f64::from(self.0) / f64::from(0x8000_0000u32)
    }
}

fn apply_rgb_split(
    surface: &mut Surface,
    pool: &mut SurfacePool,
    intensity: f64,
    seed: u64,
    speed: f64,
    frame: u64,
) -> MontageResult<()> {
    let mut rng = FrameRng::for_frame(frame, speed, seed);
    let jitter = (rng.next() * 2.0 - 1.0) * intensity * 10.0;
    let offset = ((frame as f64) * 0.3 * speed).sin() * (intensity * 15.0) + jitter;
    if offset.abs() < 0.5 {
        return Ok(());
    }
    let shift = offset.round() as i64;

    let mut src = pool.acquire()?;
    src.copy_from(surface)?;
    let (w, h) = (surface.width() as i64, surface.height() as i64);
    let src_data = src.data();
    let dst = surface.data_mut();

    let sample = |x: i64, y: i64, c: usize| -> u8 {
        if x < 0 || x >= w {
            return 0;
        }
        src_data[((y * w + x) * 4) as usize + c]
    };

    for y in 0..h {
        for x in 0..w {
            let idx = ((y * w + x) * 4) as usize;
            let r = sample(x - shift, y, 0);
            let b = sample(x + shift, y, 2);
            let a = sample(x - shift, y, 3)
                .max(sample(x, y, 3))
                .max(sample(x + shift, y, 3));
            dst[idx] = r;
            // Green stays from the center tap.
            dst[idx + 2] = b;
            dst[idx + 3] = a;
        }
    }

    pool.release(src);
    Ok(())
}

fn apply_scanlines(surface: &mut Surface, intensity: f64) {
    let alpha = (intensity * 0.3).clamp(0.0, 1.0);
    let line = [0u8, 0, 0, (alpha * 255.0).round() as u8];
    let w = surface.width() as usize;
    let data = surface.data_mut();
    for (y, row) in data.chunks_exact_mut(w * 4).enumerate() {
        // 2px line, 2px gap.
        if y % 4 >= 2 {
            continue;
        }
        for px in row.chunks_exact_mut(4) {
            let out = over([px[0], px[1], px[2], px[3]], line, 1.0);
            px.copy_from_slice(&out);
        }
    }
}

fn apply_color_glitch(surface: &mut Surface, intensity: f64, seed: u64, speed: f64, frame: u64) {
    let mut rng = FrameRng::for_frame(frame, speed, seed);
    if rng.next() >= intensity * 0.3 {
        return;
    }
    let degrees = rng.next() * 360.0 * intensity;
    let m = filter_matrix(FilterKind::HueRotate, degrees);
    apply_color_matrix(surface.data_mut(), &m);
}

// --- halftone / vignette ----------------------------------------------------

fn apply_halftone(surface: &mut Surface, params: &HalftoneParams) {
    let (w, h) = (surface.width() as f64, surface.height() as f64);
    let (cx, cy) = (w / 2.0, h / 2.0);
    let rad = -params.angle_deg.to_radians();
    let (cos, sin) = (rad.cos(), rad.sin());

    let radius = params.dot_size / 2.0;
    let soft = (params.softness * params.dot_size).max(0.01);
    let spacing = params.spacing;
    let alpha_scale = params.intensity as f32;

    let width = surface.width() as usize;
    let data = surface.data_mut();
    for y in 0..(h as usize) {
        for x in 0..width {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            // Rotate the sample point about the canvas center.
            let u = dx * cos - dy * sin;
            let v = dx * sin + dy * cos;

            let dist = match params.pattern {
                HalftonePattern::Dots => {
                    let lu = u.rem_euclid(spacing) - spacing / 2.0;
                    let lv = v.rem_euclid(spacing) - spacing / 2.0;
                    (lu * lu + lv * lv).sqrt()
                }
                HalftonePattern::Lines => (v.rem_euclid(spacing) - spacing / 2.0).abs(),
            };

            let mut coverage = ((radius + soft - dist) / soft).clamp(0.0, 1.0);
            if params.inverted {
                coverage = 1.0 - coverage;
            }
            if coverage <= 0.0 {
                continue;
            }

            let src_a = (coverage * 255.0).round() as u8;
            let src = premul_color(params.dot_color, src_a);
            let idx = (y * width + x) * 4;
            let d = [data[idx], data[idx + 1], data[idx + 2], data[idx + 3]];
            let out = blend_over(d, src, params.blend_mode, alpha_scale);
            data[idx..idx + 4].copy_from_slice(&out);
        }
    }
}

fn apply_vignette(surface: &mut Surface, params: &VignetteParams) {
    let (w, h) = (surface.width() as f64, surface.height() as f64);
    let (cx, cy) = (w / 2.0, h / 2.0);
    let half_diag = (cx * cx + cy * cy).sqrt();

    let fade_start = params.size * 70.0;
    let fade_range = 30.0 + params.softness * 40.0;

    let width = surface.width() as usize;
    let data = surface.data_mut();
    for y in 0..(h as usize) {
        for x in 0..width {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            let dist_pct = if params.elliptical {
                let nx = dx / cx.max(1.0);
                let ny = dy / cy.max(1.0);
                (nx * nx + ny * ny).sqrt() * 100.0 / std::f64::consts::SQRT_2
            } else {
                (dx * dx + dy * dy).sqrt() / half_diag * 100.0
            };

            let t = ((dist_pct - fade_start) / fade_range).clamp(0.0, 1.0);
            let alpha = t * params.intensity;
            if alpha <= 0.0 {
                continue;
            }

            let src = premul_color(params.color, (alpha * 255.0).round() as u8);
            let idx = (y * width + x) * 4;
            let d = [data[idx], data[idx + 1], data[idx + 2], data[idx + 3]];
            let out = over(d, src, 1.0);
            data[idx..idx + 4].copy_from_slice(&out);
        }
    }
}

fn premul_color(straight: [u8; 4], coverage_a: u8) -> [u8; 4] {
    let a = (u16::from(straight[3]) * u16::from(coverage_a) + 127) / 255;
    let premul = |c: u8| ((u16::from(c) * a + 127) / 255) as u8;
    [
        premul(straight[0]),
        premul(straight[1]),
        premul(straight[2]),
        a as u8,
    ]
}

/// Source-over with a separable blend function applied to unpremultiplied
/// channels, scaled by `opacity`.
fn blend_over(dst: [u8; 4], src: [u8; 4], mode: BlendMode, opacity: f32) -> [u8; 4] {
    if matches!(mode, BlendMode::Normal) {
        return over(dst, src, opacity);
    }

    let blend_fn = |s: f32, d: f32| -> f32 {
        match mode {
            BlendMode::Normal => s,
            BlendMode::Multiply => s * d,
            BlendMode::Screen => s + d - s * d,
            BlendMode::Overlay => {
                if d <= 0.5 {
                    2.0 * s * d
                } else {
                    1.0 - 2.0 * (1.0 - s) * (1.0 - d)
                }
            }
            BlendMode::Darken => s.min(d),
            BlendMode::Lighten => s.max(d),
        }
    };

    let op = opacity.clamp(0.0, 1.0);
    let sa = f32::from(src[3]) / 255.0 * op;
    if sa <= 0.0 {
        return dst;
    }
    let da = f32::from(dst[3]) / 255.0;

    let unpack = |px: [u8; 4], a: f32| -> [f32; 3] {
        if a <= 0.0 {
            return [0.0; 3];
        }
        [
            (f32::from(px[0]) / 255.0 / a).min(1.0),
            (f32::from(px[1]) / 255.0 / a).min(1.0),
            (f32::from(px[2]) / 255.0 / a).min(1.0),
        ]
    };
    let sc = unpack(src, f32::from(src[3]) / 255.0);
    let dc = unpack(dst, da);

    let out_a = sa + da * (1.0 - sa);
    let mut out = [0u8; 4];
    for c in 0..3 {
        let b = blend_fn(sc[c], dc[c]).clamp(0.0, 1.0);
        let p = sc[c] * sa * (1.0 - da) + dc[c] * da * (1.0 - sa) + b * sa * da;
        out[c] = (p.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    out[3] = (out_a.clamp(0.0, 1.0) * 255.0).round() as u8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(kind: &str, params: serde_json::Value) -> EffectInstance {
        EffectInstance {
            kind: kind.to_string(),
            params,
            enabled: true,
            opacity: 1.0,
        }
    }

    fn solid_surface(w: u32, h: u32, px: [u8; 4]) -> Surface {
        let mut s = Surface::new(w, h).unwrap();
        s.fill(px);
        s
    }

    #[test]
    fn parse_uses_noop_defaults() {
        let e = parse_effect(&inst("brightness", serde_json::Value::Null)).unwrap();
        assert_eq!(
            e,
            Effect::Filter {
                kind: FilterKind::Brightness,
                value: 100.0
            }
        );
        assert!(parse_effect(&inst("nope", serde_json::Value::Null)).is_err());
    }

    #[test]
    fn disabled_effects_are_dropped() {
        let mut i = inst("sepia", serde_json::Value::Null);
        i.enabled = false;
        assert!(resolve_effects(&[i]).unwrap().is_empty());
    }

    #[test]
    fn transparency_check_flags_glitch_and_low_opacity() {
        let glitch = ResolvedEffect {
            effect: Effect::Scanlines { intensity: 1.0 },
            opacity: 1.0,
        };
        assert!(glitch.introduces_transparency());

        let opaque_filter = ResolvedEffect {
            effect: Effect::Filter {
                kind: FilterKind::Sepia,
                value: 100.0,
            },
            opacity: 1.0,
        };
        assert!(!opaque_filter.introduces_transparency());

        let faded = ResolvedEffect {
            opacity: 0.5,
            ..opaque_filter
        };
        assert!(faded.introduces_transparency());
    }

    #[test]
    fn noop_filter_values_leave_pixels_unchanged() {
        let mut s = solid_surface(4, 4, [100, 150, 200, 255]);
        let mut pool = SurfacePool::new(4, 4);
        let fx = resolve_effects(&[
            inst("brightness", serde_json::json!({ "value": 100 })),
            inst("saturate", serde_json::json!({ "value": 100 })),
            inst("invert", serde_json::json!({ "value": 0 })),
        ])
        .unwrap();
        apply_effects(&mut s, &mut pool, &fx, 0).unwrap();
        assert_eq!(&s.data()[0..4], &[100, 150, 200, 255]);
    }

    #[test]
    fn invert_flips_channels() {
        let mut s = solid_surface(2, 2, [255, 0, 0, 255]);
        let mut pool = SurfacePool::new(2, 2);
        let fx = resolve_effects(&[inst("invert", serde_json::json!({ "value": 100 }))]).unwrap();
        apply_effects(&mut s, &mut pool, &fx, 0).unwrap();
        assert_eq!(&s.data()[0..4], &[0, 255, 255, 255]);
    }

    #[test]
    fn grayscale_equalizes_channels() {
        let mut s = solid_surface(2, 2, [255, 0, 0, 255]);
        let mut pool = SurfacePool::new(2, 2);
        let fx =
            resolve_effects(&[inst("grayscale", serde_json::json!({ "value": 100 }))]).unwrap();
        apply_effects(&mut s, &mut pool, &fx, 0).unwrap();
        let px = &s.data()[0..4];
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn scanlines_darken_alternate_rows_only() {
        let mut s = solid_surface(4, 8, [200, 200, 200, 255]);
        apply_scanlines(&mut s, 1.0);
        let row = |y: usize| s.data()[y * 4 * 4];
        assert!(row(0) < 200);
        assert!(row(1) < 200);
        assert_eq!(row(2), 200);
        assert_eq!(row(3), 200);
        assert!(row(4) < 200);
    }

    #[test]
    fn rgb_split_is_deterministic_per_frame() {
        let mut pool = SurfacePool::new(8, 8);
        let mut run = || {
            let mut s = solid_surface(8, 8, [90, 120, 150, 255]);
            apply_rgb_split(&mut s, &mut pool, 1.0, 7, 1.0, 13).unwrap();
            s.data().to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn vignette_darkens_corners_more_than_center() {
        let mut s = solid_surface(32, 32, [200, 200, 200, 255]);
        apply_vignette(
            &mut s,
            &VignetteParams {
                size: 0.2,
                softness: 0.5,
                intensity: 1.0,
                color: [0, 0, 0, 255],
                elliptical: false,
            },
        );
        let center = s.data()[(16 * 32 + 16) * 4];
        let corner = s.data()[0];
        assert!(corner < center);
    }

    #[test]
    fn halftone_inverted_flips_coverage() {
        let params = HalftoneParams {
            pattern: HalftonePattern::Dots,
            dot_size: 4.0,
            spacing: 8.0,
            angle_deg: 0.0,
            intensity: 1.0,
            softness: 0.0,
            blend_mode: BlendMode::Normal,
            inverted: false,
            dot_color: [0, 0, 0, 255],
        };
        let mut plain = solid_surface(16, 16, [200, 200, 200, 255]);
        apply_halftone(&mut plain, &params);
        let mut inverted = solid_surface(16, 16, [200, 200, 200, 255]);
        apply_halftone(
            &mut inverted,
            &HalftoneParams {
                inverted: true,
                ..params
            },
        );
        assert_ne!(plain.data(), inverted.data());
    }
}
