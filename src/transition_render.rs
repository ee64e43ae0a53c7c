//! Transition presentation compositors. Each renderer blends a fully
//! rendered outgoing and incoming surface onto the content canvas for one
//! frame of the window.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::{
    composite::{mix_weighted, over},
    error::MontageResult,
    model::TransitionDirection,
    surface::Surface,
};

#[derive(Clone, Copy)]
pub struct TransitionFrame<'a> {
    pub outgoing: &'a Surface,
    pub incoming: &'a Surface,
    /// Eased window progress in [0,1].
    pub progress: f64,
    pub direction: Option<TransitionDirection>,
}

pub type TransitionRenderFn = fn(&mut Surface, &TransitionFrame<'_>) -> MontageResult<()>;

/// Process-wide registry of presentation renderers, initialized once and
/// read-only afterwards. Custom renderers registered before the first lookup
/// win over the built-ins of the same name.
pub struct TransitionRegistry {
    renderers: BTreeMap<String, TransitionRenderFn>,
}

static GLOBAL: OnceLock<TransitionRegistry> = OnceLock::new();
static CUSTOM: OnceLock<Vec<(String, TransitionRenderFn)>> = OnceLock::new();

impl TransitionRegistry {
    pub fn builtin() -> Self {
        let mut renderers = BTreeMap::<String, TransitionRenderFn>::new();
        renderers.insert("fade".to_string(), render_fade);
        renderers.insert("wipe".to_string(), render_wipe);
        renderers.insert("slide".to_string(), render_slide);
        renderers.insert("flip".to_string(), render_flip);
        renderers.insert("clock-wipe".to_string(), render_clock_wipe);
        renderers.insert("iris".to_string(), render_iris);
        renderers.insert("none".to_string(), render_cut);
        Self { renderers }
    }

    /// Install plug-in renderers. Must run before the first render; later
    /// calls are ignored.
    pub fn install_custom(renderers: Vec<(String, TransitionRenderFn)>) {
        let _ = CUSTOM.set(renderers);
    }

    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(|| {
            let mut registry = Self::builtin();
            if let Some(custom) = CUSTOM.get() {
                for (name, f) in custom {
                    registry.renderers.insert(name.clone(), *f);
                }
            }
            registry
        })
    }

    pub fn renderer(&self, name: &str) -> Option<TransitionRenderFn> {
        self.renderers.get(name).copied()
    }
}

#[inline(always)]
fn sample(buf: &[u8], w: i64, h: i64, x: i64, y: i64) -> [u8; 4] {
    if x < 0 || y < 0 || x >= w || y >= h {
        return [0; 4];
    }
    let idx = ((y * w + x) * 4) as usize;
    [buf[idx], buf[idx + 1], buf[idx + 2], buf[idx + 3]]
}

/// Sample with the source scaled by `s` about the canvas center.
#[inline(always)]
fn sample_scaled(buf: &[u8], w: i64, h: i64, x: i64, y: i64, s: f64) -> [u8; 4] {
    if s <= 0.0 {
        return [0; 4];
    }
    let cx = (w as f64) / 2.0;
    let cy = (h as f64) / 2.0;
    let sx = (cx + ((x as f64 + 0.5) - cx) / s).floor() as i64;
    let sy = (cy + ((y as f64 + 0.5) - cy) / s).floor() as i64;
    sample(buf, w, h, sx, sy)
}

/// Sample with the source scaled by `s` about the center along one axis only.
#[inline(always)]
fn sample_axis_scaled(
    buf: &[u8],
    w: i64,
    h: i64,
    x: i64,
    y: i64,
    s: f64,
    horizontal: bool,
) -> [u8; 4] {
    if s <= 0.0 {
        return [0; 4];
    }
    let (sx, sy) = if horizontal {
        let cx = (w as f64) / 2.0;
        ((cx + ((x as f64 + 0.5) - cx) / s).floor() as i64, y)
    } else {
        let cy = (h as f64) / 2.0;
        (x, (cy + ((y as f64 + 0.5) - cy) / s).floor() as i64)
    };
    sample(buf, w, h, sx, sy)
}

fn for_each_pixel(
    dst: &mut Surface,
    mut f: impl FnMut(i64, i64, [u8; 4]) -> [u8; 4],
) -> MontageResult<()> {
    let w = dst.width() as i64;
    let h = dst.height() as i64;
    let data = dst.data_mut();
    for y in 0..h {
        for x in 0..w {
            let idx = ((y * w + x) * 4) as usize;
            let d = [data[idx], data[idx + 1], data[idx + 2], data[idx + 3]];
            let out = f(x, y, d);
            data[idx..idx + 4].copy_from_slice(&out);
        }
    }
    Ok(())
}

/// Equal-power crossfade with a subtle settle-in scale on the incoming clip.
fn render_fade(dst: &mut Surface, frame: &TransitionFrame<'_>) -> MontageResult<()> {
    let p = frame.progress;
    let w_out = ((p * std::f64::consts::FRAC_PI_2).cos()) as f32;
    let w_in = ((p * std::f64::consts::FRAC_PI_2).sin()) as f32;
    let scale = 1.04 - 0.04 * p;

    let w = dst.width() as i64;
    let h = dst.height() as i64;
    let a = frame.outgoing.data();
    let b = frame.incoming.data();
    for_each_pixel(dst, |x, y, d| {
        let pa = sample(a, w, h, x, y);
        let pb = sample_scaled(b, w, h, x, y, scale);
        over(d, mix_weighted(pa, pb, w_out, w_in), 1.0)
    })
}

/// Axis basis of a direction: position along the travel axis plus the unit
/// step in x/y.
fn axis(dir: TransitionDirection, w: i64, h: i64) -> (i64, i64, i64) {
    // (axis_len, step_x, step_y) with pos measured from the entering edge.
    match dir {
        TransitionDirection::FromLeft | TransitionDirection::Horizontal => (w, 1, 0),
        TransitionDirection::FromRight => (w, -1, 0),
        TransitionDirection::FromTop | TransitionDirection::Vertical => (h, 0, 1),
        TransitionDirection::FromBottom => (h, 0, -1),
    }
}

fn axis_pos(dir: TransitionDirection, x: i64, y: i64, w: i64, h: i64) -> i64 {
    match dir {
        TransitionDirection::FromLeft | TransitionDirection::Horizontal => x,
        TransitionDirection::FromRight => w - 1 - x,
        TransitionDirection::FromTop | TransitionDirection::Vertical => y,
        TransitionDirection::FromBottom => h - 1 - y,
    }
}

/// Animated rectangular reveal with a small parallax drift on both halves.
fn render_wipe(dst: &mut Surface, frame: &TransitionFrame<'_>) -> MontageResult<()> {
    let dir = frame.direction.unwrap_or(TransitionDirection::FromLeft);
    let p = frame.progress;

    let w = dst.width() as i64;
    let h = dst.height() as i64;
    let (axis_len, step_x, step_y) = axis(dir, w, h);
    let edge = p * axis_len as f64;
    let parallax = 0.035 * axis_len as f64;
    // Outgoing drifts away as the edge passes; incoming settles into place.
    let drift_out = (parallax * p).round() as i64;
    let drift_in = (parallax * (1.0 - p)).round() as i64;

    let a = frame.outgoing.data();
    let b = frame.incoming.data();
    for_each_pixel(dst, |x, y, d| {
        let pos = axis_pos(dir, x, y, w, h);
        let src = if (pos as f64) < edge {
            sample(
                b,
                w,
                h,
                x + step_x * drift_in,
                y + step_y * drift_in,
            )
        } else {
            sample(
                a,
                w,
                h,
                x + step_x * drift_out,
                y + step_y * drift_out,
            )
        };
        over(d, src, 1.0)
    })
}

/// Incoming pushes in from the edge while the outgoing slides out.
fn render_slide(dst: &mut Surface, frame: &TransitionFrame<'_>) -> MontageResult<()> {
    let dir = frame.direction.unwrap_or(TransitionDirection::FromLeft);
    let p = frame.progress;

    let w = dst.width() as i64;
    let h = dst.height() as i64;
    let (axis_len, step_x, step_y) = axis(dir, w, h);
    let in_off = ((1.0 - p) * axis_len as f64).round() as i64;
    let out_off = (p * axis_len as f64).round() as i64;

    let a = frame.outgoing.data();
    let b = frame.incoming.data();
    for_each_pixel(dst, |x, y, d| {
        let pb = sample(b, w, h, x + step_x * in_off, y + step_y * in_off);
        let src = if pb[3] > 0 {
            pb
        } else {
            sample(a, w, h, x - step_x * out_off, y - step_y * out_off)
        };
        over(d, src, 1.0)
    })
}

/// 2D flip approximation: the first half squashes the outgoing clip on the
/// axis, the second half expands the incoming clip.
fn render_flip(dst: &mut Surface, frame: &TransitionFrame<'_>) -> MontageResult<()> {
    let horizontal = !matches!(frame.direction, Some(TransitionDirection::Vertical));
    let p = frame.progress;

    let w = dst.width() as i64;
    let h = dst.height() as i64;
    let (buf, scale) = if p < 0.5 {
        (
            frame.outgoing.data(),
            (p * std::f64::consts::FRAC_PI_2).cos(),
        )
    } else {
        (
            frame.incoming.data(),
            ((p - 0.5) * std::f64::consts::FRAC_PI_2).sin(),
        )
    };

    for_each_pixel(dst, |x, y, d| {
        let src = sample_axis_scaled(buf, w, h, x, y, scale, horizontal);
        over(d, src, 1.0)
    })
}

/// Polar sweep from 12 o'clock, clockwise.
fn render_clock_wipe(dst: &mut Surface, frame: &TransitionFrame<'_>) -> MontageResult<()> {
    let p = frame.progress;
    let sweep = p * std::f64::consts::TAU;

    let w = dst.width() as i64;
    let h = dst.height() as i64;
    let cx = (w as f64) / 2.0;
    let cy = (h as f64) / 2.0;

    let a = frame.outgoing.data();
    let b = frame.incoming.data();
    for_each_pixel(dst, |x, y, d| {
        let dx = x as f64 + 0.5 - cx;
        let dy = y as f64 + 0.5 - cy;
        // Angle measured clockwise from straight up.
        let theta = dx.atan2(-dy).rem_euclid(std::f64::consts::TAU);
        let src = if theta < sweep {
            sample(b, w, h, x, y)
        } else {
            sample(a, w, h, x, y)
        };
        over(d, src, 1.0)
    })
}

/// Centered radial reveal of the incoming clip.
fn render_iris(dst: &mut Surface, frame: &TransitionFrame<'_>) -> MontageResult<()> {
    let w = dst.width() as i64;
    let h = dst.height() as i64;
    let cx = (w as f64) / 2.0;
    let cy = (h as f64) / 2.0;
    let half_diag = (cx * cx + cy * cy).sqrt();
    let radius = frame.progress * 1.2 * half_diag;
    let radius_sq = radius * radius;

    let a = frame.outgoing.data();
    let b = frame.incoming.data();
    for_each_pixel(dst, |x, y, d| {
        let dx = x as f64 + 0.5 - cx;
        let dy = y as f64 + 0.5 - cy;
        let src = if dx * dx + dy * dy < radius_sq {
            sample(b, w, h, x, y)
        } else {
            sample(a, w, h, x, y)
        };
        over(d, src, 1.0)
    })
}

/// Hard cut at the halfway point.
fn render_cut(dst: &mut Surface, frame: &TransitionFrame<'_>) -> MontageResult<()> {
    let src = if frame.progress < 0.5 {
        frame.outgoing
    } else {
        frame.incoming
    };
    crate::composite::over_in_place(dst.data_mut(), src.data(), 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> Surface {
        let mut s = Surface::new(w, h).unwrap();
        s.fill(px);
        s
    }

    fn red_green(w: u32, h: u32) -> (Surface, Surface) {
        (solid(w, h, [255, 0, 0, 255]), solid(w, h, [0, 255, 0, 255]))
    }

    fn px(s: &Surface, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * s.width() + x) * 4) as usize;
        let d = s.data();
        [d[idx], d[idx + 1], d[idx + 2], d[idx + 3]]
    }

    fn frame<'a>(
        outgoing: &'a Surface,
        incoming: &'a Surface,
        progress: f64,
        direction: Option<TransitionDirection>,
    ) -> TransitionFrame<'a> {
        TransitionFrame {
            outgoing,
            incoming,
            progress,
            direction,
        }
    }

    #[test]
    fn registry_has_all_presentations() {
        let r = TransitionRegistry::builtin();
        for name in ["fade", "wipe", "slide", "flip", "clock-wipe", "iris", "none"] {
            assert!(r.renderer(name).is_some(), "{name}");
        }
        assert!(r.renderer("unknown").is_none());
    }

    #[test]
    fn fade_midpoint_is_equal_power() {
        let (a, b) = red_green(16, 16);
        let mut dst = Surface::new(16, 16).unwrap();
        render_fade(&mut dst, &frame(&a, &b, 0.5, None)).unwrap();
        let p = px(&dst, 8, 8);
        // cos(π/4) = sin(π/4) ≈ 0.707: both channels near 180.
        assert!((i32::from(p[0]) - 180).abs() <= 4, "{p:?}");
        assert!((i32::from(p[1]) - 180).abs() <= 4, "{p:?}");
    }

    #[test]
    fn wipe_from_left_reveals_incoming_on_the_left() {
        let (a, b) = red_green(20, 10);
        let mut dst = Surface::new(20, 10).unwrap();
        render_wipe(
            &mut dst,
            &frame(&a, &b, 0.5, Some(TransitionDirection::FromLeft)),
        )
        .unwrap();
        assert_eq!(px(&dst, 2, 5)[1], 255);
        assert_eq!(px(&dst, 18, 5)[0], 255);
    }

    #[test]
    fn clock_wipe_quadrants_at_quarter_progress() {
        // S5: at p=0.25 the sweep has cleared 0°..90° (the top-right
        // quadrant); everywhere else the outgoing clip must remain.
        let (a, b) = red_green(64, 64);
        let mut dst = Surface::new(64, 64).unwrap();
        render_clock_wipe(&mut dst, &frame(&a, &b, 0.25, None)).unwrap();

        // Top-right quadrant: incoming (green).
        assert_eq!(px(&dst, 48, 16)[1], 255);
        // Bottom-right (90°..180°): still outgoing.
        assert_eq!(px(&dst, 48, 48)[0], 255);
        // Bottom-left and top-left: still outgoing.
        assert_eq!(px(&dst, 16, 48)[0], 255);
        assert_eq!(px(&dst, 16, 16)[0], 255);
    }

    #[test]
    fn iris_opens_from_the_center() {
        let (a, b) = red_green(64, 64);
        let mut dst = Surface::new(64, 64).unwrap();
        render_iris(&mut dst, &frame(&a, &b, 0.3, None)).unwrap();
        assert_eq!(px(&dst, 32, 32)[1], 255);
        assert_eq!(px(&dst, 1, 1)[0], 255);
    }

    #[test]
    fn cut_switches_at_half() {
        let (a, b) = red_green(8, 8);
        let mut dst = Surface::new(8, 8).unwrap();
        render_cut(&mut dst, &frame(&a, &b, 0.49, None)).unwrap();
        assert_eq!(px(&dst, 4, 4)[0], 255);

        let mut dst = Surface::new(8, 8).unwrap();
        render_cut(&mut dst, &frame(&a, &b, 0.51, None)).unwrap();
        assert_eq!(px(&dst, 4, 4)[1], 255);
    }

    #[test]
    fn slide_pushes_outgoing_out() {
        let (a, b) = red_green(20, 10);
        let mut dst = Surface::new(20, 10).unwrap();
        render_slide(
            &mut dst,
            &frame(&a, &b, 0.5, Some(TransitionDirection::FromLeft)),
        )
        .unwrap();
        // Incoming occupies the left half, outgoing was pushed right.
        assert_eq!(px(&dst, 2, 5)[1], 255);
        assert_eq!(px(&dst, 17, 5)[0], 255);
    }

    #[test]
    fn flip_first_half_shows_squashed_outgoing() {
        let (a, b) = red_green(20, 10);
        let mut dst = Surface::new(20, 10).unwrap();
        render_flip(&mut dst, &frame(&a, &b, 0.25, None)).unwrap();
        // Center still outgoing; the squashed edges are transparent.
        assert_eq!(px(&dst, 10, 5)[0], 255);
        assert_eq!(px(&dst, 0, 5)[3], 0);
    }
}
