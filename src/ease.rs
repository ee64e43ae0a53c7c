/// Easing applied between two keyframes. The CSS-named variants are fixed
/// cubic-bezier curves; `CubicBezier` and `Spring` read their parameters from
/// the keyframe's [`EasingConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Easing {
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
    CubicBezier,
    Spring,
}

impl Default for Easing {
    fn default() -> Self {
        Self::Linear
    }
}

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EasingConfig {
    pub tension: f64,
    pub friction: f64,
    pub mass: f64,
    /// Control points `[x1, y1, x2, y2]` for `CubicBezier`.
    pub points: Option<[f64; 4]>,
}

impl Default for EasingConfig {
    fn default() -> Self {
        Self {
            tension: 170.0,
            friction: 26.0,
            mass: 1.0,
            points: None,
        }
    }
}

impl Easing {
    /// Map normalized keyframe time `t ∈ [0,1]` to an eased fraction.
    ///
    /// Every variant except `Spring` returns a value in `[0,1]`; springs may
    /// overshoot past 1 before settling.
    pub fn apply(self, t: f64, config: Option<&EasingConfig>) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Linear => t,
            Self::EaseIn => cubic_bezier_at(0.42, 0.0, 1.0, 1.0, t),
            Self::EaseOut => cubic_bezier_at(0.0, 0.0, 0.58, 1.0, t),
            Self::EaseInOut => cubic_bezier_at(0.42, 0.0, 0.58, 1.0, t),
            Self::CubicBezier => {
                let [x1, y1, x2, y2] = config
                    .and_then(|c| c.points)
                    .unwrap_or([0.25, 0.1, 0.25, 1.0]);
                cubic_bezier_at(x1, y1, x2, y2, t)
            }
            Self::Spring => {
                let default = EasingConfig::default();
                let cfg = config.unwrap_or(&default);
                spring_at(cfg.tension, cfg.friction, cfg.mass, t)
            }
        }
    }
}

/// CSS cubic-bezier: solve the parametric x(s) = t for s, then evaluate y(s).
fn cubic_bezier_at(x1: f64, y1: f64, x2: f64, y2: f64, t: f64) -> f64 {
    if t <= 0.0 {
        return 0.0;
    }
    if t >= 1.0 {
        return 1.0;
    }

    let x1 = x1.clamp(0.0, 1.0);
    let x2 = x2.clamp(0.0, 1.0);

    let sample = |p1: f64, p2: f64, s: f64| -> f64 {
        // Bernstein form with endpoints (0,0) and (1,1).
        let inv = 1.0 - s;
        3.0 * inv * inv * s * p1 + 3.0 * inv * s * s * p2 + s * s * s
    };
    let sample_dx = |p1: f64, p2: f64, s: f64| -> f64 {
        let inv = 1.0 - s;
        3.0 * inv * inv * p1 + 6.0 * inv * s * (p2 - p1) + 3.0 * s * s * (1.0 - p2)
    };

    // Newton iterations with a bisection fallback for flat derivatives.
    let mut s = t;
    for _ in 0..8 {
        let err = sample(x1, x2, s) - t;
        if err.abs() < 1e-7 {
            return sample(y1, y2, s);
        }
        let d = sample_dx(x1, x2, s);
        if d.abs() < 1e-6 {
            break;
        }
        s = (s - err / d).clamp(0.0, 1.0);
    }

    let (mut lo, mut hi) = (0.0f64, 1.0f64);
    for _ in 0..32 {
        s = 0.5 * (lo + hi);
        if sample(x1, x2, s) < t {
            lo = s;
        } else {
            hi = s;
        }
    }
    sample(y1, y2, s)
}

/// Closed-form damped spring response, normalized so the animation window maps
/// to one second of spring time. Underdamped configurations overshoot.
fn spring_at(tension: f64, friction: f64, mass: f64, t: f64) -> f64 {
    let tension = tension.max(1.0);
    let friction = friction.max(0.0);
    let mass = mass.max(0.001);

    let w0 = (tension / mass).sqrt();
    let zeta = friction / (2.0 * (tension * mass).sqrt());

    if zeta < 1.0 {
        let wd = w0 * (1.0 - zeta * zeta).sqrt();
        let decay = (-zeta * w0 * t).exp();
        1.0 - decay * ((wd * t).cos() + (zeta * w0 / wd) * (wd * t).sin())
    } else {
        // Critically/over-damped: no oscillation.
        let decay = (-w0 * t).exp();
        1.0 - decay * (1.0 + w0 * t)
    }
}
