use std::collections::BTreeMap;

use crate::{
    core::Canvas,
    model::{ItemKeyframes, Keyframe, Property, TimelineItem},
};

/// Interpolate an animated property at `frame` (relative to the item start).
///
/// Keyframes must be sorted by `frame` ascending. Outside the keyframed range
/// the first/last value holds; between two keyframes the left keyframe's
/// easing shapes the normalized time before a linear value blend.
pub fn interpolate(keyframes: &[Keyframe], frame: f64, fallback: f64) -> f64 {
    let Some(first) = keyframes.first() else {
        return fallback;
    };
    if frame <= first.frame as f64 {
        return first.value;
    }
    let last = &keyframes[keyframes.len() - 1];
    if frame >= last.frame as f64 {
        return last.value;
    }

    let idx = keyframes.partition_point(|k| (k.frame as f64) <= frame);
    let a = &keyframes[idx - 1];
    let b = &keyframes[idx];
    let denom = (b.frame - a.frame) as f64;
    if denom <= 0.0 {
        return a.value;
    }

    let t = (frame - a.frame as f64) / denom;
    let te = a.easing.apply(t, a.easing_config.as_ref());
    a.value + (b.value - a.value) * te
}

/// Interpolate against raw (pre-shift) keyframes at an absolute relative
/// frame. Used by the resolver when synthesizing a keyframe at frame 0.
pub fn interpolate_at(keyframes: &[Keyframe], frame: i64, fallback: f64) -> f64 {
    interpolate(keyframes, frame as f64, fallback)
}

/// Per-item keyframe lookup built once per render.
#[derive(Clone, Debug, Default)]
pub struct KeyframeMap {
    items: BTreeMap<String, BTreeMap<Property, Vec<Keyframe>>>,
}

impl KeyframeMap {
    pub fn build(sets: &[ItemKeyframes]) -> Self {
        let mut items: BTreeMap<String, BTreeMap<Property, Vec<Keyframe>>> = BTreeMap::new();
        for set in sets {
            let entry = items.entry(set.item_id.clone()).or_default();
            for prop in &set.properties {
                let mut keys = prop.keyframes.clone();
                keys.sort_by_key(|k| k.frame);
                entry.insert(prop.property, keys);
            }
        }
        Self { items }
    }

    pub fn property(&self, item_id: &str, property: Property) -> Option<&[Keyframe]> {
        self.items
            .get(item_id)
            .and_then(|p| p.get(&property))
            .map(|v| v.as_slice())
    }

    pub fn has_any(&self, item_id: &str) -> bool {
        self.items.get(item_id).is_some_and(|p| !p.is_empty())
    }

    pub fn value(&self, item_id: &str, property: Property, frame: f64, fallback: f64) -> f64 {
        match self.property(item_id, property) {
            Some(keys) => interpolate(keys, frame, fallback),
            None => fallback,
        }
    }
}

/// An item's transform at one frame, after keyframe overrides.
///
/// `x`/`y` are the box center in canvas pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnimatedTransform {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation_deg: f64,
    pub opacity: f64,
    pub corner_radius: f64,
}

impl AnimatedTransform {
    /// Axis-aligned bounds cover the whole canvas. Only meaningful while the
    /// rotation keeps the box axis-aligned (0 or ±180 degrees).
    pub fn covers_canvas(&self, canvas: Canvas) -> bool {
        self.x - self.width / 2.0 <= 0.0
            && self.y - self.height / 2.0 <= 0.0
            && self.x + self.width / 2.0 >= f64::from(canvas.width)
            && self.y + self.height / 2.0 >= f64::from(canvas.height)
    }

    pub fn is_axis_aligned(&self) -> bool {
        let r = self.rotation_deg.rem_euclid(360.0);
        r.abs() < 1e-9 || (r - 180.0).abs() < 1e-9
    }
}

/// Resolve the base transform from item fields (canvas-fit defaults) and
/// override each property that carries keyframes at `frame`.
pub fn animated_transform(
    item: &TimelineItem,
    keyframes: &KeyframeMap,
    frame: f64,
    canvas: Canvas,
) -> AnimatedTransform {
    let base_w = item.width.unwrap_or(f64::from(canvas.width));
    let base_h = item.height.unwrap_or(f64::from(canvas.height));
    let base_x = item.x.unwrap_or(f64::from(canvas.width) / 2.0);
    let base_y = item.y.unwrap_or(f64::from(canvas.height) / 2.0);

    let id = item.id.as_str();
    AnimatedTransform {
        x: keyframes.value(id, Property::X, frame, base_x),
        y: keyframes.value(id, Property::Y, frame, base_y),
        width: keyframes.value(id, Property::Width, frame, base_w).max(0.0),
        height: keyframes
            .value(id, Property::Height, frame, base_h)
            .max(0.0),
        rotation_deg: keyframes.value(id, Property::Rotation, frame, item.rotation),
        opacity: keyframes
            .value(id, Property::Opacity, frame, item.opacity)
            .clamp(0.0, 1.0),
        corner_radius: keyframes
            .value(id, Property::CornerRadius, frame, item.corner_radius)
            .max(0.0),
    }
}
