use std::collections::BTreeMap;

use crate::{
    core::{FrameIndex, FrameRange, Fps, parse_hex_rgba},
    ease::{Easing, EasingConfig},
    error::{MontageError, MontageResult},
};

/// Sub-compositions referenced by [`ItemKind::Composition`] items, keyed by id.
pub type CompositionLibrary = BTreeMap<String, Composition>;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Composition {
    pub fps: Fps,
    pub duration_in_frames: u64,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_background_color")]
    pub background_color: String,
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub keyframes: Vec<ItemKeyframes>,
}

fn default_background_color() -> String {
    "#000000".to_string()
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Track {
    pub id: String,
    /// Stable z ordering: higher `order` renders first (further behind).
    pub order: i32,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub muted: bool,
    pub items: Vec<TimelineItem>,
}

fn default_true() -> bool {
    true
}

fn default_opacity() -> f64 {
    1.0
}

fn default_speed() -> f64 {
    1.0
}

/// One placed item. Timing and transform live in the shared header; the
/// type-specific payload is the flattened [`ItemKind`].
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TimelineItem {
    pub id: String,
    pub from: u64,
    pub duration_in_frames: u64,

    /// Center position / box size in canvas pixels. `None` means canvas-fit:
    /// the item box is the full canvas, centered.
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub corner_radius: f64,

    #[serde(default)]
    pub effects: Vec<EffectInstance>,
    #[serde(default)]
    pub fade_in: u64,
    #[serde(default)]
    pub fade_out: u64,

    /// Parent clip id when this item was produced by splitting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,

    #[serde(flatten)]
    pub kind: ItemKind,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    Video(MediaItem),
    Audio(MediaItem),
    Image(ImageItem),
    Text(TextItem),
    Shape(ShapeItem),
    Adjustment(AdjustmentItem),
    Composition(CompositionItem),
}

impl ItemKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Video(_) => "video",
            Self::Audio(_) => "audio",
            Self::Image(_) => "image",
            Self::Text(_) => "text",
            Self::Shape(_) => "shape",
            Self::Adjustment(_) => "adjustment",
            Self::Composition(_) => "composition",
        }
    }
}

/// Shared payload of video and audio items. Source offsets are in source
/// frames; `source_start` is canonical (`trim_start` and `offset` are accepted
/// as legacy aliases on input and never written back).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct MediaItem {
    pub src: String,
    #[serde(alias = "trim_start", alias = "offset")]
    pub source_start: u64,
    pub source_end: u64,
    pub source_duration: u64,
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Gain in dB; 0 is unity.
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub muted: bool,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ImageItem {
    pub src: String,
    pub natural_width: u32,
    pub natural_height: u32,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TextItem {
    pub text: String,
    pub font_family: String,
    #[serde(default = "default_font_weight")]
    pub font_weight: u16,
    pub font_size: f64,
    #[serde(default = "default_text_color")]
    pub color: String,
    #[serde(default = "default_line_height")]
    pub line_height: f64,
    #[serde(default)]
    pub letter_spacing: f64,
    #[serde(default)]
    pub text_align: TextAlign,
    #[serde(default)]
    pub vertical_align: VerticalAlign,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_shadow: Option<TextShadow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<TextStroke>,
}

fn default_font_weight() -> u16 {
    400
}

fn default_text_color() -> String {
    "#ffffff".to_string()
}

fn default_line_height() -> f64 {
    1.2
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    Left,
    #[default]
    Center,
    Right,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerticalAlign {
    Top,
    #[default]
    Middle,
    Bottom,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TextShadow {
    pub offset_x: f64,
    pub offset_y: f64,
    #[serde(default)]
    pub blur: f64,
    pub color: String,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TextStroke {
    pub width: f64,
    pub color: String,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ShapeItem {
    pub shape_type: ShapeType,
    #[serde(default = "default_fill_color")]
    pub fill_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<String>,
    #[serde(default)]
    pub stroke_width: f64,
    #[serde(default)]
    pub is_mask: bool,
    #[serde(default)]
    pub mask_type: MaskType,
    #[serde(default)]
    pub mask_invert: bool,
    /// Feather radius in pixels; only meaningful for masks.
    #[serde(default)]
    pub mask_feather: f64,
}

fn default_fill_color() -> String {
    "#ffffff".to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeType {
    Rectangle,
    Ellipse,
    Triangle,
    Star,
    Line,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskType {
    #[default]
    Clip,
    Alpha,
}

/// Carries no payload of its own: an adjustment layer applies the header's
/// `effects` to everything rendered behind it (tracks with a larger `order`).
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct AdjustmentItem {}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CompositionItem {
    pub composition_id: String,
    /// Offset into the sub-composition, in sub-composition frames.
    #[serde(default)]
    pub source_start: u64,
}

/// Untyped effect instance; `kind` and `params` are parsed by the effects
/// module at render time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EffectInstance {
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Strength of the effect's own output; < 1 means the effect can introduce
    /// transparency.
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Transition {
    pub id: String,
    pub track_id: String,
    pub left_clip_id: String,
    pub right_clip_id: String,
    pub presentation: TransitionPresentation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<TransitionDirection>,
    pub duration_in_frames: u64,
    /// Split of the window around the cut point: 0 = entirely after the cut,
    /// 1 = entirely before it.
    #[serde(default = "default_alignment")]
    pub alignment: f64,
    #[serde(default)]
    pub timing: Easing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bezier_points: Option<[f64; 4]>,
}

fn default_alignment() -> f64 {
    0.5
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionPresentation {
    Fade,
    Wipe,
    Slide,
    Flip,
    ClockWipe,
    Iris,
    None,
}

impl TransitionPresentation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Fade => "fade",
            Self::Wipe => "wipe",
            Self::Slide => "slide",
            Self::Flip => "flip",
            Self::ClockWipe => "clock-wipe",
            Self::Iris => "iris",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionDirection {
    FromLeft,
    FromRight,
    FromTop,
    FromBottom,
    Horizontal,
    Vertical,
}

/// Animated properties. Keyframe frames are stored relative to the owning
/// item's `from`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Property {
    X,
    Y,
    Width,
    Height,
    Rotation,
    Opacity,
    CornerRadius,
    Volume,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ItemKeyframes {
    pub item_id: String,
    pub properties: Vec<PropertyKeyframes>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PropertyKeyframes {
    pub property: Property,
    pub keyframes: Vec<Keyframe>,
}

#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct Keyframe {
    /// Relative to the item start; may go negative after resolver shifts.
    pub frame: i64,
    pub value: f64,
    #[serde(default)]
    pub easing: Easing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub easing_config: Option<EasingConfig>,
}

impl TimelineItem {
    pub fn end(&self) -> u64 {
        self.from.saturating_add(self.duration_in_frames)
    }

    /// Timeline placement `[from, from + duration)`.
    pub fn range(&self) -> FrameRange {
        FrameRange {
            start: FrameIndex(self.from),
            end: FrameIndex(self.end()),
        }
    }

    pub fn is_active_at(&self, frame: u64) -> bool {
        self.range().contains(FrameIndex(frame))
    }

    pub fn media(&self) -> Option<&MediaItem> {
        match &self.kind {
            ItemKind::Video(m) | ItemKind::Audio(m) => Some(m),
            _ => None,
        }
    }

    pub fn speed(&self) -> f64 {
        self.media().map(|m| m.speed).unwrap_or(1.0)
    }

    pub fn is_mask_shape(&self) -> bool {
        matches!(&self.kind, ItemKind::Shape(s) if s.is_mask)
    }
}

impl Composition {
    pub fn validate(&self) -> MontageResult<()> {
        Fps::new(self.fps.0)?;
        if self.duration_in_frames == 0 {
            return Err(MontageError::validation(
                "composition duration_in_frames must be >= 1",
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(MontageError::validation(
                "composition width/height must be > 0",
            ));
        }
        parse_hex_rgba(&self.background_color)?;

        let mut item_track: BTreeMap<&str, (&str, &TimelineItem)> = BTreeMap::new();
        for track in &self.tracks {
            for item in &track.items {
                if item.duration_in_frames == 0 {
                    return Err(MontageError::validation(format!(
                        "item '{}' has zero duration",
                        item.id
                    )));
                }
                if item_track
                    .insert(item.id.as_str(), (track.id.as_str(), item))
                    .is_some()
                {
                    return Err(MontageError::validation(format!(
                        "duplicate item id '{}'",
                        item.id
                    )));
                }
                if let Some(media) = item.media() {
                    if media.speed <= 0.0 || !media.speed.is_finite() {
                        return Err(MontageError::validation(format!(
                            "item '{}' speed must be finite and > 0",
                            item.id
                        )));
                    }
                    if media.source_start > media.source_end
                        || media.source_end > media.source_duration
                    {
                        return Err(MontageError::validation(format!(
                            "item '{}' requires 0 <= source_start <= source_end <= source_duration",
                            item.id
                        )));
                    }
                }
                if !(0.0..=1.0).contains(&item.opacity) {
                    return Err(MontageError::validation(format!(
                        "item '{}' opacity must be in [0,1]",
                        item.id
                    )));
                }
            }
        }

        for tr in &self.transitions {
            self.validate_transition(tr, &item_track)?;
        }

        self.validate_overlaps()?;
        Ok(())
    }

    fn validate_transition(
        &self,
        tr: &Transition,
        item_track: &BTreeMap<&str, (&str, &TimelineItem)>,
    ) -> MontageResult<()> {
        if tr.duration_in_frames == 0 {
            return Err(MontageError::validation(format!(
                "transition '{}' duration must be > 0",
                tr.id
            )));
        }
        if !(0.0..=1.0).contains(&tr.alignment) {
            return Err(MontageError::validation(format!(
                "transition '{}' alignment must be in [0,1]",
                tr.id
            )));
        }

        let lookup = |clip_id: &str| -> MontageResult<&TimelineItem> {
            let (track_id, item) = item_track.get(clip_id).ok_or_else(|| {
                MontageError::validation(format!(
                    "transition '{}' references missing clip '{clip_id}'",
                    tr.id
                ))
            })?;
            if *track_id != tr.track_id {
                return Err(MontageError::validation(format!(
                    "transition '{}' clip '{clip_id}' is not on track '{}'",
                    tr.id, tr.track_id
                )));
            }
            if !matches!(item.kind, ItemKind::Video(_) | ItemKind::Image(_)) {
                return Err(MontageError::validation(format!(
                    "transition '{}' clip '{clip_id}' must be video or image",
                    tr.id
                )));
            }
            Ok(*item)
        };

        let left = lookup(&tr.left_clip_id)?;
        let right = lookup(&tr.right_clip_id)?;
        if tr.duration_in_frames >= left.duration_in_frames.min(right.duration_in_frames) {
            return Err(MontageError::validation(format!(
                "transition '{}' duration must be shorter than both clips",
                tr.id
            )));
        }
        Ok(())
    }

    /// Items on one track must not overlap unless a transition links them.
    fn validate_overlaps(&self) -> MontageResult<()> {
        for track in &self.tracks {
            let mut items: Vec<&TimelineItem> = track.items.iter().collect();
            items.sort_by_key(|i| (i.from, i.id.clone()));
            for pair in items.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if b.from < a.end() {
                    let linked = self.transitions.iter().any(|t| {
                        (t.left_clip_id == a.id && t.right_clip_id == b.id)
                            || (t.left_clip_id == b.id && t.right_clip_id == a.id)
                    });
                    if !linked {
                        return Err(MontageError::validation(format!(
                            "items '{}' and '{}' overlap on track '{}' without a transition",
                            a.id, b.id, track.id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn find_item(&self, item_id: &str) -> Option<(&Track, &TimelineItem)> {
        self.tracks.iter().find_map(|t| {
            t.items
                .iter()
                .find(|i| i.id == item_id)
                .map(|i| (t, i))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{image_item, item, media_item, track};

    fn basic_comp() -> Composition {
        Composition {
            fps: Fps(30),
            duration_in_frames: 120,
            width: 1920,
            height: 1080,
            background_color: "#000000".to_string(),
            tracks: vec![track("t1", 0, vec![item("a", 0, 120, image_item())])],
            transitions: vec![],
            keyframes: vec![],
        }
    }

    #[test]
    fn json_roundtrip_keeps_tagged_kinds() {
        let comp = basic_comp();
        let s = serde_json::to_string_pretty(&comp).unwrap();
        assert!(s.contains("\"type\": \"image\""));
        let de: Composition = serde_json::from_str(&s).unwrap();
        assert_eq!(de.tracks.len(), 1);
        assert_eq!(de.tracks[0].items[0].id, "a");
    }

    #[test]
    fn trim_start_is_an_input_alias_for_source_start() {
        let json = serde_json::json!({
            "id": "v",
            "from": 0,
            "duration_in_frames": 30,
            "type": "video",
            "src": "clip.mp4",
            "trim_start": 12,
            "source_end": 300,
            "source_duration": 300,
        });
        let item: TimelineItem = serde_json::from_value(json).unwrap();
        assert_eq!(item.media().unwrap().source_start, 12);
    }

    #[test]
    fn validate_rejects_zero_duration() {
        let mut comp = basic_comp();
        comp.duration_in_frames = 0;
        assert!(comp.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_source_window() {
        let mut comp = basic_comp();
        let mut m = media_item("clip.mp4", 0, 300);
        m.source_start = 200;
        m.source_end = 100;
        comp.tracks[0]
            .items
            .push(item("v", 0, 30, ItemKind::Video(m)));
        // Give the new item its own track so overlap checks do not fire first.
        let moved = comp.tracks[0].items.pop().unwrap();
        comp.tracks.push(track("t2", 1, vec![moved]));
        assert!(comp.validate().is_err());
    }

    #[test]
    fn overlap_requires_linking_transition() {
        let mut comp = basic_comp();
        comp.tracks[0]
            .items
            .push(item("b", 100, 40, image_item()));
        assert!(comp.validate().is_err());

        comp.transitions.push(Transition {
            id: "tr".to_string(),
            track_id: "t1".to_string(),
            left_clip_id: "a".to_string(),
            right_clip_id: "b".to_string(),
            presentation: TransitionPresentation::Fade,
            direction: None,
            duration_in_frames: 20,
            alignment: 0.5,
            timing: Easing::Linear,
            bezier_points: None,
        });
        assert!(comp.validate().is_ok());
    }

    #[test]
    fn transition_must_be_shorter_than_both_clips() {
        let mut comp = basic_comp();
        comp.tracks[0].items.push(item("b", 110, 12, image_item()));
        comp.transitions.push(Transition {
            id: "tr".to_string(),
            track_id: "t1".to_string(),
            left_clip_id: "a".to_string(),
            right_clip_id: "b".to_string(),
            presentation: TransitionPresentation::Fade,
            direction: None,
            duration_in_frames: 12,
            alignment: 0.5,
            timing: Easing::Linear,
            bezier_points: None,
        });
        assert!(comp.validate().is_err());
    }
}
