//! Walk the resolved timeline and produce the audio segments to decode and
//! mix: video audio expanded into transition windows, plain audio items, and
//! recursively flattened sub-composition audio.

use std::collections::BTreeMap;

use crate::{
    compositor::Scene,
    model::{ItemKind, Keyframe, MediaItem, Property, TimelineItem},
    transition::TransitionWindow,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Video,
    Audio,
}

/// One scheduled audio contribution, in root-timeline frames.
#[derive(Clone, Debug)]
pub struct AudioSegment {
    pub src: String,
    pub start_frame: u64,
    pub duration_frames: u64,
    /// Offset into the source, in source frames (already speed-adjusted).
    pub source_start_frame: f64,
    /// Static gain in dB (0 = unity); ignored when keyframes are present.
    pub volume_db: f64,
    pub fade_in_frames: u64,
    pub fade_out_frames: u64,
    pub use_equal_power_fades: bool,
    pub speed: f64,
    pub muted: bool,
    pub kind: SegmentKind,
    pub volume_keyframes: Option<Vec<Keyframe>>,
    /// The owning item's timeline start, for keyframe interpolation.
    pub item_from: i64,
}

impl AudioSegment {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.duration_frames
    }
}

/// Extract all audio segments of `scene` (and its sub-compositions).
pub fn extract_segments(scene: &Scene, subs: &BTreeMap<String, Scene>) -> Vec<AudioSegment> {
    let mut out = Vec::new();
    collect(scene, subs, 0, None, 0, &mut out);
    merge_continuous(&mut out);
    out
}

/// `offset` shifts child frames into root frames; `clip` restricts to a root
/// frame window.
fn collect(
    scene: &Scene,
    subs: &BTreeMap<String, Scene>,
    offset: i64,
    clip: Option<(u64, u64)>,
    depth: usize,
    out: &mut Vec<AudioSegment>,
) {
    if depth > 8 {
        return;
    }

    for track in &scene.resolved.tracks {
        if track.muted {
            continue;
        }
        for item in &track.items {
            match &item.kind {
                ItemKind::Video(media) => {
                    if media.muted || !track.visible {
                        continue;
                    }
                    let windows: Vec<&TransitionWindow> = scene
                        .transitions
                        .windows()
                        .iter()
                        .filter(|w| {
                            w.transition.left_clip_id == item.id
                                || w.transition.right_clip_id == item.id
                        })
                        .collect();
                    if let Some(seg) =
                        video_segment(scene, item, media, &windows, offset, clip)
                    {
                        out.push(seg);
                    }
                }
                ItemKind::Audio(media) => {
                    if media.muted {
                        continue;
                    }
                    if let Some(seg) = plain_segment(
                        scene,
                        item,
                        media,
                        SegmentKind::Audio,
                        offset,
                        clip,
                    ) {
                        out.push(seg);
                    }
                }
                ItemKind::Composition(comp_item) => {
                    let Some(sub) = subs.get(&comp_item.composition_id) else {
                        continue;
                    };
                    // Sub frame 0 sits at parent frame `from + source_start`.
                    let child_offset =
                        offset + item.from as i64 + comp_item.source_start as i64;
                    let window_start = (item.from as i64 + offset).max(0) as u64;
                    let window_end = (item.end() as i64 + offset).max(0) as u64;
                    let child_clip = intersect_clip(clip, (window_start, window_end));
                    if child_clip.0 < child_clip.1 {
                        collect(sub, subs, child_offset, Some(child_clip), depth + 1, out);
                    }
                }
                _ => {}
            }
        }
    }
}

fn intersect_clip(clip: Option<(u64, u64)>, window: (u64, u64)) -> (u64, u64) {
    match clip {
        None => window,
        Some((s, e)) => (s.max(window.0), e.min(window.1)),
    }
}

fn volume_keyframes_for(scene: &Scene, item_id: &str) -> Option<Vec<Keyframe>> {
    scene
        .keyframes
        .property(item_id, Property::Volume)
        .map(|k| k.to_vec())
}

/// A segment covering exactly the item's own range, with its fades.
fn plain_segment(
    scene: &Scene,
    item: &TimelineItem,
    media: &MediaItem,
    kind: SegmentKind,
    offset: i64,
    clip: Option<(u64, u64)>,
) -> Option<AudioSegment> {
    build_segment(
        scene,
        item,
        media,
        kind,
        item.from,
        item.end(),
        media.source_start as f64,
        item.fade_in,
        item.fade_out,
        false,
        offset,
        clip,
    )
}

/// A video item's segment, expanded into the transition windows it
/// participates in; the expanded edges use equal-power fades.
fn video_segment(
    scene: &Scene,
    item: &TimelineItem,
    media: &MediaItem,
    windows: &[&TransitionWindow],
    offset: i64,
    clip: Option<(u64, u64)>,
) -> Option<AudioSegment> {
    let mut start = item.from;
    let mut end = item.end();
    let mut source_start = media.source_start as f64;
    let mut fade_in = item.fade_in;
    let mut fade_out = item.fade_out;
    let mut equal_power = false;

    for w in windows {
        if w.transition.left_clip_id == item.id && w.end_frame > end {
            // Keep playing through the outgoing half, as far as the source
            // allows.
            let extension = w.end_frame - end;
            let available =
                ((media.source_duration as f64 - media.source_end as f64) / media.speed) as u64;
            let extension = extension.min(available);
            end += extension;
            if extension > 0 {
                fade_out = w.end_frame.saturating_sub(w.start_frame);
                equal_power = true;
            }
        }
        if w.transition.right_clip_id == item.id {
            // Audible only from the window start; fade in across the window.
            let audible_from = w.start_frame.max(item.from);
            if audible_from > start {
                source_start += (audible_from - start) as f64 * media.speed;
                start = audible_from;
            }
            fade_in = w.end_frame.saturating_sub(w.start_frame);
            equal_power = true;
        }
    }

    build_segment(
        scene,
        item,
        media,
        SegmentKind::Video,
        start,
        end,
        source_start,
        fade_in,
        fade_out,
        equal_power,
        offset,
        clip,
    )
}

#[allow(clippy::too_many_arguments)]
fn build_segment(
    scene: &Scene,
    item: &TimelineItem,
    media: &MediaItem,
    kind: SegmentKind,
    start: u64,
    end: u64,
    mut source_start: f64,
    fade_in: u64,
    fade_out: u64,
    use_equal_power_fades: bool,
    offset: i64,
    clip: Option<(u64, u64)>,
) -> Option<AudioSegment> {
    if end <= start {
        return None;
    }

    let mut abs_start = start as i64 + offset;
    let mut abs_end = end as i64 + offset;
    if let Some((clip_start, clip_end)) = clip {
        if abs_start < clip_start as i64 {
            source_start += (clip_start as i64 - abs_start) as f64 * media.speed;
            abs_start = clip_start as i64;
        }
        abs_end = abs_end.min(clip_end as i64);
    }
    if abs_start < 0 {
        source_start += (-abs_start) as f64 * media.speed;
        abs_start = 0;
    }
    if abs_end <= abs_start {
        return None;
    }

    Some(AudioSegment {
        src: media.src.clone(),
        start_frame: abs_start as u64,
        duration_frames: (abs_end - abs_start) as u64,
        source_start_frame: source_start,
        volume_db: media.volume,
        fade_in_frames: fade_in,
        fade_out_frames: fade_out,
        use_equal_power_fades,
        speed: media.speed,
        muted: media.muted,
        kind,
        volume_keyframes: volume_keyframes_for(scene, &item.id),
        item_from: item.from as i64 + offset,
    })
}

/// Merge consecutive segments from the same source when playback is
/// continuous across the junction.
fn merge_continuous(segments: &mut Vec<AudioSegment>) {
    segments.sort_by(|a, b| {
        (a.src.as_str(), a.start_frame).cmp(&(b.src.as_str(), b.start_frame))
    });

    let mut merged: Vec<AudioSegment> = Vec::with_capacity(segments.len());
    for seg in segments.drain(..) {
        if let Some(prev) = merged.last_mut()
            && can_merge(prev, &seg)
        {
            prev.duration_frames = seg.end_frame() - prev.start_frame;
            prev.fade_out_frames = seg.fade_out_frames;
            continue;
        }
        merged.push(seg);
    }
    *segments = merged;
}

fn can_merge(a: &AudioSegment, b: &AudioSegment) -> bool {
    if a.src != b.src
        || a.kind != b.kind
        || a.speed != b.speed
        || a.muted != b.muted
        || a.volume_db != b.volume_db
    {
        return false;
    }
    // Keyframed or fade-marked junctions cannot merge.
    if a.volume_keyframes.is_some() || b.volume_keyframes.is_some() {
        return false;
    }
    if a.use_equal_power_fades || b.use_equal_power_fades {
        return false;
    }
    if a.fade_out_frames > 0 || b.fade_in_frames > 0 {
        return false;
    }
    // Adjacent on the timeline (within 2 frames) and continuous in source.
    if b.start_frame < a.end_frame() || b.start_frame - a.end_frame() > 2 {
        return false;
    }
    let gap = (b.start_frame - a.end_frame()) as f64;
    let expected_source =
        a.source_start_frame + (a.duration_frames as f64 + gap) * a.speed;
    (expected_source - b.source_start_frame).abs() <= 2.0 * a.speed.max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::Scene;
    use crate::ease::Easing;
    use crate::model::{Transition, TransitionPresentation};
    use crate::resolve::resolve;
    use crate::test_support::{audio_item, comp, item, media_item, track};

    fn scene_of(c: &crate::model::Composition) -> Scene {
        Scene::prepare(resolve(c, None).unwrap())
    }

    fn no_subs() -> BTreeMap<String, Scene> {
        BTreeMap::new()
    }

    #[test]
    fn audio_item_emits_one_segment() {
        let c = comp(
            30,
            300,
            640,
            360,
            vec![track("t", 0, vec![item("a", 60, 90, audio_item("a.wav", 30, 9000))])],
        );
        let segs = extract_segments(&scene_of(&c), &no_subs());
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start_frame, 60);
        assert_eq!(segs[0].duration_frames, 90);
        assert_eq!(segs[0].source_start_frame, 30.0);
        assert_eq!(segs[0].kind, SegmentKind::Audio);
    }

    #[test]
    fn muted_track_contributes_nothing() {
        let mut c = comp(
            30,
            300,
            640,
            360,
            vec![track("t", 0, vec![item("a", 0, 90, audio_item("a.wav", 0, 9000))])],
        );
        c.tracks[0].muted = true;
        assert!(extract_segments(&scene_of(&c), &no_subs()).is_empty());
    }

    #[test]
    fn transition_expands_left_and_right_audio() {
        // S2 layout: A 0..90, B 60..180, 30-frame fade, alignment 0.5.
        let mut c = comp(
            30,
            300,
            640,
            360,
            vec![track(
                "t",
                0,
                vec![
                    item("a", 0, 90, crate::model::ItemKind::Video(media_item("a.mp4", 0, 3000))),
                    item("b", 60, 120, crate::model::ItemKind::Video(media_item("b.mp4", 0, 3000))),
                ],
            )],
        );
        // Leave tail room for A's extension.
        if let crate::model::ItemKind::Video(m) = &mut c.tracks[0].items[0].kind {
            m.source_end = 120;
        }
        c.transitions.push(Transition {
            id: "tr".to_string(),
            track_id: "t".to_string(),
            left_clip_id: "a".to_string(),
            right_clip_id: "b".to_string(),
            presentation: TransitionPresentation::Fade,
            direction: None,
            duration_in_frames: 30,
            alignment: 0.5,
            timing: Easing::Linear,
            bezier_points: None,
        });

        let segs = extract_segments(&scene_of(&c), &no_subs());
        assert_eq!(segs.len(), 2);
        let a = segs.iter().find(|s| s.src == "a.mp4").unwrap();
        let b = segs.iter().find(|s| s.src == "b.mp4").unwrap();

        // Window is 75..105; A extends to 105, B starts at 75.
        assert_eq!(a.end_frame(), 105);
        assert!(a.use_equal_power_fades);
        assert_eq!(a.fade_out_frames, 30);

        assert_eq!(b.start_frame, 75);
        assert_eq!(b.source_start_frame, 15.0);
        assert!(b.use_equal_power_fades);
        assert_eq!(b.fade_in_frames, 30);
    }

    #[test]
    fn continuous_split_segments_merge() {
        let c = comp(
            30,
            300,
            640,
            360,
            vec![track(
                "t",
                0,
                vec![
                    item("a1", 0, 60, audio_item("a.wav", 0, 9000)),
                    item("a2", 60, 60, audio_item("a.wav", 60, 9000)),
                ],
            )],
        );
        let segs = extract_segments(&scene_of(&c), &no_subs());
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start_frame, 0);
        assert_eq!(segs[0].duration_frames, 120);
    }

    #[test]
    fn discontinuous_source_does_not_merge() {
        let c = comp(
            30,
            300,
            640,
            360,
            vec![track(
                "t",
                0,
                vec![
                    item("a1", 0, 60, audio_item("a.wav", 0, 9000)),
                    item("a2", 60, 60, audio_item("a.wav", 600, 9000)),
                ],
            )],
        );
        let segs = extract_segments(&scene_of(&c), &no_subs());
        assert_eq!(segs.len(), 2);
    }

    #[test]
    fn sub_composition_segments_are_offset_and_clipped() {
        let sub = comp(
            30,
            120,
            640,
            360,
            vec![track("s", 0, vec![item("inner", 0, 120, audio_item("s.wav", 0, 9000))])],
        );
        let mut subs = BTreeMap::new();
        subs.insert("sub1".to_string(), scene_of(&sub));

        let holder = item(
            "holder",
            100,
            50,
            ItemKind::Composition(crate::model::CompositionItem {
                composition_id: "sub1".to_string(),
                source_start: 0,
            }),
        );
        let c = comp(30, 300, 640, 360, vec![track("t", 0, vec![holder])]);

        let segs = extract_segments(&scene_of(&c), &subs);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start_frame, 100);
        // Sub audio runs 120 frames but the holder clips it to 50.
        assert_eq!(segs[0].duration_frames, 50);
    }
}
