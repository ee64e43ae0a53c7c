use std::collections::BTreeMap;

use crate::{
    core::{Canvas, Fps, FrameRange, parse_hex_rgba},
    error::{MontageError, MontageResult},
    keyframe::interpolate_at,
    model::{Composition, ItemKeyframes, Keyframe, Property, PropertyKeyframes, TimelineItem},
};

/// A composition normalized for rendering: in/out markers applied, split-clip
/// keyframes inherited and re-based, tracks ordered back-to-front.
#[derive(Clone, Debug)]
pub struct ResolvedComposition {
    pub fps: Fps,
    pub canvas: Canvas,
    pub background_color: [u8; 4],
    pub duration_in_frames: u64,
    /// Sorted by `order` descending: iteration renders bottom first.
    pub tracks: Vec<ResolvedTrack>,
    pub transitions: Vec<crate::model::Transition>,
    pub keyframes: Vec<ItemKeyframes>,
}

#[derive(Clone, Debug)]
pub struct ResolvedTrack {
    pub id: String,
    pub order: i32,
    pub visible: bool,
    pub muted: bool,
    pub items: Vec<TimelineItem>,
}

/// Normalize `comp`, optionally restricted to the `[in_point, out_point)`
/// export range.
#[tracing::instrument(skip(comp))]
pub fn resolve(
    comp: &Composition,
    range: Option<FrameRange>,
) -> MontageResult<ResolvedComposition> {
    comp.validate()?;
    if let Some(window) = range
        && window.is_empty()
    {
        return Err(MontageError::validation("export range must be non-empty"));
    }

    // Stable per-origin-group source starts, taken from the composition
    // before any range trimming.
    let group_min_source_start = origin_group_min_source_start(comp);

    // Pre-trim source offsets, needed for split-offset math below.
    let mut authored_source_start: BTreeMap<String, u64> = BTreeMap::new();
    for track in &comp.tracks {
        for item in &track.items {
            if let Some(media) = item.media() {
                authored_source_start.insert(item.id.clone(), media.source_start);
            }
        }
    }

    let mut io_offsets: BTreeMap<String, u64> = BTreeMap::new();
    let mut tracks = Vec::<ResolvedTrack>::with_capacity(comp.tracks.len());
    for track in &comp.tracks {
        let mut items = Vec::<TimelineItem>::new();
        for item in &track.items {
            let Some((shifted, start_trim)) = apply_range(item, range) else {
                continue;
            };
            io_offsets.insert(shifted.id.clone(), start_trim);
            items.push(shifted);
        }
        items.sort_by(|a, b| (a.from, &a.id).cmp(&(b.from, &b.id)));
        tracks.push(ResolvedTrack {
            id: track.id.clone(),
            order: track.order,
            visible: track.visible,
            muted: track.muted,
            items,
        });
    }

    // Highest order renders first (furthest behind).
    tracks.sort_by(|a, b| b.order.cmp(&a.order));

    let kept_ids: BTreeMap<&str, ()> = tracks
        .iter()
        .flat_map(|t| t.items.iter().map(|i| (i.id.as_str(), ())))
        .collect();
    let transitions: Vec<_> = comp
        .transitions
        .iter()
        .filter(|t| {
            kept_ids.contains_key(t.left_clip_id.as_str())
                && kept_ids.contains_key(t.right_clip_id.as_str())
        })
        .cloned()
        .collect();

    let mut keyframes = Vec::<ItemKeyframes>::new();
    for track in &tracks {
        for item in &track.items {
            let io_offset = io_offsets.get(&item.id).copied().unwrap_or(0) as i64;
            let split_offset =
                split_offset_frames(item, &authored_source_start, &group_min_source_start);
            if let Some(resolved) =
                resolve_item_keyframes(comp, item, split_offset + io_offset)
            {
                keyframes.push(resolved);
            }
        }
    }

    let duration_in_frames = match range {
        Some(window) => window.len_frames(),
        None => {
            let content_end = comp
                .tracks
                .iter()
                .flat_map(|t| t.items.iter().map(TimelineItem::end))
                .max()
                .unwrap_or(0);
            content_end.max(u64::from(comp.fps.0))
        }
    };

    Ok(ResolvedComposition {
        fps: comp.fps,
        canvas: Canvas {
            width: comp.width,
            height: comp.height,
        },
        background_color: parse_hex_rgba(&comp.background_color)?,
        duration_in_frames,
        tracks,
        transitions,
        keyframes,
    })
}

/// Intersect the item with the export range, shifting it to the new timeline
/// origin. Returns the shifted item and the number of timeline frames trimmed
/// from its start (the IO-marker offset).
fn apply_range(item: &TimelineItem, range: Option<FrameRange>) -> Option<(TimelineItem, u64)> {
    let Some(window) = range else {
        return Some((item.clone(), 0));
    };
    let kept = item.range().intersect(window)?;

    let start_trim = kept.start.0 - item.from;
    let mut shifted = item.clone();
    shifted.from = item.from.saturating_sub(window.start.0);
    shifted.duration_in_frames = kept.len_frames();

    if start_trim > 0
        && let Some(media) = shifted_media_mut(&mut shifted)
    {
        let source_trim = (start_trim as f64 * media.speed).round() as u64;
        media.source_start = (media.source_start + source_trim).min(media.source_end);
    }

    Some((shifted, start_trim))
}

fn shifted_media_mut(item: &mut TimelineItem) -> Option<&mut crate::model::MediaItem> {
    match &mut item.kind {
        crate::model::ItemKind::Video(m) | crate::model::ItemKind::Audio(m) => Some(m),
        _ => None,
    }
}

/// Minimum authored `source_start` per origin group (the parent clip plus all
/// split children referencing it).
fn origin_group_min_source_start(comp: &Composition) -> BTreeMap<String, u64> {
    let mut min: BTreeMap<String, u64> = BTreeMap::new();
    for track in &comp.tracks {
        for item in &track.items {
            let Some(media) = item.media() else { continue };
            let key = item.origin_id.clone().unwrap_or_else(|| item.id.clone());
            min.entry(key)
                .and_modify(|m| *m = (*m).min(media.source_start))
                .or_insert(media.source_start);
        }
    }
    min
}

/// Timeline-frame distance between this clip's authored source offset and the
/// earliest offset in its origin group.
fn split_offset_frames(
    item: &TimelineItem,
    authored_source_start: &BTreeMap<String, u64>,
    group_min: &BTreeMap<String, u64>,
) -> i64 {
    if item.media().is_none() {
        return 0;
    }
    let key = item.origin_id.as_deref().unwrap_or(item.id.as_str());
    let Some(&min) = group_min.get(key) else {
        return 0;
    };
    let authored = authored_source_start
        .get(&item.id)
        .copied()
        .unwrap_or(min);
    let speed = item.speed().max(f64::MIN_POSITIVE);
    (((authored.saturating_sub(min)) as f64) / speed).round() as i64
}

/// Resolve the keyframe set of one kept item: direct entry, or inheritance
/// from the split parent (opacity excluded), then shift by `total_offset`.
fn resolve_item_keyframes(
    comp: &Composition,
    item: &TimelineItem,
    total_offset: i64,
) -> Option<ItemKeyframes> {
    let direct = comp.keyframes.iter().find(|k| k.item_id == item.id);
    let (source, inherited) = match direct {
        Some(set) => (set, false),
        None => {
            let origin = item.origin_id.as_deref()?;
            let parent = comp.keyframes.iter().find(|k| k.item_id == origin)?;
            (parent, true)
        }
    };

    let mut properties = Vec::<PropertyKeyframes>::new();
    for prop in &source.properties {
        // Sibling splits never inherit the parent's opacity animation.
        if inherited && prop.property == Property::Opacity {
            continue;
        }
        if let Some(shifted) = shift_keyframes(&prop.keyframes, total_offset) {
            properties.push(PropertyKeyframes {
                property: prop.property,
                keyframes: shifted,
            });
        }
    }

    if properties.is_empty() {
        return None;
    }
    Some(ItemKeyframes {
        item_id: item.id.clone(),
        properties,
    })
}

/// Shift keyframes by `-offset`. Keys landing at/after frame 0 survive as-is;
/// when the shift pushes the whole track before 0 the last key is pinned to 0;
/// when keys straddle 0 a keyframe is synthesized at 0 carrying the pre-shift
/// value at `offset` and the nearest preceding easing.
fn shift_keyframes(keys: &[Keyframe], offset: i64) -> Option<Vec<Keyframe>> {
    if keys.is_empty() {
        return None;
    }

    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|k| k.frame);

    if offset == 0 {
        return Some(sorted);
    }

    let shifted: Vec<Keyframe> = sorted
        .iter()
        .map(|k| Keyframe {
            frame: k.frame - offset,
            ..*k
        })
        .collect();

    let first_kept = shifted.iter().position(|k| k.frame >= 0);
    match first_kept {
        None => {
            // Everything is now before the item: hold the final value.
            let mut last = *shifted.last()?;
            last.frame = 0;
            Some(vec![last])
        }
        Some(0) => Some(shifted),
        Some(idx) => {
            let mut out = Vec::with_capacity(shifted.len() - idx + 1);
            if shifted[idx].frame > 0 {
                let before = &sorted[idx - 1];
                out.push(Keyframe {
                    frame: 0,
                    value: interpolate_at(&sorted, offset, before.value),
                    easing: before.easing,
                    easing_config: before.easing_config,
                });
            }
            out.extend_from_slice(&shifted[idx..]);
            Some(out)
        }
    }
}
