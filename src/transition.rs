use std::collections::BTreeSet;

use crate::{
    ease::EasingConfig,
    model::{ItemKind, TimelineItem, Transition},
    resolve::ResolvedComposition,
};

/// A planned transition: the frame interval it owns, the split around the cut
/// point, and how much spare source each side can contribute.
#[derive(Clone, Debug)]
pub struct TransitionWindow {
    pub transition: Transition,
    pub cut_point: u64,
    pub start_frame: u64,
    pub end_frame: u64,
    pub left_portion: u64,
    pub right_portion: u64,
    /// Source frames (timeline-scaled) available past the left clip's trim-out.
    pub left_handle: f64,
    /// Source frames (timeline-scaled) available before the right clip's trim-in.
    pub right_handle: f64,
}

impl TransitionWindow {
    pub fn contains(&self, frame: u64) -> bool {
        self.start_frame <= frame && frame < self.end_frame
    }

    /// Eased progress through the window at `frame`, in [0,1].
    pub fn progress(&self, frame: u64) -> f64 {
        let duration = self.transition.duration_in_frames;
        let denom = duration.saturating_sub(1).max(1) as f64;
        let t = ((frame.saturating_sub(self.start_frame)) as f64 / denom).clamp(0.0, 1.0);
        let config = self.transition.bezier_points.map(|points| EasingConfig {
            points: Some(points),
            ..EasingConfig::default()
        });
        self.transition.timing.apply(t, config.as_ref()).clamp(0.0, 1.0)
    }

    /// True when a side lacks the source material the window asks of it; the
    /// presentation renderer degrades to a mirror/freeze of what exists.
    pub fn left_handle_short(&self) -> bool {
        self.left_handle < self.right_portion as f64
    }

    pub fn right_handle_short(&self) -> bool {
        self.right_handle < self.left_portion as f64
    }
}

#[derive(Clone, Debug, Default)]
pub struct TransitionIndex {
    windows: Vec<TransitionWindow>,
}

impl TransitionIndex {
    pub fn plan(resolved: &ResolvedComposition) -> Self {
        let mut windows = Vec::new();
        for transition in &resolved.transitions {
            let Some(left) = find_item(resolved, &transition.left_clip_id) else {
                continue;
            };
            let Some(right) = find_item(resolved, &transition.right_clip_id) else {
                continue;
            };

            let duration = transition.duration_in_frames;
            let cut_point = left.end();
            let left_portion = (duration as f64 * transition.alignment.clamp(0.0, 1.0))
                .floor() as u64;
            let right_portion = duration - left_portion;

            windows.push(TransitionWindow {
                cut_point,
                start_frame: cut_point.saturating_sub(left_portion),
                end_frame: cut_point + right_portion,
                left_portion,
                right_portion,
                left_handle: tail_handle(left),
                right_handle: head_handle(right),
                transition: transition.clone(),
            });
        }
        windows.sort_by(|a, b| (a.start_frame, &a.transition.id).cmp(&(b.start_frame, &b.transition.id)));
        Self { windows }
    }

    pub fn windows(&self) -> &[TransitionWindow] {
        &self.windows
    }

    pub fn active_at(&self, frame: u64) -> impl Iterator<Item = &TransitionWindow> {
        self.windows.iter().filter(move |w| w.contains(frame))
    }

    pub fn active_on_track<'a>(
        &'a self,
        track_id: &'a str,
        frame: u64,
    ) -> impl Iterator<Item = &'a TransitionWindow> {
        self.active_at(frame)
            .filter(move |w| w.transition.track_id == track_id)
    }

    /// Clip ids excluded from the normal per-item path at `frame`; they render
    /// through the transition compositor instead.
    pub fn excluded_clip_ids(&self, frame: u64) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for w in self.active_at(frame) {
            out.insert(w.transition.left_clip_id.as_str());
            out.insert(w.transition.right_clip_id.as_str());
        }
        out
    }
}

fn find_item<'a>(resolved: &'a ResolvedComposition, id: &str) -> Option<&'a TimelineItem> {
    resolved
        .tracks
        .iter()
        .flat_map(|t| t.items.iter())
        .find(|i| i.id == id)
}

/// Unused source media past the clip's trim-out, in timeline frames.
fn tail_handle(item: &TimelineItem) -> f64 {
    match &item.kind {
        ItemKind::Video(m) => {
            (m.source_duration.saturating_sub(m.source_end)) as f64 / m.speed.max(f64::MIN_POSITIVE)
        }
        ItemKind::Audio(_) => 0.0,
        _ => f64::INFINITY,
    }
}

/// Unused source media before the clip's trim-in, in timeline frames.
fn head_handle(item: &TimelineItem) -> f64 {
    match &item.kind {
        ItemKind::Video(m) => m.source_start as f64 / m.speed.max(f64::MIN_POSITIVE),
        ItemKind::Audio(_) => 0.0,
        _ => f64::INFINITY,
    }
}
