//! Per-frame compositor: track ordering, item rendering, adjustment-layer
//! effects, occlusion culling, masks, transitions and sub-composition
//! recursion.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::{
    composite::over_in_place,
    core::{Canvas, Rgba8Premul},
    effects::{ResolvedEffect, apply_effects, resolve_effects},
    error::{MontageError, MontageResult},
    keyframe::{KeyframeMap, animated_transform},
    mask::{MaskLayer, apply_masks, mask_layer_for},
    media::{AnimatedImage, DecodedFrame, FontProvider, MediaStore, VideoFrameReader},
    model::{CompositionLibrary, ItemKind, TimelineItem},
    raster::Raster,
    resolve::{ResolvedComposition, resolve},
    surface::{Surface, SurfacePool},
    transition::{TransitionIndex, TransitionWindow},
    transition_render::{TransitionFrame, TransitionRegistry},
};

/// Recursion budgets for nested compositions.
const MAX_SUB_DEPTH: usize = 8;
const MAX_SUB_FRAMES: u64 = 200_000;

/// One composition prepared for per-frame evaluation.
pub struct Scene {
    pub resolved: ResolvedComposition,
    pub keyframes: KeyframeMap,
    pub transitions: TransitionIndex,
}

impl Scene {
    pub fn prepare(resolved: ResolvedComposition) -> Self {
        let keyframes = KeyframeMap::build(&resolved.keyframes);
        let transitions = TransitionIndex::plan(&resolved);
        Self {
            resolved,
            keyframes,
            transitions,
        }
    }
}

/// Transient per-render state: caches, pools and media handles. Created at
/// render start, owned by the single render task, dropped on completion or
/// cancellation.
pub struct RenderCtx<'a> {
    media: &'a dyn MediaStore,
    fonts: &'a dyn FontProvider,
    raster: Raster,
    pools: HashMap<(u32, u32), SurfacePool>,
    video_readers: HashMap<String, Box<dyn VideoFrameReader>>,
    image_cache: HashMap<String, Arc<DecodedFrame>>,
    animated_cache: HashMap<String, Option<Arc<AnimatedImage>>>,
    failed_media: BTreeSet<String>,
    sub_frames_rendered: u64,
}

impl<'a> RenderCtx<'a> {
    pub fn new(media: &'a dyn MediaStore, fonts: &'a dyn FontProvider) -> Self {
        Self {
            media,
            fonts,
            raster: Raster::new(),
            pools: HashMap::new(),
            video_readers: HashMap::new(),
            image_cache: HashMap::new(),
            animated_cache: HashMap::new(),
            failed_media: BTreeSet::new(),
            sub_frames_rendered: 0,
        }
    }

    fn take_pool(&mut self, canvas: Canvas) -> SurfacePool {
        self.pools
            .remove(&(canvas.width, canvas.height))
            .unwrap_or_else(|| SurfacePool::new(canvas.width, canvas.height))
    }

    fn put_pool(&mut self, canvas: Canvas, pool: SurfacePool) {
        self.pools.insert((canvas.width, canvas.height), pool);
    }

    /// Warn once per source, then treat the item as blank (local recovery).
    fn note_media_failure(&mut self, src: &str, err: &MontageError) {
        if self.failed_media.insert(src.to_string()) {
            tracing::warn!(
                target: "montage::compositor",
                "media unavailable for '{src}', rendering blank: {err}"
            );
        }
    }

    fn static_image(&mut self, src: &str) -> Option<Arc<DecodedFrame>> {
        if let Some(hit) = self.image_cache.get(src) {
            return Some(hit.clone());
        }
        let decoded = self
            .media
            .fetch_bytes(src)
            .and_then(|bytes| crate::media::decode_image(&bytes));
        match decoded {
            Ok(frame) => {
                let frame = Arc::new(frame);
                self.image_cache.insert(src.to_string(), frame.clone());
                Some(frame)
            }
            Err(e) => {
                self.note_media_failure(src, &e);
                None
            }
        }
    }

    fn animated_image(&mut self, src: &str) -> Option<Arc<AnimatedImage>> {
        if let Some(hit) = self.animated_cache.get(src) {
            return hit.clone();
        }
        let decoded = self
            .media
            .fetch_bytes(src)
            .and_then(|bytes| crate::media::decode_animated(&bytes));
        let entry = match decoded {
            Ok(Some(anim)) => Some(Arc::new(anim)),
            Ok(None) => None,
            Err(e) => {
                self.note_media_failure(src, &e);
                None
            }
        };
        self.animated_cache.insert(src.to_string(), entry.clone());
        entry
    }

    fn video_frame(&mut self, src: &str, timestamp_s: f64) -> Option<Arc<DecodedFrame>> {
        if !self.video_readers.contains_key(src) {
            match self.media.create_video_frame_reader(src) {
                Ok(reader) => {
                    self.video_readers.insert(src.to_string(), reader);
                }
                Err(e) => {
                    self.note_media_failure(src, &e);
                    return None;
                }
            }
        }
        let reader = self.video_readers.get_mut(src)?;
        match reader.read_frame(timestamp_s) {
            Ok(frame) => frame,
            Err(e) => {
                let msg = MontageError::media(e.to_string());
                self.note_media_failure(src, &msg);
                None
            }
        }
    }
}

/// Compositor over a prepared scene tree (root plus sub-compositions).
pub struct Compositor<'a> {
    ctx: RenderCtx<'a>,
    root: Scene,
    subs: BTreeMap<String, Scene>,
}

impl<'a> Compositor<'a> {
    pub fn new(
        resolved: ResolvedComposition,
        library: &CompositionLibrary,
        media: &'a dyn MediaStore,
        fonts: &'a dyn FontProvider,
    ) -> MontageResult<Self> {
        let root = Scene::prepare(resolved);
        let mut subs = BTreeMap::new();
        collect_sub_scenes(&root, library, &mut subs, 0)?;
        Ok(Self {
            ctx: RenderCtx::new(media, fonts),
            root,
            subs,
        })
    }

    pub fn canvas(&self) -> Canvas {
        self.root.resolved.canvas
    }

    pub fn duration_in_frames(&self) -> u64 {
        self.root.resolved.duration_in_frames
    }

    pub fn fps(&self) -> crate::core::Fps {
        self.root.resolved.fps
    }

    /// Audio segments of the whole scene tree, in root timeline frames.
    pub fn audio_segments(&self) -> Vec<crate::audio::AudioSegment> {
        crate::audio::extract_segments(&self.root, &self.subs)
    }

    /// Render root frame `frame` into `out` (which must match the root
    /// canvas size).
    #[tracing::instrument(skip(self, out))]
    pub fn render_frame(&mut self, frame: u64, out: &mut Surface) -> MontageResult<()> {
        render_scene(&mut self.ctx, &self.root, &self.subs, frame, out, 0)
    }
}

fn referenced_sub_ids(resolved: &ResolvedComposition) -> Vec<String> {
    let mut ids = Vec::new();
    for track in &resolved.tracks {
        for item in &track.items {
            if let ItemKind::Composition(c) = &item.kind {
                ids.push(c.composition_id.clone());
            }
        }
    }
    ids
}

fn collect_sub_scenes(
    root: &Scene,
    library: &CompositionLibrary,
    subs: &mut BTreeMap<String, Scene>,
    depth: usize,
) -> MontageResult<()> {
    let mut queue: Vec<(String, usize)> = referenced_sub_ids(&root.resolved)
        .into_iter()
        .map(|id| (id, depth + 1))
        .collect();

    while let Some((id, level)) = queue.pop() {
        if level >= MAX_SUB_DEPTH {
            return Err(MontageError::evaluation(format!(
                "sub-composition nesting exceeds depth budget of {MAX_SUB_DEPTH}"
            )));
        }
        if subs.contains_key(&id) {
            continue;
        }
        let comp = library.get(&id).ok_or_else(|| {
            MontageError::validation(format!("unknown sub-composition '{id}'"))
        })?;
        let scene = Scene::prepare(resolve(comp, None)?);
        for child in referenced_sub_ids(&scene.resolved) {
            queue.push((child, level + 1));
        }
        subs.insert(id, scene);
    }
    Ok(())
}

/// Adjustment-layer effects stacked above an item, plus the item's own.
fn combined_effects(
    scene: &Scene,
    item: &TimelineItem,
    item_track_order: i32,
    frame: u64,
) -> MontageResult<Vec<ResolvedEffect>> {
    let mut adjustment: Vec<(i32, Vec<ResolvedEffect>)> = Vec::new();
    for track in &scene.resolved.tracks {
        if !track.visible || track.order >= item_track_order {
            continue;
        }
        for adj in &track.items {
            if matches!(adj.kind, ItemKind::Adjustment(_)) && adj.is_active_at(frame) {
                adjustment.push((track.order, resolve_effects(&adj.effects)?));
            }
        }
    }
    adjustment.sort_by_key(|(order, _)| *order);

    let mut out: Vec<ResolvedEffect> = adjustment.into_iter().flat_map(|(_, e)| e).collect();
    out.extend(resolve_effects(&item.effects)?);
    Ok(out)
}

/// Opacity multiplier from the item's fade-in/fade-out edges.
fn fade_opacity(item: &TimelineItem, local: u64) -> f64 {
    let mut m = 1.0;
    if item.fade_in > 0 && local < item.fade_in {
        m *= (local + 1) as f64 / item.fade_in as f64;
    }
    let remaining = item.duration_in_frames.saturating_sub(local);
    if item.fade_out > 0 && remaining <= item.fade_out {
        m *= remaining as f64 / item.fade_out as f64;
    }
    m
}

fn scale_opacity(surface: &mut Surface, opacity: f64) {
    let q = ((opacity.clamp(0.0, 1.0) * 255.0).round() as i32).clamp(0, 255) as u16;
    if q == 255 {
        return;
    }
    for px in surface.data_mut().chunks_exact_mut(4) {
        for c in 0..4 {
            px[c] = crate::composite::mul_div255(u16::from(px[c]), q);
        }
    }
}

/// Collect active masks for this scene at `frame`.
fn collect_masks(scene: &Scene, frame: u64) -> Vec<MaskLayer> {
    let mut out = Vec::new();
    for track in &scene.resolved.tracks {
        if !track.visible {
            continue;
        }
        for item in &track.items {
            if !item.is_active_at(frame) {
                continue;
            }
            let ItemKind::Shape(shape) = &item.kind else {
                continue;
            };
            if !shape.is_mask {
                continue;
            }
            let local = (frame - item.from) as f64;
            let tr = animated_transform(item, &scene.keyframes, local, scene.resolved.canvas);
            out.push(mask_layer_for(shape, &tr));
        }
    }
    out
}

/// Scan tracks top-to-bottom for the first fully occluding item; tracks behind
/// it can be skipped. Disabled while any mask is active.
fn occlusion_cutoff(
    scene: &Scene,
    frame: u64,
    excluded: &BTreeSet<&str>,
) -> MontageResult<Option<i32>> {
    for track in scene.resolved.tracks.iter().rev() {
        if !track.visible {
            continue;
        }
        for item in &track.items {
            if !item.is_active_at(frame) || excluded.contains(item.id.as_str()) {
                continue;
            }
            if !matches!(item.kind, ItemKind::Video(_) | ItemKind::Image(_)) {
                continue;
            }
            let local = frame - item.from;
            let tr = animated_transform(
                item,
                &scene.keyframes,
                local as f64,
                scene.resolved.canvas,
            );
            if tr.opacity * fade_opacity(item, local) < 1.0 {
                continue;
            }
            if !tr.is_axis_aligned() || tr.corner_radius > 0.0 {
                continue;
            }
            if !tr.covers_canvas(scene.resolved.canvas) {
                continue;
            }
            let effects = combined_effects(scene, item, track.order, frame)?;
            if effects.iter().any(ResolvedEffect::introduces_transparency) {
                continue;
            }
            return Ok(Some(track.order));
        }
    }
    Ok(None)
}

fn render_scene(
    ctx: &mut RenderCtx<'_>,
    scene: &Scene,
    subs: &BTreeMap<String, Scene>,
    frame: u64,
    out: &mut Surface,
    depth: usize,
) -> MontageResult<()> {
    let canvas = scene.resolved.canvas;
    let bg = scene.resolved.background_color;
    out.fill(Rgba8Premul::from_straight_rgba(bg[0], bg[1], bg[2], bg[3]).to_array());

    let masks = collect_masks(scene, frame);
    let excluded = scene.transitions.excluded_clip_ids(frame);

    let cutoff = if masks.is_empty() {
        occlusion_cutoff(scene, frame, &excluded)?
    } else {
        None
    };

    let mut pool = ctx.take_pool(canvas);
    let result = render_scene_content(
        ctx, scene, subs, frame, out, depth, &masks, &excluded, cutoff, &mut pool,
    );
    ctx.put_pool(canvas, pool);
    result
}

#[allow(clippy::too_many_arguments)]
fn render_scene_content(
    ctx: &mut RenderCtx<'_>,
    scene: &Scene,
    subs: &BTreeMap<String, Scene>,
    frame: u64,
    out: &mut Surface,
    depth: usize,
    masks: &[MaskLayer],
    excluded: &BTreeSet<&str>,
    cutoff: Option<i32>,
    pool: &mut SurfacePool,
) -> MontageResult<()> {
    let mut content = pool.acquire()?;

    for track in &scene.resolved.tracks {
        if !track.visible {
            continue;
        }
        if let Some(limit) = cutoff
            && track.order > limit
        {
            continue;
        }

        for item in &track.items {
            if !item.is_active_at(frame)
                || excluded.contains(item.id.as_str())
                || item.is_mask_shape()
                || matches!(item.kind, ItemKind::Audio(_) | ItemKind::Adjustment(_))
            {
                continue;
            }
            if let Some((surface, opacity)) = render_item(
                ctx,
                scene,
                subs,
                item,
                track.order,
                frame,
                depth,
                None,
                pool,
            )? {
                over_in_place(content.data_mut(), surface.data(), opacity as f32)?;
                pool.release(surface);
            }
        }

        let windows: Vec<&TransitionWindow> =
            scene.transitions.active_on_track(&track.id, frame).collect();
        for window in windows {
            render_transition(ctx, scene, subs, window, track.order, frame, depth, &mut content, pool)?;
        }
    }

    if masks.is_empty() {
        over_in_place(out.data_mut(), content.data(), 1.0)?;
    } else {
        apply_masks(&mut content, masks, &mut ctx.raster, pool)?;
        over_in_place(out.data_mut(), content.data(), 1.0)?;
    }

    pool.release(content);
    Ok(())
}

/// Render one item to its own surface with effects applied. Returns `None`
/// when the item contributes nothing this frame (out of source range, missing
/// media, zero box).
#[allow(clippy::too_many_arguments)]
fn render_item(
    ctx: &mut RenderCtx<'_>,
    scene: &Scene,
    subs: &BTreeMap<String, Scene>,
    item: &TimelineItem,
    track_order: i32,
    frame: u64,
    depth: usize,
    source_frame_override: Option<f64>,
    pool: &mut SurfacePool,
) -> MontageResult<Option<(Surface, f64)>> {
    let local = frame.saturating_sub(item.from);
    let tr = animated_transform(item, &scene.keyframes, local as f64, scene.resolved.canvas);
    let opacity = tr.opacity * fade_opacity(item, local.min(item.duration_in_frames));
    if opacity <= 0.0 || tr.width <= 0.0 || tr.height <= 0.0 {
        return Ok(None);
    }

    let mut surface = pool.acquire()?;
    let fps = scene.resolved.fps;

    match &item.kind {
        ItemKind::Image(image) => {
            let t_ms = (local as f64 * 1000.0 / fps.as_f64()).round() as u64;
            let frame_data = match ctx.animated_image(&image.src) {
                Some(anim) => anim.frame_at_ms(t_ms).cloned(),
                None => ctx.static_image(&image.src),
            };
            match frame_data {
                Some(decoded) => ctx.raster.draw_frame(&mut surface, &decoded, &tr, pool)?,
                None => {
                    pool.release(surface);
                    return Ok(None);
                }
            }
        }
        ItemKind::Video(media) => {
            let source_frame = match source_frame_override {
                Some(f) => f,
                None => media.source_start as f64 + local as f64 * media.speed,
            };
            let clamped = source_frame.clamp(0.0, media.source_duration as f64);
            let timestamp_s = clamped / fps.as_f64();
            match ctx.video_frame(&media.src, timestamp_s) {
                Some(decoded) => ctx.raster.draw_frame(&mut surface, &decoded, &tr, pool)?,
                None => {
                    pool.release(surface);
                    return Ok(None);
                }
            }
        }
        ItemKind::Text(text) => {
            let fonts = ctx.fonts;
            if let Err(e) = ctx.raster.draw_text(&mut surface, text, &tr, fonts, pool) {
                ctx.note_media_failure(&text.font_family, &e);
                pool.release(surface);
                return Ok(None);
            }
        }
        ItemKind::Shape(shape) => {
            ctx.raster.draw_shape(&mut surface, shape, &tr, pool)?;
        }
        ItemKind::Composition(comp_item) => {
            let sub = subs.get(&comp_item.composition_id).ok_or_else(|| {
                MontageError::evaluation(format!(
                    "sub-composition '{}' missing from scene set",
                    comp_item.composition_id
                ))
            })?;
            let sub_local = local as i64 - comp_item.source_start as i64;
            if sub_local < 0 || (sub_local as u64) >= sub.resolved.duration_in_frames {
                pool.release(surface);
                return Ok(None);
            }
            if depth + 1 >= MAX_SUB_DEPTH {
                return Err(MontageError::evaluation(
                    "sub-composition nesting exceeds depth budget",
                ));
            }
            ctx.sub_frames_rendered += 1;
            if ctx.sub_frames_rendered > MAX_SUB_FRAMES {
                return Err(MontageError::evaluation(
                    "sub-composition frame budget exhausted",
                ));
            }

            let sub_canvas = sub.resolved.canvas;
            let mut offscreen = Surface::new(sub_canvas.width, sub_canvas.height)?;
            render_scene(ctx, sub, subs, sub_local as u64, &mut offscreen, depth + 1)?;
            let decoded = DecodedFrame {
                width: sub_canvas.width,
                height: sub_canvas.height,
                rgba8_premul: offscreen.data().to_vec(),
            };
            ctx.raster.draw_frame(&mut surface, &decoded, &tr, pool)?;
        }
        ItemKind::Audio(_) | ItemKind::Adjustment(_) => {
            pool.release(surface);
            return Ok(None);
        }
    }

    let effects = combined_effects(scene, item, track_order, frame)?;
    if !effects.is_empty() {
        apply_effects(&mut surface, pool, &effects, frame)?;
    }

    Ok(Some((surface, opacity)))
}

/// Render both participating clips and blend them with the window's
/// presentation renderer.
#[allow(clippy::too_many_arguments)]
fn render_transition(
    ctx: &mut RenderCtx<'_>,
    scene: &Scene,
    subs: &BTreeMap<String, Scene>,
    window: &TransitionWindow,
    track_order: i32,
    frame: u64,
    depth: usize,
    content: &mut Surface,
    pool: &mut SurfacePool,
) -> MontageResult<()> {
    let left = find_scene_item(scene, &window.transition.left_clip_id);
    let right = find_scene_item(scene, &window.transition.right_clip_id);
    let (Some(left), Some(right)) = (left, right) else {
        return Ok(());
    };

    let duration = window.transition.duration_in_frames;

    // The left clip shows the last `duration` frames of its trimmed source;
    // the right clip starts half a window early so playback continues
    // smoothly past the cut. Missing handles clamp (freeze) inside the media
    // fetch below.
    let left_override = left.media().map(|m| {
        let k = frame.saturating_sub(window.start_frame) as f64;
        m.source_end as f64 - duration as f64 * m.speed + k * m.speed
    });
    let right_override = right.media().map(|m| {
        let local = frame as f64 - right.from as f64 - (duration / 2) as f64;
        m.source_start as f64 + local * m.speed
    });

    let outgoing = render_item(
        ctx,
        scene,
        subs,
        left,
        track_order,
        frame,
        depth,
        left_override,
        pool,
    )?;
    let incoming = render_item(
        ctx,
        scene,
        subs,
        right,
        track_order,
        frame.max(right.from),
        depth,
        right_override,
        pool,
    )?;

    let mut outgoing_surface = match outgoing {
        Some((mut s, opacity)) => {
            scale_opacity(&mut s, opacity);
            s
        }
        None => pool.acquire()?,
    };
    let mut incoming_surface = match incoming {
        Some((mut s, opacity)) => {
            scale_opacity(&mut s, opacity);
            s
        }
        None => pool.acquire()?,
    };

    let renderer = TransitionRegistry::global()
        .renderer(window.transition.presentation.name())
        .unwrap_or_else(|| {
            TransitionRegistry::global()
                .renderer("fade")
                .expect("fade renderer is built in")
        });

    renderer(
        content,
        &TransitionFrame {
            outgoing: &outgoing_surface,
            incoming: &incoming_surface,
            progress: window.progress(frame),
            direction: window.transition.direction,
        },
    )?;

    outgoing_surface.clear();
    incoming_surface.clear();
    pool.release(outgoing_surface);
    pool.release(incoming_surface);
    Ok(())
}

fn find_scene_item<'s>(scene: &'s Scene, id: &str) -> Option<&'s TimelineItem> {
    scene
        .resolved
        .tracks
        .iter()
        .flat_map(|t| t.items.iter())
        .find(|i| i.id == id)
}
