//! Render orchestrator: validates, resolves, mixes audio, drives the
//! compositor frame-by-frame into an encoder, reports progress and honors
//! cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    audio::mix_segments,
    composite::flatten_over_background,
    compositor::Compositor,
    core::{FrameRange, parse_hex_rgba},
    encode::{Encoder, EncoderConfig, ExportSettings, VideoSample},
    error::{MontageError, MontageResult},
    media::{FontProvider, MediaStore},
    model::{Composition, CompositionLibrary},
    resolve::resolve,
    surface::Surface,
};

/// Caller-initiated cancellation. Checked at every frame boundary and at the
/// encoder suspension points.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderPhase {
    Preparing,
    Rendering,
    Encoding,
    Finalizing,
}

#[derive(Clone, Debug)]
pub struct RenderProgress {
    pub phase: RenderPhase,
    /// 0..100.
    pub progress: f64,
    pub current_frame: Option<u64>,
    pub total_frames: Option<u64>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct RenderOptions {
    /// `None` renders mp4 at the composition's own resolution and fps.
    pub settings: Option<ExportSettings>,
    /// Optional `[in_point, out_point)` export range in timeline frames.
    pub range: Option<FrameRange>,
    pub cancel: CancellationToken,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            settings: None,
            range: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenderResult {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration_seconds: f64,
    pub byte_size: u64,
}

pub type ProgressFn<'a> = dyn FnMut(RenderProgress) + 'a;

/// Render `comp` into `encoder` and return the finalized container bytes.
#[tracing::instrument(skip_all, fields(range = ?options.range))]
pub fn render(
    comp: &Composition,
    library: &CompositionLibrary,
    media: &dyn MediaStore,
    fonts: &dyn FontProvider,
    encoder: &mut dyn Encoder,
    options: &RenderOptions,
    mut on_progress: Option<&mut ProgressFn<'_>>,
) -> MontageResult<RenderResult> {
    let mut emit = |p: RenderProgress| {
        if let Some(cb) = on_progress.as_deref_mut() {
            cb(p);
        }
    };

    emit(RenderProgress {
        phase: RenderPhase::Preparing,
        progress: 0.0,
        current_frame: None,
        total_frames: None,
        message: "resolving composition".to_string(),
    });

    let resolved = resolve(comp, options.range)?;
    let canvas = resolved.canvas;
    let fps = resolved.fps;
    let total_frames = resolved.duration_in_frames;
    let background = parse_hex_rgba(&comp.background_color)?;

    let settings = options
        .settings
        .clone()
        .unwrap_or_else(|| ExportSettings::mp4(canvas.width, canvas.height, fps));
    settings.validate()?;
    let audio_only = settings.audio_only();

    let mut compositor = Compositor::new(resolved, library, media, fonts)?;

    // Audio first: segment extraction and the mixdown are independent of the
    // per-frame video loop.
    let segments = compositor.audio_segments();
    let has_audio = !segments.is_empty();
    let mixed = if has_audio || audio_only {
        emit(RenderProgress {
            phase: RenderPhase::Preparing,
            progress: 0.0,
            current_frame: None,
            total_frames: Some(total_frames),
            message: format!("mixing {} audio segment(s)", segments.len()),
        });
        if options.cancel.is_cancelled() {
            return Err(MontageError::Cancelled);
        }
        Some(mix_segments(&segments, media, fps, total_frames))
    } else {
        None
    };

    let config = EncoderConfig {
        settings: settings.clone(),
        background_rgba: background,
        has_audio: mixed.is_some(),
    };
    encoder.begin(&config)?;

    if let Some(mixed) = &mixed {
        emit(RenderProgress {
            phase: RenderPhase::Encoding,
            progress: 0.0,
            current_frame: None,
            total_frames: Some(total_frames),
            message: "submitting audio".to_string(),
        });
        if options.cancel.is_cancelled() {
            encoder.abort();
            return Err(MontageError::Cancelled);
        }
        encoder.push_audio(&mixed.interleaved, mixed.sample_rate, mixed.channels)?;
    }

    if !audio_only {
        let mut comp_surface = Surface::new(canvas.width, canvas.height)?;
        let needs_scale = settings.width != canvas.width || settings.height != canvas.height;
        let mut out_surface = if needs_scale {
            Some(Surface::new(settings.width, settings.height)?)
        } else {
            None
        };

        for frame in 0..total_frames {
            if options.cancel.is_cancelled() {
                encoder.abort();
                return Err(MontageError::Cancelled);
            }

            compositor.render_frame(frame, &mut comp_surface)?;

            let sample_surface = match out_surface.as_mut() {
                Some(scaled) => {
                    scaled.scale_from(&comp_surface)?;
                    scaled
                }
                None => &mut comp_surface,
            };
            flatten_over_background(sample_surface.data_mut(), background);

            let sample = VideoSample {
                timestamp_s: frame as f64 / fps.as_f64(),
                duration_s: 1.0 / fps.as_f64(),
                keyframe: frame == 0,
                width: sample_surface.width(),
                height: sample_surface.height(),
                rgba8: sample_surface.data(),
            };
            if let Err(e) = encoder.push_frame(&sample) {
                encoder.abort();
                return Err(e);
            }

            emit(RenderProgress {
                phase: RenderPhase::Rendering,
                progress: ((frame + 1) as f64 / total_frames as f64) * 100.0,
                current_frame: Some(frame),
                total_frames: Some(total_frames),
                message: format!("frame {}/{total_frames}", frame + 1),
            });
        }
    }

    if options.cancel.is_cancelled() {
        encoder.abort();
        return Err(MontageError::Cancelled);
    }

    emit(RenderProgress {
        phase: RenderPhase::Finalizing,
        progress: 100.0,
        current_frame: None,
        total_frames: Some(total_frames),
        message: "finalizing container".to_string(),
    });

    let output = match encoder.finish() {
        Ok(out) => out,
        Err(e) => {
            encoder.abort();
            return Err(e);
        }
    };

    let byte_size = output.bytes.len() as u64;
    Ok(RenderResult {
        bytes: output.bytes,
        mime_type: output.mime_type,
        duration_seconds: total_frames as f64 / fps.as_f64(),
        byte_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_round_trip() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
