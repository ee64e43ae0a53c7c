#![forbid(unsafe_code)]

mod blur;
mod composite;
mod compositor;
mod core;
mod ease;
mod effects;
mod encode;
mod error;
mod keyframe;
mod mask;
mod media;
mod model;
mod raster;
mod render;
mod resolve;
mod surface;
mod transition;
mod transition_render;

pub mod audio;

#[cfg(test)]
mod test_support;

pub use blur::gaussian_blur_rgba8_premul;
pub use composite::{destination_in_alpha, flatten_over_background, over_in_place};
pub use compositor::{Compositor, Scene};
pub use core::{
    Affine, BezPath, Canvas, Fps, FrameIndex, FrameRange, Point, Rect, Rgba8Premul, Vec2,
    parse_hex_rgba,
};
pub use ease::{Easing, EasingConfig};
pub use effects::{
    BlendMode, Effect, FilterKind, HalftoneParams, HalftonePattern, ResolvedEffect,
    VignetteParams, parse_effect, resolve_effects,
};
pub use encode::{
    AudioCodec, Container, EncodedOutput, Encoder, EncoderConfig, ExportSettings, FfmpegEncoder,
    InMemoryEncoder, VideoCodec, VideoSample, is_ffmpeg_on_path, supports_video_codec,
};
pub use error::{MontageError, MontageResult};
pub use keyframe::{AnimatedTransform, KeyframeMap, animated_transform, interpolate};
pub use media::{
    AnimatedImage, AudioBuffer, DecodedFrame, FontProvider, FsFontProvider, FsMediaStore,
    MIX_SAMPLE_RATE, MediaStore, VideoFrameReader, decode_animated, decode_image,
};
pub use model::{
    AdjustmentItem, Composition, CompositionItem, CompositionLibrary, EffectInstance, ImageItem,
    ItemKeyframes, ItemKind, Keyframe, MaskType, MediaItem, Property, PropertyKeyframes,
    ShapeItem, ShapeType, TextAlign, TextItem, TextShadow, TextStroke, TimelineItem, Track,
    Transition, TransitionDirection, TransitionPresentation, VerticalAlign,
};
pub use render::{
    CancellationToken, ProgressFn, RenderOptions, RenderPhase, RenderProgress, RenderResult,
    render,
};
pub use resolve::{ResolvedComposition, ResolvedTrack, resolve};
pub use surface::{Surface, SurfacePool, SurfacePoolStats};
pub use transition::{TransitionIndex, TransitionWindow};
pub use transition_render::{TransitionFrame, TransitionRegistry, TransitionRenderFn};
