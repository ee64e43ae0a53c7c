//! Audio pipeline: segment extraction, pitch-preserving time stretch, sinc
//! resampling and the final mixdown.

pub mod mix;
pub mod resample;
pub mod segment;
pub mod stretch;

pub use mix::{MixedAudio, mix_segments};
pub use segment::{AudioSegment, SegmentKind, extract_segments};
