//! Decode, process and additively mix audio segments into one stereo buffer
//! at the internal mix rate.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    audio::resample::resample_sinc,
    audio::segment::AudioSegment,
    audio::stretch::stretch_wsola,
    core::Fps,
    error::{MontageError, MontageResult},
    keyframe::interpolate,
    media::{AudioBuffer, MIX_SAMPLE_RATE, MediaStore},
};

/// Below this dB value a gain is treated as silence.
const SILENCE_FLOOR_DB: f64 = -60.0;

#[derive(Clone, Debug)]
pub struct MixedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved stereo samples.
    pub interleaved: Vec<f32>,
}

impl MixedAudio {
    pub fn frames(&self) -> usize {
        self.interleaved.len() / usize::from(self.channels)
    }

    pub fn is_silent(&self) -> bool {
        self.interleaved.iter().all(|&s| s == 0.0)
    }
}

pub fn db_to_gain(db: f64) -> f64 {
    if db <= SILENCE_FLOOR_DB {
        return 0.0;
    }
    10f64.powf(db / 20.0)
}

/// Mix all segments over `total_frames / fps` seconds of stereo output.
/// Decode or processing failure of one segment logs and leaves the rest of
/// the mix intact.
#[tracing::instrument(skip(segments, media), fields(segments = segments.len()))]
pub fn mix_segments(
    segments: &[AudioSegment],
    media: &dyn MediaStore,
    fps: Fps,
    total_frames: u64,
) -> MixedAudio {
    let total_samples =
        ((total_frames as f64 / fps.as_f64()) * f64::from(MIX_SAMPLE_RATE)).round() as usize;
    let mut out = vec![0.0f32; total_samples * 2];
    let mut decode_cache: HashMap<String, Arc<AudioBuffer>> = HashMap::new();

    for seg in segments {
        if seg.muted {
            continue;
        }
        if let Err(e) = mix_one(seg, media, fps, &mut out, total_samples, &mut decode_cache) {
            tracing::warn!(
                target: "montage::audio",
                "skipping audio segment for '{}': {e}",
                seg.src
            );
        }
    }

    soft_clip(&mut out);
    MixedAudio {
        sample_rate: MIX_SAMPLE_RATE,
        channels: 2,
        interleaved: out,
    }
}

fn mix_one(
    seg: &AudioSegment,
    media: &dyn MediaStore,
    fps: Fps,
    out: &mut [f32],
    total_samples: usize,
    decode_cache: &mut HashMap<String, Arc<AudioBuffer>>,
) -> MontageResult<()> {
    let start_s = seg.source_start_frame / fps.as_f64();
    let source_frames = seg.duration_frames as f64 * seg.speed;
    let end_s = (seg.source_start_frame + source_frames) / fps.as_f64();
    if end_s <= start_s {
        return Ok(());
    }

    let cache_key = format!("{}|{start_s:.4}|{end_s:.4}", seg.src);
    let decoded = match decode_cache.get(&cache_key) {
        Some(hit) => hit.clone(),
        None => {
            let buffer = Arc::new(media.decode_audio_range(&seg.src, start_s, end_s)?);
            decode_cache.insert(cache_key, buffer.clone());
            buffer
        }
    };
    if decoded.channels.is_empty() || decoded.frames() == 0 {
        return Ok(());
    }
    let source_rate = decoded.sample_rate;
    if source_rate == 0 {
        return Err(MontageError::media("decoded audio has zero sample rate"));
    }

    // 1. Pitch-preserving speed change, all channels together.
    let mut channels = if (seg.speed - 1.0).abs() > 1e-6 {
        stretch_wsola(&decoded.channels, source_rate, seg.speed)
    } else {
        decoded.channels.clone()
    };

    // 2. Gain: keyframed per-sample dB, or the static segment volume.
    apply_gain(seg, &mut channels, source_rate, fps);

    // 3. Edge fades.
    apply_fades(seg, &mut channels, source_rate, fps);

    // 4. Resample to the mix rate.
    let channels = resample_sinc(&channels, source_rate, MIX_SAMPLE_RATE);

    // 5. Additive mix into stereo, channel-cycled.
    let start_sample =
        ((seg.start_frame as f64 / fps.as_f64()) * f64::from(MIX_SAMPLE_RATE)).floor() as usize;
    let seg_samples =
        ((seg.duration_frames as f64 / fps.as_f64()) * f64::from(MIX_SAMPLE_RATE)).round() as usize;

    for (ch_index, ch) in channels.iter().enumerate() {
        let targets: &[usize] = if channels.len() == 1 {
            &[0, 1]
        } else {
            match ch_index % 2 {
                0 => &[0],
                _ => &[1],
            }
        };
        for (i, &sample) in ch.iter().take(seg_samples).enumerate() {
            let frame_index = start_sample + i;
            if frame_index >= total_samples {
                break;
            }
            for &t in targets {
                out[frame_index * 2 + t] += sample;
            }
        }
    }

    Ok(())
}

fn apply_gain(seg: &AudioSegment, channels: &mut [Vec<f32>], source_rate: u32, fps: Fps) {
    match &seg.volume_keyframes {
        Some(keys) if !keys.is_empty() => {
            let frames_per_sample = fps.as_f64() / f64::from(source_rate);
            let base_frame = seg.start_frame as i64 - seg.item_from;
            for ch in channels.iter_mut() {
                for (i, v) in ch.iter_mut().enumerate() {
                    let rel_frame = base_frame as f64 + (i as f64) * frames_per_sample;
                    let db = interpolate(keys, rel_frame, seg.volume_db);
                    *v *= db_to_gain(db) as f32;
                }
            }
        }
        _ => {
            if seg.volume_db != 0.0 {
                let gain = db_to_gain(seg.volume_db) as f32;
                for ch in channels.iter_mut() {
                    for v in ch.iter_mut() {
                        *v *= gain;
                    }
                }
            }
        }
    }
}

fn apply_fades(seg: &AudioSegment, channels: &mut [Vec<f32>], source_rate: u32, fps: Fps) {
    let len = channels.first().map(|c| c.len()).unwrap_or(0);
    if len == 0 {
        return;
    }
    let samples_per_frame = f64::from(source_rate) / fps.as_f64();
    let fade_in = ((seg.fade_in_frames as f64) * samples_per_frame).round() as usize;
    let fade_out = ((seg.fade_out_frames as f64) * samples_per_frame).round() as usize;

    for ch in channels.iter_mut() {
        if fade_in > 0 {
            let n = fade_in.min(len);
            for (i, v) in ch.iter_mut().take(n).enumerate() {
                let t = (i as f64) / (fade_in as f64);
                let g = if seg.use_equal_power_fades {
                    (t * std::f64::consts::FRAC_PI_2).sin()
                } else {
                    t
                };
                *v *= g as f32;
            }
        }
        if fade_out > 0 {
            let n = fade_out.min(len);
            for i in 0..n {
                let idx = len - n + i;
                let t = ((n - i) as f64) / (fade_out as f64);
                let g = if seg.use_equal_power_fades {
                    (t * std::f64::consts::FRAC_PI_2).sin()
                } else {
                    t
                };
                ch[idx] *= g as f32;
            }
        }
    }
}

/// Tame peaks: samples beyond full scale run through tanh, everything else
/// passes untouched.
fn soft_clip(samples: &mut [f32]) {
    for s in samples.iter_mut() {
        if s.abs() > 1.0 {
            *s = s.tanh();
        }
    }
}
