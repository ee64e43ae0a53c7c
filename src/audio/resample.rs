//! Windowed-sinc sample rate conversion.

/// Resample every channel from `from_rate` to `to_rate` with a Hann-windowed
/// sinc kernel. Downsampling lowers the cutoff to avoid aliasing.
pub fn resample_sinc(channels: &[Vec<f32>], from_rate: u32, to_rate: u32) -> Vec<Vec<f32>> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return channels.to_vec();
    }
    channels
        .iter()
        .map(|ch| resample_channel(ch, from_rate, to_rate))
        .collect()
}

const TAPS: f64 = 16.0;

fn resample_channel(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() {
        return Vec::new();
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let out_len = ((input.len() as f64) * ratio).round().max(1.0) as usize;
    let cutoff = ratio.min(1.0);
    let half_width = (TAPS / cutoff).ceil();

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let center = (i as f64) / ratio;
        let lo = (center - half_width).floor().max(0.0) as usize;
        let hi = ((center + half_width).ceil() as usize).min(input.len() - 1);

        let mut acc = 0.0f64;
        let mut weight_sum = 0.0f64;
        for (j, &sample) in input.iter().enumerate().take(hi + 1).skip(lo) {
            let d = j as f64 - center;
            let w = sinc(d * cutoff) * hann(d / half_width);
            acc += w * f64::from(sample);
            weight_sum += w;
        }
        out.push(if weight_sum.abs() > 1e-9 {
            (acc / weight_sum) as f32
        } else {
            0.0
        });
    }
    out
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        return 1.0;
    }
    let px = std::f64::consts::PI * x;
    px.sin() / px
}

/// Hann window over `t ∈ [-1, 1]`.
fn hann(t: f64) -> f64 {
    if t.abs() >= 1.0 {
        return 0.0;
    }
    0.5 + 0.5 * (std::f64::consts::PI * t).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, freq: f64, sample_rate: f64) -> Vec<f32> {
        (0..len)
            .map(|i| ((std::f64::consts::TAU * freq * i as f64) / sample_rate).sin() as f32)
            .collect()
    }

    #[test]
    fn same_rate_is_identity() {
        let ch = vec![sine(1000, 440.0, 48000.0)];
        assert_eq!(resample_sinc(&ch, 48000, 48000), ch);
    }

    #[test]
    fn length_scales_with_ratio() {
        let ch = vec![sine(44100, 440.0, 44100.0)];
        let out = resample_sinc(&ch, 44100, 48000);
        assert_eq!(out[0].len(), 48000);
    }

    #[test]
    fn dc_level_is_preserved() {
        let ch = vec![vec![0.25f32; 4000]];
        let out = resample_sinc(&ch, 44100, 48000);
        let mid = &out[0][500..out[0].len() - 500];
        for &v in mid {
            assert!((v - 0.25).abs() < 1e-3, "sample {v}");
        }
    }

    #[test]
    fn tone_survives_upsampling() {
        // A 1 kHz tone resampled 44.1k -> 48k keeps its amplitude.
        let ch = vec![sine(8820, 1000.0, 44100.0)];
        let out = resample_sinc(&ch, 44100, 48000);
        let peak = out[0][1000..out[0].len() - 1000]
            .iter()
            .fold(0.0f32, |m, v| m.max(v.abs()));
        assert!(peak > 0.95 && peak < 1.05, "peak {peak}");
    }

    #[test]
    fn downsampling_shrinks_length() {
        let ch = vec![sine(48000, 440.0, 48000.0)];
        let out = resample_sinc(&ch, 48000, 16000);
        assert_eq!(out[0].len(), 16000);
    }
}
