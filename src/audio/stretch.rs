//! WSOLA (waveform-similarity overlap-add) time stretching. Changes duration
//! without changing pitch; all channels are processed against one mono guide
//! so inter-channel phase stays intact.

/// Stretch `channels` by `rate` (rate 2.0 halves the duration). Returns new
/// channel buffers of length `round(len / rate)`.
pub fn stretch_wsola(channels: &[Vec<f32>], sample_rate: u32, rate: f64) -> Vec<Vec<f32>> {
    let in_len = channels.first().map(|c| c.len()).unwrap_or(0);
    if channels.is_empty() || in_len == 0 || !rate.is_finite() || rate <= 0.0 {
        return channels.to_vec();
    }
    if (rate - 1.0).abs() < 1e-6 {
        return channels.to_vec();
    }

    let out_len = ((in_len as f64) / rate).round().max(1.0) as usize;
    let window = ((sample_rate as f64 * 0.04) as usize).max(64) & !1;
    let hop_syn = window / 2;
    let hop_ana = hop_syn as f64 * rate;
    let seek = ((sample_rate as f64 * 0.008) as usize).max(16);

    if in_len <= window {
        // Too short to stretch; nearest-sample resample keeps the length
        // contract.
        return channels
            .iter()
            .map(|ch| {
                (0..out_len)
                    .map(|i| {
                        let src = ((i as f64) * rate) as usize;
                        ch[src.min(in_len - 1)]
                    })
                    .collect()
            })
            .collect();
    }

    let guide = mono_guide(channels, in_len);
    let hann: Vec<f32> = (0..window)
        .map(|i| {
            let t = (i as f64) / (window as f64 - 1.0);
            (0.5 - 0.5 * (std::f64::consts::TAU * t).cos()) as f32
        })
        .collect();

    let mut out = vec![vec![0.0f32; out_len]; channels.len()];
    let mut norm = vec![0.0f32; out_len];
    let max_start = in_len - window;
    let mut prev_pos = 0usize;

    let mut k = 0usize;
    loop {
        let out_pos = k * hop_syn;
        if out_pos >= out_len {
            break;
        }

        let target = ((k as f64) * hop_ana).round() as i64;
        let pos = if k == 0 {
            0
        } else {
            let natural = (prev_pos + hop_syn).min(max_start);
            let lo = (target - seek as i64).clamp(0, max_start as i64) as usize;
            let hi = (target + seek as i64).clamp(0, max_start as i64) as usize;
            best_match(&guide, natural, lo, hi, window)
        };

        for (ch, out_ch) in channels.iter().zip(out.iter_mut()) {
            for i in 0..window {
                let o = out_pos + i;
                if o >= out_len {
                    break;
                }
                out_ch[o] += ch[pos + i] * hann[i];
            }
        }
        for (i, &w) in hann.iter().enumerate() {
            let o = out_pos + i;
            if o >= out_len {
                break;
            }
            norm[o] += w;
        }

        prev_pos = pos;
        k += 1;
    }

    for out_ch in &mut out {
        for (v, &n) in out_ch.iter_mut().zip(&norm) {
            if n > 1e-6 {
                *v /= n;
            }
        }
    }
    out
}

fn mono_guide(channels: &[Vec<f32>], len: usize) -> Vec<f32> {
    let n = channels.len() as f32;
    (0..len)
        .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() / n)
        .collect()
}

/// Candidate start in `lo..=hi` whose windowed segment best matches the
/// natural continuation at `natural` (max cross-correlation).
fn best_match(guide: &[f32], natural: usize, lo: usize, hi: usize, window: usize) -> usize {
    let reference = &guide[natural..natural + window];
    let mut best = lo;
    let mut best_score = f64::MIN;
    let mut cand = lo;
    while cand <= hi {
        let segment = &guide[cand..cand + window];
        let mut score = 0.0f64;
        for (a, b) in reference.iter().zip(segment) {
            score += f64::from(*a) * f64::from(*b);
        }
        if score > best_score {
            best_score = score;
            best = cand;
        }
        cand += 2;
    }
    best
}
