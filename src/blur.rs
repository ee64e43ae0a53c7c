//! Separable Gaussian blur over premultiplied RGBA8, used by the blur filter
//! effect, mask feathering and text shadows.

use crate::error::{MontageError, MontageResult};

/// Blur `buf` in place. `sigma <= 0` is a no-op. Edges clamp.
pub fn gaussian_blur_rgba8_premul(
    buf: &mut [u8],
    width: u32,
    height: u32,
    sigma: f32,
) -> MontageResult<()> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(4))
        .ok_or_else(|| MontageError::evaluation("blur buffer size overflow"))?;
    if buf.len() != expected {
        return Err(MontageError::evaluation(
            "gaussian_blur expects buf matching width*height*4",
        ));
    }
    if !(sigma > 0.0) || width == 0 || height == 0 {
        return Ok(());
    }

    let kernel = gaussian_kernel(sigma);
    let mut tmp = vec![0u8; expected];
    horizontal_pass(buf, &mut tmp, width, height, &kernel);
    vertical_pass(&tmp, buf, width, height, &kernel);
    Ok(())
}

/// Normalized 1-D kernel with radius `ceil(2.57 * sigma)` (covers ~99% of the
/// Gaussian mass).
fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let sigma = sigma.max(1e-3);
    let radius = (2.57 * sigma).ceil() as i32;
    let denom = 2.0 * sigma * sigma;

    let mut weights = Vec::with_capacity((2 * radius + 1) as usize);
    let mut sum = 0.0f32;
    for i in -radius..=radius {
        let x = i as f32;
        let w = (-x * x / denom).exp();
        weights.push(w);
        sum += w;
    }
    for w in &mut weights {
        *w /= sum;
    }
    weights
}

fn horizontal_pass(src: &[u8], dst: &mut [u8], width: u32, height: u32, k: &[f32]) {
    let radius = (k.len() / 2) as i32;
    let w = width as i32;
    for y in 0..height as i32 {
        let row = (y * w) as usize * 4;
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            for (ki, &kw) in k.iter().enumerate() {
                let sx = (x + ki as i32 - radius).clamp(0, w - 1);
                let idx = row + (sx as usize) * 4;
                for c in 0..4 {
                    acc[c] += kw * f32::from(src[idx + c]);
                }
            }
            let out = row + (x as usize) * 4;
            for c in 0..4 {
                dst[out + c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

fn vertical_pass(src: &[u8], dst: &mut [u8], width: u32, height: u32, k: &[f32]) {
    let radius = (k.len() / 2) as i32;
    let w = width as i32;
    let h = height as i32;
    for y in 0..h {
        for x in 0..w {
            let mut acc = [0.0f32; 4];
            for (ki, &kw) in k.iter().enumerate() {
                let sy = (y + ki as i32 - radius).clamp(0, h - 1);
                let idx = ((sy * w + x) as usize) * 4;
                for c in 0..4 {
                    acc[c] += kw * f32::from(src[idx + c]);
                }
            }
            let out = ((y * w + x) as usize) * 4;
            for c in 0..4 {
                dst[out + c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sigma_is_identity() {
        let mut buf = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let orig = buf.clone();
        gaussian_blur_rgba8_premul(&mut buf, 1, 2, 0.0).unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn constant_image_is_unchanged() {
        let (w, h) = (4u32, 3u32);
        let px = [10u8, 20, 30, 40];
        let mut buf = px.repeat((w * h) as usize);
        let orig = buf.clone();
        gaussian_blur_rgba8_premul(&mut buf, w, h, 2.0).unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn energy_spreads_but_is_conserved() {
        let (w, h) = (7u32, 7u32);
        let mut buf = vec![0u8; (w * h * 4) as usize];
        let center = ((3 * w + 3) * 4) as usize;
        buf[center..center + 4].copy_from_slice(&[255, 255, 255, 255]);

        gaussian_blur_rgba8_premul(&mut buf, w, h, 1.0).unwrap();

        let nonzero = buf.chunks_exact(4).filter(|px| px[3] != 0).count();
        assert!(nonzero > 1);
        let sum_a: u32 = buf.chunks_exact(4).map(|px| u32::from(px[3])).sum();
        assert!((sum_a as i32 - 255).abs() <= 8);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let mut buf = vec![0u8; 12];
        assert!(gaussian_blur_rgba8_premul(&mut buf, 2, 2, 1.0).is_err());
    }
}
