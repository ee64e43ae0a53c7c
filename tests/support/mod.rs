//! Shared fixtures for the integration tests: a synthetic media store that
//! serves solid-color images and constant-amplitude audio, plus composition
//! builders.

use std::sync::Arc;

use montage::{
    AudioBuffer, Composition, DecodedFrame, FontProvider, Fps, ImageItem, ItemKind, MediaItem,
    MediaStore, MontageError, MontageResult, TimelineItem, Track, VideoFrameReader,
};

/// Serves `color:RRGGBB[AA]:WxH` as PNG bytes, `tone:<amplitude>` as constant
/// stereo audio, and `video:RRGGBB:WxH` as a solid frame stream.
pub struct SyntheticStore;

impl MediaStore for SyntheticStore {
    fn fetch_bytes(&self, src: &str) -> MontageResult<Vec<u8>> {
        let rest = src
            .strip_prefix("color:")
            .ok_or_else(|| MontageError::media(format!("unknown synthetic src '{src}'")))?;
        let (color, dims) = rest
            .split_once(':')
            .ok_or_else(|| MontageError::media("missing dims"))?;
        let (w, h) = parse_dims(dims)?;
        let rgba = montage::parse_hex_rgba(color)?;
        let mut img = image::RgbaImage::new(w, h);
        for px in img.pixels_mut() {
            px.0 = rgba;
        }
        let mut out = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .map_err(|e| MontageError::media(e.to_string()))?;
        Ok(out)
    }

    fn decode_audio_range(&self, src: &str, start_s: f64, end_s: f64) -> MontageResult<AudioBuffer> {
        let amplitude: f32 = src
            .strip_prefix("tone:")
            .ok_or_else(|| MontageError::media(format!("'{src}' has no audio")))?
            .parse()
            .map_err(|_| MontageError::media("bad tone amplitude"))?;
        let frames = ((end_s - start_s) * 48_000.0).round().max(0.0) as usize;
        Ok(AudioBuffer {
            sample_rate: 48_000,
            channels: vec![vec![amplitude; frames]; 2],
        })
    }

    fn create_video_frame_reader(&self, src: &str) -> MontageResult<Box<dyn VideoFrameReader>> {
        let rest = src
            .strip_prefix("video:")
            .ok_or_else(|| MontageError::media(format!("'{src}' is not a video")))?;
        let (color, dims) = rest
            .split_once(':')
            .ok_or_else(|| MontageError::media("missing dims"))?;
        let (w, h) = parse_dims(dims)?;
        let rgba = montage::parse_hex_rgba(color)?;
        Ok(Box::new(SolidVideo {
            width: w,
            height: h,
            rgba,
        }))
    }
}

fn parse_dims(dims: &str) -> MontageResult<(u32, u32)> {
    let (w, h) = dims
        .split_once('x')
        .ok_or_else(|| MontageError::media("dims must be WxH"))?;
    Ok((
        w.parse().map_err(|_| MontageError::media("bad width"))?,
        h.parse().map_err(|_| MontageError::media("bad height"))?,
    ))
}

struct SolidVideo {
    width: u32,
    height: u32,
    rgba: [u8; 4],
}

impl VideoFrameReader for SolidVideo {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn duration_seconds(&self) -> f64 {
        3600.0
    }

    fn read_frame(&mut self, _timestamp_s: f64) -> MontageResult<Option<Arc<DecodedFrame>>> {
        let px = [
            self.rgba[0], self.rgba[1], self.rgba[2], self.rgba[3],
        ];
        let mut data = Vec::with_capacity((self.width * self.height * 4) as usize);
        for _ in 0..(self.width * self.height) {
            data.extend_from_slice(&px);
        }
        Ok(Some(Arc::new(DecodedFrame {
            width: self.width,
            height: self.height,
            rgba8_premul: data,
        })))
    }
}

pub struct NoFonts;

impl FontProvider for NoFonts {
    fn font_bytes(&self, family: &str, _weight: u16) -> MontageResult<Arc<Vec<u8>>> {
        Err(MontageError::media(format!("no font '{family}'")))
    }
}

pub fn comp(fps: u32, duration: u64, width: u32, height: u32, tracks: Vec<Track>) -> Composition {
    Composition {
        fps: Fps(fps),
        duration_in_frames: duration,
        width,
        height,
        background_color: "#000000".to_string(),
        tracks,
        transitions: vec![],
        keyframes: vec![],
    }
}

pub fn track(id: &str, order: i32, items: Vec<TimelineItem>) -> Track {
    Track {
        id: id.to_string(),
        order,
        visible: true,
        muted: false,
        items,
    }
}

pub fn item(id: &str, from: u64, duration: u64, kind: ItemKind) -> TimelineItem {
    TimelineItem {
        id: id.to_string(),
        from,
        duration_in_frames: duration,
        x: None,
        y: None,
        width: None,
        height: None,
        rotation: 0.0,
        opacity: 1.0,
        corner_radius: 0.0,
        effects: vec![],
        fade_in: 0,
        fade_out: 0,
        origin_id: None,
        kind,
    }
}

pub fn color_image(color: &str, w: u32, h: u32) -> ItemKind {
    ItemKind::Image(ImageItem {
        src: format!("color:{color}:{w}x{h}"),
        natural_width: w,
        natural_height: h,
    })
}

pub fn tone_audio(amplitude: f32, source_duration: u64) -> ItemKind {
    ItemKind::Audio(MediaItem {
        src: format!("tone:{amplitude}"),
        source_start: 0,
        source_end: source_duration,
        source_duration,
        speed: 1.0,
        volume: 0.0,
        muted: false,
    })
}
