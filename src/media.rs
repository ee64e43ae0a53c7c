//! External media contracts (`MediaStore`, `FontProvider`, frame readers) and
//! the filesystem/ffmpeg-backed implementations.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::AnimationDecoder as _;

use crate::error::{MontageError, MontageResult};

/// Internal mixing sample rate used across decode/mix/encode.
pub const MIX_SAMPLE_RATE: u32 = 48_000;

/// Decoded planar PCM.
#[derive(Clone, Debug)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    /// One `f32` buffer per channel, equal lengths.
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }
}

/// One decoded RGBA frame (premultiplied).
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub rgba8_premul: Vec<u8>,
}

/// Decoded animated image (GIF / animated WebP): frames plus per-frame delays.
#[derive(Clone, Debug)]
pub struct AnimatedImage {
    pub frames: Vec<Arc<DecodedFrame>>,
    pub delays_ms: Vec<u64>,
    pub total_ms: u64,
}

impl AnimatedImage {
    /// Frame at `t_ms` into the looping animation.
    pub fn frame_at_ms(&self, t_ms: u64) -> Option<&Arc<DecodedFrame>> {
        if self.frames.is_empty() || self.total_ms == 0 {
            return self.frames.first();
        }
        let mut t = t_ms % self.total_ms;
        for (frame, &delay) in self.frames.iter().zip(&self.delays_ms) {
            if t < delay {
                return Some(frame);
            }
            t -= delay;
        }
        self.frames.last()
    }
}

/// Per-source video sample access. `read_frame` distinguishes "no sample at
/// this timestamp" (`Ok(None)`, e.g. past the end of the stream) from decode
/// failure (`Err`).
pub trait VideoFrameReader {
    fn dimensions(&self) -> (u32, u32);
    fn duration_seconds(&self) -> f64;
    fn read_frame(&mut self, timestamp_s: f64) -> MontageResult<Option<Arc<DecodedFrame>>>;
}

/// Blob/file resolution and media decoding, provided by the caller.
pub trait MediaStore {
    fn fetch_bytes(&self, src: &str) -> MontageResult<Vec<u8>>;
    fn decode_audio_range(&self, src: &str, start_s: f64, end_s: f64)
    -> MontageResult<AudioBuffer>;
    fn create_video_frame_reader(&self, src: &str) -> MontageResult<Box<dyn VideoFrameReader>>;
}

/// Font resolution by family/weight, provided by the caller.
pub trait FontProvider {
    fn font_bytes(&self, family: &str, weight: u16) -> MontageResult<Arc<Vec<u8>>>;
}

/// Cap on any single external decode/probe invocation. Expiry logs a warning
/// upstream and the affected item renders blank.
const MEDIA_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Run a command to completion with stdout/stderr captured, killing it when
/// the media timeout expires.
fn run_with_timeout(cmd: &mut std::process::Command) -> MontageResult<std::process::Output> {
    use std::io::Read as _;
    use std::process::Stdio;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| MontageError::media(format!("failed to spawn media tool: {e}")))?;

    // Drain pipes on helper threads so the child never blocks on a full pipe
    // while we poll for exit.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    });

    let deadline = std::time::Instant::now() + MEDIA_TIMEOUT;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(MontageError::media(format!(
                        "media tool timed out after {}s",
                        MEDIA_TIMEOUT.as_secs()
                    )));
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => {
                let _ = child.kill();
                return Err(MontageError::media(format!("media tool wait failed: {e}")));
            }
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    Ok(std::process::Output {
        status,
        stdout,
        stderr,
    })
}

pub(crate) fn normalize_rel_path(source: &str) -> MontageResult<String> {
    let s = source.replace('\\', "/");
    if s.starts_with('/') {
        return Err(MontageError::validation("media paths must be relative"));
    }
    let mut out = Vec::<&str>::new();
    for part in s.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part == ".." {
            return Err(MontageError::validation("media paths must not contain '..'"));
        }
        out.push(part);
    }
    if out.is_empty() {
        return Err(MontageError::validation("media path must name a file"));
    }
    Ok(out.join("/"))
}

/// Decode a static image to premultiplied RGBA8.
pub fn decode_image(bytes: &[u8]) -> MontageResult<DecodedFrame> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| MontageError::media(format!("image decode failed: {e}")))?;
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut data = rgba.into_raw();
    premultiply_in_place(&mut data);
    Ok(DecodedFrame {
        width,
        height,
        rgba8_premul: data,
    })
}

/// Decode GIF or animated-WebP frames. Returns `None` for static formats.
pub fn decode_animated(bytes: &[u8]) -> MontageResult<Option<AnimatedImage>> {
    let format = image::guess_format(bytes)
        .map_err(|e| MontageError::media(format!("image sniff failed: {e}")))?;

    let frames = match format {
        image::ImageFormat::Gif => {
            let decoder = image::codecs::gif::GifDecoder::new(Cursor::new(bytes))
                .map_err(|e| MontageError::media(format!("gif decode failed: {e}")))?;
            decoder
                .into_frames()
                .collect_frames()
                .map_err(|e| MontageError::media(format!("gif frames failed: {e}")))?
        }
        image::ImageFormat::WebP => {
            let decoder = image::codecs::webp::WebPDecoder::new(Cursor::new(bytes))
                .map_err(|e| MontageError::media(format!("webp decode failed: {e}")))?;
            if !decoder.has_animation() {
                return Ok(None);
            }
            decoder
                .into_frames()
                .collect_frames()
                .map_err(|e| MontageError::media(format!("webp frames failed: {e}")))?
        }
        _ => return Ok(None),
    };

    if frames.len() < 2 {
        return Ok(None);
    }

    let mut out_frames = Vec::with_capacity(frames.len());
    let mut delays_ms = Vec::with_capacity(frames.len());
    let mut total_ms = 0u64;
    for frame in frames {
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay = if denom == 0 {
            100
        } else {
            u64::from(numer / denom.max(1)).max(10)
        };
        let buffer = frame.into_buffer();
        let (width, height) = buffer.dimensions();
        let mut data = buffer.into_raw();
        premultiply_in_place(&mut data);
        out_frames.push(Arc::new(DecodedFrame {
            width,
            height,
            rgba8_premul: data,
        }));
        delays_ms.push(delay);
        total_ms += delay;
    }

    Ok(Some(AnimatedImage {
        frames: out_frames,
        delays_ms,
        total_ms,
    }))
}

pub(crate) fn premultiply_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = u16::from(px[3]);
        if a == 255 {
            continue;
        }
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((u16::from(px[0]) * a + 127) / 255) as u8;
        px[1] = ((u16::from(px[1]) * a + 127) / 255) as u8;
        px[2] = ((u16::from(px[2]) * a + 127) / 255) as u8;
    }
}

/// Filesystem media store driving the external `ffmpeg`/`ffprobe` binaries.
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, src: &str) -> MontageResult<PathBuf> {
        Ok(self.root.join(Path::new(&normalize_rel_path(src)?)))
    }
}

impl MediaStore for FsMediaStore {
    fn fetch_bytes(&self, src: &str) -> MontageResult<Vec<u8>> {
        let path = self.resolve(src)?;
        std::fs::read(&path)
            .map_err(|e| MontageError::media(format!("failed to read '{}': {e}", path.display())))
    }

    fn decode_audio_range(
        &self,
        src: &str,
        start_s: f64,
        end_s: f64,
    ) -> MontageResult<AudioBuffer> {
        let path = self.resolve(src)?;
        let info = probe_media(&path)?;
        let Some(audio) = info.audio else {
            return Err(MontageError::media(format!(
                "'{}' has no audio stream",
                path.display()
            )));
        };

        let duration = (end_s - start_s).max(0.0);
        let mut cmd = std::process::Command::new("ffmpeg");
        cmd.args(["-v", "error", "-ss", &format!("{start_s:.9}")])
            .args(["-t", &format!("{duration:.9}")])
            .arg("-i")
            .arg(&path)
            .args(["-vn", "-f", "f32le", "-acodec", "pcm_f32le", "pipe:1"]);
        let out = run_with_timeout(&mut cmd)?;
        if !out.status.success() {
            return Err(MontageError::media(format!(
                "ffmpeg audio decode failed for '{}': {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let channels = usize::from(audio.channels.max(1));
        let sample_count = out.stdout.len() / 4;
        let frame_count = sample_count / channels;
        let mut planar = vec![Vec::with_capacity(frame_count); channels];
        for (i, chunk) in out.stdout.chunks_exact(4).enumerate() {
            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            planar[i % channels].push(v);
        }

        Ok(AudioBuffer {
            sample_rate: audio.sample_rate,
            channels: planar,
        })
    }

    fn create_video_frame_reader(&self, src: &str) -> MontageResult<Box<dyn VideoFrameReader>> {
        let path = self.resolve(src)?;
        let info = probe_media(&path)?;
        let Some(video) = info.video else {
            return Err(MontageError::media(format!(
                "'{}' has no video stream",
                path.display()
            )));
        };
        Ok(Box::new(FfmpegFrameReader {
            path,
            width: video.width,
            height: video.height,
            duration_s: info.duration_s,
            cache: FrameLru::new(64),
        }))
    }
}

struct ProbeVideo {
    width: u32,
    height: u32,
}

struct ProbeAudio {
    sample_rate: u32,
    channels: u16,
}

struct ProbeInfo {
    video: Option<ProbeVideo>,
    audio: Option<ProbeAudio>,
    duration_s: f64,
}

fn probe_media(path: &Path) -> MontageResult<ProbeInfo> {
    #[derive(serde::Deserialize)]
    struct Stream {
        codec_type: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
        sample_rate: Option<String>,
        channels: Option<u16>,
    }
    #[derive(serde::Deserialize)]
    struct Format {
        duration: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct Probe {
        streams: Vec<Stream>,
        format: Option<Format>,
    }

    let mut cmd = std::process::Command::new("ffprobe");
    cmd.args([
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_streams",
        "-show_format",
    ])
    .arg(path);
    let out = run_with_timeout(&mut cmd)?;
    if !out.status.success() {
        return Err(MontageError::media(format!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let parsed: Probe = serde_json::from_slice(&out.stdout)
        .map_err(|e| MontageError::media(format!("ffprobe json parse failed: {e}")))?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .and_then(|s| {
            Some(ProbeVideo {
                width: s.width?,
                height: s.height?,
            })
        });
    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| {
            Some(ProbeAudio {
                sample_rate: s.sample_rate.as_deref()?.parse().ok()?,
                channels: s.channels.unwrap_or(2),
            })
        });
    let duration_s = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(ProbeInfo {
        video,
        audio,
        duration_s,
    })
}

struct FrameLru {
    map: HashMap<u64, Arc<DecodedFrame>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl FrameLru {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: u64) -> Option<Arc<DecodedFrame>> {
        let hit = self.map.get(&key).cloned();
        if hit.is_some() {
            self.touch(key);
        }
        hit
    }

    fn insert(&mut self, key: u64, frame: Arc<DecodedFrame>) {
        self.map.insert(key, frame);
        self.touch(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
    }

    fn touch(&mut self, key: u64) {
        if let Some(pos) = self.order.iter().position(|&k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key);
    }
}

struct FfmpegFrameReader {
    path: PathBuf,
    width: u32,
    height: u32,
    duration_s: f64,
    cache: FrameLru,
}

impl FfmpegFrameReader {
    /// Backtrack applied when a seek lands mid-GOP and decodes nothing.
    const RETRY_BACKTRACK_S: f64 = 0.5;

    fn decode_at(&self, timestamp_s: f64) -> MontageResult<Option<DecodedFrame>> {
        let mut cmd = std::process::Command::new("ffmpeg");
        cmd.args(["-v", "error", "-ss", &format!("{:.9}", timestamp_s.max(0.0))])
            .arg("-i")
            .arg(&self.path)
            .args([
                "-frames:v", "1", "-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1",
            ]);
        let out = run_with_timeout(&mut cmd)?;
        if !out.status.success() {
            return Err(MontageError::decode_recoverable(format!(
                "ffmpeg frame decode failed for '{}': {}",
                self.path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let expected = self.width as usize * self.height as usize * 4;
        if out.stdout.is_empty() {
            return Ok(None);
        }
        if out.stdout.len() < expected {
            return Err(MontageError::decode_recoverable(format!(
                "short frame read from '{}'",
                self.path.display()
            )));
        }

        let mut data = out.stdout[..expected].to_vec();
        premultiply_in_place(&mut data);
        Ok(Some(DecodedFrame {
            width: self.width,
            height: self.height,
            rgba8_premul: data,
        }))
    }
}

impl VideoFrameReader for FfmpegFrameReader {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn duration_seconds(&self) -> f64 {
        self.duration_s
    }

    fn read_frame(&mut self, timestamp_s: f64) -> MontageResult<Option<Arc<DecodedFrame>>> {
        if self.duration_s > 0.0 && timestamp_s > self.duration_s + 0.5 {
            return Ok(None);
        }

        let key = ((timestamp_s.max(0.0)) * 1000.0).round() as u64;
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit));
        }

        let decoded = match self.decode_at(timestamp_s) {
            Ok(frame) => frame,
            Err(MontageError::DecodeRecoverable(msg)) => {
                tracing::debug!(
                    target: "montage::media",
                    "retrying decode at {timestamp_s:.3}s with backtrack: {msg}"
                );
                self.decode_at((timestamp_s - Self::RETRY_BACKTRACK_S).max(0.0))
                    .map_err(|e| MontageError::media(e.to_string()))?
            }
            Err(e) => return Err(e),
        };

        match decoded {
            Some(frame) => {
                let frame = Arc::new(frame);
                self.cache.insert(key, frame.clone());
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

/// Font provider backed by explicitly registered font files.
pub struct FsFontProvider {
    by_family: Mutex<HashMap<String, FontEntry>>,
}

enum FontEntry {
    Path(PathBuf),
    Loaded(Arc<Vec<u8>>),
}

impl Default for FsFontProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FsFontProvider {
    pub fn new() -> Self {
        Self {
            by_family: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, family: impl Into<String>, path: impl Into<PathBuf>) {
        let mut map = self.by_family.lock().expect("font provider poisoned");
        map.insert(family.into().to_ascii_lowercase(), FontEntry::Path(path.into()));
    }

    pub fn register_bytes(&self, family: impl Into<String>, bytes: Vec<u8>) {
        let mut map = self.by_family.lock().expect("font provider poisoned");
        map.insert(
            family.into().to_ascii_lowercase(),
            FontEntry::Loaded(Arc::new(bytes)),
        );
    }
}

impl FontProvider for FsFontProvider {
    fn font_bytes(&self, family: &str, _weight: u16) -> MontageResult<Arc<Vec<u8>>> {
        let mut map = self.by_family.lock().expect("font provider poisoned");
        let key = family.to_ascii_lowercase();
        let entry = map
            .get_mut(&key)
            .ok_or_else(|| MontageError::media(format!("no font registered for '{family}'")))?;
        match entry {
            FontEntry::Loaded(bytes) => Ok(bytes.clone()),
            FontEntry::Path(path) => {
                let bytes = std::fs::read(&*path).map_err(|e| {
                    MontageError::media(format!("failed to read font '{}': {e}", path.display()))
                })?;
                let arc = Arc::new(bytes);
                *entry = FontEntry::Loaded(arc.clone());
                Ok(arc)
            }
        }
    }
}
