//! Codec facade: container/codec capability matrix, export settings
//! validation, and the `Encoder` contract with an ffmpeg-muxing production
//! implementation plus an in-memory implementation for tests.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    core::Fps,
    error::{MontageError, MontageResult},
    media::MIX_SAMPLE_RATE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mov,
    Webm,
    Mkv,
    Mp3,
    Aac,
    Wav,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Avc,
    Hevc,
    Vp8,
    Vp9,
    Av1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
    PcmS16,
}

impl VideoCodec {
    /// RFC 6381 codec string.
    pub fn codec_string(self) -> &'static str {
        match self {
            Self::Avc => "avc1.42E01E",
            Self::Hevc => "hvc1.1.6.L93.B0",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp09.00.10.08",
            Self::Av1 => "av01.0.04M.08",
        }
    }

    fn ffmpeg_encoder(self) -> &'static str {
        match self {
            Self::Avc => "libx264",
            Self::Hevc => "libx265",
            Self::Vp8 => "libvpx",
            Self::Vp9 => "libvpx-vp9",
            Self::Av1 => "libaom-av1",
        }
    }
}

impl AudioCodec {
    fn ffmpeg_encoder(self) -> &'static str {
        match self {
            Self::Aac => "aac",
            Self::Opus => "libopus",
            Self::Mp3 => "libmp3lame",
            Self::PcmS16 => "pcm_s16le",
        }
    }
}

impl Container {
    pub fn parse(s: &str) -> MontageResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "mov" => Ok(Self::Mov),
            "webm" => Ok(Self::Webm),
            "mkv" | "matroska" => Ok(Self::Mkv),
            "mp3" => Ok(Self::Mp3),
            "aac" => Ok(Self::Aac),
            "wav" => Ok(Self::Wav),
            other => Err(MontageError::codec(format!("unknown container '{other}'"))),
        }
    }

    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3 | Self::Aac | Self::Wav)
    }

    pub fn video_codecs(self) -> &'static [VideoCodec] {
        match self {
            Self::Mp4 | Self::Mov => &[VideoCodec::Avc, VideoCodec::Hevc],
            Self::Webm => &[VideoCodec::Vp8, VideoCodec::Vp9, VideoCodec::Av1],
            Self::Mkv => &[
                VideoCodec::Avc,
                VideoCodec::Hevc,
                VideoCodec::Vp8,
                VideoCodec::Vp9,
                VideoCodec::Av1,
            ],
            _ => &[],
        }
    }

    pub fn audio_codecs(self) -> &'static [AudioCodec] {
        match self {
            Self::Mp4 | Self::Mov | Self::Aac => &[AudioCodec::Aac],
            Self::Webm => &[AudioCodec::Opus],
            Self::Mkv => &[AudioCodec::Opus, AudioCodec::Aac],
            Self::Mp3 => &[AudioCodec::Mp3],
            Self::Wav => &[AudioCodec::PcmS16],
        }
    }

    pub fn default_video_codec(self) -> Option<VideoCodec> {
        self.video_codecs().first().copied()
    }

    pub fn default_audio_codec(self) -> Option<AudioCodec> {
        self.audio_codecs().first().copied()
    }

    /// Canonical media type, with the codec parameter where the container
    /// carries one.
    pub fn mime_type(self, video: Option<VideoCodec>) -> String {
        match self {
            Self::Mp4 => match video {
                Some(v) => format!("video/mp4; codecs=\"{}\"", v.codec_string()),
                None => "video/mp4".to_string(),
            },
            Self::Mov => "video/mov".to_string(),
            Self::Webm => match video {
                Some(v) => format!("video/webm; codecs=\"{}\"", v.codec_string()),
                None => "video/webm".to_string(),
            },
            Self::Mkv => "video/x-matroska".to_string(),
            Self::Mp3 => "audio/mpeg".to_string(),
            Self::Aac => "audio/aac".to_string(),
            Self::Wav => "audio/wav".to_string(),
        }
    }

    fn ffmpeg_format(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mov => "mov",
            Self::Webm => "webm",
            Self::Mkv => "matroska",
            Self::Mp3 => "mp3",
            Self::Aac => "adts",
            Self::Wav => "wav",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mov => "mov",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Wav => "wav",
        }
    }
}

/// Capability probe exposed by the facade.
pub fn supports_video_codec(codec: VideoCodec, width: u32, height: u32) -> bool {
    if width == 0 || height == 0 || !width.is_multiple_of(2) || !height.is_multiple_of(2) {
        return false;
    }
    // 8K ceiling across the software encoders we drive.
    let _ = codec;
    width <= 7680 && height <= 4320
}

#[derive(Clone, Debug)]
pub struct ExportSettings {
    pub container: Container,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub video_bitrate_bps: u64,
    pub audio_bitrate_bps: u64,
    pub key_frame_interval_sec: f64,
    pub audio_only: bool,
}

impl ExportSettings {
    pub fn mp4(width: u32, height: u32, fps: Fps) -> Self {
        Self {
            container: Container::Mp4,
            video_codec: None,
            audio_codec: None,
            width,
            height,
            fps,
            video_bitrate_bps: 8_000_000,
            audio_bitrate_bps: 192_000,
            key_frame_interval_sec: 2.0,
            audio_only: false,
        }
    }

    pub fn audio_only(&self) -> bool {
        self.audio_only || self.container.is_audio_only()
    }

    pub fn resolved_video_codec(&self) -> Option<VideoCodec> {
        if self.audio_only() {
            return None;
        }
        self.video_codec.or(self.container.default_video_codec())
    }

    pub fn resolved_audio_codec(&self) -> Option<AudioCodec> {
        self.audio_codec.or(self.container.default_audio_codec())
    }

    pub fn validate(&self) -> MontageResult<()> {
        Fps::new(self.fps.0)?;
        if !self.audio_only() {
            if self.width == 0 || self.height == 0 {
                return Err(MontageError::validation(
                    "export width/height must be > 0",
                ));
            }
            if !self.width.is_multiple_of(2) || !self.height.is_multiple_of(2) {
                return Err(MontageError::validation(
                    "export width/height must be even",
                ));
            }
            let codec = self.resolved_video_codec().ok_or_else(|| {
                MontageError::codec(format!(
                    "container '{:?}' cannot carry video",
                    self.container
                ))
            })?;
            if !self.container.video_codecs().contains(&codec) {
                return Err(MontageError::codec(format!(
                    "codec {codec:?} is not supported in container {:?}",
                    self.container
                )));
            }
            if !supports_video_codec(codec, self.width, self.height) {
                return Err(MontageError::codec(format!(
                    "codec {codec:?} cannot encode {}x{}",
                    self.width, self.height
                )));
            }
        }
        if let Some(audio) = self.audio_codec
            && !self.container.audio_codecs().contains(&audio)
        {
            return Err(MontageError::codec(format!(
                "audio codec {audio:?} is not supported in container {:?}",
                self.container
            )));
        }
        Ok(())
    }
}

/// Configuration handed to an encoder at `begin`.
#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub settings: ExportSettings,
    /// Straight RGBA background used when flattening alpha.
    pub background_rgba: [u8; 4],
    pub has_audio: bool,
}

/// One finished video frame, flattened to straight RGBA over the background.
#[derive(Clone, Copy, Debug)]
pub struct VideoSample<'a> {
    pub timestamp_s: f64,
    pub duration_s: f64,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub rgba8: &'a [u8],
}

#[derive(Clone, Debug)]
pub struct EncodedOutput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Encoder contract. `push_frame` is called in strictly increasing timestamp
/// order; audio (when present) arrives once, before the first frame.
pub trait Encoder {
    fn begin(&mut self, config: &EncoderConfig) -> MontageResult<()>;
    fn push_audio(&mut self, interleaved_f32: &[f32], sample_rate: u32, channels: u16)
    -> MontageResult<()>;
    fn push_frame(&mut self, sample: &VideoSample<'_>) -> MontageResult<()>;
    fn finish(&mut self) -> MontageResult<EncodedOutput>;
    fn abort(&mut self);
}

pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path(suffix: &str) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("montage-{}-{n}.{suffix}", std::process::id()))
}

/// Production encoder: one `ffmpeg` mux invocation fed rawvideo over stdin
/// plus (optionally) a temporary f32le audio file.
pub struct FfmpegEncoder {
    config: Option<EncoderConfig>,
    child: Option<Child>,
    audio_path: Option<PathBuf>,
    out_path: Option<PathBuf>,
    last_timestamp: f64,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            config: None,
            child: None,
            audio_path: None,
            out_path: None,
            last_timestamp: f64::NEG_INFINITY,
        }
    }

    fn spawn(&mut self) -> MontageResult<()> {
        if self.child.is_some() {
            return Ok(());
        }
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| MontageError::encoder("encoder used before begin"))?;
        let settings = &config.settings;
        let container = settings.container;
        let out_path = temp_path(container.extension());

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-v", "error", "-y"]);

        let audio_only = settings.audio_only();
        if !audio_only {
            cmd.args([
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "-s",
                &format!("{}x{}", settings.width, settings.height),
                "-r",
                &settings.fps.0.to_string(),
                "-i",
                "pipe:0",
            ]);
        }
        if let Some(audio_path) = &self.audio_path {
            cmd.args([
                "-f",
                "f32le",
                "-ar",
                &MIX_SAMPLE_RATE.to_string(),
                "-ac",
                "2",
            ]);
            cmd.arg("-i").arg(audio_path);
        }

        if !audio_only {
            let codec = settings.resolved_video_codec().ok_or_else(|| {
                MontageError::codec("no video codec available for container")
            })?;
            let gop = (settings.key_frame_interval_sec * settings.fps.as_f64())
                .round()
                .max(1.0) as u64;
            cmd.args([
                "-c:v",
                codec.ffmpeg_encoder(),
                "-b:v",
                &settings.video_bitrate_bps.to_string(),
                "-g",
                &gop.to_string(),
                "-pix_fmt",
                "yuv420p",
            ]);
        }
        if self.audio_path.is_some() {
            let audio_codec = settings.resolved_audio_codec().ok_or_else(|| {
                MontageError::codec("no audio codec available for container")
            })?;
            cmd.args([
                "-c:a",
                audio_codec.ffmpeg_encoder(),
                "-b:a",
                &settings.audio_bitrate_bps.to_string(),
            ]);
        } else if audio_only {
            return Err(MontageError::encoder(
                "audio-only export requires a mixed audio buffer",
            ));
        }
        if matches!(container, Container::Mp4) {
            cmd.args(["-movflags", "+faststart"]);
        }
        cmd.args(["-f", container.ffmpeg_format()]);
        cmd.arg(&out_path);

        cmd.stdin(if audio_only {
            Stdio::null()
        } else {
            Stdio::piped()
        });
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| MontageError::encoder(format!("failed to start ffmpeg: {e}")))?;
        self.child = Some(child);
        self.out_path = Some(out_path);
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(path) = self.audio_path.take() {
            let _ = std::fs::remove_file(path);
        }
        if let Some(path) = self.out_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn begin(&mut self, config: &EncoderConfig) -> MontageResult<()> {
        if !is_ffmpeg_on_path() {
            return Err(MontageError::encoder(
                "ffmpeg is required for encoding but was not found on PATH",
            ));
        }
        config.settings.validate()?;
        self.config = Some(config.clone());
        self.last_timestamp = f64::NEG_INFINITY;
        Ok(())
    }

    fn push_audio(
        &mut self,
        interleaved_f32: &[f32],
        sample_rate: u32,
        channels: u16,
    ) -> MontageResult<()> {
        if sample_rate != MIX_SAMPLE_RATE || channels != 2 {
            return Err(MontageError::encoder(
                "ffmpeg encoder expects 48 kHz stereo input audio",
            ));
        }
        if self.child.is_some() {
            return Err(MontageError::encoder(
                "audio must be submitted before the first video frame",
            ));
        }
        let path = temp_path("pcm");
        let mut bytes = Vec::with_capacity(interleaved_f32.len() * 4);
        for &s in interleaved_f32 {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        std::fs::write(&path, bytes)
            .map_err(|e| MontageError::encoder(format!("failed to write audio temp: {e}")))?;
        self.audio_path = Some(path);
        Ok(())
    }

    fn push_frame(&mut self, sample: &VideoSample<'_>) -> MontageResult<()> {
        if sample.timestamp_s <= self.last_timestamp {
            return Err(MontageError::encoder(
                "video samples must be submitted in strictly increasing timestamp order",
            ));
        }
        self.spawn()?;
        self.last_timestamp = sample.timestamp_s;

        let child = self
            .child
            .as_mut()
            .ok_or_else(|| MontageError::encoder("ffmpeg process missing"))?;
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| MontageError::encoder("ffmpeg stdin closed"))?;
        stdin
            .write_all(sample.rgba8)
            .map_err(|e| MontageError::encoder(format!("ffmpeg rejected frame: {e}")))
    }

    fn finish(&mut self) -> MontageResult<EncodedOutput> {
        // Audio-only exports never pushed a frame, so the mux may not have
        // started yet.
        if let Err(e) = self.spawn() {
            self.cleanup();
            return Err(e);
        }
        let config = self
            .config
            .take()
            .ok_or_else(|| MontageError::encoder("finish before begin"))?;

        let mut child = self
            .child
            .take()
            .ok_or_else(|| MontageError::encoder("ffmpeg process missing"))?;
        drop(child.stdin.take());
        let output = child
            .wait_with_output()
            .map_err(|e| MontageError::encoder(format!("ffmpeg wait failed: {e}")))?;
        if !output.status.success() {
            self.cleanup();
            return Err(MontageError::encoder(format!(
                "ffmpeg finalize failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let out_path = self
            .out_path
            .clone()
            .ok_or_else(|| MontageError::encoder("output path missing"))?;
        let bytes = std::fs::read(&out_path)
            .map_err(|e| MontageError::encoder(format!("failed to read output: {e}")))?;
        self.cleanup();

        let mime_type = config
            .settings
            .container
            .mime_type(config.settings.resolved_video_codec());
        Ok(EncodedOutput { bytes, mime_type })
    }

    fn abort(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.cleanup();
        self.config = None;
    }
}

/// Deterministic in-memory encoder for tests: "encoding" is a byte-stable
/// concatenation of the pushed frames and audio.
#[derive(Default)]
pub struct InMemoryEncoder {
    config: Option<EncoderConfig>,
    frames: Vec<(f64, bool, Vec<u8>)>,
    audio: Option<Vec<f32>>,
    last_timestamp: f64,
    aborted: bool,
}

impl InMemoryEncoder {
    pub fn new() -> Self {
        Self {
            last_timestamp: f64::NEG_INFINITY,
            ..Self::default()
        }
    }

    pub fn frames(&self) -> &[(f64, bool, Vec<u8>)] {
        &self.frames
    }

    pub fn audio(&self) -> Option<&[f32]> {
        self.audio.as_deref()
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted
    }
}

impl Encoder for InMemoryEncoder {
    fn begin(&mut self, config: &EncoderConfig) -> MontageResult<()> {
        config.settings.validate()?;
        self.config = Some(config.clone());
        self.frames.clear();
        self.audio = None;
        self.last_timestamp = f64::NEG_INFINITY;
        self.aborted = false;
        Ok(())
    }

    fn push_audio(
        &mut self,
        interleaved_f32: &[f32],
        _sample_rate: u32,
        _channels: u16,
    ) -> MontageResult<()> {
        self.audio = Some(interleaved_f32.to_vec());
        Ok(())
    }

    fn push_frame(&mut self, sample: &VideoSample<'_>) -> MontageResult<()> {
        if sample.timestamp_s <= self.last_timestamp {
            return Err(MontageError::encoder(
                "video samples must be submitted in strictly increasing timestamp order",
            ));
        }
        self.last_timestamp = sample.timestamp_s;
        self.frames
            .push((sample.timestamp_s, sample.keyframe, sample.rgba8.to_vec()));
        Ok(())
    }

    fn finish(&mut self) -> MontageResult<EncodedOutput> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| MontageError::encoder("finish before begin"))?;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"MEM0");
        bytes.extend_from_slice(&(self.frames.len() as u32).to_le_bytes());
        for (_, _, data) in &self.frames {
            bytes.extend_from_slice(data);
        }
        if let Some(audio) = &self.audio {
            for s in audio {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
        }

        let mime_type = config
            .settings
            .container
            .mime_type(config.settings.resolved_video_codec());
        Ok(EncodedOutput { bytes, mime_type })
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.frames.clear();
        self.audio = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_follow_the_container_matrix() {
        assert_eq!(
            Container::Mp4.mime_type(Some(VideoCodec::Avc)),
            "video/mp4; codecs=\"avc1.42E01E\""
        );
        assert_eq!(
            Container::Webm.mime_type(Some(VideoCodec::Vp9)),
            "video/webm; codecs=\"vp09.00.10.08\""
        );
        assert_eq!(Container::Mov.mime_type(Some(VideoCodec::Hevc)), "video/mov");
        assert_eq!(Container::Mkv.mime_type(None), "video/x-matroska");
        assert_eq!(Container::Mp3.mime_type(None), "audio/mpeg");
        assert_eq!(Container::Wav.mime_type(None), "audio/wav");
    }

    #[test]
    fn codec_availability_per_container() {
        assert!(Container::Mp4.video_codecs().contains(&VideoCodec::Avc));
        assert!(!Container::Mp4.video_codecs().contains(&VideoCodec::Vp9));
        assert!(Container::Mkv.video_codecs().contains(&VideoCodec::Av1));
        assert_eq!(Container::Wav.audio_codecs(), &[AudioCodec::PcmS16]);
    }

    #[test]
    fn settings_validation_rejects_odd_dimensions() {
        let mut s = ExportSettings::mp4(1921, 1080, Fps(30));
        assert!(s.validate().is_err());
        s.width = 1920;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn settings_validation_rejects_cross_container_codecs() {
        let mut s = ExportSettings::mp4(1280, 720, Fps(30));
        s.video_codec = Some(VideoCodec::Vp9);
        assert!(s.validate().is_err());

        s.container = Container::Webm;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn supports_video_codec_requires_even_dims() {
        assert!(supports_video_codec(VideoCodec::Avc, 1920, 1080));
        assert!(!supports_video_codec(VideoCodec::Avc, 1921, 1080));
        assert!(!supports_video_codec(VideoCodec::Avc, 0, 1080));
    }

    #[test]
    fn in_memory_encoder_enforces_timestamp_order() {
        let mut enc = InMemoryEncoder::new();
        enc.begin(&EncoderConfig {
            settings: ExportSettings::mp4(16, 16, Fps(30)),
            background_rgba: [0, 0, 0, 255],
            has_audio: false,
        })
        .unwrap();

        let data = vec![0u8; 16 * 16 * 4];
        let frame = |t: f64| VideoSample {
            timestamp_s: t,
            duration_s: 1.0 / 30.0,
            keyframe: t == 0.0,
            width: 16,
            height: 16,
            rgba8: &data,
        };
        enc.push_frame(&frame(0.0)).unwrap();
        enc.push_frame(&frame(1.0 / 30.0)).unwrap();
        assert!(enc.push_frame(&frame(1.0 / 30.0)).is_err());
    }

    #[test]
    fn in_memory_encoder_output_is_deterministic() {
        let run = || {
            let mut enc = InMemoryEncoder::new();
            enc.begin(&EncoderConfig {
                settings: ExportSettings::mp4(2, 2, Fps(30)),
                background_rgba: [0, 0, 0, 255],
                has_audio: false,
            })
            .unwrap();
            let data = vec![7u8; 2 * 2 * 4];
            enc.push_frame(&VideoSample {
                timestamp_s: 0.0,
                duration_s: 1.0 / 30.0,
                keyframe: true,
                width: 2,
                height: 2,
                rgba8: &data,
            })
            .unwrap();
            enc.finish().unwrap().bytes
        };
        assert_eq!(run(), run());
    }
}
