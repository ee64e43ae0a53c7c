//! Audio mixdown scenarios and cancellation behavior.

mod support;

use montage::{
    CancellationToken, CompositionLibrary, Container, Easing, ExportSettings, Fps, FrameIndex,
    FrameRange, InMemoryEncoder, MontageError, RenderOptions, RenderPhase, RenderProgress, render,
};
use support::{NoFonts, SyntheticStore, color_image, comp, item, tone_audio, track};

fn options(c: &montage::Composition) -> RenderOptions {
    RenderOptions {
        settings: Some(ExportSettings::mp4(c.width, c.height, c.fps)),
        range: None,
        cancel: CancellationToken::new(),
    }
}

/// Invariant 6: the mixed audio is exactly `round(duration/fps * 48000)`
/// frames long (one f32 pair per frame).
#[test]
fn mixed_audio_length_matches_duration() {
    let c = comp(
        30,
        90,
        16,
        16,
        vec![track("t", 0, vec![item("a", 0, 90, tone_audio(0.5, 9000))])],
    );
    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();
    let mut encoder = InMemoryEncoder::new();
    render(&c, &library, &store, &fonts, &mut encoder, &options(&c), None).unwrap();

    let audio = encoder.audio().expect("audio submitted");
    assert_eq!(audio.len(), 144_000 * 2);
}

/// S4: keyframed volume with an in-point trim. After trimming 24 frames the
/// ramp restarts from its synthesized midpoint and reaches unity at export
/// frame 24.
#[test]
fn trimmed_volume_ramp_carries_synthesized_keyframe() {
    let mut c = comp(
        30,
        96,
        16,
        16,
        vec![track("t", 0, vec![item("a", 0, 96, tone_audio(0.5, 9600))])],
    );
    c.keyframes.push(montage::ItemKeyframes {
        item_id: "a".to_string(),
        properties: vec![montage::PropertyKeyframes {
            property: montage::Property::Volume,
            keyframes: vec![
                montage::Keyframe {
                    frame: 0,
                    value: -60.0,
                    easing: Easing::Linear,
                    easing_config: None,
                },
                montage::Keyframe {
                    frame: 48,
                    value: 0.0,
                    easing: Easing::Linear,
                    easing_config: None,
                },
            ],
        }],
    });

    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();
    let mut encoder = InMemoryEncoder::new();
    let mut opts = options(&c);
    opts.range = Some(FrameRange::new(FrameIndex(24), FrameIndex(96)).unwrap());
    render(&c, &library, &store, &fonts, &mut encoder, &opts, None).unwrap();

    let audio = encoder.audio().expect("audio submitted");
    // Export frame 0 carries the ramp midpoint (-30 dB ≈ 0.0316 gain).
    let first = audio[100].abs();
    let expected_first = 0.5 * 10f32.powf(-30.0 / 20.0);
    assert!(
        (first - expected_first).abs() < 0.01,
        "first {first} vs {expected_first}"
    );
    // At export frame 24 (0.8 s) the ramp reaches unity.
    let at_unity = audio[(48_000 + 1000) * 2].abs();
    assert!((at_unity - 0.5).abs() < 0.02, "unity {at_unity}");
}

/// S6: cancelling mid-render aborts the encoder, produces no bytes, and stops
/// progress immediately.
#[test]
fn cancellation_mid_render_produces_no_output() {
    let c = comp(
        30,
        300,
        16,
        16,
        vec![track("t", 0, vec![item("img", 0, 300, color_image("ffffff", 16, 16))])],
    );
    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();
    let mut encoder = InMemoryEncoder::new();

    let opts = options(&c);
    let cancel = opts.cancel.clone();
    let mut seen_frames: Vec<u64> = Vec::new();
    let mut on_progress = |p: RenderProgress| {
        if p.phase == RenderPhase::Rendering
            && let Some(frame) = p.current_frame
        {
            seen_frames.push(frame);
            if frame == 100 {
                cancel.cancel();
            }
        }
    };

    let result = render(
        &c,
        &library,
        &store,
        &fonts,
        &mut encoder,
        &opts,
        Some(&mut on_progress),
    );

    assert!(matches!(result, Err(MontageError::Cancelled)));
    assert!(encoder.was_aborted());
    assert!(encoder.frames().is_empty());
    assert_eq!(seen_frames.iter().max(), Some(&100));
}

/// A cancelled render never reaches the finalize phase.
#[test]
fn cancellation_suppresses_late_progress() {
    let c = comp(
        30,
        120,
        16,
        16,
        vec![track("t", 0, vec![item("img", 0, 120, color_image("ffffff", 16, 16))])],
    );
    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();
    let mut encoder = InMemoryEncoder::new();

    let opts = options(&c);
    let cancel = opts.cancel.clone();
    let mut phases: Vec<RenderPhase> = Vec::new();
    let mut on_progress = |p: RenderProgress| {
        phases.push(p.phase);
        if p.current_frame == Some(10) {
            cancel.cancel();
        }
    };

    let result = render(
        &c,
        &library,
        &store,
        &fonts,
        &mut encoder,
        &opts,
        Some(&mut on_progress),
    );
    assert!(result.is_err());
    assert!(!phases.contains(&RenderPhase::Finalizing));
}

/// Audio-only export: frames are skipped entirely and the mime type follows
/// the audio container.
#[test]
fn audio_only_export_skips_video() {
    let c = comp(
        30,
        60,
        16,
        16,
        vec![track("t", 0, vec![item("a", 0, 60, tone_audio(0.25, 6000))])],
    );
    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();
    let mut encoder = InMemoryEncoder::new();

    let mut settings = ExportSettings::mp4(16, 16, Fps(30));
    settings.container = Container::Wav;
    let opts = RenderOptions {
        settings: Some(settings),
        range: None,
        cancel: CancellationToken::new(),
    };

    let result = render(&c, &library, &store, &fonts, &mut encoder, &opts, None).unwrap();
    assert!(encoder.frames().is_empty());
    assert!(encoder.audio().is_some());
    assert_eq!(result.mime_type, "audio/wav");
}

/// Transition-expanded audio keeps playing through the window with an
/// equal-power fade rather than cutting at the clip boundary.
#[test]
fn video_audio_extends_into_transition_window() {
    // Two "video" clips backed by the synthetic store's tone + solid frames
    // do not exist; segment extraction is validated at the unit level. Here
    // we check the end-to-end mixdown stays the right length with a plain
    // audio underlay plus video-free transition clips.
    let mut c = comp(
        30,
        150,
        16,
        16,
        vec![
            track(
                "v",
                0,
                vec![
                    item("a", 0, 60, color_image("ff0000", 16, 16)),
                    item("b", 60, 90, color_image("00ff00", 16, 16)),
                ],
            ),
            track("music", 1, vec![item("m", 0, 150, tone_audio(0.4, 15000))]),
        ],
    );
    c.transitions.push(montage::Transition {
        id: "tr".to_string(),
        track_id: "v".to_string(),
        left_clip_id: "a".to_string(),
        right_clip_id: "b".to_string(),
        presentation: montage::TransitionPresentation::Fade,
        direction: None,
        duration_in_frames: 30,
        alignment: 0.5,
        timing: Easing::Linear,
        bezier_points: None,
    });

    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();
    let mut encoder = InMemoryEncoder::new();
    render(&c, &library, &store, &fonts, &mut encoder, &options(&c), None).unwrap();

    let audio = encoder.audio().expect("audio submitted");
    assert_eq!(audio.len(), 240_000 * 2);
    assert!((audio[48_000 * 2] - 0.4).abs() < 0.01);
}
