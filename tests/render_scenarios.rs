//! End-to-end rendering scenarios against the in-memory encoder.

mod support;

use montage::{
    CancellationToken, CompositionLibrary, Easing, Encoder, EncoderConfig, ExportSettings, Fps,
    FrameIndex, FrameRange, InMemoryEncoder, RenderOptions, Transition, TransitionPresentation,
    render,
};
use support::{NoFonts, SyntheticStore, color_image, comp, item, track};

fn render_with(
    composition: &montage::Composition,
    options: RenderOptions,
) -> (montage::MontageResult<montage::RenderResult>, InMemoryEncoder) {
    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();
    let mut encoder = InMemoryEncoder::new();
    let result = render(
        composition,
        &library,
        &store,
        &fonts,
        &mut encoder,
        &options,
        None,
    );
    (result, encoder)
}

fn default_options(c: &montage::Composition) -> RenderOptions {
    RenderOptions {
        settings: Some(ExportSettings::mp4(c.width, c.height, c.fps)),
        range: None,
        cancel: CancellationToken::new(),
    }
}

fn px(frame: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let idx = ((y * width + x) * 4) as usize;
    [frame[idx], frame[idx + 1], frame[idx + 2], frame[idx + 3]]
}

/// S1: a single static image covering the canvas produces identical frames,
/// no audio track, and an mp4 mime type.
#[test]
fn static_image_renders_identical_frames() {
    let c = comp(
        30,
        90,
        64,
        36,
        vec![track("t", 0, vec![item("img", 0, 90, color_image("3366cc", 64, 36))])],
    );
    let (result, encoder) = render_with(&c, default_options(&c));
    let result = result.unwrap();

    assert_eq!(encoder.frames().len(), 90);
    assert!(encoder.audio().is_none());
    assert!(result.mime_type.starts_with("video/mp4"));
    assert!((result.duration_seconds - 3.0).abs() < 1e-9);

    let first = &encoder.frames()[0].2;
    assert_eq!(px(first, 64, 32, 18), [51, 102, 204, 255]);
    for (_, _, frame) in encoder.frames() {
        assert_eq!(frame, first);
    }
    // Only the first sample is flagged as a keyframe.
    assert!(encoder.frames()[0].1);
    assert!(encoder.frames()[1..].iter().all(|(_, k, _)| !k));
}

/// S2: adjacent clips with a 30-frame fade. The window spans 45..75, the
/// midpoint blends at equal power, and both clips render normally outside it.
#[test]
fn fade_transition_covers_its_window() {
    let mut c = comp(
        30,
        150,
        32,
        32,
        vec![track(
            "t",
            0,
            vec![
                item("a", 0, 60, color_image("ff0000", 32, 32)),
                item("b", 60, 90, color_image("00ff00", 32, 32)),
            ],
        )],
    );
    c.transitions.push(Transition {
        id: "tr".to_string(),
        track_id: "t".to_string(),
        left_clip_id: "a".to_string(),
        right_clip_id: "b".to_string(),
        presentation: TransitionPresentation::Fade,
        direction: None,
        duration_in_frames: 30,
        alignment: 0.5,
        timing: Easing::Linear,
        bezier_points: None,
    });

    let (result, encoder) = render_with(&c, default_options(&c));
    result.unwrap();
    assert_eq!(encoder.frames().len(), 150);

    let sample = |f: usize| px(&encoder.frames()[f].2, 32, 16, 16);

    // Before the window: pure outgoing.
    assert_eq!(sample(0), [255, 0, 0, 255]);
    assert_eq!(sample(44), [255, 0, 0, 255]);
    // Inside the window both contribute; near the midpoint both sit around
    // equal power (~0.707).
    let mid = sample(60);
    assert!(mid[0] > 140 && mid[0] < 220, "mid {mid:?}");
    assert!(mid[1] > 140 && mid[1] < 220, "mid {mid:?}");
    // After the window: pure incoming.
    assert_eq!(sample(75), [0, 255, 0, 255]);
    assert_eq!(sample(149), [0, 255, 0, 255]);
}

/// S3: opacity keyframes are not inherited by split children.
#[test]
fn split_child_ignores_parent_opacity_keyframes() {
    let mut child = item("c2", 30, 30, color_image("ffffff", 16, 16));
    child.origin_id = Some("c1".to_string());
    let mut c = comp(
        30,
        60,
        16,
        16,
        vec![track(
            "t",
            0,
            vec![item("c1", 0, 30, color_image("ffffff", 16, 16)), child],
        )],
    );
    c.keyframes.push(montage::ItemKeyframes {
        item_id: "c1".to_string(),
        properties: vec![montage::PropertyKeyframes {
            property: montage::Property::Opacity,
            keyframes: vec![
                montage::Keyframe {
                    frame: 0,
                    value: 0.0,
                    easing: Easing::Linear,
                    easing_config: None,
                },
                montage::Keyframe {
                    frame: 60,
                    value: 1.0,
                    easing: Easing::Linear,
                    easing_config: None,
                },
            ],
        }],
    });

    let (result, encoder) = render_with(&c, default_options(&c));
    result.unwrap();

    // Parent at frame 0: opacity 0, background shows through.
    assert_eq!(px(&encoder.frames()[0].2, 16, 8, 8), [0, 0, 0, 255]);
    // Child at frame 30 renders fully opaque despite the parent ramp.
    assert_eq!(px(&encoder.frames()[30].2, 16, 8, 8), [255, 255, 255, 255]);
    assert_eq!(px(&encoder.frames()[59].2, 16, 8, 8), [255, 255, 255, 255]);
}

/// Determinism: two renders of the same composition produce byte-identical
/// output through a deterministic encoder.
#[test]
fn rendering_is_deterministic() {
    let mut c = comp(
        30,
        45,
        32,
        32,
        vec![track(
            "t",
            0,
            vec![item("img", 0, 45, color_image("884422", 32, 32))],
        )],
    );
    c.tracks[0].items[0].effects.push(montage::EffectInstance {
        kind: "rgb-split".to_string(),
        params: serde_json::json!({ "intensity": 0.8, "seed": 42 }),
        enabled: true,
        opacity: 1.0,
    });

    let (a, _) = render_with(&c, default_options(&c));
    let (b, _) = render_with(&c, default_options(&c));
    assert_eq!(a.unwrap().bytes, b.unwrap().bytes);
}

/// Invariant 2: on overlapping pixels the track with the smaller order wins.
#[test]
fn smaller_track_order_is_on_top() {
    let c = comp(
        30,
        30,
        16,
        16,
        vec![
            track("top", 0, vec![item("g", 0, 30, color_image("00ff00", 16, 16))]),
            track("behind", 3, vec![item("r", 0, 30, color_image("ff0000", 16, 16))]),
        ],
    );
    let (result, encoder) = render_with(&c, default_options(&c));
    result.unwrap();
    assert_eq!(px(&encoder.frames()[0].2, 16, 8, 8), [0, 255, 0, 255]);
}

/// Invariant 7 (proxy): content hidden behind a full-canvas occluder does not
/// change the output.
#[test]
fn occluded_content_does_not_change_pixels() {
    let base = comp(
        30,
        30,
        16,
        16,
        vec![track("top", 0, vec![item("cover", 0, 30, color_image("0000ff", 16, 16))])],
    );
    let with_hidden = comp(
        30,
        30,
        16,
        16,
        vec![
            track("top", 0, vec![item("cover", 0, 30, color_image("0000ff", 16, 16))]),
            track("behind", 1, vec![item("noise", 0, 30, color_image("ffffff", 16, 16))]),
        ],
    );

    let (a, _) = render_with(&base, default_options(&base));
    let (b, _) = render_with(&with_hidden, default_options(&with_hidden));
    assert_eq!(a.unwrap().bytes, b.unwrap().bytes);
}

/// Invariant 4: exporting a range equals trimming items and exporting whole.
#[test]
fn in_out_range_matches_manual_trim() {
    let ramp = |item_id: &str| montage::ItemKeyframes {
        item_id: item_id.to_string(),
        properties: vec![montage::PropertyKeyframes {
            property: montage::Property::Opacity,
            keyframes: vec![
                montage::Keyframe {
                    frame: 0,
                    value: 0.0,
                    easing: Easing::Linear,
                    easing_config: None,
                },
                montage::Keyframe {
                    frame: 48,
                    value: 1.0,
                    easing: Easing::Linear,
                    easing_config: None,
                },
            ],
        }],
    };

    let mut full = comp(
        30,
        60,
        16,
        16,
        vec![track("t", 0, vec![item("a", 0, 60, color_image("ffffff", 16, 16))])],
    );
    full.keyframes.push(ramp("a"));
    let mut options = default_options(&full);
    options.range = Some(FrameRange::new(FrameIndex(24), FrameIndex(60)).unwrap());
    let (ranged, _) = render_with(&full, options);

    // The equivalent manually trimmed composition: 36 frames, keyframes
    // re-based with a synthesized key at 0 carrying the ramp value 0.5.
    let mut trimmed = comp(
        30,
        36,
        16,
        16,
        vec![track("t", 0, vec![item("a", 0, 36, color_image("ffffff", 16, 16))])],
    );
    trimmed.keyframes.push(montage::ItemKeyframes {
        item_id: "a".to_string(),
        properties: vec![montage::PropertyKeyframes {
            property: montage::Property::Opacity,
            keyframes: vec![
                montage::Keyframe {
                    frame: 0,
                    value: 0.5,
                    easing: Easing::Linear,
                    easing_config: None,
                },
                montage::Keyframe {
                    frame: 24,
                    value: 1.0,
                    easing: Easing::Linear,
                    easing_config: None,
                },
            ],
        }],
    });
    let (manual, _) = render_with(&trimmed, default_options(&trimmed));

    assert_eq!(ranged.unwrap().bytes, manual.unwrap().bytes);
}

/// Invariant 9: a sub-composition with no video items equals inlining its
/// items at the container's transform.
#[test]
fn sub_composition_matches_inlined_items() {
    let sub = comp(
        30,
        30,
        16,
        16,
        vec![track("s", 0, vec![item("inner", 0, 30, color_image("00ffff", 16, 16))])],
    );
    let mut library = CompositionLibrary::new();
    library.insert("sub1".to_string(), sub);

    let nested = comp(
        30,
        30,
        16,
        16,
        vec![track(
            "t",
            0,
            vec![item(
                "holder",
                0,
                30,
                montage::ItemKind::Composition(montage::CompositionItem {
                    composition_id: "sub1".to_string(),
                    source_start: 0,
                }),
            )],
        )],
    );
    let inline = comp(
        30,
        30,
        16,
        16,
        vec![track("t", 0, vec![item("inner", 0, 30, color_image("00ffff", 16, 16))])],
    );

    let store = SyntheticStore;
    let fonts = NoFonts;
    let mut nested_encoder = InMemoryEncoder::new();
    render(
        &nested,
        &library,
        &store,
        &fonts,
        &mut nested_encoder,
        &default_options(&nested),
        None,
    )
    .unwrap();

    let (inline_result, inline_encoder) = render_with(&inline, default_options(&inline));
    inline_result.unwrap();

    for (a, b) in nested_encoder.frames().iter().zip(inline_encoder.frames()) {
        assert_eq!(a.2, b.2);
    }
}

/// Export scaling: settings resolution different from the composition's
/// scale-copies the output.
#[test]
fn export_scaling_resizes_output_frames() {
    let c = comp(
        30,
        10,
        16,
        16,
        vec![track("t", 0, vec![item("img", 0, 10, color_image("ff00ff", 16, 16))])],
    );
    let mut options = default_options(&c);
    options.settings = Some(ExportSettings::mp4(32, 32, Fps(30)));
    let (result, encoder) = render_with(&c, options);
    result.unwrap();
    assert_eq!(encoder.frames()[0].2.len(), 32 * 32 * 4);
    assert_eq!(px(&encoder.frames()[0].2, 32, 16, 16), [255, 0, 255, 255]);
}

/// Settings validation failures surface before any frame is produced.
#[test]
fn odd_export_dimensions_are_rejected() {
    let c = comp(
        30,
        10,
        16,
        16,
        vec![track("t", 0, vec![item("img", 0, 10, color_image("ffffff", 16, 16))])],
    );
    let mut options = default_options(&c);
    options.settings = Some(ExportSettings::mp4(17, 16, Fps(30)));
    let (result, encoder) = render_with(&c, options);
    assert!(result.is_err());
    assert!(encoder.frames().is_empty());
}

/// Encoder begin() receives a validated config even without explicit
/// settings.
#[test]
fn default_settings_follow_the_composition() {
    let c = comp(
        30,
        10,
        16,
        16,
        vec![track("t", 0, vec![item("img", 0, 10, color_image("ffffff", 16, 16))])],
    );
    let options = RenderOptions::default();
    let (result, encoder) = render_with(&c, options);
    let result = result.unwrap();
    assert_eq!(encoder.frames().len(), 10);
    assert!(result.byte_size > 0);
}

#[test]
fn encoder_config_reports_audio_presence() {
    // Pure-video composition: has_audio false.
    let c = comp(
        30,
        10,
        16,
        16,
        vec![track("t", 0, vec![item("img", 0, 10, color_image("ffffff", 16, 16))])],
    );
    let store = SyntheticStore;
    let fonts = NoFonts;
    let library = CompositionLibrary::new();

    struct ProbeEncoder {
        inner: InMemoryEncoder,
        has_audio: Option<bool>,
    }
    impl Encoder for ProbeEncoder {
        fn begin(&mut self, config: &EncoderConfig) -> montage::MontageResult<()> {
            self.has_audio = Some(config.has_audio);
            self.inner.begin(config)
        }
        fn push_audio(
            &mut self,
            a: &[f32],
            r: u32,
            ch: u16,
        ) -> montage::MontageResult<()> {
            self.inner.push_audio(a, r, ch)
        }
        fn push_frame(&mut self, s: &montage::VideoSample<'_>) -> montage::MontageResult<()> {
            self.inner.push_frame(s)
        }
        fn finish(&mut self) -> montage::MontageResult<montage::EncodedOutput> {
            self.inner.finish()
        }
        fn abort(&mut self) {
            self.inner.abort()
        }
    }

    let mut encoder = ProbeEncoder {
        inner: InMemoryEncoder::new(),
        has_audio: None,
    };
    render(
        &c,
        &library,
        &store,
        &fonts,
        &mut encoder,
        &default_options(&c),
        None,
    )
    .unwrap();
    assert_eq!(encoder.has_audio, Some(false));
}
