//! Small builders shared by unit tests.

use crate::core::Fps;
use crate::model::{
    Composition, ImageItem, ItemKind, MediaItem, ShapeItem, ShapeType, TimelineItem, Track,
};

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

pub fn image_item() -> ItemKind {
    ItemKind::Image(ImageItem {
        src: "img.png".to_string(),
        natural_width: 1920,
        natural_height: 1080,
    })
}

pub fn media_item(src: &str, source_start: u64, source_duration: u64) -> MediaItem {
    MediaItem {
        src: src.to_string(),
        source_start,
        source_end: source_duration,
        source_duration,
        speed: 1.0,
        volume: 0.0,
        muted: false,
    }
}

pub fn video_item(src: &str, source_start: u64, source_duration: u64) -> ItemKind {
    ItemKind::Video(media_item(src, source_start, source_duration))
}

pub fn audio_item(src: &str, source_start: u64, source_duration: u64) -> ItemKind {
    ItemKind::Audio(media_item(src, source_start, source_duration))
}

pub fn shape_item(shape_type: ShapeType) -> ItemKind {
    ItemKind::Shape(ShapeItem {
        shape_type,
        fill_color: "#ffffff".to_string(),
        stroke_color: None,
        stroke_width: 0.0,
        is_mask: false,
        mask_type: Default::default(),
        mask_invert: false,
        mask_feather: 0.0,
    })
}
