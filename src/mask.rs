//! Shape masks: clip and alpha masks with optional feathering and inversion,
//! composited through `destination-in` against an alpha surface.

use crate::{
    blur::gaussian_blur_rgba8_premul,
    core::{Affine, BezPath},
    error::MontageResult,
    keyframe::AnimatedTransform,
    model::{MaskType, ShapeItem},
    raster::{Raster, item_affine, shape_path},
    surface::{Surface, SurfacePool},
};

/// One active mask at the current frame, with the animated rotation already
/// baked into the path coordinates.
#[derive(Clone, Debug)]
pub struct MaskLayer {
    pub path: BezPath,
    pub mask_type: MaskType,
    pub invert: bool,
    pub feather: f64,
}

/// Build the canvas-space mask path for a mask shape at its animated
/// transform.
pub fn mask_layer_for(shape: &ShapeItem, tr: &AnimatedTransform) -> MaskLayer {
    let mut path = shape_path(shape.shape_type, tr.width, tr.height, tr.corner_radius);
    path.apply_affine(item_affine(tr));
    MaskLayer {
        path,
        mask_type: shape.mask_type,
        invert: shape.mask_invert,
        feather: shape.mask_feather.max(0.0),
    }
}

/// Apply `masks` to `content` in place, one after another.
pub fn apply_masks(
    content: &mut Surface,
    masks: &[MaskLayer],
    raster: &mut Raster,
    pool: &mut SurfacePool,
) -> MontageResult<()> {
    for mask in masks {
        let mut alpha = pool.acquire()?;
        raster.fill_path(&mut alpha, &mask.path, Affine::IDENTITY, [255, 255, 255, 255])?;

        if mask.feather > 0.0 {
            let (w, h) = (alpha.width(), alpha.height());
            gaussian_blur_rgba8_premul(alpha.data_mut(), w, h, (mask.feather / 2.0) as f32)?;
        }

        crate::composite::destination_in_alpha(content.data_mut(), alpha.data(), mask.invert)?;
        pool.release(alpha);
    }
    Ok(())
}
