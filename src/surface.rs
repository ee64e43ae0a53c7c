use crate::error::{MontageError, MontageResult};

/// A premultiplied RGBA8 drawing target backed by a [`vello_cpu::Pixmap`].
pub struct Surface {
    pixmap: vello_cpu::Pixmap,
    width: u32,
    height: u32,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> MontageResult<Self> {
        let w: u16 = width
            .try_into()
            .map_err(|_| MontageError::evaluation("surface width exceeds u16"))?;
        let h: u16 = height
            .try_into()
            .map_err(|_| MontageError::evaluation("surface height exceeds u16"))?;
        if width == 0 || height == 0 {
            return Err(MontageError::evaluation("surface dimensions must be > 0"));
        }
        Ok(Self {
            pixmap: vello_cpu::Pixmap::new(w, h),
            width,
            height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        self.pixmap.data_as_u8_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.pixmap.data_as_u8_slice_mut()
    }

    pub fn pixmap_mut(&mut self) -> &mut vello_cpu::Pixmap {
        &mut self.pixmap
    }

    pub fn clear(&mut self) {
        self.data_mut().fill(0);
    }

    pub fn fill(&mut self, premul_rgba: [u8; 4]) {
        for px in self.data_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&premul_rgba);
        }
    }

    pub fn copy_from(&mut self, src: &Surface) -> MontageResult<()> {
        if src.width != self.width || src.height != self.height {
            return Err(MontageError::evaluation(
                "copy_from requires equal surface dimensions",
            ));
        }
        self.data_mut().copy_from_slice(src.data());
        Ok(())
    }

    /// Nearest-neighbor scale copy, used when export resolution differs from
    /// composition resolution.
    pub fn scale_from(&mut self, src: &Surface) -> MontageResult<()> {
        if src.width == self.width && src.height == self.height {
            return self.copy_from(src);
        }
        let (dw, dh) = (self.width as usize, self.height as usize);
        let (sw, sh) = (src.width as usize, src.height as usize);
        let src_data = src.data();
        let dst = self.data_mut();
        for y in 0..dh {
            let sy = (y * sh) / dh;
            for x in 0..dw {
                let sx = (x * sw) / dw;
                let s = (sy * sw + sx) * 4;
                let d = (y * dw + x) * 4;
                dst[d..d + 4].copy_from_slice(&src_data[s..s + 4]);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SurfacePoolStats {
    pub acquired: u64,
    pub allocated: u64,
    pub discarded_on_release: u64,
}

/// Bounded pool of canvas-sized surfaces for one render task.
///
/// Acquire hands back a cleared surface; release keeps it for reuse until the
/// cap, after which surfaces are temporaries dropped on release.
pub struct SurfacePool {
    width: u32,
    height: u32,
    free: Vec<Surface>,
    max_retained: usize,
    stats: SurfacePoolStats,
}

impl SurfacePool {
    pub const DEFAULT_MAX_RETAINED: usize = 12;

    pub fn new(width: u32, height: u32) -> Self {
        Self::with_capacity(width, height, Self::DEFAULT_MAX_RETAINED)
    }

    pub fn with_capacity(width: u32, height: u32, max_retained: usize) -> Self {
        Self {
            width,
            height,
            free: Vec::new(),
            max_retained,
            stats: SurfacePoolStats::default(),
        }
    }

    pub fn stats(&self) -> SurfacePoolStats {
        self.stats
    }

    pub fn acquire(&mut self) -> MontageResult<Surface> {
        self.stats.acquired += 1;
        if let Some(mut surface) = self.free.pop() {
            surface.clear();
            return Ok(surface);
        }
        self.stats.allocated += 1;
        Surface::new(self.width, self.height)
    }

    pub fn release(&mut self, surface: Surface) {
        if surface.width != self.width
            || surface.height != self.height
            || self.free.len() >= self.max_retained
        {
            self.stats.discarded_on_release += 1;
            return;
        }
        self.free.push(surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_cleared_surface() {
        let mut pool = SurfacePool::new(4, 4);
        let mut s = pool.acquire().unwrap();
        s.fill([9, 9, 9, 9]);
        pool.release(s);

        let s = pool.acquire().unwrap();
        assert!(s.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn pool_reuses_released_surfaces() {
        let mut pool = SurfacePool::new(4, 4);
        let s = pool.acquire().unwrap();
        pool.release(s);
        let _ = pool.acquire().unwrap();
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().acquired, 2);
    }

    #[test]
    fn pool_discards_beyond_cap() {
        let mut pool = SurfacePool::with_capacity(4, 4, 1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().discarded_on_release, 1);
    }

    #[test]
    fn scale_from_doubles_pixels() {
        let mut src = Surface::new(2, 2).unwrap();
        src.data_mut()[0..4].copy_from_slice(&[255, 0, 0, 255]);
        let mut dst = Surface::new(4, 4).unwrap();
        dst.scale_from(&src).unwrap();
        // Top-left 2x2 block comes from the red source pixel.
        assert_eq!(&dst.data()[0..4], &[255, 0, 0, 255]);
        assert_eq!(&dst.data()[(4 + 1) * 4..(4 + 1) * 4 + 4], &[255, 0, 0, 255]);
    }
}
