use std::sync::Arc;

use crate::config::{BackendKind, ExportOpts};
use crate::filter::ColorTransform;
use crate::foundation::core::{Affine, Size};
use crate::foundation::error::{ExportError, ExportResult};
use crate::geometry::GeometryPlan;
use crate::overlay::PreparedOverlay;
use crate::render::surface_pool::{PooledBuffer, SurfacePool};

/// Straight RGBA8 frame, tightly packed, row-major.
pub struct FrameRGBA {
    width: u32,
    height: u32,
    data: PooledBuffer,
}

impl FrameRGBA {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> ExportResult<Self> {
        let expected = Size::new(width, height).byte_len_rgba8();
        if data.len() != expected {
            return Err(ExportError::validation(format!(
                "frame {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data: PooledBuffer::unpooled(data),
        })
    }

    /// Frame backed by a pooled buffer; its storage goes back to `pool` when dropped.
    pub fn pooled(pool: &Arc<SurfacePool>, size: Size) -> Self {
        Self {
            width: size.width,
            height: size.height,
            data: pool.borrow(size),
        }
    }

    /// Solid-color frame (tests, letterbox checks).
    pub fn filled(size: Size, rgba: [u8; 4]) -> Self {
        let data = rgba.repeat(size.byte_len_rgba8() / 4);
        Self {
            width: size.width,
            height: size.height,
            data: PooledBuffer::unpooled(data),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let o = ((y as usize) * (self.width as usize) + x as usize) * 4;
        let d = self.data();
        Some([d[o], d[o + 1], d[o + 2], d[o + 3]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let o = ((y as usize) * (self.width as usize) + x as usize) * 4;
        self.data_mut()[o..o + 4].copy_from_slice(&rgba);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_vec()
    }
}

impl Clone for FrameRGBA {
    fn clone(&self) -> Self {
        Self {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
        }
    }
}

impl std::fmt::Debug for FrameRGBA {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRGBA")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data().len())
            .finish()
    }
}

/// Everything a compositor draws besides the decoded frame. Fixed for the whole job.
#[derive(Clone, Debug)]
pub struct CompositeScene {
    source_size: Size,
    render_size: Size,
    draw: Affine,
    overlays: Vec<PreparedOverlay>,
    filter: ColorTransform,
}

impl CompositeScene {
    pub fn new(plan: &GeometryPlan, overlays: Vec<PreparedOverlay>, filter: ColorTransform) -> Self {
        Self {
            source_size: plan.native_size(),
            render_size: plan.render_size(),
            draw: plan.draw_transform(),
            overlays,
            filter,
        }
    }

    pub fn source_size(&self) -> Size {
        self.source_size
    }

    pub fn render_size(&self) -> Size {
        self.render_size
    }

    /// Source-pixel -> render-pixel transform.
    pub fn draw_transform(&self) -> Affine {
        self.draw
    }

    /// In draw order: later entries land on top.
    pub fn overlays(&self) -> &[PreparedOverlay] {
        &self.overlays
    }

    pub fn filter(&self) -> &ColorTransform {
        &self.filter
    }

    /// Nothing but a straight copy: no geometry change, overlays or filter.
    pub fn is_passthrough(&self) -> bool {
        self.overlays.is_empty()
            && self.filter.is_identity()
            && self.source_size == self.render_size
            && self.draw == Affine::IDENTITY
    }

    pub(crate) fn validate(&self) -> ExportResult<()> {
        if self.render_size.is_empty() {
            return Err(ExportError::validation("render size is empty"));
        }
        if self.draw.determinant().abs() < f64::EPSILON {
            return Err(ExportError::validation("frame draw transform is degenerate"));
        }
        if let Some(i) = self
            .overlays
            .iter()
            .position(|o| o.transform().determinant().abs() < f64::EPSILON)
        {
            return Err(ExportError::validation(format!(
                "overlay {i} transform is degenerate"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompositorStats {
    pub frames: u64,
    /// GPU objects (textures, buffers, bind groups) created over the compositor's lifetime.
    pub gpu_allocations: u64,
}

/// Per-frame compositor: decoded frame in, render-space frame out.
///
/// `prepare` runs once per job before any frame is pulled; it is where overlay textures and
/// other per-job resources are created, so its failures surface as setup errors.
pub trait Compositor: Send {
    fn name(&self) -> &'static str;

    fn prepare(&mut self, scene: CompositeScene) -> ExportResult<()>;

    /// Draw `frame` with the prepared scene. Synchronous: the result is fully read back.
    fn composite_frame(&mut self, frame: &FrameRGBA) -> ExportResult<FrameRGBA>;

    fn stats(&self) -> CompositorStats;
}

/// Creates the compositor for a job. Swappable so callers can observe (or fake) device setup.
pub trait CompositorFactory: Send + Sync {
    fn create(&self, opts: &ExportOpts, pool: Arc<SurfacePool>) -> ExportResult<Box<dyn Compositor>>;
}

/// Factory backed by [`create_compositor`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCompositorFactory;

impl CompositorFactory for DefaultCompositorFactory {
    fn create(&self, opts: &ExportOpts, pool: Arc<SurfacePool>) -> ExportResult<Box<dyn Compositor>> {
        create_compositor(opts.backend, pool)
    }
}

pub fn create_compositor(
    kind: BackendKind,
    pool: Arc<SurfacePool>,
) -> ExportResult<Box<dyn Compositor>> {
    match kind {
        BackendKind::Cpu => Ok(Box::new(crate::render::cpu::CpuCompositor::new(pool))),
        #[cfg(feature = "gpu")]
        BackendKind::Gpu => Ok(Box::new(crate::render::gpu::GpuCompositor::new(pool)?)),
        #[cfg(not(feature = "gpu"))]
        BackendKind::Gpu => Err(ExportError::gpu_setup(
            "gpu backend requested but burnin was built without the `gpu` feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::surface_pool::SurfacePoolOpts;

    #[test]
    fn frame_rejects_wrong_byte_len() {
        assert!(FrameRGBA::new(2, 2, vec![0; 15]).is_err());
        let f = FrameRGBA::new(2, 1, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(f.pixel(1, 0), Some([5, 6, 7, 8]));
        assert_eq!(f.pixel(2, 0), None);
    }

    #[test]
    fn pooled_frames_recycle_storage() {
        let pool = SurfacePool::new(SurfacePoolOpts::default());
        drop(FrameRGBA::pooled(&pool, Size::new(4, 4)));
        let _f = FrameRGBA::pooled(&pool, Size::new(4, 4));
        assert_eq!(pool.stats().reused_surfaces, 1);
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn gpu_without_feature_is_a_setup_error() {
        let pool = SurfacePool::new(SurfacePoolOpts::default());
        let err = create_compositor(BackendKind::Gpu, pool).err().unwrap();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::GpuSetup);
    }
}
