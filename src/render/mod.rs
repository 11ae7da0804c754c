//! Per-frame compositing: pooled surfaces, the CPU reference compositor and the wgpu one.

pub mod backend;
pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod surface_pool;

pub use backend::{
    CompositeScene, Compositor, CompositorFactory, CompositorStats, DefaultCompositorFactory,
    FrameRGBA, create_compositor,
};
pub use cpu::CpuCompositor;
#[cfg(feature = "gpu")]
pub use gpu::GpuCompositor;
pub use surface_pool::{PixelFormat, PooledBuffer, SurfacePool, SurfacePoolOpts, SurfacePoolStats};
