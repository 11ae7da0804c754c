use std::sync::Arc;

use rayon::prelude::*;

use crate::foundation::core::{Affine, Point, Rect};
use crate::foundation::error::{ExportError, ExportResult};
use crate::foundation::math::{blend_straight_over, sample_bilinear_rgba8};
use crate::render::backend::{CompositeScene, Compositor, CompositorStats, FrameRGBA};
use crate::render::surface_pool::SurfacePool;

const CLEAR: [u8; 4] = [0, 0, 0, 255];

struct OverlayDraw {
    index: usize,
    inverse: Affine,
    /// Render-space pixel bounds (inclusive start, exclusive end).
    x0: u32,
    x1: u32,
    y0: u32,
    y1: u32,
}

struct Prepared {
    scene: CompositeScene,
    frame_inverse: Affine,
    overlays: Vec<OverlayDraw>,
}

/// Reference compositor: inverse-mapped bilinear sampling, rows in parallel.
///
/// Matches the GPU compositor's semantics: black clear, straight-alpha source-over for the frame
/// and each overlay in list order, then the color transform.
pub struct CpuCompositor {
    pool: Arc<SurfacePool>,
    prepared: Option<Prepared>,
    frames: u64,
}

impl CpuCompositor {
    pub fn new(pool: Arc<SurfacePool>) -> Self {
        Self {
            pool,
            prepared: None,
            frames: 0,
        }
    }
}

fn pixel_bounds(bbox: Rect, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let clamp_x = |v: f64| v.clamp(0.0, f64::from(width)) as u32;
    let clamp_y = |v: f64| v.clamp(0.0, f64::from(height)) as u32;
    (
        clamp_x(bbox.x0.floor()),
        clamp_x(bbox.x1.ceil()),
        clamp_y(bbox.y0.floor()),
        clamp_y(bbox.y1.ceil()),
    )
}

fn inside(p: Point, w: u32, h: u32) -> bool {
    p.x >= 0.0 && p.y >= 0.0 && p.x < f64::from(w) && p.y < f64::from(h)
}

impl Compositor for CpuCompositor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn prepare(&mut self, scene: CompositeScene) -> ExportResult<()> {
        scene.validate()?;
        let render = scene.render_size();
        let overlays = scene
            .overlays()
            .iter()
            .enumerate()
            .map(|(index, o)| {
                let size = o.size();
                let local = Rect::new(0.0, 0.0, f64::from(size.width), f64::from(size.height));
                let (x0, x1, y0, y1) =
                    pixel_bounds(o.transform().transform_rect_bbox(local), render.width, render.height);
                OverlayDraw {
                    index,
                    inverse: o.transform().inverse(),
                    x0,
                    x1,
                    y0,
                    y1,
                }
            })
            .collect();
        self.prepared = Some(Prepared {
            frame_inverse: scene.draw_transform().inverse(),
            scene,
            overlays,
        });
        Ok(())
    }

    fn composite_frame(&mut self, frame: &FrameRGBA) -> ExportResult<FrameRGBA> {
        let Some(p) = self.prepared.as_ref() else {
            return Err(ExportError::composite("compositor used before prepare"));
        };
        let src_size = p.scene.source_size();
        if frame.size() != src_size {
            return Err(ExportError::composite(format!(
                "decoded frame is {}, expected {src_size}",
                frame.size()
            )));
        }

        let render = p.scene.render_size();
        let mut out = FrameRGBA::pooled(&self.pool, render);
        let row_bytes = render.width as usize * 4;
        let src = frame.data();

        out.data_mut()
            .par_chunks_mut(row_bytes)
            .enumerate()
            .for_each(|(y, row)| {
                let y = y as u32;
                let cy = f64::from(y) + 0.5;
                for (x, px) in row.chunks_exact_mut(4).enumerate() {
                    let c = Point::new(x as f64 + 0.5, cy);
                    let s = p.frame_inverse * c;
                    let rgba = if inside(s, src_size.width, src_size.height) {
                        blend_straight_over(
                            CLEAR,
                            sample_bilinear_rgba8(src, src_size.width, src_size.height, s.x, s.y),
                        )
                    } else {
                        CLEAR
                    };
                    px.copy_from_slice(&rgba);
                }

                for d in &p.overlays {
                    if y < d.y0 || y >= d.y1 {
                        continue;
                    }
                    let img = p.scene.overlays()[d.index].image();
                    let (bw, bh) = (img.width(), img.height());
                    let bytes = img.as_raw();
                    for x in d.x0..d.x1 {
                        let q = d.inverse * Point::new(f64::from(x) + 0.5, cy);
                        if !inside(q, bw, bh) {
                            continue;
                        }
                        let s = sample_bilinear_rgba8(bytes, bw, bh, q.x, q.y);
                        let o = x as usize * 4;
                        let dst = [row[o], row[o + 1], row[o + 2], row[o + 3]];
                        row[o..o + 4].copy_from_slice(&blend_straight_over(dst, s));
                    }
                }
            });

        p.scene.filter().apply_rgba8(out.data_mut())?;
        self.frames = self.frames.saturating_add(1);
        Ok(out)
    }

    fn stats(&self) -> CompositorStats {
        CompositorStats {
            frames: self.frames,
            gpu_allocations: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ColorTransform, FilterSpec};
    use crate::foundation::core::{Size, Vec2};
    use crate::geometry::{
        CorrectionSite, FitPolicy, GeometryInput, RawMatrix, RenderTarget, compute_transform,
    };
    use crate::overlay::PreparedOverlay;
    use crate::render::surface_pool::SurfacePoolOpts;
    use image::RgbaImage;

    fn pool() -> Arc<SurfacePool> {
        SurfacePool::new(SurfacePoolOpts::default())
    }

    fn plan(native: Size, meta: Option<RawMatrix>, target: RenderTarget) -> crate::geometry::GeometryPlan {
        compute_transform(GeometryInput {
            native_size: native,
            orientation_meta: meta,
            mirrored: false,
            target,
            site: CorrectionSite::Compositor,
        })
        .unwrap()
    }

    fn square(rgba: [u8; 4], side: u32, at: Vec2) -> PreparedOverlay {
        PreparedOverlay::from_render_space(
            Arc::new(RgbaImage::from_pixel(side, side, image::Rgba(rgba))),
            Affine::translate(at),
        )
    }

    #[test]
    fn identity_scene_copies_pixels() {
        let size = Size::new(8, 6);
        let mut c = CpuCompositor::new(pool());
        c.prepare(CompositeScene::new(
            &plan(size, None, RenderTarget::default()),
            vec![],
            ColorTransform::identity(),
        ))
        .unwrap();
        let mut src = FrameRGBA::filled(size, [10, 20, 30, 255]);
        src.set_pixel(3, 2, [200, 100, 50, 255]);
        let out = c.composite_frame(&src).unwrap();
        assert_eq!(out.data(), src.data());
    }

    #[test]
    fn quarter_turn_moves_marker_once() {
        let native = Size::new(16, 8);
        let meta = RawMatrix::new(0.0, 1.0, -1.0, 0.0, 8.0, 0.0);
        let plan = plan(native, Some(meta), RenderTarget::default());
        assert_eq!(plan.render_size(), Size::new(8, 16));

        let mut c = CpuCompositor::new(pool());
        c.prepare(CompositeScene::new(&plan, vec![], ColorTransform::identity()))
            .unwrap();
        let mut src = FrameRGBA::filled(native, [0, 0, 255, 255]);
        src.set_pixel(2, 5, [255, 0, 0, 255]);
        let out = c.composite_frame(&src).unwrap();
        assert_eq!(out.size(), Size::new(8, 16));
        // Stored (2,5) -> upright (H-1-5, 2) = (2, 2).
        assert_eq!(out.pixel(2, 2), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(5, 2), Some([0, 0, 255, 255]));
    }

    #[test]
    fn fit_letterboxes_with_black() {
        let native = Size::new(8, 4);
        let plan = plan(
            native,
            None,
            RenderTarget {
                size: Some(Size::new(8, 8)),
                fit: FitPolicy::Fit,
            },
        );
        let mut c = CpuCompositor::new(pool());
        c.prepare(CompositeScene::new(&plan, vec![], ColorTransform::identity()))
            .unwrap();
        let out = c
            .composite_frame(&FrameRGBA::filled(native, [255, 255, 255, 255]))
            .unwrap();
        assert_eq!(out.pixel(4, 0), Some(CLEAR));
        assert_eq!(out.pixel(4, 4), Some([255, 255, 255, 255]));
        assert_eq!(out.pixel(4, 7), Some(CLEAR));
    }

    #[test]
    fn later_overlay_wins_overlap() {
        let size = Size::new(16, 16);
        let mut c = CpuCompositor::new(pool());
        c.prepare(CompositeScene::new(
            &plan(size, None, RenderTarget::default()),
            vec![
                square([255, 0, 0, 255], 8, Vec2::new(2.0, 2.0)),
                square([0, 255, 0, 255], 8, Vec2::new(6.0, 6.0)),
            ],
            ColorTransform::identity(),
        ))
        .unwrap();
        let out = c
            .composite_frame(&FrameRGBA::filled(size, [0, 0, 0, 255]))
            .unwrap();
        assert_eq!(out.pixel(3, 3), Some([255, 0, 0, 255]));
        assert_eq!(out.pixel(7, 7), Some([0, 255, 0, 255]));
        assert_eq!(out.pixel(12, 12), Some([0, 255, 0, 255]));
        assert_eq!(out.pixel(0, 15), Some([0, 0, 0, 255]));
    }

    #[test]
    fn translucent_overlay_blends_straight_alpha() {
        let size = Size::new(4, 4);
        let mut c = CpuCompositor::new(pool());
        c.prepare(CompositeScene::new(
            &plan(size, None, RenderTarget::default()),
            vec![square([255, 255, 255, 128], 4, Vec2::ZERO)],
            ColorTransform::identity(),
        ))
        .unwrap();
        let out = c
            .composite_frame(&FrameRGBA::filled(size, [0, 0, 0, 255]))
            .unwrap();
        assert_eq!(out.pixel(1, 1), Some([128, 128, 128, 255]));
    }

    #[test]
    fn filter_runs_after_overlays() {
        let size = Size::new(8, 8);
        let mut c = CpuCompositor::new(pool());
        c.prepare(CompositeScene::new(
            &plan(size, None, RenderTarget::default()),
            vec![square([255, 0, 0, 255], 4, Vec2::ZERO)],
            FilterSpec::Mono.color_transform(),
        ))
        .unwrap();
        let out = c
            .composite_frame(&FrameRGBA::filled(size, [0, 0, 255, 255]))
            .unwrap();
        for (x, y) in [(1, 1), (6, 6)] {
            let px = out.pixel(x, y).unwrap();
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
        }
    }

    #[test]
    fn wrong_frame_size_is_a_composite_error() {
        let mut c = CpuCompositor::new(pool());
        assert!(
            c.composite_frame(&FrameRGBA::filled(Size::new(2, 2), CLEAR))
                .is_err()
        );
        c.prepare(CompositeScene::new(
            &plan(Size::new(4, 4), None, RenderTarget::default()),
            vec![],
            ColorTransform::identity(),
        ))
        .unwrap();
        let err = c
            .composite_frame(&FrameRGBA::filled(Size::new(2, 2), CLEAR))
            .unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Composite);
    }

    #[test]
    fn output_buffers_are_pooled_across_frames() {
        let size = Size::new(8, 8);
        let pool = pool();
        let mut c = CpuCompositor::new(pool.clone());
        c.prepare(CompositeScene::new(
            &plan(size, None, RenderTarget::default()),
            vec![],
            ColorTransform::identity(),
        ))
        .unwrap();
        let src = FrameRGBA::filled(size, CLEAR);
        for _ in 0..50 {
            drop(c.composite_frame(&src).unwrap());
        }
        assert_eq!(pool.stats().alloc_surfaces, 1);
        assert_eq!(c.stats().frames, 50);
    }
}
