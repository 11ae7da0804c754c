//! Positioned image overlays and their one-time conversion into render space.

use std::path::PathBuf;
use std::sync::Arc;

use image::RgbaImage;

use crate::foundation::core::{Affine, Point, Size, Vec2};
use crate::foundation::error::{ExportError, ExportResult};
use crate::geometry::{CorrectionSite, GeometryPlan};

/// Dimensions of the caller's coordinate space (usually the live preview view).
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PreviewSpace {
    pub width: f64,
    pub height: f64,
}

impl PreviewSpace {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    fn as_vec2(self) -> Vec2 {
        Vec2::new(self.width, self.height)
    }
}

/// Pixels of an overlay. Straight (non-premultiplied) RGBA.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayBitmap {
    /// Any still image the `image` crate can decode.
    Path(PathBuf),
    /// Already-rasterized pixels (captions, stickers rendered by the caller).
    #[serde(skip)]
    Image(Arc<RgbaImage>),
}

impl OverlayBitmap {
    fn load(&self) -> ExportResult<Arc<RgbaImage>> {
        let img = match self {
            Self::Image(img) => img.clone(),
            Self::Path(path) => {
                let decoded = image::open(path).map_err(|e| {
                    ExportError::validation(format!(
                        "failed to load overlay bitmap '{}': {e}",
                        path.display()
                    ))
                })?;
                Arc::new(decoded.to_rgba8())
            }
        };
        if img.width() == 0 || img.height() == 0 {
            return Err(ExportError::validation("overlay bitmap is empty"));
        }
        Ok(img)
    }
}

/// Bitmap plus its placement, as captured against a [`PreviewSpace`].
///
/// The overlay's box of `size` preview units is centered on `center`, scaled by `scale` and
/// rotated clockwise (y-down) by `rotation_rad` around its center.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct OverlayDescriptor {
    pub bitmap: OverlayBitmap,
    pub center: Point,
    #[serde(default)]
    pub rotation_rad: f64,
    #[serde(default = "unit_scale")]
    pub scale: Vec2,
    /// Box size in preview units; defaults to the bitmap's pixel size.
    #[serde(default)]
    pub size: Option<Vec2>,
}

fn unit_scale() -> Vec2 {
    Vec2::new(1.0, 1.0)
}

impl OverlayDescriptor {
    pub fn new(bitmap: OverlayBitmap, center: Point) -> Self {
        Self {
            bitmap,
            center,
            rotation_rad: 0.0,
            scale: unit_scale(),
            size: None,
        }
    }

    pub fn with_rotation(mut self, rotation_rad: f64) -> Self {
        self.rotation_rad = rotation_rad;
        self
    }

    pub fn with_scale(mut self, scale: Vec2) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_size(mut self, size: Vec2) -> Self {
        self.size = Some(size);
        self
    }

    /// Load the bitmap and resolve the bitmap-pixel -> render-pixel transform.
    ///
    /// The preview showed the upright picture placed with the plan's fit policy; the same
    /// policy places it into the render target, so the preview -> render map is
    /// `place_render * place_preview^-1`.
    pub fn to_render_space(
        &self,
        preview: &PreviewSpace,
        plan: &GeometryPlan,
    ) -> ExportResult<PreparedOverlay> {
        if plan.correction_site() != CorrectionSite::Compositor {
            return Err(ExportError::validation(
                "overlays require orientation to be corrected in the compositor",
            ));
        }
        if !(preview.width > 0.0 && preview.height > 0.0) {
            return Err(ExportError::validation(format!(
                "preview space must be positive, got {}x{}",
                preview.width, preview.height
            )));
        }
        if !(self.scale.x.is_finite() && self.scale.y.is_finite() && self.rotation_rad.is_finite())
        {
            return Err(ExportError::validation("overlay transform is not finite"));
        }

        let image = self.bitmap.load()?;
        let bitmap_px = Vec2::new(f64::from(image.width()), f64::from(image.height()));
        let size = self.size.unwrap_or(bitmap_px);

        let local = Affine::translate(self.center.to_vec2())
            * Affine::rotate(self.rotation_rad)
            * Affine::scale_non_uniform(self.scale.x, self.scale.y)
            * Affine::translate(size * -0.5)
            * Affine::scale_non_uniform(size.x / bitmap_px.x, size.y / bitmap_px.y);

        let transform = preview_to_render(preview, plan) * local;
        if transform.determinant().abs() < f64::EPSILON {
            return Err(ExportError::validation("overlay transform is degenerate"));
        }
        Ok(PreparedOverlay { image, transform })
    }
}

/// Map from preview coordinates to render-space pixels for `plan`.
pub fn preview_to_render(preview: &PreviewSpace, plan: &GeometryPlan) -> Affine {
    let oriented = plan
        .orientation()
        .oriented_size(plan.native_size())
        .as_vec2();
    let fit = plan.fit();
    let place_preview = fit.transform(oriented, preview.as_vec2());
    let place_render = fit.transform(oriented, plan.render_size().as_vec2());
    place_render * place_preview.inverse()
}

/// Overlay ready for compositing: pixels plus bitmap-pixel -> render-pixel transform.
#[derive(Clone, Debug)]
pub struct PreparedOverlay {
    image: Arc<RgbaImage>,
    transform: Affine,
}

impl PreparedOverlay {
    /// Build directly in render space (tests and callers that already work in render pixels).
    pub fn from_render_space(image: Arc<RgbaImage>, transform: Affine) -> Self {
        Self { image, transform }
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }

    pub fn transform(&self) -> Affine {
        self.transform
    }

    /// Stable identity of the pixel buffer, used to cache uploaded textures.
    #[cfg(feature = "gpu")]
    pub(crate) fn image_id(&self) -> usize {
        Arc::as_ptr(&self.image) as usize
    }
}

/// Convert an ordered overlay list. Order is preserved; later entries draw on top.
pub fn prepare_overlays(
    overlays: &[OverlayDescriptor],
    preview: &PreviewSpace,
    plan: &GeometryPlan,
) -> ExportResult<Vec<PreparedOverlay>> {
    overlays
        .iter()
        .map(|o| o.to_render_space(preview, plan))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{
        CorrectionSite, FitPolicy, GeometryInput, RawMatrix, RenderTarget, compute_transform,
    };

    fn solid(w: u32, h: u32) -> OverlayBitmap {
        OverlayBitmap::Image(Arc::new(RgbaImage::from_pixel(
            w,
            h,
            image::Rgba([255, 0, 0, 255]),
        )))
    }

    fn plan(meta: Option<RawMatrix>, target: RenderTarget) -> GeometryPlan {
        compute_transform(GeometryInput {
            native_size: Size::new(1920, 1080),
            orientation_meta: meta,
            mirrored: false,
            target,
            site: CorrectionSite::Compositor,
        })
        .unwrap()
    }

    fn approx(p: Point, x: f64, y: f64) {
        assert!(
            (p.x - x).abs() < 1e-6 && (p.y - y).abs() < 1e-6,
            "got {p:?}, want ({x}, {y})"
        );
    }

    #[test]
    fn preview_center_maps_to_render_center() {
        let plan = plan(None, RenderTarget::default());
        let preview = PreviewSpace::new(480.0, 270.0);
        let o = OverlayDescriptor::new(solid(10, 10), Point::new(240.0, 135.0))
            .to_render_space(&preview, &plan)
            .unwrap();
        // Bitmap center (5, 5) lands on the render center.
        approx(o.transform() * Point::new(5.0, 5.0), 960.0, 540.0);
        // 10 preview units become 40 render pixels (scale 4).
        approx(o.transform() * Point::new(0.0, 0.0), 940.0, 520.0);
    }

    #[test]
    fn fill_preview_crops_consistently_with_render() {
        // Portrait source shown in a square preview with aspect-fill.
        let meta = RawMatrix::new(0.0, 1.0, -1.0, 0.0, 0.0, 0.0);
        let plan = plan(Some(meta), RenderTarget::default());
        assert_eq!(plan.render_size(), Size::new(1080, 1920));
        let preview = PreviewSpace::new(300.0, 300.0);
        let m = preview_to_render(&preview, &plan);
        // Fill scale in preview is 300/1080; preview (0,0) is cropped content at x=0,
        // y=(1920*300/1080 - 300)/2 above the top.
        let p = m * Point::new(0.0, 0.0);
        approx(p, 0.0, (1920.0 - 1080.0) / 2.0);
        approx(m * Point::new(300.0, 300.0), 1080.0, 1500.0);
    }

    #[test]
    fn fit_policy_change_moves_overlay() {
        let preview = PreviewSpace::new(300.0, 300.0);
        let fill = plan(None, RenderTarget::default());
        let fit = plan(
            None,
            RenderTarget {
                size: None,
                fit: FitPolicy::Fit,
            },
        );
        let a = preview_to_render(&preview, &fill) * Point::new(0.0, 0.0);
        let b = preview_to_render(&preview, &fit) * Point::new(0.0, 0.0);
        assert!((a - b).hypot() > 1.0);
    }

    #[test]
    fn rotation_and_scale_apply_around_center() {
        let plan = plan(None, RenderTarget::default());
        let preview = PreviewSpace::new(1920.0, 1080.0);
        let o = OverlayDescriptor::new(solid(100, 50), Point::new(500.0, 500.0))
            .with_rotation(std::f64::consts::FRAC_PI_2)
            .with_scale(Vec2::new(2.0, 2.0))
            .to_render_space(&preview, &plan)
            .unwrap();
        approx(o.transform() * Point::new(50.0, 25.0), 500.0, 500.0);
        // Right edge midpoint: +100 px after scale, rotated a quarter turn clockwise (y-down).
        approx(o.transform() * Point::new(100.0, 25.0), 500.0, 600.0);
    }

    #[test]
    fn explicit_size_stretches_bitmap() {
        let plan = plan(None, RenderTarget::default());
        let preview = PreviewSpace::new(1920.0, 1080.0);
        let o = OverlayDescriptor::new(solid(10, 10), Point::new(100.0, 100.0))
            .with_size(Vec2::new(40.0, 20.0))
            .to_render_space(&preview, &plan)
            .unwrap();
        approx(o.transform() * Point::new(0.0, 0.0), 80.0, 90.0);
        approx(o.transform() * Point::new(10.0, 10.0), 120.0, 110.0);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let plan = plan(None, RenderTarget::default());
        let o = OverlayDescriptor::new(solid(10, 10), Point::new(1.0, 1.0));
        assert!(o.to_render_space(&PreviewSpace::new(0.0, 10.0), &plan).is_err());
        let flat = o.clone().with_scale(Vec2::new(0.0, 1.0));
        assert!(
            flat.to_render_space(&PreviewSpace::new(10.0, 10.0), &plan)
                .is_err()
        );
        let missing = OverlayDescriptor::new(
            OverlayBitmap::Path(PathBuf::from("/definitely/not/here.png")),
            Point::ZERO,
        );
        let err = missing
            .to_render_space(&PreviewSpace::new(10.0, 10.0), &plan)
            .unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Validation);
        assert!(err.to_string().contains("here.png"), "{err}");
    }

    #[test]
    fn undecodable_bitmap_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("caption.png");
        std::fs::write(&bogus, b"not a png").unwrap();
        let err = prepare_overlays(
            &[OverlayDescriptor::new(OverlayBitmap::Path(bogus), Point::ZERO)],
            &PreviewSpace::new(10.0, 10.0),
            &plan(None, RenderTarget::default()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Validation);
    }

    #[cfg(feature = "gpu")]
    #[test]
    fn shared_bitmaps_share_texture_identity() {
        let img = Arc::new(RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 4])));
        let a = PreparedOverlay::from_render_space(img.clone(), Affine::IDENTITY);
        let b = PreparedOverlay::from_render_space(img, Affine::translate((5.0, 5.0)));
        let c = PreparedOverlay::from_render_space(
            Arc::new(RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 4]))),
            Affine::IDENTITY,
        );
        assert_eq!(a.image_id(), b.image_id());
        assert_ne!(a.image_id(), c.image_id());
    }

    #[test]
    fn descriptor_deserializes_with_defaults() {
        let json = r#"{"bitmap":{"path":"caption.png"},"center":{"x":10.0,"y":20.0}}"#;
        let d: OverlayDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.scale, Vec2::new(1.0, 1.0));
        assert_eq!(d.rotation_rad, 0.0);
        assert!(d.size.is_none());
        assert!(matches!(d.bitmap, OverlayBitmap::Path(_)));
    }
}
