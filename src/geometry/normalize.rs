use crate::foundation::core::{Affine, Size, Vec2};
use crate::foundation::error::{ExportError, ExportResult};
use crate::geometry::orientation::{Orientation, RawMatrix};

/// How the oriented source is placed into the render target.
///
/// Must be the same policy the live preview used, otherwise overlays captured against the
/// preview land in the wrong place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitPolicy {
    /// Inscribe uniformly; the remainder is letterboxed.
    Fit,
    /// Cover uniformly; the overflow is cropped.
    #[default]
    Fill,
}

impl FitPolicy {
    /// Uniform scale and centering offset that place `content` into `frame`.
    pub fn placement(self, content: Vec2, frame: Vec2) -> (f64, Vec2) {
        if content.x <= 0.0 || content.y <= 0.0 {
            return (1.0, Vec2::ZERO);
        }
        let sx = frame.x / content.x;
        let sy = frame.y / content.y;
        let s = match self {
            Self::Fit => sx.min(sy),
            Self::Fill => sx.max(sy),
        };
        let offset = (frame - content * s) * 0.5;
        (s, offset)
    }

    /// Affine placing `content` into `frame` (content-space -> frame-space).
    pub fn transform(self, content: Vec2, frame: Vec2) -> Affine {
        let (s, offset) = self.placement(content, frame);
        Affine::translate(offset) * Affine::scale(s)
    }
}

/// Canonical output pixel size plus fit policy, fixed for the whole job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenderTarget {
    /// Desired output size; `None` means "the oriented native size".
    #[serde(default)]
    pub size: Option<Size>,
    #[serde(default)]
    pub fit: FitPolicy,
}

impl Default for RenderTarget {
    fn default() -> Self {
        Self {
            size: None,
            fit: FitPolicy::Fill,
        }
    }
}

/// Which stage carries the orientation correction.
///
/// Exactly one of them does; [`GeometryPlan`] derives both the draw transform and the container
/// metadata from this single value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionSite {
    /// Pixels are rotated/mirrored while compositing; the container carries no orientation.
    Compositor,
    /// Pixels stay in stored orientation; the container's display matrix carries it.
    ContainerMetadata,
}

/// Caller preference for [`CorrectionSite`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryPreference {
    #[default]
    Compositor,
    /// Use container metadata when nothing is drawn in render space (no overlays, no filter,
    /// no explicit target size). Falls back to the compositor otherwise.
    ContainerMetadataWhenPossible,
}

/// Everything the rest of the pipeline needs to know about geometry, computed once per job.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryPlan {
    native_size: Size,
    orientation: Orientation,
    render_size: Size,
    fit: FitPolicy,
    site: CorrectionSite,
    draw: Affine,
}

impl GeometryPlan {
    pub fn native_size(&self) -> Size {
        self.native_size
    }

    pub fn render_size(&self) -> Size {
        self.render_size
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn fit(&self) -> FitPolicy {
        self.fit
    }

    pub fn correction_site(&self) -> CorrectionSite {
        self.site
    }

    /// Source-pixel -> render-pixel transform for the compositor's frame draw.
    pub fn draw_transform(&self) -> Affine {
        self.draw
    }

    /// Orientation to stamp on the output container, if the container carries it.
    pub fn container_orientation(&self) -> Option<Orientation> {
        match self.site {
            CorrectionSite::ContainerMetadata if !self.orientation.is_identity() => {
                Some(self.orientation)
            }
            _ => None,
        }
    }

    /// Size of the picture a viewer sees after container metadata is honored.
    pub fn display_size(&self) -> Size {
        match self.site {
            CorrectionSite::Compositor => self.render_size,
            CorrectionSite::ContainerMetadata => self.orientation.oriented_size(self.render_size),
        }
    }
}

/// Inputs to [`compute_transform`].
#[derive(Clone, Copy, Debug)]
pub struct GeometryInput {
    pub native_size: Size,
    pub orientation_meta: Option<RawMatrix>,
    pub mirrored: bool,
    pub target: RenderTarget,
    pub site: CorrectionSite,
}

/// Compute the render size and the single geometric correction for a job.
pub fn compute_transform(input: GeometryInput) -> ExportResult<GeometryPlan> {
    let native = input.native_size;
    if native.is_empty() {
        return Err(ExportError::validation(format!(
            "source has empty frame size {native}"
        )));
    }

    let orientation = input
        .orientation_meta
        .map(Orientation::from_matrix)
        .unwrap_or_default()
        .with_extra_mirror(input.mirrored);
    let fit = input.target.fit;

    match input.site {
        CorrectionSite::Compositor => {
            let oriented = orientation.oriented_size(native);
            let render_size = input.target.size.unwrap_or(oriented).even_floor();
            let place = fit.transform(oriented.as_vec2(), render_size.as_vec2());
            Ok(GeometryPlan {
                native_size: native,
                orientation,
                render_size,
                fit,
                site: CorrectionSite::Compositor,
                draw: place * orientation.transform(native),
            })
        }
        CorrectionSite::ContainerMetadata => {
            if input.target.size.is_some() {
                return Err(ExportError::validation(
                    "container-metadata orientation cannot be combined with an explicit target size",
                ));
            }
            let render_size = native.even_floor();
            let place = fit.transform(native.as_vec2(), render_size.as_vec2());
            Ok(GeometryPlan {
                native_size: native,
                orientation,
                render_size,
                fit,
                site: CorrectionSite::ContainerMetadata,
                draw: place,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::core::Point;
    use crate::geometry::orientation::Rotation;

    fn portrait_meta() -> RawMatrix {
        RawMatrix::new(0.0, 1.0, -1.0, 0.0, 1080.0, 0.0)
    }

    fn input(site: CorrectionSite) -> GeometryInput {
        GeometryInput {
            native_size: Size::new(1920, 1080),
            orientation_meta: Some(portrait_meta()),
            mirrored: false,
            target: RenderTarget::default(),
            site,
        }
    }

    #[test]
    fn rotated_source_swaps_render_size() {
        let plan = compute_transform(input(CorrectionSite::Compositor)).unwrap();
        assert_eq!(plan.render_size(), Size::new(1080, 1920));
        assert_eq!(plan.orientation().rotation, Rotation::R90);
        assert_eq!(plan.container_orientation(), None);
    }

    #[test]
    fn marker_lands_at_predicted_coordinate() {
        let plan = compute_transform(input(CorrectionSite::Compositor)).unwrap();
        // Stored pixel center (10.5, 20.5) under a clockwise quarter turn of a 1920x1080 frame.
        let p = plan.draw_transform() * Point::new(10.5, 20.5);
        assert!((p.x - (1080.0 - 20.5)).abs() < 1e-9);
        assert!((p.y - 10.5).abs() < 1e-9);
    }

    #[test]
    fn container_site_keeps_native_pixels() {
        let plan = compute_transform(input(CorrectionSite::ContainerMetadata)).unwrap();
        assert_eq!(plan.render_size(), Size::new(1920, 1080));
        assert_eq!(plan.draw_transform(), Affine::IDENTITY);
        assert_eq!(
            plan.container_orientation().map(|o| o.rotation),
            Some(Rotation::R90)
        );
        assert_eq!(plan.display_size(), Size::new(1080, 1920));
    }

    #[test]
    fn fit_letterboxes_and_fill_crops() {
        let content = Vec2::new(200.0, 100.0);
        let frame = Vec2::new(100.0, 100.0);

        let (s, off) = FitPolicy::Fit.placement(content, frame);
        assert_eq!(s, 0.5);
        assert_eq!(off, Vec2::new(0.0, 25.0));

        let (s, off) = FitPolicy::Fill.placement(content, frame);
        assert_eq!(s, 1.0);
        assert_eq!(off, Vec2::new(-50.0, 0.0));
    }

    #[test]
    fn explicit_target_is_even_and_fitted() {
        let mut inp = input(CorrectionSite::Compositor);
        inp.target = RenderTarget {
            size: Some(Size::new(721, 721)),
            fit: FitPolicy::Fit,
        };
        let plan = compute_transform(inp).unwrap();
        assert_eq!(plan.render_size(), Size::new(720, 720));
        let top_left = plan.draw_transform() * Point::new(0.0, 1080.0);
        // Oriented 1080x1920 inscribed in 720x720: scale 0.375, 157.5px side bars.
        assert!((top_left.x - 157.5).abs() < 1e-9);
        assert!(top_left.y.abs() < 1e-9);
    }

    #[test]
    fn mirrored_capture_flips_horizontally() {
        let mut inp = input(CorrectionSite::Compositor);
        inp.orientation_meta = None;
        inp.mirrored = true;
        let plan = compute_transform(inp).unwrap();
        let p = plan.draw_transform() * Point::new(0.0, 0.0);
        assert_eq!((p.x, p.y), (1920.0, 0.0));
    }

    #[test]
    fn empty_native_size_is_rejected() {
        let mut inp = input(CorrectionSite::Compositor);
        inp.native_size = Size::new(0, 1080);
        assert!(compute_transform(inp).is_err());
    }

    #[test]
    fn container_site_rejects_explicit_target() {
        let mut inp = input(CorrectionSite::ContainerMetadata);
        inp.target.size = Some(Size::new(640, 360));
        assert!(compute_transform(inp).is_err());
    }
}
