//! Geometry normalization: canonical orientation, render size and the single draw transform.

pub(crate) mod normalize;
pub(crate) mod orientation;

pub use normalize::{
    CorrectionSite, FitPolicy, GeometryInput, GeometryPlan, GeometryPreference, RenderTarget,
    compute_transform,
};
pub use orientation::{Orientation, RawMatrix, Rotation};
