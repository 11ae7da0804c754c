//! Burnin is a frame-accurate video compositing and re-encode pipeline.
//!
//! Given a source video, it normalizes orientation exactly once, burns in positioned image
//! overlays, applies an optional color filter and re-encodes the result, passing the source
//! audio through untouched:
//!
//! - Describe the work as an [`ExportJob`]
//! - Run it with an [`Exporter`] (blocking) or an [`EditingSession`] (background, cancellable)
//! - Inspect the single terminal [`ExportOutcome`]
#![forbid(unsafe_code)]

mod foundation;

/// Export options and logging configuration.
pub mod config;
/// Closed catalog of color filters.
pub mod filter;
/// Orientation canonicalization and the per-job geometry plan.
pub mod geometry;
/// Tracing subscriber setup.
pub mod logging;
/// Decode, encode, probing and thumbnail extraction.
pub mod media;
/// Overlay descriptors and preview to render space conversion.
pub mod overlay;
/// Job orchestration and pump scheduling.
pub mod pipeline;
/// Compositor backends.
pub mod render;

pub use crate::foundation::core::{Affine, Fps, Point, Rect, Size, Timestamp, Vec2};
pub use crate::foundation::error::{ErrorKind, ExportError, ExportResult};

pub use crate::config::{BackendKind, EncoderOpts, ExportOpts, LoggingConfig, PumpOpts};
pub use crate::filter::{ColorTransform, FILTER_CATALOG_VERSION, FilterSpec};
pub use crate::geometry::{
    CorrectionSite, FitPolicy, GeometryInput, GeometryPlan, GeometryPreference, Orientation,
    RawMatrix, RenderTarget, Rotation, compute_transform,
};
pub use crate::logging::init_logging;
pub use crate::media::{
    FfmpegMedia, FrameSink, FrameSource, MediaBackend, ThumbnailPolicy, TrackInfo,
};
pub use crate::overlay::{OverlayBitmap, OverlayDescriptor, PreparedOverlay, PreviewSpace};
pub use crate::pipeline::{
    CancellationToken, EditingSession, ExportHandle, ExportJob, ExportOutcome, ExportReport,
    Exporter, SessionPolicy,
};
pub use crate::render::{Compositor, CompositorFactory, FrameRGBA, SurfacePool};
