use std::path::PathBuf;
use std::sync::Arc;

use crate::filter;
use crate::foundation::core::Size;
use crate::foundation::error::{ErrorKind, ExportError, ExportResult};
use crate::geometry::{
    CorrectionSite, GeometryInput, GeometryPlan, GeometryPreference, Orientation,
    compute_transform,
};
use crate::media::probe::TrackInfo;
use crate::media::sink::SinkConfig;
use crate::media::thumbnail::resolve_thumbnail_path;
use crate::media::{FfmpegMedia, MediaBackend};
use crate::overlay::{PreviewSpace, prepare_overlays};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::job::ExportJob;
use crate::pipeline::scheduler::run_pumps;
use crate::render::backend::{CompositeScene, CompositorFactory, DefaultCompositorFactory};
use crate::render::surface_pool::SurfacePool;

/// What a successful export produced.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ExportReport {
    pub output: PathBuf,
    /// `None` when disabled or when extraction failed.
    pub thumbnail: Option<PathBuf>,
    pub render_size: Size,
    pub correction_site: CorrectionSite,
    pub frames: u64,
    pub audio_samples: u64,
}

/// Exactly one terminal outcome per job.
#[derive(Debug)]
pub enum ExportOutcome {
    Completed(ExportReport),
    Failed(ExportError),
    Cancelled,
}

impl ExportOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Kind of the terminal error, `Cancelled` included.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(e) => Some(e.kind()),
            Self::Cancelled => Some(ErrorKind::Cancelled),
        }
    }

    pub fn into_result(self) -> ExportResult<ExportReport> {
        match self {
            Self::Completed(report) => Ok(report),
            Self::Failed(e) => Err(e),
            Self::Cancelled => Err(ExportError::Cancelled),
        }
    }
}

impl From<ExportResult<ExportReport>> for ExportOutcome {
    fn from(res: ExportResult<ExportReport>) -> Self {
        match res {
            Ok(report) => Self::Completed(report),
            Err(ExportError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e),
        }
    }
}

/// Runs export jobs end to end: open, plan, prepare, pump, finish, thumbnail.
#[derive(Clone)]
pub struct Exporter {
    media: Arc<dyn MediaBackend>,
    compositors: Arc<dyn CompositorFactory>,
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Exporter {
    /// Exporter backed by the system `ffmpeg`/`ffprobe`.
    pub fn new() -> Self {
        Self {
            media: Arc::new(FfmpegMedia),
            compositors: Arc::new(DefaultCompositorFactory),
        }
    }

    pub fn with_media(mut self, media: Arc<dyn MediaBackend>) -> Self {
        self.media = media;
        self
    }

    pub fn with_compositor_factory(mut self, factory: Arc<dyn CompositorFactory>) -> Self {
        self.compositors = factory;
        self
    }

    /// Run `job` to completion on the calling thread.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(source = %job.source.display(), output = %job.output.display())
    )]
    pub fn run(&self, job: &ExportJob, cancel: &CancellationToken) -> ExportOutcome {
        let outcome = ExportOutcome::from(self.try_run(job, cancel));
        match &outcome {
            ExportOutcome::Completed(r) => tracing::info!(
                frames = r.frames,
                audio_samples = r.audio_samples,
                render_size = %r.render_size,
                thumbnail = r.thumbnail.is_some(),
                "export completed"
            ),
            ExportOutcome::Failed(e) => tracing::error!(error = %e, "export failed"),
            ExportOutcome::Cancelled => tracing::info!("export cancelled"),
        }
        outcome
    }

    fn try_run(&self, job: &ExportJob, cancel: &CancellationToken) -> ExportResult<ExportReport> {
        job.validate()?;
        let opts = &job.opts;
        let pool = SurfacePool::new(opts.pool);

        // Open before any compositor exists: unreadable sources never touch the GPU.
        let mut source = self.media.open_source(&job.source, pool.clone())?;
        let info = source.info().clone();
        tracing::debug!(
            native_size = %info.native_size,
            fps = %info.fps,
            has_audio = info.has_audio,
            "source opened"
        );

        let plan = plan_geometry(job, &info)?;
        let preview = job
            .preview
            .unwrap_or_else(|| PreviewSpace::new(
                f64::from(plan.render_size().width),
                f64::from(plan.render_size().height),
            ));
        let overlays = prepare_overlays(&job.overlays, &preview, &plan)?;
        let scene = CompositeScene::new(&plan, overlays, filter::resolve(job.filter));

        let mut compositor = self.compositors.create(opts, pool.clone())?;
        compositor.prepare(scene)?;
        tracing::debug!(
            compositor = compositor.name(),
            render_size = %plan.render_size(),
            site = ?plan.correction_site(),
            "compositor prepared"
        );

        if cancel.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let sink = self.media.open_sink(SinkConfig {
            output: job.output.clone(),
            render_size: plan.render_size(),
            fps: info.fps,
            has_audio: info.has_audio,
            audio_source: info.has_audio.then(|| job.source.clone()),
            container_orientation: plan.container_orientation(),
            encoder: opts.encoder.clone(),
            queue_depth: opts.sink_queue_depth,
            audio_interleave_window: opts.audio_interleave_window(),
            overwrite: opts.overwrite,
        })?;

        let streams = source.video_frames().and_then(|video| {
            let audio = if info.has_audio {
                Some(source.audio_samples()?)
            } else {
                None
            };
            Ok((video, audio))
        });
        let pumped = streams.and_then(|(video, audio)| {
            run_pumps(video, audio, compositor.as_mut(), sink.as_ref(), cancel, &opts.pump)
        });
        let report = match pumped {
            Ok(report) => report,
            Err(e) => {
                sink.abort();
                return Err(e);
            }
        };
        let output = sink.finish()?;

        let thumbnail = resolve_thumbnail_path(&job.thumbnail, &output).and_then(|dest| {
            match self.media.extract_thumbnail(&output, &dest) {
                Ok(size) => {
                    tracing::debug!(path = %dest.display(), size = %size, "thumbnail written");
                    Some(dest)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "thumbnail extraction failed");
                    None
                }
            }
        });

        Ok(ExportReport {
            output,
            thumbnail,
            render_size: plan.render_size(),
            correction_site: plan.correction_site(),
            frames: report.frames,
            audio_samples: report.audio_samples,
        })
    }
}

/// Pick the single stage that corrects orientation for `job`.
///
/// Container metadata is only used when nothing is drawn in render space and the orientation
/// is a pure rotation; mirrored orientations and any overlay, filter or target size force the
/// compositor.
pub fn choose_site(job: &ExportJob, info: &TrackInfo) -> CorrectionSite {
    if job.opts.geometry == GeometryPreference::Compositor {
        return CorrectionSite::Compositor;
    }
    let orientation = job
        .orientation_override
        .or(info.orientation)
        .map(Orientation::from_matrix)
        .unwrap_or_default()
        .with_extra_mirror(job.mirrored);
    let draws_in_render_space =
        !job.overlays.is_empty() || job.filter.is_some() || job.target.size.is_some();
    if draws_in_render_space || orientation.mirrored {
        CorrectionSite::Compositor
    } else {
        CorrectionSite::ContainerMetadata
    }
}

fn plan_geometry(job: &ExportJob, info: &TrackInfo) -> ExportResult<GeometryPlan> {
    compute_transform(GeometryInput {
        native_size: info.native_size,
        orientation_meta: job.orientation_override.or(info.orientation),
        mirrored: job.mirrored,
        target: job.target,
        site: choose_site(job, info),
    })
}
