use std::path::Path;
use std::sync::Arc;

use crate::foundation::core::Size;
use crate::foundation::error::ExportResult;
use crate::render::surface_pool::SurfacePool;

pub mod ffmpeg_sink;
pub mod memory;
mod mkv;
pub mod probe;
pub mod sink;
pub mod source;
pub mod thumbnail;

pub use ffmpeg_sink::{FfmpegSink, ffmpeg_tools_available};
pub use memory::{InMemoryMedia, InMemorySink, InMemorySource, ReadyPattern, SinkRecord, SinkRecorder};
pub use probe::{TrackInfo, probe};
pub use sink::{FrameSink, SinkConfig, StreamKind, Submission};
pub use source::{EncodedSample, FfmpegSource, FrameSource, VideoSample};
pub use thumbnail::{ThumbnailPolicy, extract_thumbnail, resolve_thumbnail_path};

/// Opens the decode and encode ends of a job.
pub trait MediaBackend: Send + Sync {
    fn open_source(&self, path: &Path, pool: Arc<SurfacePool>) -> ExportResult<Box<dyn FrameSource>>;

    fn open_sink(&self, cfg: SinkConfig) -> ExportResult<Box<dyn FrameSink>>;

    /// Write one still frame of the finished `output` to `dest`.
    fn extract_thumbnail(&self, output: &Path, dest: &Path) -> ExportResult<Size>;
}

/// Media backend driving the system `ffmpeg`/`ffprobe` binaries.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegMedia;

impl MediaBackend for FfmpegMedia {
    fn open_source(&self, path: &Path, pool: Arc<SurfacePool>) -> ExportResult<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegSource::open(path, pool)?))
    }

    fn open_sink(&self, cfg: SinkConfig) -> ExportResult<Box<dyn FrameSink>> {
        Ok(Box::new(FfmpegSink::open(cfg)?))
    }

    fn extract_thumbnail(&self, output: &Path, dest: &Path) -> ExportResult<Size> {
        extract_thumbnail(output, dest)
    }
}
