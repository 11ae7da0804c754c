use std::path::PathBuf;
use std::time::Duration;

use crate::config::EncoderOpts;
use crate::foundation::core::{Fps, Size, Timestamp};
use crate::foundation::error::ExportResult;
use crate::geometry::Orientation;
use crate::media::source::EncodedSample;
use crate::render::backend::FrameRGBA;

/// The two independently gated input streams of a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
        })
    }
}

/// Result of a submit call. A rejected item is handed back so it can be retried, never dropped.
#[derive(Debug)]
pub enum Submission<T> {
    Accepted,
    NotReady(T),
}

impl<T> Submission<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Configuration handed to [`crate::media::MediaBackend::open_sink`].
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Final destination. Nothing exists there until `finish` succeeds.
    pub output: PathBuf,
    pub render_size: Size,
    pub fps: Fps,
    pub has_audio: bool,
    /// Container whose first audio track is re-muxed without re-encoding.
    pub audio_source: Option<PathBuf>,
    /// Orientation to stamp on the output container, when the container carries it.
    pub container_orientation: Option<Orientation>,
    pub encoder: EncoderOpts,
    /// Maximum composited frames queued ahead of the encoder.
    pub queue_depth: usize,
    /// How far audio may run ahead of the last accepted video timestamp.
    pub audio_interleave_window: Duration,
    pub overwrite: bool,
}

/// Consumer of composited video and passthrough audio, in presentation order.
///
/// Backpressure contract: submit only after the stream reported ready. A stream that is not
/// ready returns [`Submission::NotReady`] with the item. Streams gate independently so the two
/// pumps can share one sink from different threads.
pub trait FrameSink: Send + Sync {
    fn is_ready(&self, stream: StreamKind) -> bool;

    /// Block for at most `timeout` until `stream` is ready. Returns the readiness at wake-up.
    fn wait_ready(&self, stream: StreamKind, timeout: Duration) -> bool;

    fn submit_video(&self, frame: FrameRGBA, pts: Timestamp)
    -> ExportResult<Submission<FrameRGBA>>;

    fn submit_audio(&self, sample: EncodedSample) -> ExportResult<Submission<EncodedSample>>;

    /// No more items will be submitted on `stream`.
    fn mark_finished(&self, stream: StreamKind) -> ExportResult<()>;

    /// Finalize the container and move it to its destination.
    fn finish(self: Box<Self>) -> ExportResult<PathBuf>;

    /// Stop encoding and discard everything written so far.
    fn abort(self: Box<Self>);
}
