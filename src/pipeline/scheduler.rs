//! Video and audio pump loops driving one sink under backpressure.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::config::PumpOpts;
use crate::foundation::error::{ExportError, ExportResult};
use crate::media::sink::{FrameSink, StreamKind, Submission};
use crate::media::source::{AudioSamples, VideoFrames};
use crate::pipeline::cancel::CancellationToken;
use crate::render::backend::Compositor;

/// Items each pump handed to the sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub frames: u64,
    pub audio_samples: u64,
}

/// Shared state of one pump run. The first recorded error wins and stops both pumps.
struct PumpShared<'a> {
    sink: &'a dyn FrameSink,
    cancel: &'a CancellationToken,
    opts: &'a PumpOpts,
    abort: AtomicBool,
    first_error: Mutex<Option<ExportError>>,
}

impl PumpShared<'_> {
    fn fail(&self, err: ExportError) {
        let mut slot = self.first_error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            tracing::debug!(error = %err, "pump failed; stopping both streams");
            *slot = Some(err);
        }
        drop(slot);
        self.abort.store(true, Ordering::SeqCst);
    }

    fn take_error(&self) -> Option<ExportError> {
        self.first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Pull, process and submit items on `stream` until the source is exhausted.
    ///
    /// The next item is only pulled after the stream reported ready; a rejected item is kept
    /// and resubmitted after the next ready signal.
    fn pump<I, P>(
        &self,
        stream: StreamKind,
        mut items: impl Iterator<Item = ExportResult<I>>,
        mut process: impl FnMut(I) -> ExportResult<P>,
        mut submit: impl FnMut(P) -> ExportResult<Submission<P>>,
    ) -> ExportResult<u64> {
        let poll = self.opts.ready_poll();
        let stall = self.opts.stall_timeout();
        let mut pending: Option<P> = None;
        let mut last_ready = Instant::now();
        let mut was_ready = true;
        let mut accepted = 0u64;

        loop {
            if self.cancel.is_cancelled() || self.abort.load(Ordering::SeqCst) {
                return Err(ExportError::Cancelled);
            }

            if !self.sink.wait_ready(stream, poll) {
                if was_ready {
                    tracing::debug!(%stream, accepted, "sink not ready");
                    was_ready = false;
                }
                if let Some(limit) = stall
                    && last_ready.elapsed() >= limit
                {
                    return Err(ExportError::write(format!(
                        "sink stalled: {stream} stream not ready for {limit:?}"
                    )));
                }
                continue;
            }
            if !was_ready {
                tracing::debug!(%stream, accepted, "sink ready");
                was_ready = true;
            }
            last_ready = Instant::now();

            let item = match pending.take() {
                Some(item) => item,
                None => match items.next() {
                    Some(next) => process(next?)?,
                    None => {
                        self.sink.mark_finished(stream)?;
                        tracing::debug!(%stream, accepted, "stream finished");
                        return Ok(accepted);
                    }
                },
            };

            match submit(item)? {
                Submission::Accepted => accepted += 1,
                Submission::NotReady(item) => pending = Some(item),
            }
        }
    }
}

/// Run the video pump (on the calling thread) and the audio pump (on its own thread) against
/// `sink` until both streams are finished.
///
/// Any error stops both pumps at their next iteration and is returned; the caller decides
/// whether to finish or abort the sink. Cancellation returns [`ExportError::Cancelled`].
pub fn run_pumps(
    video: VideoFrames,
    audio: Option<AudioSamples>,
    compositor: &mut dyn Compositor,
    sink: &dyn FrameSink,
    cancel: &CancellationToken,
    opts: &PumpOpts,
) -> ExportResult<PumpReport> {
    let shared = PumpShared {
        sink,
        cancel,
        opts,
        abort: AtomicBool::new(false),
        first_error: Mutex::new(None),
    };

    let (frames, audio_samples) = std::thread::scope(|s| {
        let audio_pump = match audio {
            Some(samples) => {
                let shared = &shared;
                let spawned = std::thread::Builder::new()
                    .name("burnin-audio-pump".to_string())
                    .spawn_scoped(s, move || {
                        let pumped = shared.pump(StreamKind::Audio, samples, Ok, |sample| {
                            shared.sink.submit_audio(sample)
                        });
                        pumped.unwrap_or_else(|e| {
                            shared.fail(e);
                            0
                        })
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        shared.fail(ExportError::write(format!(
                            "failed to spawn audio pump: {e}"
                        )));
                        None
                    }
                }
            }
            None => None,
        };

        let frames = video_pump(&shared, video, compositor);
        let frames = frames.unwrap_or_else(|e| {
            shared.fail(e);
            0
        });

        let samples = match audio_pump {
            Some(handle) => match handle.join() {
                Ok(n) => n,
                Err(_) => {
                    shared.fail(ExportError::write("audio pump panicked"));
                    0
                }
            },
            None => 0,
        };
        (frames, samples)
    });

    if let Some(err) = shared.take_error() {
        return Err(err);
    }
    Ok(PumpReport {
        frames,
        audio_samples,
    })
}

fn video_pump(
    shared: &PumpShared<'_>,
    video: VideoFrames,
    compositor: &mut dyn Compositor,
) -> ExportResult<u64> {
    shared.pump(
        StreamKind::Video,
        video,
        |sample| {
            let out = compositor.composite_frame(&sample.frame)?;
            Ok((out, sample.pts))
        },
        |(frame, pts)| {
            Ok(match shared.sink.submit_video(frame, pts)? {
                Submission::Accepted => Submission::Accepted,
                Submission::NotReady(frame) => Submission::NotReady((frame, pts)),
            })
        },
    )
}
