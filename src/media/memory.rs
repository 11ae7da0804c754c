//! In-process media doubles.
//!
//! [`InMemoryMedia`] stands in for the ffmpeg backend: sources are built from frames held in
//! memory and the sink records every call so the backpressure contract can be checked.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::foundation::core::{Fps, Size, Timestamp};
use crate::foundation::error::{ExportError, ExportResult};
use crate::geometry::RawMatrix;
use crate::media::MediaBackend;
use crate::media::probe::TrackInfo;
use crate::media::sink::{FrameSink, SinkConfig, StreamKind, Submission};
use crate::media::source::{AudioSamples, EncodedSample, FrameSource, VideoFrames, VideoSample};
use crate::media::thumbnail::write_still;
use crate::render::backend::FrameRGBA;
use crate::render::surface_pool::SurfacePool;

/// Frame source over pre-built frames.
pub struct InMemorySource {
    info: TrackInfo,
    frames: Option<Vec<FrameRGBA>>,
    audio: Option<Vec<EncodedSample>>,
    fail_video_at: Option<usize>,
}

impl InMemorySource {
    /// Frames are stamped at `info.fps`; `info.native_size` must match every frame.
    pub fn new(info: TrackInfo, frames: Vec<FrameRGBA>) -> ExportResult<Self> {
        if let Some(f) = frames.iter().find(|f| f.size() != info.native_size) {
            return Err(ExportError::validation(format!(
                "frame size {} does not match track size {}",
                f.size(),
                info.native_size
            )));
        }
        Ok(Self {
            info,
            frames: Some(frames),
            audio: Some(Vec::new()),
            fail_video_at: None,
        })
    }

    /// `count` frames of a single color.
    pub fn solid(path: impl Into<PathBuf>, size: Size, fps: Fps, count: usize, rgba: [u8; 4]) -> Self {
        let info = TrackInfo {
            path: path.into(),
            native_size: size,
            duration: Timestamp(fps.frame_duration().0 * count as i64),
            fps,
            orientation: None,
            has_audio: false,
            audio_duration: None,
            video_codec: None,
        };
        let frames = (0..count).map(|_| FrameRGBA::filled(size, rgba)).collect();
        Self {
            info,
            frames: Some(frames),
            audio: Some(Vec::new()),
            fail_video_at: None,
        }
    }

    pub fn with_orientation(mut self, m: RawMatrix) -> Self {
        self.info.orientation = Some(m);
        self
    }

    /// Evenly spaced audio packets covering `duration`.
    pub fn with_audio(mut self, duration: Duration, packet: Duration) -> Self {
        let step = packet.as_micros().max(1) as i64;
        let total = duration.as_micros() as i64;
        let samples: Vec<EncodedSample> = (0..)
            .map(|i| i * step)
            .take_while(|&pts| pts < total)
            .map(|pts| EncodedSample {
                pts: Timestamp(pts),
                duration: Timestamp(step.min(total - pts)),
                size: 256,
                byte_offset: None,
                keyframe: true,
            })
            .collect();
        self.info.has_audio = !samples.is_empty();
        self.info.audio_duration = self.info.has_audio.then_some(Timestamp(total));
        self.audio = Some(samples);
        self
    }

    /// Yield a decode error instead of frame `index`.
    pub fn with_decode_failure_at(mut self, index: usize) -> Self {
        self.fail_video_at = Some(index);
        self
    }
}

impl FrameSource for InMemorySource {
    fn info(&self) -> &TrackInfo {
        &self.info
    }

    fn video_frames(&mut self) -> ExportResult<VideoFrames> {
        let frames = self
            .frames
            .take()
            .ok_or_else(|| ExportError::decode("video frames were already consumed"))?;
        let fps = self.info.fps;
        let fail_at = self.fail_video_at;
        Ok(Box::new(frames.into_iter().enumerate().map(move |(i, frame)| {
            if fail_at == Some(i) {
                return Err(ExportError::decode(format!("injected decode failure at frame {i}")));
            }
            Ok(VideoSample {
                frame,
                pts: fps.frame_pts(i as u64),
            })
        })))
    }

    fn audio_samples(&mut self) -> ExportResult<AudioSamples> {
        let samples = self
            .audio
            .take()
            .ok_or_else(|| ExportError::decode("audio samples were already consumed"))?;
        Ok(Box::new(samples.into_iter().map(Ok)))
    }
}

/// How an [`InMemorySink`] reports readiness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadyPattern {
    #[default]
    Always,
    /// Not ready on the first readiness check after every accepted item.
    Alternate,
    /// Never ready; `wait_ready` sleeps for the full timeout.
    Never,
    /// Always reports ready but hands every other submission back as not-ready, the way a
    /// bounded queue can fill up between the readiness check and the submit.
    RefuseAlternate,
}

/// Everything an [`InMemorySink`] observed.
#[derive(Clone, Debug, Default)]
pub struct SinkRecord {
    pub config: Option<SinkConfig>,
    pub video_pts: Vec<Timestamp>,
    pub audio_pts: Vec<Timestamp>,
    pub frames: Vec<FrameRGBA>,
    pub ready_signals: u64,
    pub not_ready_signals: u64,
    /// Submissions handed back as not-ready after readiness was signalled.
    pub refused: u64,
    /// Submissions that broke the backpressure contract.
    pub violations: Vec<String>,
    pub video_finished: bool,
    pub audio_finished: bool,
    pub finished: bool,
    pub aborted: bool,
}

/// Shared view onto the record of the sinks opened by one [`InMemoryMedia`].
#[derive(Clone, Debug, Default)]
pub struct SinkRecorder(Arc<Mutex<SinkRecord>>);

impl SinkRecorder {
    fn lock(&self) -> MutexGuard<'_, SinkRecord> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SinkRecord {
        self.lock().clone()
    }
}

#[derive(Default)]
struct Gate {
    blocked: bool,
    ready_reported: bool,
    refused_last: bool,
}

/// Recording sink. `finish` writes a small placeholder file at the output path; `abort` writes
/// nothing.
pub struct InMemorySink {
    cfg: SinkConfig,
    pattern: ReadyPattern,
    fail_video_at: Option<usize>,
    gates: Mutex<[Gate; 2]>,
    recorder: SinkRecorder,
}

impl InMemorySink {
    pub fn new(cfg: SinkConfig, pattern: ReadyPattern, recorder: SinkRecorder) -> Self {
        recorder.lock().config = Some(cfg.clone());
        Self {
            cfg,
            pattern,
            fail_video_at: None,
            gates: Mutex::new([Gate::default(), Gate::default()]),
            recorder,
        }
    }

    /// Reject video submission number `index` with a write error.
    pub fn with_write_failure_at(mut self, index: usize) -> Self {
        self.fail_video_at = Some(index);
        self
    }

    fn slot(stream: StreamKind) -> usize {
        match stream {
            StreamKind::Video => 0,
            StreamKind::Audio => 1,
        }
    }

    fn check_ready(&self, stream: StreamKind) -> bool {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        let gate = &mut gates[Self::slot(stream)];
        let ready = match self.pattern {
            ReadyPattern::Always | ReadyPattern::RefuseAlternate => true,
            ReadyPattern::Never => false,
            ReadyPattern::Alternate => !std::mem::replace(&mut gate.blocked, false),
        };
        gate.ready_reported |= ready;
        drop(gates);
        let mut rec = self.recorder.lock();
        if ready {
            rec.ready_signals += 1;
        } else {
            rec.not_ready_signals += 1;
        }
        ready
    }

    /// Consume the readiness token for `stream`; `false` means the caller skipped the check.
    fn take_ready(&self, stream: StreamKind) -> bool {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut gates[Self::slot(stream)].ready_reported, false)
    }

    /// Whether this (signalled) submission is handed back under [`ReadyPattern::RefuseAlternate`].
    fn refuse(&self, stream: StreamKind) -> bool {
        if self.pattern != ReadyPattern::RefuseAlternate {
            return false;
        }
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        let gate = &mut gates[Self::slot(stream)];
        gate.refused_last = !gate.refused_last;
        let refused = gate.refused_last;
        drop(gates);
        if refused {
            self.recorder.lock().refused += 1;
        }
        refused
    }

    fn accepted(&self, stream: StreamKind) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates[Self::slot(stream)].blocked = self.pattern == ReadyPattern::Alternate;
    }
}

impl FrameSink for InMemorySink {
    fn is_ready(&self, stream: StreamKind) -> bool {
        self.check_ready(stream)
    }

    fn wait_ready(&self, stream: StreamKind, timeout: Duration) -> bool {
        if self.pattern == ReadyPattern::Never {
            std::thread::sleep(timeout);
        }
        self.check_ready(stream)
    }

    fn submit_video(
        &self,
        frame: FrameRGBA,
        pts: Timestamp,
    ) -> ExportResult<Submission<FrameRGBA>> {
        if !self.take_ready(StreamKind::Video) {
            self.recorder
                .lock()
                .violations
                .push(format!("video pts {pts} submitted without readiness"));
            return Ok(Submission::NotReady(frame));
        }
        if self.refuse(StreamKind::Video) {
            return Ok(Submission::NotReady(frame));
        }
        let mut rec = self.recorder.lock();
        if rec.video_finished {
            rec.violations.push("video submitted after finish".to_string());
            return Err(ExportError::write("video submitted after the stream finished"));
        }
        if frame.size() != self.cfg.render_size {
            return Err(ExportError::write(format!(
                "frame size mismatch: got {}, expected {}",
                frame.size(),
                self.cfg.render_size
            )));
        }
        if self.fail_video_at == Some(rec.video_pts.len()) {
            return Err(ExportError::write("injected write failure"));
        }
        if let Some(&last) = rec.video_pts.last()
            && pts <= last
        {
            rec.violations.push(format!("video pts {pts} after {last}"));
            return Err(ExportError::write(format!("video pts {pts} does not follow {last}")));
        }
        rec.video_pts.push(pts);
        rec.frames.push(frame);
        drop(rec);
        self.accepted(StreamKind::Video);
        Ok(Submission::Accepted)
    }

    fn submit_audio(&self, sample: EncodedSample) -> ExportResult<Submission<EncodedSample>> {
        if !self.cfg.has_audio {
            return Err(ExportError::write("sink has no audio stream"));
        }
        if !self.take_ready(StreamKind::Audio) {
            self.recorder
                .lock()
                .violations
                .push(format!("audio pts {} submitted without readiness", sample.pts));
            return Ok(Submission::NotReady(sample));
        }
        if self.refuse(StreamKind::Audio) {
            return Ok(Submission::NotReady(sample));
        }
        let mut rec = self.recorder.lock();
        if rec.audio_finished {
            rec.violations.push("audio submitted after finish".to_string());
            return Err(ExportError::write("audio submitted after the stream finished"));
        }
        if let Some(&last) = rec.audio_pts.last()
            && sample.pts <= last
        {
            rec.violations.push(format!("audio pts {} after {last}", sample.pts));
            return Err(ExportError::write("non-increasing audio pts"));
        }
        rec.audio_pts.push(sample.pts);
        drop(rec);
        self.accepted(StreamKind::Audio);
        Ok(Submission::Accepted)
    }

    fn mark_finished(&self, stream: StreamKind) -> ExportResult<()> {
        let mut rec = self.recorder.lock();
        match stream {
            StreamKind::Video => rec.video_finished = true,
            StreamKind::Audio => rec.audio_finished = true,
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> ExportResult<PathBuf> {
        let mut rec = self.recorder.lock();
        if !rec.video_finished || (self.cfg.has_audio && !rec.audio_finished) {
            return Err(ExportError::write("finish called before all streams finished"));
        }
        let summary = serde_json::json!({
            "frames": rec.video_pts.len(),
            "audio_samples": rec.audio_pts.len(),
            "size": self.cfg.render_size,
        });
        crate::media::ffmpeg_sink::ensure_parent_dir(&self.cfg.output)?;
        std::fs::write(&self.cfg.output, summary.to_string()).map_err(|e| {
            ExportError::write(format!("failed to write '{}': {e}", self.cfg.output.display()))
        })?;
        rec.finished = true;
        Ok(self.cfg.output.clone())
    }

    fn abort(self: Box<Self>) {
        self.recorder.lock().aborted = true;
    }
}

/// [`MediaBackend`] over registered [`InMemorySource`]s and recording sinks.
///
/// Each source can be opened once.
pub struct InMemoryMedia {
    sources: Mutex<Vec<InMemorySource>>,
    pattern: ReadyPattern,
    fail_write_at: Option<usize>,
    fail_thumbnail: bool,
    recorder: SinkRecorder,
}

impl InMemoryMedia {
    pub fn new(source: InMemorySource) -> Self {
        Self {
            sources: Mutex::new(vec![source]),
            pattern: ReadyPattern::Always,
            fail_write_at: None,
            fail_thumbnail: false,
            recorder: SinkRecorder::default(),
        }
    }

    pub fn with_source(self, source: InMemorySource) -> Self {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(source);
        self
    }

    pub fn with_ready_pattern(mut self, pattern: ReadyPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_write_failure_at(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    pub fn with_thumbnail_failure(mut self) -> Self {
        self.fail_thumbnail = true;
        self
    }

    pub fn recorder(&self) -> SinkRecorder {
        self.recorder.clone()
    }
}

impl MediaBackend for InMemoryMedia {
    fn open_source(&self, path: &Path, _pool: Arc<SurfacePool>) -> ExportResult<Box<dyn FrameSource>> {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        let idx = sources
            .iter()
            .position(|src| src.info.path == path)
            .ok_or_else(|| {
                ExportError::open(format!(
                    "no in-memory source registered at '{}'",
                    path.display()
                ))
            })?;
        Ok(Box::new(sources.swap_remove(idx)))
    }

    fn open_sink(&self, cfg: SinkConfig) -> ExportResult<Box<dyn FrameSink>> {
        let mut sink = InMemorySink::new(cfg, self.pattern, self.recorder.clone());
        if let Some(i) = self.fail_write_at {
            sink = sink.with_write_failure_at(i);
        }
        Ok(Box::new(sink))
    }

    fn extract_thumbnail(&self, _output: &Path, dest: &Path) -> ExportResult<Size> {
        if self.fail_thumbnail {
            return Err(ExportError::thumbnail("injected thumbnail failure"));
        }
        let rec = self.recorder.lock();
        let first = rec
            .frames
            .first()
            .ok_or_else(|| ExportError::thumbnail("output has no frames"))?;
        let img = image::RgbaImage::from_raw(first.width(), first.height(), first.data().to_vec())
            .ok_or_else(|| ExportError::thumbnail("frame buffer has the wrong length"))?;
        write_still(&image::DynamicImage::ImageRgba8(img), dest)?;
        Ok(first.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderOpts;

    fn sink_cfg(dir: &Path, has_audio: bool) -> SinkConfig {
        SinkConfig {
            output: dir.join("out.mp4"),
            render_size: Size::new(4, 4),
            fps: Fps::default(),
            has_audio,
            audio_source: has_audio.then(|| PathBuf::from("mem://in")),
            container_orientation: None,
            encoder: EncoderOpts::default(),
            queue_depth: 1,
            audio_interleave_window: Duration::from_millis(500),
            overwrite: true,
        }
    }

    #[test]
    fn source_streams_are_single_pass() {
        let mut src = InMemorySource::solid("mem://in", Size::new(2, 2), Fps::default(), 3, [0; 4]);
        let pts: Vec<_> = src
            .video_frames()
            .unwrap()
            .map(|s| s.unwrap().pts)
            .collect();
        assert_eq!(pts.len(), 3);
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
        assert!(src.video_frames().is_err());
    }

    #[test]
    fn audio_packets_cover_duration() {
        let mut src = InMemorySource::solid("mem://in", Size::new(2, 2), Fps::default(), 1, [0; 4])
            .with_audio(Duration::from_millis(100), Duration::from_millis(21));
        assert!(src.info().has_audio);
        let samples: Vec<_> = src.audio_samples().unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 5);
        let end = samples.last().map(|s| s.pts.0 + s.duration.0).unwrap();
        assert_eq!(end, 100_000);
    }

    #[test]
    fn decode_failure_is_injected() {
        let mut src = InMemorySource::solid("mem://in", Size::new(2, 2), Fps::default(), 3, [0; 4])
            .with_decode_failure_at(1);
        let results: Vec<_> = src.video_frames().unwrap().collect();
        assert!(results[0].is_ok());
        assert_eq!(
            results[1].as_ref().unwrap_err().kind(),
            crate::foundation::error::ErrorKind::Decode
        );
    }

    #[test]
    fn alternate_pattern_records_violations() {
        let dir = tempfile::tempdir().unwrap();
        let rec = SinkRecorder::default();
        let sink = InMemorySink::new(sink_cfg(dir.path(), false), ReadyPattern::Alternate, rec.clone());
        let f = || FrameRGBA::filled(Size::new(4, 4), [1, 2, 3, 255]);

        // Submitting without asking first is a violation and hands the frame back.
        assert!(!sink.submit_video(f(), Timestamp(0)).unwrap().is_accepted());
        assert!(sink.is_ready(StreamKind::Video));
        assert!(sink.submit_video(f(), Timestamp(0)).unwrap().is_accepted());
        assert!(!sink.is_ready(StreamKind::Video));
        assert!(sink.is_ready(StreamKind::Video));
        assert!(sink.submit_video(f(), Timestamp(10)).unwrap().is_accepted());

        let snap = rec.snapshot();
        assert_eq!(snap.violations.len(), 1);
        assert_eq!(snap.video_pts, vec![Timestamp(0), Timestamp(10)]);
        assert_eq!(snap.not_ready_signals, 1);
    }

    #[test]
    fn finish_writes_and_abort_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let rec = SinkRecorder::default();
        let sink = Box::new(InMemorySink::new(
            sink_cfg(dir.path(), false),
            ReadyPattern::Always,
            rec.clone(),
        ));
        assert!(sink.is_ready(StreamKind::Video));
        sink.submit_video(FrameRGBA::filled(Size::new(4, 4), [0; 4]), Timestamp(0))
            .unwrap();
        sink.mark_finished(StreamKind::Video).unwrap();
        let out = sink.finish().unwrap();
        assert!(out.is_file());

        let dir = tempfile::tempdir().unwrap();
        let sink = Box::new(InMemorySink::new(
            sink_cfg(dir.path(), true),
            ReadyPattern::Always,
            SinkRecorder::default(),
        ));
        sink.abort();
        assert!(!dir.path().join("out.mp4").exists());
    }
}
