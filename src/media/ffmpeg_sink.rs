use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;

use crate::foundation::core::Timestamp;
use crate::foundation::error::{ExportError, ExportResult};
use crate::media::mkv;
use crate::media::sink::{FrameSink, SinkConfig, StreamKind, Submission};
use crate::media::source::{EncodedSample, list_audio_packets};
use crate::render::backend::FrameRGBA;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct Gate {
    in_flight: usize,
    last_video_pts: Option<Timestamp>,
    last_audio_pts: Option<Timestamp>,
    video_finished: bool,
    audio_finished: bool,
    writer_error: Option<String>,
    video_frames: u64,
    audio_samples: u64,
    audio_bytes: u64,
    /// Byte size of every accepted audio packet, in submission order.
    audio_sizes: Vec<usize>,
}

struct Shared {
    gate: Mutex<Gate>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sink that streams raw RGBA frames into a system `ffmpeg` encoder and re-muxes the source's
/// audio track unchanged.
///
/// Frames reach the encoder with their own timestamps, so variable frame rate sources keep
/// their timing. The muxed audio is checked packet by packet against what was accepted.
///
/// Everything is written next to the destination under temporary names; the destination only
/// appears after a successful [`FrameSink::finish`]. Dropping or aborting the sink deletes the
/// temporaries.
pub struct FfmpegSink {
    cfg: SinkConfig,
    shared: Arc<Shared>,
    frames_tx: Mutex<Option<SyncSender<(FrameRGBA, Timestamp)>>>,
    writer: Option<JoinHandle<()>>,
    child: Option<Child>,
    stderr_drain: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    temp_video: PathBuf,
    temp_final: PathBuf,
}

impl FfmpegSink {
    /// Spawn the encoder. Fails before any frame is accepted if the configuration cannot be
    /// encoded.
    pub fn open(cfg: SinkConfig) -> ExportResult<Self> {
        let size = cfg.render_size;
        if size.is_empty() || !size.width.is_multiple_of(2) || !size.height.is_multiple_of(2) {
            return Err(ExportError::write(format!(
                "render size {size} must be non-empty and even for {}",
                cfg.encoder.pixel_format
            )));
        }
        if cfg.queue_depth == 0 {
            return Err(ExportError::validation("sink queue depth must be >= 1"));
        }
        if cfg.has_audio && cfg.audio_source.is_none() {
            return Err(ExportError::validation(
                "sink configured with audio but no audio source",
            ));
        }
        ensure_parent_dir(&cfg.output)?;
        if !cfg.overwrite && cfg.output.exists() {
            return Err(ExportError::validation(format!(
                "output file '{}' already exists",
                cfg.output.display()
            )));
        }

        let temp_video = temp_path(&cfg.output, "video");
        let temp_final = temp_path(&cfg.output, "final");

        let mut cmd = Command::new("ffmpeg");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .args(["-y", "-hide_banner", "-loglevel", "error"])
            .args(["-f", "matroska", "-i", "pipe:0", "-an"])
            // Keep every submitted timestamp; never dup, drop or round to a nominal rate.
            .args(["-fps_mode", "passthrough", "-enc_time_base:v", "1:1000000"])
            .args(["-c:v", &cfg.encoder.codec]);
        if matches!(cfg.encoder.codec.as_str(), "libx264" | "libx265") {
            cmd.args([
                "-preset",
                &cfg.encoder.preset,
                "-crf",
                &cfg.encoder.crf.to_string(),
            ]);
        }
        cmd.args(["-pix_fmt", &cfg.encoder.pixel_format])
            .arg(&temp_video);

        let mut child = cmd.spawn().map_err(|e| {
            ExportError::write(format!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExportError::write("failed to open ffmpeg stdin (unexpected)"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExportError::write("failed to open ffmpeg stderr (unexpected)"))?;
        let stderr_drain = std::thread::spawn(move || {
            let mut bytes = Vec::new();
            stderr.read_to_end(&mut bytes)?;
            Ok(bytes)
        });

        let shared = Arc::new(Shared {
            gate: Mutex::new(Gate::default()),
            changed: Condvar::new(),
        });
        let (tx, rx) = std::sync::mpsc::sync_channel::<(FrameRGBA, Timestamp)>(cfg.queue_depth);
        let writer_shared = shared.clone();
        let header = mkv::stream_header(size, cfg.fps);
        let writer = std::thread::Builder::new()
            .name("burnin-encode".to_string())
            .spawn(move || {
                if let Err(e) = stdin.write_all(&header) {
                    let mut g = writer_shared.lock();
                    g.writer_error = Some(format!("failed to start ffmpeg input stream: {e}"));
                    writer_shared.changed.notify_all();
                    return;
                }
                for (frame, pts) in rx {
                    let res = stdin
                        .write_all(&mkv::frame_prefix(pts, frame.data().len()))
                        .and_then(|()| stdin.write_all(frame.data()));
                    drop(frame);
                    let mut g = writer_shared.lock();
                    g.in_flight = g.in_flight.saturating_sub(1);
                    if let Err(e) = res {
                        g.writer_error = Some(format!("failed to write frame to ffmpeg: {e}"));
                        writer_shared.changed.notify_all();
                        return;
                    }
                    writer_shared.changed.notify_all();
                }
            })
            .map_err(|e| ExportError::write(format!("failed to spawn encoder thread: {e}")))?;

        tracing::debug!(
            output = %cfg.output.display(),
            size = %size,
            fps = %cfg.fps,
            audio = cfg.has_audio,
            "ffmpeg sink opened"
        );

        Ok(Self {
            cfg,
            shared,
            frames_tx: Mutex::new(Some(tx)),
            writer: Some(writer),
            child: Some(child),
            stderr_drain: Some(stderr_drain),
            temp_video,
            temp_final,
        })
    }

    fn ready(&self, g: &Gate, stream: StreamKind) -> bool {
        if g.writer_error.is_some() {
            // Let the pump submit and observe the error.
            return true;
        }
        match stream {
            StreamKind::Video => !g.video_finished && g.in_flight < self.cfg.queue_depth,
            StreamKind::Audio => {
                if g.video_finished {
                    return true;
                }
                let horizon = g
                    .last_video_pts
                    .unwrap_or_default()
                    .saturating_add(Timestamp(self.cfg.audio_interleave_window.as_micros() as i64));
                g.last_audio_pts.is_none_or(|a| a <= horizon)
            }
        }
    }

    fn close_video_input(&self) {
        let mut tx = self.frames_tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.take();
    }

    fn wait_encoder(&mut self) -> ExportResult<()> {
        self.close_video_input();
        if let Some(w) = self.writer.take() {
            w.join()
                .map_err(|_| ExportError::write("encoder thread panicked"))?;
        }
        let status = match self.child.take() {
            Some(mut c) => c
                .wait()
                .map_err(|e| ExportError::write(format!("failed to wait for ffmpeg: {e}")))?,
            None => return Err(ExportError::write("ffmpeg sink already finalized")),
        };
        let stderr = match self.stderr_drain.take() {
            Some(h) => h
                .join()
                .map_err(|_| ExportError::write("ffmpeg stderr drain thread panicked"))?
                .unwrap_or_default(),
            None => Vec::new(),
        };
        if let Some(e) = self.shared.lock().writer_error.clone() {
            return Err(ExportError::write(format!(
                "{e}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        if !status.success() {
            return Err(ExportError::write(format!(
                "ffmpeg exited with status {status}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(())
    }

    /// Copy the encoded video plus the source audio into the final container.
    fn mux(&self) -> ExportResult<&Path> {
        let orientation = self.cfg.container_orientation;
        let audio = self.cfg.audio_source.as_ref().filter(|_| self.cfg.has_audio);
        if orientation.is_none() && audio.is_none() {
            return Ok(&self.temp_video);
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-y", "-hide_banner", "-nostdin", "-loglevel", "error"]);
        if let Some(o) = orientation {
            // ffmpeg's display rotation is counter-clockwise.
            let ccw = -(o.rotation.degrees_cw() as i64);
            cmd.args(["-display_rotation:v:0", &ccw.to_string()]);
            if o.mirrored {
                cmd.args(["-display_hflip:v:0"]);
            }
        }
        cmd.arg("-i").arg(&self.temp_video);
        if let Some(src) = audio {
            cmd.arg("-i").arg(src);
        }
        cmd.args(["-map", "0:v:0"]);
        if audio.is_some() {
            // No `-shortest`: a shorter audio track stays shorter, nothing is padded or cut.
            cmd.args(["-map", "1:a:0"]);
        }
        cmd.args(["-c", "copy", "-movflags", "+faststart"])
            .arg(&self.temp_final)
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        let out = cmd
            .output()
            .map_err(|e| ExportError::write(format!("failed to run ffmpeg mux: {e}")))?;
        if !out.status.success() {
            return Err(ExportError::write(format!(
                "ffmpeg mux failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(&self.temp_final)
    }

    /// The muxed audio track must hold exactly the accepted packets, in order.
    fn verify_audio(&self, muxed: &Path) -> ExportResult<()> {
        let accepted = std::mem::take(&mut self.shared.lock().audio_sizes);
        let written = list_audio_packets(muxed)
            .map_err(|e| ExportError::write(format!("failed to list muxed audio: {e}")))?;
        if written.len() != accepted.len() {
            return Err(ExportError::write(format!(
                "muxed audio has {} packets but {} were accepted",
                written.len(),
                accepted.len()
            )));
        }
        if let Some((i, (w, a))) = written
            .iter()
            .zip(&accepted)
            .enumerate()
            .find(|(_, (w, a))| w.size != **a)
        {
            return Err(ExportError::write(format!(
                "muxed audio packet {i} is {} bytes, accepted {a}",
                w.size
            )));
        }
        Ok(())
    }

    fn remove_temporaries(&self) {
        for p in [&self.temp_video, &self.temp_final] {
            if p.exists()
                && let Err(e) = std::fs::remove_file(p)
            {
                tracing::warn!(path = %p.display(), error = %e, "failed to remove temporary output");
            }
        }
    }
}

impl FrameSink for FfmpegSink {
    fn is_ready(&self, stream: StreamKind) -> bool {
        let g = self.shared.lock();
        self.ready(&g, stream)
    }

    fn wait_ready(&self, stream: StreamKind, timeout: Duration) -> bool {
        let g = self.shared.lock();
        let (g, _) = self
            .shared
            .changed
            .wait_timeout_while(g, timeout, |g| !self.ready(g, stream))
            .unwrap_or_else(|e| e.into_inner());
        self.ready(&g, stream)
    }

    fn submit_video(
        &self,
        frame: FrameRGBA,
        pts: Timestamp,
    ) -> ExportResult<Submission<FrameRGBA>> {
        if frame.size() != self.cfg.render_size {
            return Err(ExportError::write(format!(
                "frame size mismatch: got {}, expected {}",
                frame.size(),
                self.cfg.render_size
            )));
        }
        let mut g = self.shared.lock();
        if let Some(e) = &g.writer_error {
            return Err(ExportError::write(e.clone()));
        }
        if g.video_finished {
            return Err(ExportError::write("video submitted after the stream finished"));
        }
        if g.in_flight >= self.cfg.queue_depth {
            return Ok(Submission::NotReady(frame));
        }
        if let Some(last) = g.last_video_pts
            && pts <= last
        {
            return Err(ExportError::write(format!(
                "video pts {pts} does not follow {last}"
            )));
        }

        let tx = self.frames_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(ExportError::write("video input already closed"));
        };
        match tx.try_send((frame, pts)) {
            Ok(()) => {}
            Err(TrySendError::Full((frame, _))) => return Ok(Submission::NotReady(frame)),
            Err(TrySendError::Disconnected(_)) => {
                return Err(ExportError::write(
                    g.writer_error
                        .clone()
                        .unwrap_or_else(|| "encoder stopped accepting frames".to_string()),
                ));
            }
        }
        g.in_flight += 1;
        g.last_video_pts = Some(pts);
        g.video_frames += 1;
        self.shared.changed.notify_all();
        Ok(Submission::Accepted)
    }

    fn submit_audio(&self, sample: EncodedSample) -> ExportResult<Submission<EncodedSample>> {
        if !self.cfg.has_audio {
            return Err(ExportError::write("sink has no audio stream"));
        }
        let mut g = self.shared.lock();
        if let Some(e) = &g.writer_error {
            return Err(ExportError::write(e.clone()));
        }
        if g.audio_finished {
            return Err(ExportError::write("audio submitted after the stream finished"));
        }
        if !self.ready(&g, StreamKind::Audio) {
            return Ok(Submission::NotReady(sample));
        }
        if let Some(last) = g.last_audio_pts
            && sample.pts <= last
        {
            return Err(ExportError::write(format!(
                "audio pts {} does not follow {last}",
                sample.pts
            )));
        }
        g.last_audio_pts = Some(sample.pts);
        g.audio_samples += 1;
        g.audio_bytes += sample.size as u64;
        g.audio_sizes.push(sample.size);
        self.shared.changed.notify_all();
        Ok(Submission::Accepted)
    }

    fn mark_finished(&self, stream: StreamKind) -> ExportResult<()> {
        {
            let mut g = self.shared.lock();
            match stream {
                StreamKind::Video => g.video_finished = true,
                StreamKind::Audio => g.audio_finished = true,
            }
            self.shared.changed.notify_all();
        }
        if stream == StreamKind::Video {
            self.close_video_input();
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(output = %self.cfg.output.display()))]
    fn finish(mut self: Box<Self>) -> ExportResult<PathBuf> {
        {
            let g = self.shared.lock();
            if !g.video_finished || (self.cfg.has_audio && !g.audio_finished) {
                return Err(ExportError::write("finish called before all streams finished"));
            }
            if g.video_frames == 0 {
                return Err(ExportError::write("no video frames were written"));
            }
        }
        self.wait_encoder()?;
        let muxed = self.mux()?.to_path_buf();
        if self.cfg.has_audio {
            self.verify_audio(&muxed)?;
        }

        if !self.cfg.overwrite && self.cfg.output.exists() {
            return Err(ExportError::write(format!(
                "output file '{}' appeared during export",
                self.cfg.output.display()
            )));
        }
        std::fs::rename(&muxed, &self.cfg.output).map_err(|e| {
            ExportError::write(format!(
                "failed to move output into place at '{}': {e}",
                self.cfg.output.display()
            ))
        })?;

        let g = self.shared.lock();
        tracing::info!(
            frames = g.video_frames,
            audio_samples = g.audio_samples,
            audio_bytes = g.audio_bytes,
            "output finalized"
        );
        Ok(self.cfg.output.clone())
    }

    fn abort(self: Box<Self>) {
        tracing::debug!(output = %self.cfg.output.display(), "aborting ffmpeg sink");
        drop(self);
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.close_video_input();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(w) = self.writer.take() {
            let _ = w.join();
        }
        if let Some(h) = self.stderr_drain.take() {
            let _ = h.join();
        }
        self.remove_temporaries();
    }
}

fn temp_path(output: &Path, tag: &str) -> PathBuf {
    let name = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let ext = output
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".to_string());
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    output.with_file_name(format!(
        ".{name}.burnin-{}-{n}.{tag}.{ext}",
        std::process::id()
    ))
}

/// Ensure the parent directory of `path` exists.
pub fn ensure_parent_dir(path: &Path) -> ExportResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Return `true` when both `ffmpeg` and `ffprobe` can be invoked from `PATH`.
pub fn ffmpeg_tools_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|tool| {
        Command::new(tool)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderOpts;
    use crate::foundation::core::{Fps, Size};

    fn cfg(dir: &Path, size: Size) -> SinkConfig {
        SinkConfig {
            output: dir.join("out.mp4"),
            render_size: size,
            fps: Fps::new(30, 1).unwrap(),
            has_audio: false,
            audio_source: None,
            container_orientation: None,
            encoder: EncoderOpts::default(),
            queue_depth: 2,
            audio_interleave_window: Duration::from_millis(500),
            overwrite: true,
        }
    }

    #[test]
    fn temp_paths_are_hidden_siblings() {
        let a = temp_path(Path::new("/x/y/clip.mov"), "video");
        let b = temp_path(Path::new("/x/y/clip.mov"), "video");
        assert_eq!(a.parent(), Some(Path::new("/x/y")));
        assert!(a.file_name().unwrap().to_string_lossy().starts_with(".clip.burnin-"));
        assert!(a.to_string_lossy().ends_with(".video.mov"));
        assert_ne!(a, b);
    }

    #[test]
    fn odd_render_size_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FfmpegSink::open(cfg(dir.path(), Size::new(641, 480)))
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Write);
    }

    #[test]
    fn abort_leaves_no_files() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not found on PATH");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let size = Size::new(64, 48);
        let sink = Box::new(FfmpegSink::open(cfg(dir.path(), size)).unwrap());
        assert!(sink.is_ready(StreamKind::Video));
        let frame = FrameRGBA::filled(size, [10, 20, 30, 255]);
        assert!(
            sink.submit_video(frame, Timestamp::ZERO)
                .unwrap()
                .is_accepted()
        );
        sink.abort();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn finish_writes_destination_only() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not found on PATH");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let size = Size::new(64, 48);
        let sink = Box::new(FfmpegSink::open(cfg(dir.path(), size)).unwrap());
        let fps = Fps::new(30, 1).unwrap();
        for i in 0..10 {
            let mut pending = FrameRGBA::filled(size, [i as u8 * 20, 0, 0, 255]);
            loop {
                assert!(sink.wait_ready(StreamKind::Video, Duration::from_secs(5)));
                match sink.submit_video(pending, fps.frame_pts(i)).unwrap() {
                    Submission::Accepted => break,
                    Submission::NotReady(f) => pending = f,
                }
            }
        }
        sink.mark_finished(StreamKind::Video).unwrap();
        let out = sink.finish().unwrap();
        assert!(out.is_file());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.mp4")]);
    }

    fn submit_frames(sink: &FfmpegSink, size: Size, pts: &[Timestamp]) {
        for (i, &t) in pts.iter().enumerate() {
            let mut pending = FrameRGBA::filled(size, [(i * 20) as u8, 0, 0, 255]);
            loop {
                assert!(sink.wait_ready(StreamKind::Video, Duration::from_secs(5)));
                match sink.submit_video(pending, t).unwrap() {
                    Submission::Accepted => break,
                    Submission::NotReady(f) => pending = f,
                }
            }
        }
        sink.mark_finished(StreamKind::Video).unwrap();
    }

    fn packet_times(path: &Path, stream: &str) -> Vec<f64> {
        let out = Command::new("ffprobe")
            .args(["-v", "error", "-select_streams", stream])
            .args(["-show_entries", "packet=pts_time", "-of", "csv=p=0"])
            .arg(path)
            .output()
            .unwrap();
        assert!(out.status.success());
        let mut times: Vec<f64> = String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|l| l.trim().trim_end_matches(',').parse().ok())
            .collect();
        times.sort_by(f64::total_cmp);
        times
    }

    fn synth_with_audio(path: &Path) {
        let status = Command::new("ffmpeg")
            .args(["-v", "error", "-y", "-f", "lavfi", "-i", "testsrc=size=64x48:rate=30:duration=1"])
            .args(["-f", "lavfi", "-i", "sine=frequency=440:sample_rate=48000:duration=1"])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-c:a", "aac"])
            .arg(path)
            .status()
            .unwrap();
        assert!(status.success());
    }

    fn audio_cfg(out_dir: &Path, src: &Path, size: Size) -> SinkConfig {
        SinkConfig {
            has_audio: true,
            audio_source: Some(src.to_path_buf()),
            ..cfg(out_dir, size)
        }
    }

    #[test]
    fn variable_frame_timing_reaches_the_output() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not found on PATH");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let size = Size::new(64, 48);
        let sink = Box::new(FfmpegSink::open(cfg(dir.path(), size)).unwrap());
        let pts: Vec<Timestamp> = [0, 33_333, 66_667, 150_000, 183_333, 400_000, 433_333, 466_667]
            .into_iter()
            .map(Timestamp)
            .collect();
        submit_frames(&sink, size, &pts);
        let out = sink.finish().unwrap();

        let times = packet_times(&out, "v:0");
        assert_eq!(times.len(), pts.len(), "{times:?}");
        let origin = times[0];
        for (got, want) in times.iter().zip(&pts) {
            assert!(
                (got - origin - want.as_secs_f64()).abs() < 0.001,
                "got {times:?}, want {pts:?}"
            );
        }
    }

    #[test]
    fn muxed_audio_is_exactly_the_accepted_packets() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not found on PATH");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.mp4");
        synth_with_audio(&src);
        let packets = list_audio_packets(&src).unwrap();
        assert!(packets.len() > 10);

        let out_dir = dir.path().join("out");
        let size = Size::new(64, 48);
        let fps = Fps::new(30, 1).unwrap();
        let sink = Box::new(FfmpegSink::open(audio_cfg(&out_dir, &src, size)).unwrap());
        submit_frames(&sink, size, &(0..30).map(|i| fps.frame_pts(i)).collect::<Vec<_>>());
        for p in packets.iter().cloned() {
            assert!(sink.wait_ready(StreamKind::Audio, Duration::from_secs(5)));
            assert!(sink.submit_audio(p).unwrap().is_accepted());
        }
        sink.mark_finished(StreamKind::Audio).unwrap();
        let out = sink.finish().unwrap();

        let muxed = list_audio_packets(&out).unwrap();
        let sizes = |v: &[EncodedSample]| v.iter().map(|p| p.size).collect::<Vec<_>>();
        assert_eq!(sizes(&muxed), sizes(&packets));
    }

    #[test]
    fn skipped_audio_packet_fails_finish() {
        if !ffmpeg_tools_available() {
            eprintln!("skipping: ffmpeg/ffprobe not found on PATH");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.mp4");
        synth_with_audio(&src);
        let packets = list_audio_packets(&src).unwrap();

        let out_dir = dir.path().join("out");
        let size = Size::new(64, 48);
        let fps = Fps::new(30, 1).unwrap();
        let sink = Box::new(FfmpegSink::open(audio_cfg(&out_dir, &src, size)).unwrap());
        submit_frames(&sink, size, &(0..30).map(|i| fps.frame_pts(i)).collect::<Vec<_>>());
        let skipped = packets.len() / 2;
        for (i, p) in packets.iter().cloned().enumerate() {
            if i != skipped {
                assert!(sink.submit_audio(p).unwrap().is_accepted());
            }
        }
        sink.mark_finished(StreamKind::Audio).unwrap();
        let err = sink.finish().unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Write);
        assert!(err.to_string().contains("accepted"), "{err}");
        assert_eq!(std::fs::read_dir(&out_dir).unwrap().count(), 0);
    }
}
