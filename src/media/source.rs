use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::foundation::core::{Size, Timestamp};
use crate::foundation::error::{ExportError, ExportResult};
use crate::media::probe::{TrackInfo, probe};
use crate::render::backend::FrameRGBA;
use crate::render::surface_pool::SurfacePool;

/// One decoded video frame and its presentation time.
#[derive(Debug)]
pub struct VideoSample {
    pub frame: FrameRGBA,
    pub pts: Timestamp,
}

/// One compressed audio packet, passed through to the sink without re-encoding.
///
/// The payload stays in the source container; `byte_offset`/`size` identify it there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedSample {
    pub pts: Timestamp,
    pub duration: Timestamp,
    pub size: usize,
    pub byte_offset: Option<u64>,
    pub keyframe: bool,
}

/// Lazy, finite, single-pass sequence of decoded frames.
pub type VideoFrames = Box<dyn Iterator<Item = ExportResult<VideoSample>> + Send>;
/// Lazy, finite, single-pass sequence of encoded audio samples.
pub type AudioSamples = Box<dyn Iterator<Item = ExportResult<EncodedSample>> + Send>;

/// An opened container.
///
/// Each sequence can be taken once; asking again is an error since decoding is not restartable.
pub trait FrameSource: Send {
    fn info(&self) -> &TrackInfo;

    fn video_frames(&mut self) -> ExportResult<VideoFrames>;

    /// Empty when the container has no audio track.
    fn audio_samples(&mut self) -> ExportResult<AudioSamples>;
}

/// [`FrameSource`] decoding through `ffmpeg` (video) and `ffprobe` (audio packet listing).
pub struct FfmpegSource {
    info: TrackInfo,
    pool: Arc<SurfacePool>,
    video_taken: bool,
    audio_taken: bool,
}

impl FfmpegSource {
    pub fn open(path: &Path, pool: Arc<SurfacePool>) -> ExportResult<Self> {
        let info = probe(path)?;
        Ok(Self {
            info,
            pool,
            video_taken: false,
            audio_taken: false,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &TrackInfo {
        &self.info
    }

    fn video_frames(&mut self) -> ExportResult<VideoFrames> {
        if std::mem::replace(&mut self.video_taken, true) {
            return Err(ExportError::decode("video frames were already consumed"));
        }
        Ok(Box::new(FfmpegVideoFrames::spawn(
            &self.info.path,
            self.info.native_size,
            self.pool.clone(),
        )?))
    }

    fn audio_samples(&mut self) -> ExportResult<AudioSamples> {
        if std::mem::replace(&mut self.audio_taken, true) {
            return Err(ExportError::decode("audio samples were already consumed"));
        }
        if !self.info.has_audio {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(FfprobeAudioPackets::spawn(&self.info.path)?))
    }
}

struct FfmpegVideoFrames {
    path: PathBuf,
    child: Option<Child>,
    stdout: BufReader<ChildStdout>,
    stderr: Option<std::thread::JoinHandle<Vec<String>>>,
    pts_rx: Receiver<(u64, f64)>,
    size: Size,
    pool: Arc<SurfacePool>,
    index: u64,
    first_pts: Option<f64>,
    last_pts: Option<Timestamp>,
    done: bool,
}

/// Upper bound on the lag between a frame on stdout and its showinfo line on stderr.
const PTS_WAIT: Duration = Duration::from_secs(10);

impl FfmpegVideoFrames {
    fn spawn(path: &Path, size: Size, pool: Arc<SurfacePool>) -> ExportResult<Self> {
        // `-noautorotate`: orientation is applied exactly once, by the geometry plan.
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-nostdin", "-nostats", "-loglevel", "info"])
            .args(["-noautorotate", "-i"])
            .arg(path)
            .args([
                "-map",
                "0:v:0",
                "-vf",
                "showinfo",
                "-fps_mode",
                "passthrough",
                "-xerror",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "rgba",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExportError::decode(format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::decode("failed to open ffmpeg stdout (unexpected)"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExportError::decode("failed to open ffmpeg stderr (unexpected)"))?;

        let (tx, pts_rx) = std::sync::mpsc::channel();
        let stderr = std::thread::Builder::new()
            .name("burnin-decode-log".to_string())
            .spawn(move || {
                let mut tail = Vec::new();
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if let Some(stamp) = parse_showinfo(&line) {
                        let _ = tx.send(stamp);
                    } else if !line.contains("Parsed_showinfo") {
                        if tail.len() == 16 {
                            tail.remove(0);
                        }
                        tail.push(line);
                    }
                }
                tail
            })
            .map_err(|e| ExportError::decode(format!("failed to spawn decode log thread: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            child: Some(child),
            stdout: BufReader::with_capacity(size.byte_len_rgba8().min(1 << 22), stdout),
            stderr: Some(stderr),
            pts_rx,
            size,
            pool,
            index: 0,
            first_pts: None,
            last_pts: None,
            done: false,
        })
    }

    fn finish(&mut self) -> Option<ExportResult<VideoSample>> {
        self.done = true;
        let status = self.child.take().map(|mut c| c.wait());
        let tail = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        match status {
            Some(Ok(s)) if s.success() => None,
            Some(Ok(s)) => Some(Err(ExportError::decode(format!(
                "ffmpeg exited with {s} while decoding '{}': {}",
                self.path.display(),
                tail.join("\n").trim()
            )))),
            Some(Err(e)) => Some(Err(ExportError::decode(format!(
                "failed to wait for ffmpeg: {e}"
            )))),
            None => None,
        }
    }

    fn next_pts(&mut self) -> ExportResult<Timestamp> {
        let secs = recv_frame_stamp(&self.pts_rx, self.index, PTS_WAIT)?;
        let first = *self.first_pts.get_or_insert(secs);
        let pts = Timestamp::from_secs_f64(secs - first);
        Ok(match self.last_pts {
            Some(last) if pts <= last => {
                tracing::warn!(index = self.index, %pts, %last, "non-increasing pts clamped");
                Timestamp(last.0 + 1)
            }
            _ => pts,
        })
    }
}

impl Iterator for FfmpegVideoFrames {
    type Item = ExportResult<VideoSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut frame = FrameRGBA::pooled(&self.pool, self.size);
        match read_full(&mut self.stdout, frame.data_mut()) {
            Ok(0) => self.finish(),
            Ok(n) if n == frame.data().len() => {
                let pts = match self.next_pts() {
                    Ok(pts) => pts,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };
                self.last_pts = Some(pts);
                self.index += 1;
                Some(Ok(VideoSample { frame, pts }))
            }
            Ok(n) => {
                let err = self.finish().and_then(Result::err);
                self.done = true;
                Some(Err(err.unwrap_or_else(|| {
                    ExportError::decode(format!(
                        "truncated frame {}: got {n} of {} bytes",
                        self.index,
                        frame.data().len()
                    ))
                })))
            }
            Err(e) => {
                self.finish();
                Some(Err(ExportError::decode(format!(
                    "failed to read decoded frame {}: {e}",
                    self.index
                ))))
            }
        }
    }
}

impl Drop for FfmpegVideoFrames {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Wait for the showinfo timestamp of frame `index`, skipping stale lines. A missing or
/// out-of-order timestamp is a decode error; frames are never retimed.
fn recv_frame_stamp(rx: &Receiver<(u64, f64)>, index: u64, wait: Duration) -> ExportResult<f64> {
    loop {
        match rx.recv_timeout(wait) {
            Ok((n, secs)) if n == index => return Ok(secs),
            Ok((n, _)) if n < index => continue,
            Ok((n, _)) => {
                return Err(ExportError::decode(format!(
                    "timestamp for frame {n} arrived while waiting for frame {index}"
                )));
            }
            Err(RecvTimeoutError::Timeout) => {
                return Err(ExportError::decode(format!(
                    "no timestamp for frame {index} within {wait:?}"
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ExportError::decode(format!(
                    "decoder log ended before the timestamp of frame {index}"
                )));
            }
        }
    }
}

/// `(frame number, pts seconds)` from one showinfo log line.
fn parse_showinfo(line: &str) -> Option<(u64, f64)> {
    if !line.contains("Parsed_showinfo") {
        return None;
    }
    let field = |key: &str| {
        let rest = &line[line.find(key)? + key.len()..];
        rest.split_whitespace().next()
    };
    let n = field(" n:")?.parse().ok()?;
    let pts = field("pts_time:")?.parse().ok()?;
    Some((n, pts))
}

/// Every packet of the first audio track of `path`, in container order.
pub(crate) fn list_audio_packets(path: &Path) -> ExportResult<Vec<EncodedSample>> {
    FfprobeAudioPackets::spawn(path)?.collect()
}

struct FfprobeAudioPackets {
    child: Option<Child>,
    lines: std::io::Lines<BufReader<ChildStdout>>,
    first_pts: Option<f64>,
    last_pts: Option<Timestamp>,
    done: bool,
}

impl FfprobeAudioPackets {
    fn spawn(path: &Path) -> ExportResult<Self> {
        let mut child = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "a:0",
                "-show_entries",
                "packet=pts_time,duration_time,size,pos,flags",
                "-of",
                "compact=p=0:nk=0",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExportError::decode(format!("failed to spawn ffprobe: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::decode("failed to open ffprobe stdout (unexpected)"))?;
        Ok(Self {
            child: Some(child),
            lines: BufReader::new(stdout).lines(),
            first_pts: None,
            last_pts: None,
            done: false,
        })
    }
}

impl Iterator for FfprobeAudioPackets {
    type Item = ExportResult<EncodedSample>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.lines.next() {
                Some(Ok(line)) => {
                    let Some(mut sample) = parse_packet_line(&line) else {
                        continue;
                    };
                    let raw = sample.pts.as_secs_f64();
                    let first = *self.first_pts.get_or_insert(raw);
                    sample.pts = Timestamp::from_secs_f64(raw - first);
                    if let Some(last) = self.last_pts
                        && sample.pts <= last
                    {
                        sample.pts = Timestamp(last.0 + 1);
                    }
                    self.last_pts = Some(sample.pts);
                    return Some(Ok(sample));
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(ExportError::decode(format!(
                        "failed to read audio packet listing: {e}"
                    ))));
                }
                None => {
                    self.done = true;
                    let status = self.child.take().map(|mut c| c.wait());
                    return match status {
                        Some(Ok(s)) if !s.success() => Some(Err(ExportError::decode(format!(
                            "ffprobe exited with {s} while listing audio packets"
                        )))),
                        Some(Err(e)) => Some(Err(ExportError::decode(format!(
                            "failed to wait for ffprobe: {e}"
                        )))),
                        _ => None,
                    };
                }
            }
        }
        None
    }
}

impl Drop for FfprobeAudioPackets {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Parse one `key=value|key=value` line of ffprobe's compact packet output.
fn parse_packet_line(line: &str) -> Option<EncodedSample> {
    let mut pts = None;
    let mut duration = Timestamp::ZERO;
    let mut size = 0usize;
    let mut byte_offset = None;
    let mut keyframe = false;
    for field in line.trim().split('|') {
        let Some((k, v)) = field.split_once('=') else {
            continue;
        };
        match k {
            "pts_time" => pts = v.parse::<f64>().ok(),
            "duration_time" => {
                duration = v
                    .parse::<f64>()
                    .map(Timestamp::from_secs_f64)
                    .unwrap_or_default()
            }
            "size" => size = v.parse().unwrap_or(0),
            "pos" => byte_offset = v.parse().ok(),
            "flags" => keyframe = v.starts_with('K'),
            _ => {}
        }
    }
    Some(EncodedSample {
        pts: Timestamp::from_secs_f64(pts?),
        duration,
        size,
        byte_offset,
        keyframe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_showinfo_lines() {
        let line = "[Parsed_showinfo_0 @ 0x55d] n:  12 pts:  12288 pts_time:0.4     duration:1024 fmt:yuv420p";
        assert_eq!(parse_showinfo(line), Some((12, 0.4)));
        assert_eq!(parse_showinfo("[Parsed_showinfo_0 @ 0x55d] config in time_base: 1/30"), None);
        assert_eq!(parse_showinfo("frame= 10 fps=0.0 pts_time:1.0"), None);
    }

    #[test]
    fn frame_stamps_pair_by_frame_number() {
        let (tx, rx) = std::sync::mpsc::channel();
        let wait = Duration::from_millis(20);
        tx.send((0, 0.0)).unwrap();
        tx.send((1, 0.05)).unwrap();
        assert_eq!(recv_frame_stamp(&rx, 1, wait).unwrap(), 0.05);

        // A frame without its own line fails instead of borrowing a neighbour's timestamp.
        let err = recv_frame_stamp(&rx, 2, wait).unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Decode);

        tx.send((4, 0.2)).unwrap();
        let err = recv_frame_stamp(&rx, 3, wait).unwrap_err();
        assert!(err.to_string().contains("frame 4"), "{err}");

        drop(tx);
        let err = recv_frame_stamp(&rx, 5, wait).unwrap_err();
        assert!(err.to_string().contains("ended"), "{err}");
    }

    #[test]
    fn parses_compact_packet_lines() {
        let s = parse_packet_line("pts_time=0.021333|duration_time=0.021333|size=371|pos=48|flags=K__")
            .unwrap();
        assert_eq!(s.pts, Timestamp(21_333));
        assert_eq!(s.duration, Timestamp(21_333));
        assert_eq!(s.size, 371);
        assert_eq!(s.byte_offset, Some(48));
        assert!(s.keyframe);

        let s = parse_packet_line("pts_time=1.0|duration_time=N/A|size=10|pos=N/A|flags=___").unwrap();
        assert_eq!(s.byte_offset, None);
        assert!(!s.keyframe);
        assert!(parse_packet_line("pts_time=N/A|size=3").is_none());
        assert!(parse_packet_line("").is_none());
    }

    #[test]
    fn read_full_reports_short_reads() {
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut &[1u8, 2, 3][..], &mut buf).unwrap(), 3);
        assert_eq!(read_full(&mut &[0u8; 16][..], &mut buf).unwrap(), 8);
    }
}
