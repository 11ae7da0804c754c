use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::foundation::core::{Fps, Size, Timestamp};
use crate::foundation::error::{ExportError, ExportResult};
use crate::geometry::RawMatrix;

/// Immutable description of a source container, fixed for a job's lifetime.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrackInfo {
    pub path: PathBuf,
    /// Stored (pre-orientation) pixel size of the video track.
    pub native_size: Size,
    pub duration: Timestamp,
    pub fps: Fps,
    /// Raw orientation metadata as stored in the container, if any.
    pub orientation: Option<RawMatrix>,
    pub has_audio: bool,
    #[serde(default)]
    pub audio_duration: Option<Timestamp>,
    #[serde(default)]
    pub video_codec: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProbeSideData {
    side_data_type: Option<String>,
    displaymatrix: Option<String>,
    rotation: Option<f64>,
}

#[derive(serde::Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(serde::Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(serde::Deserialize)]
struct ProbeOut {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

/// Probe a container through `ffprobe`. Any failure is an open error.
#[tracing::instrument(level = "debug", skip(path), fields(path = %path.display()))]
pub fn probe(path: &Path) -> ExportResult<TrackInfo> {
    if !path.is_file() {
        return Err(ExportError::open(format!(
            "source '{}' does not exist or is not a file",
            path.display()
        )));
    }
    let out = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ExportError::open(format!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(ExportError::open(format!(
            "ffprobe failed for '{}': {}",
            path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    parse_probe_json(path, &out.stdout)
}

pub(crate) fn parse_probe_json(path: &Path, json: &[u8]) -> ExportResult<TrackInfo> {
    let parsed: ProbeOut = serde_json::from_slice(json)
        .map_err(|e| ExportError::open(format!("ffprobe json parse failed: {e}")))?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| {
            ExportError::open(format!("no video track in '{}'", path.display()))
        })?;
    let native_size = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Size::new(w, h),
        _ => {
            return Err(ExportError::open("video track has no frame size"));
        }
    };

    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(Fps::parse_ratio)
        .or_else(|| video.r_frame_rate.as_deref().and_then(Fps::parse_ratio))
        .unwrap_or_default();

    let secs = |s: &Option<String>| s.as_deref().and_then(|v| v.trim().parse::<f64>().ok());
    let duration = secs(&video.duration)
        .or_else(|| parsed.format.as_ref().and_then(|f| secs(&f.duration)))
        .map(Timestamp::from_secs_f64)
        .unwrap_or_default();

    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(TrackInfo {
        path: path.to_path_buf(),
        native_size,
        duration,
        fps,
        orientation: orientation_of(video),
        has_audio: audio.is_some(),
        audio_duration: audio.and_then(|a| secs(&a.duration)).map(Timestamp::from_secs_f64),
        video_codec: video.codec_name.clone(),
    })
}

fn orientation_of(video: &ProbeStream) -> Option<RawMatrix> {
    let display = video
        .side_data_list
        .iter()
        .filter(|sd| sd.side_data_type.as_deref() == Some("Display Matrix"));
    for sd in display.clone() {
        if let Some(m) = sd.displaymatrix.as_deref().and_then(RawMatrix::from_ffprobe_display_matrix) {
            return Some(m);
        }
    }
    // ffprobe reports side-data rotation counter-clockwise; legacy `rotate` tags are clockwise.
    if let Some(ccw) = display.filter_map(|sd| sd.rotation).next() {
        return Some(matrix_for_clockwise_degrees(-ccw));
    }
    video
        .tags
        .get("rotate")
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(matrix_for_clockwise_degrees)
}

fn matrix_for_clockwise_degrees(deg: f64) -> RawMatrix {
    let (s, c) = deg.to_radians().sin_cos();
    RawMatrix::new(c, s, -s, c, 0.0, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Orientation, Rotation};

    fn parse(json: &str) -> ExportResult<TrackInfo> {
        parse_probe_json(Path::new("/tmp/in.mov"), json.as_bytes())
    }

    #[test]
    fn parses_portrait_phone_capture() {
        let info = parse(
            r#"{
              "streams": [
                {"codec_type":"video","codec_name":"h264","width":1920,"height":1080,
                 "avg_frame_rate":"30000/1001","duration":"10.010000",
                 "side_data_list":[{"side_data_type":"Display Matrix",
                   "displaymatrix":"\n00000000:            0       65536           0\n00000001:       -65536           0           0\n00000002:            0           0  1073741824\n",
                   "rotation":-90}]},
                {"codec_type":"audio","codec_name":"aac","duration":"5.000000"}
              ],
              "format": {"duration":"10.010000"}
            }"#,
        )
        .unwrap();
        assert_eq!(info.native_size, Size::new(1920, 1080));
        assert_eq!(info.fps, Fps { num: 30000, den: 1001 });
        assert_eq!(info.duration, Timestamp(10_010_000));
        assert!(info.has_audio);
        assert_eq!(info.audio_duration, Some(Timestamp(5_000_000)));
        let o = Orientation::from_matrix(info.orientation.unwrap());
        assert_eq!(o.rotation, Rotation::R90);
    }

    #[test]
    fn rotation_fallbacks() {
        let info = parse(
            r#"{"streams":[{"codec_type":"video","width":640,"height":480,
                "side_data_list":[{"side_data_type":"Display Matrix","rotation":90}]}]}"#,
        )
        .unwrap();
        assert_eq!(
            Orientation::from_matrix(info.orientation.unwrap()).rotation,
            Rotation::R270
        );

        let info = parse(
            r#"{"streams":[{"codec_type":"video","width":640,"height":480,
                "tags":{"rotate":"180"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            Orientation::from_matrix(info.orientation.unwrap()).rotation,
            Rotation::R180
        );
        assert_eq!(info.fps, Fps::default());
        assert!(!info.has_audio);
    }

    #[test]
    fn missing_video_is_an_open_error() {
        let err = parse(r#"{"streams":[{"codec_type":"audio"}]}"#).unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Open);
        let err = parse("not json").unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Open);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = probe(Path::new("/definitely/not/a/video.mp4")).unwrap_err();
        assert_eq!(err.kind(), crate::foundation::error::ErrorKind::Open);
    }
}
