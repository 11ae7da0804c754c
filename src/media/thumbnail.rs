use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;

use crate::foundation::core::Size;
use crate::foundation::error::{ExportError, ExportResult};

/// Where the still image for a finished export goes.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailPolicy {
    /// `<output-stem>.png` next to the output.
    #[default]
    Derive,
    Path(PathBuf),
    Disabled,
}

/// Resolve the thumbnail destination for `output`, `None` when disabled.
pub fn resolve_thumbnail_path(policy: &ThumbnailPolicy, output: &Path) -> Option<PathBuf> {
    match policy {
        ThumbnailPolicy::Derive => {
            let stem = output.file_stem()?;
            let mut name = stem.to_os_string();
            name.push(".png");
            Some(output.with_file_name(name))
        }
        ThumbnailPolicy::Path(p) => Some(p.clone()),
        ThumbnailPolicy::Disabled => None,
    }
}

/// Decode the earliest frame of `video` and save it as a still image at `dest`.
///
/// The image format follows `dest`'s extension. Returns the size of the written image.
#[tracing::instrument(level = "debug", skip_all, fields(video = %video.display(), dest = %dest.display()))]
pub fn extract_thumbnail(video: &Path, dest: &Path) -> ExportResult<Size> {
    let out = Command::new("ffmpeg")
        .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-ss", "0", "-i"])
        .arg(video)
        .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "pipe:1"])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ExportError::thumbnail(format!("failed to run ffmpeg: {e}")))?;
    if !out.status.success() || out.stdout.is_empty() {
        return Err(ExportError::thumbnail(format!(
            "ffmpeg could not decode a frame from '{}': {}",
            video.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    let img = image::load_from_memory(&out.stdout)
        .map_err(|e| ExportError::thumbnail(format!("decoded frame is not an image: {e}")))?;
    write_still(&img, dest)?;
    Ok(Size::new(img.width(), img.height()))
}

pub(crate) fn write_still(img: &image::DynamicImage, dest: &Path) -> ExportResult<()> {
    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create thumbnail directory '{}'", parent.display()))
            .map_err(|e| ExportError::thumbnail(format!("{e:#}")))?;
    }
    img.save(dest).map_err(|e| {
        ExportError::thumbnail(format!("failed to write thumbnail '{}': {e}", dest.display()))
    })
}
