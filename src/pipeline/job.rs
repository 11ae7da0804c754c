use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::ExportOpts;
use crate::filter::FilterSpec;
use crate::foundation::error::{ExportError, ExportResult};
use crate::geometry::{RawMatrix, RenderTarget};
use crate::media::thumbnail::ThumbnailPolicy;
use crate::overlay::{OverlayDescriptor, PreviewSpace};

/// One export request: what to read, what to burn in and where to write it.
///
/// Serializable so the CLI can take a whole job as JSON.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ExportJob {
    pub source: PathBuf,
    pub output: PathBuf,
    /// Draw order is list order; later entries end up on top.
    #[serde(default)]
    pub overlays: Vec<OverlayDescriptor>,
    /// Coordinate space the overlays were placed in. Defaults to render pixels.
    #[serde(default)]
    pub preview: Option<PreviewSpace>,
    #[serde(default, deserialize_with = "de_filter")]
    pub filter: Option<FilterSpec>,
    #[serde(default)]
    pub target: RenderTarget,
    /// Extra horizontal mirror applied on top of the container orientation (front camera).
    #[serde(default)]
    pub mirrored: bool,
    /// Replaces the container's orientation metadata.
    #[serde(default)]
    pub orientation_override: Option<RawMatrix>,
    #[serde(default)]
    pub thumbnail: ThumbnailPolicy,
    #[serde(default)]
    pub opts: ExportOpts,
}

fn de_filter<'de, D>(de: D) -> Result<Option<FilterSpec>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let id: Option<String> = serde::Deserialize::deserialize(de)?;
    match id {
        None => Ok(None),
        Some(id) => FilterSpec::from_id(&id).map_err(serde::de::Error::custom),
    }
}

impl ExportJob {
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            overlays: Vec::new(),
            preview: None,
            filter: None,
            target: RenderTarget::default(),
            mirrored: false,
            orientation_override: None,
            thumbnail: ThumbnailPolicy::default(),
            opts: ExportOpts::default(),
        }
    }

    pub fn with_overlay(mut self, overlay: OverlayDescriptor) -> Self {
        self.overlays.push(overlay);
        self
    }

    pub fn with_overlays(mut self, overlays: Vec<OverlayDescriptor>) -> Self {
        self.overlays = overlays;
        self
    }

    pub fn with_preview(mut self, preview: PreviewSpace) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_filter(mut self, filter: Option<FilterSpec>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_target(mut self, target: RenderTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_mirrored(mut self, mirrored: bool) -> Self {
        self.mirrored = mirrored;
        self
    }

    pub fn with_orientation_override(mut self, m: RawMatrix) -> Self {
        self.orientation_override = Some(m);
        self
    }

    pub fn with_thumbnail(mut self, policy: ThumbnailPolicy) -> Self {
        self.thumbnail = policy;
        self
    }

    pub fn with_opts(mut self, opts: ExportOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Load a job from a JSON file.
    pub fn from_path(path: &Path) -> ExportResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read export job '{}'", path.display()))?;
        let job: Self = serde_json::from_str(&text)
            .map_err(|e| ExportError::validation(format!("parse export job: {e}")))?;
        job.validate()?;
        Ok(job)
    }

    /// Reject malformed jobs before anything is opened.
    pub fn validate(&self) -> ExportResult<()> {
        if self.output.file_name().is_none() {
            return Err(ExportError::validation(format!(
                "output path '{}' has no file name",
                self.output.display()
            )));
        }
        if self.source == self.output {
            return Err(ExportError::validation(
                "output path must differ from the source path",
            ));
        }
        if let Some(size) = self.target.size
            && size.is_empty()
        {
            return Err(ExportError::validation(format!(
                "target size must be non-empty, got {size}"
            )));
        }
        if let ThumbnailPolicy::Path(p) = &self.thumbnail
            && (p == &self.output || p == &self.source)
        {
            return Err(ExportError::validation(
                "thumbnail path must differ from the source and output paths",
            ));
        }
        self.opts.validate()
    }
}
