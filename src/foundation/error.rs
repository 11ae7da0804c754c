/// Result alias used across the export pipeline.
pub type ExportResult<T> = Result<T, ExportError>;

/// Terminal error kinds an export job can surface.
///
/// `Open` and `GpuSetup` are returned before any frame is pulled. `Decode`, `Composite` and
/// `Write` abort both pump loops and discard partial output. `Thumbnail` never fails a job on its
/// own; the exporter folds it into a missing thumbnail.
#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("open error: {0}")]
    Open(String),

    #[error("gpu setup error: {0}")]
    GpuSetup(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("composite error: {0}")]
    Composite(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("thumbnail error: {0}")]
    Thumbnail(String),

    #[error("export cancelled")]
    Cancelled,

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Message-free discriminant of [`ExportError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Open,
    GpuSetup,
    Decode,
    Composite,
    Write,
    Thumbnail,
    Cancelled,
    Validation,
    Other,
}

impl ExportError {
    pub fn open(msg: impl Into<String>) -> Self {
        Self::Open(msg.into())
    }

    pub fn gpu_setup(msg: impl Into<String>) -> Self {
        Self::GpuSetup(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn composite(msg: impl Into<String>) -> Self {
        Self::Composite(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    pub fn thumbnail(msg: impl Into<String>) -> Self {
        Self::Thumbnail(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Open(_) => ErrorKind::Open,
            Self::GpuSetup(_) => ErrorKind::GpuSetup,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Composite(_) => ErrorKind::Composite,
            Self::Write(_) => ErrorKind::Write,
            Self::Thumbnail(_) => ErrorKind::Thumbnail,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// `true` for errors raised while the pumps are running.
    pub fn is_mid_stream(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Decode | ErrorKind::Composite | ErrorKind::Write
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(ExportError::open("x").to_string().contains("open error:"));
        assert!(
            ExportError::gpu_setup("x")
                .to_string()
                .contains("gpu setup error:")
        );
        assert!(ExportError::decode("x").to_string().contains("decode error:"));
        assert!(
            ExportError::composite("x")
                .to_string()
                .contains("composite error:")
        );
        assert!(ExportError::write("x").to_string().contains("write error:"));
        assert!(
            ExportError::thumbnail("x")
                .to_string()
                .contains("thumbnail error:")
        );
        assert!(
            ExportError::validation("x")
                .to_string()
                .contains("validation error:")
        );
    }

    #[test]
    fn kinds_round_trip_through_constructors() {
        assert_eq!(ExportError::open("x").kind(), ErrorKind::Open);
        assert_eq!(ExportError::gpu_setup("x").kind(), ErrorKind::GpuSetup);
        assert_eq!(ExportError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(ExportError::write("x").is_mid_stream());
        assert!(!ExportError::open("x").is_mid_stream());
        assert!(!ExportError::thumbnail("x").is_mid_stream());
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = ExportError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
