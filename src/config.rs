//! Export and logging configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::foundation::error::{ExportError, ExportResult};
use crate::geometry::GeometryPreference;
use crate::render::surface_pool::SurfacePoolOpts;

/// Which compositor implementation runs the per-frame draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Reference compositor on the CPU (rayon).
    #[default]
    Cpu,
    /// wgpu compositor; requires the `gpu` feature.
    Gpu,
}

impl std::str::FromStr for BackendKind {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => Err(ExportError::validation(format!(
                "unknown backend '{other}' (expected cpu|gpu)"
            ))),
        }
    }
}

/// Scheduler-level timeout policy for sink backpressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PumpOpts {
    /// Upper bound on one readiness wait before the pump re-checks cancellation.
    pub ready_poll_ms: u64,
    /// Fail with a write error when a stream stays not-ready this long. `None` waits forever
    /// (still checking cancellation every poll).
    pub stall_timeout_ms: Option<u64>,
}

impl Default for PumpOpts {
    fn default() -> Self {
        Self {
            ready_poll_ms: 10,
            stall_timeout_ms: Some(30_000),
        }
    }
}

impl PumpOpts {
    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }
}

/// Encoder preset selection. Hardware tuning beyond this is out of scope.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EncoderOpts {
    pub codec: String,
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
}

impl Default for EncoderOpts {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 20,
            pixel_format: "yuv420p".to_string(),
        }
    }
}

/// Options for one export, independent of the job's content.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExportOpts {
    pub backend: BackendKind,
    pub pump: PumpOpts,
    pub pool: SurfacePoolOpts,
    pub encoder: EncoderOpts,
    /// Composited frames buffered between the video pump and the encoder.
    pub sink_queue_depth: usize,
    /// How far audio may run ahead of the last accepted video frame before the audio stream
    /// reports not-ready.
    pub audio_interleave_window_ms: u64,
    pub geometry: GeometryPreference,
    /// Replace an existing file at the destination.
    pub overwrite: bool,
}

impl Default for ExportOpts {
    fn default() -> Self {
        Self {
            backend: BackendKind::Cpu,
            pump: PumpOpts::default(),
            pool: SurfacePoolOpts::default(),
            encoder: EncoderOpts::default(),
            sink_queue_depth: 4,
            audio_interleave_window_ms: 500,
            geometry: GeometryPreference::Compositor,
            overwrite: true,
        }
    }
}

impl ExportOpts {
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_pump(mut self, pump: PumpOpts) -> Self {
        self.pump = pump;
        self
    }

    pub fn with_encoder(mut self, encoder: EncoderOpts) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_sink_queue_depth(mut self, depth: usize) -> Self {
        self.sink_queue_depth = depth;
        self
    }

    pub fn with_geometry(mut self, geometry: GeometryPreference) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn audio_interleave_window(&self) -> Duration {
        Duration::from_millis(self.audio_interleave_window_ms)
    }

    /// Load options from a JSON file; missing fields take their defaults.
    pub fn from_path(path: &Path) -> ExportResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read export options '{}'", path.display()))?;
        let opts: Self = serde_json::from_str(&text)
            .map_err(|e| ExportError::validation(format!("parse export options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Apply `BURNIN_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = get("BURNIN_BACKEND") {
            match v.parse() {
                Ok(kind) => self.backend = kind,
                Err(e) => tracing::warn!(error = %e, "ignoring BURNIN_BACKEND"),
            }
        }
        if let Some(ms) = get("BURNIN_READY_POLL_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.pump.ready_poll_ms = ms.max(1);
        }
        if let Some(v) = get("BURNIN_STALL_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(0) => self.pump.stall_timeout_ms = None,
                Ok(ms) => self.pump.stall_timeout_ms = Some(ms),
                Err(_) => tracing::warn!(value = %v, "ignoring BURNIN_STALL_TIMEOUT_MS"),
            }
        }
        if let Some(depth) = get("BURNIN_SINK_QUEUE_DEPTH")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            self.sink_queue_depth = depth;
        }
        if let Some(preset) = get("BURNIN_X264_PRESET").filter(|v| !v.trim().is_empty()) {
            self.encoder.preset = preset.trim().to_string();
        }
        self
    }

    pub fn validate(&self) -> ExportResult<()> {
        if self.sink_queue_depth == 0 {
            return Err(ExportError::validation("sink_queue_depth must be >= 1"));
        }
        if self.encoder.crf > 51 {
            return Err(ExportError::validation(format!(
                "crf must be in 0..=51, got {}",
                self.encoder.crf
            )));
        }
        if self.encoder.codec.trim().is_empty() || self.encoder.pixel_format.trim().is_empty() {
            return Err(ExportError::validation(
                "encoder codec and pixel format must be set",
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (e.g. "info", "burnin=debug,warn"). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
