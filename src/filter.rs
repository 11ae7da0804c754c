//! Closed catalog of color filters.
//!
//! Every filter is a fixed per-pixel transform: a 3x4 color matrix followed by a shared
//! per-channel tone curve. Filters never touch geometry; orientation is owned entirely by
//! [`crate::geometry::GeometryPlan`].

use rayon::prelude::*;

use crate::foundation::error::{ExportError, ExportResult};

/// Bumped whenever a catalog entry changes its output.
pub const FILTER_CATALOG_VERSION: u32 = 1;

const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// One entry of the filter catalog. "No filter" is `Option::<FilterSpec>::None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterSpec {
    /// Luma-only desaturation.
    Mono,
    /// High-contrast monochrome.
    Noir,
    /// Washed-out, lifted blacks.
    Fade,
    /// Warm vintage print.
    Instant,
    /// Cool, punchy cross-process look.
    Process,
}

impl FilterSpec {
    pub const ALL: [FilterSpec; 5] = [
        FilterSpec::Mono,
        FilterSpec::Noir,
        FilterSpec::Fade,
        FilterSpec::Instant,
        FilterSpec::Process,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Mono => "mono",
            Self::Noir => "noir",
            Self::Fade => "fade",
            Self::Instant => "instant",
            Self::Process => "process",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Mono => "Mono",
            Self::Noir => "Noir",
            Self::Fade => "Fade",
            Self::Instant => "Instant",
            Self::Process => "Process",
        }
    }

    /// Resolve a catalog identifier. `"none"` and the empty string mean no filter.
    pub fn from_id(id: &str) -> ExportResult<Option<Self>> {
        let id = id.trim().to_ascii_lowercase();
        if id.is_empty() || id == "none" {
            return Ok(None);
        }
        Self::ALL
            .into_iter()
            .find(|f| f.id() == id)
            .map(Some)
            .ok_or_else(|| ExportError::validation(format!("unknown filter id '{id}'")))
    }

    pub fn color_transform(self) -> ColorTransform {
        match self {
            Self::Mono => ColorTransform::new(saturation_matrix(0.0), None),
            Self::Noir => ColorTransform::new(
                saturation_matrix(0.0),
                Some(&[(0.0, 0.0), (0.25, 0.1), (0.5, 0.5), (0.75, 0.9), (1.0, 1.0)]),
            ),
            Self::Fade => ColorTransform::new(
                saturation_matrix(0.65),
                Some(&[(0.0, 0.12), (0.5, 0.52), (1.0, 0.92)]),
            ),
            Self::Instant => ColorTransform::new(
                tint(saturation_matrix(0.85), [1.06, 1.0, 0.9]),
                Some(&[(0.0, 0.06), (0.5, 0.53), (1.0, 0.96)]),
            ),
            Self::Process => ColorTransform::new(
                tint(saturation_matrix(0.9), [0.94, 1.0, 1.08]),
                Some(&[(0.0, 0.02), (0.25, 0.2), (0.75, 0.82), (1.0, 1.0)]),
            ),
        }
    }
}

/// Resolve the optional filter of a job into the transform the compositor applies.
pub fn resolve(filter: Option<FilterSpec>) -> ColorTransform {
    filter
        .map(FilterSpec::color_transform)
        .unwrap_or_else(ColorTransform::identity)
}

/// Deterministic, time-invariant per-pixel color transform on straight RGBA8.
///
/// `rgb' = curve(clamp(M * [r g b 1]))`; alpha is untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct ColorTransform {
    matrix: [[f32; 4]; 3],
    lut: Box<[u8; 256]>,
    identity: bool,
}

impl ColorTransform {
    pub fn identity() -> Self {
        Self {
            matrix: IDENTITY_MATRIX,
            lut: identity_lut(),
            identity: true,
        }
    }

    fn new(matrix: [[f32; 4]; 3], curve: Option<&[(f32, f32)]>) -> Self {
        let lut = match curve {
            Some(points) => curve_lut(points),
            None => identity_lut(),
        };
        Self {
            identity: matrix == IDENTITY_MATRIX && lut == identity_lut(),
            matrix,
            lut,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Matrix rows (`[m0 m1 m2 offset]` per output channel), for GPU upload.
    pub fn matrix(&self) -> &[[f32; 4]; 3] {
        &self.matrix
    }

    /// Tone curve as a 256-entry table, for GPU upload.
    pub fn lut(&self) -> &[u8; 256] {
        &self.lut
    }

    pub fn apply_pixel(&self, px: [u8; 4]) -> [u8; 4] {
        if self.identity {
            return px;
        }
        let rgb = [
            f32::from(px[0]) / 255.0,
            f32::from(px[1]) / 255.0,
            f32::from(px[2]) / 255.0,
        ];
        let mut out = [0u8; 4];
        for (i, row) in self.matrix.iter().enumerate() {
            let v = row[0] * rgb[0] + row[1] * rgb[1] + row[2] * rgb[2] + row[3];
            let idx = (v.clamp(0.0, 1.0) * 255.0).round() as usize;
            out[i] = self.lut[idx];
        }
        out[3] = px[3];
        out
    }

    /// Apply in place to a tightly packed RGBA8 buffer.
    pub fn apply_rgba8(&self, data: &mut [u8]) -> ExportResult<()> {
        if !data.len().is_multiple_of(4) {
            return Err(ExportError::composite(
                "filter input is not a whole number of rgba8 pixels",
            ));
        }
        if self.identity {
            return Ok(());
        }
        data.par_chunks_mut(4 * 1024).for_each(|chunk| {
            for px in chunk.chunks_exact_mut(4) {
                let out = self.apply_pixel([px[0], px[1], px[2], px[3]]);
                px.copy_from_slice(&out);
            }
        });
        Ok(())
    }
}

const IDENTITY_MATRIX: [[f32; 4]; 3] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

fn saturation_matrix(s: f32) -> [[f32; 4]; 3] {
    let mut m = [[0.0f32; 4]; 3];
    for (i, row) in m.iter_mut().enumerate() {
        for j in 0..3 {
            row[j] = (1.0 - s) * LUMA[j] + if i == j { s } else { 0.0 };
        }
    }
    m
}

fn tint(mut m: [[f32; 4]; 3], gains: [f32; 3]) -> [[f32; 4]; 3] {
    for (row, g) in m.iter_mut().zip(gains) {
        for v in row.iter_mut() {
            *v *= g;
        }
    }
    m
}

fn identity_lut() -> Box<[u8; 256]> {
    let mut lut = Box::new([0u8; 256]);
    for (i, v) in lut.iter_mut().enumerate() {
        *v = i as u8;
    }
    lut
}

/// Piecewise-linear curve through `points` (sorted by x, covering 0..=1).
fn curve_lut(points: &[(f32, f32)]) -> Box<[u8; 256]> {
    let mut lut = Box::new([0u8; 256]);
    for (i, v) in lut.iter_mut().enumerate() {
        let x = i as f32 / 255.0;
        let y = match points.windows(2).find(|w| x <= w[1].0) {
            Some(w) => {
                let (x0, y0) = w[0];
                let (x1, y1) = w[1];
                let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
                y0 + (y1 - y0) * t.clamp(0.0, 1.0)
            }
            None => points.last().map(|p| p.1).unwrap_or(x),
        };
        *v = (y.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    lut
}
