use crate::foundation::core::{Affine, Size};

/// Clockwise rotation that brings stored pixels upright.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Rotation {
    #[default]
    #[serde(rename = "0")]
    R0,
    #[serde(rename = "90")]
    R90,
    #[serde(rename = "180")]
    R180,
    #[serde(rename = "270")]
    R270,
}

impl Rotation {
    /// Snap an arbitrary clockwise angle to the nearest quarter turn.
    pub fn from_degrees_cw(deg: f64) -> Self {
        let quarter = (deg / 90.0).round() as i64;
        match quarter.rem_euclid(4) {
            0 => Self::R0,
            1 => Self::R90,
            2 => Self::R180,
            _ => Self::R270,
        }
    }

    pub fn degrees_cw(self) -> u32 {
        match self {
            Self::R0 => 0,
            Self::R90 => 90,
            Self::R180 => 180,
            Self::R270 => 270,
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::R90 | Self::R270)
    }
}

/// Raw 2x2 orientation matrix plus translation, as stored by a capture path.
///
/// Convention (y-down pixel space): `x' = a*x + c*y + tx`, `y' = b*x + d*y + ty`. This is the
/// layout of both a container display matrix and a "preferred transform". Different capture
/// paths disagree on the translation (and sometimes on sign conventions), so the raw matrix is
/// never applied verbatim; see [`Orientation::from_matrix`].
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RawMatrix {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    #[serde(default)]
    pub tx: f64,
    #[serde(default)]
    pub ty: f64,
}

impl RawMatrix {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    pub fn new(a: f64, b: f64, c: f64, d: f64, tx: f64, ty: f64) -> Self {
        Self { a, b, c, d, tx, ty }
    }

    /// Parse ffprobe's textual `displaymatrix` dump.
    ///
    /// Rows are `a b u`, `c d v`, `x y w`; the first two columns of the first two rows are 16.16
    /// fixed point. Returns `None` when fewer than nine integers are present.
    pub fn from_ffprobe_display_matrix(text: &str) -> Option<Self> {
        let values: Vec<i64> = text
            .lines()
            .filter_map(|line| line.split_once(':').map(|(_, rest)| rest))
            .flat_map(|rest| rest.split_whitespace())
            .filter_map(|tok| tok.parse::<i64>().ok())
            .collect();
        if values.len() < 9 {
            return None;
        }
        let fixed = |v: i64| v as f64 / 65536.0;
        Some(Self {
            a: fixed(values[0]),
            b: fixed(values[1]),
            c: fixed(values[3]),
            d: fixed(values[4]),
            tx: fixed(values[6]),
            ty: fixed(values[7]),
        })
    }

    fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }
}

/// Canonical orientation: a quarter-turn rotation followed by an optional horizontal mirror in
/// display space. All eight axis-aligned orientations are representable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Orientation {
    pub rotation: Rotation,
    #[serde(default)]
    pub mirrored: bool,
}

impl Orientation {
    pub const UPRIGHT: Self = Self {
        rotation: Rotation::R0,
        mirrored: false,
    };

    pub fn new(rotation: Rotation, mirrored: bool) -> Self {
        Self { rotation, mirrored }
    }

    /// Canonicalize a raw matrix.
    ///
    /// Only the linear part is consulted. A negative determinant means the matrix contains a
    /// reflection; the reflection is factored out as a display-space horizontal mirror and the
    /// remaining rotation is snapped to the nearest quarter turn. Translation is ignored and
    /// re-derived by [`Orientation::transform`], which is what makes a gallery-imported `a=-1,
    /// d=-1` matrix without translation and a freshly recorded one with translation agree.
    pub fn from_matrix(m: RawMatrix) -> Self {
        let mirrored = m.determinant() < 0.0;
        // M = F * R with F = diag(-1, 1) acting on x'; undo F by negating the x' row.
        let (ra, rb) = if mirrored { (-m.a, m.b) } else { (m.a, m.b) };
        if ra.abs() < f64::EPSILON && rb.abs() < f64::EPSILON {
            return Self::UPRIGHT;
        }
        let deg = rb.atan2(ra).to_degrees();
        Self {
            rotation: Rotation::from_degrees_cw(deg),
            mirrored,
        }
    }

    /// Combine with an additional display-space mirror (front camera capture).
    pub fn with_extra_mirror(self, mirror: bool) -> Self {
        Self {
            rotation: self.rotation,
            mirrored: self.mirrored ^ mirror,
        }
    }

    pub fn is_identity(self) -> bool {
        self == Self::UPRIGHT
    }

    /// Size of the upright image for stored pixels of size `native`.
    pub fn oriented_size(self, native: Size) -> Size {
        if self.rotation.swaps_axes() {
            native.transposed()
        } else {
            native
        }
    }

    /// Transform mapping stored pixel coordinates onto the upright rectangle
    /// `[0, W'] x [0, H']`.
    pub fn transform(self, native: Size) -> Affine {
        let w = f64::from(native.width);
        let h = f64::from(native.height);
        // kurbo coefficient order: [a, b, c, d, e, f] with x' = a*x + c*y + e, y' = b*x + d*y + f.
        let rot = match self.rotation {
            Rotation::R0 => Affine::IDENTITY,
            Rotation::R90 => Affine::new([0.0, 1.0, -1.0, 0.0, h, 0.0]),
            Rotation::R180 => Affine::new([-1.0, 0.0, 0.0, -1.0, w, h]),
            Rotation::R270 => Affine::new([0.0, -1.0, 1.0, 0.0, 0.0, w]),
        };
        if self.mirrored {
            let out_w = f64::from(self.oriented_size(native).width);
            Affine::new([-1.0, 0.0, 0.0, 1.0, out_w, 0.0]) * rot
        } else {
            rot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::core::Point;

    fn map(a: Affine, x: f64, y: f64) -> (f64, f64) {
        let p = a * Point::new(x, y);
        (p.x, p.y)
    }

    #[test]
    fn canonical_quarter_turns() {
        let r90 = RawMatrix::new(0.0, 1.0, -1.0, 0.0, 1080.0, 0.0);
        assert_eq!(
            Orientation::from_matrix(r90),
            Orientation::new(Rotation::R90, false)
        );
        let r270 = RawMatrix::new(0.0, -1.0, 1.0, 0.0, 0.0, 1920.0);
        assert_eq!(
            Orientation::from_matrix(r270),
            Orientation::new(Rotation::R270, false)
        );
        assert_eq!(
            Orientation::from_matrix(RawMatrix::IDENTITY),
            Orientation::UPRIGHT
        );
    }

    #[test]
    fn gallery_and_camera_180_encodings_agree() {
        let camera = RawMatrix::new(-1.0, 0.0, 0.0, -1.0, 1920.0, 1080.0);
        let gallery = RawMatrix::new(-1.0, 0.0, 0.0, -1.0, 0.0, 0.0);
        let a = Orientation::from_matrix(camera);
        let b = Orientation::from_matrix(gallery);
        assert_eq!(a, b);
        assert_eq!(a.rotation, Rotation::R180);
        assert!(!a.mirrored);
    }

    #[test]
    fn reflections_factor_into_mirror() {
        let hflip = RawMatrix::new(-1.0, 0.0, 0.0, 1.0, 0.0, 0.0);
        assert_eq!(
            Orientation::from_matrix(hflip),
            Orientation::new(Rotation::R0, true)
        );
        let vflip = RawMatrix::new(1.0, 0.0, 0.0, -1.0, 0.0, 0.0);
        assert_eq!(
            Orientation::from_matrix(vflip),
            Orientation::new(Rotation::R180, true)
        );
        let transpose = RawMatrix::new(0.0, 1.0, 1.0, 0.0, 0.0, 0.0);
        assert_eq!(
            Orientation::from_matrix(transpose),
            Orientation::new(Rotation::R90, true)
        );
    }

    #[test]
    fn near_axis_matrices_snap() {
        let m = RawMatrix::new(0.0001, 0.9999, -0.9999, 0.0001, 0.0, 0.0);
        assert_eq!(Orientation::from_matrix(m).rotation, Rotation::R90);
    }

    #[test]
    fn transforms_map_corners_into_upright_rect() {
        let native = Size::new(4, 2);
        let t = Orientation::new(Rotation::R90, false).transform(native);
        // Stored top-left lands at the upright top-right.
        assert_eq!(map(t, 0.0, 0.0), (2.0, 0.0));
        assert_eq!(map(t, 4.0, 2.0), (0.0, 4.0));

        let t = Orientation::new(Rotation::R180, false).transform(native);
        assert_eq!(map(t, 0.0, 0.0), (4.0, 2.0));

        let t = Orientation::new(Rotation::R270, false).transform(native);
        assert_eq!(map(t, 0.0, 0.0), (0.0, 4.0));

        let t = Orientation::new(Rotation::R0, true).transform(native);
        assert_eq!(map(t, 0.0, 0.0), (4.0, 0.0));
    }

    #[test]
    fn extra_mirror_toggles() {
        let o = Orientation::new(Rotation::R90, true).with_extra_mirror(true);
        assert_eq!(o, Orientation::new(Rotation::R90, false));
    }

    #[test]
    fn parses_ffprobe_display_matrix() {
        let text = "\n00000000:            0       65536           0\n00000001:       -65536           0           0\n00000002:            0           0  1073741824\n";
        let m = RawMatrix::from_ffprobe_display_matrix(text).unwrap();
        assert_eq!((m.a, m.b, m.c, m.d), (0.0, 1.0, -1.0, 0.0));
        assert_eq!(
            Orientation::from_matrix(m),
            Orientation::new(Rotation::R90, false)
        );
        assert!(RawMatrix::from_ffprobe_display_matrix("nonsense").is_none());
    }
}
