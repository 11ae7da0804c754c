pub(crate) fn mul_div255_u16(x: u16, y: u16) -> u16 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u16
}

/// Straight-alpha source-over: `c = src*a + dst*(1-a)`, `a = a_src + a_dst*(1-a_src)`.
///
/// Matches `wgpu::BlendState::ALPHA_BLENDING` so the CPU and GPU compositors agree.
pub(crate) fn blend_straight_over(dst: [u8; 4], src: [u8; 4]) -> [u8; 4] {
    let sa = u16::from(src[3]);
    if sa == 0 {
        return dst;
    }
    if sa == 255 {
        return src;
    }
    let inv = 255 - sa;
    let mut out = [0u8; 4];
    for i in 0..3 {
        let c = mul_div255_u16(u16::from(src[i]), sa) + mul_div255_u16(u16::from(dst[i]), inv);
        out[i] = c.min(255) as u8;
    }
    out[3] = (sa + mul_div255_u16(u16::from(dst[3]), inv)).min(255) as u8;
    out
}

/// Bilinear sample of a straight RGBA8 image at continuous coordinates where pixel `i` has its
/// center at `i + 0.5`. Coordinates are clamped to the edge texels.
pub(crate) fn sample_bilinear_rgba8(data: &[u8], width: u32, height: u32, x: f64, y: f64) -> [u8; 4] {
    let max_x = f64::from(width.saturating_sub(1));
    let max_y = f64::from(height.saturating_sub(1));
    let fx = (x - 0.5).clamp(0.0, max_x);
    let fy = (y - 0.5).clamp(0.0, max_y);

    let x0 = fx.floor() as u32;
    let y0 = fy.floor() as u32;
    let x1 = (x0 + 1).min(width.saturating_sub(1));
    let y1 = (y0 + 1).min(height.saturating_sub(1));
    let tx = fx - f64::from(x0);
    let ty = fy - f64::from(y0);

    let px = |xx: u32, yy: u32| -> [f64; 4] {
        let o = ((yy as usize) * (width as usize) + xx as usize) * 4;
        [
            f64::from(data[o]),
            f64::from(data[o + 1]),
            f64::from(data[o + 2]),
            f64::from(data[o + 3]),
        ]
    };

    let p00 = px(x0, y0);
    let p10 = px(x1, y0);
    let p01 = px(x0, y1);
    let p11 = px(x1, y1);

    let mut out = [0u8; 4];
    for i in 0..4 {
        let top = p00[i] + (p10[i] - p00[i]) * tx;
        let bottom = p01[i] + (p11[i] - p01[i]) * tx;
        out[i] = (top + (bottom - top) * ty).round().clamp(0.0, 255.0) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div255_rounds_to_nearest() {
        assert_eq!(mul_div255_u16(255, 255), 255);
        assert_eq!(mul_div255_u16(128, 255), 128);
        assert_eq!(mul_div255_u16(255, 128), 128);
        assert_eq!(mul_div255_u16(0, 200), 0);
    }

    #[test]
    fn straight_over_opaque_and_transparent_sources() {
        let dst = [10, 20, 30, 255];
        assert_eq!(blend_straight_over(dst, [200, 100, 50, 255]), [200, 100, 50, 255]);
        assert_eq!(blend_straight_over(dst, [200, 100, 50, 0]), dst);
    }

    #[test]
    fn straight_over_half_alpha_mixes_evenly() {
        let out = blend_straight_over([0, 0, 0, 255], [255, 255, 255, 128]);
        assert_eq!(out, [128, 128, 128, 255]);
    }

    #[test]
    fn bilinear_at_texel_centers_is_exact() {
        #[rustfmt::skip]
        let data = vec![
            1, 2, 3, 255,    4, 5, 6, 255,
            7, 8, 9, 255,    10, 11, 12, 255,
        ];
        assert_eq!(sample_bilinear_rgba8(&data, 2, 2, 0.5, 0.5), [1, 2, 3, 255]);
        assert_eq!(sample_bilinear_rgba8(&data, 2, 2, 1.5, 1.5), [10, 11, 12, 255]);
        assert_eq!(sample_bilinear_rgba8(&data, 2, 2, 1.0, 0.5), [3, 4, 5, 255]);
    }
}
