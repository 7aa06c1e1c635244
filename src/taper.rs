//! Prolate spheroidal weighting, used both to taper the aperture phase screens
//! and to correct the dirty image for the gridding kernel.

use ndarray::Array1;

/// Rational approximation to the zero-order prolate spheroidal function
/// (support parameter 6), multiplied by `1 - nu^2`. Zero outside `[0, 1]`.
pub fn spheroidal(nu: f64) -> f64 {
    #[rustfmt::skip]
    let p: [[f64; 5]; 2] = [
        [8.203343e-2, -3.644705e-1, 6.278660e-1, -5.335581e-1, 2.312756e-1],
        [4.028559e-3, -3.697768e-2, 1.021332e-1, -1.201436e-1, 6.412774e-2],
    ];
    #[rustfmt::skip]
    let q: [[f64; 3]; 2] = [
        [1.0000000e0, 8.212018e-1, 2.078043e-1],
        [1.0000000e0, 9.599102e-1, 2.918724e-1],
    ];

    let nu = nu.abs();
    let (part, end) = if nu < 0.75 {
        (0, 0.75)
    } else if nu <= 1.0 {
        (1, 1.0)
    } else {
        return 0.0;
    };

    let nu_squared = nu * nu;
    let delta = nu_squared - end * end;

    let mut delta_pow = delta;
    let mut top = p[part][0];
    for p in p[part].iter().skip(1) {
        top += p * delta_pow;
        delta_pow *= delta;
    }

    delta_pow = delta;
    let mut btm = q[part][0];
    for q in q[part].iter().skip(1) {
        btm += q * delta_pow;
        delta_pow *= delta;
    }

    if btm == 0.0 {
        0.0
    } else {
        (1.0 - nu_squared) * (top / btm)
    }
}

/// 1D aperture weights for a screen of `inner` pixels, indexed from `-inner / 2`.
pub fn spheroidal_taper(inner: usize) -> Vec<f64> {
    let half = (inner / 2).max(1) as f64;
    (0..inner)
        .map(|i| spheroidal((i as f64 - half) / half))
        .collect()
}

/// Image-plane correction for an axis of `n_image` pixels cut from a grid
/// padded by `padding`. Normalised to 1 at the image centre.
pub fn grid_correction(n_image: usize, padding: f32) -> Array1<f64> {
    let centre = (n_image / 2) as f64;
    let half_width = (padding as f64 * n_image as f64 / 2.0).max(1.0);
    let peak = spheroidal(0.0);
    Array1::from_shape_fn(n_image, |i| spheroidal((i as f64 - centre) / half_width) / peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn peak_and_edges() {
        assert_abs_diff_eq!(spheroidal(0.0), 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(spheroidal(1.0), 0.0, epsilon = 1e-12);
        assert_eq!(spheroidal(1.5), 0.0);
        assert_eq!(spheroidal(-0.3), spheroidal(0.3));
    }

    #[test]
    fn decreasing_and_continuous() {
        let values: Vec<f64> = (0..=100).map(|i| spheroidal(i as f64 / 100.0)).collect();
        for pair in values.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert_abs_diff_eq!(spheroidal(0.749_999), spheroidal(0.75), epsilon = 1e-3);
    }

    #[test]
    fn taper_is_symmetric_about_centre() {
        let taper = spheroidal_taper(16);
        assert_eq!(taper.len(), 16);
        assert_eq!(taper[0], 0.0);
        assert_abs_diff_eq!(taper[8], spheroidal(0.0));
        for k in 1..8 {
            assert_abs_diff_eq!(taper[8 - k], taper[8 + k], epsilon = 1e-12);
        }
    }

    #[test]
    fn correction_stays_positive_inside_padded_field() {
        let correction = grid_correction(64, 1.2);
        assert_abs_diff_eq!(correction[32], 1.0, epsilon = 1e-12);
        assert!(correction.iter().all(|&c| c > 0.0 && c <= 1.0));
    }
}
