//! Image and grid geometry, and the key used to decide when two images can
//! share a convolution-function family.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::find_fast_number::composite_even_len;

/// Pixel counts and angular increments (radians) of the two spatial axes of
/// an image.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub nx: usize,
    pub ny: usize,
    pub increment: [f64; 2],
}

impl ImageGeometry {
    pub fn new(nx: usize, ny: usize, increment: [f64; 2]) -> Self {
        ImageGeometry { nx, ny, increment }
    }

    /// Square image with the same increment on both axes.
    pub fn square(n: usize, increment: f64) -> Self {
        Self::new(n, n, [increment, increment])
    }

    pub fn key(&self, significant_digits: u32) -> GeometryKey {
        GeometryKey {
            nx: self.nx,
            ny: self.ny,
            incr_x: QuantizedIncrement::new(self.increment[0], significant_digits),
            incr_y: QuantizedIncrement::new(self.increment[1], significant_digits),
        }
    }
}

/// An absolute increment rounded to a fixed number of significant digits,
/// held as `mantissa * 10^exponent` so it can be hashed exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuantizedIncrement {
    mantissa: i64,
    exponent: i32,
}

impl QuantizedIncrement {
    pub fn new(value: f64, significant_digits: u32) -> Self {
        let value = value.abs();
        if value == 0.0 || !value.is_finite() {
            return QuantizedIncrement {
                mantissa: 0,
                exponent: 0,
            };
        }
        let digits = significant_digits.clamp(1, 15);

        let mut exponent = value.log10().floor() as i32 - (digits as i32 - 1);
        let mut mantissa = (value / 10f64.powi(exponent)).round() as i64;
        // log10 can land one decade low, and rounding can carry into a new digit
        while mantissa >= 10i64.pow(digits) {
            mantissa = (mantissa + 5) / 10;
            exponent += 1;
        }
        while mantissa % 10 == 0 {
            mantissa /= 10;
            exponent += 1;
        }

        QuantizedIncrement { mantissa, exponent }
    }

    pub fn value(&self) -> f64 {
        self.mantissa as f64 * 10f64.powi(self.exponent)
    }
}

impl fmt::Display for QuantizedIncrement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exponent == 0 {
            write!(f, "{}", self.mantissa)
        } else {
            write!(f, "{}e{}", self.mantissa, self.exponent)
        }
    }
}

/// Fingerprint of an image geometry. Images with the same pixel counts and
/// the same absolute increments (after quantisation) share a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeometryKey {
    pub nx: usize,
    pub ny: usize,
    pub incr_x: QuantizedIncrement,
    pub incr_y: QuantizedIncrement,
}

impl fmt::Display for GeometryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.nx, self.incr_x, self.ny, self.incr_y)
    }
}

/// The padded uv grid an image is made from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridGeometry {
    pub image: ImageGeometry,
    pub padding: f32,
    /// Padded grid size along x.
    pub nx: usize,
    /// Padded grid size along y.
    pub ny: usize,
    /// Grid pixels per wavelength.
    pub uv_scale: [f64; 2],
    /// Grid pixel of the uv origin.
    pub uv_offset: [f64; 2],
}

impl GridGeometry {
    pub fn new(image: ImageGeometry, padding: f32) -> Self {
        let nx = composite_even_len((padding as f64 * image.nx as f64) as usize);
        let ny = composite_even_len((padding as f64 * image.ny as f64) as usize);
        GridGeometry {
            image,
            padding,
            nx,
            ny,
            uv_scale: [nx as f64 * image.increment[0], ny as f64 * image.increment[1]],
            uv_offset: [(nx / 2) as f64, (ny / 2) as f64],
        }
    }

    /// Fractional grid position of a uv coordinate given in wavelengths.
    #[inline]
    pub fn position(&self, u: f64, v: f64) -> [f64; 2] {
        [
            self.uv_scale[0] * u + self.uv_offset[0],
            self.uv_scale[1] * v + self.uv_offset[1],
        ]
    }
}
