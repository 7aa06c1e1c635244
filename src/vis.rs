//! The visibility buffer exchanged with the gridder.

use ndarray::{Array1, Array3};
use num_complex::Complex32;

use crate::error::GridError;
use crate::wplane::WStatistics;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// A block of visibility rows. Cubes are shaped `(row, channel, polarisation)`.
#[derive(Clone, Debug, PartialEq)]
pub struct VisBuffer {
    /// Baseline coordinates (metres) of each row.
    pub uvw: Vec<[f64; 3]>,
    /// Channel frequencies (Hz).
    pub frequencies: Array1<f64>,
    pub data: Array3<Complex32>,
    /// Predictions written by degridding.
    pub model: Array3<Complex32>,
    pub weights: Array3<f32>,
    pub flags: Array3<bool>,
    pub antenna1: Vec<usize>,
    pub antenna2: Vec<usize>,
    pub spw: usize,
}

impl VisBuffer {
    /// A zeroed, unflagged, unit-weight buffer.
    pub fn new(uvw: Vec<[f64; 3]>, frequencies: Array1<f64>, n_pol: usize) -> Self {
        let shape = (uvw.len(), frequencies.len(), n_pol);
        VisBuffer {
            data: Array3::zeros(shape),
            model: Array3::zeros(shape),
            weights: Array3::ones(shape),
            flags: Array3::from_elem(shape, false),
            antenna1: vec![0; uvw.len()],
            antenna2: vec![0; uvw.len()],
            spw: 0,
            uvw,
            frequencies,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.uvw.len()
    }

    pub fn n_chan(&self) -> usize {
        self.frequencies.len()
    }

    pub fn n_pol(&self) -> usize {
        self.data.dim().2
    }

    pub fn validate(&self) -> Result<(), GridError> {
        let expected = vec![self.n_rows(), self.n_chan(), self.n_pol()];
        let cubes = [
            ("data", self.data.shape()),
            ("model", self.model.shape()),
            ("weights", self.weights.shape()),
            ("flags", self.flags.shape()),
        ];
        for (what, shape) in cubes {
            if shape != expected.as_slice() {
                return Err(GridError::BufferShape {
                    what,
                    got: shape.to_vec(),
                    expected,
                });
            }
        }
        for (what, len) in [("antenna1", self.antenna1.len()), ("antenna2", self.antenna2.len())] {
            if len != self.n_rows() {
                return Err(GridError::BufferShape {
                    what,
                    got: vec![len],
                    expected: vec![self.n_rows()],
                });
            }
        }
        Ok(())
    }

    /// (u, v, w) of a row in wavelengths at a channel's frequency.
    #[inline]
    pub fn uvw_lambda(&self, row: usize, chan: usize) -> [f64; 3] {
        let scale = self.frequencies[chan] / SPEED_OF_LIGHT;
        let [u, v, w] = self.uvw[row];
        [u * scale, v * scale, w * scale]
    }

    /// |w| statistics in wavelengths over every row and channel.
    pub fn w_statistics(&self) -> WStatistics {
        let mut min_w = f64::INFINITY;
        let mut max_w = 0.0f64;
        let mut sum_sq = 0.0;
        let mut n = 0usize;
        for row in 0..self.n_rows() {
            for chan in 0..self.n_chan() {
                let w = self.uvw_lambda(row, chan)[2].abs();
                min_w = min_w.min(w);
                max_w = max_w.max(w);
                sum_sq += w * w;
                n += 1;
            }
        }
        if n == 0 {
            return WStatistics::default();
        }
        WStatistics {
            min_w,
            max_w,
            rms_w: (sum_sq / n as f64).sqrt(),
        }
    }
}
