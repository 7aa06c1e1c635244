//! W-projection gridding and degridding.
//!
//! A sample at `(u, v, w)` lands on the grid pixel nearest to
//! `uv_scale * (u, v) + uv_offset`, and is spread over `2 * support + 1`
//! pixels along each axis with the kernel of its w-plane. The kernel is
//! sampled at `conv_sampling` times the grid resolution; the fractional pixel
//! offset selects which of those samples are used. Kernels only hold one
//! quadrant, so offsets are reflected by absolute value, and samples with
//! `w > 0` grid with the conjugate kernel.

use std::cmp::min;
use std::ops::Range;

use log::debug;
use ndarray::parallel::prelude::*;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Axis, Zip};
use num_complex::Complex32;
use num_integer::Integer;
use rustfft::num_traits::Zero;

use crate::error::GridError;
use crate::fft2::Fft2d;
use crate::geometry::GridGeometry;
use crate::taper::grid_correction;
use crate::vis::VisBuffer;
use crate::wplane::KernelSet;

/// Where data channels and polarisations go on the grid. `None` leaves a
/// channel or polarisation out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelPolMap {
    pub chan: Vec<Option<usize>>,
    pub pol: Vec<Option<usize>>,
}

impl ChannelPolMap {
    pub fn identity(n_chan: usize, n_pol: usize) -> Self {
        ChannelPolMap {
            chan: (0..n_chan).map(Some).collect(),
            pol: (0..n_pol).map(Some).collect(),
        }
    }

    /// All channels onto a single grid channel.
    pub fn multi_frequency(n_chan: usize, n_pol: usize) -> Self {
        ChannelPolMap {
            chan: vec![Some(0); n_chan],
            pol: (0..n_pol).map(Some).collect(),
        }
    }

    fn check(&self, vis: &VisBuffer, grid_chan: usize, grid_pol: usize) -> Result<(), GridError> {
        for (what, map, n_data, n_grid) in [
            ("channel", &self.chan, vis.n_chan(), grid_chan),
            ("polarisation", &self.pol, vis.n_pol(), grid_pol),
        ] {
            if map.len() != n_data {
                return Err(GridError::MapLength {
                    what,
                    got: map.len(),
                    expected: n_data,
                });
            }
            if let Some(&index) = map.iter().flatten().find(|&&i| i >= n_grid) {
                return Err(GridError::MapTarget {
                    what,
                    index,
                    len: n_grid,
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GridStats {
    /// Visibility values gridded or predicted.
    pub used: usize,
    /// Values whose kernel footprint fell off the grid.
    pub off_grid: usize,
    pub flagged: usize,
}

impl GridStats {
    fn merge(self, other: GridStats) -> GridStats {
        GridStats {
            used: self.used + other.used,
            off_grid: self.off_grid + other.off_grid,
            flagged: self.flagged + other.flagged,
        }
    }
}

/// Grid position and kernel selection for one (row, channel) sample.
struct Footprint {
    plane: usize,
    support: isize,
    /// Nearest grid pixel, (x, y).
    loc: [isize; 2],
    /// Kernel sample offset, (x, y).
    off: [isize; 2],
    conjugate: bool,
}

struct Placement<'a> {
    geometry: &'a GridGeometry,
    kernels: &'a KernelSet,
    map: &'a ChannelPolMap,
}

impl Placement<'_> {
    /// `None` if the footprint does not fit on the grid.
    #[inline]
    fn footprint(&self, uvw: [f64; 3], conjugate_positive_w: bool) -> Option<Footprint> {
        let family = &self.kernels.family;
        let samp = family.conv_sampling as f64;
        let plane = self.kernels.w_scale.plane_for(uvw[2]);
        let support = family.support[plane];

        // rejected in f64, before any integer cast
        let pos = self.geometry.position(uvw[0], uvw[1]);
        let nearest = [pos[0].round(), pos[1].round()];
        let reach = support as f64;
        let fits = |p: f64, n: usize| p.is_finite() && p - reach >= 0.0 && p + reach < n as f64;
        if !fits(nearest[0], self.geometry.nx) || !fits(nearest[1], self.geometry.ny) {
            return None;
        }
        let loc = [nearest[0] as isize, nearest[1] as isize];
        let support = support as isize;

        let off = [
            ((loc[0] as f64 - pos[0]) * samp).round() as isize,
            ((loc[1] as f64 - pos[1]) * samp).round() as isize,
        ];
        let conjugate = if conjugate_positive_w {
            uvw[2] > 0.0
        } else {
            uvw[2] < 0.0
        };
        Some(Footprint {
            plane,
            support,
            loc,
            off,
            conjugate,
        })
    }

    /// Kernel weights over the footprint, shaped `(2 * support + 1)^2`, `y` major.
    fn weights(&self, fp: &Footprint) -> (Vec<Complex32>, f64) {
        let family = &self.kernels.family;
        let samp = family.conv_sampling as isize;
        let width = (2 * fp.support + 1) as usize;
        let mut taps = Vec::with_capacity(width * width);
        let mut norm = 0.0f64;
        for iy in -fp.support..=fp.support {
            let ky = iy * samp + fp.off[1];
            for ix in -fp.support..=fp.support {
                let kx = ix * samp + fp.off[0];
                let mut cwt = family.tap(fp.plane, ky, kx);
                if fp.conjugate {
                    cwt = cwt.conj();
                }
                norm += cwt.re as f64;
                taps.push(cwt);
            }
        }
        (taps, norm)
    }

    /// Grid `rows` into views holding the grid channels `band`. Data channels
    /// mapped outside `band` are left to whoever holds them.
    fn grid_rows(
        &self,
        vis: &VisBuffer,
        rows: Range<usize>,
        band: Range<usize>,
        mut grid: ArrayViewMut4<Complex32>,
        mut sum_weights: ArrayViewMut2<f64>,
    ) -> GridStats {
        let mut stats = GridStats::default();
        for row in rows {
            for (chan, grid_chan) in self.map.chan.iter().enumerate() {
                let grid_chan = match grid_chan {
                    Some(c) if band.contains(c) => *c - band.start,
                    _ => continue,
                };
                let fp = match self.footprint(vis.uvw_lambda(row, chan), true) {
                    Some(fp) => fp,
                    None => {
                        stats.off_grid += vis.n_pol();
                        continue;
                    }
                };
                let (taps, norm) = self.weights(&fp);
                let width = (2 * fp.support + 1) as usize;
                let y0 = (fp.loc[1] - fp.support) as usize;
                let x0 = (fp.loc[0] - fp.support) as usize;

                for (pol, grid_pol) in self.map.pol.iter().enumerate() {
                    let grid_pol = match grid_pol {
                        Some(p) => *p,
                        None => continue,
                    };
                    if vis.flags[[row, chan, pol]] {
                        stats.flagged += 1;
                        continue;
                    }
                    let weight = vis.weights[[row, chan, pol]];
                    let value = vis.data[[row, chan, pol]] * weight;

                    let mut patch = grid.slice_mut(s![
                        grid_chan,
                        grid_pol,
                        y0..y0 + width,
                        x0..x0 + width
                    ]);
                    for (patch_row, tap_row) in patch.outer_iter_mut().zip(taps.chunks_exact(width)) {
                        for (g, cwt) in patch_row.into_iter().zip(tap_row) {
                            *g += value * cwt;
                        }
                    }
                    sum_weights[[grid_chan, grid_pol]] += weight as f64 * norm;
                    stats.used += 1;
                }
            }
        }
        stats
    }

    fn degrid_rows(
        &self,
        uvw: &[[f64; 3]],
        frequencies: &Array1<f64>,
        flags: &Array3<bool>,
        model: &ArrayView4<Complex32>,
        predicted: &mut Array3<Complex32>,
    ) -> GridStats {
        predicted
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(flags.axis_iter(Axis(0)).into_par_iter())
            .enumerate()
            .map(|(row, (out, row_flags))| {
                self.degrid_row(uvw[row], frequencies, row_flags, model, out)
            })
            .reduce(GridStats::default, GridStats::merge)
    }

    /// Predict the model values of one row from `model`.
    fn degrid_row(
        &self,
        vis_uvw: [f64; 3],
        frequencies: &Array1<f64>,
        flags: ArrayView2<bool>,
        model: &ArrayView4<Complex32>,
        mut out: ArrayViewMut2<Complex32>,
    ) -> GridStats {
        let mut stats = GridStats::default();
        for (chan, grid_chan) in self.map.chan.iter().enumerate() {
            let grid_chan = match grid_chan {
                Some(c) => *c,
                None => continue,
            };
            let scale = frequencies[chan] / crate::vis::SPEED_OF_LIGHT;
            let uvw = [vis_uvw[0] * scale, vis_uvw[1] * scale, vis_uvw[2] * scale];
            let fp = match self.footprint(uvw, false) {
                Some(fp) => fp,
                None => {
                    stats.off_grid += out.dim().1;
                    continue;
                }
            };
            let (taps, norm) = self.weights(&fp);
            let width = (2 * fp.support + 1) as usize;
            let y0 = (fp.loc[1] - fp.support) as usize;
            let x0 = (fp.loc[0] - fp.support) as usize;

            for (pol, grid_pol) in self.map.pol.iter().enumerate() {
                let grid_pol = match grid_pol {
                    Some(p) => *p,
                    None => continue,
                };
                if flags[[chan, pol]] {
                    stats.flagged += 1;
                    continue;
                }
                let patch = model.slice(s![grid_chan, grid_pol, y0..y0 + width, x0..x0 + width]);
                let sum = patch
                    .iter()
                    .zip(taps.iter())
                    .fold(Complex32::zero(), |acc, (m, cwt)| acc + m * cwt);
                out[[chan, pol]] = if norm != 0.0 {
                    sum / norm as f32
                } else {
                    Complex32::zero()
                };
                stats.used += 1;
            }
        }
        stats
    }
}

/// Accumulates visibilities onto a padded `(channel, polarisation, y, x)` grid.
pub struct WProjectGridder {
    geometry: GridGeometry,
    kernels: KernelSet,
    map: Option<ChannelPolMap>,
    grid: Array4<Complex32>,
    sum_weights: Array2<f64>,
    pool: Option<rayon::ThreadPool>,
    threads: usize,
}

impl WProjectGridder {
    pub fn new(
        geometry: GridGeometry,
        kernels: KernelSet,
        n_chan: usize,
        n_pol: usize,
        threads: usize,
    ) -> Result<Self, GridError> {
        let threads = threads.max(1);
        let pool = if threads > 1 {
            Some(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?)
        } else {
            None
        };
        debug!(
            "Gridder on {} x {} pixels, {} channel(s), {} polarisation(s), {} thread(s)",
            geometry.nx, geometry.ny, n_chan, n_pol, threads
        );
        Ok(WProjectGridder {
            grid: Array4::zeros((n_chan, n_pol, geometry.ny, geometry.nx)),
            sum_weights: Array2::zeros((n_chan, n_pol)),
            geometry,
            kernels,
            map: None,
            pool,
            threads,
        })
    }

    /// Use `map` instead of the identity map.
    pub fn with_map(mut self, map: ChannelPolMap) -> Self {
        self.map = Some(map);
        self
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn kernels(&self) -> &KernelSet {
        &self.kernels
    }

    pub fn uv_grid(&self) -> &Array4<Complex32> {
        &self.grid
    }

    pub fn sum_weights(&self) -> &Array2<f64> {
        &self.sum_weights
    }

    pub fn reset(&mut self) {
        self.grid.fill(Complex32::zero());
        self.sum_weights.fill(0.0);
    }

    fn map_for(&self, vis: &VisBuffer) -> Result<ChannelPolMap, GridError> {
        let map = match &self.map {
            Some(map) => map.clone(),
            None => ChannelPolMap::identity(vis.n_chan(), vis.n_pol()),
        };
        let (n_chan, n_pol, _, _) = self.grid.dim();
        map.check(vis, n_chan, n_pol)?;
        Ok(map)
    }

    /// Add every unflagged sample of `vis` to the grid.
    ///
    /// With several threads and several grid channels, each thread owns a
    /// band of grid channels and reads every row. With a single grid channel,
    /// each thread takes a contiguous run of rows into a grid of its own, and
    /// the partial grids are summed in row order. Either way the result does
    /// not depend on scheduling.
    pub fn grid(&mut self, vis: &VisBuffer) -> Result<GridStats, GridError> {
        vis.validate()?;
        let map = self.map_for(vis)?;
        let placement = Placement {
            geometry: &self.geometry,
            kernels: &self.kernels,
            map: &map,
        };
        let n_rows = vis.n_rows();
        let n_grid_chan = self.grid.len_of(Axis(0));

        let stats = match &self.pool {
            Some(pool) if n_grid_chan > 1 => {
                let band_len = Integer::div_ceil(&n_grid_chan, &min(self.threads, n_grid_chan));
                let grids: Vec<_> = self.grid.axis_chunks_iter_mut(Axis(0), band_len).collect();
                let weights: Vec<_> = self
                    .sum_weights
                    .axis_chunks_iter_mut(Axis(0), band_len)
                    .collect();
                pool.install(|| {
                    grids
                        .into_par_iter()
                        .zip(weights)
                        .enumerate()
                        .map(|(b, (grid, sum_weights))| {
                            let start = b * band_len;
                            let band = start..start + grid.len_of(Axis(0));
                            placement.grid_rows(vis, 0..n_rows, band, grid, sum_weights)
                        })
                        .reduce(GridStats::default, GridStats::merge)
                })
            }
            Some(pool) if n_rows > 1 => {
                let parts = min(self.threads, n_rows);
                let rows_per_part = Integer::div_ceil(&n_rows, &parts);
                let grid_dim = self.grid.raw_dim();
                let weights_dim = self.sum_weights.raw_dim();
                let partials: Vec<(Array4<Complex32>, Array2<f64>, GridStats)> = pool.install(|| {
                    (0..parts)
                        .into_par_iter()
                        .map(|t| {
                            let rows = t * rows_per_part..min((t + 1) * rows_per_part, n_rows);
                            let mut grid = Array4::zeros(grid_dim.clone());
                            let mut sum_weights = Array2::zeros(weights_dim.clone());
                            let stats = placement.grid_rows(
                                vis,
                                rows,
                                0..n_grid_chan,
                                grid.view_mut(),
                                sum_weights.view_mut(),
                            );
                            (grid, sum_weights, stats)
                        })
                        .collect()
                });

                let mut stats = GridStats::default();
                for (grid, sum_weights, partial) in partials {
                    self.grid += &grid;
                    self.sum_weights += &sum_weights;
                    stats = stats.merge(partial);
                }
                stats
            }
            _ => placement.grid_rows(
                vis,
                0..n_rows,
                0..n_grid_chan,
                self.grid.view_mut(),
                self.sum_weights.view_mut(),
            ),
        };

        debug!(
            "Gridded {} values ({} off grid, {} flagged)",
            stats.used, stats.off_grid, stats.flagged
        );
        Ok(stats)
    }

    /// Predict `vis.model` from a model grid shaped like this gridder's grid.
    pub fn degrid(
        &self,
        model: ArrayView4<Complex32>,
        vis: &mut VisBuffer,
    ) -> Result<GridStats, GridError> {
        if model.dim() != self.grid.dim() {
            return Err(GridError::ModelShape {
                got: model.shape().to_vec(),
                expected: self.grid.shape().to_vec(),
            });
        }
        vis.validate()?;
        let map = self.map_for(vis)?;
        let placement = Placement {
            geometry: &self.geometry,
            kernels: &self.kernels,
            map: &map,
        };

        let VisBuffer {
            uvw,
            frequencies,
            flags,
            model: predicted,
            ..
        } = vis;
        let stats = match &self.pool {
            Some(pool) => pool.install(|| {
                placement.degrid_rows(uvw, frequencies, flags, &model, predicted)
            }),
            None => placement.degrid_rows(uvw, frequencies, flags, &model, predicted),
        };

        debug!(
            "Degridded {} values ({} off grid, {} flagged)",
            stats.used, stats.off_grid, stats.flagged
        );
        Ok(stats)
    }

    /// Hand over the accumulated grid and weights.
    pub fn finish(self) -> GriddedPlane {
        GriddedPlane {
            geometry: self.geometry,
            grid: self.grid,
            sum_weights: self.sum_weights,
        }
    }
}

/// A finished uv grid.
#[derive(Clone, Debug)]
pub struct GriddedPlane {
    pub geometry: GridGeometry,
    pub grid: Array4<Complex32>,
    pub sum_weights: Array2<f64>,
}

impl GriddedPlane {
    /// The dirty image, shaped `(channel, polarisation, ny, nx)`: inverse
    /// transform, crop the padding, undo the kernel taper, and divide by the
    /// summed weights. Planes with no weight stay zero.
    pub fn to_image(mut self, fft: &mut Fft2d) -> Result<Array4<f32>, GridError> {
        fft.c2c(self.grid.view_mut(), false)?;

        let image = self.geometry.image;
        let (n_chan, n_pol, _, _) = self.grid.dim();
        let x0 = self.geometry.nx / 2 - image.nx / 2;
        let y0 = self.geometry.ny / 2 - image.ny / 2;
        let corr_x = grid_correction(image.nx, self.geometry.padding);
        let corr_y = grid_correction(image.ny, self.geometry.padding);
        let cells = (self.geometry.nx * self.geometry.ny) as f64;

        let mut out = Array4::zeros((n_chan, n_pol, image.ny, image.nx));
        Zip::indexed(&mut out).par_for_each(|(c, p, y, x), pixel| {
            let sum_weight = self.sum_weights[[c, p]];
            let correction = corr_y[y] * corr_x[x];
            if sum_weight > 0.0 && correction > 0.0 {
                let value = self.grid[[c, p, y0 + y, x0 + x]].re as f64;
                *pixel = (value * cells / (sum_weight * correction)) as f32;
            }
        });
        Ok(out)
    }
}

/// Turn a model image `(channel, polarisation, ny, nx)` into a grid for
/// [`WProjectGridder::degrid`]: undo the kernel taper, pad, and transform.
pub fn model_grid(
    image: ArrayView4<f32>,
    geometry: &GridGeometry,
    fft: &mut Fft2d,
) -> Result<Array4<Complex32>, GridError> {
    let (n_chan, n_pol, ny, nx) = image.dim();
    if (ny, nx) != (geometry.image.ny, geometry.image.nx) {
        return Err(GridError::ModelShape {
            got: image.shape().to_vec(),
            expected: vec![n_chan, n_pol, geometry.image.ny, geometry.image.nx],
        });
    }
    let corr_x = grid_correction(nx, geometry.padding);
    let corr_y = grid_correction(ny, geometry.padding);
    let x0 = geometry.nx / 2 - nx / 2;
    let y0 = geometry.ny / 2 - ny / 2;

    let mut grid = Array4::zeros((n_chan, n_pol, geometry.ny, geometry.nx));
    Zip::indexed(grid.slice_mut(s![.., .., y0..y0 + ny, x0..x0 + nx])).par_for_each(
        |(c, p, y, x), g: &mut Complex32| {
            let correction = corr_y[y] * corr_x[x];
            if correction > 0.0 {
                *g = Complex32::new((image[[c, p, y, x]] as f64 / correction) as f32, 0.0);
            }
        },
    );
    fft.c2c(grid.view_mut(), true)?;
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridderConfig;
    use crate::geometry::ImageGeometry;
    use crate::vis::SPEED_OF_LIGHT;
    use crate::wplane::{WProjectConvFunc, WStatistics};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn setup() -> (GridGeometry, KernelSet) {
        let image = ImageGeometry::square(64, 1e-3);
        let config = GridderConfig {
            w_planes: Some(3),
            padding: 1.0,
            ..Default::default()
        };
        let mut fft = Fft2d::new(1).unwrap();
        let kernels = WProjectConvFunc::new(WStatistics::default(), &config)
            .find_conv_function(&image, &mut fft)
            .unwrap();
        (GridGeometry::new(image, 1.0), kernels)
    }

    /// Rows in wavelengths, thanks to a frequency of c.
    fn vis_for(uvw: Vec<[f64; 3]>, n_pol: usize) -> VisBuffer {
        VisBuffer::new(uvw, array![SPEED_OF_LIGHT], n_pol)
    }

    fn scattered_uvw(n: usize) -> Vec<[f64; 3]> {
        let mut state = 12345u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0
        };
        (0..n)
            .map(|_| [300.0 * next(), 300.0 * next(), 240.0 * next()])
            .collect()
    }

    #[test]
    fn single_sample_at_origin() {
        let (geometry, kernels) = setup();
        let family = kernels.family.clone();
        let mut vis = vis_for(vec![[0.0, 0.0, 0.0]], 1);
        vis.data[[0, 0, 0]] = Complex32::new(2.0, 0.0);

        let mut gridder = WProjectGridder::new(geometry, kernels, 1, 1, 1).unwrap();
        let stats = gridder.grid(&vis).unwrap();
        assert_eq!(stats, GridStats { used: 1, off_grid: 0, flagged: 0 });

        let grid = gridder.uv_grid();
        let centre = grid[[0, 0, 32, 32]];
        assert_abs_diff_eq!(centre.re, 2.0 * family.kernels[[0, 0, 0]].re, epsilon = 1e-6);

        let support = family.support[0] as isize;
        for ((_, _, y, x), v) in grid.indexed_iter() {
            let (dy, dx) = (y as isize - 32, x as isize - 32);
            if dy.abs() > support || dx.abs() > support {
                assert_eq!(*v, Complex32::zero(), "({}, {})", y, x);
            }
        }
        assert_abs_diff_eq!(gridder.sum_weights()[[0, 0]], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn threaded_gridding_matches_serial() {
        let (geometry, kernels) = setup();
        let mut vis = vis_for(scattered_uvw(200), 2);
        for ((row, _, pol), v) in vis.data.indexed_iter_mut() {
            *v = Complex32::new(1.0 + row as f32 * 0.01, pol as f32 - 0.5);
        }

        let mut serial = WProjectGridder::new(geometry, kernels.clone(), 1, 2, 1).unwrap();
        let mut threaded = WProjectGridder::new(geometry, kernels, 1, 2, 3).unwrap();
        let serial_stats = serial.grid(&vis).unwrap();
        let threaded_stats = threaded.grid(&vis).unwrap();

        assert_eq!(serial_stats, threaded_stats);
        assert_eq!(serial_stats.used, 400);
        for (a, b) in serial.uv_grid().iter().zip(threaded.uv_grid().iter()) {
            assert!((a - b).norm() < 1e-4, "{} vs {}", a, b);
        }
        for (a, b) in serial.sum_weights().iter().zip(threaded.sum_weights().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn off_grid_and_flagged_samples_are_skipped() {
        let (geometry, kernels) = setup();
        let mut vis = vis_for(vec![[5000.0, 0.0, 0.0], [10.0, -20.0, 0.0]], 2);
        vis.data.fill(Complex32::new(1.0, 0.0));
        vis.flags[[1, 0, 1]] = true;

        let mut gridder = WProjectGridder::new(geometry, kernels, 1, 2, 1).unwrap();
        let stats = gridder.grid(&vis).unwrap();
        assert_eq!(stats, GridStats { used: 1, off_grid: 2, flagged: 1 });
        assert!(gridder
            .uv_grid()
            .index_axis(Axis(1), 1)
            .iter()
            .all(|v| *v == Complex32::zero()));
    }

    #[test]
    fn channel_map_selects_grid_planes() {
        let (geometry, kernels) = setup();
        let mut vis = VisBuffer::new(
            vec![[0.0, 0.0, 0.0]],
            array![SPEED_OF_LIGHT, SPEED_OF_LIGHT, SPEED_OF_LIGHT],
            1,
        );
        vis.data.fill(Complex32::new(1.0, 0.0));

        let map = ChannelPolMap {
            chan: vec![Some(0), None, Some(0)],
            pol: vec![Some(0)],
        };
        let mut gridder = WProjectGridder::new(geometry, kernels.clone(), 1, 1, 1)
            .unwrap()
            .with_map(map);
        let stats = gridder.grid(&vis).unwrap();
        assert_eq!(stats.used, 2);
        assert_abs_diff_eq!(gridder.sum_weights()[[0, 0]], 2.0, epsilon = 1e-4);

        let too_short = ChannelPolMap::identity(2, 1);
        let mut gridder = WProjectGridder::new(geometry, kernels.clone(), 3, 1, 1)
            .unwrap()
            .with_map(too_short);
        assert!(matches!(
            gridder.grid(&vis),
            Err(GridError::MapLength { what: "channel", got: 2, expected: 3 })
        ));

        let mut gridder = WProjectGridder::new(geometry, kernels, 1, 1, 1)
            .unwrap()
            .with_map(ChannelPolMap::identity(3, 1));
        assert!(matches!(
            gridder.grid(&vis),
            Err(GridError::MapTarget { what: "channel", index: 1, len: 1 })
        ));
    }

    #[test]
    fn point_source_images_to_unit_peak() {
        let (geometry, kernels) = setup();
        let mut vis = vis_for(scattered_uvw(100), 1);
        vis.data.fill(Complex32::new(1.0, 0.0));

        let mut gridder = WProjectGridder::new(geometry, kernels, 1, 1, 2).unwrap();
        gridder.grid(&vis).unwrap();
        let mut fft = Fft2d::new(1).unwrap();
        let image = gridder.finish().to_image(&mut fft).unwrap();

        assert_eq!(image.dim(), (1, 1, 64, 64));
        assert_abs_diff_eq!(image[[0, 0, 32, 32]], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn unweighted_plane_images_to_zero() {
        let (geometry, kernels) = setup();
        let gridder = WProjectGridder::new(geometry, kernels, 1, 1, 1).unwrap();
        let mut fft = Fft2d::new(1).unwrap();
        let image = gridder.finish().to_image(&mut fft).unwrap();
        assert!(image.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn degrid_point_source_model() {
        let (geometry, kernels) = setup();
        let mut model_image = Array4::zeros((1, 2, 64, 64));
        model_image[[0, 0, 32, 32]] = 1.0f32;
        model_image[[0, 1, 32, 32]] = 3.0f32;
        let mut fft = Fft2d::new(1).unwrap();
        let model = model_grid(model_image.view(), &geometry, &mut fft).unwrap();

        let uvw = vec![[0.0, 0.0, 0.0], [123.4, -56.7, 0.0], [-250.0, 199.9, 0.0]];
        let mut vis = vis_for(uvw, 2);
        vis.flags[[2, 0, 1]] = true;

        let gridder = WProjectGridder::new(geometry, kernels, 1, 2, 2).unwrap();
        let stats = gridder.degrid(model.view(), &mut vis).unwrap();
        assert_eq!(stats, GridStats { used: 5, off_grid: 0, flagged: 1 });

        for row in 0..3 {
            assert_abs_diff_eq!(vis.model[[row, 0, 0]].re, 1.0, epsilon = 1e-4);
            assert_abs_diff_eq!(vis.model[[row, 0, 0]].im, 0.0, epsilon = 1e-4);
        }
        assert_abs_diff_eq!(vis.model[[1, 0, 1]].re, 3.0, epsilon = 1e-3);
        // flagged values are left alone
        assert_eq!(vis.model[[2, 0, 1]], Complex32::zero());
    }

    #[test]
    fn degrid_rejects_mismatched_model() {
        let (geometry, kernels) = setup();
        let gridder = WProjectGridder::new(geometry, kernels, 1, 1, 1).unwrap();
        let model: Array4<Complex32> = Array4::zeros((1, 1, 32, 32));
        let mut vis = vis_for(vec![[0.0, 0.0, 0.0]], 1);
        assert!(matches!(
            gridder.degrid(model.view(), &mut vis),
            Err(GridError::ModelShape { .. })
        ));
    }

    /// 250 wavelengths is the top of the w range in `setup`.
    const TOP_W: f64 = 250.0;

    #[test]
    fn positive_w_grids_with_conjugate_kernel() {
        let (geometry, kernels) = setup();
        let family = kernels.family.clone();
        let plane = kernels.w_scale.plane_for(TOP_W);
        let samp = family.conv_sampling as isize;
        assert_eq!(plane, 2);
        // the w term makes the kernel complex
        assert!(family.tap(plane, 0, 0).im < -1e-6);

        let support = family.support[plane] as isize;
        assert!(support >= 1);
        let value = Complex32::new(1.5, 0.5);

        let mut vis = vis_for(vec![[0.0, 0.0, TOP_W]], 1);
        vis.data[[0, 0, 0]] = value;
        let mut positive = WProjectGridder::new(geometry, kernels.clone(), 1, 1, 1).unwrap();
        positive.grid(&vis).unwrap();

        // (y, x) grid offsets, each one oversampled step apart in the kernel
        for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1), (-1, 1)] {
            let expected = value * family.tap(plane, dy * samp, dx * samp).conj();
            let got = positive.uv_grid()[[0, 0, (32 + dy) as usize, (32 + dx) as usize]];
            assert_abs_diff_eq!(got.re, expected.re, epsilon = 1e-6);
            assert_abs_diff_eq!(got.im, expected.im, epsilon = 1e-6);
        }

        // the same value at -w grids with the kernel itself
        vis.uvw[0][2] = -TOP_W;
        let mut negative = WProjectGridder::new(geometry, kernels, 1, 1, 1).unwrap();
        negative.grid(&vis).unwrap();
        for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1), (-1, 1)] {
            let expected = value * family.tap(plane, dy * samp, dx * samp);
            let got = negative.uv_grid()[[0, 0, (32 + dy) as usize, (32 + dx) as usize]];
            assert_abs_diff_eq!(got.re, expected.re, epsilon = 1e-6);
            assert_abs_diff_eq!(got.im, expected.im, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(
            positive.sum_weights()[[0, 0]],
            negative.sum_weights()[[0, 0]],
            epsilon = 1e-9
        );
    }

    #[test]
    fn negative_w_degrids_with_conjugate_kernel() {
        let (geometry, kernels) = setup();
        let tap = kernels.family.tap(2, 0, 0);
        let mut model: Array4<Complex32> = Array4::zeros((1, 1, geometry.ny, geometry.nx));
        model[[0, 0, 32, 32]] = Complex32::new(1.0, 0.0);

        let mut vis = vis_for(vec![[0.0, 0.0, TOP_W], [0.0, 0.0, -TOP_W]], 1);
        let gridder = WProjectGridder::new(geometry, kernels, 1, 1, 1).unwrap();
        gridder.degrid(model.view(), &mut vis).unwrap();

        let positive = vis.model[[0, 0, 0]];
        let negative = vis.model[[1, 0, 0]];
        assert!(positive.im < -1e-6);
        assert_abs_diff_eq!(negative.re, positive.re, epsilon = 1e-7);
        assert_abs_diff_eq!(negative.im, -positive.im, epsilon = 1e-7);
        // a delta model picks out the central tap, scaled by a real norm
        let ratio = positive / tap;
        assert!(ratio.re > 0.0);
        assert_abs_diff_eq!(ratio.im, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn extreme_positions_are_off_grid() {
        let (geometry, kernels) = setup();
        let uvw = vec![
            [1e30, 0.0, 0.0],
            [0.0, -1e30, 0.0],
            [f64::INFINITY, 0.0, 0.0],
            [0.0, f64::NEG_INFINITY, 0.0],
            [f64::NAN, 0.0, 0.0],
            [0.0, 0.0, f64::INFINITY],
        ];
        let mut vis = vis_for(uvw, 1);
        vis.data.fill(Complex32::new(1.0, 0.0));

        let mut gridder = WProjectGridder::new(geometry, kernels.clone(), 1, 1, 1).unwrap();
        let stats = gridder.grid(&vis).unwrap();
        // infinite w only selects the last plane; (0, 0) still fits
        assert_eq!(stats, GridStats { used: 1, off_grid: 5, flagged: 0 });

        let gridder = WProjectGridder::new(geometry, kernels, 1, 1, 1).unwrap();
        let model = Array4::zeros((1, 1, geometry.ny, geometry.nx));
        let stats = gridder.degrid(model.view(), &mut vis).unwrap();
        assert_eq!(stats.off_grid, 5);
    }

    #[test]
    fn channel_bands_match_serial() {
        let (geometry, kernels) = setup();
        let mut vis = VisBuffer::new(
            scattered_uvw(60),
            array![SPEED_OF_LIGHT, 1.1 * SPEED_OF_LIGHT, 1.2 * SPEED_OF_LIGHT],
            1,
        );
        for ((row, chan, _), v) in vis.data.indexed_iter_mut() {
            *v = Complex32::new(1.0 + chan as f32, row as f32 * 0.01);
        }
        vis.flags[[3, 1, 0]] = true;

        let mut serial = WProjectGridder::new(geometry, kernels.clone(), 3, 1, 1).unwrap();
        let mut banded = WProjectGridder::new(geometry, kernels, 3, 1, 2).unwrap();
        assert_eq!(serial.grid(&vis).unwrap(), banded.grid(&vis).unwrap());
        assert_eq!(serial.uv_grid(), banded.uv_grid());
        assert_eq!(serial.sum_weights(), banded.sum_weights());
    }
}
