//! A 2D FFT engine operating on the last two axes of ndarray lattices.
//!
//! Leading axes are treated as a stack of independent planes. Every transform
//! is bracketed by quadrant swaps, so the logical origin of both domains sits
//! at `(ny / 2, nx / 2)`. Forward transforms are unnormalised; the inverse
//! divides by `nx * ny`.
//!
//! Plans are memoised per precision. The first transform fixes the plane size
//! for that precision, and any later request for a different size is a
//! programmer error rather than a reason to replan.

use std::cmp::max;
use std::sync::Arc;

use log::debug;
use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{s, Array2, ArrayView, ArrayViewMut, ArrayViewMut1, ArrayViewMut2, Dimension, Ix3, Zip};
use num_complex::{Complex, Complex32, Complex64};
use rustfft::num_traits::{Float, Zero};
use rustfft::{Fft, FftDirection, FftNum, FftPlanner};

use crate::error::FftError;

/// Floating point types with their own plan cache in [`Fft2d`].
pub trait FftFloat: FftNum + Float {
    #[doc(hidden)]
    fn plans(engine: &mut Fft2d) -> &mut PlanCache<Self>;

    fn from_f64_lossy(v: f64) -> Self;
}

impl FftFloat for f32 {
    fn plans(engine: &mut Fft2d) -> &mut PlanCache<f32> {
        &mut engine.single
    }

    fn from_f64_lossy(v: f64) -> f32 {
        v as f32
    }
}

impl FftFloat for f64 {
    fn plans(engine: &mut Fft2d) -> &mut PlanCache<f64> {
        &mut engine.double
    }

    fn from_f64_lossy(v: f64) -> f64 {
        v
    }
}

fn direction(to_freq: bool) -> FftDirection {
    if to_freq {
        FftDirection::Forward
    } else {
        FftDirection::Inverse
    }
}

/// The 2D FFT engine. One engine is owned per logical gridding task; its
/// thread count is fixed at construction.
pub struct Fft2d {
    threads: usize,
    pool: Option<rayon::ThreadPool>,
    single: PlanCache<f32>,
    double: PlanCache<f64>,
}

impl Fft2d {
    /// Create an engine whose row and column passes run on `threads` threads.
    /// With a single thread no pool is built and transforms run on the caller.
    pub fn new(threads: usize) -> Result<Self, FftError> {
        let threads = threads.max(1);
        let pool = if threads > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()?,
            )
        } else {
            None
        };
        debug!("FFT2D engine using {} thread(s)", threads);

        Ok(Fft2d {
            threads,
            pool,
            single: PlanCache::new(),
            double: PlanCache::new(),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Drop the memoised plans of both precisions so that the next transform
    /// may use a new plane size.
    pub fn release_plans(&mut self) {
        if self.single.dims.is_some() || self.double.dims.is_some() {
            debug!("Releasing FFT2D plans");
        }
        self.single = PlanCache::new();
        self.double = PlanCache::new();
    }

    /// Fetch (or create) the memoised plan for an `nx` by `ny` plane.
    ///
    /// The returned plan executes serially on whichever thread calls it, so it
    /// can be shared across an outer parallel loop without nesting thread pools.
    pub fn plan<T: FftFloat>(
        &mut self,
        nx: usize,
        ny: usize,
        direction: FftDirection,
    ) -> Result<Plan2d<T>, FftError> {
        T::plans(self).plan(nx, ny, direction)
    }

    /// In-place complex to complex transform of every `(y, x)` plane of
    /// `inout`. `to_freq` selects the forward transform.
    pub fn c2c<T: FftFloat, D: Dimension>(
        &mut self,
        inout: ArrayViewMut<Complex<T>, D>,
        to_freq: bool,
    ) -> Result<(), FftError> {
        let mut planes = planes_of(inout)?;
        let (ny, nx) = (planes.shape()[1], planes.shape()[2]);
        let plan = self.plan::<T>(nx, ny, direction(to_freq))?;
        let scale = if to_freq {
            T::one()
        } else {
            T::from_f64_lossy(1.0 / (nx as f64 * ny as f64))
        };

        for mut plane in planes.outer_iter_mut() {
            swap_quadrants(plane.view_mut(), T::one());
            self.execute(&plan, plane.view_mut());
            swap_quadrants(plane, scale);
        }
        Ok(())
    }

    /// Transform single precision data with the double precision plans.
    pub fn c2c_in_double<D: Dimension>(
        &mut self,
        inout: ArrayViewMut<Complex32, D>,
        to_freq: bool,
    ) -> Result<(), FftError> {
        let mut planes = planes_of(inout)?;
        let (ny, nx) = (planes.shape()[1], planes.shape()[2]);
        let mut buffer: Array2<Complex64> = Array2::zeros((ny, nx));

        for mut plane in planes.outer_iter_mut() {
            Zip::from(&mut buffer)
                .and(&plane)
                .for_each(|d, s| *d = Complex64::new(s.re as f64, s.im as f64));
            self.c2c(buffer.view_mut(), to_freq)?;
            Zip::from(&mut plane)
                .and(&buffer)
                .for_each(|d, s| *d = Complex32::new(s.re as f32, s.im as f32));
        }
        Ok(())
    }

    /// Real to complex forward transform. `out` keeps the non-negative `x`
    /// frequencies (`nx / 2 + 1` of them) with the `y` origin centred.
    pub fn r2c<D: Dimension>(
        &mut self,
        out: ArrayViewMut<Complex32, D>,
        input: ArrayView<f32, D>,
    ) -> Result<(), FftError> {
        let in_shape = input.shape().to_vec();
        let out_shape = out.shape().to_vec();
        let ndim = in_shape.len();
        if ndim < 2 {
            return Err(FftError::TooFewDimensions(ndim));
        }
        let (ny, nx) = (in_shape[ndim - 2], in_shape[ndim - 1]);
        if nx % 2 != 0 || ny % 2 != 0 {
            return Err(FftError::OddDimensions { nx, ny });
        }
        let half = nx / 2 + 1;
        if out_shape.len() != ndim
            || out_shape[ndim - 1] < half
            || out_shape[..ndim - 1] != in_shape[..ndim - 1]
        {
            return Err(FftError::R2cShape {
                input: in_shape,
                output: out_shape,
                min_x: half,
            });
        }

        let plan = self.plan::<f32>(nx, ny, FftDirection::Forward)?;
        let n_planes = in_shape[..ndim - 2].iter().product::<usize>();
        let planes_in = input.into_shape((n_planes, ny, nx))?;
        let mut planes_out = out.into_shape((n_planes, ny, out_shape[ndim - 1]))?;
        let mut buffer: Array2<Complex32> = Array2::zeros((ny, nx));

        for (plane_in, mut plane_out) in planes_in.outer_iter().zip(planes_out.outer_iter_mut()) {
            Zip::from(&mut buffer)
                .and(&plane_in)
                .for_each(|b, &r| *b = Complex32::new(r, 0.0));
            swap_quadrants(buffer.view_mut(), 1.0);
            self.execute(&plan, buffer.view_mut());

            // The x axis only holds non-negative frequencies, so only y is
            // rotated to put its origin in the middle.
            for (y, mut row) in plane_out.outer_iter_mut().enumerate() {
                let src = buffer.row((y + ny / 2) % ny);
                row.slice_mut(s![..half]).assign(&src.slice(s![..half]));
            }
        }
        Ok(())
    }

    fn execute<T: FftFloat>(&self, plan: &Plan2d<T>, plane: ArrayViewMut2<Complex<T>>) {
        match &self.pool {
            Some(pool) => pool.install(|| plan.process_par(plane)),
            None => plan.process(plane),
        }
    }
}

/// Memoised plans for one precision.
pub struct PlanCache<T: FftNum> {
    planner: FftPlanner<T>,
    dims: Option<(usize, usize)>,
    forward: Option<Plan2d<T>>,
    inverse: Option<Plan2d<T>>,
}

impl<T: FftNum> PlanCache<T> {
    fn new() -> Self {
        PlanCache {
            planner: FftPlanner::new(),
            dims: None,
            forward: None,
            inverse: None,
        }
    }

    fn plan(
        &mut self,
        nx: usize,
        ny: usize,
        direction: FftDirection,
    ) -> Result<Plan2d<T>, FftError> {
        if nx % 2 != 0 || ny % 2 != 0 {
            return Err(FftError::OddDimensions { nx, ny });
        }
        match self.dims {
            Some((plan_nx, plan_ny)) if (plan_nx, plan_ny) != (nx, ny) => {
                return Err(FftError::PlanMismatch {
                    plan_nx,
                    plan_ny,
                    nx,
                    ny,
                })
            }
            Some(_) => (),
            None => self.dims = Some((nx, ny)),
        }

        let planner = &mut self.planner;
        let slot = match direction {
            FftDirection::Forward => &mut self.forward,
            FftDirection::Inverse => &mut self.inverse,
        };
        Ok(slot
            .get_or_insert_with(|| Plan2d::new(planner, nx, ny, direction))
            .clone())
    }
}

/// A row and column plan pair for one plane size and direction.
#[derive(Clone)]
pub struct Plan2d<T: FftNum> {
    nx: usize,
    ny: usize,
    direction: FftDirection,
    rows: Arc<dyn Fft<T>>,
    cols: Arc<dyn Fft<T>>,
}

impl<T: FftNum> Plan2d<T> {
    fn new(planner: &mut FftPlanner<T>, nx: usize, ny: usize, direction: FftDirection) -> Self {
        Plan2d {
            nx,
            ny,
            direction,
            rows: planner.plan_fft(nx, direction),
            cols: planner.plan_fft(ny, direction),
        }
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn direction(&self) -> FftDirection {
        self.direction
    }

    /// Transform a plane in place on the calling thread. No quadrant swaps or
    /// scaling are applied, so the origin is at index `(0, 0)`.
    pub fn process(&self, mut plane: ArrayViewMut2<Complex<T>>) {
        debug_assert_eq!(plane.dim(), (self.ny, self.nx));
        let scratch_len = max(
            self.rows.get_inplace_scratch_len(),
            self.cols.get_inplace_scratch_len(),
        );
        let mut scratch = vec![Complex::zero(); scratch_len];
        let mut buffer = vec![Complex::zero(); max(self.nx, self.ny)];

        for row in plane.rows_mut() {
            transform_lane(&*self.rows, row, &mut buffer[..self.nx], &mut scratch);
        }
        for col in plane.columns_mut() {
            transform_lane(&*self.cols, col, &mut buffer[..self.ny], &mut scratch);
        }
    }

    /// Like [`Plan2d::process`], with rows and columns spread over the current
    /// rayon pool.
    pub fn process_par(&self, mut plane: ArrayViewMut2<Complex<T>>) {
        debug_assert_eq!(plane.dim(), (self.ny, self.nx));
        let (rows, cols) = (&self.rows, &self.cols);

        Zip::from(plane.rows_mut()).into_par_iter().for_each_init(
            || {
                (
                    vec![Complex::zero(); rows.len()],
                    vec![Complex::zero(); rows.get_inplace_scratch_len()],
                )
            },
            |(buffer, scratch), row| transform_lane(&**rows, row.0, buffer, scratch),
        );

        Zip::from(plane.columns_mut()).into_par_iter().for_each_init(
            || {
                (
                    vec![Complex::zero(); cols.len()],
                    vec![Complex::zero(); cols.get_inplace_scratch_len()],
                )
            },
            |(buffer, scratch), col| transform_lane(&**cols, col.0, buffer, scratch),
        );
    }
}

fn transform_lane<T: FftNum>(
    fft: &dyn Fft<T>,
    mut lane: ArrayViewMut1<Complex<T>>,
    buffer: &mut [Complex<T>],
    scratch: &mut [Complex<T>],
) {
    if let Some(contiguous) = lane.as_slice_mut() {
        fft.process_with_scratch(contiguous, scratch);
        return;
    }

    debug_assert_eq!(lane.len(), buffer.len());
    for (b, e) in buffer.iter_mut().zip(lane.iter()) {
        *b = *e;
    }
    fft.process_with_scratch(buffer, scratch);
    for (e, b) in lane.iter_mut().zip(buffer.iter()) {
        *e = *b;
    }
}

/// View a lattice as a stack of `(y, x)` planes.
fn planes_of<'a, A, D: Dimension>(
    lattice: ArrayViewMut<'a, A, D>,
) -> Result<ArrayViewMut<'a, A, Ix3>, FftError> {
    let shape = lattice.shape().to_vec();
    let ndim = shape.len();
    if ndim < 2 {
        return Err(FftError::TooFewDimensions(ndim));
    }
    let n_planes = shape[..ndim - 2].iter().product::<usize>();
    Ok(lattice.into_shape((n_planes, shape[ndim - 2], shape[ndim - 1]))?)
}

/// Swap diagonally opposite quadrants of an even-sized plane, scaling every
/// element by `scale` on the way.
pub(crate) fn swap_quadrants<T: FftFloat>(mut plane: ArrayViewMut2<Complex<T>>, scale: T) {
    for row in plane.rows_mut() {
        fft_shift_even(row);
    }
    for col in plane.columns_mut() {
        fft_shift_even(col);
    }
    if scale != T::one() {
        plane.mapv_inplace(|v| v.scale(scale));
    }
}

fn fft_shift_even<A>(mut input: ArrayViewMut1<A>) {
    let half = input.len() / 2;
    for i in 0..half {
        input.swap(i, i + half);
    }
}
