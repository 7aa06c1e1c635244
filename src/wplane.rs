//! W-projection convolution functions.
//!
//! Each w-plane kernel is the Fourier transform of a Fresnel phase screen
//! `exp(2 pi i w (sqrt(1 - l^2 - m^2) - 1))` tapered by a separable
//! spheroidal, computed on an oversampled buffer of `conv_size` pixels. Planes
//! are spaced quadratically in w, so plane `iw` holds `w = iw^2 / scale`.

use std::cmp::{max, min};
use std::f64::consts::PI;
use std::sync::Arc;

use log::{debug, info, trace, warn};
use ndarray::parallel::prelude::*;
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use num_complex::Complex32;
use num_integer::Integer;
use rustfft::num_traits::Zero;
use rustfft::FftDirection;
use serde::{Deserialize, Serialize};
use unchecked_index::get_unchecked_mut;

use crate::cache::{CacheLookup, CacheRecord, ConvFuncCache, ConvolutionFunctionFamily, PersistedFamily};
use crate::config::GridderConfig;
use crate::error::{CacheIoError, ConvFuncError};
use crate::fft2::{Fft2d, Plan2d};
use crate::find_fast_number::composite_even_len;
use crate::geometry::ImageGeometry;
use crate::taper::spheroidal_taper;

/// Kernel magnitude below which a pixel is outside the support.
const SUPPORT_THRESHOLD: f32 = 1e-3;

const MAX_PLANES_PER_CHUNK: usize = 100;

/// Statistics of |w| (wavelengths) over the data to be gridded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WStatistics {
    pub min_w: f64,
    pub max_w: f64,
    pub rms_w: f64,
}

/// Quadratic mapping between w-plane index and physical w.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WScale {
    planes: usize,
    max_w: f64,
    scale: f64,
}

impl WScale {
    pub fn new(planes: usize, max_w: f64) -> Self {
        let planes = planes.max(1);
        let scale = if planes > 1 && max_w > 0.0 {
            ((planes - 1) * (planes - 1)) as f64 / max_w
        } else {
            0.0
        };
        WScale {
            planes,
            max_w,
            scale,
        }
    }

    pub fn planes(&self) -> usize {
        self.planes
    }

    pub fn max_w(&self) -> f64 {
        self.max_w
    }

    /// Planes per wavelength squared.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// The plane holding the kernel for `w` wavelengths (either sign),
    /// clamped to the last plane.
    #[inline]
    pub fn plane_for(&self, w: f64) -> usize {
        if self.planes == 1 {
            return 0;
        }
        let plane = (self.scale * w.abs()).sqrt().round() as usize;
        min(plane, self.planes - 1)
    }

    /// The w (wavelengths) a plane was computed for.
    pub fn w_of_plane(&self, plane: usize) -> f64 {
        if self.scale == 0.0 {
            0.0
        } else {
            (plane * plane) as f64 / self.scale
        }
    }
}

/// Sizes fixed for a family before any kernel is computed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelLayout {
    pub w_scale: WScale,
    /// Side of the oversampled buffer each phase screen is transformed in.
    pub conv_size: usize,
    pub conv_sampling: usize,
    pub planes_per_chunk: usize,
}

impl KernelLayout {
    pub fn new(
        image: &ImageGeometry,
        stats: &WStatistics,
        user_planes: Option<usize>,
        padding: f32,
        memory_budget_mb: usize,
    ) -> Result<Self, ConvFuncError> {
        let incr = image.increment;
        if !incr.iter().all(|i| i.is_finite() && *i != 0.0) {
            return Err(ConvFuncError::BadIncrement(incr));
        }
        let n_max = max(image.nx, image.ny);

        let (planes, max_w) = match user_planes {
            Some(planes) => {
                let max_w = if stats.max_w > 0.0 {
                    1.05 * stats.max_w
                } else {
                    0.25 / incr[0].abs()
                };
                (planes, max_w)
            }
            None => {
                let mid = 0.5 * (stats.min_w + stats.max_w);
                let max_w = if mid <= 0.0 || stats.rms_w < mid {
                    1.05 * stats.max_w
                } else {
                    stats.rms_w / mid * 1.05 * stats.max_w
                };
                let field = (incr[0].abs() * n_max as f64 / 2.0).sin().abs();
                // truncated, not rounded
                ((max_w * field) as usize, max_w)
            }
        };
        let w_scale = WScale::new(planes, max_w);

        let conv_sampling = if w_scale.planes() > 1 { 4 } else { 1 };
        let conv_size = composite_even_len((n_max as f64 * padding as f64) as usize);
        if conv_size / (2 * conv_sampling) < 2 {
            return Err(ConvFuncError::BufferTooSmall {
                nx: image.nx,
                ny: image.ny,
                padding,
                conv_size,
                sampling: conv_sampling,
            });
        }

        let planes_per_chunk = if w_scale.planes() > 1 {
            let bytes_per_plane = 8.0 * (conv_size * conv_size) as f64;
            let fit = (memory_budget_mb as f64 * 1024.0 * 1024.0 / bytes_per_plane) as usize;
            fit.clamp(1, MAX_PLANES_PER_CHUNK)
        } else {
            MAX_PLANES_PER_CHUNK
        };

        Ok(KernelLayout {
            w_scale,
            conv_size,
            conv_sampling,
            planes_per_chunk,
        })
    }

    pub fn planes(&self) -> usize {
        self.w_scale.planes()
    }

    /// Screen pixels inside the aperture along each axis.
    pub fn inner(&self) -> usize {
        self.conv_size / self.conv_sampling
    }

    pub fn max_support(&self) -> usize {
        self.conv_size / 2 / self.conv_sampling - 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GenerationDiagnostics {
    /// Planes whose support hit the buffer edge (or had no pixel above the
    /// threshold) and were clamped to the largest usable support.
    pub saturated_planes: usize,
    pub from_cache: bool,
}

/// The family for an image, plus how it was obtained.
#[derive(Clone, Debug)]
pub struct KernelSet {
    pub family: Arc<ConvolutionFunctionFamily>,
    pub w_scale: WScale,
    pub diagnostics: GenerationDiagnostics,
}

/// Produces (and caches) the convolution-function family for each image
/// geometry seen in a session.
pub struct WProjectConvFunc {
    stats: WStatistics,
    user_planes: Option<usize>,
    padding: f32,
    memory_budget_mb: usize,
    key_digits: u32,
    cache: ConvFuncCache,
    // describe the most recently used family, for the persisted record
    w_scaler: f64,
    conv_sampling: usize,
    nx: usize,
    ny: usize,
}

impl WProjectConvFunc {
    pub fn new(stats: WStatistics, config: &GridderConfig) -> Self {
        WProjectConvFunc {
            stats,
            user_planes: config.user_w_planes(),
            padding: config.padding,
            memory_budget_mb: config.memory_budget_mb(),
            key_digits: config.key_significant_digits,
            cache: ConvFuncCache::new(),
            w_scaler: 0.0,
            conv_sampling: 1,
            nx: 0,
            ny: 0,
        }
    }

    /// Resume from a persisted cache.
    pub fn from_record(
        record: CacheRecord,
        stats: WStatistics,
        config: &GridderConfig,
    ) -> Result<Self, CacheIoError> {
        let mut conv_func = Self::new(stats, config);
        conv_func.w_scaler = record.w_scaler;
        conv_func.conv_sampling = record.conv_sampling;
        conv_func.nx = record.nx;
        conv_func.ny = record.ny;
        conv_func.cache = record.into_cache()?;
        debug!(
            "Restored {} convolution function families from cache",
            conv_func.cache.len()
        );
        Ok(conv_func)
    }

    pub fn to_record(&self) -> CacheRecord {
        let families: Vec<PersistedFamily> = self
            .cache
            .entries()
            .into_iter()
            .map(|(key, slot, family)| PersistedFamily {
                key,
                slot,
                family: (*family).clone(),
            })
            .collect();
        CacheRecord {
            num_conv: families.len(),
            families,
            w_scaler: self.w_scaler,
            conv_sampling: self.conv_sampling,
            nx: self.nx,
            ny: self.ny,
        }
    }

    pub fn cache(&self) -> &ConvFuncCache {
        &self.cache
    }

    pub fn w_statistics(&self) -> WStatistics {
        self.stats
    }

    /// Replace the w statistics used for families not yet computed.
    pub fn set_w_statistics(&mut self, stats: WStatistics) {
        self.stats = stats;
    }

    /// Return the family for `image`, computing it on first sight of its
    /// geometry.
    pub fn find_conv_function(
        &mut self,
        image: &ImageGeometry,
        fft: &mut Fft2d,
    ) -> Result<KernelSet, ConvFuncError> {
        let key = image.key(self.key_digits);
        self.nx = image.nx;
        self.ny = image.ny;

        let slot = match self.cache.lookup_or_reserve(key) {
            CacheLookup::Hit(family) => {
                debug!("Reusing convolution functions for {}", key);
                self.w_scaler = family.w_scaler;
                self.conv_sampling = family.conv_sampling;
                return Ok(KernelSet {
                    w_scale: family.w_scale(),
                    family,
                    diagnostics: GenerationDiagnostics {
                        saturated_planes: 0,
                        from_cache: true,
                    },
                });
            }
            CacheLookup::Miss(slot) => slot,
        };

        let layout = KernelLayout::new(
            image,
            &self.stats,
            self.user_planes,
            self.padding,
            self.memory_budget_mb,
        )?;
        let (family, saturated_planes) = generate_family(image, &layout, self.padding, fft)?;
        self.w_scaler = family.w_scaler;
        self.conv_sampling = family.conv_sampling;
        let family = self.cache.insert(slot, family);

        Ok(KernelSet {
            w_scale: layout.w_scale,
            family,
            diagnostics: GenerationDiagnostics {
                saturated_planes,
                from_cache: false,
            },
        })
    }
}

/// Builds and transforms the phase screen for one plane.
struct PhaseScreens<'a> {
    layout: &'a KernelLayout,
    sampling: [f64; 2],
    taper: Vec<f64>,
    plan: &'a Plan2d<f32>,
}

impl PhaseScreens<'_> {
    /// The transformed screen, origin at `(0, 0)`.
    fn transform(&self, plane: usize) -> Result<Array2<Complex32>, ConvFuncError> {
        let n = self.layout.conv_size;
        let half = (self.layout.inner() / 2) as isize;
        let two_pi_w = 2.0 * PI * self.layout.w_scale.w_of_plane(plane);

        let mut screen = vec![Complex32::zero(); n * n];
        for iy in -half..half {
            let m = self.sampling[1] * iy as f64;
            let taper_y = self.taper[(iy + half) as usize];
            // origin at index 0, negative offsets wrap to the far end
            let row = iy.rem_euclid(n as isize) as usize * n;
            for ix in -half..half {
                let l = self.sampling[0] * ix as f64;
                let rsq = l * l + m * m;
                if rsq < 1.0 {
                    let (sin, cos) = (two_pi_w * ((1.0 - rsq).sqrt() - 1.0)).sin_cos();
                    let weight = taper_y * self.taper[(ix + half) as usize];
                    let k = row + ix.rem_euclid(n as isize) as usize;
                    unsafe {
                        *get_unchecked_mut(screen.as_mut_slice(), k) =
                            Complex32::new((weight * cos) as f32, (weight * sin) as f32);
                    }
                }
            }
        }

        let mut screen = Array2::from_shape_vec((n, n), screen)?;
        self.plan.process(screen.view_mut());
        Ok(screen)
    }
}

fn generate_family(
    image: &ImageGeometry,
    layout: &KernelLayout,
    padding: f32,
    fft: &mut Fft2d,
) -> Result<(ConvolutionFunctionFamily, usize), ConvFuncError> {
    let planes = layout.planes();
    let conv_size = layout.conv_size;
    let samp = layout.conv_sampling;
    let quarter = conv_size / 2 - 1;

    if planes > 1 {
        info!("W projection using {} planes", planes);
        info!("Using maximum possible W = {} (wavelengths)", layout.w_scale.max_w());
        info!(
            "Scaling in W (at maximum W) = {} wavelengths per pixel",
            1.0 / layout.w_scale.scale()
        );
    }
    debug!(
        "Convolution buffer {} pixels, oversampling {}, {} planes per chunk",
        conv_size, samp, layout.planes_per_chunk
    );

    // a new family may need a new buffer size
    fft.release_plans();
    let plan = fft.plan::<f32>(conv_size, conv_size, FftDirection::Forward)?;
    let screens = PhaseScreens {
        layout,
        sampling: [
            image.increment[0].abs() * samp as f64 * padding as f64 * image.nx as f64
                / conv_size as f64,
            image.increment[1].abs() * samp as f64 * padding as f64 * image.ny as f64
                / conv_size as f64,
        ],
        taper: spheroidal_taper(layout.inner()),
        plan: &plan,
    };

    let max_conv = screens.transform(0)?[[0, 0]].norm();
    if !(max_conv > 0.0) || !max_conv.is_finite() {
        return Err(ConvFuncError::ZeroPeak);
    }

    let per_chunk = layout.planes_per_chunk;
    let n_chunks = Integer::div_ceil(&planes, &per_chunk);
    let mut arena: Vec<Option<Array3<Complex32>>> = vec![None; n_chunks];
    let mut support = vec![0; planes];
    let mut saturated = 0;

    for chunk_id in (0..n_chunks).rev() {
        let w_start = chunk_id * per_chunk;
        let len = min(per_chunk, planes - w_start);
        trace!("Computing w-planes {}..{}", w_start, w_start + len);

        let mut block: Array3<Complex32> = Array3::zeros((len, quarter, quarter));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(min(fft.threads(), len))
            .build()?;
        pool.install(|| {
            block
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .try_for_each(|(i, mut out)| {
                    let screen = screens.transform(w_start + i)?;
                    out.assign(&screen.slice(s![..quarter, ..quarter]));
                    out.mapv_inplace(|v| v / max_conv);
                    Ok::<(), ConvFuncError>(())
                })
        })?;

        for (i, kernel) in block.outer_iter().enumerate() {
            let (radius, clamped) = find_support(kernel, layout);
            support[w_start + i] = radius;
            if clamped {
                saturated += 1;
            }
        }
        arena[chunk_id] = Some(block);
    }

    // every plane's support is known; shrink the buffer to the widest of them
    let widest = support.iter().copied().max().unwrap_or(1);
    let shrunk = 2 * (widest + 2) * samp;
    let final_size = if shrunk < conv_size { shrunk } else { conv_size };
    let side = final_size / 2 - 1;

    let mut kernels: Array3<Complex32> = Array3::zeros((planes, side, side));
    for (chunk_id, block) in arena.into_iter().enumerate() {
        if let Some(block) = block {
            let w_start = chunk_id * per_chunk;
            let len = block.len_of(Axis(0));
            kernels
                .slice_mut(s![w_start..w_start + len, .., ..])
                .assign(&block.slice(s![.., ..side, ..side]));
        }
    }

    let pb_sum = plane_zero_integral(&kernels, support[0], samp)?;
    let inv_sum = (1.0 / pb_sum) as f32;
    kernels.mapv_inplace(|v| v * inv_sum);

    if saturated > 0 {
        warn!(
            "{} of {} w-planes hit the maximum convolution support of {} pixels",
            saturated,
            planes,
            layout.max_support()
        );
    }
    info!(
        "Convolution support = {:?} pixels in Fourier plane",
        support.iter().map(|s| s * samp).collect::<Vec<_>>()
    );
    info!(
        "Memory used in gridding function = {} MB",
        (side * side * planes * 8) as f64 / 1024.0 / 1024.0
    );

    Ok((
        ConvolutionFunctionFamily {
            kernels,
            support,
            conv_size: final_size,
            conv_sampling: samp,
            w_scaler: layout.w_scale.max_w(),
        },
        saturated,
    ))
}

/// Sum of the real part of plane 0 over its support, on the grid-pixel
/// samples. Must be positive.
fn plane_zero_integral(
    kernels: &Array3<Complex32>,
    support: usize,
    samp: usize,
) -> Result<f64, ConvFuncError> {
    let s0 = support as isize;
    let mut pb_sum = 0.0f64;
    for iy in -s0..=s0 {
        for ix in -s0..=s0 {
            let at = (0, iy.unsigned_abs() * samp, ix.unsigned_abs() * samp);
            pb_sum += kernels.get(at).map_or(0.0, |v| v.re as f64);
        }
    }
    if !(pb_sum > 0.0) {
        return Err(ConvFuncError::DegenerateIntegral { sum: pb_sum });
    }
    Ok(pb_sum)
}

/// Support radius of one normalised kernel, and whether it had to be clamped.
fn find_support(kernel: ArrayView2<Complex32>, layout: &KernelLayout) -> (usize, bool) {
    let samp = layout.conv_sampling;
    let max_support = layout.max_support();
    for trial in (1..=layout.conv_size / 2 - 2).rev() {
        if kernel[[0, trial]].norm() > SUPPORT_THRESHOLD
            || kernel[[trial, 0]].norm() > SUPPORT_THRESHOLD
        {
            let radius = (0.5 + trial as f32 / samp as f32) as usize + 1;
            if radius > max_support || radius * samp * 2 >= layout.conv_size {
                return (max_support, true);
            }
            return (radius, false);
        }
    }
    (max_support, true)
}
