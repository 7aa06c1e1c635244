//! Ties configuration, FFT engines and the convolution-function generator
//! together for one imaging run.

use log::{debug, info};
use ndarray::{Array4, ArrayView4};
use num_complex::Complex32;

use crate::cache::CacheRecord;
use crate::config::GridderConfig;
use crate::error::SessionError;
use crate::fft2::Fft2d;
use crate::geometry::{GridGeometry, ImageGeometry};
use crate::gridder::{model_grid, GriddedPlane, WProjectGridder};
use crate::wplane::{KernelSet, WProjectConvFunc, WStatistics};

pub struct GriddingSession {
    config: GridderConfig,
    kernel_fft: Fft2d,
    image_fft: Fft2d,
    conv_func: WProjectConvFunc,
}

impl GriddingSession {
    /// Start a session. If `config.cache_file` exists its families are
    /// reloaded.
    pub fn new(config: GridderConfig, stats: WStatistics) -> Result<Self, SessionError> {
        config.validate()?;
        let threads = config.threads();

        let conv_func = match &config.cache_file {
            Some(path) if path.exists() => {
                let record = CacheRecord::read_json(path)?;
                info!(
                    "Loaded {} convolution function families from {}",
                    record.num_conv,
                    path.display()
                );
                WProjectConvFunc::from_record(record, stats, &config)?
            }
            _ => WProjectConvFunc::new(stats, &config),
        };

        debug!(
            "Session with {} thread(s), padding {}",
            threads, config.padding
        );
        Ok(GriddingSession {
            kernel_fft: Fft2d::new(threads)?,
            image_fft: Fft2d::new(threads)?,
            conv_func,
            config,
        })
    }

    pub fn config(&self) -> &GridderConfig {
        &self.config
    }

    pub fn conv_func(&self) -> &WProjectConvFunc {
        &self.conv_func
    }

    /// Update the w statistics used for geometries not yet seen.
    pub fn set_w_statistics(&mut self, stats: WStatistics) {
        self.conv_func.set_w_statistics(stats);
    }

    pub fn grid_geometry(&self, image: ImageGeometry) -> GridGeometry {
        GridGeometry::new(image, self.config.padding)
    }

    pub fn kernels(&mut self, image: &ImageGeometry) -> Result<KernelSet, SessionError> {
        let kernels = self.conv_func.find_conv_function(image, &mut self.kernel_fft)?;
        if !kernels.diagnostics.from_cache {
            info!(
                "Convolution functions for {} x {} image: {} w-plane(s), support {:?}",
                image.nx,
                image.ny,
                kernels.family.planes(),
                kernels.family.support
            );
        }
        Ok(kernels)
    }

    /// A gridder for `image` with kernels found or computed as needed.
    pub fn gridder(
        &mut self,
        image: ImageGeometry,
        n_chan: usize,
        n_pol: usize,
    ) -> Result<WProjectGridder, SessionError> {
        let kernels = self.kernels(&image)?;
        let geometry = self.grid_geometry(image);
        Ok(WProjectGridder::new(
            geometry,
            kernels,
            n_chan,
            n_pol,
            self.config.threads(),
        )?)
    }

    pub fn image(&mut self, plane: GriddedPlane) -> Result<Array4<f32>, SessionError> {
        Ok(plane.to_image(&mut self.image_fft)?)
    }

    pub fn model_grid(
        &mut self,
        model: ArrayView4<f32>,
        geometry: &GridGeometry,
    ) -> Result<Array4<Complex32>, SessionError> {
        Ok(model_grid(model, geometry, &mut self.image_fft)?)
    }

    /// Write the cache to `config.cache_file`. Returns false if none is set.
    pub fn save_cache(&self) -> Result<bool, SessionError> {
        match &self.config.cache_file {
            Some(path) => {
                self.conv_func.to_record().write_json(path)?;
                info!(
                    "Saved {} convolution function families to {}",
                    self.conv_func.cache().len(),
                    path.display()
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn stats() -> WStatistics {
        WStatistics {
            min_w: 0.0,
            max_w: 300.0,
            rms_w: 100.0,
        }
    }

    fn config() -> GridderConfig {
        GridderConfig {
            w_planes: Some(3),
            threads: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn kernels_are_computed_once_per_geometry() {
        let mut session = GriddingSession::new(config(), stats()).unwrap();
        let image = ImageGeometry::square(64, 1.0e-4);
        let first = session.kernels(&image).unwrap();
        let second = session.kernels(&image).unwrap();
        assert!(!first.diagnostics.from_cache);
        assert!(second.diagnostics.from_cache);
        assert_eq!(session.conv_func().cache().computations(), 1);

        session.kernels(&ImageGeometry::square(32, 1.0e-4)).unwrap();
        assert_eq!(session.conv_func().cache().len(), 2);
    }

    #[test]
    fn gridder_matches_padded_geometry() {
        let mut session = GriddingSession::new(config(), stats()).unwrap();
        let gridder = session
            .gridder(ImageGeometry::square(64, 1.0e-4), 2, 1)
            .unwrap();
        // 64 * 1.2 = 76.8 -> 80
        assert_eq!(gridder.uv_grid().dim(), (2, 1, 80, 80));
    }

    #[test]
    fn no_cache_file_means_nothing_saved() {
        let session = GriddingSession::new(config(), stats()).unwrap();
        assert!(!session.save_cache().unwrap());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = GridderConfig {
            padding: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            GriddingSession::new(bad, stats()),
            Err(SessionError::Config(ConfigError::Padding(_)))
        ));
    }
}
