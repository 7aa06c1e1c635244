//! W-projection imaging primitives for radio interferometry.
//!
//! * [`fft2`]: 2D FFTs over the last two axes of an array, with plan caching
//!   and centred-origin conventions.
//! * [`wplane`] and [`cache`]: convolution functions that correct for the w
//!   term, one per w-plane, cached per image geometry.
//! * [`gridder`]: gridding visibilities onto a uv grid and degridding model
//!   visibilities back off it.
//! * [`bdf`]: decoding of binary correlator data blocks into visibility rows.
//!
//! [`session::GriddingSession`] wires these together.

pub mod bdf;
pub mod cache;
pub mod config;
pub mod error;
pub mod fft2;
mod find_fast_number;
pub mod geometry;
pub mod gridder;
pub mod session;
pub mod taper;
pub mod vis;
pub mod wplane;

pub use crate::config::GridderConfig;
pub use crate::error::{
    CacheIoError, ConfigError, ConvFuncError, DecodeError, FftError, GridError, SessionError,
};
pub use crate::fft2::Fft2d;
pub use crate::find_fast_number::composite_even_len;
pub use crate::geometry::{GridGeometry, ImageGeometry};
pub use crate::gridder::{ChannelPolMap, GridStats, GriddedPlane, WProjectGridder};
pub use crate::session::GriddingSession;
pub use crate::vis::VisBuffer;
pub use crate::wplane::{KernelSet, WProjectConvFunc, WStatistics};
