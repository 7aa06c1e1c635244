//! Error types for the FFT engine, convolution-function generation, gridding
//! and binary visibility decoding.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FftError {
    #[error("FFT2D does not deal with odd numbers on the x-y plane: got nx = {nx}, ny = {ny}")]
    OddDimensions { nx: usize, ny: usize },

    #[error("Programmer error: FFT2D called with wrong size; cached plan has nx = {plan_nx}, ny = {plan_ny} but got nx = {nx}, ny = {ny}")]
    PlanMismatch {
        plan_nx: usize,
        plan_ny: usize,
        nx: usize,
        ny: usize,
    },

    #[error("Lattice has {0} dimensions; FFT2D needs at least 2")]
    TooFewDimensions(usize),

    #[error("Output lattice shape {output:?} is not compatible with input shape {input:?} for a real to complex FFT (x needs at least {min_x} pixels)")]
    R2cShape {
        input: Vec<usize>,
        output: Vec<usize>,
        min_x: usize,
    },

    #[error("Could not build the FFT thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Error, Debug)]
pub enum ConvFuncError {
    #[error("Convolution function integral is not positive (sum = {sum})")]
    DegenerateIntegral { sum: f64 },

    #[error("Peak of the w = 0 convolution function is not positive; cannot normalise")]
    ZeroPeak,

    #[error("Image of {nx} x {ny} pixels with padding {padding} gives a convolution buffer of {conv_size} pixels, too small for oversampling {sampling}")]
    BufferTooSmall {
        nx: usize,
        ny: usize,
        padding: f32,
        conv_size: usize,
        sampling: usize,
    },

    #[error("Image increments must be finite and non-zero, got {0:?}")]
    BadIncrement([f64; 2]),

    #[error(transparent)]
    Fft(#[from] FftError),

    #[error("Could not build the w-plane thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Visibility buffer {what} has shape {got:?}, expected {expected:?}")]
    BufferShape {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("{what} map has {got} entries but the data have {expected}")]
    MapLength {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("{what} map points at grid index {index} but the grid only has {len}")]
    MapTarget {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Model grid has shape {got:?}, expected {expected:?}")]
    ModelShape {
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("Could not build the gridding thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    ConvFunc(#[from] ConvFuncError),

    #[error(transparent)]
    Fft(#[from] FftError),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unknown binary data type tag {0}")]
    UnknownDataType(u32),

    #[error("{encoding:?} data with {n_pol} polarisations cannot be decoded")]
    UnsupportedPolarisations {
        encoding: crate::bdf::SampleEncoding,
        n_pol: usize,
    },

    #[error("Illegal data type {0:?} for a float data column")]
    NotFloatData(crate::bdf::SampleEncoding),

    #[error("Block index is empty")]
    EmptyIndex,

    #[error("Row {row} is beyond the {n_rows} rows of its block")]
    RowOutOfRange { row: usize, n_rows: usize },

    #[error("Spectral window {spw} has no scale factor ({n} available)")]
    MissingScaleFactor { spw: usize, n: usize },

    #[error("Data block holds {got} bytes, but {needed} are needed")]
    BlockTooShort { needed: usize, got: usize },

    #[error("Row {row} decodes to shape {got:?}, but the buffer expects {expected:?}")]
    RowShape {
        row: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("Block refers to binary data file {file_nr}, but only {n_files} are known")]
    UnknownFile { file_nr: usize, n_files: usize },

    #[error("Binary data are unavailable for columns {columns:?}")]
    Unavailable { columns: Vec<String> },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CacheIoError {
    #[error("Cache record lists {listed} families but holds {held}")]
    Inconsistent { listed: usize, held: usize },

    #[error("Cache family {slot} has {planes} planes but {supports} supports")]
    SupportLength {
        slot: usize,
        planes: usize,
        supports: usize,
    },

    #[error("Cache file {file}: {source}")]
    IO {
        file: PathBuf,
        source: std::io::Error,
    },

    #[error("Cache file {file}: {source}")]
    Json {
        file: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Padding must be at least 1.0, got {0}")]
    Padding(f32),

    #[error("The number of threads must be at least 1")]
    ZeroThreads,

    #[error("key_significant_digits must be between 1 and 15, got {0}")]
    KeyDigits(u32),

    #[error("Couldn't read config file {file}: {source}")]
    IO {
        file: PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheIoError),

    #[error(transparent)]
    ConvFunc(#[from] ConvFuncError),

    #[error(transparent)]
    Grid(#[from] GridError),

    #[error(transparent)]
    Fft(#[from] FftError),
}
