//! Simulate an observation of a point source at the phase centre, grid it
//! with w-projection and report the dirty-image peak.

use std::f64::consts::PI;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use log::{error, info};
use ndarray::{s, Array1, ArrayView2};
use num_complex::Complex32;

use wprojection::vis::SPEED_OF_LIGHT;
use wprojection::{GridderConfig, GriddingSession, ImageGeometry, SessionError, VisBuffer};

#[derive(Parser, Debug)]
#[command(name = "wproject", author, version, about)]
struct Args {
    /// TOML gridder configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Image side in pixels.
    #[arg(short = 'n', long, default_value = "256")]
    image_size: usize,

    /// Pixel size [arcseconds].
    #[arg(long, default_value = "2.0")]
    cell: f64,

    #[arg(short, long, default_value = "12")]
    antennas: usize,

    /// Longest antenna distance from the array centre [metres].
    #[arg(long, default_value = "3000.0")]
    max_radius: f64,

    /// Number of hour-angle samples spread over +-3 hours.
    #[arg(long, default_value = "24")]
    hour_angles: usize,

    /// Declination of the phase centre [degrees].
    #[arg(long, default_value = "-30.0")]
    dec: f64,

    /// Observing frequencies [MHz].
    #[arg(short, long, default_values_t = vec![1400.0])]
    freqs: Vec<f64>,

    /// Overrides `w_planes` from the config.
    #[arg(short, long)]
    w_planes: Option<usize>,

    /// Overrides `threads` from the config.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Save the convolution-function cache to this file.
    #[arg(long)]
    save_cache: Option<PathBuf>,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv).
    #[arg(short, long, action = ArgAction::Count)]
    verbosity: u8,
}

fn setup_logging(verbosity: u8) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stdout);
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        _ => builder.filter_level(log::LevelFilter::Trace),
    };
    builder.init();
}

/// Antennas on a three-armed log spiral, as local equatorial (X, Y, Z) metres.
fn antenna_positions(n: usize, max_radius: f64) -> Vec<[f64; 3]> {
    (0..n)
        .map(|i| {
            let arm = (i % 3) as f64 * 2.0 * PI / 3.0;
            let step = (i / 3 + 1) as f64 / ((n + 2) / 3) as f64;
            let r = max_radius * step * step;
            let theta = arm + 1.5 * step;
            [r * theta.cos(), r * theta.sin(), 0.1 * r * (2.0 * theta).sin()]
        })
        .collect()
}

/// Baseline tracks for hour angles across +-3 hours.
fn uvw_tracks(
    antennas: &[[f64; 3]],
    hour_angles: usize,
    dec: f64,
) -> (Vec<[f64; 3]>, Vec<usize>, Vec<usize>) {
    let (sin_d, cos_d) = dec.sin_cos();
    let mut uvw = vec![];
    let mut ant1 = vec![];
    let mut ant2 = vec![];
    for step in 0..hour_angles {
        let ha = if hour_angles > 1 {
            (step as f64 / (hour_angles - 1) as f64 - 0.5) * PI / 2.0
        } else {
            0.0
        };
        let (sin_h, cos_h) = ha.sin_cos();
        for i1 in 0..antennas.len() {
            for i2 in i1 + 1..antennas.len() {
                let [x, y, z] = [
                    antennas[i2][0] - antennas[i1][0],
                    antennas[i2][1] - antennas[i1][1],
                    antennas[i2][2] - antennas[i1][2],
                ];
                uvw.push([
                    sin_h * x + cos_h * y,
                    -sin_d * cos_h * x + sin_d * sin_h * y + cos_d * z,
                    cos_d * cos_h * x - cos_d * sin_h * y + sin_d * z,
                ]);
                ant1.push(i1);
                ant2.push(i2);
            }
        }
    }
    (uvw, ant1, ant2)
}

/// Brightest pixel of a plane as `((y, x), value)`.
fn peak(plane: ArrayView2<f32>) -> ((usize, usize), f32) {
    plane
        .indexed_iter()
        .fold(((0usize, 0usize), f32::MIN), |best, (at, &v)| {
            if v > best.1 {
                (at, v)
            } else {
                best
            }
        })
}

fn run(args: Args) -> Result<(), SessionError> {
    let mut config = match &args.config {
        Some(path) => GridderConfig::from_file(path)?,
        None => GridderConfig::default(),
    };
    if args.w_planes.is_some() {
        config.w_planes = args.w_planes;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if args.save_cache.is_some() {
        config.cache_file = args.save_cache.clone();
    }

    let antennas = antenna_positions(args.antennas, args.max_radius);
    let (uvw, antenna1, antenna2) = uvw_tracks(&antennas, args.hour_angles, args.dec.to_radians());
    let freqs: Array1<f64> = args.freqs.iter().map(|f| f * 1e6).collect();
    let mut vis = VisBuffer::new(uvw, freqs, 1);
    vis.antenna1 = antenna1;
    vis.antenna2 = antenna2;
    vis.data.fill(Complex32::new(1.0, 0.0));

    let stats = vis.w_statistics();
    info!(
        "{} rows x {} channel(s); |w| from {:.1} to {:.1} wavelengths (rms {:.1})",
        vis.n_rows(),
        vis.n_chan(),
        stats.min_w,
        stats.max_w,
        stats.rms_w
    );
    let longest = vis
        .uvw
        .iter()
        .map(|[u, v, _]| u.hypot(*v))
        .fold(0.0, f64::max)
        * vis.frequencies.iter().cloned().fold(0.0, f64::max)
        / SPEED_OF_LIGHT;
    info!("Longest projected baseline: {:.1} wavelengths", longest);

    let cell = (args.cell / 3600.0).to_radians();
    let image = ImageGeometry::new(args.image_size, args.image_size, [-cell, cell]);

    let mut session = GriddingSession::new(config, stats)?;
    let mut gridder = session.gridder(image, vis.n_chan(), vis.n_pol())?;
    let grid_stats = gridder.grid(&vis)?;
    info!(
        "Gridded {} samples, {} fell off the grid",
        grid_stats.used, grid_stats.off_grid
    );

    let dirty = session.image(gridder.finish())?;
    let (n_chan, _, ny, nx) = dirty.dim();
    for chan in 0..n_chan {
        let centre = dirty[[chan, 0, ny / 2, nx / 2]];
        let (peak_at, peak) = peak(dirty.slice(s![chan, 0, .., ..]));
        info!(
            "Channel {}: peak {:.4} at (y, x) = {:?}, centre pixel {:.4}",
            chan, peak, peak_at, centre
        );
    }

    if session.save_cache()? {
        info!("Convolution functions cached");
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    setup_logging(args.verbosity);
    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn peak_finds_brightest_pixel() {
        let mut plane = Array2::from_elem((6, 8), -1.0f32);
        plane[[4, 1]] = 2.5;
        plane[[0, 7]] = 2.0;
        assert_eq!(peak(plane.view()), ((4, 1), 2.5));
    }

    #[test]
    fn tracks_cover_every_baseline_per_hour_angle() {
        let antennas = antenna_positions(5, 1000.0);
        let (uvw, ant1, ant2) = uvw_tracks(&antennas, 3, (-30.0f64).to_radians());
        assert_eq!(uvw.len(), 30);
        assert_eq!((ant1[9], ant2[9]), (3, 4));
        assert!(ant1.iter().zip(&ant2).all(|(a, b)| a < b));
    }
}
