use criterion::*;

use ndarray::{array, Array3};
use num_complex::Complex32;

use wprojection::vis::SPEED_OF_LIGHT;
use wprojection::wplane::WProjectConvFunc;
use wprojection::{
    Fft2d, GridGeometry, GridderConfig, ImageGeometry, VisBuffer, WProjectGridder, WStatistics,
};

fn stats() -> WStatistics {
    WStatistics {
        min_w: 0.0,
        max_w: 2000.0,
        rms_w: 600.0,
    }
}

fn config() -> GridderConfig {
    GridderConfig {
        w_planes: Some(8),
        ..Default::default()
    }
}

fn fft_benches(c: &mut Criterion) {
    let mut fft = Fft2d::new(1).unwrap();
    let mut threaded = Fft2d::new(4).unwrap();
    let mut planes = Array3::from_elem((4, 512, 512), Complex32::new(1.0, 0.5));

    // forward then inverse, so values stay bounded across iterations
    c.bench_function("c2c 4x512x512", |b| {
        b.iter(|| {
            fft.c2c(planes.view_mut(), true).unwrap();
            fft.c2c(planes.view_mut(), false).unwrap();
        })
    });
    c.bench_function("c2c 4x512x512 threaded", |b| {
        b.iter(|| {
            threaded.c2c(planes.view_mut(), true).unwrap();
            threaded.c2c(planes.view_mut(), false).unwrap();
        })
    });
    c.bench_function("c2c_in_double 4x512x512", |b| {
        b.iter(|| {
            fft.c2c_in_double(planes.view_mut(), true).unwrap();
            fft.c2c_in_double(planes.view_mut(), false).unwrap();
        })
    });
}

fn kernel_benches(c: &mut Criterion) {
    let image = ImageGeometry::square(256, 1e-5);
    let mut fft = Fft2d::new(4).unwrap();

    c.bench_function("w-projection family 256px 8 planes", |b| {
        b.iter(|| {
            WProjectConvFunc::new(stats(), &config())
                .find_conv_function(&image, &mut fft)
                .unwrap()
        })
    });
}

fn gridding_benches(c: &mut Criterion) {
    let image = ImageGeometry::square(256, 1e-5);
    let mut fft = Fft2d::new(4).unwrap();
    let kernels = WProjectConvFunc::new(stats(), &config())
        .find_conv_function(&image, &mut fft)
        .unwrap();
    let geometry = GridGeometry::new(image, config().padding);

    let uvw = (0..2000)
        .map(|i| {
            let t = i as f64 * 0.01;
            [
                3000.0 * t.cos() * (i % 7) as f64 / 7.0,
                3000.0 * t.sin() * (i % 5) as f64 / 5.0,
                2000.0 * (0.3 * t).sin(),
            ]
        })
        .collect();
    let mut vis = VisBuffer::new(uvw, array![SPEED_OF_LIGHT], 2);
    vis.data.fill(Complex32::new(1.0, 0.0));

    let mut serial = WProjectGridder::new(geometry, kernels.clone(), 1, 2, 1).unwrap();
    let mut threaded = WProjectGridder::new(geometry, kernels, 1, 2, 4).unwrap();
    c.bench_function("grid 2000 rows", |b| b.iter(|| serial.grid(&vis).unwrap()));
    c.bench_function("grid 2000 rows threaded", |b| {
        b.iter(|| threaded.grid(&vis).unwrap())
    });
}

criterion_group!(benches, fft_benches, kernel_benches, gridding_benches);
criterion_main!(benches);
