use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use specsyst::profile::ProfileModel;
use specsyst::spectrum::Spectrum;

/// Instrumental resolving power shared by the synthetic spectra.
pub const RESOL: f64 = 70_000.0;

/// Build a unit-continuum spectrum with the given absorption systems
/// injected and Gaussian noise of standard deviation `noise` on top.
///
/// The wavelength grid is uniform with step `step` nm; every sample carries
/// `dy = noise` so the reduced χ² of a correct model sits near 1.
pub fn synthetic_spectrum(
    xlo: f64,
    xhi: f64,
    step: f64,
    systems: &[(&str, f64, f64, f64)],
    noise: f64,
    seed: u64,
) -> Spectrum {
    let n = ((xhi - xlo) / step).ceil() as usize;
    let x: Vec<f64> = (0..n).map(|i| xlo + i as f64 * step).collect();

    let mut flux = vec![1.0; n];
    for &(series, z, logn, b) in systems {
        let model = ProfileModel::new(series, z, logn, b, RESOL).unwrap();
        let t = model.eval(&x, &model.params());
        for (f, t) in flux.iter_mut().zip(t.iter()) {
            *f *= t;
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, noise).unwrap();
    let y: Vec<f64> = flux.iter().map(|f| f + normal.sample(&mut rng)).collect();
    let dy = vec![noise; n];
    let cont = vec![1.0; n];

    Spectrum::new(x, y, dy, cont).unwrap()
}
