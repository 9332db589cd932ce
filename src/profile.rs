//! # Voigt absorption-profile model
//!
//! This module builds an **evaluable transmission profile** for an absorption
//! system: one or more Voigt components (each a redshift, log column density,
//! Doppler broadening triple), replicated over every transition of a series
//! and convolved with the instrumental line-spread function.
//!
//! ## Overview
//!
//! - [`VoigtComponent`] – the (z, logN, b) parameter triple of one component
//! - [`ProfileModel`] – a series + resolution + component list with a
//!   wavelength window, evaluable at arbitrary sample points
//!
//! [`ProfileModel::eval`] is deterministic and side-effect-free: it is the
//! function handed to the optimizer, and the function the spectrum recompute
//! step calls with each system's fitted parameters.
//!
//! ## Profile shape
//!
//! For a component with column density `N = 10^logN` and broadening `b`, each
//! transition contributes an optical depth
//!
//! ```text
//! τ(λ) = √π · (e²/mₑc) · f · λ₀ / b · N · H(a, u)
//! ```
//!
//! with `u` the offset from the redshifted line center in Doppler widths and
//! `a` the damping parameter. `H(a, u)` is approximated with the pseudo-Voigt
//! blend of a Gaussian and a Lorentzian of matched width (Thompson–Cox–
//! Hastings mixing), accurate to ~1% which is well below the flux errors the
//! pipeline fits against. The transmitted fraction `exp(−Στ)` is then
//! convolved with a Gaussian of FWHM `λ/resol` by Gauss–Hermite quadrature.
use std::f64::consts::PI;

use crate::constants::{
    KmPerSec, LogColumnDensity, Nanometer, Redshift, E2_MEC, FIT_WINDOW_KMS, FWHM_TO_SIGMA,
    KMS_TO_CMS, NM_TO_CM, OVERSAMPLE, SQRT_PI, VLIGHT,
};
use crate::specsyst_errors::SpecsystError;
use crate::transitions::{series_transitions, SeriesTransitions};

/// Gauss–Hermite nodes for the instrumental convolution (7-point rule).
const GH_NODES: [f64; 7] = [
    -2.651_961_356_835_233,
    -1.673_551_628_767_471,
    -0.816_287_882_858_964_7,
    0.0,
    0.816_287_882_858_964_7,
    1.673_551_628_767_471,
    2.651_961_356_835_233,
];

/// Gauss–Hermite weights matching [`GH_NODES`]; they sum to √π.
const GH_WEIGHTS: [f64; 7] = [
    0.000_971_781_245_099_519_2,
    0.054_515_582_819_127_03,
    0.425_607_252_610_127_8,
    0.810_264_617_556_807_3,
    0.425_607_252_610_127_8,
    0.054_515_582_819_127_03,
    0.000_971_781_245_099_519_2,
];

/// Parameter triple of one Voigt component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoigtComponent {
    /// Redshift of the component.
    pub z: Redshift,
    /// log₁₀ of the column density in cm⁻².
    pub logn: LogColumnDensity,
    /// Doppler broadening in km/s.
    pub b: KmPerSec,
}

/// Evaluable absorption profile of one system.
///
/// A model owns the transitions of its series, the instrumental resolution,
/// and a list of components **sharing one redshift anchor region**: the first
/// component is the one the owning registry row describes, later components
/// are added by the residual-refinement loop.
///
/// The wavelength window brackets the outermost redshifted transitions of all
/// components plus a [`FIT_WINDOW_KMS`] velocity margin on each side.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileModel {
    series: String,
    transitions: SeriesTransitions,
    resol: f64,
    components: Vec<VoigtComponent>,
    xmin: Nanometer,
    xmax: Nanometer,
}

impl ProfileModel {
    /// Build a single-component model for `series` at a guess redshift.
    ///
    /// Arguments
    /// -----------------
    /// * `series`: series identifier (see [`crate::transitions::known_series`]).
    /// * `z`: guess redshift of the component.
    /// * `logn`: guess log column density.
    /// * `b`: guess Doppler broadening in km/s.
    /// * `resol`: instrumental resolving power λ/Δλ (≤ 0 disables the
    ///   instrumental convolution).
    ///
    /// Return
    /// ----------
    /// * The model, or [`SpecsystError::UnknownSeries`].
    pub fn new(
        series: &str,
        z: Redshift,
        logn: LogColumnDensity,
        b: KmPerSec,
        resol: f64,
    ) -> Result<Self, SpecsystError> {
        let transitions = series_transitions(series)
            .ok_or_else(|| SpecsystError::UnknownSeries(series.to_string()))?;
        let components = vec![VoigtComponent { z, logn, b }];
        let (xmin, xmax) = window_of(&transitions, &components);
        Ok(Self {
            series: series.to_string(),
            transitions,
            resol,
            components,
            xmin,
            xmax,
        })
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub fn resol(&self) -> f64 {
        self.resol
    }

    pub fn components(&self) -> &[VoigtComponent] {
        &self.components
    }

    /// Current wavelength window `(xmin, xmax)` in nm.
    pub fn window(&self) -> (Nanometer, Nanometer) {
        (self.xmin, self.xmax)
    }

    /// Append a component and widen the window to cover it.
    pub fn add_component(&mut self, comp: VoigtComponent) {
        self.components.push(comp);
        let (xmin, xmax) = window_of(&self.transitions, &self.components);
        self.xmin = xmin;
        self.xmax = xmax;
    }

    /// Flattened parameter vector `[z, logN, b]` per component, in component
    /// order. This is the layout [`eval`](Self::eval) and the fitter expect.
    pub fn params(&self) -> Vec<f64> {
        let mut p = Vec::with_capacity(3 * self.components.len());
        for c in &self.components {
            p.push(c.z);
            p.push(c.logn);
            p.push(c.b);
        }
        p
    }

    /// Write a flattened parameter vector back into the component list.
    pub fn set_params(&mut self, params: &[f64]) {
        debug_assert_eq!(params.len(), 3 * self.components.len());
        for (c, chunk) in self.components.iter_mut().zip(params.chunks_exact(3)) {
            c.z = chunk[0];
            c.logn = chunk[1];
            c.b = chunk[2];
        }
        let (xmin, xmax) = window_of(&self.transitions, &self.components);
        self.xmin = xmin;
        self.xmax = xmax;
    }

    /// Internal fine sample grid spanning the window, spaced at
    /// [`OVERSAMPLE`] samples per resolution element. Used to build doublet
    /// templates for the grid scan.
    pub fn fine_grid(&self) -> Vec<Nanometer> {
        let xc = 0.5 * (self.xmin + self.xmax);
        let step = if self.resol > 0.0 {
            xc / (self.resol * OVERSAMPLE)
        } else {
            (self.xmax - self.xmin) / 500.0
        };
        let n = ((self.xmax - self.xmin) / step).ceil() as usize + 1;
        (0..n).map(|i| self.xmin + i as f64 * step).collect()
    }

    /// Evaluate the transmitted flux fraction at the given sample points.
    ///
    /// Arguments
    /// -----------------
    /// * `xs`: wavelengths in nm (any frame-consistent grid; not limited to
    ///   the model window).
    /// * `params`: flattened `[z, logN, b]` triples, one per component. Must
    ///   match the component count; pass [`params`](Self::params) to evaluate
    ///   at the stored values.
    ///
    /// Return
    /// ----------
    /// * Transmission values, one per sample. Deterministic, no side effects.
    pub fn eval(&self, xs: &[f64], params: &[f64]) -> Vec<f64> {
        debug_assert_eq!(params.len(), 3 * self.components.len());
        xs.iter().map(|&x| self.eval_at(x, params)).collect()
    }

    fn eval_at(&self, x: f64, params: &[f64]) -> f64 {
        if self.resol <= 0.0 {
            return self.transmission(x, params);
        }
        let sigma = x / (self.resol * FWHM_TO_SIGMA);
        let mut acc = 0.0;
        for (h, w) in GH_NODES.iter().zip(GH_WEIGHTS.iter()) {
            acc += w * self.transmission(x + std::f64::consts::SQRT_2 * sigma * h, params);
        }
        acc / SQRT_PI
    }

    /// Unconvolved transmission `exp(−Στ)` at one wavelength.
    fn transmission(&self, x: f64, params: &[f64]) -> f64 {
        let mut tau = 0.0;
        for chunk in params.chunks_exact(3) {
            let (z, logn, b) = (chunk[0], chunk[1], chunk[2]);
            let n = 10f64.powf(logn);
            for t in &self.transitions {
                let lam_c = t.wave * (1.0 + z);
                let dld = lam_c * b / VLIGHT;
                let u = (x - lam_c) / dld;
                let a = t.gamma * (t.wave * NM_TO_CM) / (4.0 * PI * b * KMS_TO_CMS);
                let tau0 = SQRT_PI * E2_MEC * t.osc * (t.wave * NM_TO_CM) / (b * KMS_TO_CMS);
                tau += tau0 * n * voigt_h(a, u);
            }
        }
        (-tau).exp()
    }
}

/// Window bracketing the outermost redshifted transitions of every component,
/// padded by [`FIT_WINDOW_KMS`] on each side.
fn window_of(
    transitions: &SeriesTransitions,
    components: &[VoigtComponent],
) -> (Nanometer, Nanometer) {
    let w = FIT_WINDOW_KMS / VLIGHT;
    let mut xmin = f64::INFINITY;
    let mut xmax = f64::NEG_INFINITY;
    for c in components {
        for t in transitions {
            let lam_c = t.wave * (1.0 + c.z);
            xmin = xmin.min(lam_c * (1.0 - w));
            xmax = xmax.max(lam_c * (1.0 + w));
        }
    }
    (xmin, xmax)
}

/// Voigt function `H(a, u)`, normalized so `H(0, u) = exp(−u²)`.
///
/// Pseudo-Voigt approximation: a Gaussian/Lorentzian blend with the
/// Thompson–Cox–Hastings effective width and mixing parameter.
fn voigt_h(a: f64, u: f64) -> f64 {
    const LN2: f64 = std::f64::consts::LN_2;
    // FWHM of exp(−u²) in u units.
    let fg = 2.0 * LN2.sqrt();
    let fl = 2.0 * a;

    let fg2 = fg * fg;
    let fl2 = fl * fl;
    let fv = (fg2 * fg2 * fg
        + 2.69269 * fg2 * fg2 * fl
        + 2.42843 * fg2 * fg * fl2
        + 4.47163 * fg2 * fl2 * fl
        + 0.07842 * fg * fl2 * fl2
        + fl2 * fl2 * fl)
        .powf(0.2);
    let r = fl / fv;
    let eta = r * (1.36603 - r * (0.47719 - r * 0.11116));

    let gauss = (2.0 / fv) * (LN2 / PI).sqrt() * (-4.0 * LN2 * u * u / (fv * fv)).exp();
    let lorentz = (2.0 / (PI * fv)) / (1.0 + 4.0 * u * u / (fv * fv));
    SQRT_PI * (eta * lorentz + (1.0 - eta) * gauss)
}
