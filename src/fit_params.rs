//! # Pipeline tuning parameters
//!
//! Configuration structs with fluent builders controlling how systems are
//! fitted ([`FitParams`]) and how the doublet grid scan is laid out
//! ([`SlideParams`]). Builders validate at `build()` time so a bad range or
//! budget is rejected before any spectrum is touched.

use crate::constants::{KmPerSec, LogColumnDensity, Redshift};
use crate::specsyst_errors::SpecsystError;
use crate::spectrum::SpecCol;

/// Parameters shared by every fitting operation.
///
/// Defaults
/// -----------------
/// * `logn = 13.0`, `b = 10.0` km/s, `resol = 70000` — starting guesses.
/// * `maxfev = 100` — model-evaluation budget per fit.
/// * `chi2r_thres = ∞` — accept every converged fit; the residual-refinement
///   loop instead interprets this as the "poor fit" selection threshold, so
///   there it should be set to something finite (2.0 is customary).
/// * `max_trials = 20` — hard cap on refinement iterations per system.
/// * `smooth_std = 10` km/s, `kappa = 3.0` — residual peak detection.
/// * `dz = 5e-5` — coincidence tolerance for residual candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct FitParams {
    pub logn: LogColumnDensity,
    pub b: KmPerSec,
    pub resol: f64,
    pub maxfev: usize,
    pub chi2r_thres: f64,
    pub max_trials: usize,
    pub smooth_std: KmPerSec,
    pub kappa: f64,
    pub dz: f64,
}

impl FitParams {
    pub fn builder() -> FitParamsBuilder {
        FitParamsBuilder::new()
    }
}

impl Default for FitParams {
    fn default() -> Self {
        Self {
            logn: 13.0,
            b: 10.0,
            resol: 70000.0,
            maxfev: 100,
            chi2r_thres: f64::INFINITY,
            max_trials: 20,
            smooth_std: 10.0,
            kappa: 3.0,
            dz: 5e-5,
        }
    }
}

/// Fluent builder for [`FitParams`].
#[derive(Debug, Clone, Default)]
pub struct FitParamsBuilder {
    params: FitParams,
}

impl FitParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logn(mut self, v: LogColumnDensity) -> Self {
        self.params.logn = v;
        self
    }

    pub fn b(mut self, v: KmPerSec) -> Self {
        self.params.b = v;
        self
    }

    pub fn resol(mut self, v: f64) -> Self {
        self.params.resol = v;
        self
    }

    pub fn maxfev(mut self, v: usize) -> Self {
        self.params.maxfev = v;
        self
    }

    pub fn chi2r_thres(mut self, v: f64) -> Self {
        self.params.chi2r_thres = v;
        self
    }

    pub fn max_trials(mut self, v: usize) -> Self {
        self.params.max_trials = v;
        self
    }

    pub fn smooth_std(mut self, v: KmPerSec) -> Self {
        self.params.smooth_std = v;
        self
    }

    pub fn kappa(mut self, v: f64) -> Self {
        self.params.kappa = v;
        self
    }

    pub fn dz(mut self, v: f64) -> Self {
        self.params.dz = v;
        self
    }

    /// Validate and build.
    ///
    /// Return
    /// ----------
    /// * [`FitParams`], or [`SpecsystError::InvalidParameter`] naming the
    ///   offending field.
    pub fn build(self) -> Result<FitParams, SpecsystError> {
        let p = self.params;
        if !(p.logn.is_finite() && (5.0..=25.0).contains(&p.logn)) {
            return Err(SpecsystError::InvalidParameter(format!(
                "logn out of range: {}",
                p.logn
            )));
        }
        if !(p.b.is_finite() && p.b > 0.0) {
            return Err(SpecsystError::InvalidParameter(format!(
                "b must be positive: {}",
                p.b
            )));
        }
        if p.maxfev == 0 {
            return Err(SpecsystError::InvalidParameter(
                "maxfev must be at least 1".into(),
            ));
        }
        if p.max_trials == 0 {
            return Err(SpecsystError::InvalidParameter(
                "max_trials must be at least 1".into(),
            ));
        }
        if !(p.smooth_std.is_finite() && p.smooth_std > 0.0) {
            return Err(SpecsystError::InvalidParameter(format!(
                "smooth_std must be positive: {}",
                p.smooth_std
            )));
        }
        if !(p.dz.is_finite() && p.dz > 0.0) {
            return Err(SpecsystError::InvalidParameter(format!(
                "dz must be positive: {}",
                p.dz
            )));
        }
        Ok(p)
    }
}

/// One axis of the slide grid: `start` inclusive, `end` exclusive, `step`
/// positive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridAxis {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl GridAxis {
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        Self { start, end, step }
    }

    /// Materialize the axis values, `numpy.arange`-style.
    pub fn values(&self) -> Vec<f64> {
        let mut out = Vec::new();
        let mut i = 0usize;
        loop {
            let v = self.start + i as f64 * self.step;
            if v >= self.end {
                break;
            }
            out.push(v);
            i += 1;
        }
        out
    }

    fn validate(&self, name: &str) -> Result<(), SpecsystError> {
        if !(self.start.is_finite() && self.end.is_finite() && self.step.is_finite()) {
            return Err(SpecsystError::InvalidParameter(format!(
                "{name} axis has non-finite bounds"
            )));
        }
        if self.step <= 0.0 {
            return Err(SpecsystError::InvalidParameter(format!(
                "{name} axis step must be positive: {}",
                self.step
            )));
        }
        if self.end <= self.start {
            return Err(SpecsystError::InvalidParameter(format!(
                "{name} axis is empty: [{}, {})",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// Layout of the doublet grid scan.
///
/// Defaults match the customary scan: redshift step 5e-4, a single column
/// density around logN = 14, Doppler parameters 10–15 km/s in steps of 5,
/// testing against the de-absorbed column.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideParams {
    /// Redshift axis (inner scan loop).
    pub z: GridAxis,
    /// log column density axis (outer loop).
    pub logn: GridAxis,
    /// Doppler broadening axis (middle loop).
    pub b: GridAxis,
    /// Instrumental resolving power of the templates.
    pub resol: f64,
    /// Column the templates are scored against.
    pub col: SpecCol,
}

impl SlideParams {
    pub fn builder() -> SlideParamsBuilder {
        SlideParamsBuilder::new()
    }
}

impl Default for SlideParams {
    fn default() -> Self {
        Self {
            z: GridAxis::new(1.13, 1.71, 5e-4),
            logn: GridAxis::new(14.0, 14.1, 0.1),
            b: GridAxis::new(10.0, 15.0, 5.0),
            resol: 70000.0,
            col: SpecCol::Deabs,
        }
    }
}

/// Fluent builder for [`SlideParams`].
#[derive(Debug, Clone, Default)]
pub struct SlideParamsBuilder {
    params: SlideParams,
}

impl SlideParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn z(mut self, start: Redshift, end: Redshift, step: f64) -> Self {
        self.params.z = GridAxis::new(start, end, step);
        self
    }

    pub fn logn(mut self, start: LogColumnDensity, end: LogColumnDensity, step: f64) -> Self {
        self.params.logn = GridAxis::new(start, end, step);
        self
    }

    pub fn b(mut self, start: KmPerSec, end: KmPerSec, step: f64) -> Self {
        self.params.b = GridAxis::new(start, end, step);
        self
    }

    pub fn resol(mut self, v: f64) -> Self {
        self.params.resol = v;
        self
    }

    pub fn col(mut self, v: SpecCol) -> Self {
        self.params.col = v;
        self
    }

    pub fn build(self) -> Result<SlideParams, SpecsystError> {
        let p = self.params;
        p.z.validate("z")?;
        p.logn.validate("logN")?;
        p.b.validate("b")?;
        Ok(p)
    }
}

#[cfg(test)]
mod test_fit_params {
    use super::*;

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(FitParams::builder().b(-1.0).build().is_err());
        assert!(FitParams::builder().maxfev(0).build().is_err());
        assert!(FitParams::builder().logn(30.0).build().is_err());
        assert!(FitParams::builder().maxfev(50).logn(14.0).build().is_ok());
    }

    #[test]
    fn test_grid_axis_values_end_exclusive() {
        let ax = GridAxis::new(10.0, 15.0, 5.0);
        assert_eq!(ax.values(), vec![10.0]);
        let ax = GridAxis::new(14.0, 14.25, 0.1);
        assert_eq!(ax.values().len(), 3);
    }

    #[test]
    fn test_slide_builder_rejects_empty_axis() {
        assert!(SlideParams::builder().z(1.8, 1.2, 5e-4).build().is_err());
        assert!(SlideParams::builder().b(10.0, 15.0, 0.0).build().is_err());
    }
}
