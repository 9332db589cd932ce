//! # Spectrum storage and the multiplicative model recompute
//!
//! This module holds the observed spectrum and the derived curves the
//! pipeline maintains while systems are added, fitted and removed:
//!
//! - the **model** column: continuum × product of every distinct fitted
//!   model's transmission, defined over the *safe* (finite, positive-error)
//!   samples and created lazily the first time a recompute runs;
//! - the **de-absorbed** column: `cont + y − model`, the observed flux with
//!   the modeled absorption put back, continuum-referenced.
//!
//! ## Recompute discipline
//!
//! [`Spectrum::recompute`] is a pure function of (continuum, sample grid,
//! per-system fitted parameters): it is **not** triggered automatically.
//! Callers must invoke it after every committed registry mutation (add,
//! update, clean, rollback) and before any downstream read of the model or
//! de-absorbed columns. Calling it twice in a row without an intervening
//! registry mutation is a bit-identical no-op.
//!
//! ## Frames
//!
//! [`Spectrum::shift_rf`] reframes the wavelength axis to the rest frame of a
//! redshift `z`. The observed-frame grid is retained, so shifting to `z` and
//! back to `0` reproduces the original axis exactly.

use tracing::{debug, trace};

use crate::constants::{KmPerSec, Nanometer, Redshift, VLIGHT};
use crate::line_list::{Line, LineList};
use crate::specsyst_errors::SpecsystError;
use crate::syst_list::SystList;

/// Half-width of the Gaussian smoothing kernel in standard deviations.
const KERNEL_HALF_WIDTH: f64 = 5.0;

/// Named column of a [`Spectrum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecCol {
    /// Observed flux.
    Y,
    /// Flux error.
    Dy,
    /// Continuum estimate.
    Cont,
    /// Cumulative multiplicative model (lazily created).
    Model,
    /// De-absorbed flux (lazily created).
    Deabs,
    /// Output of the last Gaussian convolution.
    Conv,
}

impl SpecCol {
    fn name(self) -> &'static str {
        match self {
            SpecCol::Y => "y",
            SpecCol::Dy => "dy",
            SpecCol::Cont => "cont",
            SpecCol::Model => "model",
            SpecCol::Deabs => "deabs",
            SpecCol::Conv => "conv",
        }
    }
}

/// An observed spectrum with its derived model columns.
///
/// Columns are stored struct-of-arrays; the optional ones (`model`, `deabs`,
/// `conv`) exist only once the corresponding step has run. The boolean safe
/// mask marks the samples the pipeline is allowed to touch: non-finite
/// values, non-positive errors and non-positive continuum samples are left
/// untouched by every mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// Wavelength in the current frame, nm.
    x: Vec<Nanometer>,
    /// Wavelength in the observed frame, nm. Never mutated after creation.
    x_obs: Vec<Nanometer>,
    y: Vec<f64>,
    dy: Vec<f64>,
    cont: Vec<f64>,
    model: Option<Vec<f64>>,
    deabs: Option<Vec<f64>>,
    conv: Option<Vec<f64>>,
    safe: Vec<bool>,
    rf_z: Redshift,
}

impl Spectrum {
    /// Build a spectrum from its observed columns.
    ///
    /// Arguments
    /// -----------------
    /// * `x`: observed-frame wavelengths in nm, ascending.
    /// * `y`: observed flux.
    /// * `dy`: flux error per sample.
    /// * `cont`: continuum estimate per sample.
    ///
    /// Return
    /// ----------
    /// * The spectrum, or [`SpecsystError::MismatchedColumns`] when the
    ///   column lengths differ.
    pub fn new(
        x: Vec<Nanometer>,
        y: Vec<f64>,
        dy: Vec<f64>,
        cont: Vec<f64>,
    ) -> Result<Self, SpecsystError> {
        let n = x.len();
        if y.len() != n || dy.len() != n || cont.len() != n {
            return Err(SpecsystError::MismatchedColumns(format!(
                "x: {}, y: {}, dy: {}, cont: {}",
                n,
                y.len(),
                dy.len(),
                cont.len()
            )));
        }
        let safe = (0..n)
            .map(|i| {
                x[i].is_finite()
                    && y[i].is_finite()
                    && dy[i].is_finite()
                    && cont[i].is_finite()
                    && dy[i] > 0.0
                    && cont[i] > 0.0
            })
            .collect();
        Ok(Self {
            x_obs: x.clone(),
            x,
            y,
            dy,
            cont,
            model: None,
            deabs: None,
            conv: None,
            safe,
            rf_z: 0.0,
        })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Wavelengths in the current frame.
    pub fn x(&self) -> &[Nanometer] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn dy(&self) -> &[f64] {
        &self.dy
    }

    pub fn cont(&self) -> &[f64] {
        &self.cont
    }

    pub fn model(&self) -> Option<&[f64]> {
        self.model.as_deref()
    }

    pub fn deabs(&self) -> Option<&[f64]> {
        self.deabs.as_deref()
    }

    pub fn conv(&self) -> Option<&[f64]> {
        self.conv.as_deref()
    }

    pub fn safe(&self) -> &[bool] {
        &self.safe
    }

    /// Redshift of the current rest frame (0 = observed frame).
    pub fn rf_z(&self) -> Redshift {
        self.rf_z
    }

    /// Borrow a column by name, failing for columns not yet computed.
    pub fn column(&self, col: SpecCol) -> Result<&[f64], SpecsystError> {
        match col {
            SpecCol::Y => Ok(&self.y),
            SpecCol::Dy => Ok(&self.dy),
            SpecCol::Cont => Ok(&self.cont),
            SpecCol::Model => self
                .model
                .as_deref()
                .ok_or(SpecsystError::MissingColumn(col.name())),
            SpecCol::Deabs => self
                .deabs
                .as_deref()
                .ok_or(SpecsystError::MissingColumn(col.name())),
            SpecCol::Conv => self
                .conv
                .as_deref()
                .ok_or(SpecsystError::MissingColumn(col.name())),
        }
    }

    /// Wavelength span `(min, max)` of the safe samples in the current frame.
    pub fn span(&self) -> Option<(Nanometer, Nanometer)> {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for (i, &s) in self.safe.iter().enumerate() {
            if s {
                lo = lo.min(self.x[i]);
                hi = hi.max(self.x[i]);
            }
        }
        (lo <= hi).then_some((lo, hi))
    }

    /// Shift the wavelength axis to the rest frame of redshift `z`.
    ///
    /// The current axis becomes `x_obs / (1 + z)`; shifting back to 0
    /// restores the observed-frame axis exactly. Idempotent for equal `z`.
    pub fn shift_rf(&mut self, z: Redshift) {
        for (xc, &xo) in self.x.iter_mut().zip(self.x_obs.iter()) {
            *xc = xo / (1.0 + z);
        }
        self.rf_z = z;
    }

    /// Extract the sub-spectrum with current-frame wavelengths inside
    /// `[xmin, xmax]` (bounds swapped if reversed).
    ///
    /// Return
    /// ----------
    /// * The region as a new spectrum carrying every derived column, or
    ///   [`SpecsystError::InvalidWindow`] when the window misses the domain
    ///   entirely.
    pub fn extract_region(
        &self,
        xmin: Nanometer,
        xmax: Nanometer,
    ) -> Result<Spectrum, SpecsystError> {
        let (lo, hi) = if xmin <= xmax {
            (xmin, xmax)
        } else {
            trace!(xmin, xmax, "swapping reversed extraction bounds");
            (xmax, xmin)
        };
        let idx: Vec<usize> = (0..self.len())
            .filter(|&i| self.x[i] >= lo && self.x[i] <= hi)
            .collect();
        if idx.is_empty() {
            return Err(SpecsystError::InvalidWindow { xmin: lo, xmax: hi });
        }
        let take = |v: &[f64]| idx.iter().map(|&i| v[i]).collect::<Vec<f64>>();
        Ok(Spectrum {
            x: take(&self.x),
            x_obs: take(&self.x_obs),
            y: take(&self.y),
            dy: take(&self.dy),
            cont: take(&self.cont),
            model: self.model.as_deref().map(take),
            deabs: self.deabs.as_deref().map(take),
            conv: self.conv.as_deref().map(take),
            safe: idx.iter().map(|&i| self.safe[i]).collect(),
            rf_z: self.rf_z,
        })
    }

    /// Convolve a column with a Gaussian kernel of standard deviation `std`
    /// in velocity space, writing the result into the `conv` column.
    ///
    /// Only safe samples contribute to (and receive) smoothed values; the
    /// kernel is truncated at [`KERNEL_HALF_WIDTH`] standard deviations and
    /// renormalized per sample, so irregular grids and masked gaps are
    /// handled without edge artifacts.
    pub fn convolve_gauss(&mut self, col: SpecCol, std: KmPerSec) -> Result<(), SpecsystError> {
        let src = self.column(col)?.to_vec();
        let mut out = src.clone();
        let n = self.len();
        for i in 0..n {
            if !self.safe[i] {
                continue;
            }
            let xi = self.x[i];
            let mut acc = 0.0;
            let mut norm = 0.0;
            // Walk outward while inside the truncated kernel support.
            let v_of = |xj: f64| VLIGHT * (xj / xi - 1.0);
            let mut j = i;
            loop {
                let v = v_of(self.x[j]);
                if v.abs() > KERNEL_HALF_WIDTH * std {
                    break;
                }
                if self.safe[j] {
                    let w = (-0.5 * (v / std) * (v / std)).exp();
                    acc += w * src[j];
                    norm += w;
                }
                if j == 0 {
                    break;
                }
                j -= 1;
            }
            let mut j = i + 1;
            while j < n {
                let v = v_of(self.x[j]);
                if v.abs() > KERNEL_HALF_WIDTH * std {
                    break;
                }
                if self.safe[j] {
                    let w = (-0.5 * (v / std) * (v / std)).exp();
                    acc += w * src[j];
                    norm += w;
                }
                j += 1;
            }
            if norm > 0.0 {
                out[i] = acc / norm;
            }
        }
        self.conv = Some(out);
        Ok(())
    }

    /// Find prominent minima of a column and return them as a line list.
    ///
    /// A sample is a peak when it is a strict local minimum of the column and
    /// lies more than `kappa` flux-error standard deviations below the
    /// continuum.
    pub fn find_peaks(&self, col: SpecCol, kappa: f64) -> Result<LineList, SpecsystError> {
        let v = self.column(col)?;
        let mut lines = Vec::new();
        for i in 1..self.len().saturating_sub(1) {
            if !(self.safe[i - 1] && self.safe[i] && self.safe[i + 1]) {
                continue;
            }
            if v[i] < v[i - 1] && v[i] < v[i + 1] && self.cont[i] - v[i] > kappa * self.dy[i] {
                lines.push(Line {
                    x: self.x[i],
                    xmin: self.x[i - 1],
                    xmax: self.x[i + 1],
                    y: v[i],
                    dy: self.dy[i],
                });
            }
        }
        Ok(LineList::new(lines))
    }

    /// Recompute the model and de-absorbed columns from the registry.
    ///
    /// The model column is the continuum times the product of every distinct
    /// model's transmission evaluated over the full safe grid (rows sharing a
    /// joint model contribute it once); the de-absorbed column
    /// is `cont + y − model`. Both columns are created lazily on the first
    /// call (model filled with the continuum, de-absorbed with the raw flux)
    /// and are only ever written inside the safe mask.
    pub fn recompute(&mut self, systs: &SystList) {
        if self.model.is_none() {
            debug!("creating model column from continuum");
            self.model = Some(self.cont.clone());
        }
        if self.deabs.is_none() {
            self.deabs = Some(self.y.clone());
        }
        let idx: Vec<usize> = (0..self.len()).filter(|&i| self.safe[i]).collect();
        let xs: Vec<f64> = idx.iter().map(|&i| self.x[i]).collect();

        if let Some(model) = self.model.as_mut() {
            for &i in &idx {
                model[i] = self.cont[i];
            }
            for m in systs.iter_unique_models() {
                let ys = m.eval(&xs, &m.params());
                for (k, &i) in idx.iter().enumerate() {
                    model[i] *= ys[k];
                }
            }
        }
        if let Some(deabs) = self.deabs.as_mut() {
            if let Some(model) = self.model.as_deref() {
                for &i in &idx {
                    deabs[i] = self.cont[i] + self.y[i] - model[i];
                }
            }
        }
    }
}
