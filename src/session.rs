//! # Analysis session
//!
//! ## Overview
//!
//! A [`Session`] owns one spectrum, an optional detected line list and an
//! optional system registry, and exposes the four documented ways of adding
//! absorption systems:
//!
//! - [`Session::add_syst`] fits a single system at a user-chosen redshift;
//! - [`Session::add_syst_from_lines`] scans the line list for redshifts
//!   where every transition of a series has a matching line, and fits one
//!   system per candidate;
//! - [`Session::add_syst_from_resids`] revisits badly fitted systems and
//!   grows their models one component at a time from the residuals, rolling
//!   the registry back whenever a trial does not improve the fit;
//! - [`Session::add_syst_slide`] slides a synthetic doublet template across
//!   the spectrum on a (logN, b, z) grid and fits the local χ² minima.
//!
//! Every operation leaves the spectrum's model and de-absorbed columns
//! consistent with the registry before returning. Batch operations isolate
//! per-candidate failures: one bad window or one diverging fit never aborts
//! the rest of the batch.
//!
//! ## See also
//!
//! * [`crate::syst_list`] for the registry and its transaction semantics.
//! * [`crate::slide`] for the template scan primitives.

use camino::Utf8Path;
use itertools::iproduct;
use ordered_float::OrderedFloat;
use tracing::{debug, info, warn};

use crate::constants::{KmPerSec, Redshift, SystId};
use crate::fit_params::{FitParams, SlideParams};
use crate::fitter::fit_profile;
use crate::line_list::LineList;
use crate::profile::{ProfileModel, VoigtComponent};
use crate::slide::{create_doublet, observable_z_range, test_doublet, Chi2Grid};
use crate::specsyst_errors::SpecsystError;
use crate::spectrum::{SpecCol, Spectrum};
use crate::syst_list::SystList;
use crate::transitions::series_transitions;

/// Half-width, in redshift, of the spectral region a refinement pass
/// inspects around a poorly fitted system.
const REFINE_WINDOW_DZ: f64 = 1e-3;

/// Report for one system visited by [`Session::add_syst_from_resids`].
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    /// Id of the revisited system.
    pub id: SystId,
    /// Series of the revisited system.
    pub series: String,
    /// Redshift the system had when the pass started.
    pub z: Redshift,
    /// Reduced χ² when the pass started.
    pub chi2r_start: f64,
    /// Reduced χ² when the pass ended.
    pub chi2r_final: f64,
    /// Number of components accepted into the system's model.
    pub added: usize,
}

impl RefineOutcome {
    /// Whether the pass committed at least one new component.
    pub fn improved(&self) -> bool {
        self.added > 0
    }
}

/// Report for one [`Session::add_syst_slide`] scan.
#[derive(Debug)]
pub struct SlideOutcome {
    /// Grid points scored.
    pub tested: usize,
    /// Grid points that passed the doublet acceptance test.
    pub coincidences: usize,
    /// Local χ² minima selected as fit seeds.
    pub candidates: usize,
    /// Per-candidate fit results, best grid score first.
    pub fitted: Vec<(Redshift, Result<SystId, SpecsystError>)>,
}

/// One spectrum plus the state the pipeline accumulates around it.
#[derive(Debug, Clone)]
pub struct Session {
    spec: Spectrum,
    lines: Option<LineList>,
    systs: Option<SystList>,
}

impl Session {
    /// Start a session around a spectrum, with no lines and no systems.
    pub fn new(spec: Spectrum) -> Self {
        Self {
            spec,
            lines: None,
            systs: None,
        }
    }

    /// Attach a pre-built line list (replaces any existing one).
    pub fn set_lines(&mut self, lines: LineList) {
        self.lines = Some(lines);
    }

    pub fn spec(&self) -> &Spectrum {
        &self.spec
    }

    pub fn lines(&self) -> Option<&LineList> {
        self.lines.as_ref()
    }

    pub fn systs(&self) -> Option<&SystList> {
        self.systs.as_ref()
    }

    /// Recompute the spectrum's model and de-absorbed columns from the
    /// current registry. No-op while no system has ever been added.
    pub fn refresh(&mut self) {
        if let Some(systs) = &self.systs {
            self.spec.recompute(systs);
        }
    }

    /// Detect absorption lines in the flux column.
    ///
    /// The flux is smoothed with a Gaussian of standard deviation `std`
    /// (km/s) and strict local minima deeper than `kappa` times the local
    /// flux error are collected.
    ///
    /// Arguments
    /// -----------------
    /// * `std`: smoothing kernel standard deviation in km/s.
    /// * `kappa`: prominence threshold in units of the flux error.
    /// * `append`: merge into the existing line list instead of replacing it.
    ///
    /// Return
    /// ----------
    /// * The number of lines detected by this call.
    pub fn find_lines(
        &mut self,
        std: KmPerSec,
        kappa: f64,
        append: bool,
    ) -> Result<usize, SpecsystError> {
        self.spec.convolve_gauss(SpecCol::Y, std)?;
        let peaks = self.spec.find_peaks(SpecCol::Conv, kappa)?;
        let found = peaks.len();
        match (&mut self.lines, append) {
            (Some(lines), true) => lines.append(peaks),
            _ => self.lines = Some(peaks),
        }
        info!(found, kappa, "detected lines");
        Ok(found)
    }

    /// Fit one new system of `series` at redshift `z`.
    ///
    /// A placeholder row is created before the fit, so a diverging fit
    /// leaves a χ²ᵣ = ∞ row behind; the threshold clean at the end of this
    /// operation removes it again unless the threshold is infinite.
    ///
    /// Return
    /// ----------
    /// * The id of the fitted system, or the fit/window error.
    pub fn add_syst(
        &mut self,
        series: &str,
        z: Redshift,
        fp: &FitParams,
    ) -> Result<SystId, SpecsystError> {
        let res = self.fit_syst(series, z, fp);
        if let Some(systs) = self.systs.as_mut() {
            systs.clean(fp.chi2r_thres);
        }
        self.refresh();
        match &res {
            Ok(id) => info!(series, z, id, "added system"),
            Err(e) => debug!(series, z, error = %e, "system fit failed"),
        }
        res
    }

    /// Fit one system per candidate redshift found in the line list.
    ///
    /// Candidates are redshifts where **every** transition of `series` has a
    /// detected line within `dz`, walked from `z_start` toward `z_end`
    /// (either direction). An empty candidate set is a normal outcome, not
    /// an error; per-candidate fit failures are reported in place and never
    /// abort the batch.
    ///
    /// Return
    /// ----------
    /// * One `(redshift, fit result)` pair per candidate, in scan order.
    pub fn add_syst_from_lines(
        &mut self,
        series: &str,
        z_start: Redshift,
        z_end: Redshift,
        dz: f64,
        fp: &FitParams,
    ) -> Result<Vec<(Redshift, Result<SystId, SpecsystError>)>, SpecsystError> {
        let lines = self.lines.as_ref().ok_or(SpecsystError::NoLineList)?;
        let z_cand = lines.syst_cand(series, z_start, z_end, dz)?;
        info!(series, candidates = z_cand.len(), "line-list candidate scan");

        let mut fitted = Vec::with_capacity(z_cand.len());
        for z in z_cand {
            let res = self.fit_syst(series, z, fp);
            if let Err(e) = &res {
                debug!(z, error = %e, "candidate fit failed, continuing");
            }
            fitted.push((z, res));
        }
        if let Some(systs) = self.systs.as_mut() {
            systs.clean(fp.chi2r_thres);
        }
        self.refresh();
        Ok(fitted)
    }

    /// Refine every system whose χ²ᵣ exceeds the threshold by growing its
    /// model from the residuals.
    ///
    /// For each poor system, the de-absorbed column is smoothed and searched
    /// for leftover lines inside a ±10⁻³ redshift window around the system;
    /// the strongest candidate (or the system's own redshift when none is
    /// found) seeds a joint refit of the system's model plus one new
    /// component. A trial is committed only when it converges to a finite
    /// χ²ᵣ that does not exceed the previous one; otherwise the registry is
    /// rolled back to its pre-trial snapshot and the system's pass ends.
    ///
    /// Arguments
    /// -----------------
    /// * `z_start`, `z_end`: redshift interval candidate lines must fall in.
    /// * `fp`: fit parameters; `smooth_std`, `kappa`, `dz`, `chi2r_thres`
    ///   and `max_trials` drive the loop.
    ///
    /// Return
    /// ----------
    /// * One [`RefineOutcome`] per visited system, in table order.
    pub fn add_syst_from_resids(
        &mut self,
        z_start: Redshift,
        z_end: Redshift,
        fp: &FitParams,
    ) -> Result<Vec<RefineOutcome>, SpecsystError> {
        let poor = match &self.systs {
            Some(systs) => systs.above_threshold(fp.chi2r_thres),
            None => Vec::new(),
        };
        info!(poor = poor.len(), thres = fp.chi2r_thres, "refining residuals");
        self.refresh();

        let mut outcomes = Vec::with_capacity(poor.len());
        for sys in poor {
            let Some(transitions) = series_transitions(&sys.series) else {
                warn!(series = %sys.series, id = sys.id, "unknown series in registry, skipped");
                continue;
            };
            let xmin = (1.0 + sys.z - REFINE_WINDOW_DZ) * transitions[0].wave;
            let xmax = (1.0 + sys.z + REFINE_WINDOW_DZ) * transitions[transitions.len() - 1].wave;

            let mut chi2r_old = sys.chi2r;
            let mut added = 0usize;
            loop {
                let z_cand = match self.residual_candidate(xmin, xmax, &sys.series, z_start, z_end, fp)
                {
                    Ok(Some(z)) => z,
                    Ok(None) => sys.z,
                    Err(e) => {
                        debug!(id = sys.id, error = %e, "residual window unusable, pass ends");
                        break;
                    }
                };

                let Some(snap) = self.systs.as_ref().map(|s| s.snapshot()) else {
                    break;
                };
                let trial = self.fit_syst_into(sys.id, z_cand, fp);
                let chi2r_new = self
                    .systs
                    .as_ref()
                    .and_then(|s| s.get(sys.id))
                    .map_or(f64::INFINITY, |s| s.chi2r);

                let accept = trial.is_ok() && chi2r_new.is_finite() && chi2r_new <= chi2r_old;
                if !accept {
                    if let Some(systs) = self.systs.as_mut() {
                        systs.restore(snap);
                    }
                    self.refresh();
                    debug!(id = sys.id, z_cand, chi2r_new, "trial rejected, rolled back");
                    break;
                }

                chi2r_old = chi2r_new;
                added += 1;
                self.refresh();
                debug!(id = sys.id, z_cand, chi2r = chi2r_new, "trial committed");
                if chi2r_new < fp.chi2r_thres || added >= fp.max_trials {
                    break;
                }
            }

            let chi2r_final = self
                .systs
                .as_ref()
                .and_then(|s| s.get(sys.id))
                .map_or(f64::INFINITY, |s| s.chi2r);
            info!(
                id = sys.id,
                added,
                chi2r_start = sys.chi2r,
                chi2r_final,
                "residual pass done"
            );
            outcomes.push(RefineOutcome {
                id: sys.id,
                series: sys.series.clone(),
                z: sys.z,
                chi2r_start: sys.chi2r,
                chi2r_final,
                added,
            });
        }
        Ok(outcomes)
    }

    /// Slide a doublet template over a (logN, b, z) grid and fit the
    /// surviving local minima.
    ///
    /// Previously fitted systems are set aside during the scan, so the scan
    /// scores the de-absorbed column against fresh templates only, and are
    /// merged back (ids untouched) before the final recompute.
    ///
    /// Return
    /// ----------
    /// * A [`SlideOutcome`] with the scan statistics and per-candidate fits.
    pub fn add_syst_slide(
        &mut self,
        series: &str,
        sp: &SlideParams,
        fp: &FitParams,
    ) -> Result<SlideOutcome, SpecsystError> {
        let z_values = observable_z_range(&self.spec, series, &sp.z.values())?;
        let logn_values = sp.logn.values();
        let b_values = sp.b.values();
        if z_values.is_empty() {
            info!(series, "no observable redshift range, nothing to scan");
            return Ok(SlideOutcome {
                tested: 0,
                coincidences: 0,
                candidates: 0,
                fitted: Vec::new(),
            });
        }

        // The scored column is captured up front; its values stay aligned
        // with the wavelength axis across rest-frame shifts. Without a
        // registry there is no de-absorbed column yet, the raw flux stands
        // in for it.
        let col_values: Vec<f64> = match self.spec.column(sp.col) {
            Ok(v) => v.to_vec(),
            Err(_) if sp.col == SpecCol::Deabs => self.spec.y().to_vec(),
            Err(e) => return Err(e),
        };

        let systs_old = self.systs.take();
        let id_start = systs_old.as_ref().map_or(0, |s| s.next_id());
        self.systs = Some(SystList::with_id_start(id_start));

        let mut grid = Chi2Grid::new(logn_values.len(), b_values.len(), z_values.len());
        let mut tested = 0usize;
        #[cfg(feature = "progress")]
        let bar = indicatif::ProgressBar::new(
            (logn_values.len() * b_values.len() * z_values.len()) as u64,
        );

        for ((il, &logn), (ib, &b)) in
            iproduct!(logn_values.iter().enumerate(), b_values.iter().enumerate())
        {
            let template = create_doublet(series, logn, b, sp.resol)?;
            for (iz, &z) in z_values.iter().enumerate() {
                self.spec.shift_rf(z);
                let (accepted, chi2, _) = test_doublet(&self.spec, &template, &col_values);
                tested += 1;
                if accepted {
                    grid.set(il, ib, iz, chi2);
                }
                #[cfg(feature = "progress")]
                bar.inc(1);
            }
            debug!(series, logn, b, "template row scanned");
        }
        self.spec.shift_rf(0.0);
        #[cfg(feature = "progress")]
        bar.finish_and_clear();

        // Best grid score first, so the strongest candidates claim the
        // lowest ids.
        let mut minima = grid.local_minima();
        minima.sort_by_key(|&(il, ib, iz)| OrderedFloat(grid.get(il, ib, iz)));
        info!(
            series,
            tested,
            coincidences = grid.coincidences(),
            candidates = minima.len(),
            "doublet scan done"
        );

        let mut fitted = Vec::with_capacity(minima.len());
        for &(il, ib, iz) in &minima {
            let z = z_values[iz];
            let seed = FitParams {
                logn: logn_values[il],
                b: b_values[ib],
                resol: sp.resol,
                ..fp.clone()
            };
            let res = self.fit_syst(series, z, &seed);
            if let Err(e) = &res {
                debug!(z, error = %e, "candidate fit failed, continuing");
            }
            fitted.push((z, res));
        }

        if let Some(systs) = self.systs.as_mut() {
            systs.clean(fp.chi2r_thres);
        }
        if let Some(old) = systs_old {
            if let Some(systs) = self.systs.as_mut() {
                systs.append(old, false);
            }
        }
        self.refresh();

        Ok(SlideOutcome {
            tested,
            coincidences: grid.coincidences(),
            candidates: minima.len(),
            fitted,
        })
    }

    /// Write the registry's row table to `path` (an empty table when no
    /// system was ever added).
    pub fn save_systs(&self, path: &Utf8Path) -> Result<(), SpecsystError> {
        match &self.systs {
            Some(systs) => systs.save(path),
            None => SystList::new().save(path),
        }
    }

    /// Replace the registry with the table saved at `path`.
    ///
    /// Models are rebuilt from the row parameters (one component each), ids
    /// and χ²ᵣ values are kept, and the spectrum columns are recomputed.
    ///
    /// Return
    /// ----------
    /// * The number of rows loaded.
    pub fn load_systs(&mut self, path: &Utf8Path) -> Result<usize, SpecsystError> {
        let rows = SystList::load_table(path)?;
        let mut systs = SystList::new();
        for row in rows {
            let model = ProfileModel::new(&row.series, row.z, row.logn, row.b, row.resol)?;
            systs.insert_row(row, model);
        }
        let loaded = systs.len();
        systs.check_integrity()?;
        self.systs = Some(systs);
        self.refresh();
        info!(loaded, %path, "loaded registry table");
        Ok(loaded)
    }

    /// Continuum-normalized safe samples inside `[xmin, xmax]`.
    ///
    /// Fails with [`SpecsystError::InvalidWindow`] when fewer than
    /// `min_points` samples survive.
    fn window_data(
        &self,
        xmin: f64,
        xmax: f64,
        min_points: usize,
    ) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), SpecsystError> {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut dys = Vec::new();
        for i in 0..self.spec.len() {
            let x = self.spec.x()[i];
            if self.spec.safe()[i] && x >= xmin && x <= xmax {
                xs.push(x);
                ys.push(self.spec.y()[i] / self.spec.cont()[i]);
                dys.push(self.spec.dy()[i] / self.spec.cont()[i]);
            }
        }
        if xs.len() < min_points {
            return Err(SpecsystError::InvalidWindow { xmin, xmax });
        }
        Ok((xs, ys, dys))
    }

    /// Fit a fresh single-component system and register it.
    ///
    /// The row exists from the moment the fit is attempted: a diverging fit
    /// leaves it behind with χ²ᵣ = ∞ for the caller's threshold clean.
    fn fit_syst(
        &mut self,
        series: &str,
        z: Redshift,
        fp: &FitParams,
    ) -> Result<SystId, SpecsystError> {
        let model = ProfileModel::new(series, z, fp.logn, fp.b, fp.resol)?;
        let (xmin, xmax) = model.window();
        let (xs, ys, dys) = self.window_data(xmin, xmax, model.params().len() + 2)?;

        let systs = self.systs.get_or_insert_with(SystList::new);
        let id = systs.add(series, z, fp.logn, fp.b, fp.resol, model.clone());
        match fit_profile(&model, &xs, &ys, &dys, fp.maxfev) {
            Ok(out) => {
                let mut fitted = model;
                fitted.set_params(&out.params);
                systs.update(id, fitted, 0, out.chi2r)?;
                Ok(id)
            }
            Err(e) => {
                systs.mark_failed(id)?;
                Err(e)
            }
        }
    }

    /// Joint refit of an existing system's model plus one new component.
    ///
    /// The new component gets its own registry row. Every row already sharing
    /// the target's joint model is refreshed with the refitted model and the
    /// joint χ²ᵣ, since none of them is meaningful without the others; a row
    /// left holding a stale copy would be multiplied into the model column as
    /// a second, distinct transmission. Callers snapshot the registry first.
    fn fit_syst_into(
        &mut self,
        target: SystId,
        z_cand: Redshift,
        fp: &FitParams,
    ) -> Result<SystId, SpecsystError> {
        let (mut joint, series, resol, siblings) = {
            let systs = self.systs.as_ref().ok_or(SpecsystError::UnknownId(target))?;
            let model = systs
                .model_of(target)
                .ok_or(SpecsystError::UnknownId(target))?;
            // Rows sharing the joint model, in table order: component k of
            // the model belongs to the k-th of them.
            let siblings: Vec<SystId> = systs
                .iter()
                .filter(|s| systs.model_of(s.id) == Some(model))
                .map(|s| s.id)
                .collect();
            (
                model.clone(),
                model.series().to_string(),
                model.resol(),
                siblings,
            )
        };
        joint.add_component(VoigtComponent {
            z: z_cand,
            logn: fp.logn,
            b: fp.b,
        });
        let comp = joint.components().len() - 1;
        let (xmin, xmax) = joint.window();
        let (xs, ys, dys) = self.window_data(xmin, xmax, joint.params().len() + 2)?;

        let systs = self.systs.as_mut().ok_or(SpecsystError::UnknownId(target))?;
        let id = systs.add(&series, z_cand, fp.logn, fp.b, resol, joint.clone());
        match fit_profile(&joint, &xs, &ys, &dys, fp.maxfev) {
            Ok(out) => {
                let mut fitted = joint;
                fitted.set_params(&out.params);
                for (k, &sid) in siblings.iter().enumerate() {
                    systs.update(sid, fitted.clone(), k, out.chi2r)?;
                }
                systs.update(id, fitted, comp, out.chi2r)?;
                Ok(id)
            }
            Err(e) => {
                systs.mark_failed(id)?;
                Err(e)
            }
        }
    }

    /// Strongest residual-line candidate redshift inside `[xmin, xmax]`.
    ///
    /// Smooths the de-absorbed column, extracts the window, detects peaks
    /// and keeps the first redshift at which every transition of `series`
    /// has a peak. `Ok(None)` means the window was fine but held no
    /// candidate.
    fn residual_candidate(
        &self,
        xmin: f64,
        xmax: f64,
        series: &str,
        z_start: Redshift,
        z_end: Redshift,
        fp: &FitParams,
    ) -> Result<Option<Redshift>, SpecsystError> {
        let mut smooth = self.spec.clone();
        smooth.convolve_gauss(SpecCol::Deabs, fp.smooth_std)?;
        let region = smooth.extract_region(xmin, xmax)?;
        let peaks = region.find_peaks(SpecCol::Conv, fp.kappa)?;
        let z_cand = peaks.syst_cand(series, z_start, z_end, fp.dz)?;
        Ok(z_cand.first().copied())
    }
}
