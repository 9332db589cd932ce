//! # Doublet grid search
//!
//! The second candidate strategy of the pipeline: slide a synthetic doublet
//! template across the spectrum and score it at every point of a
//! (logN, b, z) grid, keeping the grid points where the **full doublet**
//! explains the data appreciably better than both a flat baseline and either
//! half of the doublet alone. Local minima of the resulting χ² surface seed
//! the actual fits.
//!
//! ## Acceptance test
//!
//! A grid point is a coincidence only when
//!
//! ```text
//! χ²(full) < min(χ²(flat) − 3, χ²(left-only), χ²(right-only))
//! ```
//!
//! The flat margin rejects noise; the half-template comparisons reject the
//! classic false positive where a *single* strong line happens to sit on one
//! member of the doublet.
//!
//! ## Grid
//!
//! Cells that fail the test stay at +∞; local-minimum extraction only ever
//! looks at finite cells. A cell is a local minimum when no neighbor along
//! any of the three axes holds a strictly smaller finite value.

use crate::constants::{DOUBLET_MARGIN, Redshift};
use crate::profile::ProfileModel;
use crate::specsyst_errors::SpecsystError;
use crate::spectrum::Spectrum;

/// Synthetic doublet template with its comparison curves.
///
/// `ym` is the full model sampled on `xm`; `ym_flat` a no-absorption
/// baseline; `ym_left`/`ym_right` keep only the respective half of the
/// template, the other half replaced by the baseline.
#[derive(Debug, Clone)]
pub struct DoubletTemplate {
    pub xm: Vec<f64>,
    pub ym: Vec<f64>,
    pub ym_flat: Vec<f64>,
    pub ym_left: Vec<f64>,
    pub ym_right: Vec<f64>,
}

/// Build the doublet template for one (logN, b) grid pair.
///
/// The template is a rest-frame (z = 0) profile of the series, so scoring it
/// at redshift `z` amounts to shifting the spectrum's rest frame to `z` and
/// interpolating the comparison column onto `xm`.
pub fn create_doublet(
    series: &str,
    logn: f64,
    b: f64,
    resol: f64,
) -> Result<DoubletTemplate, SpecsystError> {
    let model = ProfileModel::new(series, 0.0, logn, b, resol)?;
    let xm = model.fine_grid();
    let ym = model.eval(&xm, &model.params());

    let n = xm.len();
    let half = n / 2;
    let ym_flat = vec![1.0; n];
    let mut ym_left = ym.clone();
    for v in ym_left.iter_mut().skip(n - half) {
        *v = 1.0;
    }
    let mut ym_right = ym.clone();
    for v in ym_right.iter_mut().take(half) {
        *v = 1.0;
    }
    Ok(DoubletTemplate {
        xm,
        ym,
        ym_flat,
        ym_left,
        ym_right,
    })
}

/// Score a template against a spectrum column at the spectrum's current
/// rest frame.
///
/// Arguments
/// -----------------
/// * `spec`: the spectrum, already shifted to the redshift under test.
/// * `template`: comparison curves from [`create_doublet`].
/// * `col`: the column values to score (same length as the spectrum).
///
/// Return
/// ----------
/// * `(accepted, χ²(full), χ²(flat))`; `accepted` is the acceptance-test
///   verdict for this grid point.
pub fn test_doublet(spec: &Spectrum, template: &DoubletTemplate, col: &[f64]) -> (bool, f64, f64) {
    // Only safe samples take part in the interpolation.
    let mut xs = Vec::new();
    let mut norm = Vec::new();
    let mut dnorm = Vec::new();
    for i in 0..spec.len() {
        if spec.safe()[i] {
            xs.push(spec.x()[i]);
            norm.push(col[i] / spec.cont()[i]);
            dnorm.push(spec.dy()[i] / spec.cont()[i]);
        }
    }

    let ys = interp(&template.xm, &xs, &norm);
    let dys = interp(&template.xm, &xs, &dnorm);

    let chi2_of = |m: &[f64]| -> f64 {
        ys.iter()
            .zip(dys.iter())
            .zip(m.iter())
            .map(|((y, dy), mv)| {
                let r = (y - mv) / dy;
                r * r
            })
            .sum()
    };

    let chi2 = chi2_of(&template.ym);
    let chi2_flat = chi2_of(&template.ym_flat);
    let chi2_left = chi2_of(&template.ym_left);
    let chi2_right = chi2_of(&template.ym_right);

    let accepted = chi2 < (chi2_flat - DOUBLET_MARGIN).min(chi2_left).min(chi2_right);
    (accepted, chi2, chi2_flat)
}

/// Linear interpolation of `(xs, vs)` onto `xq`, clamped at the ends.
///
/// `xs` must be ascending. Matches the clamping convention of the usual
/// numeric-library `interp`.
pub(crate) fn interp(xq: &[f64], xs: &[f64], vs: &[f64]) -> Vec<f64> {
    xq.iter()
        .map(|&x| {
            if xs.is_empty() {
                return f64::NAN;
            }
            let i = xs.partition_point(|&v| v < x);
            if i == 0 {
                vs[0]
            } else if i == xs.len() {
                vs[xs.len() - 1]
            } else {
                let t = (x - xs[i - 1]) / (xs[i] - xs[i - 1]);
                vs[i - 1] + t * (vs[i] - vs[i - 1])
            }
        })
        .collect()
}

/// The (logN, b, z) χ² surface of one scan.
///
/// All cells start at +∞; a cell only ever receives a finite value when the
/// acceptance test passed there.
#[derive(Debug, Clone)]
pub struct Chi2Grid {
    nl: usize,
    nb: usize,
    nz: usize,
    values: Vec<f64>,
}

impl Chi2Grid {
    pub fn new(nl: usize, nb: usize, nz: usize) -> Self {
        Self {
            nl,
            nb,
            nz,
            values: vec![f64::INFINITY; nl * nb * nz],
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.nl, self.nb, self.nz)
    }

    fn idx(&self, il: usize, ib: usize, iz: usize) -> usize {
        (il * self.nb + ib) * self.nz + iz
    }

    pub fn get(&self, il: usize, ib: usize, iz: usize) -> f64 {
        self.values[self.idx(il, ib, iz)]
    }

    pub fn set(&mut self, il: usize, ib: usize, iz: usize, v: f64) {
        let i = self.idx(il, ib, iz);
        self.values[i] = v;
    }

    /// Number of finite (coincident) cells.
    pub fn coincidences(&self) -> usize {
        self.values.iter().filter(|v| v.is_finite()).count()
    }

    /// Extract the local minima of the finite-valued region.
    ///
    /// A cell qualifies when it is finite and no in-bounds neighbor along any
    /// of the three axes holds a strictly smaller finite value. An
    /// all-infinite grid yields no minima.
    pub fn local_minima(&self) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        for il in 0..self.nl {
            for ib in 0..self.nb {
                for iz in 0..self.nz {
                    let v = self.get(il, ib, iz);
                    if !v.is_finite() {
                        continue;
                    }
                    let mut is_min = true;
                    let neighbors = [
                        (il.wrapping_sub(1), ib, iz),
                        (il + 1, ib, iz),
                        (il, ib.wrapping_sub(1), iz),
                        (il, ib + 1, iz),
                        (il, ib, iz.wrapping_sub(1)),
                        (il, ib, iz + 1),
                    ];
                    for (jl, jb, jz) in neighbors {
                        if jl >= self.nl || jb >= self.nb || jz >= self.nz {
                            continue;
                        }
                        let w = self.get(jl, jb, jz);
                        if w.is_finite() && w < v {
                            is_min = false;
                            break;
                        }
                    }
                    if is_min {
                        out.push((il, ib, iz));
                    }
                }
            }
        }
        out
    }
}

/// Redshift range of a scan for `series`, derived from the spectrum span.
///
/// The observable range is the union over the series' transitions of the
/// redshifts that put the transition inside the safe span; the scan keeps
/// the user grid values strictly inside it. Redshifts where only some
/// transitions are on-spectrum stay in the scan, and the acceptance test
/// decides their fate. An empty span is an empty candidate set, not an
/// error.
///
/// Return
/// ----------
/// * The surviving grid values, in the order of the input grid.
pub fn observable_z_range(
    spec: &Spectrum,
    series: &str,
    grid: &[Redshift],
) -> Result<Vec<Redshift>, SpecsystError> {
    let transitions = crate::transitions::series_transitions(series)
        .ok_or_else(|| SpecsystError::UnknownSeries(series.to_string()))?;
    let Some((xlo, xhi)) = spec.span() else {
        return Ok(Vec::new());
    };
    // Any transition of the series inside the safe span keeps the redshift,
    // so the per-transition ranges are unioned.
    let mut z_min = f64::INFINITY;
    let mut z_max = f64::NEG_INFINITY;
    for t in &transitions {
        z_min = z_min.min(xlo / t.wave - 1.0);
        z_max = z_max.max(xhi / t.wave - 1.0);
    }
    let kept: Vec<f64> = grid
        .iter()
        .copied()
        .filter(|&z| z > z_min && z < z_max)
        .collect();
    Ok(kept)
}

#[cfg(test)]
mod test_slide {
    use super::*;

    /// The worked 3×3 example: minima are exactly the cells with no strictly
    /// smaller finite neighbor along each axis.
    #[test]
    fn test_local_minima_worked_grid() {
        let rows = [[5.0, 3.0, 4.0], [2.0, 1.0, 6.0], [7.0, 8.0, 0.0]];
        let mut grid = Chi2Grid::new(3, 3, 1);
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                grid.set(i, j, 0, v);
            }
        }
        let mut minima = grid.local_minima();
        minima.sort_unstable();
        assert_eq!(minima, vec![(1, 1, 0), (2, 2, 0)]);
    }

    #[test]
    fn test_local_minima_all_infinite() {
        let grid = Chi2Grid::new(4, 3, 5);
        assert!(grid.local_minima().is_empty());
        assert_eq!(grid.coincidences(), 0);
    }

    #[test]
    fn test_local_minima_ignore_infinite_neighbors() {
        // A finite cell surrounded by +∞ is a minimum by itself.
        let mut grid = Chi2Grid::new(3, 1, 3);
        grid.set(1, 0, 1, 42.0);
        assert_eq!(grid.local_minima(), vec![(1, 0, 1)]);
    }

    #[test]
    fn test_interp_clamps_at_ends() {
        let xs = [1.0, 2.0, 3.0];
        let vs = [10.0, 20.0, 30.0];
        let out = interp(&[0.0, 1.5, 4.0], &xs, &vs);
        assert_eq!(out, vec![10.0, 15.0, 30.0]);
    }

    /// A single strong line sitting on one member of the doublet must be
    /// rejected (one half-template matches it at least as well), while data
    /// holding the genuine doublet must be accepted.
    #[test]
    fn test_acceptance_rejects_single_line_accepts_doublet() {
        let t = create_doublet("CIV", 14.0, 10.0, 70000.0).unwrap();
        let n = t.xm.len();
        let dy = vec![0.01; n];
        let cont = vec![1.0; n];

        let single = crate::spectrum::Spectrum::new(
            t.xm.clone(),
            t.ym_left.clone(),
            dy.clone(),
            cont.clone(),
        )
        .unwrap();
        let (accepted, _, _) = test_doublet(&single, &t, single.y());
        assert!(!accepted, "a lone line must not pass the doublet test");

        let doublet =
            crate::spectrum::Spectrum::new(t.xm.clone(), t.ym.clone(), dy, cont).unwrap();
        let (accepted, chi2, chi2_flat) = test_doublet(&doublet, &t, doublet.y());
        assert!(accepted, "the genuine doublet must pass");
        assert!(chi2 < chi2_flat - DOUBLET_MARGIN);
    }

    /// Redshifts that put only one member of the doublet on-spectrum stay in
    /// the scan; the acceptance test is what rejects them, not the range.
    #[test]
    fn test_z_range_keeps_partially_observable_redshifts() {
        // Safe span 400–402 nm. CIV members at 154.8204 and 155.0781 nm give
        // per-member ranges of roughly (1.5838, 1.5967) and (1.5792, 1.5921).
        let x: Vec<f64> = (0..=4).map(|i| 400.0 + 0.5 * i as f64).collect();
        let n = x.len();
        let spec =
            crate::spectrum::Spectrum::new(x, vec![1.0; n], vec![0.01; n], vec![1.0; n]).unwrap();

        let grid = [1.575, 1.580, 1.590, 1.595, 1.600];
        let kept = observable_z_range(&spec, "CIV", &grid).unwrap();
        // 1.580 sees only the red member, 1.595 only the blue one; both stay.
        assert_eq!(kept, vec![1.580, 1.590, 1.595]);
    }

    #[test]
    fn test_template_halves_split_the_doublet() {
        let t = create_doublet("CIV", 14.0, 10.0, 70000.0).unwrap();
        let n = t.xm.len();
        // Left half carries absorption only in its first half and vice versa.
        let depth = |v: &[f64], lo: usize, hi: usize| {
            v[lo..hi].iter().cloned().fold(f64::INFINITY, f64::min)
        };
        assert!(depth(&t.ym_left, 0, n / 2) < 0.9);
        assert!(depth(&t.ym_left, n / 2, n) > 0.999);
        assert!(depth(&t.ym_right, n / 2, n) < 0.9);
        assert!(depth(&t.ym_right, 0, n / 2) > 0.999);
        assert!(t.ym_flat.iter().all(|&v| v == 1.0));
    }
}
