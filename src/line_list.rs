//! # Detected-line lists and line-based candidate search
//!
//! A [`LineList`] is the output of a peak detector: one record per detected
//! line (center, bounds, depth, error). Its [`LineList::syst_cand`] method is
//! the **line-based candidate strategy** of the pipeline: it proposes the
//! redshifts at which a detected line coincides, within a tolerance `dz`,
//! with *every* member transition of a series.
//!
//! An empty candidate list is a valid result, not an error; callers branch
//! on it (the residual-refinement loop falls back to the system's own
//! redshift when no candidate survives).

use itertools::Itertools;

use crate::constants::{Nanometer, Redshift};
use crate::specsyst_errors::SpecsystError;
use crate::transitions::series_transitions;

/// One detected line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    /// Line center in nm (current frame of the spectrum it was found in).
    pub x: Nanometer,
    /// Lower bound of the line region.
    pub xmin: Nanometer,
    /// Upper bound of the line region.
    pub xmax: Nanometer,
    /// Column value at the center (flux-like).
    pub y: f64,
    /// Error on `y`.
    pub dy: f64,
}

/// A list of detected lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineList {
    lines: Vec<Line>,
}

impl LineList {
    pub fn new(lines: Vec<Line>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Merge another list into this one.
    pub fn append(&mut self, other: LineList) {
        self.lines.extend(other.lines);
    }

    /// Propose system candidate redshifts for a series.
    ///
    /// Every line is converted into one candidate redshift per series
    /// transition (`z = x/λ₀ − 1`); a redshift qualifies when **each**
    /// transition of the series has a detected line whose candidate redshift
    /// agrees with it within `dz`.
    ///
    /// Arguments
    /// -----------------
    /// * `series`: series identifier.
    /// * `z_start`, `z_end`: redshift window. The window is *not* auto-sorted:
    ///   when `z_start > z_end` the candidates are returned in descending
    ///   order, following the direction the bounds imply.
    /// * `dz`: coincidence tolerance.
    ///
    /// Return
    /// ----------
    /// * Candidate redshifts in window order, deduplicated within `dz`.
    ///   Empty when nothing coincides — a valid outcome, not an error.
    pub fn syst_cand(
        &self,
        series: &str,
        z_start: Redshift,
        z_end: Redshift,
        dz: f64,
    ) -> Result<Vec<Redshift>, SpecsystError> {
        let transitions = series_transitions(series)
            .ok_or_else(|| SpecsystError::UnknownSeries(series.to_string()))?;
        let (zlo, zhi) = if z_start <= z_end {
            (z_start, z_end)
        } else {
            (z_end, z_start)
        };

        // Per transition, the sorted candidate redshifts of every line.
        let z_lists: Vec<Vec<f64>> = transitions
            .iter()
            .map(|t| {
                self.lines
                    .iter()
                    .map(|l| l.x / t.wave - 1.0)
                    .sorted_by(|a, b| a.total_cmp(b))
                    .collect()
            })
            .collect();

        let mut out: Vec<f64> = Vec::new();
        for &z in &z_lists[0] {
            if z < zlo || z > zhi {
                continue;
            }
            let coincident = z_lists[1..]
                .iter()
                .all(|zs| nearest_within(zs, z).is_some_and(|d| d <= dz));
            if coincident {
                // Deduplicate candidates closer than the tolerance.
                if out.last().is_none_or(|&last| z - last > dz) {
                    out.push(z);
                }
            }
        }
        if z_start > z_end {
            out.reverse();
        }
        Ok(out)
    }
}

/// Distance from `z` to the nearest element of the sorted slice `zs`.
fn nearest_within(zs: &[f64], z: f64) -> Option<f64> {
    if zs.is_empty() {
        return None;
    }
    let i = zs.partition_point(|&v| v < z);
    let mut best = f64::INFINITY;
    if i < zs.len() {
        best = best.min((zs[i] - z).abs());
    }
    if i > 0 {
        best = best.min((z - zs[i - 1]).abs());
    }
    Some(best)
}
