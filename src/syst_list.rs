//! # System registry
//!
//! The authoritative table of detected absorption systems: one row per
//! system (identity, series, redshift, column density, broadening,
//! resolution, fit statistic) plus a parallel map from id to the system's
//! fitted [`ProfileModel`].
//!
//! ## Invariants
//!
//! - Ids are allocated monotonically and never reused within a registry.
//! - Every id present in the table has **exactly one** model entry; a
//!   mismatch is a fatal [`SpecsystError::RegistryCorrupted`], never repaired
//!   silently.
//! - A row exists from the moment a fit is *attempted*: failed fits keep
//!   their placeholder row (χ²ᵣ = ∞) until a threshold clean removes it.
//!
//! ## Transactions
//!
//! [`SystList::snapshot`] / [`SystList::restore`] implement the only
//! transaction concept of the pipeline, used by the refinement loop for
//! speculative trial fits: the snapshot owns deep copies of the row table
//! and the model map, and restoring installs both at once.
//!
//! ## Persistence
//!
//! The row table round-trips through a flat CSV file (ids included), so a
//! session can resume exactly where it left off; models are rebuilt from the
//! row parameters on load.

use std::collections::HashMap;

use ahash::RandomState;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{KmPerSec, LogColumnDensity, Redshift, SystId};
use crate::profile::ProfileModel;
use crate::specsyst_errors::SpecsystError;

/// One registry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct System {
    /// Unique id within the registry.
    pub id: SystId,
    /// Series of transitions this system absorbs in.
    pub series: String,
    /// Redshift.
    pub z: Redshift,
    /// log₁₀ column density.
    pub logn: LogColumnDensity,
    /// Doppler broadening in km/s.
    pub b: KmPerSec,
    /// Instrumental resolving power used by the fit.
    pub resol: f64,
    /// Reduced χ² of the last fit; ∞ until a fit converges.
    pub chi2r: f64,
}

/// Deep copy of a registry's owned state, for speculative trials.
///
/// Restoring a snapshot reinstalls the table and the model map together, so
/// a failed trial can be rolled back exactly.
#[derive(Debug, Clone)]
pub struct SystSnapshot {
    table: Vec<System>,
    mods: HashMap<SystId, ProfileModel, RandomState>,
    next_id: SystId,
}

/// The system registry.
#[derive(Debug, Clone, Default)]
pub struct SystList {
    table: Vec<System>,
    mods: HashMap<SystId, ProfileModel, RandomState>,
    next_id: SystId,
}

impl SystList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose first allocated id will be `id_start`.
    ///
    /// Used when a scan builds a scratch registry that is later merged into
    /// an existing one without re-identification.
    pub fn with_id_start(id_start: SystId) -> Self {
        Self {
            next_id: id_start,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &System> {
        self.table.iter()
    }

    /// Distinct models, in table order.
    ///
    /// A refined system and the rows of its extra components share one joint
    /// model, stored under each of their ids; this yields that model once, so
    /// callers rebuilding the model column multiply each transmission exactly
    /// once.
    pub fn iter_unique_models(&self) -> impl Iterator<Item = &ProfileModel> {
        let mut seen: Vec<&ProfileModel> = Vec::new();
        self.table.iter().filter_map(move |s| {
            let m = self.mods.get(&s.id)?;
            if seen.iter().any(|p| *p == m) {
                None
            } else {
                seen.push(m);
                Some(m)
            }
        })
    }

    pub fn get(&self, id: SystId) -> Option<&System> {
        self.table.iter().find(|s| s.id == id)
    }

    pub fn model_of(&self, id: SystId) -> Option<&ProfileModel> {
        self.mods.get(&id)
    }

    /// Reduced χ² of a row, failing for an unknown id.
    pub fn chi2r(&self, id: SystId) -> Result<f64, SpecsystError> {
        self.get(id)
            .map(|s| s.chi2r)
            .ok_or(SpecsystError::UnknownId(id))
    }

    /// Id the next [`add`](Self::add) will allocate.
    pub fn next_id(&self) -> SystId {
        self.next_id
    }

    /// Allocate a new id and create a placeholder row (not yet fit,
    /// χ²ᵣ = ∞) together with its model entry.
    ///
    /// Return
    /// ----------
    /// * The id of the new row.
    pub fn add(
        &mut self,
        series: &str,
        z: Redshift,
        logn: LogColumnDensity,
        b: KmPerSec,
        resol: f64,
        model: ProfileModel,
    ) -> SystId {
        let id = self.next_id;
        self.next_id += 1;
        self.table.push(System {
            id,
            series: series.to_string(),
            z,
            logn,
            b,
            resol,
            chi2r: f64::INFINITY,
        });
        self.mods.insert(id, model);
        id
    }

    /// Insert a row that already carries an id, together with its model.
    ///
    /// Used when reloading a saved table: the persisted ids are kept, and the
    /// allocator is bumped past them so later additions stay unique.
    pub fn insert_row(&mut self, row: System, model: ProfileModel) {
        self.next_id = self.next_id.max(row.id + 1);
        self.mods.insert(row.id, model);
        self.table.push(row);
    }

    /// Write back a converged fit into the row for `id`.
    ///
    /// Arguments
    /// -----------------
    /// * `id`: the row to update.
    /// * `model`: the fitted model (replaces the row's model entry).
    /// * `comp`: index of the model component this row describes.
    /// * `chi2r`: reduced χ² of the fit.
    ///
    /// Return
    /// ----------
    /// * `Ok(())`, or [`SpecsystError::UnknownId`].
    pub fn update(
        &mut self,
        id: SystId,
        model: ProfileModel,
        comp: usize,
        chi2r: f64,
    ) -> Result<(), SpecsystError> {
        let row = self
            .table
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(SpecsystError::UnknownId(id))?;
        let c = model
            .components()
            .get(comp)
            .copied()
            .ok_or_else(|| SpecsystError::InvalidParameter(format!("component {comp} absent")))?;
        row.z = c.z;
        row.logn = c.logn;
        row.b = c.b;
        row.chi2r = chi2r;
        self.mods.insert(id, model);
        Ok(())
    }

    /// Mark a row's fit as failed (χ²ᵣ = ∞), keeping its placeholder model.
    pub fn mark_failed(&mut self, id: SystId) -> Result<(), SpecsystError> {
        let row = self
            .table
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(SpecsystError::UnknownId(id))?;
        row.chi2r = f64::INFINITY;
        Ok(())
    }

    /// Remove a row by id.
    pub fn remove(&mut self, id: SystId) -> Result<System, SpecsystError> {
        let pos = self
            .table
            .iter()
            .position(|s| s.id == id)
            .ok_or(SpecsystError::UnknownId(id))?;
        let row = self.table.remove(pos);
        self.mods.remove(&id);
        Ok(row)
    }

    /// Remove every row whose χ²ᵣ exceeds `threshold`. No-op on an empty
    /// registry. Returns the number of rows removed.
    pub fn clean(&mut self, threshold: f64) -> usize {
        let before = self.table.len();
        let mods = &mut self.mods;
        self.table.retain(|s| {
            let keep = !(s.chi2r > threshold);
            if !keep {
                mods.remove(&s.id);
            }
            keep
        });
        let removed = before - self.table.len();
        if removed > 0 {
            debug!(removed, threshold, "cleaned registry");
        }
        removed
    }

    /// Rows whose χ²ᵣ exceeds `threshold`, in table order (owned copies).
    pub fn above_threshold(&self, threshold: f64) -> Vec<System> {
        self.table
            .iter()
            .filter(|s| s.chi2r > threshold)
            .cloned()
            .collect()
    }

    /// Merge `other` into this registry.
    ///
    /// With `unique = true`, `other`'s rows are re-identified starting after
    /// the current maximum id so ids stay pairwise distinct. With
    /// `unique = false`, ids are kept as they are — the caller is then
    /// responsible for disjointness (used when a scratch registry built with
    /// [`with_id_start`](Self::with_id_start) is merged back).
    pub fn append(&mut self, other: SystList, unique: bool) {
        if unique {
            let base = self.next_id;
            for (offset, mut row) in other.table.into_iter().enumerate() {
                let old = row.id;
                row.id = base + offset as SystId;
                if let Some(m) = other.mods.get(&old) {
                    self.mods.insert(row.id, m.clone());
                }
                self.next_id = row.id + 1;
                self.table.push(row);
            }
        } else {
            for row in other.table {
                self.next_id = self.next_id.max(row.id + 1);
                if let Some(m) = other.mods.get(&row.id) {
                    self.mods.insert(row.id, m.clone());
                }
                self.table.push(row);
            }
        }
    }

    /// Deep-copy the owned state for a speculative trial.
    pub fn snapshot(&self) -> SystSnapshot {
        SystSnapshot {
            table: self.table.clone(),
            mods: self.mods.clone(),
            next_id: self.next_id,
        }
    }

    /// Restore a snapshot, discarding every mutation since it was taken.
    /// Table and model map are reinstalled together.
    pub fn restore(&mut self, snap: SystSnapshot) {
        self.table = snap.table;
        self.mods = snap.mods;
        self.next_id = snap.next_id;
    }

    /// Verify the table ↔ model-map synchronization invariant.
    ///
    /// Return
    /// ----------
    /// * `Ok(())`, or [`SpecsystError::RegistryCorrupted`] naming the first
    ///   mismatch found. Corruption is surfaced, never repaired.
    pub fn check_integrity(&self) -> Result<(), SpecsystError> {
        for s in &self.table {
            if !self.mods.contains_key(&s.id) {
                return Err(SpecsystError::RegistryCorrupted(format!(
                    "row {} has no model entry",
                    s.id
                )));
            }
        }
        if self.mods.len() != self.table.len() {
            return Err(SpecsystError::RegistryCorrupted(format!(
                "{} rows vs {} model entries",
                self.table.len(),
                self.mods.len()
            )));
        }
        Ok(())
    }

    /// Write the row table to a flat CSV file, ids included.
    pub fn save(&self, path: &Utf8Path) -> Result<(), SpecsystError> {
        self.check_integrity()?;
        let mut writer = csv::Writer::from_path(path.as_std_path())?;
        for row in &self.table {
            writer.serialize(row)?;
        }
        writer.flush()?;
        debug!(%path, rows = self.table.len(), "saved registry table");
        Ok(())
    }

    /// Read a row table previously written by [`save`](Self::save).
    ///
    /// Only the rows are returned; callers rebuild the models from the row
    /// parameters (see `Session::load_systs`).
    pub fn load_table(path: &Utf8Path) -> Result<Vec<System>, SpecsystError> {
        let mut reader = csv::Reader::from_path(path.as_std_path())?;
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            rows.push(record?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod test_syst_list {
    use super::*;

    fn model(z: f64) -> ProfileModel {
        ProfileModel::new("CIV", z, 13.0, 10.0, 70000.0).unwrap()
    }

    #[test]
    fn test_ids_monotonic_and_never_reused() {
        let mut systs = SystList::new();
        let a = systs.add("CIV", 1.6, 13.0, 10.0, 70000.0, model(1.6));
        let b = systs.add("CIV", 1.7, 13.0, 10.0, 70000.0, model(1.7));
        systs.remove(a).unwrap();
        let c = systs.add("CIV", 1.8, 13.0, 10.0, 70000.0, model(1.8));
        assert!(a < b && b < c);
        systs.check_integrity().unwrap();
    }

    #[test]
    fn test_update_unknown_id_fails() {
        let mut systs = SystList::new();
        assert!(matches!(
            systs.update(99, model(1.6), 0, 1.0),
            Err(SpecsystError::UnknownId(99))
        ));
    }

    #[test]
    fn test_clean_removes_failed_rows_keeps_infinite_threshold() {
        let mut systs = SystList::new();
        let a = systs.add("CIV", 1.6, 13.0, 10.0, 70000.0, model(1.6));
        let b = systs.add("CIV", 1.7, 13.0, 10.0, 70000.0, model(1.7));
        systs.update(a, model(1.6), 0, 1.2).unwrap();
        // b keeps its placeholder ∞ statistic.

        // An infinite threshold keeps everything, including failed rows.
        assert_eq!(systs.clean(f64::INFINITY), 0);
        assert_eq!(systs.len(), 2);

        assert_eq!(systs.clean(2.0), 1);
        assert!(systs.get(a).is_some());
        assert!(systs.get(b).is_none());
        systs.check_integrity().unwrap();
    }

    #[test]
    fn test_append_unique_offsets_ids() {
        let mut left = SystList::new();
        left.add("CIV", 1.6, 13.0, 10.0, 70000.0, model(1.6));
        let mut right = SystList::new();
        right.add("CIV", 1.7, 13.0, 10.0, 70000.0, model(1.7));
        right.add("CIV", 1.8, 13.0, 10.0, 70000.0, model(1.8));

        left.append(right, true);
        let ids: Vec<_> = left.iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 3);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 3, "ids must stay pairwise distinct");
        left.check_integrity().unwrap();
    }

    #[test]
    fn test_snapshot_rollback_exactness() {
        let mut systs = SystList::new();
        let a = systs.add("CIV", 1.6, 13.0, 10.0, 70000.0, model(1.6));
        systs.update(a, model(1.6), 0, 1.1).unwrap();

        let snap = systs.snapshot();
        let before_rows: Vec<System> = systs.iter().cloned().collect();

        systs.add("CIV", 1.7, 13.0, 10.0, 70000.0, model(1.7));
        systs.update(a, model(1.65), 0, 9.9).unwrap();
        systs.restore(snap);

        let after_rows: Vec<System> = systs.iter().cloned().collect();
        assert_eq!(before_rows, after_rows);
        assert_eq!(systs.len(), 1);
        assert_eq!(
            systs.model_of(a).unwrap().components()[0].z,
            1.6,
            "model map must be rolled back together with the table"
        );
        systs.check_integrity().unwrap();
    }

    #[test]
    fn test_unique_models_yield_a_shared_joint_model_once() {
        use crate::profile::VoigtComponent;

        let mut systs = SystList::new();
        let a = systs.add("CIV", 1.6, 13.0, 10.0, 70000.0, model(1.6));
        let mut joint = model(1.6);
        joint.add_component(VoigtComponent {
            z: 1.6005,
            logn: 13.0,
            b: 10.0,
        });
        let b = systs.add("CIV", 1.6005, 13.0, 10.0, 70000.0, joint.clone());
        systs.update(a, joint.clone(), 0, 1.1).unwrap();
        systs.update(b, joint, 1, 1.1).unwrap();
        let c = systs.add("CIV", 1.8, 13.0, 10.0, 70000.0, model(1.8));
        systs.update(c, model(1.8), 0, 1.0).unwrap();

        // Two rows share the joint model; it must count once.
        assert_eq!(systs.len(), 3);
        assert_eq!(systs.iter_unique_models().count(), 2);
        systs.check_integrity().unwrap();
    }

    #[test]
    fn test_csv_round_trip() {
        let mut systs = SystList::new();
        let a = systs.add("CIV", 1.6971, 13.0, 10.0, 70000.0, model(1.6971));
        systs.update(a, model(1.6971), 0, 1.234).unwrap();
        systs.add("MgII", 0.5, 12.5, 8.0, 70000.0, {
            ProfileModel::new("MgII", 0.5, 12.5, 8.0, 70000.0).unwrap()
        });

        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("systs.csv")).unwrap();
        systs.save(&path).unwrap();
        let rows = SystList::load_table(&path).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, a);
        assert_eq!(rows[0].series, "CIV");
        assert!((rows[0].chi2r - 1.234).abs() < 1e-12);
        assert!(rows[1].chi2r.is_infinite(), "placeholder ∞ must survive");
    }
}
