//! # Atomic transition and series lookup data
//!
//! Static line-list data for the ionic transitions the pipeline knows how to
//! model, grouped into **series**: ordered sets of transitions that share an
//! absorbing species and are expected to appear together at a common redshift
//! (e.g. the CIV doublet, or Lyman α+β).
//!
//! ## Overview
//!
//! - [`Transition`] – rest wavelength, oscillator strength, damping constant
//! - [`series_transitions`] – resolve a series name into its transitions,
//!   ordered by increasing rest wavelength
//! - [`known_series`] – the names accepted at API boundaries
//!
//! The table is deliberately small; it covers the doublets and Lyman lines
//! exercised by the detection pipeline. Wavelengths are vacuum rest values in
//! nanometers, damping constants in s⁻¹.

use std::collections::HashMap;

use ahash::RandomState;
use once_cell::sync::Lazy;
use smallvec::SmallVec;

use crate::constants::Nanometer;

/// A single ionic transition.
///
/// Fields
/// -----------------
/// * `name`: identifier of the transition (e.g. `"CIV_1548"`).
/// * `wave`: vacuum rest wavelength in nm.
/// * `osc`: oscillator strength (dimensionless).
/// * `gamma`: radiative damping constant in s⁻¹.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub name: &'static str,
    pub wave: Nanometer,
    pub osc: f64,
    pub gamma: f64,
}

/// Transitions of one series, ordered by increasing rest wavelength.
///
/// Small and inline-allocated: every known series has between one and four
/// members.
pub type SeriesTransitions = SmallVec<[&'static Transition; 4]>;

static LY_A: Transition = Transition {
    name: "Ly_a",
    wave: 121.567,
    osc: 0.4164,
    gamma: 6.265e8,
};

static LY_B: Transition = Transition {
    name: "Ly_b",
    wave: 102.5722,
    osc: 0.07912,
    gamma: 1.897e8,
};

static CIV_1548: Transition = Transition {
    name: "CIV_1548",
    wave: 154.8204,
    osc: 0.1899,
    gamma: 2.643e8,
};

static CIV_1550: Transition = Transition {
    name: "CIV_1550",
    wave: 155.0781,
    osc: 0.09475,
    gamma: 2.628e8,
};

static SI_IV_1393: Transition = Transition {
    name: "SiIV_1393",
    wave: 139.37602,
    osc: 0.513,
    gamma: 8.825e8,
};

static SI_IV_1402: Transition = Transition {
    name: "SiIV_1402",
    wave: 140.27729,
    osc: 0.254,
    gamma: 8.633e8,
};

static MG_II_2796: Transition = Transition {
    name: "MgII_2796",
    wave: 279.63543,
    osc: 0.6155,
    gamma: 2.625e8,
};

static MG_II_2803: Transition = Transition {
    name: "MgII_2803",
    wave: 280.35315,
    osc: 0.3058,
    gamma: 2.592e8,
};

static SERIES: Lazy<HashMap<&'static str, SeriesTransitions, RandomState>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, SeriesTransitions, RandomState> =
        HashMap::with_hasher(RandomState::new());
    m.insert("Ly_a", SmallVec::from_slice(&[&LY_A]));
    m.insert("Ly", SmallVec::from_slice(&[&LY_B, &LY_A]));
    m.insert("CIV", SmallVec::from_slice(&[&CIV_1548, &CIV_1550]));
    m.insert("SiIV", SmallVec::from_slice(&[&SI_IV_1393, &SI_IV_1402]));
    m.insert("MgII", SmallVec::from_slice(&[&MG_II_2796, &MG_II_2803]));
    m
});

/// Resolve a series name into its transitions.
///
/// Arguments
/// -----------------
/// * `series`: series identifier (e.g. `"CIV"`, `"MgII"`, `"Ly_a"`).
///
/// Return
/// ----------
/// * `Some(transitions)` ordered by increasing rest wavelength, or `None` for
///   an unknown name.
pub fn series_transitions(series: &str) -> Option<SeriesTransitions> {
    SERIES.get(series).cloned()
}

/// Names of all series the pipeline can model, in unspecified order.
pub fn known_series() -> Vec<&'static str> {
    SERIES.keys().copied().collect()
}

#[cfg(test)]
mod test_transitions {
    use super::*;

    #[test]
    fn test_series_lookup() {
        let civ = series_transitions("CIV").unwrap();
        assert_eq!(civ.len(), 2);
        assert!(civ[0].wave < civ[1].wave);
        assert_eq!(civ[0].name, "CIV_1548");

        assert!(series_transitions("FeX").is_none());
    }

    #[test]
    fn test_series_wavelength_ordering() {
        for name in known_series() {
            let tr = series_transitions(name).unwrap();
            for pair in tr.windows(2) {
                assert!(pair[0].wave < pair[1].wave, "series {name} out of order");
            }
        }
    }
}
