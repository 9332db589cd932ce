mod common;

use specsyst::fit_params::FitParams;
use specsyst::session::Session;
use specsyst::syst_list::System;

use common::{synthetic_spectrum, RESOL};

/// A blended pair: the second, weaker component sits 44 km/s redward of the
/// first, too close to detect as a separate line but far enough to leave
/// strong residuals under a single-component fit.
fn blended_session() -> Session {
    let spec = synthetic_spectrum(
        416.3,
        419.6,
        0.002,
        &[
            ("CIV", 1.6971, 13.6, 10.0),
            ("CIV", 1.6975, 13.4, 8.0),
        ],
        0.005,
        23,
    );
    Session::new(spec)
}

fn loose_params() -> FitParams {
    // Infinite threshold: the deliberately poor first fit must survive the
    // post-fit clean so the refinement pass can find it.
    FitParams::builder()
        .resol(RESOL)
        .maxfev(5000)
        .build()
        .unwrap()
}

fn refine_params() -> FitParams {
    FitParams::builder()
        .resol(RESOL)
        .maxfev(5000)
        .chi2r_thres(1.5)
        .dz(5e-4)
        .build()
        .unwrap()
}

#[test]
fn test_refinement_improves_a_blended_system() {
    let mut session = blended_session();
    let id = session.add_syst("CIV", 1.6971, &loose_params()).unwrap();

    let chi2r_single = session.systs().unwrap().chi2r(id).unwrap();
    assert!(
        chi2r_single > 1.5,
        "single-component fit should be poor, got {chi2r_single}"
    );

    let outcomes = session
        .add_syst_from_resids(1.68, 1.71, &refine_params())
        .unwrap();
    assert_eq!(outcomes.len(), 1);

    let out = &outcomes[0];
    assert_eq!(out.id, id);
    assert!(out.improved(), "no component was accepted");
    assert!(out.chi2r_final.is_finite());
    assert!(out.chi2r_final <= out.chi2r_start);

    let systs = session.systs().unwrap();
    assert_eq!(systs.len(), 1 + out.added);
    assert_eq!(
        systs.model_of(id).unwrap().components().len(),
        1 + out.added,
        "the target model must carry the accepted components"
    );
}

#[test]
fn test_model_column_matches_the_joint_transmission_after_refinement() {
    let mut session = blended_session();
    let id = session.add_syst("CIV", 1.6971, &loose_params()).unwrap();
    let outcomes = session
        .add_syst_from_resids(1.68, 1.71, &refine_params())
        .unwrap();
    assert!(outcomes[0].improved(), "no component was accepted");

    // The target row and its component rows share one joint model; the
    // model column must carry its transmission exactly once.
    let joint = session.systs().unwrap().model_of(id).unwrap().clone();
    let spec = session.spec();
    let xs: Vec<f64> = spec
        .x()
        .iter()
        .zip(spec.safe())
        .filter_map(|(&x, &s)| s.then_some(x))
        .collect();
    let t = joint.eval(&xs, &joint.params());
    let model = spec.model().unwrap();
    let cont = spec.cont();

    let mut k = 0;
    for (i, &s) in spec.safe().iter().enumerate() {
        if !s {
            continue;
        }
        let expected = cont[i] * t[k];
        assert!(
            (model[i] - expected).abs() < 1e-9,
            "model[{i}] = {}, expected cont × T = {expected}",
            model[i]
        );
        k += 1;
    }
}

#[test]
fn test_rejected_trial_rolls_the_registry_back() {
    let mut session = blended_session();
    session.add_syst("CIV", 1.6971, &loose_params()).unwrap();
    let before: Vec<System> = session.systs().unwrap().iter().cloned().collect();

    // A one-evaluation budget makes every trial fit fail, so the first
    // trial is rejected and the pass ends with the registry untouched.
    let starved = FitParams::builder()
        .resol(RESOL)
        .maxfev(1)
        .chi2r_thres(1.5)
        .build()
        .unwrap();
    let outcomes = session.add_syst_from_resids(1.68, 1.71, &starved).unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].added, 0);
    assert_eq!(outcomes[0].chi2r_final, outcomes[0].chi2r_start);

    let after: Vec<System> = session.systs().unwrap().iter().cloned().collect();
    assert_eq!(before, after, "rollback must restore the exact rows");
    session.systs().unwrap().check_integrity().unwrap();
}

#[test]
fn test_no_poor_systems_is_a_no_op() {
    let mut session = blended_session();
    let outcomes = session
        .add_syst_from_resids(1.68, 1.71, &refine_params())
        .unwrap();
    assert!(outcomes.is_empty());
}
