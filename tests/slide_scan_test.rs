mod common;

use specsyst::fit_params::{FitParams, SlideParams};
use specsyst::session::Session;

use common::{synthetic_spectrum, RESOL};

fn single_doublet_session() -> Session {
    let spec = synthetic_spectrum(
        399.8,
        405.6,
        0.002,
        &[("CIV", 1.60, 13.8, 10.0)],
        0.01,
        37,
    );
    Session::new(spec)
}

fn fit_params() -> FitParams {
    FitParams::builder()
        .resol(RESOL)
        .maxfev(2000)
        .build()
        .unwrap()
}

fn scan_params(z_start: f64, z_end: f64) -> SlideParams {
    SlideParams::builder()
        .z(z_start, z_end, 5e-4)
        .logn(14.0, 14.05, 0.1)
        .b(10.0, 12.0, 5.0)
        .resol(RESOL)
        .build()
        .unwrap()
}

#[test]
fn test_slide_finds_the_injected_doublet() {
    let mut session = single_doublet_session();
    let outcome = session
        .add_syst_slide("CIV", &scan_params(1.59, 1.62), &fit_params())
        .unwrap();

    assert!(outcome.tested > 0);
    assert!(outcome.coincidences >= 1, "no grid point passed the test");
    assert!(outcome.candidates >= 1);

    // The best-scored candidate sits on the injected redshift.
    let (z_best, res_best) = &outcome.fitted[0];
    assert!((z_best - 1.60).abs() < 2e-3, "best candidate at z = {z_best}");
    let id = *res_best.as_ref().unwrap();
    let sys = session.systs().unwrap().get(id).unwrap();
    assert!((sys.z - 1.60).abs() < 1e-3);
    assert!(sys.chi2r < 2.0);

    // The scan must leave the spectrum back in the observed frame, with
    // the columns recomputed.
    assert_eq!(session.spec().rf_z(), 0.0);
    assert!(session.spec().model().is_some());
}

#[test]
fn test_unobservable_range_is_empty_not_an_error() {
    let mut session = single_doublet_session();
    let outcome = session
        .add_syst_slide("CIV", &scan_params(2.5, 2.6), &fit_params())
        .unwrap();

    assert_eq!(outcome.tested, 0);
    assert_eq!(outcome.coincidences, 0);
    assert!(outcome.fitted.is_empty());
    assert!(session.systs().is_none());
}

#[test]
fn test_existing_systems_survive_a_scan() {
    let mut session = single_doublet_session();
    let id = session.add_syst("CIV", 1.60, &fit_params()).unwrap();
    let row_before = session.systs().unwrap().get(id).unwrap().clone();

    // With the doublet already modeled, the de-absorbed column is flat and
    // the scan adds nothing; the old system must come back untouched.
    session
        .add_syst_slide("CIV", &scan_params(1.59, 1.62), &fit_params())
        .unwrap();

    let systs = session.systs().unwrap();
    assert_eq!(systs.get(id), Some(&row_before));
    systs.check_integrity().unwrap();
}
