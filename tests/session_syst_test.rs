mod common;

use approx::assert_relative_eq;
use camino::Utf8PathBuf;

use specsyst::fit_params::FitParams;
use specsyst::session::Session;
use specsyst::specsyst_errors::SpecsystError;

use common::{synthetic_spectrum, RESOL};

fn fit_params() -> FitParams {
    FitParams::builder()
        .resol(RESOL)
        .maxfev(2000)
        .build()
        .unwrap()
}

#[test]
fn test_add_syst_recovers_injected_parameters() {
    let spec = synthetic_spectrum(
        416.5,
        419.5,
        0.002,
        &[("CIV", 1.6971, 13.5, 12.0)],
        0.01,
        7,
    );
    let mut session = Session::new(spec);

    let id = session.add_syst("CIV", 1.6970, &fit_params()).unwrap();

    let systs = session.systs().unwrap();
    let sys = systs.get(id).unwrap();
    assert_relative_eq!(sys.z, 1.6971, epsilon = 1e-4);
    assert_relative_eq!(sys.logn, 13.5, epsilon = 0.2);
    assert!(sys.chi2r < 1.5, "poor fit: chi2r = {}", sys.chi2r);
    assert!(session.spec().model().is_some());
    assert!(session.spec().deabs().is_some());
}

#[test]
fn test_refresh_is_idempotent() {
    let spec = synthetic_spectrum(
        416.5,
        419.5,
        0.002,
        &[("CIV", 1.6971, 13.5, 12.0)],
        0.01,
        7,
    );
    let mut session = Session::new(spec);
    session.add_syst("CIV", 1.6970, &fit_params()).unwrap();

    let model_once = session.spec().model().unwrap().to_vec();
    let deabs_once = session.spec().deabs().unwrap().to_vec();
    session.refresh();
    assert_eq!(session.spec().model().unwrap(), &model_once[..]);
    assert_eq!(session.spec().deabs().unwrap(), &deabs_once[..]);
}

#[test]
fn test_add_syst_outside_spectrum_is_invalid_window() {
    let spec = synthetic_spectrum(
        416.5,
        419.5,
        0.002,
        &[("CIV", 1.6971, 13.5, 12.0)],
        0.01,
        7,
    );
    let mut session = Session::new(spec);

    let res = session.add_syst("CIV", 2.5, &fit_params());
    assert!(matches!(res, Err(SpecsystError::InvalidWindow { .. })));
    assert!(
        session.systs().map_or(true, |s| s.is_empty()),
        "a failed window must not leave a row behind"
    );
}

#[test]
fn test_save_and_load_round_trip() {
    let spec = synthetic_spectrum(
        416.5,
        419.5,
        0.002,
        &[("CIV", 1.6971, 13.5, 12.0)],
        0.01,
        7,
    );
    let mut session = Session::new(spec.clone());
    let id = session.add_syst("CIV", 1.6970, &fit_params()).unwrap();
    let saved: Vec<_> = session.systs().unwrap().iter().cloned().collect();

    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("systs.csv")).unwrap();
    session.save_systs(&path).unwrap();

    let mut resumed = Session::new(spec);
    let loaded = resumed.load_systs(&path).unwrap();
    assert_eq!(loaded, 1);

    let systs = resumed.systs().unwrap();
    let sys = systs.get(id).unwrap();
    assert_eq!(sys, &saved[0]);
    assert!(
        resumed.spec().model().is_some(),
        "loading must recompute the spectrum columns"
    );
}
