pub mod constants;
pub mod fit_params;
pub mod fitter;
pub mod line_list;
pub mod profile;
pub mod session;
pub mod slide;
pub mod specsyst_errors;
pub mod spectrum;
pub mod syst_list;
pub mod transitions;
