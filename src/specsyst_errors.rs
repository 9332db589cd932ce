use crate::constants::SystId;
use thiserror::Error;

/// Error taxonomy of the absorption-system pipeline.
///
/// Two variants deserve a note on their propagation policy:
///
/// * [`SpecsystError::FitDidNotConverge`] is **recoverable**: batch operations
///   treat it as "no improvement" for the affected item and continue with the
///   next one. The registry row written for the attempted fit stays in place
///   (with an infinite χ²ᵣ) until a threshold clean removes it.
/// * [`SpecsystError::RegistryCorrupted`] is a **fatal invariant violation**:
///   the system table and the id → model map went out of sync, which the
///   library never repairs silently.
///
/// An empty candidate set is *not* an error: searches return an empty `Vec`
/// and callers branch on it explicitly.
#[derive(Error, Debug)]
pub enum SpecsystError {
    #[error("fit did not converge within {evaluations} function evaluations")]
    FitDidNotConverge { evaluations: usize },

    #[error("unknown system id: {0}")]
    UnknownId(SystId),

    #[error("unknown series: {0}")]
    UnknownSeries(String),

    #[error("extraction window [{xmin}, {xmax}] nm lies outside the spectrum domain")]
    InvalidWindow { xmin: f64, xmax: f64 },

    #[error("spectrum column '{0}' has not been computed yet")]
    MissingColumn(&'static str),

    #[error("no line list available: detect or load lines first")]
    NoLineList,

    #[error("system table and model map are out of sync: {0}")]
    RegistryCorrupted(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("mismatched spectrum columns: {0}")]
    MismatchedColumns(String),

    #[error("unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}
