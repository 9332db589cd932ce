//! # Constants and type definitions for specsyst
//!
//! This module centralizes the **physical constants**, **conversion factors**, and **common type
//! definitions** used throughout the `specsyst` library.
//!
//! ## Overview
//!
//! - Atomic-physics constants entering the Voigt opacity
//! - Unit conversions (nm ↔ cm, km/s ↔ cm/s)
//! - Core type aliases used across the crate
//! - Tuning defaults shared by the fitting and scanning pipelines
//!
//! These definitions are used by all main modules, including profile evaluation, system
//! fitting, and the doublet grid scan.

// -------------------------------------------------------------------------------------------------
// Physical constants and unit conversions
// -------------------------------------------------------------------------------------------------

/// Speed of light in km/s
pub const VLIGHT: f64 = 2.99792458e5;

/// √π
pub const SQRT_PI: f64 = 1.772_453_850_905_516;

/// e²/(mₑc) in cgs units, classical absorption strength per oscillator
pub const E2_MEC: f64 = 8.4480e-3;

/// Nanometers → centimeters
pub const NM_TO_CM: f64 = 1.0e-7;

/// km/s → cm/s
pub const KMS_TO_CMS: f64 = 1.0e5;

/// FWHM of a Gaussian expressed in units of its standard deviation, 2√(2 ln 2)
pub const FWHM_TO_SIGMA: f64 = 2.354_820_045_030_949;

/// χ² margin by which a full doublet template must beat the flat baseline
/// before a grid point counts as a coincidence
pub const DOUBLET_MARGIN: f64 = 3.0;

/// Half-width of the fitting window beyond the outermost transitions of a
/// series, in velocity units
pub const FIT_WINDOW_KMS: f64 = 500.0;

/// Samples per instrumental resolution element on internal profile grids
pub const OVERSAMPLE: f64 = 4.0;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Redshift (dimensionless)
pub type Redshift = f64;
/// Wavelength in nanometers
pub type Nanometer = f64;
/// Velocity in km/s
pub type KmPerSec = f64;
/// Column density as log₁₀(N / cm⁻²)
pub type LogColumnDensity = f64;
/// Unique identifier of a fitted system within a registry
pub type SystId = u64;
