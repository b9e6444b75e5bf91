//! Temporally regularized inversion of absorption spectra time series.
//!
//! Given reference spectra `R` (Ns species x Nl points) and observed spectra
//! `Y` (Nt timesteps x Nl points) on one spectral grid, this crate recovers
//! per-species, per-timestep abundances `x` that are sparse across species
//! and smooth in time.
//!
//! How it works (high level):
//! - Prune candidates with a per-timestep Lasso on a few sampled timesteps
//!   (`select_species`).
//! - Build the block design matrix `A` with `y = A x` and a finite-difference
//!   smoother `D = I ⊗ LᵀL`.
//! - Solve `(AᵀA + λD) x = Aᵀy`, directly by sparse QR of `[A; √λ (I ⊗ L)]` or
//!   by preconditioned conjugate gradient.
//! - Report the posterior variance `diag((AᵀA + λD)⁻¹)`, exact or probed.
//!
//! Example:
//! ```rust,no_run
//! use std::sync::Arc;
//! use spectral_inversion_rs::{
//!     invert, select_species, ActiveCompounds, Compound, CompoundRegistry, InversionOptions,
//!     Observations, ReferenceSpectra, SelectorOptions, SpectralBound,
//! };
//!
//! let registry = Arc::new(
//!     CompoundRegistry::new(vec![
//!         Compound::new("CO", "HITRAN", vec![SpectralBound::new(2000.0, 2200.0)]),
//!         Compound::new("N2O", "HITRAN", vec![SpectralBound::new(2150.0, 2250.0)]),
//!     ])
//!     .unwrap(),
//! );
//! let active = ActiveCompounds::all(registry);
//! let grid_len = 64;
//! let rows: Vec<Vec<f64>> = (0..2)
//!     .map(|s| (0..grid_len).map(|l| ((l + s * 7) % 5) as f64).collect())
//!     .collect();
//! let reference = ReferenceSpectra::from_rows(vec!["CO".into(), "N2O".into()], &rows).unwrap();
//! let observations = Observations::from_rows(&[rows[0].clone(), rows[1].clone()]).unwrap();
//!
//! let selection =
//!     select_species(&reference, &observations, &active, &SelectorOptions::default()).unwrap();
//! let inversion =
//!     invert(&selection.reference, &observations, 1e-3, &InversionOptions::default()).unwrap();
//! assert_eq!(inversion.solution().len(), selection.compounds.len() * 2);
//! ```

mod design;
mod lasso;
mod precond;
mod reconstruct;
mod reference;
mod registry;
mod report;
mod selector;
mod smoother;
mod solver;
mod sparse;
mod variance;

pub use design::{check_spectral_axes, DesignError, DesignMatrix, Observations, ReferenceSpectra};
pub use lasso::{
    alpha_grid, coordinate_descent, cross_val_mae, lasso_cv, mean_absolute_error,
    mean_squared_error, r2_score, root_mean_squared_error, KFold, LassoError, LassoFit,
    LassoOptions,
};
pub use precond::{
    conjugate_gradient, Breakdown, CgError, CgOutcome, IncompleteCholesky, IterativeOptions,
    Preconditioner,
};
pub use reconstruct::{dominant_timesteps, reconstruct, sum_squared_difference, Reconstruction};
pub use reference::{
    assemble_reference_row, build_reference_spectra, nearest_index, resample_linear, Conditions,
    ReferenceSynthesizer, SyntheticSpectrum,
};
pub use registry::{
    ActiveCompounds, Compound, CompoundRegistry, RegistryError, SpectralBound, SynthesisParams,
};
pub use report::{
    CrossValidationScore, Reporter, SelectionEvaluation, SolveMethod, SolveStats, SolveStatus,
    StdoutReporter, TimestepReport,
};
pub use selector::{
    sample_timesteps, select_species, select_species_with_reporter, Selection, SelectionError,
    SelectorOptions, DEFAULT_SELECTOR_SEED,
};
pub use smoother::{SmootherKind, TemporalSmoother};
pub use solver::{
    invert, solve_system, InversionError, InversionOptions, Inversion, RegularizedSystem,
    SingularReason, SolvePath,
};
pub use sparse::{CscMatrix, SparseError};
pub use variance::{
    exact_inverse_diagonal, posterior_variance, probed_inverse_diagonal, PosteriorVariance,
    VarianceDiagnostics, VarianceMethod, VarianceMode, DEFAULT_EXACT_LIMIT, DEFAULT_PROBES,
    DEFAULT_PROBE_SEED,
};
pub use faer_core::Parallelism;
