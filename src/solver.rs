use core::fmt;
use std::time::Instant;

use dyn_stack::{GlobalPodBuffer, PodStack, ReborrowMut};
use faer_core::mat;
use faer_core::{Conj, Parallelism};
use faer_sparse::qr::{factorize_symbolic_qr, QrSymbolicParams};
use faer_sparse::SupernodalThreshold;

use crate::design::{DesignError, DesignMatrix, Observations, ReferenceSpectra};
use crate::precond::{
    conjugate_gradient, l2_norm, CgError, IterativeOptions, Preconditioner, PIVOT_RTOL,
};
use crate::reconstruct::dominant_timestep;
use crate::report::{emit_line, format_duration, SolveMethod, SolveStats, SolveStatus};
use crate::smoother::{SmootherKind, TemporalSmoother};
use crate::sparse::{CscMatrix, SparseError};
use crate::variance::{posterior_variance, PosteriorVariance, VarianceMode};

/// Why the regularized system could not be inverted.
#[derive(Debug, Clone, PartialEq)]
pub enum SingularReason {
    /// A species has an all-zero reference row, so its coefficients are unidentifiable.
    ZeroReferenceRow { species: usize },
    /// The augmented least-squares system has fewer rows than unknowns.
    Underdetermined { rows: usize, cols: usize },
    /// Cholesky of C found a vanishing or negative pivot.
    NotPositiveDefinite { index: usize, pivot: f64 },
    /// A factorization pivot of C vanished relative to `C[column, column]`.
    RankDeficient { column: usize, pivot: f64 },
    /// The direct solve produced NaN or infinity.
    NonFiniteSolution { index: usize },
    /// Conjugate gradient hit non-positive curvature.
    NonPositiveCurvature { iteration: usize, curvature: f64 },
    /// C has a non-positive diagonal entry.
    NonPositiveDiagonal { index: usize, value: f64 },
}

impl fmt::Display for SingularReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroReferenceRow { species } => {
                write!(f, "reference row of species {species} is identically zero")
            }
            Self::Underdetermined { rows, cols } => {
                write!(f, "augmented system has {rows} rows for {cols} unknowns")
            }
            Self::NotPositiveDefinite { index, pivot } => {
                write!(f, "Cholesky pivot {pivot:.3e} at index {index}")
            }
            Self::RankDeficient { column, pivot } => {
                write!(f, "rank deficient: pivot {pivot:.3e} at column {column}")
            }
            Self::NonFiniteSolution { index } => {
                write!(f, "non-finite solution entry at index {index}")
            }
            Self::NonPositiveCurvature {
                iteration,
                curvature,
            } => write!(
                f,
                "non-positive curvature {curvature:.3e} at CG iteration {iteration}"
            ),
            Self::NonPositiveDiagonal { index, value } => {
                write!(f, "non-positive diagonal entry {value:.3e} at index {index}")
            }
        }
    }
}

impl From<CgError> for SingularReason {
    fn from(err: CgError) -> Self {
        match err {
            CgError::NonPositiveCurvature {
                iteration,
                curvature,
            } => Self::NonPositiveCurvature {
                iteration,
                curvature,
            },
            CgError::NonPositiveDiagonal { index, value } => {
                Self::NonPositiveDiagonal { index, value }
            }
            CgError::VanishingPivot { column, pivot } => Self::RankDeficient { column, pivot },
        }
    }
}

/// Errors from assembling or solving the regularized inversion.
#[derive(Debug)]
pub enum InversionError {
    /// Inputs violate the shape contract.
    Design(DesignError),
    /// Sparse operator assembly failed.
    Sparse(SparseError),
    /// There is nothing to invert.
    NoSpecies { timesteps: usize },
    /// Lambda is negative or not finite.
    InvalidLambda { lambda: f64 },
    /// `C = AᵀA + λD` is singular; retry with a different lambda or species set.
    Singular {
        lambda: f64,
        dim: usize,
        reason: SingularReason,
    },
    /// faer reported an error during factorization.
    Faer(faer_sparse::FaerError),
    /// Workspace requirement overflowed.
    WorkspaceOverflow,
    /// Workspace allocation failed.
    WorkspaceAlloc,
}

impl fmt::Display for InversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Design(err) => write!(f, "{err}"),
            Self::Sparse(err) => write!(f, "sparse operator error: {err}"),
            Self::NoSpecies { timesteps } => {
                write!(f, "no species to invert ({timesteps} timesteps)")
            }
            Self::InvalidLambda { lambda } => {
                write!(f, "regularization strength must be finite and >= 0 (got {lambda})")
            }
            Self::Singular {
                lambda,
                dim,
                reason,
            } => write!(
                f,
                "singular regularized system (lambda={lambda:.3e}, dim={dim}): {reason}"
            ),
            Self::Faer(err) => write!(f, "faer error: {err:?}"),
            Self::WorkspaceOverflow => write!(f, "workspace size overflow"),
            Self::WorkspaceAlloc => write!(f, "workspace allocation failed"),
        }
    }
}

impl std::error::Error for InversionError {}

impl From<DesignError> for InversionError {
    fn from(err: DesignError) -> Self {
        Self::Design(err)
    }
}

impl From<SparseError> for InversionError {
    fn from(err: SparseError) -> Self {
        Self::Sparse(err)
    }
}

/// How `C x = Aᵀy` is solved.
#[derive(Debug, Clone, Default)]
pub enum SolvePath {
    /// Sparse QR of `[A; √λ (I ⊗ L)]`, exact to working precision.
    #[default]
    Direct,
    /// IC(0)-preconditioned conjugate gradient; cheaper in memory, stops at
    /// the configured tolerance or budget.
    Preconditioned(IterativeOptions),
}

/// Options controlling a Tikhonov inversion.
#[derive(Debug, Clone)]
pub struct InversionOptions {
    pub smoother: SmootherKind,
    pub solve_path: SolvePath,
    pub variance: VarianceMode,
    /// Keep `C` in the result for follow-on covariance analysis.
    pub retain_system: bool,
    pub parallelism: Parallelism,
    /// Emit a stage summary to stdout (or the log when enabled).
    pub verbose: bool,
}

impl Default for InversionOptions {
    fn default() -> Self {
        Self {
            smoother: SmootherKind::default(),
            solve_path: SolvePath::default(),
            variance: VarianceMode::default(),
            retain_system: true,
            parallelism: Parallelism::None,
            verbose: false,
        }
    }
}

impl InversionOptions {
    /// Iteration budget used by CG, whether for the solve or for variance probes.
    pub fn iterative(&self) -> IterativeOptions {
        match &self.solve_path {
            SolvePath::Preconditioned(options) => options.clone(),
            SolvePath::Direct => IterativeOptions::default(),
        }
    }
}

/// The assembled normal equations `C x = Aᵀy` with `C = AᵀA + λ (I ⊗ D_t)`.
#[derive(Debug, Clone)]
pub struct RegularizedSystem {
    design: DesignMatrix,
    smoother: TemporalSmoother,
    matrix: CscMatrix,
    rhs: Vec<f64>,
    observed: Vec<f64>,
    lambda: f64,
}

impl RegularizedSystem {
    pub fn assemble(
        reference: &ReferenceSpectra,
        observations: &Observations,
        lambda: f64,
        smoother: SmootherKind,
    ) -> Result<Self, InversionError> {
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(InversionError::InvalidLambda { lambda });
        }
        let design = DesignMatrix::for_observations(reference, observations)?;
        let ns = design.species();
        let nt = design.timesteps();
        if ns == 0 {
            return Err(InversionError::NoSpecies { timesteps: nt });
        }
        let dim = ns * nt;
        let data = reference.as_matrix();
        if let Some(species) = (0..ns).find(|&s| data.row(s).iter().all(|v| *v == 0.0)) {
            return Err(InversionError::Singular {
                lambda,
                dim,
                reason: SingularReason::ZeroReferenceRow { species },
            });
        }

        let smoother = TemporalSmoother::new(smoother, nt)?;
        let regularizer = smoother.regularizer(ns)?;
        let observed = observations.flatten();
        let matrix = design.matrix().gram()?.add_scaled(&regularizer, lambda)?;
        let rhs = design.matrix().mul_transpose_vec(&observed)?;
        log::debug!(
            "assembled C: dim={dim}, nnz={}, A nnz={}, lambda={lambda:.3e}",
            matrix.nnz(),
            design.matrix().nnz()
        );

        Ok(Self {
            design,
            smoother,
            matrix,
            rhs,
            observed,
            lambda,
        })
    }

    /// Ns·Nt.
    pub fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn species(&self) -> usize {
        self.design.species()
    }

    pub fn timesteps(&self) -> usize {
        self.design.timesteps()
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn design(&self) -> &DesignMatrix {
        &self.design
    }

    pub fn smoother(&self) -> &TemporalSmoother {
        &self.smoother
    }

    /// `C = AᵀA + λD`.
    pub fn matrix(&self) -> &CscMatrix {
        &self.matrix
    }

    /// `Aᵀy`.
    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }

    /// Row-major flattened observations `y`.
    pub fn observed(&self) -> &[f64] {
        &self.observed
    }

    pub fn into_matrix(self) -> CscMatrix {
        self.matrix
    }

    pub(crate) fn singular(&self, reason: SingularReason) -> InversionError {
        InversionError::Singular {
            lambda: self.lambda,
            dim: self.dim(),
            reason,
        }
    }

    /// `||C x - Aᵀy|| / ||Aᵀy||`.
    pub fn relative_residual(&self, x: &[f64]) -> Result<f64, InversionError> {
        let cx = self.matrix.mul_vec(x)?;
        let r: Vec<f64> = cx.iter().zip(&self.rhs).map(|(a, b)| a - b).collect();
        let b_norm = l2_norm(&self.rhs);
        let r_norm = l2_norm(&r);
        Ok(if b_norm > 0.0 { r_norm / b_norm } else { r_norm })
    }
}

/// Solves `C x = Aᵀy` along the requested path.
pub fn solve_system(
    system: &RegularizedSystem,
    path: &SolvePath,
    parallelism: Parallelism,
) -> Result<(Vec<f64>, SolveStats), InversionError> {
    let start = Instant::now();
    let (solution, method, status, iterations) = match path {
        SolvePath::Direct => {
            let x = solve_direct(system, parallelism)?;
            (x, SolveMethod::DirectQr, SolveStatus::Converged, 1)
        }
        SolvePath::Preconditioned(options) => {
            let preconditioner = Preconditioner::build(system.matrix())
                .map_err(|err| system.singular(err.into()))?;
            let outcome =
                conjugate_gradient(system.matrix(), system.rhs(), &preconditioner, options)
                    .map_err(|err| system.singular(err.into()))?;
            if outcome.status != SolveStatus::Converged {
                log::warn!(
                    "preconditioned solve stopped early ({:?}) after {} iterations, relative residual {:.3e}",
                    outcome.status,
                    outcome.iterations,
                    outcome.relative_residual
                );
            }
            (
                outcome.solution,
                SolveMethod::Preconditioned {
                    preconditioner: preconditioner.name(),
                },
                outcome.status,
                outcome.iterations,
            )
        }
    };

    let relative_residual = system.relative_residual(&solution)?;
    let stats = SolveStats {
        method,
        status,
        iterations,
        relative_residual,
        elapsed: start.elapsed(),
    };
    log::debug!(
        "solve {:?}: {:?} in {} iterations, relative residual {:.3e}",
        stats.method,
        stats.status,
        stats.iterations,
        stats.relative_residual
    );
    Ok((solution, stats))
}

// Least squares on [A; √λ (I ⊗ L)] x ≈ [y; 0], whose normal equations are C x = Aᵀy.
fn solve_direct(
    system: &RegularizedSystem,
    parallelism: Parallelism,
) -> Result<Vec<f64>, InversionError> {
    let n = system.dim();
    let a = system.design().matrix();
    let factor = system.smoother().regularizer_factor(system.species())?;
    let augmented = if system.lambda() > 0.0 && factor.nrows() > 0 {
        a.vstack(&factor.scaled(system.lambda().sqrt()))?
    } else {
        a.clone()
    };
    let m = augmented.nrows();
    if m < n {
        return Err(system.singular(SingularReason::Underdetermined { rows: m, cols: n }));
    }

    // Simplicial storage keeps R in the caller's buffers, where its diagonal is checked.
    let params = QrSymbolicParams {
        supernodal_flop_ratio_threshold: SupernodalThreshold::FORCE_SIMPLICIAL,
        ..Default::default()
    };
    let symbolic_qr =
        factorize_symbolic_qr(augmented.as_symbolic(), params).map_err(InversionError::Faer)?;
    let factor_req = symbolic_qr
        .factorize_numeric_qr_req::<f64>(parallelism)
        .map_err(|_| InversionError::WorkspaceOverflow)?;
    let solve_req = symbolic_qr
        .solve_in_place_req::<f64>(1, parallelism)
        .map_err(|_| InversionError::WorkspaceOverflow)?;
    let req = factor_req
        .try_or(solve_req)
        .map_err(|_| InversionError::WorkspaceOverflow)?;
    let mut qr_stack = GlobalPodBuffer::try_new(req).map_err(|_| InversionError::WorkspaceAlloc)?;

    let mut qr_indices = vec![0usize; symbolic_qr.len_indices()];
    let mut qr_values = vec![0.0; symbolic_qr.len_values()];

    // Observed block first, zeros for the penalty rows.
    let mut rhs = vec![0.0; m];
    rhs[..system.observed().len()].copy_from_slice(system.observed());

    let mut stack = PodStack::new(&mut qr_stack);
    let qr = symbolic_qr.factorize_numeric_qr::<f64>(
        &mut qr_indices,
        &mut qr_values,
        augmented.as_faer(),
        parallelism,
        stack.rb_mut(),
    );

    let mut rhs_mat = mat::from_column_major_slice_mut::<f64>(&mut rhs, m, 1);
    let mut stack = PodStack::new(&mut qr_stack);
    qr.solve_in_place_with_conj(Conj::No, rhs_mat.rb_mut(), parallelism, stack.rb_mut());

    let (col_perm, _) = symbolic_qr.col_perm().into_arrays();
    let deficient = vanishing_r_pivot(&qr_indices, &qr_values, col_perm, system.matrix());
    if let Some((column, pivot)) = deficient {
        return Err(system.singular(SingularReason::RankDeficient { column, pivot }));
    }

    let solution = rhs[..n].to_vec();
    if let Some(index) = solution.iter().position(|v| !v.is_finite()) {
        return Err(system.singular(SingularReason::NonFiniteSolution { index }));
    }
    Ok(solution)
}

// R_jj² equals the Cholesky pivot of C at permuted column j, so it is held to the same
// relative tolerance. Layout: R column pointers (n + 1), then R row indices; R values
// lead the value buffer.
fn vanishing_r_pivot(
    indices: &[usize],
    values: &[f64],
    col_perm: &[usize],
    c: &CscMatrix,
) -> Option<(usize, f64)> {
    let n = col_perm.len();
    let (col_ptrs, row_indices) = indices.split_at(n + 1);
    for j in 0..n {
        let range = col_ptrs[j]..col_ptrs[j + 1];
        let r_jj = row_indices[range.clone()]
            .iter()
            .position(|&row| row == j)
            .map_or(0.0, |pos| values[range.start + pos]);
        let column = col_perm[j];
        let pivot = r_jj * r_jj;
        if !(pivot > PIVOT_RTOL * c.get(column, column)) {
            return Some((column, pivot));
        }
    }
    None
}

/// Result of one Tikhonov inversion.
#[derive(Debug, Clone)]
pub struct Inversion {
    species: usize,
    timesteps: usize,
    lambda: f64,
    solution: Vec<f64>,
    variance: PosteriorVariance,
    system: Option<CscMatrix>,
    stats: SolveStats,
}

impl Inversion {
    /// Maximum a posteriori coefficients, species-major / time-minor.
    pub fn solution(&self) -> &[f64] {
        &self.solution
    }

    /// Posterior variance per coefficient; empty when variance was skipped.
    pub fn sigma(&self) -> &[f64] {
        &self.variance.diagonal
    }

    pub fn variance(&self) -> &PosteriorVariance {
        &self.variance
    }

    /// `C = AᵀA + λD`, when retained.
    pub fn system(&self) -> Option<&CscMatrix> {
        self.system.as_ref()
    }

    pub fn stats(&self) -> &SolveStats {
        &self.stats
    }

    pub fn species(&self) -> usize {
        self.species
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Coefficient series of one species across time.
    pub fn species_series(&self, species: usize) -> &[f64] {
        &self.solution[species * self.timesteps..(species + 1) * self.timesteps]
    }

    /// Timestep with the largest coefficient, per species.
    pub fn dominant_timesteps(&self) -> Vec<usize> {
        (0..self.species)
            .map(|s| dominant_timestep(self.species_series(s)))
            .collect()
    }
}

/// Temporally regularized inversion of `observations` onto `reference`.
///
/// Computes the posterior variance before the solve so both stages see the
/// same `C`; either stage failing on a singular system aborts the call.
pub fn invert(
    reference: &ReferenceSpectra,
    observations: &Observations,
    lambda: f64,
    options: &InversionOptions,
) -> Result<Inversion, InversionError> {
    let start_time = options.verbose.then(Instant::now);
    log::info!(
        "tikhonov inversion: {} species x {} timesteps x {} points, lambda={lambda:.3e}",
        reference.species_count(),
        observations.timesteps(),
        reference.spectral_len()
    );

    let system =
        RegularizedSystem::assemble(reference, observations, lambda, options.smoother)?;
    let variance = posterior_variance(&system, &options.variance, &options.iterative())?;
    if !variance.diagnostics.is_stable() {
        log::warn!(
            "posterior variance has {} non-finite and {} non-positive entries",
            variance.diagnostics.non_finite,
            variance.diagnostics.non_positive
        );
    }
    let (solution, stats) = solve_system(&system, &options.solve_path, options.parallelism)?;

    if let Some(start) = start_time {
        emit_line(&format!(
            "inversion: dim={} method={:?} status={:?} residual={:.3e} variance={:?}",
            system.dim(),
            stats.method,
            stats.status,
            stats.relative_residual,
            variance.method
        ));
        emit_line(&format!("time: {}", format_duration(start.elapsed())));
    }

    let species = system.species();
    let timesteps = system.timesteps();
    Ok(Inversion {
        species,
        timesteps,
        lambda,
        solution,
        variance,
        system: options.retain_system.then(|| system.into_matrix()),
        stats,
    })
}
