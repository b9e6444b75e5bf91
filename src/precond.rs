use core::fmt;
use std::time::{Duration, Instant};

use crate::report::SolveStatus;
use crate::sparse::CscMatrix;

/// Budget and tolerance for the preconditioned conjugate gradient path.
#[derive(Debug, Clone)]
pub struct IterativeOptions {
    /// Maximum number of CG iterations.
    pub max_iters: usize,
    /// Converge when ||b - C x||_2 <= rel_tol * ||b||_2.
    pub rel_tol: f64,
    /// Stop after this much wall-clock time, keeping the current iterate.
    pub time_budget: Option<Duration>,
}

impl Default for IterativeOptions {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            rel_tol: 1e-10,
            time_budget: None,
        }
    }
}

// Pivots and curvatures below this fraction of the matching scale of C count as zero.
pub(crate) const PIVOT_RTOL: f64 = 1e-12;

/// Failures of the iterative path that indicate a singular system.
#[derive(Debug, Clone, PartialEq)]
pub enum CgError {
    /// `pᵀ C p` is not positive relative to `‖p‖² max diag(C)`.
    NonPositiveCurvature { iteration: usize, curvature: f64 },
    /// A diagonal entry of C is not positive.
    NonPositiveDiagonal { index: usize, value: f64 },
    /// A preconditioner pivot vanished relative to its diagonal entry of C.
    VanishingPivot { column: usize, pivot: f64 },
}

impl fmt::Display for CgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
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
            Self::VanishingPivot { column, pivot } => {
                write!(f, "vanishing preconditioner pivot {pivot:.3e} at column {column}")
            }
        }
    }
}

impl std::error::Error for CgError {}

/// Zero fill-in incomplete Cholesky factor `L` with `L Lᵀ ≈ C`.
///
/// The factor keeps exactly the lower-triangular sparsity of `C`.
#[derive(Debug, Clone)]
pub struct IncompleteCholesky {
    factor: CscMatrix,
}

/// Pivot that went non-positive, or negligible against `diagonal`, during IC(0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakdown {
    pub column: usize,
    pub pivot: f64,
    /// `C[column, column]` before elimination.
    pub diagonal: f64,
}

impl Breakdown {
    /// The pivot is zero to working precision rather than clearly negative.
    pub fn is_vanishing(&self) -> bool {
        self.pivot.abs() <= PIVOT_RTOL * self.diagonal.abs()
    }
}

impl IncompleteCholesky {
    pub fn factorize(c: &CscMatrix) -> Result<Self, Breakdown> {
        let mut factor = c.lower_triangle();
        let n = factor.ncols();
        for k in 0..n {
            let range = factor.col_range(k);
            let first = range.start;
            if range.is_empty() || factor.row_indices()[first] != k {
                return Err(Breakdown {
                    column: k,
                    pivot: 0.0,
                    diagonal: 0.0,
                });
            }
            let diagonal = c.get(k, k);
            let pivot = factor.values()[first];
            if !(pivot > PIVOT_RTOL * diagonal) || !pivot.is_finite() {
                return Err(Breakdown {
                    column: k,
                    pivot,
                    diagonal,
                });
            }
            let d = pivot.sqrt();
            {
                let values = factor.values_mut();
                values[first] = d;
                for idx in first + 1..range.end {
                    values[idx] /= d;
                }
            }

            // Right-looking update restricted to the existing pattern.
            for a in first + 1..range.end {
                let j = factor.row_indices()[a];
                let l_jk = factor.values()[a];
                for b in a..range.end {
                    let i = factor.row_indices()[b];
                    let l_ik = factor.values()[b];
                    if let Some(pos) = factor.position(i, j) {
                        factor.values_mut()[pos] -= l_ik * l_jk;
                    }
                }
            }
        }
        Ok(Self { factor })
    }

    pub fn factor(&self) -> &CscMatrix {
        &self.factor
    }

    /// z = (L Lᵀ)⁻¹ r
    pub fn apply(&self, r: &[f64], z: &mut [f64]) {
        let l = &self.factor;
        z.copy_from_slice(r);
        for j in 0..l.ncols() {
            let range = l.col_range(j);
            z[j] /= l.values()[range.start];
            let zj = z[j];
            for idx in range.start + 1..range.end {
                z[l.row_indices()[idx]] -= l.values()[idx] * zj;
            }
        }
        for j in (0..l.ncols()).rev() {
            let range = l.col_range(j);
            let mut s = z[j];
            for idx in range.start + 1..range.end {
                s -= l.values()[idx] * z[l.row_indices()[idx]];
            }
            z[j] = s / l.values()[range.start];
        }
    }
}

/// Preconditioner for CG on the regularized normal equations.
#[derive(Debug, Clone)]
pub enum Preconditioner {
    IncompleteCholesky(IncompleteCholesky),
    Jacobi(Vec<f64>),
}

impl Preconditioner {
    /// IC(0) when it factors, Jacobi when IC(0) hits a negative pivot.
    ///
    /// A pivot that vanishes against its diagonal entry means `C` is singular
    /// to working precision, and is reported instead of preconditioned around.
    pub fn build(c: &CscMatrix) -> Result<Self, CgError> {
        match IncompleteCholesky::factorize(c) {
            Ok(ic) => Ok(Self::IncompleteCholesky(ic)),
            Err(breakdown) if breakdown.is_vanishing() => Err(CgError::VanishingPivot {
                column: breakdown.column,
                pivot: breakdown.pivot,
            }),
            Err(breakdown) => {
                log::warn!(
                    "IC(0) broke down at column {} (pivot {:.3e}); using Jacobi preconditioner",
                    breakdown.column,
                    breakdown.pivot
                );
                Self::jacobi(c)
            }
        }
    }

    pub fn jacobi(c: &CscMatrix) -> Result<Self, CgError> {
        let diag = c.diagonal();
        if let Some((index, &value)) = diag.iter().enumerate().find(|(_, v)| !(**v > 0.0)) {
            return Err(CgError::NonPositiveDiagonal { index, value });
        }
        let scale = diag.iter().fold(0.0, |m: f64, d| m.max(*d));
        if let Some((column, &pivot)) =
            diag.iter().enumerate().find(|(_, d)| **d <= PIVOT_RTOL * scale)
        {
            return Err(CgError::VanishingPivot { column, pivot });
        }
        Ok(Self::Jacobi(diag.iter().map(|d| 1.0 / d).collect()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::IncompleteCholesky(_) => "ic0",
            Self::Jacobi(_) => "jacobi",
        }
    }

    pub fn apply(&self, r: &[f64], z: &mut [f64]) {
        match self {
            Self::IncompleteCholesky(ic) => ic.apply(r, z),
            Self::Jacobi(inv_diag) => {
                for ((zi, ri), di) in z.iter_mut().zip(r).zip(inv_diag) {
                    *zi = ri * di;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CgOutcome {
    pub solution: Vec<f64>,
    pub status: SolveStatus,
    pub iterations: usize,
    pub relative_residual: f64,
}

/// Preconditioned conjugate gradient for symmetric positive definite `c`.
///
/// `b` must have length `c.ncols()`.
pub fn conjugate_gradient(
    c: &CscMatrix,
    b: &[f64],
    preconditioner: &Preconditioner,
    options: &IterativeOptions,
) -> Result<CgOutcome, CgError> {
    let n = c.ncols();
    let start = Instant::now();
    let b_norm = l2_norm(b);
    let mut x = vec![0.0; n];
    if b_norm == 0.0 {
        return Ok(CgOutcome {
            solution: x,
            status: SolveStatus::Converged,
            iterations: 0,
            relative_residual: 0.0,
        });
    }

    let scale = c.diagonal().iter().fold(0.0, |m: f64, d| m.max(d.abs()));
    let mut r = b.to_vec();
    let mut z = vec![0.0; n];
    let mut q = vec![0.0; n];
    preconditioner.apply(&r, &mut z);
    let mut p = z.clone();
    let mut rz = dot(&r, &z);
    let mut relative_residual = 1.0;

    for iter in 0..options.max_iters {
        if let Some(budget) = options.time_budget {
            if start.elapsed() >= budget {
                return Ok(CgOutcome {
                    solution: x,
                    status: SolveStatus::TimeBudget,
                    iterations: iter,
                    relative_residual,
                });
            }
        }

        c.mul_vec_into(&p, &mut q);
        let curvature = dot(&p, &q);
        if !(curvature > PIVOT_RTOL * scale * dot(&p, &p)) || !curvature.is_finite() {
            return Err(CgError::NonPositiveCurvature {
                iteration: iter,
                curvature,
            });
        }
        let alpha = rz / curvature;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * q[i];
        }

        relative_residual = l2_norm(&r) / b_norm;
        if relative_residual <= options.rel_tol {
            return Ok(CgOutcome {
                solution: x,
                status: SolveStatus::Converged,
                iterations: iter + 1,
                relative_residual,
            });
        }

        preconditioner.apply(&r, &mut z);
        let rz_next = dot(&r, &z);
        let beta = rz_next / rz;
        for i in 0..n {
            p[i] = z[i] + beta * p[i];
        }
        rz = rz_next;
    }

    Ok(CgOutcome {
        solution: x,
        status: SolveStatus::MaxIterations,
        iterations: options.max_iters,
        relative_residual,
    })
}

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

pub(crate) fn l2_norm(x: &[f64]) -> f64 {
    dot(x, x).sqrt()
}
