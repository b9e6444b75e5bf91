use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::precond::{conjugate_gradient, IterativeOptions, Preconditioner, PIVOT_RTOL};
use crate::report::SolveStatus;
use crate::solver::{InversionError, RegularizedSystem, SingularReason};
use crate::sparse::CscMatrix;

/// Largest `Ns·Nt` for which `VarianceMode::Auto` computes the exact inverse.
pub const DEFAULT_EXACT_LIMIT: usize = 2048;
/// Probe count used when `Auto` falls back to probing.
pub const DEFAULT_PROBES: usize = 64;
pub const DEFAULT_PROBE_SEED: u64 = 0x5EED_C0DE;

#[derive(Debug, Clone, PartialEq)]
pub enum VarianceMode {
    /// Dense Cholesky inverse of C.
    Exact,
    /// Randomized diagonal estimate with seeded Rademacher probes.
    Probing { probes: usize, seed: u64 },
    /// Exact up to `exact_limit` unknowns, probing beyond.
    Auto { exact_limit: usize },
    /// Do not estimate variance.
    Skip,
}

impl Default for VarianceMode {
    fn default() -> Self {
        Self::Auto {
            exact_limit: DEFAULT_EXACT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarianceMethod {
    Exact,
    Probing { probes: usize },
    Skipped,
}

/// Health of a variance estimate, reported rather than clamped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarianceDiagnostics {
    pub min: f64,
    pub max: f64,
    pub non_finite: usize,
    pub non_positive: usize,
}

impl VarianceDiagnostics {
    pub fn from_diagonal(diagonal: &[f64]) -> Self {
        let mut out = Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            non_finite: 0,
            non_positive: 0,
        };
        for &v in diagonal {
            if !v.is_finite() {
                out.non_finite += 1;
                continue;
            }
            if v <= 0.0 {
                out.non_positive += 1;
            }
            out.min = out.min.min(v);
            out.max = out.max.max(v);
        }
        if diagonal.is_empty() {
            out.min = 0.0;
            out.max = 0.0;
        }
        out
    }

    pub fn is_stable(&self) -> bool {
        self.non_finite == 0 && self.non_positive == 0
    }

    /// max / min; large values flag a near-singular system.
    pub fn dynamic_range(&self) -> f64 {
        if self.min > 0.0 {
            self.max / self.min
        } else {
            f64::INFINITY
        }
    }
}

#[derive(Debug, Clone)]
pub struct PosteriorVariance {
    pub method: VarianceMethod,
    pub diagonal: Vec<f64>,
    pub diagnostics: VarianceDiagnostics,
}

/// Computes `diag(C⁻¹)` for the assembled system according to `mode`.
///
/// The exact route factors a dense copy of `C`, `O((Ns·Nt)²)` in memory. The
/// probing route averages `v ⊙ C⁻¹ v` over Rademacher probes `v`, each solved
/// by preconditioned CG, and stays sparse.
pub fn posterior_variance(
    system: &RegularizedSystem,
    mode: &VarianceMode,
    iterative: &IterativeOptions,
) -> Result<PosteriorVariance, InversionError> {
    let dim = system.dim();
    let resolved = match *mode {
        VarianceMode::Auto { exact_limit } if dim <= exact_limit => VarianceMode::Exact,
        VarianceMode::Auto { .. } => VarianceMode::Probing {
            probes: DEFAULT_PROBES,
            seed: DEFAULT_PROBE_SEED,
        },
        ref other => other.clone(),
    };

    let (method, diagonal) = match resolved {
        VarianceMode::Exact => {
            log::debug!("exact posterior variance, dense {dim}x{dim} inverse");
            let diagonal = exact_inverse_diagonal(system.matrix())
                .map_err(|reason| system.singular(reason))?;
            (VarianceMethod::Exact, diagonal)
        }
        VarianceMode::Probing { probes, seed } => {
            let probes = probes.max(1);
            log::debug!("probed posterior variance, {probes} probes, dim={dim}");
            let diagonal = probed_inverse_diagonal(system.matrix(), probes, seed, iterative)
                .map_err(|reason| system.singular(reason))?;
            (VarianceMethod::Probing { probes }, diagonal)
        }
        VarianceMode::Skip | VarianceMode::Auto { .. } => (VarianceMethod::Skipped, Vec::new()),
    };

    let diagnostics = VarianceDiagnostics::from_diagonal(&diagonal);
    Ok(PosteriorVariance {
        method,
        diagonal,
        diagnostics,
    })
}

/// Diagonal of the dense inverse of a symmetric positive definite `c`.
pub fn exact_inverse_diagonal(c: &CscMatrix) -> Result<Vec<f64>, SingularReason> {
    let dense = c.to_dense();
    let scale = c.diagonal();
    if let Some((index, &value)) = scale.iter().enumerate().find(|(_, v)| !(**v > 0.0)) {
        return Err(SingularReason::NonPositiveDiagonal { index, value });
    }
    let Some(chol) = dense.cholesky() else {
        return Err(SingularReason::NotPositiveDefinite {
            index: 0,
            pivot: f64::NAN,
        });
    };
    let l = chol.l();
    for (index, &c_ii) in scale.iter().enumerate() {
        let pivot = l[(index, index)] * l[(index, index)];
        if pivot <= PIVOT_RTOL * c_ii {
            return Err(SingularReason::NotPositiveDefinite { index, pivot });
        }
    }
    let inverse = chol.inverse();
    Ok(inverse.diagonal().iter().copied().collect())
}

/// Seeded Rademacher estimate of `diag(c⁻¹)`.
pub fn probed_inverse_diagonal(
    c: &CscMatrix,
    probes: usize,
    seed: u64,
    iterative: &IterativeOptions,
) -> Result<Vec<f64>, SingularReason> {
    let n = c.ncols();
    let preconditioner = Preconditioner::build(c)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut acc = vec![0.0; n];
    let mut probe = vec![0.0; n];
    for k in 0..probes {
        for v in &mut probe {
            *v = if rng.gen::<bool>() { 1.0 } else { -1.0 };
        }
        let outcome = conjugate_gradient(c, &probe, &preconditioner, iterative)?;
        if outcome.status != SolveStatus::Converged {
            log::warn!(
                "variance probe {k} stopped early ({:?}), relative residual {:.3e}",
                outcome.status,
                outcome.relative_residual
            );
        }
        for ((a, v), z) in acc.iter_mut().zip(&probe).zip(&outcome.solution) {
            *a += v * z;
        }
    }
    let scale = 1.0 / probes as f64;
    Ok(acc.into_iter().map(|a| a * scale).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spd(n: usize) -> CscMatrix {
        let mut triplets = Vec::new();
        for i in 0..n {
            triplets.push((i, i, 4.0 + i as f64));
            if i + 1 < n {
                triplets.push((i + 1, i, -1.0));
                triplets.push((i, i + 1, -1.0));
            }
        }
        CscMatrix::from_triplets(n, n, &triplets).unwrap()
    }

    #[test]
    fn exact_diagonal_matches_dense_inverse() {
        let c = spd(5);
        let diag = exact_inverse_diagonal(&c).unwrap();
        let inverse = c.to_dense().try_inverse().unwrap();
        for i in 0..5 {
            assert!((diag[i] - inverse[(i, i)]).abs() <= 1e-12);
        }
    }

    #[test]
    fn exact_diagonal_rejects_rank_deficient() {
        // [[1, 1], [1, 1]] is PSD but singular.
        let c = CscMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (1, 0, 1.0), (0, 1, 1.0), (1, 1, 1.0)])
            .unwrap();
        let err = exact_inverse_diagonal(&c).unwrap_err();
        assert!(matches!(err, SingularReason::NotPositiveDefinite { .. }));
    }

    #[test]
    fn probing_is_exact_for_diagonal_matrices() {
        // v ⊙ D⁻¹ v = 1/d for any ±1 probe.
        let c = CscMatrix::from_triplets(3, 3, &[(0, 0, 2.0), (1, 1, 4.0), (2, 2, 8.0)]).unwrap();
        let diag = probed_inverse_diagonal(&c, 3, 7, &IterativeOptions::default()).unwrap();
        assert!((diag[0] - 0.5).abs() <= 1e-12);
        assert!((diag[1] - 0.25).abs() <= 1e-12);
        assert!((diag[2] - 0.125).abs() <= 1e-12);
    }

    #[test]
    fn probing_approaches_exact_diagonal() {
        let c = spd(30);
        let exact = exact_inverse_diagonal(&c).unwrap();
        let probed = probed_inverse_diagonal(&c, 400, 11, &IterativeOptions::default()).unwrap();
        for (e, p) in exact.iter().zip(&probed) {
            assert!((e - p).abs() / e <= 0.1, "exact {e}, probed {p}");
        }
    }

    #[test]
    fn probing_is_reproducible_with_a_seed() {
        let c = spd(8);
        let opts = IterativeOptions::default();
        let a = probed_inverse_diagonal(&c, 5, 42, &opts).unwrap();
        let b = probed_inverse_diagonal(&c, 5, 42, &opts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn diagnostics_count_unstable_entries() {
        let d = VarianceDiagnostics::from_diagonal(&[1.0, f64::NAN, -2.0, 4.0]);
        assert_eq!(d.non_finite, 1);
        assert_eq!(d.non_positive, 1);
        assert!(!d.is_stable());
        assert_eq!(d.max, 4.0);
        let ok = VarianceDiagnostics::from_diagonal(&[0.5, 2.0]);
        assert!(ok.is_stable());
        assert_eq!(ok.dynamic_range(), 4.0);
    }
}
