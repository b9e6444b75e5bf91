use crate::sparse::{CscMatrix, SparseError};

/// Finite-difference order used for the temporal roughness penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmootherKind {
    /// Penalizes `Σ (x[t+1] - x[t])²`.
    #[default]
    FirstDifference,
    /// Penalizes `Σ (x[t+2] - 2 x[t+1] + x[t])²`.
    SecondDifference,
}

impl SmootherKind {
    pub fn order(self) -> usize {
        match self {
            Self::FirstDifference => 1,
            Self::SecondDifference => 2,
        }
    }

    fn stencil(self) -> &'static [f64] {
        match self {
            Self::FirstDifference => &[-1.0, 1.0],
            Self::SecondDifference => &[1.0, -2.0, 1.0],
        }
    }
}

/// Temporal roughness penalty `D_t = Lᵀ L` for one species' coefficient series.
///
/// `L` is the `(Nt - order, Nt)` difference operator, so `D_t` is symmetric
/// positive semidefinite and annihilates constant sequences. Series shorter
/// than the stencil get an empty `L` and a zero penalty.
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    kind: SmootherKind,
    timesteps: usize,
    difference: CscMatrix,
    penalty: CscMatrix,
}

impl TemporalSmoother {
    pub fn new(kind: SmootherKind, timesteps: usize) -> Result<Self, SparseError> {
        let stencil = kind.stencil();
        let rows = timesteps.saturating_sub(kind.order());
        let mut triplets = Vec::with_capacity(rows * stencil.len());
        for i in 0..rows {
            for (k, &w) in stencil.iter().enumerate() {
                triplets.push((i, i + k, w));
            }
        }
        let difference = CscMatrix::from_triplets(rows, timesteps, &triplets)?;
        let penalty = difference.gram()?;
        Ok(Self {
            kind,
            timesteps,
            difference,
            penalty,
        })
    }

    pub fn kind(&self) -> SmootherKind {
        self.kind
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    /// The difference operator `L`.
    pub fn difference_operator(&self) -> &CscMatrix {
        &self.difference
    }

    /// The (Nt, Nt) penalty `D_t = Lᵀ L`.
    pub fn penalty(&self) -> &CscMatrix {
        &self.penalty
    }

    /// Full regularizer `I_Ns ⊗ D_t`, smoothing each species independently.
    pub fn regularizer(&self, species: usize) -> Result<CscMatrix, SparseError> {
        CscMatrix::identity(species).kron(&self.penalty)
    }

    /// Square-root factor `I_Ns ⊗ L` of the full regularizer.
    pub fn regularizer_factor(&self, species: usize) -> Result<CscMatrix, SparseError> {
        CscMatrix::identity(species).kron(&self.difference)
    }

    /// `seqᵀ D_t seq` for a single species series of length Nt.
    pub fn penalty_of(&self, seq: &[f64]) -> Option<f64> {
        let diff = self.difference.mul_vec(seq).ok()?;
        Some(diff.iter().map(|d| d * d).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_sequences_have_zero_penalty() {
        for kind in [SmootherKind::FirstDifference, SmootherKind::SecondDifference] {
            for nt in 1..12 {
                let smoother = TemporalSmoother::new(kind, nt).unwrap();
                let seq = vec![3.25; nt];
                let p = smoother.penalty_of(&seq).unwrap();
                assert!(p.abs() <= 1e-12, "{kind:?} nt={nt} penalty={p}");
                let applied = smoother.penalty().mul_vec(&seq).unwrap();
                assert!(applied.iter().all(|v| v.abs() <= 1e-12));
            }
        }
    }

    #[test]
    fn first_difference_penalty_is_tridiagonal() {
        let smoother = TemporalSmoother::new(SmootherKind::FirstDifference, 4).unwrap();
        let d = smoother.penalty().to_dense();
        let expected = [
            [1.0, -1.0, 0.0, 0.0],
            [-1.0, 2.0, -1.0, 0.0],
            [0.0, -1.0, 2.0, -1.0],
            [0.0, 0.0, -1.0, 1.0],
        ];
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(d[(i, j)], expected[i][j]);
            }
        }
    }

    #[test]
    fn penalty_is_symmetric_psd() {
        let smoother = TemporalSmoother::new(SmootherKind::SecondDifference, 7).unwrap();
        assert!(smoother.penalty().is_symmetric(0.0));
        let eig = smoother.penalty().to_dense().symmetric_eigenvalues();
        assert!(eig.iter().all(|&e| e >= -1e-10));
    }

    #[test]
    fn penalty_grows_with_roughness() {
        let smoother = TemporalSmoother::new(SmootherKind::FirstDifference, 5).unwrap();
        let smooth = smoother.penalty_of(&[0.0, 0.1, 0.2, 0.3, 0.4]).unwrap();
        let rough = smoother.penalty_of(&[0.0, 1.0, 0.0, 1.0, 0.0]).unwrap();
        assert!(rough > smooth);
        let curvature = TemporalSmoother::new(SmootherKind::SecondDifference, 5).unwrap();
        assert!(curvature.penalty_of(&[0.0, 0.1, 0.2, 0.3, 0.4]).unwrap() < 1e-20);
    }

    #[test]
    fn short_series_have_empty_operator() {
        let smoother = TemporalSmoother::new(SmootherKind::SecondDifference, 2).unwrap();
        assert_eq!(smoother.difference_operator().shape(), (0, 2));
        assert_eq!(smoother.penalty().nnz(), 0);
        let single = TemporalSmoother::new(SmootherKind::FirstDifference, 1).unwrap();
        assert_eq!(single.penalty().shape(), (1, 1));
    }

    #[test]
    fn regularizer_is_block_diagonal_over_species() {
        let smoother = TemporalSmoother::new(SmootherKind::FirstDifference, 3).unwrap();
        let d = smoother.regularizer(2).unwrap();
        assert_eq!(d.shape(), (6, 6));
        assert_eq!(d.get(0, 3), 0.0);
        assert_eq!(d.get(2, 3), 0.0);
        assert_eq!(d.get(3, 4), -1.0);
        assert_eq!(smoother.regularizer_factor(2).unwrap().shape(), (4, 6));
    }
}
