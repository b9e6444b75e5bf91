use core::fmt;

use nalgebra::DMatrix;

use crate::sparse::{CscMatrix, SparseError};

/// Shape and contract violations on the inversion inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum DesignError {
    /// Reference and observed spectra are sampled on different grids.
    SpectralAxisMismatch { reference: usize, observed: usize },
    /// The observation series has no timesteps.
    NoTimesteps,
    /// Number of identifiers does not match the number of reference rows.
    IdentifierCount { ids: usize, rows: usize },
    /// An input matrix holds NaN or infinity.
    NonFinite {
        matrix: &'static str,
        row: usize,
        col: usize,
    },
    /// A coefficient vector does not have length Ns·Nt.
    CoefficientLength {
        expected: usize,
        actual: usize,
        species: usize,
        timesteps: usize,
    },
    /// Sparse assembly failed.
    Sparse(SparseError),
}

impl fmt::Display for DesignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpectralAxisMismatch {
                reference,
                observed,
            } => write!(
                f,
                "spectral axis mismatch: reference spectra have {reference} points, observations have {observed}"
            ),
            Self::NoTimesteps => write!(f, "observation series has no timesteps"),
            Self::IdentifierCount { ids, rows } => {
                write!(f, "{ids} species identifiers for {rows} reference rows")
            }
            Self::NonFinite { matrix, row, col } => {
                write!(f, "non-finite value in {matrix} at ({row}, {col})")
            }
            Self::CoefficientLength {
                expected,
                actual,
                species,
                timesteps,
            } => write!(
                f,
                "coefficient vector length {actual} does not match {species} species x {timesteps} timesteps = {expected}"
            ),
            Self::Sparse(err) => write!(f, "sparse assembly failed: {err}"),
        }
    }
}

impl std::error::Error for DesignError {}

impl From<SparseError> for DesignError {
    fn from(err: SparseError) -> Self {
        Self::Sparse(err)
    }
}

fn check_finite(matrix: &'static str, data: &DMatrix<f64>) -> Result<(), DesignError> {
    for col in 0..data.ncols() {
        for row in 0..data.nrows() {
            if !data[(row, col)].is_finite() {
                return Err(DesignError::NonFinite { matrix, row, col });
            }
        }
    }
    Ok(())
}

/// Reference absorption spectra, one row per candidate species, shape (Ns, Nl).
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSpectra {
    ids: Vec<String>,
    data: DMatrix<f64>,
}

impl ReferenceSpectra {
    pub fn new(ids: Vec<String>, data: DMatrix<f64>) -> Result<Self, DesignError> {
        if ids.len() != data.nrows() {
            return Err(DesignError::IdentifierCount {
                ids: ids.len(),
                rows: data.nrows(),
            });
        }
        check_finite("reference spectra", &data)?;
        Ok(Self { ids, data })
    }

    /// Builds from row-major rows; every row must have the same length.
    pub fn from_rows(ids: Vec<String>, rows: &[Vec<f64>]) -> Result<Self, DesignError> {
        let nl = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != nl) {
            return Err(DesignError::SpectralAxisMismatch {
                reference: nl,
                observed: bad.len(),
            });
        }
        let data = DMatrix::from_fn(rows.len(), nl, |i, j| rows[i][j]);
        Self::new(ids, data)
    }

    pub fn species_count(&self) -> usize {
        self.data.nrows()
    }

    pub fn spectral_len(&self) -> usize {
        self.data.ncols()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn row(&self, species: usize) -> Vec<f64> {
        self.data.row(species).iter().copied().collect()
    }

    /// Keeps the rows flagged in `keep`, preserving order.
    pub fn retain_rows(&self, keep: &[bool]) -> Self {
        let rows: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| k.then_some(i))
            .collect();
        Self {
            ids: rows.iter().map(|&i| self.ids[i].clone()).collect(),
            data: self.data.select_rows(rows.iter()),
        }
    }
}

/// Observed residual absorbance spectra, one row per timestep, shape (Nt, Nl).
#[derive(Debug, Clone, PartialEq)]
pub struct Observations {
    data: DMatrix<f64>,
}

impl Observations {
    pub fn new(data: DMatrix<f64>) -> Result<Self, DesignError> {
        check_finite("observations", &data)?;
        Ok(Self { data })
    }

    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, DesignError> {
        let nl = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().find(|r| r.len() != nl) {
            return Err(DesignError::SpectralAxisMismatch {
                reference: nl,
                observed: bad.len(),
            });
        }
        Self::new(DMatrix::from_fn(rows.len(), nl, |i, j| rows[i][j]))
    }

    pub fn timesteps(&self) -> usize {
        self.data.nrows()
    }

    pub fn spectral_len(&self) -> usize {
        self.data.ncols()
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn row(&self, timestep: usize) -> Vec<f64> {
        self.data.row(timestep).iter().copied().collect()
    }

    /// Row-major flattening, length Nt·Nl.
    pub fn flatten(&self) -> Vec<f64> {
        // The transpose's column-major storage is the row-major order of `data`.
        self.data.transpose().as_slice().to_vec()
    }
}

/// Fails unless both inputs share one spectral grid and `Nt ≥ 1`.
pub fn check_spectral_axes(
    reference: &ReferenceSpectra,
    observations: &Observations,
) -> Result<(), DesignError> {
    if reference.spectral_len() != observations.spectral_len() {
        return Err(DesignError::SpectralAxisMismatch {
            reference: reference.spectral_len(),
            observed: observations.spectral_len(),
        });
    }
    if observations.timesteps() == 0 {
        return Err(DesignError::NoTimesteps);
    }
    Ok(())
}

/// Block-structured observation operator of shape (Nt·Nl, Ns·Nt).
///
/// Column `s·Nt + t` carries reference row `s` in rows `t·Nl .. (t+1)·Nl`,
/// so `A x` with `x` laid out species-major / time-minor gives the flattened
/// modeled series. Zero reference entries are not stored.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    species: usize,
    spectral_len: usize,
    timesteps: usize,
    matrix: CscMatrix,
}

impl DesignMatrix {
    pub fn build(reference: &ReferenceSpectra, timesteps: usize) -> Result<Self, DesignError> {
        if timesteps == 0 {
            return Err(DesignError::NoTimesteps);
        }
        let ns = reference.species_count();
        let nl = reference.spectral_len();
        let data = reference.as_matrix();

        let nnz = (0..ns)
            .map(|s| data.row(s).iter().filter(|v| **v != 0.0).count())
            .sum::<usize>();
        let mut triplets = Vec::with_capacity(nnz * timesteps);
        for s in 0..ns {
            for t in 0..timesteps {
                let col = s * timesteps + t;
                for l in 0..nl {
                    let v = data[(s, l)];
                    if v != 0.0 {
                        triplets.push((t * nl + l, col, v));
                    }
                }
            }
        }

        let matrix = CscMatrix::from_triplets(timesteps * nl, ns * timesteps, &triplets)?;
        Ok(Self {
            species: ns,
            spectral_len: nl,
            timesteps,
            matrix,
        })
    }

    /// Builds `A` for the series in `observations`, validating the grids.
    pub fn for_observations(
        reference: &ReferenceSpectra,
        observations: &Observations,
    ) -> Result<Self, DesignError> {
        check_spectral_axes(reference, observations)?;
        Self::build(reference, observations.timesteps())
    }

    pub fn species(&self) -> usize {
        self.species
    }

    pub fn spectral_len(&self) -> usize {
        self.spectral_len
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    /// Column of the coefficient for `species` at `timestep`.
    pub fn column(&self, species: usize, timestep: usize) -> usize {
        species * self.timesteps + timestep
    }

    pub fn matrix(&self) -> &CscMatrix {
        &self.matrix
    }

    /// Modeled flattened series `A x`.
    pub fn apply(&self, coefficients: &[f64]) -> Result<Vec<f64>, DesignError> {
        let expected = self.species * self.timesteps;
        if coefficients.len() != expected {
            return Err(DesignError::CoefficientLength {
                expected,
                actual: coefficients.len(),
                species: self.species,
                timesteps: self.timesteps,
            });
        }
        Ok(self.matrix.mul_vec(coefficients)?)
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        self.matrix.to_dense()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(ns: usize, nl: usize) -> ReferenceSpectra {
        let ids = (0..ns).map(|s| format!("S{s}")).collect();
        let data = DMatrix::from_fn(ns, nl, |s, l| ((s + 1) * (l + 2)) as f64 * 0.25 - 1.0);
        ReferenceSpectra::new(ids, data).unwrap()
    }

    #[test]
    fn one_hot_coefficient_places_reference_in_its_slice() {
        for &(ns, nl, nt) in &[(1, 1, 1), (2, 5, 3), (3, 7, 4), (4, 3, 1)] {
            let r = reference(ns, nl);
            let a = DesignMatrix::build(&r, nt).unwrap();
            assert_eq!(a.matrix().shape(), (nt * nl, ns * nt));
            for s in 0..ns {
                for t in 0..nt {
                    let mut x = vec![0.0; ns * nt];
                    x[a.column(s, t)] = 1.0;
                    let y = a.apply(&x).unwrap();
                    for step in 0..nt {
                        let slice = &y[step * nl..(step + 1) * nl];
                        if step == t {
                            assert_eq!(slice, r.row(s).as_slice());
                        } else {
                            assert!(slice.iter().all(|v| *v == 0.0));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn zero_reference_entries_are_not_stored() {
        let data = DMatrix::from_row_slice(2, 3, &[1.0, 0.0, 2.0, 0.0, 0.0, 3.0]);
        let r = ReferenceSpectra::new(vec!["a".into(), "b".into()], data).unwrap();
        let a = DesignMatrix::build(&r, 2).unwrap();
        assert_eq!(a.matrix().nnz(), 6);
        assert_eq!(a.matrix().row_indices_of_col(a.column(0, 1)), &[3, 5]);
    }

    #[test]
    fn rejects_mismatched_axes_and_empty_series() {
        let r = reference(2, 4);
        let obs = Observations::new(DMatrix::zeros(3, 5)).unwrap();
        assert_eq!(
            DesignMatrix::for_observations(&r, &obs).unwrap_err(),
            DesignError::SpectralAxisMismatch {
                reference: 4,
                observed: 5
            }
        );
        assert_eq!(DesignMatrix::build(&r, 0).unwrap_err(), DesignError::NoTimesteps);
    }

    #[test]
    fn rejects_non_finite_input() {
        let data = DMatrix::from_row_slice(1, 2, &[1.0, f64::NAN]);
        let err = ReferenceSpectra::new(vec!["a".into()], data).unwrap_err();
        assert!(matches!(err, DesignError::NonFinite { row: 0, col: 1, .. }));
    }

    #[test]
    fn flatten_is_row_major() {
        let obs = Observations::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(obs.flatten(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn retain_rows_keeps_ids_aligned() {
        let r = reference(3, 2);
        let kept = r.retain_rows(&[false, true, true]);
        assert_eq!(kept.ids(), &["S1".to_string(), "S2".to_string()]);
        assert_eq!(kept.row(0), r.row(1));
    }
}
