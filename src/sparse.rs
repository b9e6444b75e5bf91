use core::fmt;
use core::ops::Range;

use faer_core::sparse::ops::binary_op;
use faer_core::sparse::{CreationError, SparseColMat, SparseColMatRef, SymbolicSparseColMatRef};
use faer_core::FaerError;
use nalgebra::DMatrix;

/// Compressed sparse column matrix with sorted row indices per column.
///
/// Every operator in the inversion (design matrix, smoother, regularized
/// system) is assembled through faer's `SparseColMat` and kept in this form,
/// which hands out borrowed faer views for the sparse QR.
#[derive(Debug, Clone, PartialEq)]
pub struct CscMatrix {
    nrows: usize,
    ncols: usize,
    col_ptrs: Vec<usize>,
    row_indices: Vec<usize>,
    values: Vec<f64>,
}

/// Validation and shape errors for sparse matrices.
#[derive(Debug, Clone, PartialEq)]
pub enum SparseError {
    /// col_ptrs length is not ncols + 1.
    ColPtrLen { expected: usize, actual: usize },
    /// col_ptrs[0] is not 0.
    ColPtrStart { value: usize },
    /// col_ptrs is not non-decreasing.
    ColPtrNotMonotonic { col: usize, prev: usize, next: usize },
    /// col_ptrs[ncols] does not match row_indices length.
    ColPtrOutOfBounds { last: usize, row_indices_len: usize },
    /// values and row_indices differ in length.
    ValuesLen { expected: usize, actual: usize },
    /// A row index is >= nrows.
    RowIndexOutOfBounds { col: usize, row: usize, nrows: usize },
    /// Row indices in a column are not strictly increasing.
    RowIndexNotSorted { col: usize, prev: usize, next: usize },
    /// A triplet lies outside the matrix.
    TripletOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },
    /// Operand shapes are incompatible.
    ShapeMismatch {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },
    /// A dense vector has the wrong length for the operation.
    VectorLen { expected: usize, actual: usize },
    /// faer failed to allocate or index the result.
    Faer(FaerError),
}

impl fmt::Display for SparseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColPtrLen { expected, actual } => {
                write!(f, "col_ptrs length {actual} does not match expected {expected}")
            }
            Self::ColPtrStart { value } => {
                write!(f, "col_ptrs must start at 0 (got {value})")
            }
            Self::ColPtrNotMonotonic { col, prev, next } => {
                write!(f, "col_ptrs not monotonic at col {col}: {prev} > {next}")
            }
            Self::ColPtrOutOfBounds {
                last,
                row_indices_len,
            } => {
                write!(
                    f,
                    "col_ptrs end {last} does not match row_indices length {row_indices_len}"
                )
            }
            Self::ValuesLen { expected, actual } => {
                write!(f, "values length {actual} does not match expected {expected}")
            }
            Self::RowIndexOutOfBounds { col, row, nrows } => {
                write!(f, "row index {row} in col {col} exceeds nrows {nrows}")
            }
            Self::RowIndexNotSorted { col, prev, next } => {
                write!(f, "row indices not sorted in col {col}: {prev} >= {next}")
            }
            Self::TripletOutOfBounds {
                row,
                col,
                nrows,
                ncols,
            } => {
                write!(f, "triplet ({row}, {col}) outside {nrows}x{ncols} matrix")
            }
            Self::ShapeMismatch { op, left, right } => {
                write!(
                    f,
                    "{op}: incompatible shapes {}x{} and {}x{}",
                    left.0, left.1, right.0, right.1
                )
            }
            Self::VectorLen { expected, actual } => {
                write!(f, "vector length {actual} does not match expected {expected}")
            }
            Self::Faer(err) => write!(f, "faer error: {err:?}"),
        }
    }
}

impl std::error::Error for SparseError {}

impl From<FaerError> for SparseError {
    fn from(err: FaerError) -> Self {
        Self::Faer(err)
    }
}

impl CscMatrix {
    /// Creates a validated CSC matrix.
    ///
    /// Requirements:
    /// - `col_ptrs.len() == ncols + 1`
    /// - `col_ptrs` is non-decreasing and starts at `0`
    /// - `col_ptrs[ncols] == row_indices.len() == values.len()`
    /// - row indices are strictly increasing and `< nrows` within each column
    pub fn new(
        nrows: usize,
        ncols: usize,
        col_ptrs: Vec<usize>,
        row_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self, SparseError> {
        let expected = ncols + 1;
        if col_ptrs.len() != expected {
            return Err(SparseError::ColPtrLen {
                expected,
                actual: col_ptrs.len(),
            });
        }
        if col_ptrs[0] != 0 {
            return Err(SparseError::ColPtrStart { value: col_ptrs[0] });
        }
        for col in 0..ncols {
            let prev = col_ptrs[col];
            let next = col_ptrs[col + 1];
            if prev > next {
                return Err(SparseError::ColPtrNotMonotonic { col, prev, next });
            }
        }
        let last = col_ptrs[ncols];
        if last != row_indices.len() {
            return Err(SparseError::ColPtrOutOfBounds {
                last,
                row_indices_len: row_indices.len(),
            });
        }
        if values.len() != row_indices.len() {
            return Err(SparseError::ValuesLen {
                expected: row_indices.len(),
                actual: values.len(),
            });
        }

        for col in 0..ncols {
            let rows = &row_indices[col_ptrs[col]..col_ptrs[col + 1]];
            let Some((&first, rest)) = rows.split_first() else {
                continue;
            };
            if first >= nrows {
                return Err(SparseError::RowIndexOutOfBounds {
                    col,
                    row: first,
                    nrows,
                });
            }
            let mut prev = first;
            for &row in rest {
                if prev >= row {
                    return Err(SparseError::RowIndexNotSorted { col, prev, next: row });
                }
                if row >= nrows {
                    return Err(SparseError::RowIndexOutOfBounds { col, row, nrows });
                }
                prev = row;
            }
        }

        Ok(Self {
            nrows,
            ncols,
            col_ptrs,
            row_indices,
            values,
        })
    }

    // Callers build sorted, in-bounds columns by construction.
    pub(crate) fn from_raw_parts(
        nrows: usize,
        ncols: usize,
        col_ptrs: Vec<usize>,
        row_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        debug_assert!(Self::new(
            nrows,
            ncols,
            col_ptrs.clone(),
            row_indices.clone(),
            values.clone()
        )
        .is_ok());
        Self {
            nrows,
            ncols,
            col_ptrs,
            row_indices,
            values,
        }
    }

    pub fn identity(n: usize) -> Self {
        Self {
            nrows: n,
            ncols: n,
            col_ptrs: (0..=n).collect(),
            row_indices: (0..n).collect(),
            values: vec![1.0; n],
        }
    }

    /// Assembles a matrix from `(row, col, value)` triplets, summing duplicates.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> Result<Self, SparseError> {
        let matrix = SparseColMat::<usize, f64>::try_new_from_triplets(nrows, ncols, triplets)
            .map_err(|err| match err {
                CreationError::OutOfBounds { row, col } => SparseError::TripletOutOfBounds {
                    row,
                    col,
                    nrows,
                    ncols,
                },
                CreationError::Generic(err) => SparseError::Faer(err),
                _ => unreachable!("faer-core 0.17 CreationError has no other variants"),
            })?;
        Ok(Self::from_faer(matrix))
    }

    // faer output is sorted and duplicate-free; only uncompressed storage needs repacking.
    fn from_faer(matrix: SparseColMat<usize, f64>) -> Self {
        let (symbolic, values) = matrix.into_parts();
        let (nrows, ncols, col_ptrs, nnz_per_col, row_indices) = symbolic.into_parts();
        let Some(nnz_per_col) = nnz_per_col else {
            return Self::from_raw_parts(nrows, ncols, col_ptrs, row_indices, values);
        };
        let mut packed_ptrs = Vec::with_capacity(ncols + 1);
        let mut packed_rows = Vec::new();
        let mut packed_values = Vec::new();
        packed_ptrs.push(0);
        for col in 0..ncols {
            let range = col_ptrs[col]..col_ptrs[col] + nnz_per_col[col];
            packed_rows.extend_from_slice(&row_indices[range.clone()]);
            packed_values.extend_from_slice(&values[range]);
            packed_ptrs.push(packed_rows.len());
        }
        Self::from_raw_parts(nrows, ncols, packed_ptrs, packed_rows, packed_values)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.row_indices.len()
    }

    pub fn col_ptrs(&self) -> &[usize] {
        &self.col_ptrs
    }

    pub fn row_indices(&self) -> &[usize] {
        &self.row_indices
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Index range in row_indices for the given column.
    pub fn col_range(&self, col: usize) -> Range<usize> {
        self.col_ptrs[col]..self.col_ptrs[col + 1]
    }

    /// Sorted row indices for the given column.
    pub fn row_indices_of_col(&self, col: usize) -> &[usize] {
        &self.row_indices[self.col_range(col)]
    }

    /// Values for the given column, aligned with row_indices_of_col.
    pub fn values_of_col(&self, col: usize) -> &[f64] {
        &self.values[self.col_range(col)]
    }

    /// Entry at (row, col); zero when not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let range = self.col_range(col);
        match self.row_indices[range.clone()].binary_search(&row) {
            Ok(pos) => self.values[range.start + pos],
            Err(_) => 0.0,
        }
    }

    /// Position of (row, col) in the value array, if stored.
    pub(crate) fn position(&self, row: usize, col: usize) -> Option<usize> {
        let range = self.col_range(col);
        self.row_indices[range.clone()]
            .binary_search(&row)
            .ok()
            .map(|pos| range.start + pos)
    }

    pub fn diagonal(&self) -> Vec<f64> {
        let n = self.nrows.min(self.ncols);
        (0..n).map(|i| self.get(i, i)).collect()
    }

    pub fn scaled(&self, alpha: f64) -> Self {
        let mut out = self.clone();
        for v in &mut out.values {
            *v *= alpha;
        }
        out
    }

    pub fn transpose(&self) -> Result<Self, SparseError> {
        Ok(Self::from_faer(self.as_faer().transpose().to_col_major()?))
    }

    /// `selfᵀ self`, the Gram matrix of the columns.
    pub fn gram(&self) -> Result<Self, SparseError> {
        Ok(self.transpose()?.product(self))
    }

    // Gustavson's column-by-column product with a dense accumulator; faer-core 0.17
    // has no sparse-sparse matmul.
    fn product(&self, rhs: &CscMatrix) -> Self {
        let mut acc = vec![0.0; self.nrows];
        let mut marker = vec![usize::MAX; self.nrows];
        let mut touched: Vec<usize> = Vec::new();

        let mut col_ptrs = Vec::with_capacity(rhs.ncols + 1);
        let mut row_indices = Vec::new();
        let mut values = Vec::new();
        col_ptrs.push(0);

        for j in 0..rhs.ncols {
            touched.clear();
            for (&k, &b_kj) in rhs
                .row_indices_of_col(j)
                .iter()
                .zip(rhs.values_of_col(j))
            {
                for (&i, &a_ik) in self
                    .row_indices_of_col(k)
                    .iter()
                    .zip(self.values_of_col(k))
                {
                    if marker[i] != j {
                        marker[i] = j;
                        acc[i] = 0.0;
                        touched.push(i);
                    }
                    acc[i] += a_ik * b_kj;
                }
            }
            touched.sort_unstable();
            for &i in &touched {
                row_indices.push(i);
                values.push(acc[i]);
            }
            col_ptrs.push(row_indices.len());
        }

        Self {
            nrows: self.nrows,
            ncols: rhs.ncols,
            col_ptrs,
            row_indices,
            values,
        }
    }

    /// `self + alpha * other` with the union sparsity pattern.
    pub fn add_scaled(&self, other: &CscMatrix, alpha: f64) -> Result<Self, SparseError> {
        if self.shape() != other.shape() {
            return Err(SparseError::ShapeMismatch {
                op: "add_scaled",
                left: self.shape(),
                right: other.shape(),
            });
        }
        let sum = binary_op(self.as_faer(), other.as_faer(), |a: f64, b: f64| a + alpha * b)?;
        Ok(Self::from_faer(sum))
    }

    /// Stacks `self` on top of `below`.
    pub fn vstack(&self, below: &CscMatrix) -> Result<Self, SparseError> {
        if self.ncols != below.ncols {
            return Err(SparseError::ShapeMismatch {
                op: "vstack",
                left: self.shape(),
                right: below.shape(),
            });
        }
        let mut triplets = self.triplets();
        triplets.extend(
            below
                .triplets()
                .into_iter()
                .map(|(row, col, v)| (row + self.nrows, col, v)),
        );
        Self::from_triplets(self.nrows + below.nrows, self.ncols, &triplets)
    }

    /// Kronecker product `self ⊗ rhs`.
    pub fn kron(&self, rhs: &CscMatrix) -> Result<Self, SparseError> {
        let rhs_triplets = rhs.triplets();
        let mut triplets = Vec::with_capacity(self.nnz() * rhs.nnz());
        for (ia, ja, va) in self.triplets() {
            for &(ib, jb, vb) in &rhs_triplets {
                triplets.push((ia * rhs.nrows + ib, ja * rhs.ncols + jb, va * vb));
            }
        }
        Self::from_triplets(self.nrows * rhs.nrows, self.ncols * rhs.ncols, &triplets)
    }

    /// Stored entries as `(row, col, value)`, column by column.
    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::with_capacity(self.nnz());
        for col in 0..self.ncols {
            for (&row, &v) in self.row_indices_of_col(col).iter().zip(self.values_of_col(col)) {
                out.push((row, col, v));
            }
        }
        out
    }

    /// `self * x`.
    pub fn mul_vec(&self, x: &[f64]) -> Result<Vec<f64>, SparseError> {
        if x.len() != self.ncols {
            return Err(SparseError::VectorLen {
                expected: self.ncols,
                actual: x.len(),
            });
        }
        let mut out = vec![0.0; self.nrows];
        self.mul_vec_into(x, &mut out);
        Ok(out)
    }

    /// `selfᵀ * y`.
    pub fn mul_transpose_vec(&self, y: &[f64]) -> Result<Vec<f64>, SparseError> {
        if y.len() != self.nrows {
            return Err(SparseError::VectorLen {
                expected: self.nrows,
                actual: y.len(),
            });
        }
        Ok((0..self.ncols)
            .map(|col| {
                self.row_indices_of_col(col)
                    .iter()
                    .zip(self.values_of_col(col))
                    .map(|(&row, &v)| v * y[row])
                    .sum()
            })
            .collect())
    }

    // Caller guarantees x.len() == ncols and out.len() == nrows.
    pub(crate) fn mul_vec_into(&self, x: &[f64], out: &mut [f64]) {
        out.fill(0.0);
        for (col, &xc) in x.iter().enumerate() {
            if xc == 0.0 {
                continue;
            }
            for idx in self.col_range(col) {
                out[self.row_indices[idx]] += self.values[idx] * xc;
            }
        }
    }

    /// Lower triangle (diagonal included) of a square matrix.
    pub fn lower_triangle(&self) -> Self {
        let mut col_ptrs = Vec::with_capacity(self.ncols + 1);
        let mut row_indices = Vec::new();
        let mut values = Vec::new();
        col_ptrs.push(0);
        for col in 0..self.ncols {
            for idx in self.col_range(col) {
                if self.row_indices[idx] >= col {
                    row_indices.push(self.row_indices[idx]);
                    values.push(self.values[idx]);
                }
            }
            col_ptrs.push(row_indices.len());
        }
        Self {
            nrows: self.nrows,
            ncols: self.ncols,
            col_ptrs,
            row_indices,
            values,
        }
    }

    pub(crate) fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        if self.nrows != self.ncols {
            return false;
        }
        for col in 0..self.ncols {
            for (&row, &v) in self.row_indices_of_col(col).iter().zip(self.values_of_col(col)) {
                if (v - self.get(col, row)).abs() > tol {
                    return false;
                }
            }
        }
        true
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.nrows, self.ncols);
        for col in 0..self.ncols {
            for (&row, &v) in self.row_indices_of_col(col).iter().zip(self.values_of_col(col)) {
                dense[(row, col)] = v;
            }
        }
        dense
    }

    pub(crate) fn as_symbolic(&self) -> SymbolicSparseColMatRef<'_, usize> {
        // Invariants were checked in `new` or hold by construction.
        unsafe {
            SymbolicSparseColMatRef::new_unchecked(
                self.nrows,
                self.ncols,
                &self.col_ptrs,
                None,
                &self.row_indices,
            )
        }
    }

    pub(crate) fn as_faer(&self) -> SparseColMatRef<'_, usize, f64> {
        SparseColMatRef::<'_, usize, f64>::new(self.as_symbolic(), self.values.as_slice())
    }
}
