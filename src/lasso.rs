use core::fmt;

use nalgebra::DMatrix;
use rayon::prelude::*;

// Below this alpha_max the path collapses to a single tiny penalty.
const ALPHA_RESOLUTION: f64 = 1e-15;

#[derive(Debug, Clone)]
pub struct LassoOptions {
    /// Folds for choosing alpha.
    pub cv_folds: usize,
    /// Length of the alpha path.
    pub n_alphas: usize,
    /// Ratio alpha_min / alpha_max.
    pub eps: f64,
    pub max_iter: usize,
    /// Stop when the largest coefficient update is below tol * max |w|.
    pub tol: f64,
}

impl Default for LassoOptions {
    fn default() -> Self {
        Self {
            cv_folds: 5,
            n_alphas: 100,
            eps: 1e-3,
            max_iter: 1000,
            tol: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LassoError {
    /// Design rows and targets differ in length.
    LengthMismatch { rows: usize, targets: usize },
    /// Not enough samples to split into the requested folds.
    TooFewSamples { samples: usize, folds: usize },
}

impl fmt::Display for LassoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch { rows, targets } => {
                write!(f, "design has {rows} rows but target has {targets} entries")
            }
            Self::TooFewSamples { samples, folds } => {
                write!(f, "cannot split {samples} samples into {folds} folds")
            }
        }
    }
}

impl std::error::Error for LassoError {}

#[derive(Debug, Clone)]
pub struct LassoFit {
    pub coefficients: Vec<f64>,
    pub alpha: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl LassoFit {
    pub fn predict(&self, x: &DMatrix<f64>) -> Vec<f64> {
        predict(x, &self.coefficients)
    }

    pub fn nonzero(&self) -> usize {
        self.coefficients.iter().filter(|w| **w != 0.0).count()
    }
}

pub(crate) fn soft_threshold(x: f64, lambda: f64) -> f64 {
    if x > lambda {
        x - lambda
    } else if x < -lambda {
        x + lambda
    } else {
        0.0
    }
}

fn predict(x: &DMatrix<f64>, w: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; x.nrows()];
    for (j, &wj) in w.iter().enumerate() {
        if wj == 0.0 {
            continue;
        }
        for (o, xij) in out.iter_mut().zip(x.column(j).iter()) {
            *o += xij * wj;
        }
    }
    out
}

/// Coordinate descent on `(1 / 2n) ||y - X w||² + alpha ||w||₁`, warm-started from `w`.
///
/// Returns the iteration count and whether the tolerance was met.
pub fn coordinate_descent(
    x: &DMatrix<f64>,
    y: &[f64],
    alpha: f64,
    w: &mut [f64],
    max_iter: usize,
    tol: f64,
) -> (usize, bool) {
    let n = x.nrows();
    let threshold = alpha * n as f64;
    let col_sq: Vec<f64> = (0..x.ncols())
        .map(|j| x.column(j).iter().map(|v| v * v).sum())
        .collect();

    let fitted = predict(x, w);
    let mut residual: Vec<f64> = y.iter().zip(&fitted).map(|(a, b)| a - b).collect();

    for iter in 0..max_iter {
        let mut w_max = 0.0f64;
        let mut d_w_max = 0.0f64;
        for j in 0..w.len() {
            if col_sq[j] == 0.0 {
                w[j] = 0.0;
                continue;
            }
            let column = x.column(j);
            let old = w[j];
            let rho: f64 = column
                .iter()
                .zip(&residual)
                .map(|(xij, r)| xij * r)
                .sum::<f64>()
                + col_sq[j] * old;
            let new = soft_threshold(rho, threshold) / col_sq[j];
            if new != old {
                let delta = new - old;
                for (r, xij) in residual.iter_mut().zip(column.iter()) {
                    *r -= delta * xij;
                }
            }
            w[j] = new;
            d_w_max = d_w_max.max((new - old).abs());
            w_max = w_max.max(new.abs());
        }
        if w_max == 0.0 || d_w_max <= tol * w_max {
            return (iter + 1, true);
        }
    }
    (max_iter, false)
}

/// Log-spaced alphas from the smallest penalty that zeroes every coefficient
/// down to `eps` times that value.
pub fn alpha_grid(x: &DMatrix<f64>, y: &[f64], n_alphas: usize, eps: f64) -> Vec<f64> {
    let n = x.nrows().max(1) as f64;
    let alpha_max = (0..x.ncols())
        .map(|j| {
            x.column(j)
                .iter()
                .zip(y)
                .map(|(a, b)| a * b)
                .sum::<f64>()
                .abs()
        })
        .fold(0.0, f64::max)
        / n;
    let n_alphas = n_alphas.max(1);
    if alpha_max <= ALPHA_RESOLUTION {
        return vec![ALPHA_RESOLUTION; n_alphas];
    }
    if n_alphas == 1 {
        return vec![alpha_max];
    }
    let hi = alpha_max.log10();
    let lo = (alpha_max * eps).log10();
    (0..n_alphas)
        .map(|k| 10f64.powf(hi + (lo - hi) * k as f64 / (n_alphas - 1) as f64))
        .collect()
}

/// Contiguous, unshuffled k-fold splits; the first `n % k` folds get one extra sample.
#[derive(Debug, Clone)]
pub struct KFold {
    samples: usize,
    folds: usize,
}

impl KFold {
    pub fn new(samples: usize, folds: usize) -> Result<Self, LassoError> {
        if folds < 2 || samples < folds {
            return Err(LassoError::TooFewSamples { samples, folds });
        }
        Ok(Self { samples, folds })
    }

    /// `(train, test)` index sets.
    pub fn splits(&self) -> Vec<(Vec<usize>, Vec<usize>)> {
        let base = self.samples / self.folds;
        let extra = self.samples % self.folds;
        let mut start = 0;
        (0..self.folds)
            .map(|k| {
                let size = base + usize::from(k < extra);
                let test: Vec<usize> = (start..start + size).collect();
                let train: Vec<usize> = (0..start).chain(start + size..self.samples).collect();
                start += size;
                (train, test)
            })
            .collect()
    }
}

fn subset(x: &DMatrix<f64>, y: &[f64], rows: &[usize]) -> (DMatrix<f64>, Vec<f64>) {
    (x.select_rows(rows.iter()), rows.iter().map(|&i| y[i]).collect())
}

fn check_lengths(x: &DMatrix<f64>, y: &[f64]) -> Result<(), LassoError> {
    if x.nrows() != y.len() {
        return Err(LassoError::LengthMismatch {
            rows: x.nrows(),
            targets: y.len(),
        });
    }
    Ok(())
}

/// Lasso with alpha chosen by `options.cv_folds`-fold cross-validated MSE,
/// refit on all samples at the chosen alpha.
pub fn lasso_cv(x: &DMatrix<f64>, y: &[f64], options: &LassoOptions) -> Result<LassoFit, LassoError> {
    check_lengths(x, y)?;
    let kfold = KFold::new(x.nrows(), options.cv_folds)?;
    let alphas = alpha_grid(x, y, options.n_alphas, options.eps);

    let fold_mse: Vec<Vec<f64>> = kfold
        .splits()
        .into_par_iter()
        .map(|(train, test)| {
            let (x_train, y_train) = subset(x, y, &train);
            let (x_test, y_test) = subset(x, y, &test);
            let mut w = vec![0.0; x.ncols()];
            alphas
                .iter()
                .map(|&alpha| {
                    coordinate_descent(&x_train, &y_train, alpha, &mut w, options.max_iter, options.tol);
                    mean_squared_error(&y_test, &predict(&x_test, &w))
                })
                .collect()
        })
        .collect();

    let mut best = 0;
    let mut best_mse = f64::INFINITY;
    for k in 0..alphas.len() {
        let mse = fold_mse.iter().map(|f| f[k]).sum::<f64>() / fold_mse.len() as f64;
        if mse < best_mse {
            best_mse = mse;
            best = k;
        }
    }

    let alpha = alphas[best];
    let mut coefficients = vec![0.0; x.ncols()];
    let (iterations, converged) =
        coordinate_descent(x, y, alpha, &mut coefficients, options.max_iter, options.tol);
    if !converged {
        log::debug!("lasso refit at alpha={alpha:.3e} hit max_iter={}", options.max_iter);
    }
    Ok(LassoFit {
        coefficients,
        alpha,
        iterations,
        converged,
    })
}

/// Mean absolute error of a freshly cross-validated Lasso on each of
/// `folds` held-out splits.
pub fn cross_val_mae(
    x: &DMatrix<f64>,
    y: &[f64],
    options: &LassoOptions,
    folds: usize,
) -> Result<Vec<f64>, LassoError> {
    check_lengths(x, y)?;
    KFold::new(x.nrows(), folds)?
        .splits()
        .into_par_iter()
        .map(|(train, test)| {
            let (x_train, y_train) = subset(x, y, &train);
            let (x_test, y_test) = subset(x, y, &test);
            let fit = lasso_cv(&x_train, &y_train, options)?;
            Ok(mean_absolute_error(&y_test, &fit.predict(&x_test)))
        })
        .collect()
}

pub fn mean_squared_error(y: &[f64], pred: &[f64]) -> f64 {
    if y.is_empty() {
        return 0.0;
    }
    y.iter().zip(pred).map(|(a, b)| (a - b) * (a - b)).sum::<f64>() / y.len() as f64
}

pub fn mean_absolute_error(y: &[f64], pred: &[f64]) -> f64 {
    if y.is_empty() {
        return 0.0;
    }
    y.iter().zip(pred).map(|(a, b)| (a - b).abs()).sum::<f64>() / y.len() as f64
}

pub fn root_mean_squared_error(y: &[f64], pred: &[f64]) -> f64 {
    mean_squared_error(y, pred).sqrt()
}

/// Coefficient of determination; a constant target scores 1 when matched
/// exactly and 0 otherwise.
pub fn r2_score(y: &[f64], pred: &[f64]) -> f64 {
    if y.is_empty() {
        return 0.0;
    }
    let mean = y.iter().sum::<f64>() / y.len() as f64;
    let ss_res: f64 = y.iter().zip(pred).map(|(a, b)| (a - b) * (a - b)).sum();
    let ss_tot: f64 = y.iter().map(|a| (a - mean) * (a - mean)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orthogonal_design() -> DMatrix<f64> {
        // Three columns with disjoint support over 30 rows.
        DMatrix::from_fn(30, 3, |i, j| {
            if i / 10 == j {
                1.0 + (i % 10) as f64 * 0.1
            } else {
                0.0
            }
        })
    }

    #[test]
    fn soft_threshold_shrinks_toward_zero() {
        assert_eq!(soft_threshold(0.5, 0.25), 0.25);
        assert_eq!(soft_threshold(-0.5, 0.25), -0.25);
        assert_eq!(soft_threshold(0.2, 0.3), 0.0);
    }

    #[test]
    fn kfold_covers_every_sample_once() {
        let splits = KFold::new(12, 5).unwrap().splits();
        let sizes: Vec<usize> = splits.iter().map(|(_, t)| t.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2, 2]);
        let mut seen: Vec<usize> = splits.iter().flat_map(|(_, t)| t.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        for (train, test) in &splits {
            assert_eq!(train.len() + test.len(), 12);
        }
        assert!(KFold::new(3, 5).is_err());
    }

    #[test]
    fn alpha_grid_is_log_spaced_from_alpha_max() {
        let x = orthogonal_design();
        let y: Vec<f64> = (0..30).map(|i| x[(i, 1)] * 2.0).collect();
        let grid = alpha_grid(&x, &y, 4, 1e-3);
        assert_eq!(grid.len(), 4);
        let ratio = grid[1] / grid[0];
        assert!((ratio - 0.1).abs() < 1e-12);
        let mut w = vec![0.0; 3];
        coordinate_descent(&x, &y, grid[0] * (1.0 + 1e-9), &mut w, 100, 1e-8);
        assert!(w.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn zero_target_gives_flat_grid_and_zero_fit() {
        let x = orthogonal_design();
        let y = vec![0.0; 30];
        let grid = alpha_grid(&x, &y, 5, 1e-3);
        assert!(grid.iter().all(|a| *a == ALPHA_RESOLUTION));
        let fit = lasso_cv(&x, &y, &LassoOptions::default()).unwrap();
        assert!(fit.coefficients.iter().all(|w| *w == 0.0));
    }

    #[test]
    fn recovers_single_active_column_exactly_sparse() {
        let x = orthogonal_design();
        let y: Vec<f64> = (0..30).map(|i| x[(i, 2)] * 1.5).collect();
        let fit = lasso_cv(&x, &y, &LassoOptions::default()).unwrap();
        assert_eq!(fit.coefficients[0], 0.0);
        assert_eq!(fit.coefficients[1], 0.0);
        assert!((fit.coefficients[2] - 1.5).abs() < 0.05);
        assert_eq!(fit.nonzero(), 1);
    }

    #[test]
    fn cross_validation_scores_are_small_for_noiseless_fit() {
        let x = orthogonal_design();
        let y: Vec<f64> = (0..30).map(|i| x[(i, 0)] - 0.5 * x[(i, 1)]).collect();
        let scores = cross_val_mae(&x, &y, &LassoOptions::default(), 5).unwrap();
        assert_eq!(scores.len(), 5);
        assert!(scores.iter().all(|s| s.is_finite() && *s >= 0.0));
    }

    #[test]
    fn metrics() {
        let y = [1.0, 2.0, 3.0];
        assert_eq!(r2_score(&y, &y), 1.0);
        assert_eq!(r2_score(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert_eq!(r2_score(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((root_mean_squared_error(&y, &[1.0, 2.0, 5.0]) - (4.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((mean_absolute_error(&y, &[2.0, 2.0, 2.0]) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let x = orthogonal_design();
        let err = lasso_cv(&x, &[1.0; 3], &LassoOptions::default()).unwrap_err();
        assert_eq!(err, LassoError::LengthMismatch { rows: 30, targets: 3 });
    }
}
