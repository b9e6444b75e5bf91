use core::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::design::{check_spectral_axes, DesignError, DesignMatrix, Observations, ReferenceSpectra};
use crate::lasso::{cross_val_mae, lasso_cv, r2_score, root_mean_squared_error, LassoError, LassoOptions};
use crate::registry::{ActiveCompounds, RegistryError};
use crate::report::{CrossValidationScore, Reporter, SelectionEvaluation, StdoutReporter, TimestepReport};

pub const DEFAULT_SELECTOR_SEED: u64 = 0;

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// Fraction of timesteps fitted; at least `min_samples` are drawn.
    pub sample_fraction: f64,
    pub min_samples: usize,
    pub seed: u64,
    pub lasso: LassoOptions,
    /// Folds of the outer mean-absolute-error score.
    pub score_folds: usize,
    /// Return an empty selection instead of `NoSurvivors`.
    pub allow_empty: bool,
    pub verbose: bool,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            sample_fraction: 0.1,
            min_samples: 1,
            seed: DEFAULT_SELECTOR_SEED,
            lasso: LassoOptions::default(),
            score_folds: 5,
            allow_empty: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SelectionError {
    Design(DesignError),
    Lasso(LassoError),
    Registry(RegistryError),
    /// The spectral axis is too short for the requested folds.
    TooFewSpectralPoints { points: usize, folds: usize },
    /// Reference rows and live compounds name different species.
    RegistryMismatch {
        reference: Vec<String>,
        active: Vec<String>,
    },
    NoCandidates,
    /// Every candidate's sampled coefficients summed to exactly zero.
    NoSurvivors {
        candidates: usize,
        evaluation: Box<SelectionEvaluation>,
    },
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Design(err) => write!(f, "{err}"),
            Self::Lasso(err) => write!(f, "lasso fit failed: {err}"),
            Self::Registry(err) => write!(f, "{err}"),
            Self::TooFewSpectralPoints { points, folds } => write!(
                f,
                "{points} spectral points are too few for {folds}-fold cross-validation"
            ),
            Self::RegistryMismatch { reference, active } => write!(
                f,
                "reference rows {reference:?} do not match active compounds {active:?}"
            ),
            Self::NoCandidates => write!(f, "no candidate species to select from"),
            Self::NoSurvivors {
                candidates,
                evaluation,
            } => write!(
                f,
                "none of {candidates} candidates survived Lasso selection over {} timesteps",
                evaluation.timesteps.len()
            ),
        }
    }
}

impl std::error::Error for SelectionError {}

impl From<DesignError> for SelectionError {
    fn from(err: DesignError) -> Self {
        Self::Design(err)
    }
}

impl From<LassoError> for SelectionError {
    fn from(err: LassoError) -> Self {
        Self::Lasso(err)
    }
}

impl From<RegistryError> for SelectionError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

/// Pruned references with the matching single-timestep design matrix.
#[derive(Debug, Clone)]
pub struct Selection {
    pub reference: ReferenceSpectra,
    pub compounds: ActiveCompounds,
    pub design: DesignMatrix,
    pub evaluation: SelectionEvaluation,
}

/// Sorted, distinct timesteps drawn with a seeded generator.
pub fn sample_timesteps(timesteps: usize, fraction: f64, min_samples: usize, seed: u64) -> Vec<usize> {
    if timesteps == 0 {
        return Vec::new();
    }
    let wanted = (fraction * timesteps as f64).round();
    let count = if wanted.is_finite() && wanted > 0.0 {
        wanted as usize
    } else {
        0
    };
    let count = count.max(min_samples).max(1).min(timesteps);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, timesteps, count).into_vec();
    picked.sort_unstable();
    picked
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64).sqrt()
}

fn check_fold_budget(points: usize, options: &SelectorOptions) -> Result<(), SelectionError> {
    let folds = options.lasso.cv_folds.max(options.score_folds);
    let score_folds = options.score_folds.max(1);
    let smallest_train = points - (points + score_folds - 1) / score_folds;
    if points < folds || smallest_train < options.lasso.cv_folds {
        return Err(SelectionError::TooFewSpectralPoints { points, folds });
    }
    Ok(())
}

/// Drops candidates whose sampled Lasso coefficients sum to exactly zero.
pub fn select_species(
    reference: &ReferenceSpectra,
    observations: &Observations,
    active: &ActiveCompounds,
    options: &SelectorOptions,
) -> Result<Selection, SelectionError> {
    if options.verbose {
        let mut reporter = StdoutReporter::new();
        select_species_with_reporter(reference, observations, active, options, Some(&mut reporter))
    } else {
        select_species_with_reporter(reference, observations, active, options, None)
    }
}

pub fn select_species_with_reporter(
    reference: &ReferenceSpectra,
    observations: &Observations,
    active: &ActiveCompounds,
    options: &SelectorOptions,
    mut reporter: Option<&mut dyn Reporter>,
) -> Result<Selection, SelectionError> {
    check_spectral_axes(reference, observations)?;
    let active_ids = active.ids();
    if reference.ids().iter().map(String::as_str).ne(active_ids.iter().copied()) {
        return Err(SelectionError::RegistryMismatch {
            reference: reference.ids().to_vec(),
            active: active_ids.iter().map(|s| s.to_string()).collect(),
        });
    }
    let ns = reference.species_count();
    if ns == 0 {
        return Err(SelectionError::NoCandidates);
    }
    let nl = reference.spectral_len();
    check_fold_budget(nl, options)?;

    let design = DesignMatrix::build(reference, 1)?;
    let x = design.to_dense();
    let timesteps = sample_timesteps(
        observations.timesteps(),
        options.sample_fraction,
        options.min_samples,
        options.seed,
    );
    log::info!(
        "lasso selection: {ns} candidates, {nl} spectral points, {} of {} timesteps sampled",
        timesteps.len(),
        observations.timesteps()
    );

    let mut evaluation = SelectionEvaluation {
        timesteps: timesteps.clone(),
        coefficient_sums: vec![0.0; ns],
        ..SelectionEvaluation::default()
    };
    for &t in &timesteps {
        let y = observations.row(t);
        let fit = lasso_cv(&x, &y, &options.lasso)?;
        let folds = cross_val_mae(&x, &y, &options.lasso, options.score_folds)?;
        let mean = folds.iter().sum::<f64>() / folds.len() as f64;
        let std = population_std(&folds, mean);
        let prediction = fit.predict(&x);
        let r2 = r2_score(&y, &prediction).abs();
        let rmse = root_mean_squared_error(&y, &prediction);

        for (sum, w) in evaluation.coefficient_sums.iter_mut().zip(&fit.coefficients) {
            *sum += w;
        }
        let report = TimestepReport {
            timestep: t,
            alpha: fit.alpha,
            nonzero: fit.nonzero(),
            cv_mean: mean,
            cv_std: std,
            r2,
            rmse,
        };
        log::debug!(
            "timestep {t}: alpha={:.3e} nonzero={} cv_mae={mean:.4e}±{std:.2e} r2={r2:.4} rmse={rmse:.4e}",
            report.alpha,
            report.nonzero
        );
        if let Some(r) = reporter.as_deref_mut() {
            r.on_timestep(&report);
        }

        evaluation.cross_validation.push(CrossValidationScore { mean, std, folds });
        evaluation.r2.push(r2);
        evaluation.rmse.push(rmse);
        evaluation.alphas.push(fit.alpha);
        evaluation.nonzero.push(report.nonzero);
    }
    if let Some(r) = reporter.as_deref_mut() {
        r.on_finish();
    }

    let keep: Vec<bool> = evaluation.coefficient_sums.iter().map(|s| *s != 0.0).collect();
    let survivors = keep.iter().filter(|k| **k).count();
    if survivors == 0 && !options.allow_empty {
        return Err(SelectionError::NoSurvivors {
            candidates: ns,
            evaluation: Box::new(evaluation),
        });
    }

    let pruned = reference.retain_rows(&keep);
    let compounds = active.narrow(&keep)?;
    let design = DesignMatrix::build(&pruned, 1)?;
    log::info!(
        "lasso selection kept {survivors} of {ns} species: {:?}",
        compounds.ids()
    );
    Ok(Selection {
        reference: pruned,
        compounds,
        design,
        evaluation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_distinct_sorted_and_seeded() {
        let a = sample_timesteps(100, 0.1, 1, 7);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(a, sample_timesteps(100, 0.1, 1, 7));
    }

    #[test]
    fn at_least_one_sample() {
        assert_eq!(sample_timesteps(4, 0.1, 1, 0).len(), 1);
        assert_eq!(sample_timesteps(4, 0.0, 0, 0).len(), 1);
        assert_eq!(sample_timesteps(4, 5.0, 1, 0), vec![0, 1, 2, 3]);
        assert!(sample_timesteps(0, 0.5, 1, 0).is_empty());
    }

    #[test]
    fn fold_budget() {
        let options = SelectorOptions::default();
        assert!(check_fold_budget(4, &options).is_err());
        // 7 points: outer train splits have 5 rows, enough for 5 inner folds.
        assert!(check_fold_budget(7, &options).is_ok());
        assert!(check_fold_budget(6, &options).is_err());
    }

    #[test]
    fn population_std_of_constant_is_zero() {
        assert_eq!(population_std(&[2.0, 2.0, 2.0], 2.0), 0.0);
        assert!((population_std(&[1.0, 3.0], 2.0) - 1.0).abs() < 1e-15);
    }
}
