use crate::design::{check_spectral_axes, DesignError, DesignMatrix, Observations, ReferenceSpectra};

/// Modeled and observed spectra, both flattened row-major to `Nt·Nl`.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub modeled: Vec<f64>,
    pub observed: Vec<f64>,
    spectral_len: usize,
}

impl Reconstruction {
    pub fn spectral_len(&self) -> usize {
        self.spectral_len
    }

    pub fn timesteps(&self) -> usize {
        if self.spectral_len == 0 {
            0
        } else {
            self.observed.len() / self.spectral_len
        }
    }

    /// `observed - modeled`
    pub fn residual(&self) -> Vec<f64> {
        self.observed
            .iter()
            .zip(&self.modeled)
            .map(|(o, m)| o - m)
            .collect()
    }

    pub fn rmse(&self) -> f64 {
        if self.observed.is_empty() {
            return 0.0;
        }
        (sum_squared_difference(&self.observed, &self.modeled) / self.observed.len() as f64).sqrt()
    }

    /// ||observed - modeled|| / ||observed||, zero when both vanish.
    pub fn relative_error(&self) -> f64 {
        let num = sum_squared_difference(&self.observed, &self.modeled).sqrt();
        let den = self.observed.iter().map(|v| v * v).sum::<f64>().sqrt();
        if den == 0.0 {
            if num == 0.0 {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            num / den
        }
    }

    /// Modeled spectrum at one timestep.
    pub fn modeled_at(&self, timestep: usize) -> &[f64] {
        let start = timestep * self.spectral_len;
        &self.modeled[start..start + self.spectral_len]
    }
}

/// Forward model `A x_sol` next to the flattened observations.
pub fn reconstruct(
    reference: &ReferenceSpectra,
    observations: &Observations,
    solution: &[f64],
) -> Result<Reconstruction, DesignError> {
    check_spectral_axes(reference, observations)?;
    let design = DesignMatrix::build(reference, observations.timesteps())?;
    let modeled = design.apply(solution)?;
    Ok(Reconstruction {
        modeled,
        observed: observations.flatten(),
        spectral_len: reference.spectral_len(),
    })
}

/// Timestep of the largest coefficient for each species; ties keep the earliest.
pub fn dominant_timesteps(
    solution: &[f64],
    species: usize,
    timesteps: usize,
) -> Result<Vec<usize>, DesignError> {
    let expected = species * timesteps;
    if solution.len() != expected {
        return Err(DesignError::CoefficientLength {
            expected,
            actual: solution.len(),
            species,
            timesteps,
        });
    }
    if timesteps == 0 {
        return Ok(Vec::new());
    }
    Ok(solution.chunks(timesteps).map(dominant_timestep).collect())
}

// Earliest index of the maximum; zero for an empty series.
pub(crate) fn dominant_timestep(series: &[f64]) -> usize {
    let mut best = 0;
    for (t, v) in series.iter().enumerate() {
        if *v > series[best] {
            best = t;
        }
    }
    best
}

/// Sum of squared differences over the common prefix of `a` and `b`.
pub fn sum_squared_difference(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (ReferenceSpectra, Observations) {
        let reference = ReferenceSpectra::from_rows(
            vec!["a".into(), "b".into()],
            &[vec![1.0, 0.0, 0.5], vec![0.0, 2.0, 0.0]],
        )
        .unwrap();
        let observations =
            Observations::from_rows(&[vec![1.0, 2.0, 0.5], vec![2.0, 0.0, 1.0]]).unwrap();
        (reference, observations)
    }

    #[test]
    fn exact_coefficients_leave_no_residual() {
        let (reference, observations) = fixture();
        // species-major: a@t0, a@t1, b@t0, b@t1
        let rec = reconstruct(&reference, &observations, &[1.0, 2.0, 1.0, 0.0]).unwrap();
        assert_eq!(rec.modeled, rec.observed);
        assert_eq!(rec.rmse(), 0.0);
        assert_eq!(rec.relative_error(), 0.0);
        assert_eq!(rec.timesteps(), 2);
        assert_eq!(rec.modeled_at(1), &[2.0, 0.0, 1.0]);
    }

    #[test]
    fn residual_is_observed_minus_modeled() {
        let (reference, observations) = fixture();
        let rec = reconstruct(&reference, &observations, &[0.0; 4]).unwrap();
        assert_eq!(rec.residual(), observations.flatten());
    }

    #[test]
    fn wrong_solution_length_is_rejected() {
        let (reference, observations) = fixture();
        let err = reconstruct(&reference, &observations, &[1.0; 3]).unwrap_err();
        assert!(matches!(err, DesignError::CoefficientLength { expected: 4, actual: 3, .. }));
    }

    #[test]
    fn dominant_timestep_per_species() {
        let x = [0.1, 0.9, 0.3, 2.0, 2.0, -1.0];
        assert_eq!(dominant_timesteps(&x, 2, 3).unwrap(), vec![1, 0]);
        assert!(dominant_timesteps(&x, 4, 2).is_err());
    }

    #[test]
    fn ssd() {
        assert_eq!(sum_squared_difference(&[1.0, 2.0], &[0.0, 4.0]), 5.0);
    }
}
