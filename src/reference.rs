use core::fmt;

use nalgebra::DMatrix;

use crate::design::{DesignError, ReferenceSpectra};
use crate::registry::{ActiveCompounds, Compound, SpectralBound};

/// Gas state the references are synthesized at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditions {
    pub pressure_bar: f64,
    pub temperature_k: f64,
}

impl Default for Conditions {
    fn default() -> Self {
        Self {
            pressure_bar: 1.01325,
            temperature_k: 273.0,
        }
    }
}

/// Absorbance sampled at the synthesizer's own wavenumbers (cm⁻¹).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyntheticSpectrum {
    pub wavenumbers: Vec<f64>,
    pub absorbance: Vec<f64>,
}

pub trait ReferenceSynthesizer {
    type Error: fmt::Display;

    fn synthesize(
        &self,
        compound: &Compound,
        bound: &SpectralBound,
        conditions: &Conditions,
    ) -> Result<SyntheticSpectrum, Self::Error>;
}

/// Index of the grid point closest to `value`; the first wins on ties.
pub fn nearest_index(grid: &[f64], value: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, g) in grid.iter().enumerate() {
        let d = (g - value).abs();
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i)
}

/// Piecewise-linear interpolation of `(xs, ys)` at `targets`; zero outside `[min xs, max xs]`.
pub fn resample_linear(xs: &[f64], ys: &[f64], targets: &[f64]) -> Vec<f64> {
    let mut points: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(x, y)| (*x, *y))
        .collect();
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    if points.is_empty() {
        return vec![0.0; targets.len()];
    }
    let lo = points[0].0;
    let hi = points[points.len() - 1].0;

    targets
        .iter()
        .map(|&t| {
            if !(t >= lo && t <= hi) {
                return 0.0;
            }
            let k = points.partition_point(|p| p.0 < t);
            if k == 0 {
                return points[0].1;
            }
            let (x1, y1) = points[k.min(points.len() - 1)];
            let (x0, y0) = points[k - 1];
            if x1 == x0 {
                y0
            } else {
                y0 + (y1 - y0) * (t - x0) / (x1 - x0)
            }
        })
        .collect()
}

/// Zero-filled reference row for `compound` on `grid`.
pub fn assemble_reference_row<S: ReferenceSynthesizer>(
    grid: &[f64],
    compound: &Compound,
    conditions: &Conditions,
    synth: &S,
) -> Vec<f64> {
    let mut row = vec![0.0; grid.len()];
    for bound in &compound.bounds {
        let spectrum = match synth.synthesize(compound, bound, conditions) {
            Ok(s) => s,
            Err(err) => {
                log::warn!(
                    "synthesis of {} over [{}, {}] cm-1 failed: {err}",
                    compound.id,
                    bound.lower,
                    bound.upper
                );
                continue;
            }
        };
        let span = spectrum
            .wavenumbers
            .iter()
            .copied()
            .filter(|w| w.is_finite())
            .fold(None, |acc: Option<(f64, f64)>, w| match acc {
                None => Some((w, w)),
                Some((lo, hi)) => Some((lo.min(w), hi.max(w))),
            });
        let Some((w_min, w_max)) = span else {
            log::warn!(
                "synthesis of {} over [{}, {}] cm-1 returned no samples",
                compound.id,
                bound.lower,
                bound.upper
            );
            continue;
        };
        let (Some(i), Some(j)) = (nearest_index(grid, w_min), nearest_index(grid, w_max)) else {
            continue;
        };
        let (start, end) = (i.min(j), i.max(j) + 1);
        let values = resample_linear(&spectrum.wavenumbers, &spectrum.absorbance, &grid[start..end]);
        for (dst, v) in row[start..end].iter_mut().zip(values) {
            *dst = if v.is_finite() { v } else { 0.0 };
        }
    }
    row
}

/// One reference row per live compound, in `active` order.
pub fn build_reference_spectra<S: ReferenceSynthesizer>(
    grid: &[f64],
    active: &ActiveCompounds,
    conditions: &Conditions,
    synth: &S,
) -> Result<ReferenceSpectra, DesignError> {
    let rows: Vec<Vec<f64>> = active
        .iter()
        .map(|c| assemble_reference_row(grid, c, conditions, synth))
        .collect();
    log::info!(
        "assembled {} reference rows on a {}-point grid at {:.3} bar, {:.1} K",
        rows.len(),
        grid.len(),
        conditions.pressure_bar,
        conditions.temperature_k
    );
    let ids = active.iter().map(|c| c.id.clone()).collect();
    let data = DMatrix::from_fn(rows.len(), grid.len(), |i, j| rows[i][j]);
    ReferenceSpectra::new(ids, data)
}
