use std::sync::Arc;

use nalgebra::DMatrix;
use spectral_inversion_rs::{
    select_species, select_species_with_reporter, ActiveCompounds, Compound, CompoundRegistry,
    Observations, ReferenceSpectra, Reporter, SelectionError, SelectorOptions, SpectralBound,
    TimestepReport,
};

const NS: usize = 4;
const NL: usize = 64;
const NT: usize = 20;

// Species s absorbs on [14 s, 14 s + 14), straddling fold boundaries; points 56.. carry
// no reference signal.
fn reference() -> ReferenceSpectra {
    let data = DMatrix::from_fn(NS, NL, |s, l| {
        if l / 14 == s {
            0.5 + ((l * 7 + s) % 5) as f64 * 0.25
        } else {
            0.0
        }
    });
    ReferenceSpectra::new((0..NS).map(|s| format!("C{s}")).collect(), data).unwrap()
}

fn active(reference: &ReferenceSpectra) -> ActiveCompounds {
    let compounds = reference
        .ids()
        .iter()
        .map(|id| Compound::new(id.clone(), "HITRAN", vec![SpectralBound::new(1000.0, 1100.0)]))
        .collect();
    ActiveCompounds::all(Arc::new(CompoundRegistry::new(compounds).unwrap()))
}

fn options() -> SelectorOptions {
    SelectorOptions {
        sample_fraction: 0.25,
        seed: 17,
        ..SelectorOptions::default()
    }
}

#[test]
fn only_species_with_nonzero_coefficient_sums_survive() {
    let reference = reference();
    let r = reference.as_matrix();
    // C1 and C3 present at every timestep with varying strength.
    let observations = Observations::new(DMatrix::from_fn(NT, NL, |t, l| {
        (1.0 + t as f64 * 0.1) * r[(1, l)] + (2.0 - t as f64 * 0.05) * r[(3, l)]
    }))
    .unwrap();

    let selection = select_species(&reference, &observations, &active(&reference), &options())
        .unwrap();
    assert_eq!(selection.compounds.ids(), vec!["C1", "C3"]);
    assert_eq!(selection.reference.ids(), &["C1".to_string(), "C3".to_string()]);

    let eval = &selection.evaluation;
    assert_eq!(eval.timesteps.len(), 5);
    assert_eq!(eval.coefficient_sums[0], 0.0);
    assert_eq!(eval.coefficient_sums[2], 0.0);
    assert!(eval.coefficient_sums[1] > 0.0);
    assert!(eval.coefficient_sums[3] > 0.0);
    assert_eq!(eval.cross_validation.len(), 5);
    assert!(eval.cross_validation.iter().all(|cv| cv.folds.len() == 5 && cv.mean >= 0.0));
    assert!(eval.r2.iter().all(|r2| (0.0..=1.0 + 1e-12).contains(r2)));
    assert!(eval.r2.iter().all(|r2| *r2 > 0.9));
    assert!(eval.nonzero.iter().all(|n| *n == 2));
    assert_eq!(eval.timestep_reports().count(), 5);
}

#[test]
fn noise_off_every_reference_band_prunes_everything() {
    let reference = reference();
    let observations = Observations::new(DMatrix::from_fn(NT, NL, |t, l| {
        if l >= 56 {
            ((t * 31 + l * 17) % 11) as f64 * 0.01 - 0.05
        } else {
            0.0
        }
    }))
    .unwrap();
    let active = active(&reference);

    let err = select_species(&reference, &observations, &active, &options()).unwrap_err();
    match err {
        SelectionError::NoSurvivors {
            candidates,
            evaluation,
        } => {
            assert_eq!(candidates, NS);
            assert!(evaluation.coefficient_sums.iter().all(|s| *s == 0.0));
        }
        other => panic!("expected NoSurvivors, got {other}"),
    }

    let lenient = SelectorOptions {
        allow_empty: true,
        ..options()
    };
    let selection = select_species(&reference, &observations, &active, &lenient).unwrap();
    assert!(selection.compounds.is_empty());
    assert_eq!(selection.reference.species_count(), 0);
    assert_eq!(selection.design.species(), 0);
    assert_eq!(active.len(), NS);
}

#[test]
fn same_seed_same_selection() {
    let reference = reference();
    let r = reference.as_matrix();
    let observations = Observations::new(DMatrix::from_fn(NT, NL, |t, l| {
        ((t % 3) as f64) * r[(0, l)] + 0.5 * r[(2, l)]
    }))
    .unwrap();
    let active = active(&reference);

    let a = select_species(&reference, &observations, &active, &options()).unwrap();
    let b = select_species(&reference, &observations, &active, &options()).unwrap();
    assert_eq!(a.evaluation.timesteps, b.evaluation.timesteps);
    assert_eq!(a.evaluation.coefficient_sums, b.evaluation.coefficient_sums);
    assert_eq!(a.evaluation.alphas, b.evaluation.alphas);
    assert_eq!(a.compounds.ids(), b.compounds.ids());
}

#[test]
fn mismatched_identifiers_are_rejected() {
    let reference = reference();
    let observations = Observations::new(DMatrix::from_element(NT, NL, 0.1)).unwrap();
    let narrowed = active(&reference).narrow(&[true, true, false, true]).unwrap();
    let err = select_species(&reference, &observations, &narrowed, &options()).unwrap_err();
    assert!(matches!(err, SelectionError::RegistryMismatch { .. }));
}

#[test]
fn short_spectral_axis_is_rejected() {
    let data = DMatrix::from_element(2, 4, 1.0);
    let reference = ReferenceSpectra::new(vec!["C0".into(), "C1".into()], data).unwrap();
    let observations = Observations::new(DMatrix::from_element(3, 4, 1.0)).unwrap();
    let compounds = vec![
        Compound::new("C0", "HITRAN", Vec::new()),
        Compound::new("C1", "HITRAN", Vec::new()),
    ];
    let active = ActiveCompounds::all(Arc::new(CompoundRegistry::new(compounds).unwrap()));
    let err = select_species(&reference, &observations, &active, &options()).unwrap_err();
    assert!(matches!(err, SelectionError::TooFewSpectralPoints { points: 4, folds: 5 }));
}

#[derive(Default)]
struct Collect {
    timesteps: Vec<usize>,
    finished: bool,
}

impl Reporter for Collect {
    fn on_timestep(&mut self, report: &TimestepReport) {
        self.timesteps.push(report.timestep);
    }

    fn on_finish(&mut self) {
        self.finished = true;
    }
}

#[test]
fn reporter_sees_every_sampled_timestep() {
    let reference = reference();
    let r = reference.as_matrix();
    let observations =
        Observations::new(DMatrix::from_fn(NT, NL, |_, l| r[(0, l)] + r[(1, l)])).unwrap();
    let mut collect = Collect::default();
    let selection = select_species_with_reporter(
        &reference,
        &observations,
        &active(&reference),
        &options(),
        Some(&mut collect),
    )
    .unwrap();
    assert!(collect.finished);
    assert_eq!(collect.timesteps, selection.evaluation.timesteps);
}
