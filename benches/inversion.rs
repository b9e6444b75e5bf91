use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use faer_core::Parallelism;
use nalgebra::DMatrix;
use spectral_inversion_rs::{
    posterior_variance, solve_system, DesignMatrix, IterativeOptions, Observations,
    ReferenceSpectra, RegularizedSystem, SmootherKind, SolvePath, VarianceMode,
};

// Overlapping Gaussian bands, smooth abundances, deterministic ripple.
fn problem(ns: usize, nl: usize, nt: usize) -> (ReferenceSpectra, Observations) {
    let reference = DMatrix::from_fn(ns, nl, |s, l| {
        let centre = (s as f64 + 0.5) * nl as f64 / ns as f64;
        let width = nl as f64 / ns as f64;
        let d = (l as f64 - centre) / width;
        let v = (-d * d).exp();
        if v < 1e-6 {
            0.0
        } else {
            v
        }
    });
    let observations = DMatrix::from_fn(nt, nl, |t, l| {
        let mut y = 0.0;
        for s in 0..ns {
            let x = 1.0 + (0.1 * (t + s) as f64).sin();
            y += x * reference[(s, l)];
        }
        y + 1e-3 * ((t * 13 + l * 7) % 17) as f64
    });
    let ids = (0..ns).map(|s| format!("S{s}")).collect();
    (
        ReferenceSpectra::new(ids, reference).unwrap(),
        Observations::new(observations).unwrap(),
    )
}

fn bench_design_build(c: &mut Criterion) {
    let (reference, _) = problem(20, 400, 100);
    c.bench_function("design_build_20x400x100", |b| {
        b.iter(|| {
            let design = DesignMatrix::build(black_box(&reference), 100).unwrap();
            black_box(design.matrix().nnz());
        });
    });
}

fn bench_assemble(c: &mut Criterion) {
    let (reference, observations) = problem(20, 400, 100);
    c.bench_function("assemble_20x400x100", |b| {
        b.iter(|| {
            let system = RegularizedSystem::assemble(
                black_box(&reference),
                &observations,
                1e-2,
                SmootherKind::FirstDifference,
            )
            .unwrap();
            black_box(system.dim());
        });
    });
}

fn bench_direct_solve(c: &mut Criterion) {
    let (reference, observations) = problem(20, 400, 100);
    let system =
        RegularizedSystem::assemble(&reference, &observations, 1e-2, SmootherKind::FirstDifference)
            .unwrap();
    c.bench_function("direct_qr_2000", |b| {
        b.iter(|| {
            let (x, _) = solve_system(&system, &SolvePath::Direct, Parallelism::None).unwrap();
            black_box(&x);
        });
    });
}

fn bench_preconditioned_solve(c: &mut Criterion) {
    let (reference, observations) = problem(20, 400, 100);
    let system =
        RegularizedSystem::assemble(&reference, &observations, 1e-2, SmootherKind::FirstDifference)
            .unwrap();
    let path = SolvePath::Preconditioned(IterativeOptions::default());
    c.bench_function("ic0_cg_2000", |b| {
        b.iter(|| {
            let (x, _) = solve_system(&system, &path, Parallelism::None).unwrap();
            black_box(&x);
        });
    });
}

fn bench_variance(c: &mut Criterion) {
    let (reference, observations) = problem(10, 200, 60);
    let system =
        RegularizedSystem::assemble(&reference, &observations, 1e-2, SmootherKind::FirstDifference)
            .unwrap();
    let iterative = IterativeOptions::default();
    c.bench_function("variance_exact_600", |b| {
        b.iter(|| {
            let v = posterior_variance(&system, &VarianceMode::Exact, &iterative).unwrap();
            black_box(&v.diagonal);
        });
    });
    let probing = VarianceMode::Probing {
        probes: 32,
        seed: 1,
    };
    c.bench_function("variance_probing_600", |b| {
        b.iter(|| {
            let v = posterior_variance(&system, &probing, &iterative).unwrap();
            black_box(&v.diagonal);
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .sample_size(10)
        .warm_up_time(Duration::from_millis(500))
        .measurement_time(Duration::from_millis(1000));
    targets =
        bench_design_build,
        bench_assemble,
        bench_direct_solve,
        bench_preconditioned_solve,
        bench_variance
}
criterion_main!(benches);
