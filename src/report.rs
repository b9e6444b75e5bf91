use std::time::Duration;

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Converged,
    MaxIterations,
    TimeBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMethod {
    /// Sparse QR of the augmented least-squares system.
    DirectQr,
    /// Conjugate gradient on the normal equations.
    Preconditioned { preconditioner: &'static str },
}

#[derive(Debug, Clone)]
pub struct SolveStats {
    pub method: SolveMethod,
    pub status: SolveStatus,
    pub iterations: usize,
    /// ||C x - Aᵀy|| / ||Aᵀy||, zero when the right-hand side vanishes.
    pub relative_residual: f64,
    pub elapsed: Duration,
}

/// Cross-validated mean absolute error of one sampled timestep.
#[derive(Debug, Clone)]
pub struct CrossValidationScore {
    pub mean: f64,
    /// Population standard deviation across folds.
    pub std: f64,
    pub folds: Vec<f64>,
}

/// Per-timestep summary emitted while the selector runs.
#[derive(Debug, Clone)]
pub struct TimestepReport {
    pub timestep: usize,
    pub alpha: f64,
    pub nonzero: usize,
    pub cv_mean: f64,
    pub cv_std: f64,
    pub r2: f64,
    pub rmse: f64,
}

/// What the Lasso stage measured on its sampled timesteps.
#[derive(Debug, Clone, Default)]
pub struct SelectionEvaluation {
    pub timesteps: Vec<usize>,
    pub cross_validation: Vec<CrossValidationScore>,
    pub r2: Vec<f64>,
    pub rmse: Vec<f64>,
    /// Penalty strength picked by internal cross-validation, per timestep.
    pub alphas: Vec<f64>,
    /// Nonzero coefficients in each sampled fit.
    pub nonzero: Vec<usize>,
    /// Sum of sampled coefficients per candidate species, in input order.
    pub coefficient_sums: Vec<f64>,
}

impl SelectionEvaluation {
    pub fn timestep_reports(&self) -> impl Iterator<Item = TimestepReport> + '_ {
        (0..self.timesteps.len()).map(move |i| TimestepReport {
            timestep: self.timesteps[i],
            alpha: self.alphas[i],
            nonzero: self.nonzero[i],
            cv_mean: self.cross_validation[i].mean,
            cv_std: self.cross_validation[i].std,
            r2: self.r2[i],
            rmse: self.rmse[i],
        })
    }
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub(crate) fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

pub trait Reporter {
    fn on_timestep(&mut self, report: &TimestepReport);
    fn on_finish(&mut self) {}
}

pub struct StdoutReporter {
    rows: Vec<TimestepReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_timestep(&mut self, report: &TimestepReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("timestep").set_alignment(CellAlignment::Right),
            Cell::new("alpha").set_alignment(CellAlignment::Right),
            Cell::new("nonzero").set_alignment(CellAlignment::Right),
            Cell::new("cv mae").set_alignment(CellAlignment::Right),
            Cell::new("cv std").set_alignment(CellAlignment::Right),
            Cell::new("r2").set_alignment(CellAlignment::Right),
            Cell::new("rmse").set_alignment(CellAlignment::Right),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.timestep).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.alpha)).set_alignment(CellAlignment::Right),
                Cell::new(row.nonzero).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.cv_mean)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.cv_std)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4}", row.r2)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.rmse)).set_alignment(CellAlignment::Right),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_pick_a_readable_unit() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500 s");
        assert_eq!(format_duration(Duration::from_micros(2500)), "2.500 ms");
        assert_eq!(format_duration(Duration::from_nanos(40)), "40 ns");
    }

    #[test]
    fn stdout_reporter_drains_rows() {
        let mut reporter = StdoutReporter::new();
        reporter.on_timestep(&TimestepReport {
            timestep: 3,
            alpha: 1e-3,
            nonzero: 1,
            cv_mean: 0.1,
            cv_std: 0.01,
            r2: 0.99,
            rmse: 0.05,
        });
        assert_eq!(reporter.rows.len(), 1);
        reporter.on_finish();
        assert!(reporter.rows.is_empty());
    }
}
