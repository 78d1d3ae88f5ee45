//! Drag/depth estimation from simulated height measurements.

use std::fmt;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use symgraph_core::lifter::MarkedLifting;
use symgraph_core::{
    solve, Bounds, DenseQpSolver, Expr, Function, FunctionOptions, LiftedProblem, Lifter,
    LifterSettings, SolveSettings,
};
use tracing::{info, warn};

use crate::model::ShallowWaterModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transcription {
    /// Heights are functions of the parameters only.
    SingleShooting,
    /// Heights at every measurement are decision variables tied by defect constraints.
    MultipleShooting,
    /// Single-shooting graph with `lift` markers on the heights.
    Marked,
}

impl fmt::Display for Transcription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transcription::SingleShooting => "ss",
            Transcription::MultipleShooting => "ms",
            Transcription::Marked => "lift",
        };
        f.write_str(name)
    }
}

/// A lifted estimation problem with its measurements.
pub struct Estimator {
    transcription: Transcription,
    problem: LiftedProblem,
    /// Maps a parameter guess to the initial lifted variables.
    initial: Option<Function>,
    measurements: Vec<Vec<f64>>,
    settings: SolveSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Estimate {
    pub drag: f64,
    pub depth: f64,
    pub iterations: usize,
    pub converged: bool,
    pub seconds: f64,
}

impl Estimator {
    pub fn new(
        model: &ShallowWaterModel,
        measurements: Vec<Vec<f64>>,
        transcription: Transcription,
        settings: SolveSettings,
    ) -> Result<Self> {
        let n = model.config.n_boxes;
        let n_heights = n * n;
        let multiple = transcription == Transcription::MultipleShooting;
        let p = Expr::symbol("u", 2, 1);
        let v = Expr::symbol("v", if multiple { n_heights * measurements.len() } else { 0 }, 1);

        let mut u_k = Expr::from_dmatrix(&model.u0);
        let mut v_k = Expr::from_dmatrix(&model.v0);
        let mut h_k = Expr::from_dmatrix(&model.h0);
        let mut residuals = Vec::with_capacity(measurements.len());
        let mut defects = Vec::new();
        for (k, measured) in measurements.iter().enumerate() {
            let mut out = model
                .interval
                .call(&[p.clone(), u_k, v_k, h_k])?
                .into_iter();
            let (Some(u), Some(v_next), Some(h)) = (out.next(), out.next(), out.next()) else {
                anyhow::bail!("interval function must return (u, v, h)");
            };
            u_k = u;
            v_k = v_next;
            h_k = match transcription {
                Transcription::SingleShooting => h,
                Transcription::Marked => h.lift(),
                Transcription::MultipleShooting => {
                    let lifted = v
                        .slice_rows(k * n_heights..(k + 1) * n_heights)?
                        .reshape(n, n)?;
                    defects.push(h.sub(&lifted)?.vec());
                    lifted
                }
            };
            let target = Expr::matrix(n, n, measured.clone())?;
            residuals.push(h_k.sub(&target)?.vec());
        }
        let f1 = Expr::vertcat(&residuals)?;
        let g = Expr::vertcat(&defects)?;

        let lifter = Lifter::new(LifterSettings::default());
        let (problem, initial) = match transcription {
            Transcription::Marked => {
                let MarkedLifting { problem, initial } = lifter.from_marked(&p, &f1, &g)?;
                (problem, Some(initial))
            }
            _ => {
                let fg = Function::with_options(
                    vec![p.into(), v.into()],
                    vec![f1.into(), g.into()],
                    FunctionOptions::named("fg"),
                )?;
                info!(%transcription, nodes = fg.count_nodes(), "generated NLP");
                (lifter.lift(&fg).context("lifting the NLP")?, None)
            }
        };
        Ok(Self {
            transcription,
            problem,
            initial,
            measurements,
            settings,
        })
    }

    pub fn transcription(&self) -> Transcription {
        self.transcription
    }

    pub fn problem(&self) -> &LiftedProblem {
        &self.problem
    }

    fn initial_v(&mut self, guess: [f64; 2]) -> Result<Vec<f64>> {
        match (&mut self.initial, self.transcription) {
            (Some(initial), _) => Ok(initial.eval(&[&guess])?.swap_remove(0)),
            // The measured heights are the natural guess for the lifted heights.
            (None, Transcription::MultipleShooting) => Ok(self.measurements.concat()),
            (None, _) => Ok(Vec::new()),
        }
    }

    /// Runs the solve loop from `[drag, depth]` with both parameters kept nonnegative.
    pub fn estimate(&mut self, guess: [f64; 2]) -> Result<Estimate> {
        let v0 = self.initial_v(guess)?;
        let mut bounds = Bounds::for_problem(&self.problem);
        bounds.lbu = vec![0.0, 0.0];
        let started = Instant::now();
        let report = solve(
            &mut self.problem,
            &mut DenseQpSolver::default(),
            &guess,
            &v0,
            &bounds,
            &self.settings,
        )
        .with_context(|| format!("{} solve from {guess:?}", self.transcription))?;
        let seconds = started.elapsed().as_secs_f64();
        if !report.converged() {
            warn!(transcription = %self.transcription, ?guess, "estimation did not converge");
        }
        Ok(Estimate {
            drag: report.u[0],
            depth: report.u[1],
            iterations: report.iterations,
            converged: report.converged(),
            seconds,
        })
    }
}

/// One row of the batch table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRow {
    pub guess: [f64; 2],
    /// Per transcription: the estimate, or the error text of a failed case.
    pub results: Vec<(Transcription, Result<Estimate, String>)>,
}

/// Initial guesses of the benchmark table.
pub const GUESSES: [[f64; 2]; 12] = [
    [0.5, 0.01],
    [5.0, 0.01],
    [15.0, 0.01],
    [30.0, 0.01],
    [2.0, 0.005],
    [2.0, 0.02],
    [2.0, 0.1],
    [0.2, 0.001],
    [1.0, 0.005],
    [4.0, 0.02],
    [1.0, 0.02],
    [20.0, 0.001],
];

/// Runs every guess through every estimator. A failing case is recorded in its row and
/// the batch continues.
pub fn run_batch(estimators: &mut [Estimator], guesses: &[[f64; 2]]) -> Vec<BatchRow> {
    guesses
        .iter()
        .enumerate()
        .map(|(test, &guess)| {
            info!(test, ?guess, "running test case");
            let results = estimators
                .iter_mut()
                .map(|est| {
                    let outcome = est.estimate(guess).map_err(|err| {
                        warn!(test, transcription = %est.transcription(), "test failed: {err:#}");
                        format!("{err:#}")
                    });
                    (est.transcription(), outcome)
                })
                .collect();
            BatchRow { guess, results }
        })
        .collect()
}

/// Formats the batch as a text table. Cases that did not land within `tol` of `truth`
/// show `inf` for iterations and time.
pub fn format_table(rows: &[BatchRow], truth: [f64; 2], tol: f64) -> String {
    let mut out = String::new();
    let Some(first) = rows.first() else {
        return out;
    };
    out.push_str(&format!("{:>10}{:>10}", "drag", "depth"));
    for (transcription, _) in &first.results {
        out.push_str(&format!(
            "{:>10}{:>10}{:>12}{:>12}",
            format!("iter_{transcription}"),
            format!("time_{transcription}"),
            format!("edrag_{transcription}"),
            format!("edepth_{transcription}")
        ));
    }
    out.push('\n');
    for row in rows {
        out.push_str(&format!("{:>10}{:>10}", row.guess[0], row.guess[1]));
        for (_, result) in &row.results {
            match result {
                Ok(est)
                    if (est.drag - truth[0]).abs() + (est.depth - truth[1]).abs() < tol =>
                {
                    out.push_str(&format!(
                        "{:>10}{:>10.3}{:>12.6}{:>12.6}",
                        est.iterations, est.seconds, est.drag, est.depth
                    ));
                }
                Ok(est) => out.push_str(&format!(
                    "{:>10}{:>10}{:>12.6}{:>12.6}",
                    "inf", "inf", est.drag, est.depth
                )),
                Err(_) => out.push_str(&format!(
                    "{:>10}{:>10}{:>12}{:>12}",
                    "inf", "inf", "failed", "failed"
                )),
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(drag: f64, result: Result<Estimate, String>) -> BatchRow {
        BatchRow {
            guess: [drag, 0.01],
            results: vec![(Transcription::SingleShooting, result)],
        }
    }

    #[test]
    fn table_marks_misses_and_failures() {
        let hit = Estimate {
            drag: 2.0,
            depth: 0.01,
            iterations: 7,
            converged: true,
            seconds: 0.5,
        };
        let miss = Estimate {
            drag: 3.0,
            ..hit.clone()
        };
        let rows = [
            row(0.5, Ok(hit)),
            row(5.0, Ok(miss)),
            row(15.0, Err("solver failure".into())),
        ];
        let table = format_table(&rows, [2.0, 0.01], 1e-3);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("iter_ss"));
        assert!(lines[1].contains('7') && !lines[1].contains("inf"));
        assert!(lines[2].contains("inf") && lines[2].contains("3.000000"));
        assert!(lines[3].contains("failed"));
    }

    #[test]
    fn empty_batch_formats_to_nothing() {
        assert!(format_table(&[], [2.0, 0.01], 1e-3).is_empty());
    }
}
