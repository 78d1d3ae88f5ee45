//! Dense convex quadratic programs
//!
//! ```text
//! minimize   ½ xᵀ H x + gᵀ x
//! subject to lbx ≤ x ≤ ubx,  lba ≤ A x ≤ uba
//! ```
//!
//! Multipliers follow the convention `H x + g + λ_x + Aᵀ λ_a = 0`: positive on an active
//! upper bound, negative on an active lower bound.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};

pub struct QpProblem<'a> {
    pub h: &'a DMatrix<f64>,
    pub g: &'a DVector<f64>,
    pub a: &'a DMatrix<f64>,
    pub lbx: &'a [f64],
    pub ubx: &'a [f64],
    pub lba: &'a [f64],
    pub uba: &'a [f64],
}

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub primal: DVector<f64>,
    pub lambda_x: DVector<f64>,
    pub lambda_a: DVector<f64>,
}

/// The QP step of the solve loop. Any convex QP solver can stand behind it.
pub trait QpSolver {
    fn solve(&mut self, problem: &QpProblem) -> Result<QpSolution>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QpSettings {
    pub max_working_set_iterations: usize,
    pub feasibility_tolerance: f64,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            max_working_set_iterations: 50,
            feasibility_tolerance: 1e-9,
        }
    }
}

/// Active-set solver on the full KKT matrix, factorized by LU at every working-set change.
#[derive(Debug, Clone, Default)]
pub struct DenseQpSolver {
    settings: QpSettings,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Row {
    Bound(usize),
    Linear(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Side {
    Lower,
    Upper,
    Fixed,
}

#[derive(Debug, Clone, Copy)]
struct Active {
    row: Row,
    side: Side,
}

impl DenseQpSolver {
    pub fn new(settings: QpSettings) -> Self {
        Self { settings }
    }

    fn check(problem: &QpProblem) -> Result<(usize, usize)> {
        let n = problem.h.nrows();
        let m = problem.a.nrows();
        if problem.h.ncols() != n || problem.g.len() != n {
            return Err(Error::InvalidArgument(format!(
                "QP Hessian is {}x{} with a gradient of length {}",
                n,
                problem.h.ncols(),
                problem.g.len()
            )));
        }
        if (m > 0 && problem.a.ncols() != n)
            || problem.lbx.len() != n
            || problem.ubx.len() != n
            || problem.lba.len() != m
            || problem.uba.len() != m
        {
            return Err(Error::InvalidArgument(
                "QP constraint dimensions do not match the Hessian".into(),
            ));
        }
        let crossed = problem
            .lbx
            .iter()
            .zip(problem.ubx)
            .chain(problem.lba.iter().zip(problem.uba))
            .position(|(lb, ub)| lb > ub);
        if let Some(k) = crossed {
            return Err(Error::SolverFailure(format!(
                "QP is infeasible: lower bound above upper bound in row {k}"
            )));
        }
        Ok((n, m))
    }

    fn row_value(problem: &QpProblem, row: Row, x: &DVector<f64>) -> f64 {
        match row {
            Row::Bound(i) => x[i],
            Row::Linear(j) => problem.a.row(j).dot(&x.transpose()),
        }
    }

    fn bounds(problem: &QpProblem, row: Row) -> (f64, f64) {
        match row {
            Row::Bound(i) => (problem.lbx[i], problem.ubx[i]),
            Row::Linear(j) => (problem.lba[j], problem.uba[j]),
        }
    }

    fn solve_kkt(
        problem: &QpProblem,
        working: &[Active],
        n: usize,
    ) -> Result<(DVector<f64>, DVector<f64>)> {
        let k = working.len();
        let mut kkt = DMatrix::zeros(n + k, n + k);
        let mut rhs = DVector::zeros(n + k);
        kkt.view_mut((0, 0), (n, n)).copy_from(problem.h);
        for i in 0..n {
            rhs[i] = -problem.g[i];
        }
        for (r, active) in working.iter().enumerate() {
            let (lb, ub) = Self::bounds(problem, active.row);
            match active.row {
                Row::Bound(i) => {
                    kkt[(n + r, i)] = 1.0;
                    kkt[(i, n + r)] = 1.0;
                }
                Row::Linear(j) => {
                    for i in 0..n {
                        kkt[(n + r, i)] = problem.a[(j, i)];
                        kkt[(i, n + r)] = problem.a[(j, i)];
                    }
                }
            }
            rhs[n + r] = match active.side {
                Side::Lower | Side::Fixed => lb,
                Side::Upper => ub,
            };
        }
        let sol = kkt.lu().solve(&rhs).ok_or_else(|| {
            Error::SolverFailure(format!(
                "singular KKT matrix with {k} active constraints"
            ))
        })?;
        // H x + Cᵀμ = -g: μ already follows the multiplier sign convention.
        let x = sol.rows(0, n).into_owned();
        let mu = sol.rows(n, k).into_owned();
        Ok((x, mu))
    }
}

impl QpSolver for DenseQpSolver {
    fn solve(&mut self, problem: &QpProblem) -> Result<QpSolution> {
        let (n, m) = Self::check(problem)?;
        let tol = self.settings.feasibility_tolerance;

        let rows = (0..n).map(Row::Bound).chain((0..m).map(Row::Linear));
        let mut working: Vec<Active> = rows
            .filter(|&row| {
                let (lb, ub) = Self::bounds(problem, row);
                lb == ub
            })
            .map(|row| Active {
                row,
                side: Side::Fixed,
            })
            .collect();

        for iteration in 0..self.settings.max_working_set_iterations {
            let (x, mu) = Self::solve_kkt(problem, &working, n)?;

            // Most violated inactive constraint.
            let mut worst: Option<(f64, Active)> = None;
            for row in (0..n).map(Row::Bound).chain((0..m).map(Row::Linear)) {
                if working.iter().any(|a| a.row == row) {
                    continue;
                }
                let value = Self::row_value(problem, row, &x);
                let (lb, ub) = Self::bounds(problem, row);
                let candidate = if value < lb - tol {
                    Some((lb - value, Side::Lower))
                } else if value > ub + tol {
                    Some((value - ub, Side::Upper))
                } else {
                    None
                };
                if let Some((violation, side)) = candidate {
                    if worst.map_or(true, |(w, _)| violation > w) {
                        worst = Some((violation, Active { row, side }));
                    }
                }
            }
            if let Some((violation, active)) = worst {
                trace!(iteration, row = ?active.row, violation, "adding constraint to working set");
                working.push(active);
                continue;
            }

            // Multiplier with the wrong sign for its side.
            let wrong = working
                .iter()
                .zip(mu.iter())
                .enumerate()
                .filter_map(|(k, (active, &lam))| match active.side {
                    Side::Lower if lam > tol => Some((k, lam)),
                    Side::Upper if lam < -tol => Some((k, -lam)),
                    _ => None,
                })
                .max_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((k, _)) = wrong {
                trace!(iteration, row = ?working[k].row, "dropping constraint from working set");
                working.remove(k);
                continue;
            }

            let mut lambda_x = DVector::zeros(n);
            let mut lambda_a = DVector::zeros(m);
            for (active, lam) in working.iter().zip(mu.iter()) {
                match active.row {
                    Row::Bound(i) => lambda_x[i] = *lam,
                    Row::Linear(j) => lambda_a[j] = *lam,
                }
            }
            return Ok(QpSolution {
                primal: x,
                lambda_x,
                lambda_a,
            });
        }
        Err(Error::SolverFailure(format!(
            "QP working set did not settle in {} iterations",
            self.settings.max_working_set_iterations
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        let text = err.to_string();
        assert!(text.contains(needle), "'{text}' does not contain '{needle}'");
    }

    struct Owned {
        h: DMatrix<f64>,
        g: DVector<f64>,
        a: DMatrix<f64>,
        lbx: Vec<f64>,
        ubx: Vec<f64>,
        lba: Vec<f64>,
        uba: Vec<f64>,
    }

    impl Owned {
        fn unconstrained(h: DMatrix<f64>, g: DVector<f64>) -> Self {
            let n = g.len();
            Self {
                h,
                g,
                a: DMatrix::zeros(0, n),
                lbx: vec![f64::NEG_INFINITY; n],
                ubx: vec![f64::INFINITY; n],
                lba: Vec::new(),
                uba: Vec::new(),
            }
        }

        fn solve(&self) -> Result<QpSolution> {
            DenseQpSolver::default().solve(&QpProblem {
                h: &self.h,
                g: &self.g,
                a: &self.a,
                lbx: &self.lbx,
                ubx: &self.ubx,
                lba: &self.lba,
                uba: &self.uba,
            })
        }
    }

    #[test]
    fn unconstrained_minimum() {
        let qp = Owned::unconstrained(
            DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]),
            DVector::from_column_slice(&[-2.0, 8.0]),
        );
        let sol = qp.solve().unwrap();
        assert!((sol.primal[0] - 1.0).abs() < 1e-14);
        assert!((sol.primal[1] + 2.0).abs() < 1e-14);
        assert_eq!(sol.lambda_x.amax(), 0.0);
    }

    #[test]
    fn active_bound_carries_a_multiplier() {
        let mut qp = Owned::unconstrained(
            DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]),
            DVector::from_column_slice(&[-2.0, 8.0]),
        );
        qp.lbx[1] = -1.0;
        qp.ubx[0] = 0.5;
        let sol = qp.solve().unwrap();
        assert!((sol.primal[0] - 0.5).abs() < 1e-14);
        assert!((sol.primal[1] + 1.0).abs() < 1e-14);
        // Stationarity: H x + g + λ = 0.
        assert!((sol.lambda_x[0] - 1.0).abs() < 1e-12);
        assert!((sol.lambda_x[1] + 4.0).abs() < 1e-12);
    }

    #[test]
    fn linear_constraint_and_release() {
        // min ½|x|² - x0 - x1  s.t.  x0 + x1 <= 1, x0 - x1 >= -10
        let mut qp = Owned::unconstrained(
            DMatrix::identity(2, 2),
            DVector::from_column_slice(&[-1.0, -1.0]),
        );
        qp.a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, -1.0]);
        qp.lba = vec![f64::NEG_INFINITY, -10.0];
        qp.uba = vec![1.0, f64::INFINITY];
        let sol = qp.solve().unwrap();
        assert!((sol.primal[0] - 0.5).abs() < 1e-14);
        assert!((sol.primal[1] - 0.5).abs() < 1e-14);
        assert!((sol.lambda_a[0] - 0.5).abs() < 1e-12);
        assert_eq!(sol.lambda_a[1], 0.0);
    }

    #[test]
    fn equality_rows_are_fixed_from_the_start() {
        let mut qp = Owned::unconstrained(
            DMatrix::identity(2, 2),
            DVector::from_column_slice(&[0.0, 0.0]),
        );
        qp.a = DMatrix::from_row_slice(1, 2, &[1.0, 2.0]);
        qp.lba = vec![5.0];
        qp.uba = vec![5.0];
        let sol = qp.solve().unwrap();
        assert!((sol.primal[0] - 1.0).abs() < 1e-12);
        assert!((sol.primal[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn failures_are_reported() {
        let mut crossed = Owned::unconstrained(DMatrix::identity(1, 1), DVector::zeros(1));
        crossed.lbx[0] = 1.0;
        crossed.ubx[0] = 0.0;
        assert_err_contains(crossed.solve(), "infeasible");

        let singular = Owned::unconstrained(DMatrix::zeros(2, 2), DVector::from_element(2, 1.0));
        assert_err_contains(singular.solve(), "singular KKT");
    }
}
