//! Full-step sequential solve loop over a lifted problem.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lifter::{expansion, linearization, residual, LiftedProblem};
use crate::qp::{QpProblem, QpSolver};
use crate::shape::Shape;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveSettings {
    pub max_iterations: usize,
    /// Stop once `‖violation‖ + ‖step‖` drops below this.
    pub tolerance: f64,
    /// Lift the smallest eigenvalue of a 2x2 Hessian to `regularization_threshold`.
    pub regularization: bool,
    pub regularization_threshold: f64,
    pub symmetry_tolerance: f64,
}

impl Default for SolveSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-9,
            regularization: true,
            regularization_threshold: 1e-8,
            symmetry_tolerance: 1e-10,
        }
    }
}

impl SolveSettings {
    fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidArgument(
                "max_iterations must be greater than zero".into(),
            ));
        }
        if self.tolerance <= 0.0 {
            return Err(Error::InvalidArgument("tolerance must be positive".into()));
        }
        Ok(())
    }
}

/// Simple bounds on `u` and `v` and constraint bounds on all of `g`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lbu: Vec<f64>,
    pub ubu: Vec<f64>,
    pub lbv: Vec<f64>,
    pub ubv: Vec<f64>,
    pub lbg: Vec<f64>,
    pub ubg: Vec<f64>,
}

impl Bounds {
    /// Free variables and `g = 0`.
    pub fn for_problem(problem: &LiftedProblem) -> Self {
        let ng = problem.nv() + problem.nf2();
        Self {
            lbu: vec![f64::NEG_INFINITY; problem.nu()],
            ubu: vec![f64::INFINITY; problem.nu()],
            lbv: vec![f64::NEG_INFINITY; problem.nv()],
            ubv: vec![f64::INFINITY; problem.nv()],
            lbg: vec![0.0; ng],
            ubg: vec![0.0; ng],
        }
    }

    fn check(&self, problem: &LiftedProblem) -> Result<()> {
        let ng = problem.nv() + problem.nf2();
        let expected = [
            ("lbu", self.lbu.len(), problem.nu()),
            ("ubu", self.ubu.len(), problem.nu()),
            ("lbv", self.lbv.len(), problem.nv()),
            ("ubv", self.ubv.len(), problem.nv()),
            ("lbg", self.lbg.len(), ng),
            ("ubg", self.ubg.len(), ng),
        ];
        for (name, got, want) in expected {
            if got != want {
                return Err(Error::InvalidArgument(format!(
                    "{name} has {got} entries, expected {want}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Converged,
    MaxIterations,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub objective: f64,
    pub norm_step: f64,
    pub norm_viol: f64,
    pub regularization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveReport {
    pub status: SolveStatus,
    /// Number of full steps taken.
    pub iterations: usize,
    /// Objective at the last evaluated iterate.
    pub objective: f64,
    pub u: Vec<f64>,
    pub v: Vec<f64>,
    pub lam_x: Vec<f64>,
    pub lam_g: Vec<f64>,
    pub history: Vec<IterationRecord>,
}

impl SolveReport {
    pub fn converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }
}

/// Makes a 2x2 Hessian block symmetric positive definite.
///
/// Returns the amount added to the diagonal, `threshold - λ_min` when the smallest
/// eigenvalue is below `threshold` and zero otherwise.
pub fn regularize_hessian_2x2(
    h: &mut DMatrix<f64>,
    threshold: f64,
    symmetry_tolerance: f64,
) -> Result<f64> {
    if h.shape() != (2, 2) {
        return Err(Error::shape(
            "regularize_hessian_2x2",
            Shape::new(2, 2),
            Shape::new(h.nrows(), h.ncols()),
        ));
    }
    let (a, b, c, d) = (h[(0, 0)], h[(0, 1)], h[(1, 0)], h[(1, 1)]);
    if [a, b, c, d].iter().any(|x| !x.is_finite()) {
        return Err(Error::Numeric(format!("NaN/Inf in Hessian block {a} {b} {c} {d}")));
    }
    if b != c {
        if (b - c).abs() >= symmetry_tolerance {
            return Err(Error::Numeric(format!("Hessian is not symmetric: {b} != {c}")));
        }
        h[(1, 0)] = b;
    }
    let eig_smallest = (a + d) / 2.0 - (4.0 * b * b + (a - d) * (a - d)).sqrt() / 2.0;
    if eig_smallest < threshold {
        let reg = threshold - eig_smallest;
        h[(0, 0)] += reg;
        h[(1, 1)] += reg;
        return Ok(reg);
    }
    Ok(0.0)
}

fn norm(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn violation<'a>(values: &'a [f64], lb: &'a [f64], ub: &'a [f64]) -> impl Iterator<Item = f64> + 'a {
    values
        .iter()
        .zip(lb.iter().zip(ub))
        .map(|(x, (l, u))| (x - u).max(0.0) + (l - x).max(0.0))
}

/// Runs the solve loop from `(u0, v0)`.
///
/// `v0` holds the lifted variables of the source; in exact-Hessian mode their multipliers
/// start at zero. Reaching the iteration budget is reported through the status, while
/// evaluation, regularization and QP failures are returned as errors.
pub fn solve<Q: QpSolver>(
    problem: &mut LiftedProblem,
    qp: &mut Q,
    u0: &[f64],
    v0: &[f64],
    bounds: &Bounds,
    settings: &SolveSettings,
) -> Result<SolveReport> {
    settings.validate()?;
    bounds.check(problem)?;
    let (nu, nv, nv_aug) = (problem.nu(), problem.nv(), problem.nv_aug());
    if u0.len() != nu || v0.len() != nv {
        return Err(Error::InvalidArgument(format!(
            "initial guess has {} + {} entries, expected {nu} + {nv}",
            u0.len(),
            v0.len()
        )));
    }

    let mut u = u0.to_vec();
    let mut v = v0.to_vec();
    v.resize(nv_aug, 0.0);
    let mut lam_x = vec![0.0; problem.n_lam_x()];
    let mut lam_g = vec![0.0; problem.n_lam_g()];
    let mut history = Vec::new();
    let mut objective = f64::NAN;
    let mut status = SolveStatus::MaxIterations;

    for k in 0..settings.max_iterations {
        let rfcn = &mut problem.rfcn;
        rfcn.set_input(residual::U, &u)?;
        rfcn.set_input(residual::V, &v)?;
        rfcn.set_input(residual::LAM_X, &lam_x)?;
        rfcn.set_input(residual::LAM_G, &lam_g)?;
        rfcn.evaluate()?;
        let d = rfcn.output(residual::D)?.to_vec();
        let g = rfcn.output(residual::G)?.to_vec();
        objective = rfcn.output_scalar(residual::F)?;

        let lfcn = &mut problem.lfcn;
        lfcn.set_input(linearization::U, &u)?;
        lfcn.set_input(linearization::V, &v)?;
        lfcn.set_input(linearization::LAM_X, &lam_x)?;
        lfcn.set_input(linearization::LAM_G, &lam_g)?;
        lfcn.set_input(linearization::D, &d)?;
        lfcn.evaluate()?;
        let mut hess = lfcn.output_matrix(linearization::J1)?;
        let grad = DVector::from_column_slice(lfcn.output(linearization::B1)?);
        let jac = lfcn.output_matrix(linearization::J2)?;
        let b2 = lfcn.output(linearization::B2)?.to_vec();

        let mut reg = 0.0;
        if settings.regularization && nu == 2 {
            reg = regularize_hessian_2x2(
                &mut hess,
                settings.regularization_threshold,
                settings.symmetry_tolerance,
            )?;
            if reg > 0.0 {
                warn!(iteration = k, reg, "regularizing Hessian to keep it positive definite");
            }
        }

        let lbx: Vec<f64> = bounds.lbu.iter().zip(&u).map(|(b, x)| b - x).collect();
        let ubx: Vec<f64> = bounds.ubu.iter().zip(&u).map(|(b, x)| b - x).collect();
        let lba: Vec<f64> = bounds.lbg[nv..].iter().zip(&b2).map(|(b, r)| b - r).collect();
        let uba: Vec<f64> = bounds.ubg[nv..].iter().zip(&b2).map(|(b, r)| b - r).collect();
        let step = qp.solve(&QpProblem {
            h: &hess,
            g: &grad,
            a: &jac,
            lbx: &lbx,
            ubx: &ubx,
            lba: &lba,
            uba: &uba,
        })?;
        let du = step.primal.as_slice();
        let dlam_f2 = if problem.gauss_newton() {
            Vec::new()
        } else {
            step.lambda_a.as_slice().to_vec()
        };

        let efcn = &mut problem.efcn;
        efcn.set_input(expansion::U, &u)?;
        efcn.set_input(expansion::V, &v)?;
        efcn.set_input(expansion::LAM_X, &lam_x)?;
        efcn.set_input(expansion::LAM_G, &lam_g)?;
        efcn.set_input(expansion::D, &d)?;
        efcn.set_input(expansion::DU, du)?;
        efcn.set_input(expansion::DLAM_F2, &dlam_f2)?;
        efcn.evaluate()?;
        let dv = efcn.output(expansion::E)?.to_vec();

        for (x, dx) in u.iter_mut().zip(du) {
            *x += dx;
        }
        for (x, dx) in v.iter_mut().zip(&dv) {
            *x += dx;
        }
        let mut norm_step = norm(du.iter().chain(&dv[..nv.min(dv.len())]).copied());
        if !problem.gauss_newton() {
            for (x, dx) in lam_x.iter_mut().zip(step.lambda_x.iter()) {
                *x += dx;
            }
            for (x, dx) in lam_g.iter_mut().zip(&dlam_f2) {
                *x += dx;
            }
            let dlam = dv[nv.min(dv.len())..].iter().chain(&dlam_f2).copied();
            norm_step = norm_step.hypot(norm(dlam));
        }

        let norm_viol = norm(
            violation(&u, &bounds.lbu, &bounds.ubu)
                .chain(violation(&v[..nv], &bounds.lbv, &bounds.ubv))
                .chain(violation(&g, &bounds.lbg, &bounds.ubg)),
        );

        info!(iteration = k, objective, norm_step, norm_viol, reg, "outer iteration");
        history.push(IterationRecord {
            iteration: k,
            objective,
            norm_step,
            norm_viol,
            regularization: reg,
        });

        if norm_viol + norm_step < settings.tolerance {
            status = SolveStatus::Converged;
            break;
        }
    }

    match status {
        SolveStatus::Converged => info!(iterations = history.len(), objective, "converged"),
        SolveStatus::MaxIterations => warn!(
            max_iterations = settings.max_iterations,
            "maximum number of iterations reached"
        ),
    }
    debug!(?u, "final parameters");
    v.truncate(nv);
    Ok(SolveReport {
        status,
        iterations: history.len(),
        objective,
        u,
        v,
        lam_x,
        lam_g,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;
    use crate::lifter::{Lifter, LifterSettings};
    use crate::node::Expr;
    use crate::qp::DenseQpSolver;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected an error");
        let text = err.to_string();
        assert!(text.contains(needle), "'{text}' does not contain '{needle}'");
    }

    fn smallest_eig(h: &DMatrix<f64>) -> f64 {
        h.symmetric_eigenvalues().min()
    }

    #[test]
    fn regularization_lifts_smallest_eigenvalue_to_threshold() {
        let threshold = 1e-8;
        let mut h = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let eig = smallest_eig(&h);
        assert!((eig + 1.0).abs() < 1e-12);
        let reg = regularize_hessian_2x2(&mut h, threshold, 1e-10).unwrap();
        assert!((reg - (threshold - eig)).abs() < 1e-12);
        assert!(smallest_eig(&h) >= threshold - 1e-12);
    }

    #[test]
    fn positive_definite_block_is_untouched() {
        let mut h = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 3.0]);
        let before = h.clone();
        assert_eq!(regularize_hessian_2x2(&mut h, 1e-8, 1e-10).unwrap(), 0.0);
        assert_eq!(h, before);
    }

    #[test]
    fn regularization_rejects_non_finite_entries_and_asymmetry() {
        let mut nan = DMatrix::from_row_slice(2, 2, &[1.0, f64::NAN, f64::NAN, 1.0]);
        assert_err_contains(regularize_hessian_2x2(&mut nan, 1e-8, 1e-10), "NaN");

        let mut inf = DMatrix::from_row_slice(2, 2, &[f64::INFINITY, 0.0, 0.0, 1.0]);
        assert_err_contains(regularize_hessian_2x2(&mut inf, 1e-8, 1e-10), "Inf");
        assert_eq!(inf[(0, 0)], f64::INFINITY);

        let mut low = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, f64::NEG_INFINITY]);
        assert!(matches!(
            regularize_hessian_2x2(&mut low, 1e-8, 1e-10),
            Err(Error::Numeric(_))
        ));

        let mut skew = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1e-3, 1.0]);
        assert_err_contains(regularize_hessian_2x2(&mut skew, 1e-8, 1e-10), "not symmetric");

        let mut nearly = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 1e-12, 1.0]);
        regularize_hessian_2x2(&mut nearly, 1e-8, 1e-10).unwrap();
        assert_eq!(nearly[(1, 0)], nearly[(0, 1)]);

        let mut wrong = DMatrix::zeros(3, 3);
        assert!(regularize_hessian_2x2(&mut wrong, 1e-8, 1e-10).is_err());
    }

    /// Fits `u` so that the lifted chain `v0 = u0 u1`, `v1 = v0 + u1` hits targets.
    fn chain_problem() -> (Function, [f64; 2]) {
        let u = Expr::symbol("u", 2, 1);
        let v = Expr::symbol("v", 2, 1);
        let (u0, u1) = (u.get(0, 0).unwrap(), u.get(1, 0).unwrap());
        let (v0, v1) = (v.get(0, 0).unwrap(), v.get(1, 0).unwrap());
        let h0 = u0.mul(&u1).unwrap();
        let h1 = v0.add(&u1).unwrap();
        let f1 = Expr::vertcat(&[
            v0.sub(&Expr::constant(1.5)).unwrap(),
            v1.sub(&Expr::constant(2.5)).unwrap(),
        ])
        .unwrap();
        let g = Expr::vertcat(&[h0.sub(&v0).unwrap(), h1.sub(&v1).unwrap()]).unwrap();
        let fg = Function::new(vec![u.into(), v.into()], vec![f1.into(), g.into()]).unwrap();
        // u1 = 1, u0 = 1.5 gives a zero residual.
        (fg, [1.5, 1.0])
    }

    #[test]
    fn gauss_newton_converges_on_a_zero_residual_fit() {
        let (fg, expected) = chain_problem();
        let mut problem = Lifter::default().lift(&fg).unwrap();
        let bounds = Bounds::for_problem(&problem);
        let report = solve(
            &mut problem,
            &mut DenseQpSolver::default(),
            &[1.0, 0.8],
            &[0.0, 0.0],
            &bounds,
            &SolveSettings::default(),
        )
        .unwrap();
        assert!(report.converged(), "{:?}", report.history.last());
        assert!(report.iterations < 100);
        assert!((report.u[0] - expected[0]).abs() < 1e-8);
        assert!((report.u[1] - expected[1]).abs() < 1e-8);
        assert!((report.v[0] - 1.5).abs() < 1e-8);
        assert!((report.v[1] - 2.5).abs() < 1e-8);
        assert!(report.objective < 1e-16);
    }

    #[test]
    fn bounds_on_u_are_respected() {
        let (fg, _) = chain_problem();
        let mut problem = Lifter::default().lift(&fg).unwrap();
        let mut bounds = Bounds::for_problem(&problem);
        bounds.ubu[0] = 1.2;
        let report = solve(
            &mut problem,
            &mut DenseQpSolver::default(),
            &[1.0, 0.8],
            &[0.8, 1.6],
            &bounds,
            &SolveSettings::default(),
        )
        .unwrap();
        assert!(report.converged());
        assert!(report.u[0] <= 1.2 + 1e-10);
        assert!((report.u[0] - 1.2).abs() < 1e-8);
    }

    #[test]
    fn iteration_budget_is_reported_not_raised() {
        let (fg, _) = chain_problem();
        let mut problem = Lifter::default().lift(&fg).unwrap();
        let bounds = Bounds::for_problem(&problem);
        let settings = SolveSettings {
            max_iterations: 1,
            ..SolveSettings::default()
        };
        let report = solve(
            &mut problem,
            &mut DenseQpSolver::default(),
            &[1.0, 0.8],
            &[0.0, 0.0],
            &bounds,
            &settings,
        )
        .unwrap();
        assert_eq!(report.status, SolveStatus::MaxIterations);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn exact_hessian_mode_finds_constrained_minimum() {
        // min v² + (u0 - 1)² + (u1 - 2)²  with v = u0 - u1 and u0 + u1 = 4.
        let u = Expr::symbol("u", 2, 1);
        let v = Expr::scalar_symbol("v");
        let (u0, u1) = (u.get(0, 0).unwrap(), u.get(1, 0).unwrap());
        let obj = v
            .square()
            .add(&u0.sub(&Expr::constant(1.0)).unwrap().square())
            .unwrap()
            .add(&u1.sub(&Expr::constant(2.0)).unwrap().square())
            .unwrap();
        let g = Expr::vertcat(&[
            u0.sub(&u1).unwrap().sub(&v).unwrap(),
            u0.add(&u1).unwrap(),
        ])
        .unwrap();
        let fg = Function::new(vec![u.into(), v.into()], vec![obj.into(), g.into()]).unwrap();
        let lifter = Lifter::new(LifterSettings {
            gauss_newton: false,
            ..LifterSettings::default()
        });
        let mut problem = lifter.lift(&fg).unwrap();
        let mut bounds = Bounds::for_problem(&problem);
        bounds.lbg[1] = 4.0;
        bounds.ubg[1] = 4.0;
        let report = solve(
            &mut problem,
            &mut DenseQpSolver::default(),
            &[0.0, 0.0],
            &[0.0],
            &bounds,
            &SolveSettings::default(),
        )
        .unwrap();
        assert!(report.converged(), "{:?}", report.history);
        // Stationary point of the reduced problem in u0 with u1 = 4 - u0:
        // (2u0 - 4)² + (u0 - 1)² + (2 - u0)² → u0 = 11/6.
        assert!((report.u[0] - 11.0 / 6.0).abs() < 1e-8);
        assert!((report.u[1] - 13.0 / 6.0).abs() < 1e-8);
        assert!((report.v[0] + 1.0 / 3.0).abs() < 1e-8);
    }

    #[test]
    fn rejects_bad_inputs() {
        let (fg, _) = chain_problem();
        let mut problem = Lifter::default().lift(&fg).unwrap();
        let bounds = Bounds::for_problem(&problem);
        let mut qp = DenseQpSolver::default();
        assert_err_contains(
            solve(&mut problem, &mut qp, &[1.0], &[0.0, 0.0], &bounds, &SolveSettings::default()),
            "initial guess",
        );
        let mut short = bounds.clone();
        short.lbg.pop();
        assert_err_contains(
            solve(&mut problem, &mut qp, &[1.0, 1.0], &[0.0, 0.0], &short, &SolveSettings::default()),
            "lbg",
        );
    }
}
